//! # Transform Definition Types
//!
//! Tipi di base per le trasformazioni nominate: modalità, posizione di crop,
//! interlacciamento e la definizione persistita.
//!
//! ## Responsabilità:
//! - `Mode`, `Interlace`: enum serializzati in minuscolo come nel project config
//! - Parsing delle posizioni `verticale-orizzontale` usate come ancora del crop
//! - `TransformDefinition` con validazione dei campi
//! - `DefinitionConfig`: la forma serializzata scritta nel project config

use crate::error::{Result, TransformError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Formats a rendition can be written as
pub const OUTPUT_FORMATS: &[&str] = &["jpg", "png", "gif", "webp", "avif"];

/// Position used when the requested one is missing or invalid
pub const DEFAULT_POSITION: &str = "center-center";

/// Resize mode of a transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Crop,
    Fit,
    Stretch,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Crop => "crop",
            Mode::Fit => "fit",
            Mode::Stretch => "stretch",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crop" => Ok(Mode::Crop),
            "fit" => Ok(Mode::Fit),
            "stretch" => Ok(Mode::Stretch),
            other => Err(TransformError::IndexResolutionFailed(format!("unknown transform mode '{}'", other))),
        }
    }
}

/// Interlace setting applied to formats that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interlace {
    #[default]
    None,
    Line,
    Plane,
    Partition,
}

impl Interlace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interlace::None => "none",
            Interlace::Line => "line",
            Interlace::Plane => "plane",
            Interlace::Partition => "partition",
        }
    }
}

impl fmt::Display for Interlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interlace {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Interlace::None),
            "line" => Ok(Interlace::Line),
            "plane" => Ok(Interlace::Plane),
            "partition" => Ok(Interlace::Partition),
            other => Err(TransformError::IndexResolutionFailed(format!("unknown interlace mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vertical {
    Top,
    Center,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizontal {
    Left,
    Center,
    Right,
}

/// Parse a `vertical-horizontal` position token such as `top-left`
pub fn parse_position(position: &str) -> Option<(Vertical, Horizontal)> {
    let (v, h) = position.split_once('-')?;
    let vertical = match v {
        "top" => Vertical::Top,
        "center" => Vertical::Center,
        "bottom" => Vertical::Bottom,
        _ => return None,
    };
    let horizontal = match h {
        "left" => Horizontal::Left,
        "center" => Horizontal::Center,
        "right" => Horizontal::Right,
        _ => return None,
    };
    Some((vertical, horizontal))
}

/// Lowercase a format and fold the `jpeg` alias into `jpg`
pub fn normalize_format(format: &str) -> String {
    let format = format.trim().to_lowercase();
    if format == "jpeg" {
        "jpg".to_string()
    } else {
        format
    }
}

/// A named transform as stored by the definition store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformDefinition {
    pub id: Option<i64>,
    pub name: String,
    pub handle: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: Mode,
    pub position: String,
    pub quality: Option<u8>,
    pub format: Option<String>,
    pub interlace: Interlace,
    pub dimension_change_time: Option<DateTime<Utc>>,
    pub uid: Option<String>,
}

impl Default for TransformDefinition {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            handle: String::new(),
            width: None,
            height: None,
            mode: Mode::Crop,
            position: DEFAULT_POSITION.to_string(),
            quality: None,
            format: None,
            interlace: Interlace::None,
            dimension_change_time: None,
            uid: None,
        }
    }
}

impl TransformDefinition {
    pub fn new(name: &str, handle: &str) -> Self {
        Self {
            name: name.to_string(),
            handle: handle.to_string(),
            ..Default::default()
        }
    }

    /// Validate the definition before it is written to the project config
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TransformError::Validation("name cannot be blank".to_string()));
        }

        if !is_valid_handle(&self.handle) {
            return Err(TransformError::Validation(format!(
                "handle '{}' must start with a letter and contain only letters, digits, '-' or '_'",
                self.handle
            )));
        }

        // a handle shaped like an ad-hoc folder would be parsed back as raw parameters
        if crate::transform::fingerprint::parse_location(&format!("_{}", self.handle)).is_some() {
            return Err(TransformError::Validation(format!(
                "handle '{}' collides with the ad-hoc transform naming pattern",
                self.handle
            )));
        }

        if self.width.is_none() && self.height.is_none() {
            return Err(TransformError::Validation("width or height is required".to_string()));
        }

        if self.width == Some(0) || self.height == Some(0) {
            return Err(TransformError::Validation("dimensions must be greater than 0".to_string()));
        }

        if let Some(quality) = self.quality {
            if quality == 0 || quality > 100 {
                return Err(TransformError::Validation("quality must be between 1 and 100".to_string()));
            }
        }

        if parse_position(&self.position).is_none() {
            return Err(TransformError::Validation(format!("invalid position '{}'", self.position)));
        }

        if let Some(ref format) = self.format {
            if !OUTPUT_FORMATS.contains(&normalize_format(format).as_str()) {
                return Err(TransformError::Validation(format!("invalid format '{}'", format)));
            }
        }

        Ok(())
    }

    /// True when any parameter that affects generated pixels differs
    pub fn dimensions_differ(&self, other: &TransformDefinition) -> bool {
        self.width != other.width
            || self.height != other.height
            || self.mode != other.mode
            || self.position != other.position
            || self.quality != other.quality
            || self.interlace != other.interlace
    }
}

fn is_valid_handle(handle: &str) -> bool {
    let mut chars = handle.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Full parameter set of a definition as written to the project config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionConfig {
    pub name: String,
    pub handle: String,
    pub mode: Mode,
    pub position: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub interlace: Interlace,
}

impl From<&TransformDefinition> for DefinitionConfig {
    fn from(definition: &TransformDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            handle: definition.handle.clone(),
            mode: definition.mode,
            position: definition.position.clone(),
            width: definition.width,
            height: definition.height,
            quality: definition.quality,
            format: definition.format.as_deref().map(normalize_format),
            interlace: definition.interlace,
        }
    }
}

impl DefinitionConfig {
    /// Build a definition row from a config value, keeping local identity fields
    pub fn into_definition(self, uid: &str, id: Option<i64>) -> TransformDefinition {
        TransformDefinition {
            id,
            name: self.name,
            handle: self.handle,
            width: self.width,
            height: self.height,
            mode: self.mode,
            position: self.position,
            quality: self.quality,
            format: self.format,
            interlace: self.interlace,
            dimension_change_time: None,
            uid: Some(uid.to_string()),
        }
    }
}
