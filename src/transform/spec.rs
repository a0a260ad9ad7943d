//! # Transform Spec Normalization
//!
//! Questo modulo converte qualsiasi input di trasformazione in un `TransformSpec`
//! normalizzato.
//!
//! ## Responsabilità:
//! - `TransformInput`: unione taggata degli input accettati (handle, mappa di proprietà,
//!   estensione di una base, definizione già caricata, dimensione srcset relativa)
//! - `normalize()`: unico punto di normalizzazione con ordine di precedenza fisso
//! - Estensione con whitelist delle proprietà sovrascrivibili
//! - Risoluzione delle dimensioni relative (`2x`, `500w`) rispetto a un riferimento
//!
//! ## Esempio:
//! ```rust,ignore
//! let reference = normalize(&TransformInput::from("hero"), &store)?;
//! let retina = resolve_relative(&reference, "2x")?;
//! ```

use crate::error::{Result, TransformError};
use crate::transform::definition::{
    normalize_format, parse_position, Interlace, Mode, TransformDefinition, DEFAULT_POSITION,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Properties an extended transform may override
pub const EXTENDABLE_PROPERTIES: &[&str] =
    &["width", "height", "format", "mode", "position", "quality", "interlace"];

/// Anything that can resolve a named transform by handle
pub trait DefinitionLookup {
    fn definition_by_handle(&self, handle: &str) -> Option<TransformDefinition>;
}

/// Accepted shapes of a transform request
#[derive(Debug, Clone, PartialEq)]
pub enum TransformInput {
    ByHandle(String),
    ByProperties(Map<String, Value>),
    Extend {
        base: Box<TransformInput>,
        overrides: Map<String, Value>,
    },
    Definition(TransformDefinition),
    /// srcset-style size relative to a preceding reference transform
    Relative(String),
}

impl From<&str> for TransformInput {
    fn from(handle: &str) -> Self {
        TransformInput::ByHandle(handle.to_string())
    }
}

impl From<TransformDefinition> for TransformInput {
    fn from(definition: TransformDefinition) -> Self {
        TransformInput::Definition(definition)
    }
}

/// Normalized transform parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub handle: Option<String>,
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

impl Default for TransformSpec {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            handle: None,
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

impl From<&TransformDefinition> for TransformSpec {
    fn from(definition: &TransformDefinition) -> Self {
        Self {
            id: definition.id,
            name: Some(definition.name.clone()),
            handle: Some(definition.handle.clone()),
            width: definition.width,
            height: definition.height,
            mode: definition.mode,
            position: definition.position.clone(),
            quality: definition.quality,
            format: definition.format.as_deref().map(normalize_format),
            interlace: definition.interlace,
            dimension_change_time: definition.dimension_change_time,
            uid: definition.uid.clone(),
        }
    }
}

impl TransformSpec {
    pub fn dimensions(width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn is_named(&self) -> bool {
        self.handle.is_some()
    }

    /// Drop every identity field; extended and relative specs are anonymous
    pub fn into_anonymous(mut self) -> Self {
        self.id = None;
        self.name = None;
        self.handle = None;
        self.uid = None;
        self.dimension_change_time = None;
        self
    }

    fn apply_properties(&mut self, properties: &Map<String, Value>, whitelist: Option<&[&str]>) -> Result<()> {
        for (key, value) in properties {
            if let Some(allowed) = whitelist {
                if !allowed.contains(&key.as_str()) {
                    continue;
                }
            }
            match key.as_str() {
                "width" => self.width = value_as_u32(key, value)?,
                "height" => self.height = value_as_u32(key, value)?,
                "quality" => {
                    self.quality = value_as_u32(key, value)?
                        .map(|q| u8::try_from(q.clamp(1, 100)).unwrap_or(100));
                }
                "mode" => {
                    if let Some(mode) = value_as_str(key, value)? {
                        self.mode = mode.parse()?;
                    }
                }
                "position" => {
                    if let Some(position) = value_as_str(key, value)? {
                        let position = position.trim().to_lowercase();
                        if parse_position(&position).is_none() {
                            return Err(invalid_property(key, value));
                        }
                        self.position = position;
                    }
                }
                "interlace" => {
                    if let Some(interlace) = value_as_str(key, value)? {
                        self.interlace = interlace.parse()?;
                    }
                }
                "format" => self.format = value_as_str(key, value)?.map(normalize_format),
                _ => {}
            }
        }
        Ok(())
    }
}

fn value_as_u32(key: &str, value: &Value) -> Result<Option<u32>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .map(Some)
            .ok_or_else(|| invalid_property(key, value)),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => s
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .map(Some)
            .ok_or_else(|| invalid_property(key, value)),
        _ => Err(invalid_property(key, value)),
    }
}

fn value_as_str<'a>(key: &str, value: &'a Value) -> Result<Option<&'a str>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.as_str())),
        _ => Err(invalid_property(key, value)),
    }
}

fn invalid_property(key: &str, value: &Value) -> TransformError {
    TransformError::IndexResolutionFailed(format!("invalid value for '{}': {}", key, value))
}

/// Normalize a single transform input
pub fn normalize(input: &TransformInput, definitions: &dyn DefinitionLookup) -> Result<TransformSpec> {
    match input {
        TransformInput::ByHandle(handle) => definitions
            .definition_by_handle(handle)
            .map(|definition| TransformSpec::from(&definition))
            .ok_or_else(|| TransformError::DefinitionNotFound(handle.clone())),
        TransformInput::ByProperties(properties) => {
            // a `transform` key means "extend this handle with the remaining keys"
            if let Some(base) = properties.get("transform").and_then(Value::as_str) {
                let mut overrides = properties.clone();
                overrides.remove("transform");
                return extend(&normalize(&TransformInput::from(base), definitions)?, &overrides);
            }
            let mut spec = TransformSpec::default();
            spec.apply_properties(properties, None)?;
            Ok(spec)
        }
        TransformInput::Extend { base, overrides } => extend(&normalize(base, definitions)?, overrides),
        TransformInput::Definition(definition) => Ok(TransformSpec::from(definition)),
        TransformInput::Relative(size) => Err(TransformError::IndexResolutionFailed(format!(
            "relative size '{}' has no reference transform",
            size
        ))),
    }
}

/// Clone `base` and apply whitelisted overrides; the result is anonymous
pub fn extend(base: &TransformSpec, overrides: &Map<String, Value>) -> Result<TransformSpec> {
    let mut spec = base.clone();
    spec.apply_properties(overrides, Some(EXTENDABLE_PROPERTIES))?;
    Ok(spec.into_anonymous())
}

/// Resolve a srcset size (`2x`, `1.5x`, `500w`) against a reference spec
pub fn resolve_relative(reference: &TransformSpec, size: &str) -> Result<TransformSpec> {
    let ref_width = reference.width.ok_or_else(|| {
        TransformError::IndexResolutionFailed(format!(
            "relative size '{}' requires a reference transform with a width",
            size
        ))
    })?;

    let size = size.trim();
    let invalid = || TransformError::IndexResolutionFailed(format!("invalid srcset size '{}'", size));

    let width = if let Some(multiplier) = size.strip_suffix('x') {
        let multiplier: f64 = multiplier.parse().map_err(|_| invalid())?;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(invalid());
        }
        scaled(ref_width as f64 * multiplier).ok_or_else(invalid)?
    } else if let Some(pixels) = size.strip_suffix('w') {
        pixels.parse::<u32>().ok().filter(|w| *w > 0).ok_or_else(invalid)?
    } else {
        return Err(invalid());
    };

    let height = match reference.height {
        Some(h) => Some(scaled(h as f64 * width as f64 / ref_width as f64).ok_or_else(invalid)?),
        None => None,
    };

    let mut spec = reference.clone().into_anonymous();
    spec.width = Some(width);
    spec.height = height;
    Ok(spec)
}

fn scaled(value: f64) -> Option<u32> {
    let value = value.ceil();
    if !value.is_finite() || value < 1.0 || value > u32::MAX as f64 {
        return None;
    }
    u32::try_from(value as u64).ok()
}

/// Normalize a list where relative sizes refer to the nearest preceding full spec
pub fn normalize_list(inputs: &[TransformInput], definitions: &dyn DefinitionLookup) -> Result<Vec<TransformSpec>> {
    let mut specs = Vec::with_capacity(inputs.len());
    let mut reference: Option<TransformSpec> = None;

    for input in inputs {
        match input {
            TransformInput::Relative(size) => {
                let base = reference.as_ref().ok_or_else(|| {
                    TransformError::IndexResolutionFailed(format!(
                        "relative size '{}' has no preceding reference transform",
                        size
                    ))
                })?;
                specs.push(resolve_relative(base, size)?);
            }
            other => {
                let spec = normalize(other, definitions)?;
                reference = Some(spec.clone());
                specs.push(spec);
            }
        }
    }

    Ok(specs)
}
