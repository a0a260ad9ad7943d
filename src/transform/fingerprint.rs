//! # Fingerprint / Folder Naming
//!
//! Mappatura deterministica dai parametri di una trasformazione al nome della
//! cartella in cui vengono salvate le rendition.
//!
//! ## Formati:
//! - Trasformazione nominata: `_<handle>`
//! - Trasformazione ad-hoc: `_<w|AUTO>x<h|AUTO>_<mode>_<position>[_<quality>]_<interlace>`
//! - Fingerprint (chiave di cache): nome cartella + `:<format>` se il formato è esplicito
//!
//! `parse_location()` è l'inversa del pattern ad-hoc; per le cartelle nominate
//! restituisce `None`.

use crate::transform::definition::{Interlace, Mode};
use crate::transform::spec::TransformSpec;

const AUTO: &str = "AUTO";

/// Folder name for a named transform handle
pub fn named_folder_name(handle: &str) -> String {
    format!("_{}", handle)
}

/// Folder name a spec would get if it were not named
pub fn unnamed_folder_name(spec: &TransformSpec) -> String {
    let dim = |d: Option<u32>| d.map_or_else(|| AUTO.to_string(), |d| d.to_string());
    let quality = spec.quality.map(|q| format!("_{}", q)).unwrap_or_default();
    format!(
        "_{}x{}_{}_{}{}_{}",
        dim(spec.width),
        dim(spec.height),
        spec.mode,
        spec.position,
        quality,
        spec.interlace
    )
}

/// Storage folder for the renditions of a transform
pub fn folder_name(spec: &TransformSpec) -> String {
    match spec.handle {
        Some(ref handle) => named_folder_name(handle),
        None => unnamed_folder_name(spec),
    }
}

/// Cache key of a transform: folder name plus explicit format
pub fn fingerprint(spec: &TransformSpec) -> String {
    match spec.format {
        Some(ref format) => format!("{}:{}", folder_name(spec), format),
        None => folder_name(spec),
    }
}

/// Parse an ad-hoc folder name back into transform parameters
pub fn parse_location(location: &str) -> Option<TransformSpec> {
    let body = location.strip_prefix('_')?;
    let parts: Vec<&str> = body.split('_').collect();

    let (dims, mode, position, quality, interlace) = match parts.as_slice() {
        [dims, mode, position, interlace] => (*dims, *mode, *position, None, *interlace),
        [dims, mode, position, quality, interlace] => (*dims, *mode, *position, Some(*quality), *interlace),
        _ => return None,
    };

    let (width, height) = dims.split_once('x')?;
    let width = parse_dimension(width)?;
    let height = parse_dimension(height)?;
    let mode: Mode = mode.parse().ok()?;

    let (vertical, horizontal) = position.split_once('-')?;
    let is_word = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
    if !is_word(vertical) || !is_word(horizontal) {
        return None;
    }

    let quality = match quality {
        Some(q) => Some(q.parse::<u8>().ok()?),
        None => None,
    };
    let interlace: Interlace = interlace.parse().ok()?;

    Some(TransformSpec {
        width,
        height,
        mode,
        position: position.to_string(),
        quality,
        interlace,
        ..Default::default()
    })
}

fn parse_dimension(value: &str) -> Option<Option<u32>> {
    if value == AUTO {
        return Some(None);
    }
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    value.parse::<u32>().ok().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::definition::TransformDefinition;
    use crate::transform::spec::{normalize, DefinitionLookup, TransformInput};
    use std::collections::HashSet;

    struct NoDefinitions;

    impl DefinitionLookup for NoDefinitions {
        fn definition_by_handle(&self, _handle: &str) -> Option<TransformDefinition> {
            None
        }
    }

    fn spec(width: Option<u32>, height: Option<u32>) -> TransformSpec {
        TransformSpec::dimensions(width, height)
    }

    #[test]
    fn test_named_folder() {
        let mut s = spec(Some(10), Some(10));
        s.handle = Some("thumb".to_string());
        assert_eq!(folder_name(&s), "_thumb");
    }

    #[test]
    fn test_unnamed_folder() {
        assert_eq!(folder_name(&spec(Some(300), None)), "_300xAUTO_crop_center-center_none");

        let mut s = spec(None, Some(200));
        s.mode = Mode::Fit;
        s.position = "top-left".to_string();
        s.quality = Some(60);
        s.interlace = Interlace::Line;
        assert_eq!(folder_name(&s), "_AUTOx200_fit_top-left_60_line");
    }

    #[test]
    fn test_fingerprint_appends_format() {
        let mut s = spec(Some(300), Some(200));
        assert_eq!(fingerprint(&s), "_300x200_crop_center-center_none");
        s.format = Some("webp".to_string());
        assert_eq!(fingerprint(&s), "_300x200_crop_center-center_none:webp");
    }

    #[test]
    fn test_parse_location_round_trip() {
        let mut s = spec(None, Some(200));
        s.mode = Mode::Stretch;
        s.position = "bottom-right".to_string();
        s.quality = Some(90);
        s.interlace = Interlace::Plane;

        let location = folder_name(&s);
        let parsed = parse_location(&location).unwrap();
        assert_eq!(parsed, s);
        assert_eq!(folder_name(&parsed), location);

        let plain = spec(Some(640), Some(480));
        assert_eq!(parse_location(&folder_name(&plain)).unwrap(), plain);
    }

    #[test]
    fn test_parse_location_rejects_named_folders() {
        assert!(parse_location("_thumb").is_none());
        assert!(parse_location("_my_hero_image").is_none());
        assert!(parse_location("thumb").is_none());
        assert!(parse_location("_100x100_squash_center-center_none").is_none());
    }

    #[test]
    fn test_distinguishable_specs_do_not_collide() {
        let base = spec(Some(100), Some(100));
        let mut variants = vec![base.clone()];

        let mut s = base.clone();
        s.width = Some(101);
        variants.push(s);
        let mut s = base.clone();
        s.height = None;
        variants.push(s);
        let mut s = base.clone();
        s.mode = Mode::Fit;
        variants.push(s);
        let mut s = base.clone();
        s.position = "top-center".to_string();
        variants.push(s);
        let mut s = base.clone();
        s.quality = Some(50);
        variants.push(s);
        let mut s = base.clone();
        s.interlace = Interlace::Partition;
        variants.push(s);
        let mut s = base.clone();
        s.format = Some("png".to_string());
        variants.push(s);

        let fingerprints: HashSet<String> = variants.iter().map(fingerprint).collect();
        assert_eq!(fingerprints.len(), variants.len());

        // a position that mimics the quality segment never reaches a folder name
        let mut input = serde_json::Map::new();
        input.insert("width".to_string(), 100.into());
        input.insert("height".to_string(), 100.into());
        input.insert("position".to_string(), "center-center_50".into());
        assert!(normalize(&TransformInput::ByProperties(input), &NoDefinitions).is_err());

        for variant in variants.iter().filter(|v| v.format.is_none()) {
            assert_eq!(parse_location(&folder_name(variant)).as_ref(), Some(variant));
        }
    }

    #[test]
    fn test_deterministic() {
        let a = spec(Some(1), Some(2));
        let b = spec(Some(1), Some(2));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
