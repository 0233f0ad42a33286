//! Unit manifest parsing and fingerprinting.
//!
//! A unit manifest is the hot-reloadable artifact in the module directory:
//! extraction logic is statically linked and registered under an entrypoint
//! id; the manifest declares which entrypoint a unit uses, its dependency
//! names, and its matcher.
//!
//! ```toml
//! entrypoint = "exif"
//! dependencies = ["stat"]
//!
//! [matcher]
//! extensions = ["jpg", "jpeg"]
//! mime_types = ["image/jpeg"]
//! magic      = ["ffd8ff"]
//! ```

use metasieve_core::{LoadError, Matcher};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parsed unit manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitManifest {
    /// Id of the registered entrypoint this unit calls
    pub entrypoint: String,
    /// Names of units this unit consumes
    pub dependencies: BTreeSet<String>,
    /// Applicability predicate
    pub matcher: Matcher,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    entrypoint: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    matcher: RawMatcher,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMatcher {
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    mime_types: Vec<String>,
    #[serde(default)]
    magic: Vec<String>,
}

/// Parse a manifest from TOML text.
pub fn parse(text: &str) -> Result<UnitManifest, LoadError> {
    let raw: RawManifest = toml::from_str(text).map_err(|e| LoadError::Parse(e.to_string()))?;

    if raw.entrypoint.trim().is_empty() {
        return Err(LoadError::Parse("entrypoint must not be empty".to_string()));
    }

    let magic = raw
        .matcher
        .magic
        .iter()
        .map(|hex| decode_magic(hex))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(UnitManifest {
        entrypoint: raw.entrypoint,
        dependencies: raw.dependencies.into_iter().collect(),
        matcher: Matcher {
            extensions: raw
                .matcher
                .extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            mime_types: raw.matcher.mime_types,
            magic,
        },
    })
}

/// Content fingerprint over manifest bytes and mtime, used to detect changes
/// and to short-circuit no-op reloads.
#[must_use]
pub fn fingerprint(bytes: &[u8], mtime: SystemTime) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    let nanos = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(&nanos.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

fn decode_magic(hex: &str) -> Result<Vec<u8>, LoadError> {
    let invalid = |reason: &str| LoadError::InvalidMagic {
        value: hex.to_string(),
        reason: reason.to_string(),
    };

    if hex.is_empty() {
        return Err(invalid("empty prefix"));
    }
    if hex.len() % 2 != 0 {
        return Err(invalid("odd number of hex digits"));
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid("non-hex digit")))
        .collect()
}
