//! Plugin manifest parsing and entry integrity verification

use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SUPPORTED_INTEGRITY_ALGORITHM: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    pub algorithm: String,
    pub hash: String,
}

/// A validated manifest with its entry resolved against the manifest's
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub entry: String,
    pub entry_path: PathBuf,
    pub dependencies: Vec<String>,
    pub priority: i64,
    pub integrity: Option<Integrity>,
}

// Every field optional so a missing one is reported by name rather than as
// a serde error.
#[derive(Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    entry: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    integrity: Option<Integrity>,
}

fn invalid(path: &Path, reason: impl Into<String>) -> PluginError {
    PluginError::InvalidManifest {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn required(path: &Path, value: Option<String>, field: &str) -> Result<String, PluginError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| invalid(path, format!("missing required field '{field}'")))
}

impl PluginManifest {
    /// Reads, parses and validates the manifest at `path`. The entry file
    /// must exist; integrity is checked separately by [`Self::verify_integrity`].
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(path, format!("cannot read manifest: {e}")))?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, PluginError> {
        let raw: RawManifest = serde_json::from_str(content)
            .map_err(|e| invalid(path, format!("malformed JSON: {e}")))?;

        let name = required(path, raw.name, "name")?;
        let version = required(path, raw.version, "version")?;
        let entry = required(path, raw.entry, "entry")?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let entry_path = base.join(&entry);
        if !entry_path.is_file() {
            return Err(PluginError::EntryNotFound {
                name,
                entry: entry_path.display().to_string(),
            });
        }

        Ok(Self {
            name,
            version,
            entry,
            entry_path,
            dependencies: raw.dependencies,
            priority: raw.priority.unwrap_or(0),
            integrity: raw.integrity,
        })
    }

    /// Compares the entry file's digest against the declared one, if any.
    /// Returns whether a digest was actually compared.
    pub fn verify_integrity(&self) -> Result<bool, PluginError> {
        let Some(integrity) = &self.integrity else {
            return Ok(false);
        };

        if !integrity
            .algorithm
            .eq_ignore_ascii_case(SUPPORTED_INTEGRITY_ALGORITHM)
        {
            return Err(PluginError::UnsupportedIntegrityAlgorithm {
                name: self.name.clone(),
                algorithm: integrity.algorithm.clone(),
            });
        }

        let bytes = std::fs::read(&self.entry_path).map_err(|e| PluginError::Io {
            reason: format!("cannot read entry {}: {e}", self.entry_path.display()),
        })?;
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(integrity.hash.trim()) {
            return Err(PluginError::IntegrityCheckFailed {
                name: self.name.clone(),
                expected: integrity.hash.clone(),
                actual,
            });
        }
        Ok(true)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn fixture(manifest: serde_json::Value) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.js"), b"module.exports = {}").unwrap();
        let path = dir.path().join("plugin.json");
        fs::write(&path, manifest.to_string()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_loads_and_resolves_entry() {
        let (dir, path) = fixture(json!({
            "name": "audit", "version": "1.0.0", "entry": "index.js",
            "dependencies": ["core"], "priority": 5
        }));
        let manifest = PluginManifest::load(&path).unwrap();

        assert_eq!(manifest.entry_path, dir.path().join("index.js"));
        assert_eq!(manifest.dependencies, vec!["core"]);
        assert_eq!(manifest.priority, 5);
        assert!(!manifest.verify_integrity().unwrap());
    }

    #[test]
    fn test_missing_field_is_named() {
        let (_dir, path) = fixture(json!({ "name": "audit", "entry": "index.js" }));
        let err = PluginManifest::load(&path).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest { .. }));
        assert!(err.to_string().contains("'version'"));
    }

    #[test]
    fn test_missing_entry() {
        let (_dir, path) = fixture(json!({ "name": "a", "version": "1", "entry": "gone.js" }));
        assert!(matches!(
            PluginManifest::load(&path).unwrap_err(),
            PluginError::EntryNotFound { .. }
        ));
    }

    #[test]
    fn test_integrity_checks() {
        let digest = sha256_hex(b"module.exports = {}");

        let (_dir, path) = fixture(json!({
            "name": "a", "version": "1", "entry": "index.js",
            "integrity": { "algorithm": "sha256", "hash": digest.to_uppercase() }
        }));
        assert!(PluginManifest::load(&path).unwrap().verify_integrity().unwrap());

        let (_dir, path) = fixture(json!({
            "name": "a", "version": "1", "entry": "index.js",
            "integrity": { "algorithm": "md5", "hash": "abc" }
        }));
        assert!(matches!(
            PluginManifest::load(&path).unwrap().verify_integrity(),
            Err(PluginError::UnsupportedIntegrityAlgorithm { .. })
        ));

        let (_dir, path) = fixture(json!({
            "name": "a", "version": "1", "entry": "index.js",
            "integrity": { "algorithm": "sha256", "hash": "00" }
        }));
        match PluginManifest::load(&path).unwrap().verify_integrity() {
            Err(PluginError::IntegrityCheckFailed { expected, actual, .. }) => {
                assert_eq!(expected, "00");
                assert_eq!(actual, digest);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
