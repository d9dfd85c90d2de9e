// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Filesystem-backed profile store.
//!
//! Layout: `<base>/<kind>/<id>.yaml`.  References resolve as a bare id or an
//! `<id>.yaml` filename; anything containing path separators or `..` is
//! rejected, and absolute paths are only accepted when they stay inside the
//! base directory.  The id inside a file always yields to the file stem when
//! it is missing or unsafe.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::validate::validate_profile;

/// Profile kinds the store manages.  `rule` documents are referenced from
/// pipeline processing blocks but share the same storage contract.
pub const PROFILE_KINDS: &[&str] = &[
    "api", "prompt", "parser", "policy", "chunk", "pipeline", "rule",
];

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile_not_found: {kind}:{reference}")]
    NotFound { kind: String, reference: String },
    #[error("invalid_profile_id: {0}")]
    InvalidId(String),
    #[error("invalid profile YAML at {path}: {message}")]
    InvalidYaml { path: PathBuf, message: String },
    #[error("profile validation failed: {}", errors.join(", "))]
    Validation { errors: Vec<String> },
    #[error("profile I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Listing entry for one stored profile.
#[derive(Debug, Clone)]
pub struct ProfileRef {
    pub kind: String,
    pub profile_id: String,
    pub path: PathBuf,
    pub name: String,
    /// Normalised chunk type, `chunk` kind only.
    pub chunk_type: Option<String>,
}

#[derive(Debug)]
pub struct ProfileStore {
    base_dir: PathBuf,
}

impl ProfileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `[A-Za-z0-9_][A-Za-z0-9_.-]*`, no `..`, no path separators.
    pub fn is_safe_profile_id(value: &str) -> bool {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.contains("..") {
            return false;
        }
        if trimmed.contains('/') || trimmed.contains('\\') {
            return false;
        }
        let mut chars = trimmed.chars();
        let first = match chars.next() {
            Some(c) => c,
            None => return false,
        };
        if !(first.is_ascii_alphanumeric() || first == '_') {
            return false;
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.base_dir.join(kind)
    }

    pub fn ensure_dirs(&self, kinds: &[&str]) -> std::io::Result<()> {
        for kind in kinds {
            std::fs::create_dir_all(self.kind_dir(kind))?;
        }
        Ok(())
    }

    fn normalize_chunk_type(value: &str) -> String {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => "block".to_string(),
            "block" | "line" => value.trim().to_ascii_lowercase(),
            _ => String::new(),
        }
    }

    fn is_within_base(&self, path: &Path) -> bool {
        let base = match self.base_dir.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match path.canonicalize() {
            Ok(p) => p.starts_with(&base),
            Err(_) => false,
        }
    }

    /// Enumerate profiles of one kind, skipping entries whose stem fails the
    /// safety pattern and files that do not parse as a mapping.
    pub fn list(&self, kind: &str) -> Vec<ProfileRef> {
        let mut result = Vec::new();
        let dir = self.kind_dir(kind);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return result,
        };
        let mut names: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        names.sort();

        for path in names {
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) if Self::is_safe_profile_id(s) => s.to_string(),
                _ => continue,
            };
            let data = match self.load_value_by_path(&path) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let profile_id = mapping_str(&data, "id").unwrap_or(stem);
            let name = mapping_str(&data, "name").unwrap_or_else(|| profile_id.clone());
            let chunk_type = if kind == "chunk" {
                let raw = mapping_str(&data, "chunk_type")
                    .or_else(|| mapping_str(&data, "type"))
                    .unwrap_or_default();
                let normalized = Self::normalize_chunk_type(&raw);
                (!normalized.is_empty()).then_some(normalized)
            } else {
                None
            };
            result.push(ProfileRef {
                kind: kind.to_string(),
                profile_id,
                path,
                name,
                chunk_type,
            });
        }
        result
    }

    /// Resolve a reference (id, `<id>.yaml` filename, or in-base absolute
    /// path) to the profile path.
    pub fn resolve(&self, kind: &str, reference: &str) -> Option<PathBuf> {
        if reference.is_empty() {
            return None;
        }
        let as_path = Path::new(reference);
        if as_path.is_absolute() && as_path.exists() {
            return self.is_within_base(as_path).then(|| as_path.to_path_buf());
        }
        if reference.ends_with(".yaml") || reference.ends_with(".yml") {
            if reference.contains('/') || reference.contains('\\') {
                return None;
            }
            let stem = Path::new(reference).file_stem().and_then(|s| s.to_str())?;
            if !Self::is_safe_profile_id(stem) {
                return None;
            }
            let candidate = self.kind_dir(kind).join(reference);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        if !Self::is_safe_profile_id(reference) {
            return None;
        }
        let candidate = self.kind_dir(kind).join(format!("{reference}.yaml"));
        if candidate.exists() {
            return Some(candidate);
        }
        // Fall back to a scan: the file stem may differ from the declared id.
        self.list(kind)
            .into_iter()
            .find(|p| p.profile_id == reference)
            .map(|p| p.path)
    }

    /// Load a profile as a YAML mapping with the id forced to the file stem
    /// when missing or unsafe.
    pub fn load_value(
        &self,
        kind: &str,
        reference: &str,
    ) -> Result<serde_yaml::Mapping, ProfileError> {
        let path = self
            .resolve(kind, reference)
            .ok_or_else(|| ProfileError::NotFound {
                kind: kind.to_string(),
                reference: reference.to_string(),
            })?;
        let mut data = self.load_value_by_path(&path)?;
        if kind == "chunk" {
            let raw = mapping_str(&data, "chunk_type")
                .or_else(|| mapping_str(&data, "type"))
                .unwrap_or_default();
            let normalized = Self::normalize_chunk_type(&raw);
            if !normalized.is_empty() {
                data.insert("chunk_type".into(), normalized.into());
            }
        }
        Ok(data)
    }

    fn load_value_by_path(&self, path: &Path) -> Result<serde_yaml::Mapping, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| ProfileError::InvalidYaml {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let mut mapping = match value {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            _ => {
                return Err(ProfileError::InvalidYaml {
                    path: path.to_path_buf(),
                    message: "profile document must be a mapping".to_string(),
                })
            }
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if !Self::is_safe_profile_id(&stem) {
            return Err(ProfileError::InvalidId(stem));
        }
        let raw_id = mapping_str(&mapping, "id").unwrap_or_default();
        let id = if Self::is_safe_profile_id(&raw_id) {
            raw_id.trim().to_string()
        } else {
            stem
        };
        mapping.insert("id".into(), id.clone().into());
        if mapping_str(&mapping, "name").is_none() {
            mapping.insert("name".into(), id.into());
        }
        Ok(mapping)
    }

    /// Load and deserialize a profile into its typed record.
    pub fn load<T: DeserializeOwned>(&self, kind: &str, reference: &str) -> Result<T, ProfileError> {
        let mapping = self.load_value(kind, reference)?;
        let path = self.resolve(kind, reference).unwrap_or_default();
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping)).map_err(|e| {
            ProfileError::InvalidYaml {
                path,
                message: e.to_string(),
            }
        })
    }

    /// Validate and persist a profile document.  The id is forced to the
    /// caller-supplied component; validation errors reject the save, warnings
    /// are returned alongside success.
    pub fn save(&self, kind: &str, id: &str, yaml_text: &str) -> Result<Vec<String>, ProfileError> {
        if !Self::is_safe_profile_id(id) {
            return Err(ProfileError::InvalidId(id.to_string()));
        }
        let value: serde_yaml::Value =
            serde_yaml::from_str(yaml_text).map_err(|e| ProfileError::InvalidYaml {
                path: self.kind_dir(kind).join(format!("{id}.yaml")),
                message: e.to_string(),
            })?;
        let mut mapping = match value {
            serde_yaml::Value::Mapping(m) => m,
            _ => {
                return Err(ProfileError::Validation {
                    errors: vec!["invalid_yaml".to_string()],
                })
            }
        };
        mapping.insert("id".into(), id.into());

        let result = validate_profile(kind, &mapping, Some(self));
        if !result.ok() {
            return Err(ProfileError::Validation {
                errors: result.errors,
            });
        }

        let dir = self.kind_dir(kind);
        std::fs::create_dir_all(&dir).map_err(|source| ProfileError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{id}.yaml"));
        let rendered = serde_yaml::to_string(&serde_yaml::Value::Mapping(mapping)).map_err(|e| {
            ProfileError::InvalidYaml {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        // Atomic replace: write a sibling temp file, then rename over.
        let tmp = dir.join(format!(".{id}.yaml.tmp"));
        std::fs::write(&tmp, rendered).map_err(|source| ProfileError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| ProfileError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(kind, id, path = %path.display(), "profile saved");
        Ok(result.warnings)
    }
}

fn mapping_str(mapping: &serde_yaml::Mapping, key: &str) -> Option<String> {
    mapping
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
