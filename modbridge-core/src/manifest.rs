// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Module manifest schema and parser
//!
//! A module directory carries `manifest.json` (camelCase keys) or, for
//! hand-written modules, `manifest.toml` with the same fields.

use crate::capabilities::CapabilitySet;
use crate::error::LoadError;
use crate::{MANIFEST_FILENAME, MANIFEST_TOML_FILENAME};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Module manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    /// Unique module identifier (e.g., "org.example.moviesource")
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Module version (semver)
    pub version: String,

    /// Entry file, relative to the module root
    pub entry_file: String,

    /// Declared capabilities (`json`, `network`, `network:<host>`, `log`, ...)
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Icon path (relative to module root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

impl ModuleManifest {
    /// Load manifest from a file, choosing the parser by extension
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LoadError::ManifestNotFound(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    /// Load manifest from a module directory
    pub fn from_directory(dir: &Path) -> Result<Self, LoadError> {
        let json_path = dir.join(MANIFEST_FILENAME);
        if json_path.exists() {
            return Self::from_file(&json_path);
        }
        let toml_path = dir.join(MANIFEST_TOML_FILENAME);
        if toml_path.exists() {
            return Self::from_file(&toml_path);
        }
        Err(LoadError::ManifestNotFound(format!(
            "{}: no {} or {}",
            dir.display(),
            MANIFEST_FILENAME,
            MANIFEST_TOML_FILENAME
        )))
    }

    pub fn from_json_str(content: &str) -> Result<Self, LoadError> {
        let manifest: ModuleManifest = serde_json::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LoadError> {
        let manifest: ModuleManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.id.is_empty() {
            return Err(LoadError::InvalidManifest(
                "Module ID cannot be empty".into(),
            ));
        }

        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(LoadError::InvalidManifest(
                "Module ID can only contain alphanumeric characters, dots, hyphens, and underscores"
                    .into(),
            ));
        }

        if self.name.trim().is_empty() {
            return Err(LoadError::InvalidManifest(
                "Module name cannot be empty".into(),
            ));
        }

        semver::Version::parse(&self.version)?;

        let entry = Path::new(&self.entry_file);
        if self.entry_file.is_empty()
            || entry.is_absolute()
            || entry
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(LoadError::InvalidManifest(format!(
                "entryFile must be a relative path inside the module: {}",
                self.entry_file
            )));
        }

        self.declared_capabilities()?;
        Ok(())
    }

    pub fn version(&self) -> Result<semver::Version, LoadError> {
        Ok(semver::Version::parse(&self.version)?)
    }

    pub fn declared_capabilities(&self) -> Result<CapabilitySet, LoadError> {
        CapabilitySet::parse(self.capabilities.iter().map(String::as_str))
    }

    /// Compute content hash for integrity verification
    pub fn content_hash(&self) -> String {
        let content = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(blake3::hash(&content).as_bytes())
    }
}
