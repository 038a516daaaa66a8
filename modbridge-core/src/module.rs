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

//! Loaded module: manifest plus the bytes a guest runtime instantiates.

use crate::error::LoadError;
use crate::manifest::ModuleManifest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Guest backend a module runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleFormat {
    Wasm,
    Script,
}

impl ModuleFormat {
    /// Pick the backend from the entry file extension, falling back to the
    /// WebAssembly magic number.
    pub fn detect(entry_file: &str, bytes: &[u8]) -> Result<Self, LoadError> {
        let extension = Path::new(entry_file)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("wasm") => Ok(ModuleFormat::Wasm),
            Some("js") | Some("mjs") | Some("cjs") => Ok(ModuleFormat::Script),
            _ if bytes.starts_with(WASM_MAGIC) => Ok(ModuleFormat::Wasm),
            _ => Err(LoadError::UnsupportedFormat(entry_file.to_string())),
        }
    }
}

impl std::fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleFormat::Wasm => write!(f, "wasm"),
            ModuleFormat::Script => write!(f, "script"),
        }
    }
}

/// Manifest plus source, immutable after load
#[derive(Debug, Clone)]
pub struct Module {
    manifest: ModuleManifest,
    format: ModuleFormat,
    bytes: Arc<[u8]>,
    digest: String,
    root: Option<PathBuf>,
}

impl Module {
    pub fn new(manifest: ModuleManifest, bytes: impl Into<Vec<u8>>) -> Result<Self, LoadError> {
        manifest.validate()?;
        let bytes: Vec<u8> = bytes.into();
        let format = ModuleFormat::detect(&manifest.entry_file, &bytes)?;
        if format == ModuleFormat::Script {
            std::str::from_utf8(&bytes).map_err(|e| {
                LoadError::UnsupportedFormat(format!(
                    "{} is not valid UTF-8: {}",
                    manifest.entry_file, e
                ))
            })?;
        }
        let digest = hex::encode(blake3::hash(&bytes).as_bytes());
        Ok(Self {
            manifest,
            format,
            bytes: bytes.into(),
            digest,
            root: None,
        })
    }

    /// Script module from source text.
    pub fn from_source(manifest: ModuleManifest, source: &str) -> Result<Self, LoadError> {
        Self::new(manifest, source.as_bytes().to_vec())
    }

    /// Read the manifest and entry file of a module directory.
    pub fn from_directory(dir: &Path) -> Result<Self, LoadError> {
        let manifest = ModuleManifest::from_directory(dir)?;
        let entry_path = dir.join(&manifest.entry_file);
        let bytes = std::fs::read(&entry_path).map_err(|e| {
            LoadError::InvalidManifest(format!(
                "cannot read entry file {}: {}",
                entry_path.display(),
                e
            ))
        })?;
        let mut module = Self::new(manifest, bytes)?;
        module.root = Some(dir.to_path_buf());
        Ok(module)
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Script source; `None` for WebAssembly modules.
    pub fn source(&self) -> Option<&str> {
        match self.format {
            ModuleFormat::Script => std::str::from_utf8(&self.bytes).ok(),
            ModuleFormat::Wasm => None,
        }
    }

    /// blake3 digest of the entry file, hex encoded
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}
