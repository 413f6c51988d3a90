//! Per-sample files and setup scripts.
//!
//! A content source is a `data:` URL, a path relative to the dataset
//! directory, or literal text, tried in that order. File names may carry
//! an `envname:` prefix to target a non-default environment.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::sandbox::{expand_home, SandboxError, SandboxResult};

/// Files to copy into a sample's environments and an optional setup script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SampleAssets {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub setup: Option<String>,
}

/// A file with its content loaded and its target environment split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssetFile {
    pub environment: Option<String>,
    pub path: String,
    pub contents: Vec<u8>,
}

/// Assets with every source loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResolvedAssets {
    pub files: Vec<AssetFile>,
    pub setup: Option<Vec<u8>>,
}

impl SampleAssets {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.setup.is_none()
    }

    /// Loads every source relative to `base_dir`.
    pub fn resolve(&self, base_dir: &Path) -> SandboxResult<ResolvedAssets> {
        let files = self
            .files
            .iter()
            .map(|(name, source)| {
                let (environment, path) = split_target(name);
                Ok(AssetFile {
                    environment: environment.map(str::to_string),
                    path: path.to_string(),
                    contents: load_source(source, base_dir)?,
                })
            })
            .collect::<SandboxResult<Vec<_>>>()?;
        let setup = self
            .setup
            .as_deref()
            .map(|source| load_source(source, base_dir))
            .transpose()?;
        Ok(ResolvedAssets { files, setup })
    }
}

/// Splits `envname:path` into its parts.
pub(crate) fn split_target(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((env, path)) if !env.is_empty() && !env.contains('/') => (Some(env), path),
        _ => (None, name),
    }
}

/// Reads a content source.
pub(crate) fn load_source(source: &str, base_dir: &Path) -> SandboxResult<Vec<u8>> {
    if let Some(data) = source.strip_prefix("data:") {
        return decode_data_url(data);
    }
    if !source.contains('\n') {
        let path = expand_home(source);
        let path = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };
        if path.is_file() {
            return std::fs::read(&path).map_err(|e| {
                SandboxError::configuration(format!("failed to read {}: {e}", path.display()))
            });
        }
    }
    Ok(source.as_bytes().to_vec())
}

fn decode_data_url(data: &str) -> SandboxResult<Vec<u8>> {
    let (meta, payload) = data
        .split_once(',')
        .ok_or_else(|| SandboxError::configuration("malformed data URL: missing ','"))?;
    if meta.ends_with(";base64") {
        BASE64_STANDARD
            .decode(payload.trim())
            .map_err(|e| SandboxError::configuration(format!("malformed data URL: {e}")))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

/// Interpreter argv for a setup script: its `#!` line, or `bash`.
pub(crate) fn setup_interpreter(script: &[u8]) -> SandboxResult<Vec<String>> {
    let first_line = script.split(|b| *b == b'\n').next().unwrap_or_default();
    let Some(directive) = first_line.strip_prefix(b"#!") else {
        return Ok(vec!["bash".to_string()]);
    };
    let directive = std::str::from_utf8(directive)
        .map_err(|_| SandboxError::provisioning("setup interpreter line is not valid UTF-8"))?
        .trim();
    let argv = shell_words::split(directive).map_err(|e| {
        SandboxError::provisioning(format!("malformed setup interpreter '#!{directive}': {e}"))
    })?;
    if argv.is_empty() {
        return Err(SandboxError::provisioning("setup interpreter line names no program"));
    }
    Ok(argv)
}
