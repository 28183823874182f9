use crate::apk::archive::{ReplacementLayout, DEFAULT_STORED_SUFFIXES};
use crate::apk::sign::{SchemePolicy, SignOptions, DEFAULT_CREATED_BY, DEFAULT_SIGNER_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Looked up in the working directory unless `--config` names another file.
pub const CONFIG_FILE: &str = "apkpatch.toml";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct RepackConfig {
    /// Every group carries `#[serde(default)]`: a group that fails to parse
    /// must not reset unrelated groups as well.
    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub layout: LayoutConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    /// Directory holding `app_key.pk8` and `app_cert.pem`.
    #[serde(default = "default_key_store")]
    pub key_store: PathBuf,
    #[serde(default = "default_min_sdk")]
    pub min_sdk: u32,
    #[serde(default)]
    pub v4_enabled: bool,
    #[serde(default = "default_signer_name")]
    pub signer_name: String,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_key_store() -> PathBuf {
    PathBuf::from("keystore")
}

fn default_min_sdk() -> u32 {
    24
}

fn default_signer_name() -> String {
    DEFAULT_SIGNER_NAME.to_string()
}

fn default_created_by() -> String {
    DEFAULT_CREATED_BY.to_string()
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_store: default_key_store(),
            min_sdk: default_min_sdk(),
            v4_enabled: false,
            signer_name: default_signer_name(),
            created_by: default_created_by(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LayoutConfig {
    /// Replacement paths ending in one of these are stored uncompressed.
    #[serde(default = "default_stored_suffixes")]
    pub stored_suffixes: Vec<String>,
}

fn default_stored_suffixes() -> Vec<String> {
    DEFAULT_STORED_SUFFIXES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            stored_suffixes: default_stored_suffixes(),
        }
    }
}

impl RepackConfig {
    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            min_sdk: self.signing.min_sdk,
            policy: SchemePolicy::new(self.signing.v4_enabled),
            signer_name: self.signing.signer_name.clone(),
            created_by: self.signing.created_by.clone(),
        }
    }

    pub fn replacement_layout(&self) -> ReplacementLayout {
        ReplacementLayout::new(self.layout.stored_suffixes.iter().cloned())
    }
}

/// A missing file yields the defaults. So does a malformed one, with a
/// warning, so the user can fix it and run again.
pub fn parse_config(full_config_path: &Path) -> RepackConfig {
    let content = match fs::read_to_string(full_config_path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(
                "no config at `{}`, using defaults",
                full_config_path.display()
            );
            return RepackConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "cannot read config `{}`: {}",
                full_config_path.display(),
                err
            );
            return RepackConfig::default();
        }
    };
    match toml::from_str::<RepackConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "malformed config `{}`, using defaults: {}",
                full_config_path.display(),
                err
            );
            RepackConfig::default()
        }
    }
}
