//! Layered configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults, including the built-in [presets](builtin_presets).
//! 2. The user configuration file, `fanout/config.toml` in the platform
//!    configuration directory.
//! 3. A file given explicitly (TOML, YAML or JSON, chosen by extension).
//! 4. [`Overrides`] from the command line.
//!
//! Environment variables are not consulted.
//!
//! ```toml
//! concurrency = 8
//! timeout = 30
//! hasher = "auto"
//!
//! [presets.thumbs]
//! command = ["convert", "{{ item }}", "-thumbnail", "{{ args.0 }}", "{{ with_ext(item, \"thumb.png\") }}"]
//! params = ["size"]
//! description = "Thumbnail every image"
//! ```

pub mod error;
mod preset;

pub use crate::preset::{Preset, builtin_presets};
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Worker slots. Defaults to the number of logical CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<NonZeroUsize>,
    /// Per-item timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Bytes of stdout and stderr kept per item. Defaults to the
    /// dispatcher's limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_limit: Option<usize>,
    /// `blake3`, `auto`, or a hashing command line.
    pub hasher: String,
    pub presets: BTreeMap<String, Preset>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: None,
            timeout: None,
            output_limit: None,
            hasher: "blake3".to_string(),
            presets: builtin_presets(),
        }
    }
}

impl Config {
    pub fn concurrency(&self) -> NonZeroUsize {
        self.concurrency.unwrap_or_else(fanout_template::default_concurrency)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn preset(&self, name: &str) -> Result<&Preset> {
        self.presets.get(name).ok_or_raise(|| ErrorKind::UnknownPreset(name.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout == Some(0) {
            exn::bail!(ErrorKind::InvalidTimeout);
        }
        for (name, preset) in &self.presets {
            preset.validate(name)?;
        }
        Ok(())
    }
}

/// Settings given on the command line. Unset fields leave the configured
/// value alone.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<NonZeroUsize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hasher: Option<String>,
}

/// Location of the per-user configuration file, if the platform has one.
pub fn user_config_file() -> Option<PathBuf> {
    ProjectDirs::from("", "", "fanout").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Builds a [`Config`] from its layers.
#[derive(Clone, Debug)]
pub struct Loader {
    user_file: Option<PathBuf>,
    explicit: Option<PathBuf>,
}

impl Default for Loader {
    fn default() -> Self {
        Self { user_file: user_config_file(), explicit: None }
    }
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces (or with `None`, skips) the user configuration file.
    pub fn with_user_file(mut self, path: Option<PathBuf>) -> Self {
        self.user_file = path;
        self
    }

    /// Adds a file that must exist.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    pub fn load(&self, overrides: &Overrides) -> Result<Config> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &self.user_file {
            tracing::debug!(path = %path.display(), exists = path.exists(), "User configuration");
            figment = figment.merge(Toml::file(path));
        }
        if let Some(path) = &self.explicit {
            figment = merge_file(figment, path)?;
        }
        figment = figment.merge(Serialized::defaults(overrides));
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    if !path.is_file() {
        exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
    }
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    tracing::debug!(path = %path.display(), "Loading configuration file");
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}
