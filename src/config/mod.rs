//! Broker configuration: the `mcp_config.json` provider list.
//!
//! Loaded exactly once at startup; immutable for the broker's lifetime.
//! Provider iteration order follows the JSON object order in the file,
//! which is what makes "first provider wins" routing deterministic.

use crate::errors::StructuredError;
use serde::Deserialize;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;
use thiserror::Error;
use tracing::{debug, info};

/// Default configuration file path, relative to the working directory.
pub const CONFIG_PATH: &str = "mcp_config.json";

static ENV_LOADER: Once = Once::new();

/// Loads environment variables from a local `.env` once, before any
/// provider environment is merged.
pub fn ensure_env_loaded() {
    ENV_LOADER.call_once(|| {
        let _ = dotenvy::dotenv();
    });
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path:?}")]
    NotFound { path: PathBuf },

    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("field 'command' must be a non-empty string in server '{server}'")]
    EmptyCommand { path: PathBuf, server: String },
}

impl ConfigError {
    fn path(&self) -> &Path {
        match self {
            ConfigError::NotFound { path }
            | ConfigError::Io { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::EmptyCommand { path, .. } => path,
        }
    }
}

impl From<ConfigError> for StructuredError {
    fn from(err: ConfigError) -> Self {
        let path = err.path().to_string_lossy().into_owned();
        StructuredError::config(err.to_string(), &path)
    }
}

/// One configured tool provider. Uniquely keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawProvider {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: ProviderList,
}

/// `mcpServers` object deserialized entry by entry so the file's key
/// order survives (a plain map type would reorder it).
#[derive(Debug, Default)]
struct ProviderList(Vec<(String, RawProvider)>);

impl<'de> Deserialize<'de> for ProviderList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProviderListVisitor;

        impl<'de> Visitor<'de> for ProviderListVisitor {
            type Value = ProviderList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of server name to server configuration")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((name, provider)) = access.next_entry::<String, RawProvider>()? {
                    if entries.iter().any(|(existing, _)| *existing == name) {
                        return Err(de::Error::custom(format!(
                            "duplicate server name '{name}'"
                        )));
                    }
                    entries.push((name, provider));
                }
                Ok(ProviderList(entries))
            }
        }

        deserializer.deserialize_map(ProviderListVisitor)
    }
}

fn expand(value: &str) -> String {
    shellexpand::full(value)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

impl ProviderConfig {
    fn from_raw(name: String, raw: RawProvider) -> Self {
        Self {
            name,
            command: expand(&raw.command),
            args: raw.args.iter().map(|arg| expand(arg)).collect(),
            env: raw
                .env
                .into_iter()
                .map(|(key, value)| (key, expand(&value)))
                .collect(),
        }
    }
}

/// Load and validate the provider list. A missing file is seeded from
/// the adjacent `.sample` copy when one exists.
pub fn load_providers(path: Option<&Path>) -> Result<Vec<ProviderConfig>, ConfigError> {
    ensure_env_loaded();
    let path = path.unwrap_or_else(|| Path::new(CONFIG_PATH));
    debug!(path = %path.display(), "Reading broker configuration file");

    if !path.exists() {
        let sample = sample_path(path);
        if sample.exists() {
            fs::copy(&sample, path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "Configuration created from sample file");
        } else {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut providers = Vec::with_capacity(parsed.mcp_servers.0.len());
    for (name, raw) in parsed.mcp_servers.0 {
        if raw.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                path: path.to_path_buf(),
                server: name,
            });
        }
        providers.push(ProviderConfig::from_raw(name, raw));
    }
    Ok(providers)
}

fn sample_path(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push(".sample");
    PathBuf::from(os_string)
}
