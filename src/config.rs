//! Configuration loading and precondition checks

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, WebhookError};

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 900;

/// Caller IPs allowed to trigger a build. Accepts a single pattern or a list.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum AuthorizedIps {
    Single(String),
    List(Vec<String>),
}

impl AuthorizedIps {
    pub fn patterns(&self) -> &[String] {
        match self {
            AuthorizedIps::Single(pattern) => std::slice::from_ref(pattern),
            AuthorizedIps::List(patterns) => patterns,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_bin")]
    pub bin: PathBuf,
    #[serde(default = "default_json")]
    pub json: PathBuf,
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,
    pub user: Option<String>,
    pub secret: Option<String>,
    pub authorized_ips: Option<AuthorizedIps>,
    pub bind_address: Option<String>,
    pub build_timeout: Option<u64>,
    pub log_dir: Option<PathBuf>,
}

fn default_bin() -> PathBuf {
    PathBuf::from("bin/satis")
}

fn default_json() -> PathBuf {
    PathBuf::from("satis.json")
}

fn default_webroot() -> PathBuf {
    PathBuf::from("web/")
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bin: default_bin(),
            json: default_json(),
            webroot: default_webroot(),
            user: None,
            secret: None,
            authorized_ips: None,
            bind_address: None,
            build_timeout: None,
            log_dir: None,
        }
    }
}

impl WebhookConfig {
    /// Parse a YAML document, filling unset keys with the defaults.
    /// An empty document yields the defaults.
    pub fn from_yaml(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(source)
            .map_err(|e| WebhookError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Returns the bind address, `BIND_ADDRESS` taking precedence over the file.
    pub fn bind_address(&self) -> String {
        std::env::var("BIND_ADDRESS")
            .ok()
            .or_else(|| self.bind_address.clone())
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    /// Returns the build timeout, `None` when disabled with `build_timeout: 0`.
    pub fn build_timeout(&self) -> Option<Duration> {
        match self.build_timeout.unwrap_or(DEFAULT_BUILD_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Collects every missing path before reporting, in bin, json, webroot order.
    pub fn check_preconditions(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !self.bin.exists() {
            errors.push("The Satis bin could not be found.".to_string());
        }
        if !self.json.exists() {
            errors.push("The satis.json file could not be found.".to_string());
        }
        if !self.webroot.exists() {
            errors.push("The webroot directory could not be found.".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WebhookError::PreconditionFailed(errors))
        }
    }
}

/// Load and parse the configuration file
pub async fn load_config(path: impl AsRef<Path>) -> Result<WebhookConfig> {
    let path = path.as_ref();
    let source = match tokio::fs::read_to_string(path).await {
        Ok(source) => source,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WebhookError::ConfigurationMissing {
                path: path.to_string_lossy().into_owned(),
            });
        }
        Err(e) => {
            return Err(WebhookError::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            )));
        }
    };

    let config = WebhookConfig::from_yaml(&source)?;
    debug!("Loaded config from {:?}: {:?}", path, config);
    Ok(config)
}
