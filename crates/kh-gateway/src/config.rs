//! Layered gateway configuration: TOML file, environment, CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kh_core::PipelineConfig;

use crate::cli::Args;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_nprofile_max_relays() -> usize {
    3
}

fn default_secret_key_file() -> PathBuf {
    PathBuf::from("keyhole.key")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Origin URL prefix; must be http:// or https://.
    pub destination: String,

    /// Relay URLs to subscribe and publish on.
    pub relays: Vec<String>,

    /// Route glob patterns; `!` prefix denies.
    #[serde(default)]
    pub allowed_routes: Vec<String>,

    /// Origin request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Cap on relay hints in the published nprofile.
    #[serde(default = "default_nprofile_max_relays")]
    pub nprofile_max_relays: usize,

    /// Where the long-lived secret lives.
    #[serde(default = "default_secret_key_file")]
    pub secret_key_file: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            relays: Vec::new(),
            allowed_routes: Vec::new(),
            timeout_ms: default_timeout_ms(),
            nprofile_max_relays: default_nprofile_max_relays(),
            secret_key_file: default_secret_key_file(),
        }
    }
}

impl GatewayConfig {
    /// Resolve the effective configuration from file, environment, and CLI,
    /// in that order of increasing precedence.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(dest) = std::env::var("KH_DESTINATION") {
            self.destination = dest;
        }
        if let Ok(relays) = std::env::var("KH_RELAYS") {
            self.relays = relays
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(path) = std::env::var("KH_SECRET_KEY_FILE") {
            self.secret_key_file = PathBuf::from(path);
        }
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(dest) = &args.destination {
            self.destination = dest.clone();
        }
        if !args.relays.is_empty() {
            self.relays = args.relays.clone();
        }
        if !args.allowed_routes.is_empty() {
            self.allowed_routes = args.allowed_routes.clone();
        }
        if let Some(timeout) = args.timeout_ms {
            self.timeout_ms = timeout;
        }
        if let Some(cap) = args.nprofile_max_relays {
            self.nprofile_max_relays = cap;
        }
        if let Some(path) = &args.secret_key_file {
            self.secret_key_file = path.clone();
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.destination.starts_with("http://") && !self.destination.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "destination must start with http:// or https://, got {:?}",
                self.destination
            )));
        }
        if self.relays.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one relay is required".into(),
            ));
        }
        for relay in &mut self.relays {
            let parsed = url::Url::parse(relay).map_err(|e| {
                ConfigError::ValidationError(format!("invalid relay url {relay:?}: {e}"))
            })?;
            match parsed.scheme() {
                "ws" | "wss" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "relay {relay:?} has unsupported scheme {other:?}"
                    )))
                }
            }
            // Normalized form, without any trailing slash noise.
            *relay = parsed.as_str().trim_end_matches('/').to_string();
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            destination: self.destination.clone(),
            relays: self.relays.clone(),
            allowed_routes: self.allowed_routes.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            nprofile_max_relays: self.nprofile_max_relays,
        }
    }
}
