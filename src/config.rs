use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Prefix for environment overrides, e.g. `WSPROXY_SERVER__PORT=9090`.
const ENV_PREFIX: &str = "WSPROXY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub interception: InterceptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub target_url: String,
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub pretty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Value of the `type` field that marks a message for replacement.
    pub sentinel_type: String,
    /// JSON document sent in place of intercepted messages. The built-in
    /// agent settings are used when unset.
    pub replacement_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            target_url: "ws://localhost:9000".to_string(),
            shutdown_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            pretty: true,
        }
    }
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            sentinel_type: "Settings".to_string(),
            replacement_file: None,
        }
    }
}

impl Config {
    /// Build the configuration from defaults, an optional file and
    /// `WSPROXY_*` environment variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            let path = path
                .to_str()
                .ok_or_else(|| Error::invalid_config(format!("non UTF-8 config path: {}", path.display())))?;
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    pub fn validate(&self) -> Result<()> {
        let target = url::Url::parse(&self.server.target_url)?;
        if !matches!(target.scheme(), "ws" | "wss") {
            return Err(Error::invalid_config(format!(
                "target URL must use ws:// or wss://, got {}",
                self.server.target_url
            )));
        }

        if self.interception.sentinel_type.is_empty() {
            return Err(Error::invalid_config("sentinel type must not be empty"));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_timeout_ms)
    }
}

impl InterceptionConfig {
    /// Resolve the replacement document. It must be a JSON object.
    pub fn load_replacement(&self) -> Result<serde_json::Value> {
        let document = match &self.replacement_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str(&content)?
            }
            None => default_replacement(),
        };

        if !document.is_object() {
            return Err(Error::invalid_config("replacement payload must be a JSON object"));
        }

        Ok(document)
    }
}

/// Agent settings substituted for intercepted messages when no file is
/// configured.
pub fn default_replacement() -> serde_json::Value {
    json!({
        "type": "Settings",
        "audio": {
            "input": {
                "encoding": "linear16",
                "sample_rate": 24000
            },
            "output": {
                "encoding": "linear16",
                "sample_rate": 24000
            }
        },
        "agent": {
            "language": "en",
            "listen": {
                "provider": {
                    "type": "deepgram",
                    "model": "nova-3"
                }
            },
            "think": {
                "provider": {
                    "type": "open_ai",
                    "model": "gpt-4o-mini",
                    "temperature": 0.7
                }
            },
            "speak": {
                "provider": {
                    "type": "deepgram",
                    "model": "aura-2-thalia-en"
                }
            }
        }
    })
}
