//! Server configuration with TOML support
//!
//! Unified configuration for the HTTP surface and the engine, loadable
//! from a TOML file with environment variable overrides on top.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Complete server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccelConfig {
    pub server: ServerConfig,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host (localhost-only by default)
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Object store root for converted bundles
    pub data_dir: String,
    /// Default quantization when the descriptor does not pin one
    pub default_quant: String,
    /// Token streaming channel capacity
    pub token_channel_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            default_quant: "q4".to_string(),
            token_channel_size: 256,
        }
    }
}

impl AccelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        toml::from_str(&contents).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Load from `ACCEL_CONFIG` (if set) or defaults, then apply env overrides
    pub fn load() -> Self {
        let mut config = if let Ok(path) = std::env::var("ACCEL_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    info!("Loaded config from {}", path);
                    cfg
                }
                Err(e) => {
                    warn!("Failed to load config: {}, using defaults", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if std::env::var("ENABLE_CORS").unwrap_or_default() == "true" {
            self.server.enable_cors = true;
        }
        if let Ok(dir) = std::env::var("ACCEL_DATA_DIR") {
            self.engine.data_dir = dir;
        }
        if let Ok(quant) = std::env::var("ACCEL_QUANT") {
            self.engine.default_quant = quant;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.host.is_empty() {
            return Err("server host must not be empty".into());
        }
        if self.server.port == 0 {
            return Err("server port must be non-zero".into());
        }
        if self.engine.token_channel_size == 0 {
            return Err("token channel size must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AccelConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: AccelConfig = toml::from_str(
            r#"
            [server]
            port = 9090

            [engine]
            default_quant = "q8"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.engine.default_quant, "q8");
    }
}
