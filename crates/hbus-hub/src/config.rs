//! Hub configuration.
//!
//! Loaded from a YAML file; every section and field has a default, so an
//! empty file is a valid configuration. Command line flags override the
//! file after loading.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{
    parse_mac, BridgeConfig, EnvToken, FirstOf, SettingsFile, StaticToken, TokenSource,
};
use crate::mode::ModeConfig;

/// Errors loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File unreadable.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid YAML for this schema.
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Full hub configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    /// Router bus.
    pub bus: BusConfig,
    /// Automation backend.
    pub backend: BackendConfig,
    /// This hub.
    pub hub: HubSection,
}

/// Router bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Serial device path or `tcp://host:port` bridge.
    pub endpoint: String,
    /// Line speed of a serial device.
    pub baud: u32,
    /// Router id.
    pub router: u8,
    /// Request mirror updates in operate mode.
    pub mirror: bool,
    /// Request discrete events in operate mode.
    pub events: bool,
    /// Reply deadline in milliseconds.
    pub reply_timeout_ms: u64,
    /// Event stream stop grace period in milliseconds.
    pub stop_grace_ms: u64,
    /// First delay before operate mode is recovered after a fault, in
    /// milliseconds.
    pub recover_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            endpoint: "/dev/serial0".to_string(),
            baud: crate::transport::DEFAULT_BAUD,
            router: hbus_protocol::DEFAULT_ROUTER_ID,
            mirror: true,
            events: true,
            reply_timeout_ms: 3000,
            stop_grace_ms: 2000,
            recover_delay_ms: 1000,
        }
    }
}

/// Automation backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Websocket URL; derived from the client address when unset.
    pub url: Option<String>,
    /// Fixed access token.
    pub token: Option<String>,
    /// Environment variable holding the access token.
    pub token_env: String,
    /// Pairing settings file holding the access token.
    pub settings_file: Option<PathBuf>,
    /// Ping interval in seconds.
    pub keepalive_secs: u64,
    /// Reply deadline in milliseconds.
    pub reply_timeout_ms: u64,
    /// Handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Test-mode buffer capacity.
    pub buffer_len: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: None,
            token: None,
            token_env: crate::bridge::SUPERVISOR_TOKEN_VAR.to_string(),
            settings_file: None,
            keepalive_secs: 30,
            reply_timeout_ms: 5000,
            handshake_timeout_ms: 10_000,
            buffer_len: 1000,
        }
    }
}

/// Settings of this hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubSection {
    /// Identifier sent with every event, usually the hub's address.
    pub uid: Option<String>,
    /// MAC address used to unscramble the pairing token.
    pub mac: Option<String>,
    /// Client address known at startup.
    pub client: Option<IpAddr>,
    /// Operate without a client and buffer events.
    pub test_mode: bool,
    /// Prometheus listen address.
    pub metrics_addr: Option<SocketAddr>,
}

impl HubConfig {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(HubConfig::default());
        }
        let config: HubConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.endpoint.is_empty() {
            return Err(ConfigError::Invalid {
                field: "bus.endpoint",
                reason: "empty".into(),
            });
        }
        if self.bus.baud == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.baud",
                reason: "must be positive".into(),
            });
        }
        if self.bus.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "bus.reply_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.backend.keepalive_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "backend.keepalive_secs",
                reason: "must be positive".into(),
            });
        }
        if let Some(mac) = &self.hub.mac {
            if parse_mac(mac).is_none() {
                return Err(ConfigError::Invalid {
                    field: "hub.mac",
                    reason: format!("'{}' is not a MAC address", mac),
                });
            }
        }
        Ok(())
    }

    /// Mode controller settings.
    pub fn mode_config(&self) -> ModeConfig {
        ModeConfig {
            router: self.bus.router,
            mirror: self.bus.mirror,
            events: self.bus.events,
            ack_timeout: Duration::from_millis(self.bus.reply_timeout_ms),
            stop_grace: Duration::from_millis(self.bus.stop_grace_ms),
            test_mode: self.hub.test_mode,
            recover_delay: Duration::from_millis(self.bus.recover_delay_ms),
        }
    }

    /// Notification bridge settings.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            url: self.backend.url.clone(),
            hub_uid: self.hub.uid.clone().unwrap_or_default(),
            keepalive: Duration::from_secs(self.backend.keepalive_secs),
            reply_timeout: Duration::from_millis(self.backend.reply_timeout_ms),
            handshake_timeout: Duration::from_millis(self.backend.handshake_timeout_ms),
            settings: self.settings_file(),
            test_mode: self.hub.test_mode,
            buffer_len: self.backend.buffer_len,
        }
    }

    /// Pairing settings file, if configured.
    pub fn settings_file(&self) -> Option<SettingsFile> {
        let path = self.backend.settings_file.as_ref()?;
        let mac = self.hub.mac.as_deref().and_then(parse_mac);
        Some(SettingsFile::new(path.clone(), mac))
    }

    /// Client address known at startup: configured, else recorded in the
    /// settings file.
    pub fn startup_client(&self) -> Option<IpAddr> {
        if self.hub.client.is_some() {
            return self.hub.client;
        }
        let settings = self.settings_file()?.load().ok()?;
        settings.client_addr?.trim().parse().ok()
    }

    /// Token sources in order of preference: fixed token, environment,
    /// settings file.
    pub fn token_source(&self) -> Box<dyn TokenSource> {
        let mut sources: Vec<Box<dyn TokenSource>> = Vec::new();
        if let Some(token) = &self.backend.token {
            sources.push(Box::new(StaticToken(token.clone())));
        }
        sources.push(Box::new(EnvToken::new(self.backend.token_env.clone())));
        if let Some(settings) = self.settings_file() {
            sources.push(Box::new(settings));
        }
        Box::new(FirstOf(sources))
    }
}
