use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::err::proxy_error::ProxyError;
use crate::err::PResult;
use crate::{DEFAULT_WRITEQ_HIGH_WATER, DEFAULT_WRITEQ_LOW_WATER};

/// Proxy 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Number of worker threads. 0 means one per available core.
    #[serde(default)]
    pub threads: usize,

    /// Write queue high watermark, bytes.
    #[serde(default = "default_high_water")]
    pub writeq_high_water: u64,

    /// Write queue low watermark, bytes.
    #[serde(default = "default_low_water")]
    pub writeq_low_water: u64,

    #[serde(default)]
    pub listener: Vec<ListenerConfig>,

    /// Log-event overrides, keyed by the full `event.<name>.<property>`
    /// string, e.g. `"event.authentication_failure.level" = "LOG_WARNING"`.
    #[serde(default)]
    pub events: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub name: String,

    #[serde(default = "default_address")]
    pub address: String,

    pub port: u16,

    /// Networks that are allowed to send a proxy-protocol preamble.
    /// Comma-separated CIDR list, `*` for any, empty to disable.
    #[serde(default)]
    pub proxy_protocol_networks: String,

    /// PEM paths. Both must be present for TLS to be offered.
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
}

fn default_high_water() -> u64 {
    DEFAULT_WRITEQ_HIGH_WATER
}

fn default_low_water() -> u64 {
    DEFAULT_WRITEQ_LOW_WATER
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            threads: 0,
            writeq_high_water: DEFAULT_WRITEQ_HIGH_WATER,
            writeq_low_water: DEFAULT_WRITEQ_LOW_WATER,
            listener: Vec::new(),
            events: BTreeMap::new(),
        }
    }
}

impl ProxyConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> PResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        ProxyConfig::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> PResult<Self> {
        let config: ProxyConfig = toml::from_str(text)
            .map_err(|e| ProxyError::ConfigFileParseErr(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of workers after resolving the "one per core" default.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    fn validate(&self) -> PResult<()> {
        if self.writeq_low_water == 0 || self.writeq_high_water == 0 {
            return Err(ProxyError::ConfigFileParseErr(
                "writeq watermarks must be non-zero".to_string(),
            ));
        }
        if self.writeq_low_water >= self.writeq_high_water {
            return Err(ProxyError::ConfigFileParseErr(format!(
                "writeq_low_water ({}) must be below writeq_high_water ({})",
                self.writeq_low_water, self.writeq_high_water
            )));
        }
        for listener in &self.listener {
            if listener.ssl_cert.is_some() != listener.ssl_key.is_some() {
                return Err(ProxyError::ConfigFileParseErr(format!(
                    "listener '{}': ssl_cert and ssl_key must be set together",
                    listener.name
                )));
            }
        }
        Ok(())
    }
}
