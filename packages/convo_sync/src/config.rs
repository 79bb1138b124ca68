use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::framing::DEFAULT_MAX_FRAME_BYTES;
use crate::reconciliation::DEFAULT_MATCH_WINDOW_SECS;

// =============================================================================
// File config (figment-deserialized from defaults / convo.toml / env vars)
// =============================================================================
//
//   convo.toml:      [channel]
//                    reconnect_delay_secs = 5
//
//   env var:         CONVO_CHANNEL__RECONNECT_DELAY_SECS=5   (double underscore = nesting)

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "convo.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
}

/// Where the chat backend lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as `Authorization: Bearer …` on every request.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Push channel and reconciliation knobs (`[channel]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    /// Fixed wait between a dropped connection and the next attempt.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Tolerance between a provisional message and its server echo.
    #[serde(default = "default_match_window_secs")]
    pub match_window_secs: u64,
    /// Pending provisional entries older than this are abandoned.
    #[serde(default = "default_provisional_ttl_secs")]
    pub provisional_ttl_secs: u64,
    #[serde(default = "default_notice_capacity")]
    pub notice_capacity: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            match_window_secs: default_match_window_secs(),
            provisional_ttl_secs: default_provisional_ttl_secs(),
            notice_capacity: default_notice_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_match_window_secs() -> u64 {
    DEFAULT_MATCH_WINDOW_SECS as u64
}
fn default_provisional_ttl_secs() -> u64 {
    300
}
fn default_notice_capacity() -> usize {
    256
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

/// Build a figment that layers: defaults → config file → CONVO_* env vars.
///
/// `config_path` overrides the default `./convo.toml`; a missing file is not
/// an error.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("CONVO_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub channel: ChannelConfig,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            server: ServerConfig::from_file(&fc.server),
            channel: ChannelConfig::from_file(&fc.channel),
        }
    }

    /// Load and resolve configuration from all layers.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc: FileConfig = load_config(config_path).extract()?;
        Ok(Self::from_file(&fc))
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            base_url: fc.base_url.clone(),
            auth_token: fc.auth_token.clone().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}

/// Runtime view of `[channel]`.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub reconnect_delay: Duration,
    pub match_window: chrono::Duration,
    pub provisional_ttl: chrono::Duration,
    pub notice_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    pub fn from_file(fc: &ChannelFileConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_secs(fc.reconnect_delay_secs),
            match_window: secs_to_chrono(fc.match_window_secs),
            provisional_ttl: secs_to_chrono(fc.provisional_ttl_secs),
            // broadcast::channel panics on zero capacity
            notice_capacity: fc.notice_capacity.max(1),
            max_frame_bytes: fc.max_frame_bytes,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_file(&ChannelFileConfig::default())
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    const MAX_SECS: u64 = (i64::MAX / 1000) as u64;
    chrono::Duration::seconds(secs.min(MAX_SECS) as i64)
}
