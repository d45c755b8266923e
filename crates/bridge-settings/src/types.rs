//! Settings types. Every section has compiled defaults so a partial JSON file
//! only needs to name what it changes.

use std::time::Duration;

use bridge_core::ApiKey;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeSettings {
    pub server: ServerSettings,
    pub backend: BackendSettings,
    pub sessions: SessionSettings,
    pub logging: LoggingSettings,
}

/// Management API listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Shared secret callers present in `X-API-Key`.
    pub api_key: ApiKey,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            api_key: ApiKey::new("bridge-secret-key"),
            request_timeout_secs: 30,
        }
    }
}

/// The backend that stores credentials and receives webhooks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendSettings {
    pub base_url: String,
    pub api_key: ApiKey,
    pub timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/channel/whatsapp".into(),
            api_key: ApiKey::new("bridge-secret-key"),
            timeout_ms: 10_000,
        }
    }
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session lifecycle tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    pub reconnect_delay_ms: u64,
    pub key_flush_ms: u64,
    pub restore_spacing_ms: u64,
    pub event_buffer: usize,
    pub command_buffer: usize,
    /// Websocket base URL of the protocol sidecar.
    pub sidecar_url: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            key_flush_ms: 500,
            restore_spacing_ms: 2_000,
            event_buffer: 256,
            command_buffer: 32,
            sidecar_url: "ws://127.0.0.1:3002".into(),
        }
    }
}

impl SessionSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn key_flush_window(&self) -> Duration {
        Duration::from_millis(self.key_flush_ms)
    }

    pub fn restore_spacing(&self) -> Duration {
        Duration::from_millis(self.restore_spacing_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}
