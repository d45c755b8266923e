//! # bridge-settings
//!
//! Layered configuration for the bridge:
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **Settings file**: `~/.bridge/settings.json` or an explicit path (deep-merged)
//! 3. **Environment variables**: `BRIDGE_*` overrides (highest priority)
//!
//! Settings are loaded once by the binary and passed down explicitly; there is
//! no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, load_file_layer, load_settings, load_settings_from_path,
    settings_path, validate,
};
pub use types::*;
