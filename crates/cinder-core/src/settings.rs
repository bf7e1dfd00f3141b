//! # Settings
//!
//! Named key/value overrides consumed by the submission engine.
//!
//! Loading settings from files or the command line happens outside this
//! crate; the engine only sees a [`ConfigProvider`] and resolves the few
//! flags it needs into a [`DebugSettings`] snapshot when a device is
//! created.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};

use crate::error::{Error, Result};

// =============================================================================
// CONFIG VALUE
// =============================================================================

/// Configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Unsigned integer
    Uint(u64),
    /// String
    String(String),
}

impl ConfigValue {
    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as int (unsigned values that fit are accepted)
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Get as uint (non-negative ints are accepted)
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ConfigValue::Uint(u) => Some(*u),
            ConfigValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }
}

// =============================================================================
// CONFIG PROVIDER
// =============================================================================

/// Configuration provider trait
pub trait ConfigProvider: Send + Sync {
    /// Get a configuration value
    fn get(&self, key: &str) -> Option<ConfigValue>;

    /// Get with default
    fn get_or(&self, key: &str, default: ConfigValue) -> ConfigValue {
        self.get(key).unwrap_or(default)
    }

    /// Get bool with default
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Get int with default
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.as_int()).unwrap_or(default)
    }

    /// Get uint with default
    fn get_uint(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.as_uint()).unwrap_or(default)
    }

    /// Get string with default
    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| default.to_string())
    }
}

/// Simple in-memory config provider
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl MemoryConfig {
    /// Create empty config
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Set a value
    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.values.insert(key.into(), value);
    }

    /// Set bool
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, ConfigValue::Bool(value));
    }

    /// Set int
    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, ConfigValue::Int(value));
    }

    /// Set uint
    pub fn set_uint(&mut self, key: impl Into<String>, value: u64) {
        self.set(key, ConfigValue::Uint(value));
    }

    /// Set string
    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, ConfigValue::String(value.into()));
    }

    /// Number of stored overrides
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if no override is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigProvider for MemoryConfig {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.get(key).cloned()
    }
}

// =============================================================================
// RESOLVED SETTINGS
// =============================================================================

/// Setting keys read by the engine
pub mod keys {
    /// Preemption mode override (-1 keeps the device default)
    pub const FORCE_PREEMPTION_MODE: &str = "ForcePreemptionMode";
    /// Receivers track dependency nodes per flush
    pub const ENABLE_TIMESTAMP_PACKET: &str = "EnableTimestampPacket";
    /// Every flush waits for completion
    pub const MAKE_EACH_ENQUEUE_BLOCKING: &str = "MakeEachEnqueueBlocking";
    /// Treat every memory object as needing explicit transfers
    pub const DISABLE_ZERO_COPY: &str = "DisableZeroCopy";
    /// Receiver ring size in bytes
    pub const CSR_COMMAND_STREAM_SIZE: &str = "CsrCommandStreamSize";
    /// Completion tag value before the first flush completes
    pub const INITIAL_HARDWARE_TAG: &str = "InitialHardwareTag";
    /// Printf capture buffer size in bytes
    pub const PRINTF_BUFFER_SIZE: &str = "PrintfBufferSize";
}

/// Flags the engine reads from the settings source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSettings {
    /// Preemption override, `-1` when unset
    pub force_preemption_mode: i64,
    /// Track dependency nodes in receivers
    pub enable_timestamp_packet: bool,
    /// Force blocking waits after every flush
    pub make_each_enqueue_blocking: bool,
    /// Disable zero-copy memory objects
    pub disable_zero_copy: bool,
    /// Receiver ring size in bytes
    pub csr_command_stream_size: u64,
    /// Initial completion tag value
    pub initial_hardware_tag: u32,
    /// Printf capture buffer size
    pub printf_buffer_size: u64,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            force_preemption_mode: -1,
            enable_timestamp_packet: false,
            make_each_enqueue_blocking: false,
            disable_zero_copy: false,
            csr_command_stream_size: 64 * 1024,
            initial_hardware_tag: 0,
            printf_buffer_size: 1024 * 1024,
        }
    }
}

impl DebugSettings {
    /// Resolve settings from a provider, falling back to defaults
    ///
    /// Values stored with the wrong type are ignored with a warning.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        let defaults = Self::default();

        let force_preemption_mode = typed(provider, keys::FORCE_PREEMPTION_MODE, ConfigValue::as_int)
            .unwrap_or(defaults.force_preemption_mode);
        let enable_timestamp_packet =
            typed(provider, keys::ENABLE_TIMESTAMP_PACKET, ConfigValue::as_bool)
                .unwrap_or(defaults.enable_timestamp_packet);
        let make_each_enqueue_blocking =
            typed(provider, keys::MAKE_EACH_ENQUEUE_BLOCKING, ConfigValue::as_bool)
                .unwrap_or(defaults.make_each_enqueue_blocking);
        let disable_zero_copy = typed(provider, keys::DISABLE_ZERO_COPY, ConfigValue::as_bool)
            .unwrap_or(defaults.disable_zero_copy);
        let csr_command_stream_size =
            typed(provider, keys::CSR_COMMAND_STREAM_SIZE, ConfigValue::as_uint)
                .unwrap_or(defaults.csr_command_stream_size);
        let initial_hardware_tag = typed(provider, keys::INITIAL_HARDWARE_TAG, ConfigValue::as_uint)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(defaults.initial_hardware_tag);
        let printf_buffer_size = typed(provider, keys::PRINTF_BUFFER_SIZE, ConfigValue::as_uint)
            .unwrap_or(defaults.printf_buffer_size);

        Self {
            force_preemption_mode,
            enable_timestamp_packet,
            make_each_enqueue_blocking,
            disable_zero_copy,
            csr_command_stream_size,
            initial_hardware_tag,
            printf_buffer_size,
        }
    }
}

/// Read a typed value, `Err` when the key holds a value of another type
pub fn get_checked<T>(
    provider: &dyn ConfigProvider,
    key: &str,
    convert: fn(&ConfigValue) -> Option<T>,
) -> Result<Option<T>> {
    match provider.get(key) {
        None => Ok(None),
        Some(value) => convert(&value).map(Some).ok_or(Error::SettingTypeMismatch),
    }
}

fn typed<T>(
    provider: &dyn ConfigProvider,
    key: &str,
    convert: fn(&ConfigValue) -> Option<T>,
) -> Option<T> {
    match get_checked(provider, key, convert) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("setting {}: {}, using default", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_absent() {
        let config = MemoryConfig::new();
        assert!(!config.get_bool("BoolSettingNotExisting", false));
        assert_eq!(config.get_int("IntSettingNotExisting", 123), 123);
        assert_eq!(config.get_str("StringSettingNotExisting", "ABCD"), "ABCD");
    }

    #[test]
    fn test_string_followed_by_int() {
        let mut config = MemoryConfig::new();
        config.set_string("StringTestKey", "TestValue");
        config.set_int("IntTestKey", 1);
        assert_eq!(config.get_int("IntTestKey", 0), 1);
        assert_eq!(config.get_str("StringTestKey", ""), "TestValue");
        assert_eq!(config.len(), 2);
    }

    #[test]
    fn test_resolve_debug_settings() {
        let mut config = MemoryConfig::new();
        config.set_int(keys::FORCE_PREEMPTION_MODE, 2);
        config.set_bool(keys::ENABLE_TIMESTAMP_PACKET, true);
        config.set_uint(keys::CSR_COMMAND_STREAM_SIZE, 8192);

        let settings = DebugSettings::from_provider(&config);
        assert_eq!(settings.force_preemption_mode, 2);
        assert!(settings.enable_timestamp_packet);
        assert_eq!(settings.csr_command_stream_size, 8192);
        assert!(!settings.disable_zero_copy);
    }

    #[test]
    fn test_type_mismatch_falls_back() {
        let mut config = MemoryConfig::new();
        config.set_string(keys::ENABLE_TIMESTAMP_PACKET, "yes");
        assert_eq!(
            get_checked(&config, keys::ENABLE_TIMESTAMP_PACKET, ConfigValue::as_bool),
            Err(Error::SettingTypeMismatch)
        );
        let settings = DebugSettings::from_provider(&config);
        assert!(!settings.enable_timestamp_packet);
    }
}
