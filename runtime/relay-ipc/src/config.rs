//! Subsystem configuration
//!
//! [`IpcConfig`] holds every tunable of the IPC core. It deserialises from
//! TOML with all fields optional:
//!
//! ```toml
//! page_size = 4096
//! default_pool_pages = 16
//! max_pool_pages = 64
//! handle_mode = "dense"
//! max_services = 32
//! reply_window_ms = 5000
//! call_timeout_ms = 2000
//! ```

use core::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::message::{MessageLimits, MESSAGE_HEADER_SIZE, SPECIAL_OBJECT_SIZE};

/// Largest pool any process may map, in pages
pub const POOL_PAGE_HARD_CAP: usize = 256;

/// How service handles are assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleMode {
    /// The handle is the owning task's id
    #[default]
    TaskId,
    /// Handles index a slot table of `max_services` entries
    Dense,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    pub page_size: usize,
    /// Pool size a user library maps when it does not choose one
    pub default_pool_pages: usize,
    pub max_pool_pages: usize,
    /// Preferred user address of a pool
    pub pool_user_base: usize,
    /// Handle space size (exclusive upper bound of handle values)
    pub max_services: usize,
    pub handle_mode: HandleMode,
    /// Bytes a single message may carry, from which payload and object
    /// limits are derived
    pub io_data_max: usize,
    /// How long after a request its reply is still accepted
    pub reply_window_ms: u64,
    /// How long a synchronous call waits for its reply
    pub call_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            default_pool_pages: 16,
            max_pool_pages: 64,
            pool_user_base: 0x1000_0000,
            max_services: 128,
            handle_mode: HandleMode::TaskId,
            io_data_max: 8192,
            reply_window_ms: 5000,
            call_timeout_ms: 5000,
        }
    }
}

/// Configuration rejected at load time
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl IpcConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: IpcConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if !self.page_size.is_power_of_two() || self.page_size < MESSAGE_HEADER_SIZE {
            return invalid("page_size", "must be a power of two larger than a message header");
        }
        if self.page_size.checked_mul(POOL_PAGE_HARD_CAP).is_none() {
            return invalid("page_size", "too large to address a full pool");
        }
        if self.max_pool_pages == 0 || self.max_pool_pages > POOL_PAGE_HARD_CAP {
            return invalid("max_pool_pages", "must be between 1 and 256");
        }
        if self.default_pool_pages == 0 || self.default_pool_pages > self.max_pool_pages {
            return invalid("default_pool_pages", "must be between 1 and max_pool_pages");
        }
        if self.pool_user_base == 0 || self.pool_user_base % self.page_size != 0 {
            return invalid("pool_user_base", "must be a non-zero multiple of page_size");
        }
        if self.max_services < 2 || self.max_services > u32::MAX as usize {
            return invalid("max_services", "must leave room for at least one service");
        }
        if self.io_data_max < MESSAGE_HEADER_SIZE + SPECIAL_OBJECT_SIZE {
            return invalid("io_data_max", "must fit a header and one special object");
        }
        if self.io_data_max > self.max_pool_size() {
            return invalid("io_data_max", "must fit in the largest pool");
        }
        if self.reply_window_ms == 0 {
            return invalid("reply_window_ms", "must be positive");
        }
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms", "must be positive");
        }
        Ok(())
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_pages * self.page_size
    }

    pub fn default_pool_size(&self) -> usize {
        self.default_pool_pages * self.page_size
    }

    pub fn reply_window(&self) -> Duration {
        Duration::from_millis(self.reply_window_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn limits(&self) -> MessageLimits {
        MessageLimits::from_io_data_max(self.io_data_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IpcConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_pool_size(), 64 * 4096);
        assert_eq!(config.default_pool_size(), 64 * 1024);
        assert_eq!(config.limits().max_payload, 6144);
        assert_eq!(config.limits().max_objects, 256);
    }

    #[test]
    fn test_partial_toml() {
        let config = IpcConfig::from_toml_str(
            r#"
            handle_mode = "dense"
            max_services = 8
            call_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.handle_mode, HandleMode::Dense);
        assert_eq!(config.max_services, 8);
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.reply_window(), Duration::from_millis(5000));
        assert_eq!(config.page_size, 4096);
    }

    #[test]
    fn test_rejects_oversized_pool() {
        let err = IpcConfig::from_toml_str("max_pool_pages = 512").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_pool_pages", .. }));
    }

    #[test]
    fn test_rejects_oversized_io_budget() {
        let err = IpcConfig::from_toml_str("io_data_max = 9223372036854775807").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "io_data_max", .. }));

        let config = IpcConfig {
            io_data_max: 64 * 4096 + 1,
            ..IpcConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_huge_page_size() {
        let config = IpcConfig {
            page_size: 1 << (usize::BITS - 2),
            ..IpcConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "page_size", .. })
        ));
    }

    #[test]
    fn test_rejects_unaligned_base() {
        let config = IpcConfig {
            pool_user_base: 0x1000_0010,
            ..IpcConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "pool_user_base", .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_types() {
        assert!(matches!(
            IpcConfig::from_toml_str("pool_pages = 3"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            IpcConfig::from_toml_str("handle_mode = \"sparse\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
