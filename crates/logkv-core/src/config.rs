//! Configuration management for LogKV
//!
//! Provides flush-behaviour presets for different workloads and
//! validation of custom configurations.

use std::time::Duration;

use crate::error::{LogKvError, LogKvResult};
use crate::format::MAX_PAYLOAD_SIZE;

/// Upper bound for `max_payload_size` (1GB)
const MAX_PAYLOAD_CEILING: u64 = 1024 * 1024 * 1024;

/// LogKV engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the flush loop checks the write-back cache
    pub flush_interval: Duration,
    /// Flush when the cache holds more than this many records
    pub flush_threshold: usize,
    /// Default maximum number of records returned by a scan
    pub scan_limit: usize,
    /// Top-level JSON fields to index; each is a named trace index
    pub trace_fields: Vec<String>,
    /// durable_sync the log after every flush batch
    pub sync_on_flush: bool,
    /// At open, truncate a trailing partial record instead of failing
    pub repair_torn_tail: bool,
    /// Largest payload accepted by `set` or decoded from the log (bytes)
    pub max_payload_size: u64,
}

impl Config {
    /// Flush whenever anything is cached, polling every 10ms. Shrinks the
    /// window in which accepted writes exist only in memory.
    pub fn write_through() -> Self {
        Self {
            flush_interval: Duration::from_millis(10),
            flush_threshold: 0,
            ..Self::default()
        }
    }

    /// Large batches, infrequent flushes; for bulk loads.
    pub fn bulk() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            flush_threshold: 100_000,
            ..Self::default()
        }
    }

    /// Add a trace index over the given JSON field.
    pub fn with_trace_field(mut self, field: impl Into<String>) -> Self {
        self.trace_fields.push(field.into());
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> LogKvResult<()> {
        if self.flush_interval.is_zero() {
            return Err(LogKvError::InvalidConfig("flush_interval must be > 0".into()));
        }
        if self.scan_limit == 0 {
            return Err(LogKvError::InvalidConfig("scan_limit must be > 0".into()));
        }
        if self.max_payload_size == 0 || self.max_payload_size > MAX_PAYLOAD_CEILING {
            return Err(LogKvError::InvalidConfig("max_payload_size must be in [1, 1GB]".into()));
        }
        for (i, field) in self.trace_fields.iter().enumerate() {
            if field.is_empty() {
                return Err(LogKvError::InvalidConfig("trace field names must not be empty".into()));
            }
            if self.trace_fields[..i].contains(field) {
                return Err(LogKvError::InvalidConfig(format!("trace field {:?} listed twice", field)));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            flush_threshold: 10_240,
            scan_limit: 10_000,
            trace_fields: Vec::new(),
            sync_on_flush: true,
            repair_torn_tail: false,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::write_through().validate().is_ok());
        assert!(Config::bulk().validate().is_ok());
    }

    #[test]
    fn test_preset_ordering() {
        let w = Config::write_through();
        let d = Config::default();
        let b = Config::bulk();
        assert!(w.flush_threshold < d.flush_threshold);
        assert!(d.flush_threshold < b.flush_threshold);
        assert!(w.flush_interval < d.flush_interval);
        assert!(d.flush_interval < b.flush_interval);
    }

    #[test]
    fn test_invalid_rejected() {
        let zero_interval = Config { flush_interval: Duration::ZERO, ..Config::default() };
        assert!(matches!(zero_interval.validate(), Err(LogKvError::InvalidConfig(_))));

        let zero_scan = Config { scan_limit: 0, ..Config::default() };
        assert!(zero_scan.validate().is_err());

        let huge_payload = Config { max_payload_size: MAX_PAYLOAD_CEILING + 1, ..Config::default() };
        assert!(huge_payload.validate().is_err());

        assert!(Config::default().with_trace_field("").validate().is_err());
        assert!(Config::default().with_trace_field("trace").validate().is_ok());

        let two = Config::default().with_trace_field("user").with_trace_field("session");
        assert!(two.validate().is_ok());
        assert!(two.with_trace_field("user").validate().is_err());
    }
}
