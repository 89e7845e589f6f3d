//! Configuration surface (§6), mirrored field-for-field as a
//! `serde`-deserializable struct in the style of the teacher corpus's
//! per-sink config types (one default function per field, a `Default` impl
//! that delegates to the same functions so programmatic and deserialized
//! construction agree).

use serde::Deserialize;
use std::time::Duration;

fn default_buffer_interval_ms() -> u64 {
    1_000
}
fn default_max_batch_size() -> usize {
    500
}
fn default_max_batch_bytes() -> usize {
    1024 * 1024
}
fn default_queue_size_items() -> usize {
    10_000
}
fn default_secondary_queue_type() -> SecondaryQueueType {
    SecondaryQueueType::Unset
}
fn default_queue_max_batches() -> usize {
    1_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_jitting_factor() -> f64 {
    0.1
}
fn default_backoff_factor() -> f64 {
    0.5
}
fn default_recovery_factor() -> f64 {
    0.5
}
fn default_min_rate_adjustment_factor() -> f64 {
    1.0 / 8.0
}
fn default_upload_network_priority() -> u8 {
    0
}
fn default_records_per_second() -> f64 {
    1_000.0
}
fn default_bytes_per_second() -> f64 {
    5.0 * 1024.0 * 1024.0
}
fn default_max_failback_retry_interval_minutes() -> u64 {
    5
}
fn default_combine_records() -> bool {
    false
}
fn default_failover_error_threshold() -> u32 {
    5
}
fn default_durable_queue_dir() -> Option<String> {
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryQueueType {
    Memory,
    File,
    Unset,
}

/// Pre-serialization enrichment knobs. Consumed by the source-side
/// formatter, not the core; kept here only so the full configuration
/// surface round-trips through one struct, per the table in §6.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecorationConfig {
    pub text_decoration: Option<String>,
    pub object_decoration: Option<String>,
}

/// Every row of the "Configuration surface" table, field-for-field.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_buffer_interval_ms")]
    pub buffer_interval_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    #[serde(default = "default_queue_size_items")]
    pub queue_size_items: usize,

    #[serde(default = "default_secondary_queue_type")]
    pub secondary_queue_type: SecondaryQueueType,

    #[serde(default = "default_queue_max_batches")]
    pub queue_max_batches: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_jitting_factor")]
    pub jitting_factor: f64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,

    #[serde(default = "default_min_rate_adjustment_factor")]
    pub min_rate_adjustment_factor: f64,

    #[serde(default = "default_upload_network_priority")]
    pub upload_network_priority: u8,

    #[serde(default = "default_records_per_second")]
    pub records_per_second: f64,

    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: f64,

    #[serde(default = "default_max_failback_retry_interval_minutes")]
    pub max_failback_retry_interval_minutes: u64,

    #[serde(default = "default_combine_records")]
    pub combine_records: bool,

    #[serde(default = "default_failover_error_threshold")]
    pub failover_error_threshold: u32,

    #[serde(default)]
    pub decoration: DecorationConfig,

    /// Directory for the durable on-disk secondary queue, required when
    /// `secondary_queue_type` is `File`.
    #[serde(default = "default_durable_queue_dir")]
    pub durable_queue_dir: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_interval_ms: default_buffer_interval_ms(),
            max_batch_size: default_max_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            queue_size_items: default_queue_size_items(),
            secondary_queue_type: default_secondary_queue_type(),
            queue_max_batches: default_queue_max_batches(),
            max_attempts: default_max_attempts(),
            jitting_factor: default_jitting_factor(),
            backoff_factor: default_backoff_factor(),
            recovery_factor: default_recovery_factor(),
            min_rate_adjustment_factor: default_min_rate_adjustment_factor(),
            upload_network_priority: default_upload_network_priority(),
            records_per_second: default_records_per_second(),
            bytes_per_second: default_bytes_per_second(),
            max_failback_retry_interval_minutes: default_max_failback_retry_interval_minutes(),
            combine_records: default_combine_records(),
            failover_error_threshold: default_failover_error_threshold(),
            decoration: DecorationConfig::default(),
            durable_queue_dir: default_durable_queue_dir(),
        }
    }
}

impl SinkConfig {
    pub fn buffer_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_interval_ms)
    }

    pub fn max_failback_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_failback_retry_interval_minutes * 60)
    }

    pub fn batch_caps(&self) -> crate::queue::BatchCaps {
        crate::queue::BatchCaps {
            max_count: self.max_batch_size,
            max_bytes: self.max_batch_bytes,
            max_wait: self.buffer_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_deserialized_empty_object() {
        let programmatic = SinkConfig::default();
        let deserialized: SinkConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(programmatic.max_batch_size, deserialized.max_batch_size);
        assert_eq!(programmatic.jitting_factor, deserialized.jitting_factor);
        assert_eq!(
            programmatic.secondary_queue_type,
            deserialized.secondary_queue_type
        );
    }

    #[test]
    fn overrides_apply_over_defaults() {
        let cfg: SinkConfig = serde_json::from_str(r#"{"max_batch_size": 10}"#).unwrap();
        assert_eq!(cfg.max_batch_size, 10);
        assert_eq!(cfg.max_batch_bytes, default_max_batch_bytes());
    }
}
