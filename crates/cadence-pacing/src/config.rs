//! Pacer configuration.
//!
//! A TOML-friendly input record with every field optional resolves into a
//! validated runtime config with defaults filled in. Rates are staged
//! through [`crate::pacer::PacedSender::set_pacing_rates`] at runtime; the
//! config carries their initial values plus the behavioral switches.

use std::time::Duration;

use serde::Deserialize;

/// Raw configuration as parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacerConfigInput {
    pub pacing_rate_bps: Option<u64>,
    pub padding_rate_bps: Option<u64>,
    pub max_queue_delay_ms: Option<u64>,
    pub drain_large_queues: Option<bool>,
    pub enable_probing: Option<bool>,
    pub prioritize_audio: Option<bool>,
    pub pace_audio: Option<bool>,
    pub account_for_audio: Option<bool>,
    pub send_side_bwe_overhead: Option<bool>,
    pub overhead_bytes_per_packet: Option<usize>,
    pub transport_failure_threshold: Option<u32>,
    pub queue_high_water_mark_bytes: Option<usize>,
    pub max_leading_bytes: Option<u64>,
}

/// Resolved pacer options.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Initial steady-state emit rate.
    pub pacing_rate_bps: u64,
    /// Initial padding rate applied when the queue is idle.
    pub padding_rate_bps: u64,
    /// Queue age past which the emergency drain may exceed the pacing rate.
    pub max_queue_delay: Duration,
    /// Allow the emergency drain at all.
    pub drain_large_queues: bool,
    /// Accept probe cluster requests.
    pub enable_probing: bool,
    /// Audio gets its own, strictly higher priority class.
    pub prioritize_audio: bool,
    /// Audio packets are subject to the media budget. When off, audio
    /// bypasses pacing entirely.
    pub pace_audio: bool,
    /// Audio bytes consume media budget.
    pub account_for_audio: bool,
    /// Count per-packet transport overhead in all size accounting.
    pub send_side_bwe_overhead: bool,
    /// Overhead added per packet when `send_side_bwe_overhead` is on.
    pub overhead_bytes_per_packet: usize,
    /// Consecutive transport failures on one stream before a status event.
    pub transport_failure_threshold: u32,
    /// Queue size past which a pressure status event is raised. The pacer
    /// never drops packets itself.
    pub queue_high_water_mark_bytes: Option<usize>,
    /// Fairness clock drift bound between streams of one priority class.
    pub max_leading_bytes: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            pacing_rate_bps: 1_000_000,
            padding_rate_bps: 0,
            max_queue_delay: Duration::from_millis(2000),
            drain_large_queues: true,
            enable_probing: true,
            prioritize_audio: true,
            pace_audio: true,
            account_for_audio: false,
            send_side_bwe_overhead: false,
            overhead_bytes_per_packet: 0,
            transport_failure_threshold: 5,
            queue_high_water_mark_bytes: None,
            max_leading_bytes: crate::queue::DEFAULT_MAX_LEADING_BYTES,
        }
    }
}

impl PacerConfigInput {
    pub fn resolve(self) -> Result<PacerConfig, String> {
        let defaults = PacerConfig::default();
        let config = PacerConfig {
            pacing_rate_bps: self.pacing_rate_bps.unwrap_or(defaults.pacing_rate_bps),
            padding_rate_bps: self.padding_rate_bps.unwrap_or(defaults.padding_rate_bps),
            max_queue_delay: self
                .max_queue_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_queue_delay),
            drain_large_queues: self.drain_large_queues.unwrap_or(defaults.drain_large_queues),
            enable_probing: self.enable_probing.unwrap_or(defaults.enable_probing),
            prioritize_audio: self.prioritize_audio.unwrap_or(defaults.prioritize_audio),
            pace_audio: self.pace_audio.unwrap_or(defaults.pace_audio),
            account_for_audio: self.account_for_audio.unwrap_or(defaults.account_for_audio),
            send_side_bwe_overhead: self
                .send_side_bwe_overhead
                .unwrap_or(defaults.send_side_bwe_overhead),
            overhead_bytes_per_packet: self
                .overhead_bytes_per_packet
                .unwrap_or(defaults.overhead_bytes_per_packet),
            transport_failure_threshold: self
                .transport_failure_threshold
                .unwrap_or(defaults.transport_failure_threshold)
                .max(1),
            queue_high_water_mark_bytes: self
                .queue_high_water_mark_bytes
                .or(defaults.queue_high_water_mark_bytes),
            max_leading_bytes: self.max_leading_bytes.unwrap_or(defaults.max_leading_bytes),
        };

        if config.pacing_rate_bps == 0 {
            return Err("pacing_rate_bps must be non-zero".to_string());
        }
        if config.max_queue_delay < Duration::from_millis(1) {
            return Err("max_queue_delay_ms must be at least 1".to_string());
        }
        if config.send_side_bwe_overhead && config.overhead_bytes_per_packet == 0 {
            return Err(
                "send_side_bwe_overhead requires a non-zero overhead_bytes_per_packet".to_string(),
            );
        }
        Ok(config)
    }
}

impl PacerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(PacerConfig::default());
        }
        let parsed: PacerConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid pacer TOML: {}", e))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let config = PacerConfig::from_toml_str("").unwrap();
        assert_eq!(config.pacing_rate_bps, 1_000_000);
        assert_eq!(config.max_queue_delay, Duration::from_millis(2000));
        assert!(config.drain_large_queues);
        assert!(config.prioritize_audio);
        assert!(config.queue_high_water_mark_bytes.is_none());
    }

    #[test]
    fn parse_toml_basic() {
        let toml = r#"
            pacing_rate_bps = 2_500_000
            padding_rate_bps = 100_000
            max_queue_delay_ms = 250
            enable_probing = false
            send_side_bwe_overhead = true
            overhead_bytes_per_packet = 48
            queue_high_water_mark_bytes = 500000
        "#;
        let config = PacerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.pacing_rate_bps, 2_500_000);
        assert_eq!(config.padding_rate_bps, 100_000);
        assert_eq!(config.max_queue_delay, Duration::from_millis(250));
        assert!(!config.enable_probing);
        assert!(config.send_side_bwe_overhead);
        assert_eq!(config.overhead_bytes_per_packet, 48);
        assert_eq!(config.queue_high_water_mark_bytes, Some(500_000));
    }

    #[test]
    fn zero_pacing_rate_is_rejected() {
        let err = PacerConfig::from_toml_str("pacing_rate_bps = 0").unwrap_err();
        assert!(err.contains("pacing_rate_bps"));
    }

    #[test]
    fn overhead_flag_requires_byte_count() {
        let err = PacerConfig::from_toml_str("send_side_bwe_overhead = true").unwrap_err();
        assert!(err.contains("overhead_bytes_per_packet"));
    }

    #[test]
    fn failure_threshold_has_floor_of_one() {
        let config = PacerConfig::from_toml_str("transport_failure_threshold = 0").unwrap();
        assert_eq!(config.transport_failure_threshold, 1);
    }
}
