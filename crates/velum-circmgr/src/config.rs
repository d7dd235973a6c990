//! Configuration logic for launching a circuit manager.
//!
//! Everything here has a sensible default; most clients never construct
//! these explicitly.

use derive_builder::Builder;
use serde::Deserialize;
use std::time::Duration;

/// Rules for building and retiring circuits, and for giving up on
/// one step or another.
#[derive(Debug, Clone, Builder, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitTiming {
    /// How often the circuit-creation task wakes up.
    #[builder(default = "Duration::from_secs(1)")]
    pub(crate) tick_interval: Duration,

    /// How long to allow a single circuit build before giving up on it.
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) build_timeout: Duration,

    /// How long to wait for a CONNECTED response when opening a stream.
    #[builder(default = "Duration::from_secs(20)")]
    pub(crate) stream_timeout: Duration,

    /// How long a pending exit request may wait for a matching circuit
    /// before completing with a timeout.
    #[builder(default = "Duration::from_secs(120)")]
    pub(crate) request_timeout: Duration,

    /// How long a circuit may stay around once it has carried a user
    /// stream.
    #[builder(default = "Duration::from_secs(60 * 10)")]
    pub(crate) max_dirtiness: Duration,
}

impl Default for CircuitTiming {
    fn default() -> Self {
        CircuitTimingBuilder::default()
            .build()
            .expect("all defaults should be provided")
    }
}

/// Rules for how many circuits to keep on hand.
#[derive(Debug, Clone, Builder, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitPooling {
    /// Minimum number of clean general-purpose circuits to keep ready.
    #[builder(default = "2")]
    pub(crate) clean_floor: usize,

    /// Maximum number of circuits that may be building at once.
    #[builder(default = "4")]
    pub(crate) max_pending: usize,
}

impl Default for CircuitPooling {
    fn default() -> Self {
        CircuitPoolingBuilder::default()
            .build()
            .expect("all defaults should be provided")
    }
}

/// Overall configuration for a circuit manager.
#[derive(Debug, Clone, Builder, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CircMgrConfig {
    /// Timing rules.
    #[builder(default)]
    pub(crate) circuit_timing: CircuitTiming,

    /// Pool-size rules.
    #[builder(default)]
    pub(crate) pooling: CircuitPooling,
}

impl CircMgrConfig {
    /// Return a new builder for this configuration.
    pub fn builder() -> CircMgrConfigBuilder {
        CircMgrConfigBuilder::default()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CircMgrConfig::default();
        assert_eq!(cfg.circuit_timing.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.pooling.clean_floor, 2);
        assert!(cfg.pooling.max_pending >= cfg.pooling.clean_floor);
    }

    #[test]
    fn builder_overrides() {
        let cfg = CircMgrConfig::builder()
            .circuit_timing(
                CircuitTimingBuilder::default()
                    .stream_timeout(Duration::from_millis(100))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        assert_eq!(
            cfg.circuit_timing.stream_timeout,
            Duration::from_millis(100)
        );
        assert_eq!(cfg.circuit_timing.tick_interval, Duration::from_secs(1));
    }
}
