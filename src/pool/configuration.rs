//! Settings controlling the size of a [`ChannelPool`](super::ChannelPool) and how it
//! recovers from a lost connection.
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for a [`ChannelPool`](super::ChannelPool).
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// The maximum number of channels the pool keeps open at the same time.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// How the pool retries when the connection with the broker is lost.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

fn default_capacity() -> usize {
    10
}

/// Exponential backoff applied between reconnection attempts.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Delay before the first reconnection attempt, in milliseconds.
    pub initial_interval_ms: u64,
    /// Upper bound for the delay between two attempts, in milliseconds.
    pub max_interval_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Give up after this many seconds.
    /// If `None`, the pool keeps trying for as long as it is alive.
    pub max_elapsed_seconds: Option<u64>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            max_elapsed_seconds: None,
        }
    }
}

impl ReconnectSettings {
    /// Build a fresh backoff, ready to be used for a new reconnection cycle.
    pub fn build(&self) -> ExponentialBackoff {
        let initial_interval = Duration::from_millis(self.initial_interval_ms);
        let mut backoff = ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_elapsed_time: self.max_elapsed_seconds.map(Duration::from_secs),
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }
}
