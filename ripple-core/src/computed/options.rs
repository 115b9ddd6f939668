//! Per-engine computed options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::retry::{Backoff, RetryDelaySeq};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputedOptions {
    /// Invalidate every consistent node this long after it was produced.
    pub auto_invalidation_delay: Option<Duration>,
    /// Invalidate nodes holding a transient error this long after they were
    /// produced, so the next read retries.
    pub transient_error_invalidation_delay: Option<Duration>,
    /// Registry pruning keeps unreferenced nodes at least this long.
    pub min_cache_duration: Duration,
    /// Retries applied to compute functions failing with transient errors.
    pub reprocessing: Backoff,
}

impl Default for ComputedOptions {
    fn default() -> Self {
        Self {
            auto_invalidation_delay: None,
            transient_error_invalidation_delay: Some(Duration::from_secs(1)),
            min_cache_duration: Duration::ZERO,
            reprocessing: Backoff::new(
                3,
                RetryDelaySeq::exp(Duration::from_millis(50), Duration::from_secs(1)),
            ),
        }
    }
}

impl ComputedOptions {
    /// Options that never retry and never auto-invalidate.
    pub fn no_reprocessing() -> Self {
        Self {
            transient_error_invalidation_delay: None,
            reprocessing: Backoff::none(),
            ..Self::default()
        }
    }

    /// The auto-invalidation delay for a node holding `output`.
    pub(crate) fn invalidation_delay<T>(&self, output: &Result<T, Error>) -> Option<Duration> {
        match output {
            Err(error) if error.is_transient() => self
                .transient_error_invalidation_delay
                .or(self.auto_invalidation_delay),
            _ => self.auto_invalidation_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_use_their_own_delay() {
        let options = ComputedOptions {
            auto_invalidation_delay: Some(Duration::from_secs(30)),
            ..ComputedOptions::default()
        };
        let ok: Result<i32, Error> = Ok(1);
        let transient: Result<i32, Error> = Err(Error::ChannelClosed);
        let business: Result<i32, Error> = Err(Error::message("nope"));

        assert_eq!(options.invalidation_delay(&ok), Some(Duration::from_secs(30)));
        assert_eq!(options.invalidation_delay(&transient), Some(Duration::from_secs(1)));
        assert_eq!(options.invalidation_delay(&business), Some(Duration::from_secs(30)));
    }

    #[test]
    fn defaults_parse_from_empty_json() {
        let options: ComputedOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ComputedOptions::default());
    }
}
