//! Retry policy for document retrieval
//!
//! Decides, after each failed attempt, whether to try again and how:
//!
//! | Failure              | Decision                                        |
//! |----------------------|-------------------------------------------------|
//! | `CrossOrigin`        | one retry via the alternate path, if available  |
//! | `Network`            | one retry via the alternate path, if available  |
//! | `Server(4xx)`        | give up                                         |
//! | `Server(5xx)`        | same path with backoff, up to `max_attempts`    |
//! | `Timeout`            | same path with backoff, up to `max_attempts`    |

use std::time::Duration;

use super::types::{FetchFailure, RetrievalPath};
use crate::config::FetchConfig;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { path: RetrievalPath, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    alternate_available: bool,
}

impl RetryPolicy {
    /// Policy from fetch settings; the alternate path is on when a proxy is configured
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            alternate_available: config.proxy_template.is_some(),
        }
    }

    /// Override whether an alternate retrieval path exists
    pub fn with_alternate(mut self, available: bool) -> Self {
        self.alternate_available = available;
        self
    }

    /// Cap on attempts for server errors and timeouts
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the follow-up to a failure on `attempt` made via `path`
    pub fn decide(&self, failure: &FetchFailure, attempt: u32, path: RetrievalPath) -> RetryDecision {
        match failure {
            FetchFailure::CrossOrigin(_) | FetchFailure::Network(_) => {
                if self.alternate_available && path == RetrievalPath::Direct {
                    RetryDecision::Retry {
                        path: RetrievalPath::Alternate,
                        delay: Duration::ZERO,
                    }
                } else {
                    RetryDecision::GiveUp
                }
            }
            FetchFailure::Server(_) if failure.is_client_error() => RetryDecision::GiveUp,
            FetchFailure::Server(_) | FetchFailure::Timeout => {
                if attempt < self.max_attempts {
                    RetryDecision::Retry {
                        path,
                        delay: self.backoff(attempt),
                    }
                } else {
                    RetryDecision::GiveUp
                }
            }
        }
    }

    /// Exponential backoff following `attempt`, capped at `backoff_max`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&FetchConfig::default())
    }
}
