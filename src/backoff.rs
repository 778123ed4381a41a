//! Per-session throttle handling
//!
//! [`BackoffController`] turns the outcome history of one session into a decision:
//! proceed, wait (optionally rotating the route first), rotate right away, or abort.
//! It performs no I/O and never sleeps, so the policy can be exercised without
//! simulating a throttling remote.
//!
//! Waiting and rotating are separate on purpose: every throttle is waited out, but
//! the route is only abandoned after `rotation_threshold` consecutive throttles.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// What happened on the last attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// The page was fetched
    Success,
    /// The remote throttled us, optionally mandating a wait
    Throttled {
        /// Remote-specified wait
        retry_after: Option<Duration>,
    },
    /// A retryable transport failure (connection reset, proxy refused, ...)
    TransportFailure,
    /// A non-retryable failure
    Fatal,
}

/// What the session should do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Issue the next request immediately
    Proceed,
    /// Wait before the next request; when `rotate` is set, switch routes first
    Wait {
        /// How long to wait
        delay: Duration,
        /// Whether to switch to another route for the next attempt
        rotate: bool,
    },
    /// Switch routes and retry without waiting
    Rotate,
    /// Give up on this target
    Abort {
        /// Transport failures seen on the current page
        attempts: u32,
    },
}

/// Whether the session is currently backing off
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffState {
    /// No throttle since the last success
    Normal,
    /// At least one throttle since the last success
    BackingOff,
}

/// Throttle and failure policy for one collection session
#[derive(Debug, Clone)]
pub struct BackoffController {
    config: BackoffConfig,
    max_transport_retries: u32,
    state: BackoffState,
    consecutive_throttles: u32,
    throttles_since_success: u32,
    transport_failures: u32,
}

impl BackoffController {
    /// Create a controller in the `Normal` state
    pub fn new(config: BackoffConfig, max_transport_retries: u32) -> Self {
        Self {
            config,
            max_transport_retries,
            state: BackoffState::Normal,
            consecutive_throttles: 0,
            throttles_since_success: 0,
            transport_failures: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> BackoffState {
        self.state
    }

    /// Throttles seen on the current route since the last rotation or success
    pub fn consecutive_throttles(&self) -> u32 {
        self.consecutive_throttles
    }

    /// Feed the outcome of an attempt and get the next step
    pub fn decide(&mut self, signal: Signal) -> Decision {
        match signal {
            Signal::Success => {
                self.state = BackoffState::Normal;
                self.consecutive_throttles = 0;
                self.throttles_since_success = 0;
                self.transport_failures = 0;
                Decision::Proceed
            }
            Signal::Throttled { retry_after } => {
                self.state = BackoffState::BackingOff;
                self.consecutive_throttles += 1;
                self.throttles_since_success += 1;

                let delay = match retry_after {
                    Some(mandated) => mandated + self.jitter(),
                    None => self.exponential_delay() + self.jitter(),
                };

                let rotate = self.consecutive_throttles >= self.config.rotation_threshold;
                if rotate {
                    self.consecutive_throttles = 0;
                }

                Decision::Wait { delay, rotate }
            }
            Signal::TransportFailure => {
                self.transport_failures += 1;
                if self.transport_failures > self.max_transport_retries {
                    Decision::Abort {
                        attempts: self.transport_failures,
                    }
                } else {
                    Decision::Rotate
                }
            }
            Signal::Fatal => Decision::Abort {
                attempts: self.transport_failures,
            },
        }
    }

    /// Forget per-route throttle history after the session switched routes
    pub fn route_changed(&mut self) {
        self.consecutive_throttles = 0;
    }

    /// `base * multiplier^(n-1)` capped at `max_delay`
    fn exponential_delay(&self) -> Duration {
        let exponent = self.throttles_since_success.saturating_sub(1).min(63) as i32;
        let secs = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()))
    }

    fn jitter(&self) -> Duration {
        if !self.config.jitter || self.config.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max = self.config.max_jitter.as_secs_f64();
        let secs = rand::thread_rng().gen_range(0.0..max);
        Duration::from_secs_f64(secs)
    }
}
