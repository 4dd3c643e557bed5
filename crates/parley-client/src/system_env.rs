//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` is the production implementation of the Environment trait:
//!
//! - Monotonic time from `std::time::Instant`
//! - Wall-clock time from `chrono::Utc::now()`
//! - OS randomness (getrandom) for temp-id nonces and backoff jitter
//! - Tokio async sleep
//!
//! Production behavior is therefore non-deterministic. Tests that need
//! reproducible schedules use the simulation environment instead.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::Environment;

/// Production environment using system time and OS randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. Temp ids and reconnect jitter are drawn from
/// it, and a host without working randomness is not running correctly.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG is available");
    }
}
