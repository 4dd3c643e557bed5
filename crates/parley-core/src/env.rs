//! Environment abstraction for deterministic testing.
//!
//! Protocol logic never reads the system clock or an RNG directly. Drivers
//! pass `now` into the state machines, and the engine asks the environment
//! for wall-clock timestamps and temp-id nonces. Production uses the system;
//! the simulation harness uses a virtual clock and a seeded RNG.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - Given the same seed, a simulated environment yields the same sequence of
///   random values
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `std::time::Instant`; simulation uses a virtual
    /// instant advanced by the test.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time. Drives timeouts, backoff, and keepalive.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time. Used for message `createdAt` and temp ids.
    ///
    /// Unlike [`Environment::now`] this may jump (NTP adjustments), so it is
    /// never used for deadlines.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait, used by driver code only.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u32`. Used for temp-id nonces and backoff jitter.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}
