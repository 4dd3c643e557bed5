//! Simulated network link with fault injection.
//!
//! Stands in for the WebSocket: the driver opens, closes and writes to it,
//! and reads back [`LinkEvent`]s. Faults come from a seeded RNG: the link
//! can be taken down, writes can fail with a given probability, and an open
//! connection can be severed. Closing drops undelivered frames, like a
//! generation change on the real transport.

use std::collections::VecDeque;

use parley_core::ConnectionError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Outcome reported to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake completed
    Opened,
    /// Handshake failed or the link broke
    Failed(ConnectionError),
    /// Frame pushed by the server
    Frame(String),
    /// Pong from the server
    Pong,
    /// Peer closed the connection
    Closed,
}

/// Simulated transport.
pub struct SimTransport {
    rng: ChaCha8Rng,
    reachable: bool,
    open: bool,
    send_failure_rate: f64,
    events: VecDeque<LinkEvent>,
    opens: usize,
}

impl SimTransport {
    /// Healthy link; faults drawn from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            reachable: true,
            open: false,
            send_failure_rate: 0.0,
            events: VecDeque::new(),
            opens: 0,
        }
    }

    /// Make the server (un)reachable. Going down severs an open connection.
    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        if !reachable {
            self.sever();
        }
    }

    /// Probability that a write fails.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not in [0.0, 1.0]
    pub fn set_send_failure_rate(&mut self, rate: f64) {
        assert!((0.0..=1.0).contains(&rate), "send failure rate must be between 0.0 and 1.0, got {rate}");
        self.send_failure_rate = rate;
    }

    /// Whether writes are possible
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Connection attempts so far
    pub fn opens(&self) -> usize {
        self.opens
    }

    /// Start a connection attempt. `authorized` is the server's verdict on
    /// the credential.
    pub fn open(&mut self, authorized: bool) {
        self.close();
        self.opens += 1;
        let event = if !self.reachable {
            LinkEvent::Failed(ConnectionError::Transport("connection refused".to_string()))
        } else if !authorized {
            LinkEvent::Failed(ConnectionError::AuthRejected("handshake rejected with 401".to_string()))
        } else {
            self.open = true;
            LinkEvent::Opened
        };
        self.events.push_back(event);
    }

    /// Drop the connection and everything not yet delivered.
    pub fn close(&mut self) {
        self.open = false;
        self.events.clear();
    }

    /// The connection breaks under an open transport.
    pub fn sever(&mut self) {
        if self.open {
            self.close();
            self.events.push_back(LinkEvent::Closed);
        }
    }

    /// Attempt a write.
    pub fn write(&mut self) -> Result<(), ConnectionError> {
        if !self.open {
            return Err(ConnectionError::Closed);
        }
        if self.send_failure_rate > 0.0 && self.rng.gen_bool(self.send_failure_rate) {
            return Err(ConnectionError::Transport("injected write failure".to_string()));
        }
        Ok(())
    }

    /// Queue a server push on an open connection. Dropped when closed.
    pub fn push(&mut self, event: LinkEvent) {
        if self.open {
            self.events.push_back(event);
        }
    }

    /// Next event for the driver.
    pub fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }
}
