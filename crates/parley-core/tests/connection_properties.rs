//! Property-based tests for the connection state machine
//!
//! Drives a connection through random sequences of transport outcomes and
//! timer ticks with virtual time, checking the lifecycle invariants hold for
//! every schedule.

use std::time::{Duration, Instant};

use parley_core::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionError, OfflineReason, SessionState,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Event {
    Opened,
    Failed,
    Closed,
    Pong,
    Advance(u64),
    Foreground,
    Background,
}

fn arbitrary_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::Opened),
        Just(Event::Failed),
        Just(Event::Closed),
        Just(Event::Pong),
        (0u64..45_000).prop_map(Event::Advance),
        Just(Event::Foreground),
        Just(Event::Background),
    ]
}

#[test]
fn prop_attempt_resets_on_every_connected_entry() {
    proptest!(|(events in prop::collection::vec(arbitrary_event(), 1..80))| {
        let mut now = Instant::now();
        let mut conn = Connection::new(ConnectionConfig::new("ws://localhost/ws"), 42);
        conn.connect("abc", now).unwrap();

        for event in events {
            let before = conn.state();
            let actions = match event {
                Event::Opened => conn.transport_opened(now),
                Event::Failed => conn.transport_failed(&ConnectionError::Transport("reset".into()), now),
                Event::Closed => conn.transport_closed(now),
                Event::Pong => {
                    conn.pong_received(now);
                    Vec::new()
                },
                Event::Advance(ms) => {
                    now += Duration::from_millis(ms);
                    conn.tick(now)
                },
                Event::Foreground => conn.ensure_connected(now),
                Event::Background => {
                    conn.enter_background();
                    Vec::new()
                },
            };

            if before != SessionState::Connected && conn.state() == SessionState::Connected {
                prop_assert_eq!(conn.attempt(), 0);
                prop_assert!(actions.contains(&ConnectionAction::FlushQueue));
            }

            // The retry budget is never exceeded while still trying.
            if conn.state() == SessionState::Reconnecting {
                prop_assert!(conn.attempt() <= 8);
                prop_assert!(conn.poll_timeout(now).is_some_and(|d| d <= Duration::from_secs(30)));
            }

            if actions.contains(&ConnectionAction::Offline { reason: OfflineReason::RetriesExhausted }) {
                prop_assert_eq!(conn.state(), SessionState::Disconnected);
            }
        }
    });
}

#[test]
fn prop_no_reconnect_after_intentional_disconnect() {
    proptest!(|(events in prop::collection::vec(arbitrary_event(), 1..40), split in 0usize..40)| {
        let mut now = Instant::now();
        let mut conn = Connection::new(ConnectionConfig::new("ws://localhost/ws"), 9);
        conn.connect("abc", now).unwrap();

        for (i, event) in events.into_iter().enumerate() {
            if i == split {
                conn.disconnect(now);
            }
            let actions = match event {
                Event::Opened => conn.transport_opened(now),
                Event::Failed => conn.transport_failed(&ConnectionError::Transport("reset".into()), now),
                Event::Closed => conn.transport_closed(now),
                Event::Pong => Vec::new(),
                Event::Advance(ms) => {
                    now += Duration::from_millis(ms);
                    conn.tick(now)
                },
                Event::Foreground => conn.ensure_connected(now),
                Event::Background => Vec::new(),
            };

            if i >= split {
                let opened = actions.iter().any(|a| matches!(a, ConnectionAction::OpenTransport { .. }));
                prop_assert!(!opened, "reopened after disconnect: {:?}", actions);
                prop_assert_ne!(conn.state(), SessionState::Connected);
            }
        }
    });
}
