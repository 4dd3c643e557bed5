//! Session lifecycle state machine.
//!
//! Owns the connect/reconnect cycle, keepalive, and the intentional-disconnect
//! flag. Uses the action pattern: methods take time as input and return
//! actions for the driver to execute. The driver reports transport outcomes
//! back through [`Connection::transport_opened`],
//! [`Connection::transport_failed`] and [`Connection::transport_closed`].
//!
//! # State Machine
//!
//! ```text
//!                 connect()            opened
//! ┌──────────────┐ ──────> ┌────────────┐ ─────> ┌───────────┐
//! │ Disconnected │         │ Connecting │        │ Connected │
//! └──────────────┘ <──┐    └────────────┘        └───────────┘
//!        ^            │      │      ^                  │
//!        │ exhausted  │      │fail  │ backoff elapsed  │ error / pong timeout
//!        │            │      v      │                  │
//!        │            │    ┌──────────────┐            │
//!        └────────────┴────│ Reconnecting │<───────────┘
//!                          └──────────────┘
//!
//!   disconnect() from any state: ──> Closing ──> Disconnected
//! ```

use std::{ops::Sub, time::Duration};

use url::Url;

use crate::{backoff::Backoff, error::ConnectionError};

/// Interval between keepalive pings while connected.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Time allowed for a pong after a ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the WebSocket handshake to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Query parameter carrying the session token.
pub const TOKEN_PARAM: &str = "token";

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport and no reconnect scheduled
    Disconnected,
    /// Transport opening, waiting for the handshake
    Connecting,
    /// Handshake complete, frames flowing
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Intentional shutdown in progress
    Closing,
}

/// Why the session stopped trying to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfflineReason {
    /// Backoff attempts used up
    RetriesExhausted,
    /// The server rejected the token; a fresh one is required
    AuthRejected,
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a transport to this URL and report the outcome
    OpenTransport {
        /// Endpoint with the token query credential
        url: String,
    },
    /// Tear down the current transport, if any
    CloseTransport,
    /// Send a protocol-level ping
    SendPing,
    /// Flush the outgoing queue onto the new transport
    FlushQueue,
    /// Drop everything in the outgoing queue
    ClearQueue,
    /// The session gave up; surface to the user
    Offline {
        /// Why the session went offline
        reason: OfflineReason,
    },
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, without the token
    pub endpoint: String,
    /// Keepalive ping interval
    pub keepalive_interval: Duration,
    /// Time allowed for a pong
    pub pong_timeout: Duration,
    /// Time allowed for a connection attempt
    pub connect_timeout: Duration,
    /// Reconnect policy
    pub backoff: Backoff,
}

impl ConnectionConfig {
    /// Defaults for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: Backoff::default(),
        }
    }
}

/// A deadline: started at `since`, due after `after`.
#[derive(Debug, Clone, Copy)]
struct Deadline<I> {
    since: I,
    after: Duration,
}

impl<I> Deadline<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    fn new(since: I, after: Duration) -> Self {
        Self { since, after }
    }

    fn elapsed(&self, now: I) -> bool {
        now - self.since >= self.after
    }

    fn remaining(&self, now: I) -> Duration {
        self.after.saturating_sub(now - self.since)
    }
}

/// Connection state machine
///
/// Pure: no I/O and no clock. Generic over `Instant` so tests and the
/// simulation harness can drive it with virtual time.
#[derive(Debug, Clone)]
pub struct Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: SessionState,
    config: ConnectionConfig,
    /// Token from the last `connect`, cleared by `disconnect`
    token: Option<String>,
    /// Endpoint URL with the token appended
    url: Option<String>,
    /// Consecutive failed attempts since the last `Connected`
    attempt: u32,
    /// Set by `disconnect`; suppresses every reconnect path
    intentional: bool,
    /// Set when the server rejected the token
    auth_rejected: bool,
    keepalive_paused: bool,
    connect_deadline: Option<Deadline<I>>,
    retry_deadline: Option<Deadline<I>>,
    close_deadline: Option<Deadline<I>>,
    /// Anchor for the next keepalive ping
    last_ping: Option<I>,
    /// Outstanding ping
    pong_deadline: Option<Deadline<I>>,
    /// Jitter source (xorshift)
    rng: u64,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a connection in [`SessionState::Disconnected`].
    ///
    /// `seed` drives backoff jitter and should come from the environment RNG.
    pub fn new(config: ConnectionConfig, seed: u64) -> Self {
        Self {
            state: SessionState::Disconnected,
            config,
            token: None,
            url: None,
            attempt: 0,
            intentional: false,
            auth_rejected: false,
            keepalive_paused: false,
            connect_deadline: None,
            retry_deadline: None,
            close_deadline: None,
            last_ping: None,
            pong_deadline: None,
            rng: seed | 1,
        }
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token from the last `connect`, if not cleared.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether keepalive pings are paused (app backgrounded).
    #[must_use]
    pub fn is_keepalive_paused(&self) -> bool {
        self.keepalive_paused
    }

    /// Whether the last token was rejected by the server.
    #[must_use]
    pub fn is_auth_rejected(&self) -> bool {
        self.auth_rejected
    }

    /// Start a session with `token`.
    ///
    /// Replaces any previous token. An open or opening transport is torn down
    /// and reopened with the new credential; a pending backoff is skipped.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidEndpoint` if the configured endpoint is not
    ///   a ws/wss/http/https URL
    pub fn connect(&mut self, token: &str, now: I) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let url = endpoint_with_token(&self.config.endpoint, token)?;

        let mut actions = Vec::new();
        if matches!(self.state, SessionState::Connected | SessionState::Connecting) {
            actions.push(ConnectionAction::CloseTransport);
        }

        self.token = Some(token.to_string());
        self.url = Some(url.clone());
        self.intentional = false;
        self.auth_rejected = false;
        self.keepalive_paused = false;
        self.attempt = 0;

        self.begin_connecting(now);
        actions.push(ConnectionAction::OpenTransport { url });
        Ok(actions)
    }

    /// The transport finished its handshake.
    pub fn transport_opened(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.state {
            SessionState::Connecting => {
                self.transition(SessionState::Connected);
                self.attempt = 0;
                self.connect_deadline = None;
                self.last_ping = Some(now);
                self.pong_deadline = None;
                vec![ConnectionAction::FlushQueue]
            },
            // Late handshake for a session we already abandoned
            SessionState::Disconnected | SessionState::Closing => {
                vec![ConnectionAction::CloseTransport]
            },
            SessionState::Connected | SessionState::Reconnecting => Vec::new(),
        }
    }

    /// The transport failed to open, or failed while open.
    pub fn transport_failed(&mut self, error: &ConnectionError, now: I) -> Vec<ConnectionAction> {
        if let ConnectionError::AuthRejected(reason) = error {
            return self.reject_auth(reason);
        }

        tracing::warn!(state = ?self.state, %error, "transport failed");
        self.connection_lost(now)
    }

    /// The transport closed (peer close or our own `CloseTransport`).
    pub fn transport_closed(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.state == SessionState::Closing {
            self.close_deadline = None;
            self.transition(SessionState::Disconnected);
            return Vec::new();
        }

        self.connection_lost(now)
    }

    /// The server answered our ping.
    pub fn pong_received(&mut self, _now: I) {
        self.pong_deadline = None;
    }

    /// The server rejected the token (HTTP 401/403 or an `unauthorized`
    /// error event).
    pub fn reject_auth(&mut self, reason: &str) -> Vec<ConnectionAction> {
        tracing::warn!(%reason, "authentication rejected, not reconnecting");
        self.auth_rejected = true;
        self.clear_timers();
        self.transition(SessionState::Disconnected);
        vec![ConnectionAction::CloseTransport, ConnectionAction::Offline {
            reason: OfflineReason::AuthRejected,
        }]
    }

    /// Intentional logout. Safe in any state, including mid-backoff.
    pub fn disconnect(&mut self, now: I) -> Vec<ConnectionAction> {
        self.intentional = true;
        self.token = None;
        self.url = None;
        self.attempt = 0;
        self.clear_timers();

        match self.state {
            SessionState::Connected | SessionState::Connecting => {
                self.transition(SessionState::Closing);
                self.close_deadline = Some(Deadline::new(now, self.config.connect_timeout));
                vec![ConnectionAction::ClearQueue, ConnectionAction::CloseTransport]
            },
            SessionState::Reconnecting | SessionState::Disconnected => {
                self.transition(SessionState::Disconnected);
                vec![ConnectionAction::ClearQueue]
            },
            SessionState::Closing => vec![ConnectionAction::ClearQueue],
        }
    }

    /// App moved to the foreground or the network came back.
    ///
    /// Resets the attempt counter and resumes keepalive. A connected session
    /// is probed with an immediate ping; an idle one reconnects now.
    pub fn ensure_connected(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.intentional || self.auth_rejected || self.url.is_none() {
            tracing::debug!(state = ?self.state, "ensure_connected ignored: no usable session");
            return Vec::new();
        }

        self.attempt = 0;
        self.keepalive_paused = false;

        match self.state {
            SessionState::Connected => {
                if self.pong_deadline.is_some() {
                    return Vec::new();
                }
                self.last_ping = Some(now);
                self.pong_deadline = Some(Deadline::new(now, self.config.pong_timeout));
                vec![ConnectionAction::SendPing]
            },
            SessionState::Reconnecting | SessionState::Disconnected => {
                self.retry_deadline = None;
                self.open_current(now)
            },
            SessionState::Connecting | SessionState::Closing => Vec::new(),
        }
    }

    /// App moved to the background. Pauses keepalive; state is unchanged.
    pub fn enter_background(&mut self) {
        self.keepalive_paused = true;
        self.pong_deadline = None;
    }

    /// Advance timers: backoff, connect timeout, keepalive, pong timeout.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.state {
            SessionState::Reconnecting => {
                if self.intentional {
                    return Vec::new();
                }
                match self.retry_deadline {
                    Some(deadline) if deadline.elapsed(now) => {
                        self.retry_deadline = None;
                        self.open_current(now)
                    },
                    _ => Vec::new(),
                }
            },
            SessionState::Connecting => match self.connect_deadline {
                Some(deadline) if deadline.elapsed(now) => {
                    tracing::warn!(timeout = ?self.config.connect_timeout, "connect timed out");
                    self.connection_lost(now)
                },
                _ => Vec::new(),
            },
            SessionState::Connected => {
                if let Some(deadline) = self.pong_deadline
                    && deadline.elapsed(now)
                {
                    tracing::warn!(timeout = ?self.config.pong_timeout, "pong timed out");
                    return self.connection_lost(now);
                }

                if self.keepalive_paused || self.pong_deadline.is_some() {
                    return Vec::new();
                }

                let due = self
                    .last_ping
                    .is_none_or(|last| now - last >= self.config.keepalive_interval);
                if due {
                    self.last_ping = Some(now);
                    self.pong_deadline = Some(Deadline::new(now, self.config.pong_timeout));
                    vec![ConnectionAction::SendPing]
                } else {
                    Vec::new()
                }
            },
            SessionState::Closing => match self.close_deadline {
                Some(deadline) if deadline.elapsed(now) => {
                    self.close_deadline = None;
                    self.transition(SessionState::Disconnected);
                    Vec::new()
                },
                _ => Vec::new(),
            },
            SessionState::Disconnected => Vec::new(),
        }
    }

    /// Time until the next deadline. `None` if no timer is armed.
    #[must_use]
    pub fn poll_timeout(&self, now: I) -> Option<Duration> {
        match self.state {
            SessionState::Reconnecting => self.retry_deadline.map(|d| d.remaining(now)),
            SessionState::Connecting => self.connect_deadline.map(|d| d.remaining(now)),
            SessionState::Closing => self.close_deadline.map(|d| d.remaining(now)),
            SessionState::Connected => {
                let pong = self.pong_deadline.map(|d| d.remaining(now));
                let ping = if self.keepalive_paused || self.pong_deadline.is_some() {
                    None
                } else {
                    self.last_ping.map(|last| {
                        Deadline::new(last, self.config.keepalive_interval).remaining(now)
                    })
                };
                match (pong, ping) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            },
            SessionState::Disconnected => None,
        }
    }

    fn connection_lost(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.intentional {
            return Vec::new();
        }

        match self.state {
            SessionState::Connected | SessionState::Connecting => {
                let mut actions = vec![ConnectionAction::CloseTransport];
                actions.extend(self.schedule_reconnect(now));
                actions
            },
            SessionState::Reconnecting | SessionState::Disconnected | SessionState::Closing => {
                Vec::new()
            },
        }
    }

    fn schedule_reconnect(&mut self, now: I) -> Vec<ConnectionAction> {
        self.clear_timers();
        self.attempt = self.attempt.saturating_add(1);

        if self.config.backoff.exhausted(self.attempt) {
            tracing::warn!(attempts = self.config.backoff.max_attempts, "reconnect attempts exhausted");
            self.transition(SessionState::Disconnected);
            return vec![ConnectionAction::Offline { reason: OfflineReason::RetriesExhausted }];
        }

        let random = self.next_random();
        let delay = self.config.backoff.jittered_delay(self.attempt, random);
        tracing::info!(attempt = self.attempt, ?delay, "scheduling reconnect");

        self.retry_deadline = Some(Deadline::new(now, delay));
        self.transition(SessionState::Reconnecting);
        Vec::new()
    }

    fn open_current(&mut self, now: I) -> Vec<ConnectionAction> {
        let Some(url) = self.url.clone() else {
            self.transition(SessionState::Disconnected);
            return Vec::new();
        };
        self.begin_connecting(now);
        vec![ConnectionAction::OpenTransport { url }]
    }

    fn begin_connecting(&mut self, now: I) {
        self.clear_timers();
        self.connect_deadline = Some(Deadline::new(now, self.config.connect_timeout));
        self.transition(SessionState::Connecting);
    }

    fn clear_timers(&mut self) {
        self.connect_deadline = None;
        self.retry_deadline = None;
        self.close_deadline = None;
        self.pong_deadline = None;
        self.last_ping = None;
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            tracing::info!(from = ?self.state, ?to, attempt = self.attempt, "session state");
            self.state = to;
        }
    }

    fn next_random(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        u32::try_from(x >> 32).unwrap_or(0)
    }
}

/// Append the token as a query credential, replacing any existing one.
///
/// # Errors
///
/// - `ConnectionError::InvalidEndpoint` if `endpoint` does not parse or uses
///   an unsupported scheme
pub fn endpoint_with_token(endpoint: &str, token: &str) -> Result<String, ConnectionError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| ConnectionError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
        return Err(ConnectionError::InvalidEndpoint(format!(
            "{endpoint}: unsupported scheme {}",
            url.scheme()
        )));
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != TOKEN_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut().clear().extend_pairs(kept).append_pair(TOKEN_PARAM, token);

    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    const ENDPOINT: &str = "wss://chat.example.com/ws";

    fn connection() -> Connection<Instant> {
        Connection::new(ConnectionConfig::new(ENDPOINT), 7)
    }

    fn connected(t0: Instant) -> Connection<Instant> {
        let mut conn = connection();
        conn.connect("abc", t0).unwrap();
        conn.transport_opened(t0);
        conn
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn connect_appends_token_query() {
        let mut conn = connection();
        let actions = conn.connect("abc", Instant::now()).unwrap();

        assert_eq!(conn.state(), SessionState::Connecting);
        assert_eq!(actions, vec![ConnectionAction::OpenTransport {
            url: "wss://chat.example.com/ws?token=abc".into()
        }]);
    }

    #[test]
    fn token_replaces_existing_query_credential() {
        let url = endpoint_with_token("ws://h/ws?v=2&token=old", "new").unwrap();
        assert_eq!(url, "ws://h/ws?v=2&token=new");
        assert!(endpoint_with_token("ftp://h/ws", "x").is_err());
        assert!(endpoint_with_token("not a url", "x").is_err());
    }

    #[test]
    fn opened_flushes_and_resets_attempts() {
        let t0 = Instant::now();
        let mut conn = connection();
        conn.connect("abc", t0).unwrap();
        conn.transport_failed(&ConnectionError::Transport("refused".into()), t0);
        assert_eq!(conn.attempt(), 1);

        conn.tick(t0 + secs(1));
        let actions = conn.transport_opened(t0 + secs(1));

        assert_eq!(actions, vec![ConnectionAction::FlushQueue]);
        assert_eq!(conn.state(), SessionState::Connected);
        assert_eq!(conn.attempt(), 0);
    }

    #[test]
    fn reconnect_waits_for_backoff() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        let actions = conn.transport_closed(t0);
        assert_eq!(actions, vec![ConnectionAction::CloseTransport]);
        assert_eq!(conn.state(), SessionState::Reconnecting);
        assert_eq!(conn.poll_timeout(t0), Some(secs(1)));

        assert!(conn.tick(t0 + Duration::from_millis(500)).is_empty());
        let actions = conn.tick(t0 + secs(1));
        assert!(matches!(actions.as_slice(), [ConnectionAction::OpenTransport { .. }]));
        assert_eq!(conn.state(), SessionState::Connecting);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut now = Instant::now();
        let mut conn = connection();
        conn.connect("abc", now).unwrap();

        let err = ConnectionError::Transport("refused".into());
        let mut last = Vec::new();
        for _ in 0..9 {
            last = conn.transport_failed(&err, now);
            if conn.state() == SessionState::Disconnected {
                break;
            }
            now += conn.poll_timeout(now).unwrap();
            conn.tick(now);
        }

        assert_eq!(conn.state(), SessionState::Disconnected);
        assert!(last.contains(&ConnectionAction::Offline { reason: OfflineReason::RetriesExhausted }));
    }

    #[test]
    fn disconnect_cancels_pending_backoff() {
        let t0 = Instant::now();
        let mut conn = connected(t0);
        conn.transport_closed(t0);
        assert_eq!(conn.state(), SessionState::Reconnecting);

        let actions = conn.disconnect(t0);
        assert_eq!(actions, vec![ConnectionAction::ClearQueue]);
        assert_eq!(conn.state(), SessionState::Disconnected);
        assert_eq!(conn.token(), None);

        assert!(conn.tick(t0 + secs(60)).is_empty());
        assert!(conn.ensure_connected(t0 + secs(60)).is_empty());
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[test]
    fn disconnect_while_connected_passes_through_closing() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        let actions = conn.disconnect(t0);
        assert_eq!(actions, vec![ConnectionAction::ClearQueue, ConnectionAction::CloseTransport]);
        assert_eq!(conn.state(), SessionState::Closing);

        assert!(conn.transport_closed(t0).is_empty());
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[test]
    fn missing_pong_triggers_reconnect() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        assert!(conn.tick(t0 + secs(29)).is_empty());
        assert_eq!(conn.tick(t0 + secs(30)), vec![ConnectionAction::SendPing]);
        assert_eq!(conn.poll_timeout(t0 + secs(30)), Some(secs(10)));

        let actions = conn.tick(t0 + secs(40));
        assert_eq!(actions, vec![ConnectionAction::CloseTransport]);
        assert_eq!(conn.state(), SessionState::Reconnecting);
    }

    #[test]
    fn pong_keeps_session_alive() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        conn.tick(t0 + secs(30));
        conn.pong_received(t0 + secs(31));
        assert!(conn.tick(t0 + secs(45)).is_empty());
        assert_eq!(conn.tick(t0 + secs(60)), vec![ConnectionAction::SendPing]);
        assert_eq!(conn.state(), SessionState::Connected);
    }

    #[test]
    fn background_pauses_keepalive_until_foreground() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        conn.enter_background();
        assert!(conn.tick(t0 + secs(300)).is_empty());
        assert_eq!(conn.poll_timeout(t0 + secs(300)), None);
        assert_eq!(conn.state(), SessionState::Connected);

        let actions = conn.ensure_connected(t0 + secs(300));
        assert_eq!(actions, vec![ConnectionAction::SendPing]);
        assert!(!conn.is_keepalive_paused());
    }

    #[test]
    fn ensure_connected_skips_backoff() {
        let t0 = Instant::now();
        let mut conn = connected(t0);
        conn.transport_closed(t0);
        conn.tick(t0 + secs(1));
        conn.transport_failed(&ConnectionError::Transport("down".into()), t0 + secs(1));
        assert_eq!(conn.attempt(), 2);

        let actions = conn.ensure_connected(t0 + secs(1));
        assert!(matches!(actions.as_slice(), [ConnectionAction::OpenTransport { .. }]));
        assert_eq!(conn.attempt(), 0);
    }

    #[test]
    fn auth_rejection_blocks_reconnect_until_new_token() {
        let t0 = Instant::now();
        let mut conn = connection();
        conn.connect("stale", t0).unwrap();

        let actions = conn.transport_failed(&ConnectionError::AuthRejected("401".into()), t0);
        assert!(actions.contains(&ConnectionAction::Offline { reason: OfflineReason::AuthRejected }));
        assert_eq!(conn.state(), SessionState::Disconnected);
        assert!(conn.ensure_connected(t0 + secs(5)).is_empty());

        let actions = conn.connect("fresh", t0 + secs(5)).unwrap();
        assert!(matches!(actions.as_slice(), [ConnectionAction::OpenTransport { url }] if url.ends_with("token=fresh")));
        assert!(!conn.is_auth_rejected());
    }

    #[test]
    fn connect_timeout_counts_as_failure() {
        let t0 = Instant::now();
        let mut conn = connection();
        conn.connect("abc", t0).unwrap();

        assert!(conn.tick(t0 + secs(14)).is_empty());
        assert_eq!(conn.tick(t0 + DEFAULT_CONNECT_TIMEOUT), vec![ConnectionAction::CloseTransport]);
        assert_eq!(conn.state(), SessionState::Reconnecting);
        assert_eq!(conn.attempt(), 1);
    }

    #[test]
    fn reconnect_with_new_token_replaces_transport() {
        let t0 = Instant::now();
        let mut conn = connected(t0);

        let actions = conn.connect("rotated", t0).unwrap();
        assert_eq!(actions[0], ConnectionAction::CloseTransport);
        assert!(matches!(&actions[1], ConnectionAction::OpenTransport { url } if url.ends_with("token=rotated")));
    }
}
