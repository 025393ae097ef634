//! Connection state machine
//!
//! Single-writer pattern: every transition of a [`StreamConnection`] goes
//! through `reduce()`, which returns the next phase and the effects the
//! connection must execute. The reducer is pure; timers, sockets and
//! callbacks live in the effect runner.
//!
//! Staleness is handled by the caller: events from a superseded attempt or
//! socket are dropped before they reach the reducer.
//!
//! [`StreamConnection`]: super::StreamConnection

use serde::{Deserialize, Serialize};

use super::reconnect::ReconnectPolicy;

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal state of one connection.
/// `retries` counts automatic attempts used since the last successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting {
        retries: u32,
    },
    Connected,
    Reconnecting {
        retries: u32,
    },
    /// After `disconnect()`: terminal, `connect()` is ignored
    Closed,
}

impl Phase {
    pub fn public(&self) -> ConnectionState {
        match self {
            Phase::Disconnected | Phase::Closed => ConnectionState::Disconnected,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
            Phase::Reconnecting { .. } => ConnectionState::Reconnecting,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Caller asked to connect
    ConnectRequested,
    /// Token fetched and socket opened
    AttemptSucceeded,
    /// Token fetch, socket open or breaker admission failed
    AttemptFailed { message: String, fatal: bool },
    /// Live socket ended with a close frame or stream end
    SocketClosed { clean: bool, message: String },
    /// Live socket reported an error (transport or server-side)
    SocketFailed { message: String, fatal: bool },
    /// Backoff timer elapsed
    RetryFired,
    /// Caller asked to disconnect
    DisconnectRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch a token and open a socket
    StartAttempt,
    /// Arm the backoff timer; `attempt` is the 0-based retry index
    ScheduleRetry { attempt: u32 },
    CancelRetry,
    CloseSocket,
    /// Move buffered frames onto the live socket
    FlushBuffer,
    /// Drop buffered frames and dedup state
    ClearBuffers,
    NotifyConnected,
    ReportError { message: String, can_retry: bool },
}

/// Reducer function: (phase, event) -> (next_phase, effects)
///
/// Key rules:
/// - `connect()` while connecting/connected/reconnecting is a no-op
/// - a fatal failure never schedules a retry
/// - at most `policy.max_attempts` automatic attempts after the first failure
/// - a clean close never reconnects
/// - `Closed` absorbs everything
pub fn reduce(phase: &Phase, event: Event, policy: &ReconnectPolicy) -> (Phase, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use Phase::*;

    // Retry while attempts remain, otherwise give up for good
    let retry_or_give_up = |used: u32, message: String| -> (Phase, Vec<Effect>) {
        if policy.should_retry(used) {
            (
                Reconnecting { retries: used + 1 },
                vec![
                    ReportError {
                        message,
                        can_retry: true,
                    },
                    ScheduleRetry { attempt: used },
                ],
            )
        } else {
            (
                Disconnected,
                vec![ReportError {
                    message: format!(
                        "Giving up after {} reconnect attempts: {}",
                        policy.max_attempts, message
                    ),
                    can_retry: false,
                }],
            )
        }
    };

    match (phase, event) {
        // -----------------
        // Closed (terminal)
        // -----------------
        (Closed, _) => (Closed, vec![]),

        // -----------------
        // Disconnect from anywhere
        // -----------------
        (_, DisconnectRequested) => (Closed, vec![CancelRetry, CloseSocket, ClearBuffers]),

        // -----------------
        // Disconnected
        // -----------------
        (Disconnected, ConnectRequested) => (Connecting { retries: 0 }, vec![StartAttempt]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { .. }, AttemptSucceeded) => (Connected, vec![NotifyConnected, FlushBuffer]),
        (Connecting { .. }, AttemptFailed { message, fatal: true }) => (
            Disconnected,
            vec![ReportError {
                message,
                can_retry: false,
            }],
        ),
        (Connecting { retries }, AttemptFailed { message, fatal: false }) => {
            retry_or_give_up(*retries, message)
        }

        // -----------------
        // Connected
        // -----------------
        (Connected, SocketClosed { clean: true, .. }) => (Disconnected, vec![CloseSocket]),
        (Connected, SocketClosed { clean: false, message }) => {
            let (next, mut effects) = retry_or_give_up(0, message);
            effects.insert(0, CloseSocket);
            (next, effects)
        }
        (Connected, SocketFailed { message, fatal: true }) => (
            Disconnected,
            vec![
                CloseSocket,
                ReportError {
                    message,
                    can_retry: false,
                },
            ],
        ),
        (Connected, SocketFailed { message, fatal: false }) => {
            let (next, mut effects) = retry_or_give_up(0, message);
            effects.insert(0, CloseSocket);
            (next, effects)
        }

        // -----------------
        // Reconnecting
        // -----------------
        (Reconnecting { retries }, RetryFired) => {
            (Connecting { retries: *retries }, vec![StartAttempt])
        }

        // -----------------
        // Idempotent connect / unhandled: no transition
        // -----------------
        (Connecting { .. } | Connected | Reconnecting { .. }, ConnectRequested) => {
            (phase.clone(), vec![])
        }
        _ => (phase.clone(), vec![]),
    }
}
