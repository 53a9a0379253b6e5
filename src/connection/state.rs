//! Connection lifecycle state.

use std::fmt;

use tokio::sync::watch;

use crate::error::{Result, WireError};

/// Where a connection is in its lifecycle.
///
/// ```text
/// Connecting ─► AuthenticatingChallenge ─► Ready ─► Draining ─► Closed
///      │                  │                  │                     ▲
///      └──────────────────┴──────────────────┴─────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket open, startup exchange in progress.
    Connecting,
    /// Server asked for authentication; challenge exchange in progress.
    AuthenticatingChallenge,
    /// Accepting requests.
    Ready,
    /// Refusing new requests while in-flight ones finish.
    Draining,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Check that new requests are accepted.
    ///
    /// # Errors
    ///
    /// `ConnectionDraining` while draining, `ConnectionClosed` in every
    /// other state but `Ready`.
    pub fn accepts_requests(self) -> Result<()> {
        match self {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Draining => Err(WireError::ConnectionDraining),
            _ => Err(WireError::ConnectionClosed),
        }
    }

    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Draining, Closed) => true,
            (Draining, _) => false,
            (from, to) => from != to,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AuthenticatingChallenge => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Owned by the connection; observers subscribe.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        Self { tx }
    }

    #[inline]
    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next` if the lifecycle allows it. Returns false otherwise.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.can_become(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            tracing::debug!(%from, to = %next, "connection state changed");
        }
        changed
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
