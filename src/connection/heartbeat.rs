//! Idle keep-alive, expired-slot sweeping and the abandoned-id check.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::WireError;
use crate::protocol::Opcode;
use crate::response::ResponseBody;

use super::{ConnectionState, Shared};

/// Runs until the connection closes. Sends OPTIONS whenever nothing was
/// read or written for a whole interval; a missed answer kills the
/// connection.
pub(super) async fn run(shared: Arc<Shared>) {
    let interval = shared.config.heartbeat_interval;
    let timeout = shared.config.effective_heartbeat_timeout();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let state = shared.state.get();
        if state == ConnectionState::Closed {
            return;
        }
        let swept = shared.mux.sweep_expired(Instant::now());
        if swept > 0 {
            tracing::debug!(swept, peer = %shared.peer, "timed out expired requests");
        }
        if shared.check_abandoned().is_err() {
            return;
        }
        if state != ConnectionState::Ready || shared.idle_for() < interval {
            continue;
        }

        tracing::trace!(peer = %shared.peer, "sending heartbeat");
        match shared.execute(Opcode::Options, Bytes::new(), timeout).await {
            Ok(response) => {
                if !matches!(response.body, ResponseBody::Supported(_)) {
                    tracing::warn!(kind = response.body.kind(), "unexpected heartbeat response");
                }
            }
            Err(WireError::ExhaustedStreamIds(_)) | Err(WireError::BackpressureTimeout) => {
                tracing::debug!(peer = %shared.peer, "connection busy, skipping heartbeat");
            }
            Err(WireError::ConnectionClosed) if shared.state.get() == ConnectionState::Closed => {
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %shared.peer, error = %e, "heartbeat failed, closing connection");
                shared.fail(WireError::ConnectionAborted(
                    format!("heartbeat failed: {}", e).into(),
                ));
                return;
            }
        }
    }
}
