//! Server lifecycle state.
//!
//! ```text
//! Uninitialized ──run()──▶ Starting ──pools + bind ok──▶ Serving
//!                             │                              │ stop signal
//!                             │ startup failure              ▼
//!                             └─────────────────────────▶ Draining ──pools drained──▶ Stopped
//! ```
//!
//! Transitions only move forward. Readers never take a lock.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerState {
    Uninitialized = 0,
    Starting = 1,
    Serving = 2,
    Draining = 3,
    Stopped = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Uninitialized,
            1 => ServerState::Starting,
            2 => ServerState::Serving,
            3 => ServerState::Draining,
            _ => ServerState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Starting => "starting",
            ServerState::Serving => "serving",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for [`ServerState`] with change notification.
#[derive(Debug)]
pub(crate) struct StateCell {
    value: AtomicU8,
    changed: Notify,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicU8::new(ServerState::Uninitialized as u8),
            changed: Notify::new(),
        }
    }

    pub(crate) fn get(&self) -> ServerState {
        ServerState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Move `from -> to`. Returns `false` if the current state is not `from`.
    pub(crate) fn transition(&self, from: ServerState, to: ServerState) -> bool {
        debug_assert!(from < to, "state transitions only move forward");
        let swapped = self
            .value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            tracing::debug!(from = %from, to = %to, "server state changed");
            self.changed.notify_waiters();
        }
        swapped
    }

    /// Move forward to `to` from whatever earlier state the server is in.
    /// No-op when already at or past `to`.
    pub(crate) fn advance(&self, to: ServerState) {
        let mut current = self.value.load(Ordering::Acquire);
        while current < to as u8 {
            match self.value.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(from = %ServerState::from_u8(current), to = %to, "server state changed");
                    self.changed.notify_waiters();
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// True unless the server is accepting new sessions.
    pub(crate) fn is_closed(&self) -> bool {
        self.get() != ServerState::Serving
    }

    /// Wait until `pred` holds for the current state.
    pub(crate) async fn wait_for(&self, pred: impl Fn(ServerState) -> bool) -> ServerState {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before re-checking so a transition in between is not lost.
            notified.as_mut().enable();
            let state = self.get();
            if pred(state) {
                return state;
            }
            notified.await;
        }
    }
}
