//! Per-connection session state.
//!
//! A `Session` is shared between the connection's reader loop, its turn task,
//! and the liveness supervisor. Outbound frames go through a bounded channel
//! to the connection's writer task; every send checks the open flag first so
//! nothing is queued for a connection that is already closing.

use super::protocol::{ServerMessage, encode};
use axum::extract::ws::Message;
use parking_lot::Mutex;
use serenity_core::prompt::CallContext;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a session is in its reply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Generating,
    Flushing,
}

/// One open duplex connection with the voice platform.
pub struct Session {
    pub id: Uuid,
    /// Call identifier taken from the upgrade path, for logs.
    pub call_label: String,
    tx: mpsc::Sender<Message>,
    open: AtomicBool,
    closed: CancellationToken,
    is_alive: AtomicBool,
    missed_pongs: AtomicU32,
    last_pong: Mutex<Instant>,
    turn_state: Mutex<TurnState>,
    call_context: Mutex<Option<CallContext>>,
}

impl Session {
    pub fn new(call_label: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_label: call_label.into(),
            tx,
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            is_alive: AtomicBool::new(true),
            missed_pongs: AtomicU32::new(0),
            last_pong: Mutex::new(Instant::now()),
            turn_state: Mutex::new(TurnState::Idle),
            call_context: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Marks the session closed and wakes everything waiting on it.
    /// Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(session_id = %self.id, "Session marked closed.");
        }
        self.closed.cancel();
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Serializes and queues a message, waiting for channel capacity.
    ///
    /// Returns `false` without sending if the session is closed or the
    /// writer has gone away; the latter also marks the session closed.
    pub async fn send(&self, msg: &ServerMessage) -> bool {
        let text = match encode(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to encode outbound message.");
                return false;
            }
        };
        if !self.is_open() {
            debug!(session_id = %self.id, "Dropping outbound message for closed session.");
            return false;
        }
        if self.tx.send(Message::Text(text.into())).await.is_err() {
            debug!(session_id = %self.id, "Writer task gone; closing session.");
            self.close();
            return false;
        }
        true
    }

    /// Queues a transport-level frame without waiting. Used by the
    /// supervisor, which must not block on a slow connection.
    pub fn try_send_raw(&self, frame: Message) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Records a liveness acknowledgment.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
        *self.last_pong.lock() = Instant::now();
    }

    /// Returns whether an acknowledgment arrived since the last check, and
    /// clears the flag for the next probe.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::SeqCst)
    }

    /// Updates the consecutive-miss counter after a check and returns it.
    pub fn record_check(&self, was_alive: bool) -> u32 {
        if was_alive {
            self.missed_pongs.store(0, Ordering::SeqCst);
            0
        } else {
            self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    pub fn turn_state(&self) -> TurnState {
        *self.turn_state.lock()
    }

    /// Moves `Idle` to `Generating`. Returns `false`, changing nothing, if a
    /// turn is already in progress.
    pub fn try_begin_turn(&self) -> bool {
        let mut state = self.turn_state.lock();
        if *state != TurnState::Idle {
            return false;
        }
        *state = TurnState::Generating;
        true
    }

    pub fn set_turn_state(&self, next: TurnState) {
        *self.turn_state.lock() = next;
    }

    /// Caches the call's dynamic variables from a `call_details` event.
    pub fn set_call_context(&self, vars: CallContext) {
        *self.call_context.lock() = Some(vars);
    }

    pub fn call_context(&self) -> Option<CallContext> {
        self.call_context.lock().clone()
    }
}
