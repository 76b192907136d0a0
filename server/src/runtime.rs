// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Session-keyed connection, task and pending-decision bookkeeping.
//!
//! One lock guards the three maps and is held only for their updates,
//! never while awaiting I/O. Connection writes happen after the lock is
//! released; a failed write evicts the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dataagent_core::hitl::PendingHitlRegistry;
use dataagent_protocol::Decision;
use dataagent_protocol::Event;
use dataagent_protocol::ServerEvent;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Close code sent when the pool is full ("try again later").
pub const CAPACITY_CLOSE_CODE: u16 = 1013;

/// A live client connection as seen by the runtime. Implementations
/// queue writes internally; `send_text` must not block on the peer.
pub trait ClientConnection: Send + Sync {
    fn send_text(&self, text: &str) -> std::io::Result<()>;
    fn close(&self, code: u16, reason: &str);
}

/// Outcome of a pending-decision wait, distinguishing the two nil cases.
#[derive(Debug, PartialEq)]
pub enum WaitOutcome {
    Decision(Decision),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct RuntimeState {
    connections: HashMap<String, Arc<dyn ClientConnection>>,
    tasks: HashMap<String, AbortHandle>,
    pending_decisions: HashMap<String, oneshot::Sender<Decision>>,
}

pub struct SessionRuntime {
    max_connections: usize,
    hitl_registry: Arc<PendingHitlRegistry>,
    state: Mutex<RuntimeState>,
}

impl SessionRuntime {
    pub fn new(max_connections: usize, hitl_registry: Arc<PendingHitlRegistry>) -> Self {
        Self {
            max_connections,
            hitl_registry,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn hitl_registry(&self) -> Arc<PendingHitlRegistry> {
        Arc::clone(&self.hitl_registry)
    }

    /// Accept a connection, or refuse it (closing with the capacity
    /// code) when the pool is full. Existing sessions are unaffected by
    /// refusals.
    pub fn connect(&self, conn: Arc<dyn ClientConnection>, session_id: &str) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.connections.len() >= self.max_connections {
                drop(state);
                warn!("refusing connection for session {session_id}: at capacity");
                conn.close(CAPACITY_CLOSE_CODE, "Service at capacity");
                return false;
            }
            state.connections.insert(session_id.to_string(), conn);
        }
        debug!("session {session_id} connected");
        true
    }

    /// Cancel the active task, drop any pending decision (its waiter
    /// observes a cancellation), cancel the session's HITL slots and
    /// forget the connection. Safe for unknown sessions.
    pub fn disconnect(&self, session_id: &str) {
        let (connection, task, _decision) = {
            let mut state = self.state.lock().unwrap();
            (
                state.connections.remove(session_id),
                state.tasks.remove(session_id),
                state.pending_decisions.remove(session_id),
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        self.hitl_registry.cancel_pending_requests(session_id);
        if connection.is_some() {
            info!("session {session_id} disconnected");
        }
    }

    /// Serialize and write an envelope. Returns `false` for unknown
    /// sessions; a write error evicts the session.
    pub fn send(&self, session_id: &str, event: &ServerEvent) -> bool {
        let Some(conn) = self
            .state
            .lock()
            .unwrap()
            .connections
            .get(session_id)
            .cloned()
        else {
            return false;
        };
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to serialize event for session {session_id}: {e}");
                return false;
            }
        };
        if let Err(e) = conn.send_text(&text) {
            warn!("write failed for session {session_id}, evicting: {e}");
            self.disconnect(session_id);
            return false;
        }
        true
    }

    /// Forward an execution event in the `{event_type, data, timestamp}`
    /// envelope.
    pub fn send_event(&self, session_id: &str, event: &Event) -> bool {
        self.send(session_id, &ServerEvent::from(event))
    }

    /// Record the session's active task so cancellation can reach it. A
    /// previous task for the session is aborted.
    pub fn start_task(&self, session_id: &str, task: JoinHandle<()>) {
        let old = self
            .state
            .lock()
            .unwrap()
            .tasks
            .insert(session_id.to_string(), task.abort_handle());
        if let Some(old) = old {
            old.abort();
        }
    }

    /// Cancel the active task. Returns whether one was active.
    pub fn cancel_task(&self, session_id: &str) -> bool {
        let task = self.state.lock().unwrap().tasks.remove(session_id);
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Register a one-shot decision slot. Must happen before the client
    /// is told to decide, so an immediate answer cannot race the
    /// registration. A previous unresolved slot for the session is
    /// replaced (its waiter observes a cancellation).
    pub fn register_decision_slot(&self, session_id: &str) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        if state
            .pending_decisions
            .insert(session_id.to_string(), tx)
            .is_some()
        {
            warn!("replaced pending decision slot for session {session_id}");
        }
        rx
    }

    /// Await a previously registered slot, cleaning it up on the way
    /// out.
    pub async fn await_decision(
        &self,
        session_id: &str,
        rx: oneshot::Receiver<Decision>,
        timeout: Duration,
    ) -> WaitOutcome {
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => WaitOutcome::Decision(decision),
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_) => WaitOutcome::TimedOut,
        };
        self.state
            .lock()
            .unwrap()
            .pending_decisions
            .remove(session_id);
        outcome
    }

    /// Register and await in one step.
    pub async fn wait_for_decision_detailed(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> WaitOutcome {
        let rx = self.register_decision_slot(session_id);
        self.await_decision(session_id, rx, timeout).await
    }

    /// `Some(decision)` or `None`, with `None` covering timeout and
    /// connection drop alike.
    pub async fn wait_for_decision(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Option<Decision> {
        match self.wait_for_decision_detailed(session_id, timeout).await {
            WaitOutcome::Decision(decision) => Some(decision),
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => None,
        }
    }

    /// Complete the session's decision slot if present and unresolved.
    pub fn resolve_decision(&self, session_id: &str, decision: Decision) -> bool {
        let sender = self
            .state
            .lock()
            .unwrap()
            .pending_decisions
            .remove(session_id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn has_connection(&self, session_id: &str) -> bool {
        self.state.lock().unwrap().connections.contains_key(session_id)
    }

    pub fn has_active_task(&self, session_id: &str) -> bool {
        self.state.lock().unwrap().tasks.contains_key(session_id)
    }

    pub fn has_pending_decision(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .pending_decisions
            .contains_key(session_id)
    }
}
