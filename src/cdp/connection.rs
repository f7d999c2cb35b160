//! CDP Connection/Session Management
//!
//! One physical channel to the browser, multiplexed into per-target
//! sessions. The connection stamps outgoing commands with unique ids,
//! correlates replies back to their callers, and routes unsolicited
//! events to per-session and connection-wide listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::transport::MessageSink;
use super::types::{DetachedFromTargetEvent, TargetAttachToTarget, TargetAttachToTargetResult};
use crate::error::{Error, Result};
use crate::sync::Gate;

/// Process-wide command id counter. Monotonic across every connection so
/// ids never collide even with several browsers in one process.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// An unsolicited protocol notification.
///
/// `session_id` is present for events scoped to an attached target and
/// absent for connection-level events such as target lifecycle.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Handle for removing a registered event listener
pub type ListenerId = u64;

type EventCallback = Arc<dyn Fn(&ProtocolEvent) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    session: Option<String>,
    callback: EventCallback,
}

/// An outstanding command awaiting its correlated reply
struct PendingCall {
    method: String,
    session: Option<String>,
    tx: oneshot::Sender<Result<Value>>,
}

/// Resolves pending calls off the receive loop.
///
/// A caller continuation may synchronously issue another command and block
/// on its reply; resolving inline on the receive loop would stop the loop
/// from pumping that reply and deadlock. Each resolution runs on its own
/// task instead. The oneshot sender is consumed by the single map removal,
/// so at most one resolution is ever enqueued per call.
struct ResponseQueue;

impl ResponseQueue {
    fn enqueue(call: PendingCall, outcome: Result<Value>) {
        tokio::spawn(async move {
            if call.tx.send(outcome).is_err() {
                // Caller gave up (dropped its future); nothing to deliver.
                tracing::debug!("Reply for {} dropped: caller gone", call.method);
            }
        });
    }
}

struct SessionEntry {
    target_id: String,
    closed: Gate<String>,
}

struct ConnectionInner {
    sink: Arc<dyn MessageSink>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    closed: Gate<String>,
}

/// A CDP connection to a browser
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection over a message sink and its inbound stream.
    ///
    /// Spawns the receive loop: inbound messages are dispatched serially,
    /// in arrival order. When the stream ends the connection closes and
    /// every outstanding call is rejected.
    pub fn new(
        sink: Arc<dyn MessageSink>,
        mut incoming: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            sink,
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            closed: Gate::new(),
        });

        let conn = Self { inner };
        let loop_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(raw) = incoming.recv().await {
                loop_conn.dispatch(&raw);
            }
            loop_conn.close("transport closed");
        });

        conn
    }

    /// Send a command on the browser-level channel
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let value = self
            .raw_send(None, method, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a command scoped to an attached session
    pub async fn send_to_session<C, R>(
        &self,
        session_id: &str,
        method: &str,
        params: &C,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let value = self
            .raw_send(Some(session_id), method, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send with pre-serialized params, returning the raw result value
    pub async fn raw_send(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if let Some(reason) = self.inner.closed.peek() {
            return Err(Error::closed(reason));
        }

        let id = NEXT_CALL_ID.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Record before transmitting so an immediate reply cannot race the
        // registration.
        {
            let mut pending = self.inner.pending.lock();
            pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    session: session_id.map(String::from),
                    tx,
                },
            );
        }

        // A close racing this send may have drained the map before the
        // insert; re-checking afterwards guarantees no caller is left
        // awaiting a reply that can never come.
        if let Some(reason) = self.inner.closed.peek() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::closed(reason));
        }

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(sid) = session_id {
            msg["sessionId"] = json!(sid);
        }
        let data = serde_json::to_string(&msg)?;

        if let Err(e) = self.inner.sink.send(&data) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        tracing::trace!(
            "Sent command: {} (id={}, session={:?})",
            method,
            id,
            session_id
        );

        rx.await
            .unwrap_or_else(|_| Err(Error::closed("connection closed")))
    }

    /// Dispatch one raw inbound message. Invoked by the receive loop.
    pub fn dispatch(&self, raw: &str) {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to parse message: {} - {}", e, raw);
                return;
            }
        };

        // Replies carry an id; everything else is an event.
        if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
            let call = self.inner.pending.lock().remove(&id);
            match call {
                Some(call) => {
                    let outcome = if let Some(error) = msg.get("error") {
                        Err(Error::protocol(
                            &call.method,
                            error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
                            error
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("unknown"),
                        ))
                    } else {
                        Ok(msg.get("result").cloned().unwrap_or(json!({})))
                    };
                    ResponseQueue::enqueue(call, outcome);
                }
                None => {
                    tracing::debug!("Reply for unknown id {}, dropping", id);
                }
            }
        } else if let Some(method) = msg.get("method").and_then(|m| m.as_str()) {
            let params = msg.get("params").cloned().unwrap_or(json!({}));
            let session_id = msg
                .get("sessionId")
                .and_then(|s| s.as_str())
                .map(String::from);

            // A child session detaching closes that session's sub-channel.
            if method == "Target.detachedFromTarget" {
                if let Ok(ev) = serde_json::from_value::<DetachedFromTargetEvent>(params.clone()) {
                    self.close_session(&ev.session_id, "target detached");
                }
            }

            let event = ProtocolEvent {
                method: method.to_string(),
                params,
                session_id,
            };
            self.emit(&event);
        }
    }

    fn emit(&self, event: &ProtocolEvent) {
        // Snapshot the matching callbacks, then invoke without the lock so
        // a callback can (un)subscribe.
        let callbacks: Vec<EventCallback> = {
            let listeners = self.inner.listeners.lock();
            listeners
                .iter()
                .filter(|entry| entry.session == event.session_id)
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Register a listener for connection-level events (no session id)
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ProtocolEvent) + Send + Sync + 'static,
    {
        self.add_listener(None, Arc::new(callback))
    }

    fn add_listener(&self, session: Option<String>, callback: EventCallback) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push(ListenerEntry {
            id,
            session,
            callback,
        });
        id
    }

    /// Remove a listener registered with [`subscribe`](Self::subscribe) or
    /// [`CdpSession::subscribe`]. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|entry| entry.id != id);
    }

    /// Attach to a target, opening a session sub-channel for it
    pub async fn create_session(&self, target_id: &str) -> Result<CdpSession> {
        let result: TargetAttachToTargetResult = self
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: target_id.to_string(),
                    flatten: Some(true),
                },
            )
            .await?;

        let closed = Gate::new();
        self.inner.sessions.lock().insert(
            result.session_id.clone(),
            SessionEntry {
                target_id: target_id.to_string(),
                closed: closed.clone(),
            },
        );

        Ok(CdpSession {
            conn: self.clone(),
            session_id: result.session_id,
            target_id: target_id.to_string(),
            closed,
        })
    }

    /// Close one session: every outstanding call recorded under it fails
    /// with [`Error::TargetClosed`] so no caller awaits forever.
    pub fn close_session(&self, session_id: &str, reason: &str) {
        if let Some(entry) = self.inner.sessions.lock().remove(session_id) {
            entry.closed.resolve(reason.to_string());
        }
        let drained = self.drain_pending(|call| call.session.as_deref() == Some(session_id));
        if !drained.is_empty() {
            tracing::debug!(
                "Session {} closed ({}), rejecting {} pending calls",
                session_id,
                reason,
                drained.len()
            );
        }
        for call in drained {
            ResponseQueue::enqueue(call, Err(Error::closed(reason)));
        }
    }

    /// Close every session attached to a target. A destroyed target takes
    /// its sessions (and their pending calls) with it.
    pub fn close_target_sessions(&self, target_id: &str, reason: &str) {
        let ids: Vec<String> = {
            let sessions = self.inner.sessions.lock();
            sessions
                .iter()
                .filter(|(_, entry)| entry.target_id == target_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.close_session(&id, reason);
        }
    }

    /// Close the connection: rejects every outstanding call on every
    /// session, resolves all session close gates, and shuts the sink.
    pub fn close(&self, reason: &str) {
        if !self.inner.closed.resolve(reason.to_string()) {
            return;
        }
        let sessions: Vec<SessionEntry> = {
            let mut map = self.inner.sessions.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in sessions {
            entry.closed.resolve(reason.to_string());
        }
        for call in self.drain_pending(|_| true) {
            ResponseQueue::enqueue(call, Err(Error::closed(reason)));
        }
        let _ = self.inner.sink.close();
    }

    /// Gate resolving with the close reason once the connection is gone
    pub fn closed(&self) -> Gate<String> {
        self.inner.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_resolved()
    }

    fn drain_pending<F>(&self, mut select: F) -> Vec<PendingCall>
    where
        F: FnMut(&PendingCall) -> bool,
    {
        let mut pending = self.inner.pending.lock();
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, call)| select(call))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    }
}

/// A session sub-channel bound to one attached target.
///
/// The session's lifetime is bounded by its target's: target detach or
/// destruction closes the session and fails its outstanding calls.
#[derive(Clone)]
pub struct CdpSession {
    conn: Connection,
    session_id: String,
    target_id: String,
    closed: Gate<String>,
}

impl CdpSession {
    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Send a command to this session
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        if let Some(reason) = self.closed.peek() {
            return Err(Error::closed(reason));
        }
        self.conn
            .send_to_session(&self.session_id, method, params)
            .await
    }

    /// Register a listener for this session's events
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ProtocolEvent) + Send + Sync + 'static,
    {
        self.conn
            .add_listener(Some(self.session_id.clone()), Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.conn.unsubscribe(id);
    }

    /// Gate resolving with the close reason once this session is gone
    pub fn closed(&self) -> Gate<String> {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_resolved()
    }

    /// The connection this session is multiplexed over
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
