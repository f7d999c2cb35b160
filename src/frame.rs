//! Frame Tree Synchronization
//!
//! Rebuilds the frame hierarchy of one page from protocol events, binds
//! each frame to its current script execution context, and accumulates
//! per-document lifecycle milestones.
//!
//! The manager owns every frame record in an arena keyed by a stable
//! [`NodeId`]; the protocol's frame id resolves through a second table.
//! Parent/child links are node ids, never pointers, so detach and
//! reattach cannot dangle. All mutation happens synchronously on the
//! connection's receive loop under one lock: each event is applied
//! atomically, and listeners are notified only after the lock is
//! released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::cdp::types::{
    ContextPayload, ExecutionContextCreatedEvent, ExecutionContextDestroyedEvent,
    FrameAttachedEvent, FrameDetachedEvent, FrameNavigatedEvent, FramePayload, FrameTreePayload,
    LifecycleEventPayload, NavigatedWithinDocumentEvent, PageEnable, PageGetFrameTree,
    PageGetFrameTreeResult, PageSetLifecycleEventsEnabled, RuntimeEnable, RuntimeEvaluate,
    RuntimeEvaluateResult,
};
use crate::cdp::{CdpSession, ListenerId, ProtocolEvent};
use crate::error::{Error, Result};

/// Stable identity of one frame record.
///
/// Survives the protocol re-keying the main frame's id on cross-origin
/// navigation; a sub-document reported under a new frame id gets a new
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

type ContextWaiter = oneshot::Sender<Result<ExecutionContext>>;

struct FrameNode {
    frame_id: String,
    parent: Option<NodeId>,
    children: SmallVec<[NodeId; 4]>,
    name: String,
    url: String,
    detached: bool,
    loader_id: String,
    lifecycle: HashSet<String>,
    context_id: Option<i64>,
    context_waiters: Vec<ContextWaiter>,
}

impl FrameNode {
    fn new(frame_id: &str, parent: Option<NodeId>) -> Self {
        Self {
            frame_id: frame_id.to_string(),
            parent,
            children: SmallVec::new(),
            name: String::new(),
            url: String::new(),
            detached: false,
            loader_id: String::new(),
            lifecycle: HashSet::new(),
            context_id: None,
            context_waiters: Vec::new(),
        }
    }
}

struct TreeState {
    nodes: HashMap<NodeId, FrameNode>,
    by_frame_id: HashMap<String, NodeId>,
    /// Live default contexts, remote context id -> owning node
    contexts: HashMap<i64, NodeId>,
    main: Option<NodeId>,
    next_node: u64,
    disposed: bool,
}

impl TreeState {
    fn alloc(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node)
    }
}

/// A change to the frame tree, delivered to subscribers after the
/// mutation has been applied
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Attached { frame: Frame },
    Navigated { frame: Frame },
    NavigatedWithinDocument { frame: Frame, url: String },
    Lifecycle { frame: Frame, name: String },
    Detached { frame: Frame },
}

type FrameCallback = Arc<dyn Fn(&FrameEvent) + Send + Sync>;

struct FrameManagerInner {
    session: CdpSession,
    state: Mutex<TreeState>,
    listeners: Mutex<Vec<(ListenerId, FrameCallback)>>,
    next_listener: AtomicU64,
    session_listener: Mutex<Option<ListenerId>>,
}

/// Tracks the frame tree of one page target
#[derive(Clone)]
pub struct FrameManager {
    inner: Arc<FrameManagerInner>,
}

impl FrameManager {
    /// Enable the page/runtime domains on the session, seed the tree from
    /// `Page.getFrameTree`, and start consuming the session's events. The
    /// tree is torn down when the session closes.
    pub async fn attach(session: CdpSession) -> Result<Self> {
        session
            .send::<_, serde_json::Value>("Page.enable", &PageEnable {})
            .await?;
        session
            .send::<_, serde_json::Value>(
                "Page.setLifecycleEventsEnabled",
                &PageSetLifecycleEventsEnabled { enabled: true },
            )
            .await?;
        session
            .send::<_, serde_json::Value>("Runtime.enable", &RuntimeEnable {})
            .await?;

        let tree: PageGetFrameTreeResult =
            session.send("Page.getFrameTree", &PageGetFrameTree {}).await?;

        let manager = Self::new(session);
        manager.seed(&tree.frame_tree);
        manager.start();
        Ok(manager)
    }

    fn new(session: CdpSession) -> Self {
        Self {
            inner: Arc::new(FrameManagerInner {
                session,
                state: Mutex::new(TreeState {
                    nodes: HashMap::new(),
                    by_frame_id: HashMap::new(),
                    contexts: HashMap::new(),
                    main: None,
                    next_node: 0,
                    disposed: false,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                session_listener: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to session events and arm teardown on session close.
    fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let listener = self.inner.session.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                FrameManager { inner }.on_protocol_event(event);
            }
        });
        *self.inner.session_listener.lock() = Some(listener);

        let weak = Arc::downgrade(&self.inner);
        let closed = self.inner.session.closed();
        tokio::spawn(async move {
            let reason = closed.wait().await;
            if let Some(inner) = weak.upgrade() {
                FrameManager { inner }.dispose(&reason);
            }
        });
    }

    /// Replay a `Page.getFrameTree` snapshot through the normal handlers.
    fn seed(&self, tree: &FrameTreePayload) {
        if let Err(e) = self.on_frame_attached(&tree.frame.id, tree.frame.parent_id.as_deref()) {
            tracing::error!("Frame tree seed: {}", e);
        }
        if let Err(e) = self.on_frame_navigated(&tree.frame) {
            tracing::error!("Frame tree seed: {}", e);
        }
        for child in &tree.child_frames {
            self.seed(child);
        }
    }

    /// The session this tree is tracked over
    pub fn session(&self) -> &CdpSession {
        &self.inner.session
    }

    /// The page's root frame, once known
    pub fn main_frame(&self) -> Option<Frame> {
        let state = self.inner.state.lock();
        state.main.map(|node| self.handle(node))
    }

    /// Flattened snapshot of all attached frames, main frame first
    pub fn frames(&self) -> Vec<Frame> {
        let state = self.inner.state.lock();
        let mut out = Vec::new();
        if let Some(main) = state.main {
            let mut stack = vec![main];
            while let Some(node) = stack.pop() {
                if let Some(n) = state.nodes.get(&node) {
                    if !n.detached {
                        out.push(self.handle(node));
                        stack.extend(n.children.iter().rev().copied());
                    }
                }
            }
        }
        out
    }

    /// Look up an attached frame by its protocol frame id
    pub fn frame_by_id(&self, frame_id: &str) -> Option<Frame> {
        let state = self.inner.state.lock();
        state.by_frame_id.get(frame_id).map(|&node| self.handle(node))
    }

    /// Register a frame-event listener
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&FrameEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a frame-event listener. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn handle(&self, node: NodeId) -> Frame {
        Frame {
            manager: Arc::downgrade(&self.inner),
            node,
        }
    }

    fn emit(&self, events: Vec<FrameEvent>) {
        if events.is_empty() {
            return;
        }
        let callbacks: Vec<FrameCallback> = {
            let listeners = self.inner.listeners.lock();
            listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for event in &events {
            for callback in &callbacks {
                callback(event);
            }
        }
    }

    /// Route one session event into the tree. Invoked on the receive
    /// loop; invariant violations are logged, never thrown across it.
    pub fn on_protocol_event(&self, event: &ProtocolEvent) {
        let outcome = match event.method.as_str() {
            "Page.frameAttached" => serde_json::from_value::<FrameAttachedEvent>(
                event.params.clone(),
            )
            .map_err(Error::from)
            .and_then(|ev| self.on_frame_attached(&ev.frame_id, ev.parent_frame_id.as_deref())),
            "Page.frameNavigated" => {
                serde_json::from_value::<FrameNavigatedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .and_then(|ev| self.on_frame_navigated(&ev.frame))
            }
            "Page.navigatedWithinDocument" => {
                serde_json::from_value::<NavigatedWithinDocumentEvent>(event.params.clone())
                    .map_err(Error::from)
                    .map(|ev| self.on_navigated_within_document(&ev.frame_id, &ev.url))
            }
            "Page.lifecycleEvent" => {
                serde_json::from_value::<LifecycleEventPayload>(event.params.clone())
                    .map_err(Error::from)
                    .map(|ev| self.on_lifecycle_event(&ev.frame_id, &ev.loader_id, &ev.name))
            }
            "Page.frameDetached" => {
                serde_json::from_value::<FrameDetachedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .map(|ev| self.on_frame_detached(&ev.frame_id))
            }
            "Runtime.executionContextCreated" => {
                serde_json::from_value::<ExecutionContextCreatedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .map(|ev| self.on_execution_context_created(&ev.context))
            }
            "Runtime.executionContextDestroyed" => {
                serde_json::from_value::<ExecutionContextDestroyedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .map(|ev| self.on_execution_context_destroyed(ev.execution_context_id))
            }
            "Runtime.executionContextsCleared" => {
                self.on_execution_contexts_cleared();
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = outcome {
            tracing::error!("Frame tree desynchronized on {}: {}", event.method, e);
        }
    }

    /// Create a frame and link it under its parent. The first parentless
    /// frame becomes the main frame. Duplicate attach notifications (the
    /// seed snapshot overlaps live events) are ignored.
    fn on_frame_attached(&self, frame_id: &str, parent_frame_id: Option<&str>) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.disposed || state.by_frame_id.contains_key(frame_id) {
                return Ok(());
            }

            let parent = match parent_frame_id {
                Some(pid) => Some(*state.by_frame_id.get(pid).ok_or_else(|| {
                    Error::InternalConsistency(format!(
                        "frame {} attached to unknown parent {}",
                        frame_id, pid
                    ))
                })?),
                None => None,
            };

            let node = state.alloc();
            state
                .nodes
                .insert(node, FrameNode::new(frame_id, parent));
            state.by_frame_id.insert(frame_id.to_string(), node);
            match parent {
                Some(p) => {
                    if let Some(pn) = state.nodes.get_mut(&p) {
                        pn.children.push(node);
                    }
                }
                None => state.main = Some(node),
            }
            events.push(FrameEvent::Attached {
                frame: self.handle(node),
            });
        }
        self.emit(events);
        Ok(())
    }

    /// Apply a cross-document navigation. The main frame keeps its
    /// identity even when the protocol re-keys it; subframes of the
    /// replaced document are detached first. A changed loader id starts a
    /// new document: stale lifecycle milestones are dropped and the old
    /// execution context is invalidated.
    fn on_frame_navigated(&self, payload: &FramePayload) -> Result<()> {
        let mut events = Vec::new();
        let mut failed: Vec<(ContextWaiter, Error)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Ok(());
            }

            let is_main = payload.parent_id.is_none();
            let node = if is_main {
                match state.main {
                    Some(main) => {
                        let old_id = state.nodes[&main].frame_id.clone();
                        if old_id != payload.id {
                            // Same frame object, new protocol id.
                            state.by_frame_id.remove(&old_id);
                            state.by_frame_id.insert(payload.id.clone(), main);
                            if let Some(n) = state.nodes.get_mut(&main) {
                                n.frame_id = payload.id.clone();
                            }
                        }
                        main
                    }
                    None => {
                        let node = state.alloc();
                        state.nodes.insert(node, FrameNode::new(&payload.id, None));
                        state.by_frame_id.insert(payload.id.clone(), node);
                        state.main = Some(node);
                        events.push(FrameEvent::Attached {
                            frame: self.handle(node),
                        });
                        node
                    }
                }
            } else {
                *state.by_frame_id.get(&payload.id).ok_or_else(|| {
                    Error::InternalConsistency(format!(
                        "navigation reported for unknown frame {}",
                        payload.id
                    ))
                })?
            };

            // The previous document's subframes do not survive it.
            let children: Vec<NodeId> = state.nodes[&node].children.to_vec();
            for child in children {
                Self::detach_subtree(&mut state, child, &mut failed, &mut events, |id| {
                    Error::FrameDetached(id.to_string())
                }, self);
            }

            let loader_changed = {
                let n = state.nodes.get_mut(&node).expect("navigated node present");
                n.name = payload.name.clone().unwrap_or_default();
                n.url = payload.url.clone();
                !payload.loader_id.is_empty() && n.loader_id != payload.loader_id
            };
            if loader_changed {
                Self::begin_new_document(&mut state, node, &payload.loader_id, &mut failed);
            }

            events.push(FrameEvent::Navigated {
                frame: self.handle(node),
            });
        }
        for (waiter, error) in failed {
            let _ = waiter.send(Err(error));
        }
        self.emit(events);
        Ok(())
    }

    /// Same-document navigation: the url moves, the document does not.
    /// Lifecycle milestones and the execution context survive.
    fn on_navigated_within_document(&self, frame_id: &str, url: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(&node) = state.by_frame_id.get(frame_id) else {
                tracing::debug!("Within-document navigation for untracked frame {}", frame_id);
                return;
            };
            if let Some(n) = state.nodes.get_mut(&node) {
                n.url = url.to_string();
            }
            events.push(FrameEvent::NavigatedWithinDocument {
                frame: self.handle(node),
                url: url.to_string(),
            });
        }
        self.emit(events);
    }

    /// Record a lifecycle milestone. `"init"` with a new loader id marks
    /// the start of a new document load and resets per-document state, so
    /// stale milestones can never satisfy a new navigation's wait.
    /// Untracked frame ids are ignored: lifecycle events race the seed
    /// snapshot on freshly attached pages.
    fn on_lifecycle_event(&self, frame_id: &str, loader_id: &str, name: &str) {
        let mut events = Vec::new();
        let mut failed: Vec<(ContextWaiter, Error)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(&node) = state.by_frame_id.get(frame_id) else {
                tracing::trace!("Lifecycle event {} for untracked frame {}", name, frame_id);
                return;
            };
            if name == "init" {
                let new_document = state
                    .nodes
                    .get(&node)
                    .map(|n| n.loader_id != loader_id)
                    .unwrap_or(false);
                if new_document {
                    Self::begin_new_document(&mut state, node, loader_id, &mut failed);
                }
            }
            if let Some(n) = state.nodes.get_mut(&node) {
                n.lifecycle.insert(name.to_string());
            }
            events.push(FrameEvent::Lifecycle {
                frame: self.handle(node),
                name: name.to_string(),
            });
        }
        for (waiter, error) in failed {
            let _ = waiter.send(Err(error));
        }
        self.emit(events);
    }

    /// Remove a frame and its whole subtree, children first. Every
    /// pending context waiter in the subtree fails with
    /// [`Error::FrameDetached`]. The records stay in the arena marked
    /// detached, so handles held by callers keep reporting it; the
    /// protocol-id mapping is dropped, so a reattach under a new id is a
    /// distinct frame.
    fn on_frame_detached(&self, frame_id: &str) {
        let mut events = Vec::new();
        let mut failed: Vec<(ContextWaiter, Error)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(&node) = state.by_frame_id.get(frame_id) else {
                tracing::debug!("Detach for untracked frame {}", frame_id);
                return;
            };
            Self::detach_subtree(&mut state, node, &mut failed, &mut events, |id| {
                Error::FrameDetached(id.to_string())
            }, self);
        }
        for (waiter, error) in failed {
            let _ = waiter.send(Err(error));
        }
        self.emit(events);
    }

    /// Bind a default execution context to its frame and wake suspended
    /// evaluations. A newer default context supersedes the old binding.
    fn on_execution_context_created(&self, payload: &ContextPayload) {
        if !payload.aux_data.is_default {
            return;
        }
        let Some(frame_id) = payload.aux_data.frame_id.clone() else {
            return;
        };

        let mut woken: Vec<(ContextWaiter, ExecutionContext)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(&node) = state.by_frame_id.get(&frame_id) else {
                tracing::trace!("Execution context for untracked frame {}", frame_id);
                return;
            };
            let superseded = state.nodes.get_mut(&node).and_then(|n| n.context_id.take());
            if let Some(old) = superseded {
                state.contexts.remove(&old);
            }
            if let Some(n) = state.nodes.get_mut(&node) {
                n.context_id = Some(payload.id);
            }
            state.contexts.insert(payload.id, node);

            let context = ExecutionContext {
                session: self.inner.session.clone(),
                context_id: payload.id,
                frame_id,
            };
            if let Some(n) = state.nodes.get_mut(&node) {
                for waiter in n.context_waiters.drain(..) {
                    woken.push((waiter, context.clone()));
                }
            }
        }
        for (waiter, context) in woken {
            let _ = waiter.send(Ok(context));
        }
    }

    /// Unbind a destroyed context; later evaluations suspend until the
    /// next default context is announced.
    fn on_execution_context_destroyed(&self, context_id: i64) {
        let mut state = self.inner.state.lock();
        if let Some(node) = state.contexts.remove(&context_id) {
            if let Some(n) = state.nodes.get_mut(&node) {
                n.context_id = None;
            }
        }
    }

    fn on_execution_contexts_cleared(&self) {
        let mut state = self.inner.state.lock();
        let bound: Vec<NodeId> = state.contexts.drain().map(|(_, node)| node).collect();
        for node in bound {
            if let Some(n) = state.nodes.get_mut(&node) {
                n.context_id = None;
            }
        }
    }

    /// Reset per-document state for a new load: adopt the loader id, drop
    /// accumulated milestones, invalidate the context and fail its
    /// suspended evaluations with the stale-context kind.
    fn begin_new_document(
        state: &mut TreeState,
        node: NodeId,
        loader_id: &str,
        failed: &mut Vec<(ContextWaiter, Error)>,
    ) {
        let Some(n) = state.nodes.get_mut(&node) else {
            return;
        };
        n.loader_id = loader_id.to_string();
        n.lifecycle.clear();
        let frame_id = n.frame_id.clone();
        let old_context = n.context_id.take();
        for waiter in n.context_waiters.drain(..) {
            failed.push((waiter, Error::ContextDestroyed(frame_id.clone())));
        }
        if let Some(id) = old_context {
            state.contexts.remove(&id);
        }
    }

    /// Depth-first detach: children cannot outlive their parent in the
    /// tree, so the subtree goes before the root.
    fn detach_subtree(
        state: &mut TreeState,
        node: NodeId,
        failed: &mut Vec<(ContextWaiter, Error)>,
        events: &mut Vec<FrameEvent>,
        error_for: fn(&str) -> Error,
        manager: &FrameManager,
    ) {
        let children: Vec<NodeId> = state
            .nodes
            .get(&node)
            .map(|n| n.children.to_vec())
            .unwrap_or_default();
        for child in children {
            Self::detach_subtree(state, child, failed, events, error_for, manager);
        }

        let Some(n) = state.nodes.get_mut(&node) else {
            return;
        };
        n.detached = true;
        n.children.clear();
        let frame_id = n.frame_id.clone();
        let parent = n.parent.take();
        let old_context = n.context_id.take();
        for waiter in n.context_waiters.drain(..) {
            failed.push((waiter, error_for(&frame_id)));
        }

        if let Some(id) = old_context {
            state.contexts.remove(&id);
        }
        state.by_frame_id.remove(&frame_id);
        if let Some(p) = parent {
            if let Some(pn) = state.nodes.get_mut(&p) {
                pn.children.retain(|c| *c != node);
            }
        }
        if state.main == Some(node) {
            state.main = None;
        }
        events.push(FrameEvent::Detached {
            frame: manager.handle(node),
        });
    }

    /// Tear the whole tree down when the owning session closes. Every
    /// suspended evaluation fails with [`Error::TargetClosed`]; watchers
    /// see detach events for every frame.
    pub(crate) fn dispose(&self, reason: &str) {
        let mut events = Vec::new();
        let mut failed: Vec<(ContextWaiter, Error)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(main) = state.main {
                Self::detach_subtree(&mut state, main, &mut failed, &mut events, |_| {
                    Error::closed("page session closed")
                }, self);
            }
        }
        tracing::debug!("Frame tree torn down: {}", reason);
        for (waiter, error) in failed {
            let _ = waiter.send(Err(error));
        }
        self.emit(events);

        if let Some(listener) = self.inner.session_listener.lock().take() {
            self.inner.session.unsubscribe(listener);
        }
    }

    /// True when `node` and every non-detached descendant hold all of
    /// `milestones`. One lock acquisition, so the check sees a consistent
    /// snapshot of the tree.
    pub(crate) fn subtree_satisfies(&self, node: NodeId, milestones: &[&str]) -> bool {
        let state = self.inner.state.lock();
        Self::check_subtree(&state, node, milestones)
    }

    fn check_subtree(state: &TreeState, node: NodeId, milestones: &[&str]) -> bool {
        let Some(n) = state.nodes.get(&node) else {
            return false;
        };
        if n.detached {
            return false;
        }
        if milestones.iter().any(|m| !n.lifecycle.contains(*m)) {
            return false;
        }
        n.children
            .iter()
            .all(|child| Self::check_subtree(state, *child, milestones))
    }
}

impl std::fmt::Debug for FrameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FrameManager")
            .field("frames", &state.by_frame_id.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Handle to one frame, resolved through the manager's arena.
///
/// Handles stay valid across main-frame re-keying (same underlying
/// record) and after detach (the record is kept, permanently marked
/// detached).
#[derive(Clone)]
pub struct Frame {
    manager: Weak<FrameManagerInner>,
    node: NodeId,
}

impl Frame {
    fn read<R>(&self, f: impl FnOnce(&FrameNode) -> R) -> Option<R> {
        let inner = self.manager.upgrade()?;
        let state = inner.state.lock();
        state.nodes.get(&self.node).map(f)
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.node
    }

    /// The frame's current protocol id
    pub fn frame_id(&self) -> String {
        self.read(|n| n.frame_id.clone()).unwrap_or_default()
    }

    /// The frame's current url
    pub fn url(&self) -> String {
        self.read(|n| n.url.clone()).unwrap_or_default()
    }

    /// The frame's name attribute, if any
    pub fn name(&self) -> String {
        self.read(|n| n.name.clone()).unwrap_or_default()
    }

    /// Loader id of the frame's current document
    pub fn loader_id(&self) -> String {
        self.read(|n| n.loader_id.clone()).unwrap_or_default()
    }

    /// True once the frame has been detached (permanent), or if its tree
    /// is gone
    pub fn is_detached(&self) -> bool {
        self.read(|n| n.detached).unwrap_or(true)
    }

    /// True if the current document has reported the named lifecycle
    /// milestone
    pub fn lifecycle_contains(&self, name: &str) -> bool {
        self.read(|n| n.lifecycle.contains(name)).unwrap_or(false)
    }

    /// The parent frame; `None` for the main frame or a detached frame
    pub fn parent(&self) -> Option<Frame> {
        let inner = self.manager.upgrade()?;
        let state = inner.state.lock();
        let parent = state.nodes.get(&self.node)?.parent?;
        Some(Frame {
            manager: self.manager.clone(),
            node: parent,
        })
    }

    /// The frame's current child frames, in tree order
    pub fn child_frames(&self) -> Vec<Frame> {
        let Some(inner) = self.manager.upgrade() else {
            return Vec::new();
        };
        let state = inner.state.lock();
        state
            .nodes
            .get(&self.node)
            .map(|n| {
                n.children
                    .iter()
                    .map(|&child| Frame {
                        manager: self.manager.clone(),
                        node: child,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The execution context of the frame's current document.
    ///
    /// Suspends until the protocol announces a default context for this
    /// frame. Fails with [`Error::ContextDestroyed`] if a new document
    /// replaces the one the wait started against, and with
    /// [`Error::FrameDetached`] if the frame goes away.
    pub async fn execution_context(&self) -> Result<ExecutionContext> {
        let rx = {
            let inner = self
                .manager
                .upgrade()
                .ok_or_else(|| Error::closed("frame tree gone"))?;
            let mut state = inner.state.lock();
            let n = state
                .nodes
                .get_mut(&self.node)
                .ok_or_else(|| Error::FrameDetached("unknown frame".to_string()))?;
            if n.detached {
                return Err(Error::FrameDetached(n.frame_id.clone()));
            }
            if let Some(context_id) = n.context_id {
                return Ok(ExecutionContext {
                    session: inner.session.clone(),
                    context_id,
                    frame_id: n.frame_id.clone(),
                });
            }
            let (tx, rx) = oneshot::channel();
            n.context_waiters.push(tx);
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(Error::closed("frame tree dropped")))
    }

    /// Evaluate an expression in the frame's current document
    pub async fn evaluate<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let context = self.execution_context().await?;
        context.evaluate(expression).await
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.manager.ptr_eq(&other.manager)
    }
}

impl Eq for Frame {}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id())
            .field("url", &self.url())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// The scripting environment of one frame's current document
#[derive(Clone)]
pub struct ExecutionContext {
    session: CdpSession,
    context_id: i64,
    frame_id: String,
}

impl ExecutionContext {
    /// Remote context id
    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    /// Owning frame's protocol id at binding time
    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    /// Evaluate an expression in this context and deserialize the result.
    ///
    /// A context discarded by a new document load fails with
    /// [`Error::ContextDestroyed`], distinct from timeouts and generic
    /// protocol errors.
    pub async fn evaluate<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let result: RuntimeEvaluateResult = self
            .session
            .send(
                "Runtime.evaluate",
                &RuntimeEvaluate {
                    expression: expression.to_string(),
                    context_id: Some(self.context_id),
                    return_by_value: Some(true),
                    await_promise: Some(true),
                },
            )
            .await
            .map_err(|e| e.clarify_context(&self.frame_id))?;

        if let Some(details) = result.exception_details {
            return Err(Error::protocol("Runtime.evaluate", -1, details.message()));
        }
        Ok(serde_json::from_value(
            result.result.value.unwrap_or(serde_json::Value::Null),
        )?)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("context_id", &self.context_id)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}
