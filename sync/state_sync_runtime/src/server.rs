//! Server side of a synchronized UI.
//!
//! A [`ServerSession`] guards one UI behind a single mutex: the state tree,
//! the handler registry, the message writer and the ordering state for
//! inbound client messages. Application threads mutate the tree through
//! [`ServerSession::access`]; the connection thread feeds client envelopes
//! to [`ServerSession::handle_client`] and sends whatever comes back.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::{StateError, SyncError};
use crate::message::MessageWriter;
use crate::node::{NodeId, NodeStatus};
use crate::protocol::{
    ClientEnvelope, ClientEvent, ClientMessage, ClientRpc, ServerEnvelope, error_envelope,
};
use crate::sequencer::{InboundSequencer, Ingest};
use crate::tree::{Lifecycle, StateTree};

pub type EventHandler = Box<dyn FnMut(&mut StateTree, &Value) -> Result<(), StateError> + Send>;

pub type RpcHandler =
    Box<dyn FnMut(&mut StateTree, Option<NodeId>, &[Value]) -> Result<(), StateError> + Send>;

/// Runs when a node joins or leaves the attached tree.
pub type NodeHandler = Box<dyn FnMut(&mut StateTree, NodeId) -> Result<(), StateError> + Send>;

/// One-shot work deferred until the next message is written.
pub type ResponseHook = Box<dyn FnOnce(&mut StateTree) -> Result<(), StateError> + Send>;

/// Handle returned by [`UiContext::add_event_listener`], used to remove the
/// handler again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRegistration {
    pub node: NodeId,
    pub event: String,
    pub id: u64,
}

/// Handle returned by [`UiContext::add_attach_listener`] and
/// [`UiContext::add_detach_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleRegistration {
    pub node: NodeId,
    pub id: u64,
}

/// The tree plus everything that reacts to client input and to node
/// lifecycle.
pub struct UiContext {
    tree: StateTree,
    listeners: BTreeMap<(NodeId, String), Vec<(u64, EventHandler)>>,
    attach_listeners: BTreeMap<NodeId, Vec<(u64, NodeHandler)>>,
    detach_listeners: BTreeMap<NodeId, Vec<(u64, NodeHandler)>>,
    response_hooks: Vec<(NodeId, ResponseHook)>,
    rpcs: BTreeMap<String, RpcHandler>,
    pending_rpcs: Vec<ClientRpc>,
    next_listener_id: u64,
}

impl Default for UiContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiContext")
            .field("tree", &self.tree)
            .field("listeners", &self.listeners.len())
            .field("attach_listeners", &self.attach_listeners.len())
            .field("detach_listeners", &self.detach_listeners.len())
            .field("response_hooks", &self.response_hooks.len())
            .field("rpcs", &self.rpcs.keys().collect::<Vec<_>>())
            .field("pending_rpcs", &self.pending_rpcs)
            .finish()
    }
}

impl UiContext {
    pub fn new() -> Self {
        Self {
            tree: StateTree::new(),
            listeners: BTreeMap::new(),
            attach_listeners: BTreeMap::new(),
            detach_listeners: BTreeMap::new(),
            response_hooks: Vec::new(),
            rpcs: BTreeMap::new(),
            pending_rpcs: Vec::new(),
            next_listener_id: 1,
        }
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    /// Registers `handler` for `event` on `node` and publishes the listener
    /// to the client.
    pub fn add_event_listener<F>(
        &mut self,
        node: NodeId,
        event: &str,
        handler: F,
    ) -> Result<ListenerRegistration, StateError>
    where
        F: FnMut(&mut StateTree, &Value) -> Result<(), StateError> + Send + 'static,
    {
        self.tree.add_event_listener(node, event)?;

        let id = self.next_id();
        self.listeners
            .entry((node, event.to_string()))
            .or_default()
            .push((id, Box::new(handler)));

        Ok(ListenerRegistration {
            node,
            event: event.to_string(),
            id,
        })
    }

    /// The client-side listener goes away with the last handler.
    pub fn remove_event_listener(
        &mut self,
        registration: &ListenerRegistration,
    ) -> Result<(), StateError> {
        let key = (registration.node, registration.event.clone());
        let unknown = || StateError::UnknownListener {
            node: registration.node,
            event: registration.event.clone(),
            id: registration.id,
        };

        let handlers = self.listeners.get_mut(&key).ok_or_else(unknown)?;
        let index = handlers
            .iter()
            .position(|(id, _handler)| *id == registration.id)
            .ok_or_else(unknown)?;
        handlers.remove(index);

        if handlers.is_empty() {
            self.listeners.remove(&key);
            let alive = self
                .tree
                .node(registration.node)
                .is_some_and(|node| node.status() != NodeStatus::Detached);
            if alive {
                self.tree
                    .remove_event_listener(registration.node, &registration.event)?;
            }
        }
        Ok(())
    }

    /// Runs `handler` every time `node` becomes attached, after its
    /// descendants' attach listeners.
    pub fn add_attach_listener<F>(
        &mut self,
        node: NodeId,
        handler: F,
    ) -> Result<LifecycleRegistration, StateError>
    where
        F: FnMut(&mut StateTree, NodeId) -> Result<(), StateError> + Send + 'static,
    {
        self.tree.ensure_live(node)?;
        let id = self.next_id();
        self.attach_listeners
            .entry(node)
            .or_default()
            .push((id, Box::new(handler)));
        Ok(LifecycleRegistration { node, id })
    }

    /// Runs `handler` when `node` leaves the attached tree. Detaching is
    /// final, so it runs at most once.
    pub fn add_detach_listener<F>(
        &mut self,
        node: NodeId,
        handler: F,
    ) -> Result<LifecycleRegistration, StateError>
    where
        F: FnMut(&mut StateTree, NodeId) -> Result<(), StateError> + Send + 'static,
    {
        self.tree.ensure_live(node)?;
        let id = self.next_id();
        self.detach_listeners
            .entry(node)
            .or_default()
            .push((id, Box::new(handler)));
        Ok(LifecycleRegistration { node, id })
    }

    /// Returns whether the registration was still active.
    pub fn remove_lifecycle_listener(&mut self, registration: LifecycleRegistration) -> bool {
        [&mut self.attach_listeners, &mut self.detach_listeners]
            .into_iter()
            .any(|listeners| {
                let Some(handlers) = listeners.get_mut(&registration.node) else {
                    return false;
                };
                let before = handlers.len();
                handlers.retain(|(id, _handler)| *id != registration.id);
                let removed = handlers.len() != before;
                if handlers.is_empty() {
                    listeners.remove(&registration.node);
                }
                removed
            })
    }

    /// Defers `hook` until just before the next message is written. If
    /// `node` is not attached by then the hook waits for a later message; if
    /// it gets detached the hook is dropped.
    pub fn before_client_response<F>(&mut self, node: NodeId, hook: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut StateTree) -> Result<(), StateError> + Send + 'static,
    {
        self.tree.ensure_live(node)?;
        self.response_hooks.push((node, Box::new(hook)));
        Ok(())
    }

    /// Runs attach and detach listeners for everything the tree reported
    /// since the last call, including what the listeners themselves cause.
    pub fn run_lifecycle_listeners(&mut self) {
        loop {
            let events = self.tree.take_lifecycle();
            if events.is_empty() {
                return;
            }

            for event in events {
                let (node, listeners) = match event {
                    Lifecycle::Attached(node) => (node, &mut self.attach_listeners),
                    Lifecycle::Detached(node) => (node, &mut self.detach_listeners),
                };
                if let Some(handlers) = listeners.get_mut(&node) {
                    for (_id, handler) in handlers.iter_mut() {
                        if let Err(err) = handler(&mut self.tree, node) {
                            tracing::warn!(
                                %node,
                                ?event,
                                error = %err,
                                "lifecycle listener failed"
                            );
                        }
                    }
                }

                if matches!(event, Lifecycle::Detached(_)) {
                    self.attach_listeners.remove(&node);
                    self.detach_listeners.remove(&node);
                    self.response_hooks.retain(|(hooked, _hook)| *hooked != node);
                }
            }
        }
    }

    /// Settles the tree for a message: lifecycle listeners first, then every
    /// response hook whose node is attached. Repeats until neither has work,
    /// since hooks may attach nodes or register further hooks.
    pub fn prepare_response(&mut self) {
        loop {
            self.run_lifecycle_listeners();

            let mut ready = Vec::new();
            for (node, hook) in std::mem::take(&mut self.response_hooks) {
                match self.tree.node(node).map(|state| state.status()) {
                    Some(NodeStatus::Attached) => ready.push((node, hook)),
                    Some(NodeStatus::Unattached) => self.response_hooks.push((node, hook)),
                    Some(NodeStatus::Detached) | None => {
                        tracing::trace!(%node, "dropping response hook for detached node");
                    }
                }
            }
            if ready.is_empty() {
                return;
            }

            for (node, hook) in ready {
                if let Err(err) = hook(&mut self.tree) {
                    tracing::warn!(%node, error = %err, "response hook failed");
                }
            }
        }
    }

    pub fn register_rpc<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(&mut StateTree, Option<NodeId>, &[Value]) -> Result<(), StateError>
            + Send
            + 'static,
    {
        self.rpcs.insert(name.into(), Box::new(handler));
    }

    /// Queues a client-side invocation. It goes out with the next message,
    /// after that message's changes.
    pub fn call_client(
        &mut self,
        node: Option<NodeId>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) {
        self.pending_rpcs.push(ClientRpc {
            node,
            method: method.into(),
            args,
        });
    }

    pub fn has_pending_output(&self) -> bool {
        self.tree.has_pending_changes()
            || !self.pending_rpcs.is_empty()
            || self.response_hooks.iter().any(|(node, _hook)| self.tree.is_attached(*node))
    }

    /// Runs the handlers for one client event. Events for nodes that are no
    /// longer attached and events nobody listens to are dropped.
    pub fn dispatch(&mut self, event: ClientEvent) -> Result<(), StateError> {
        match event {
            ClientEvent::Event { node, event, data } => {
                if !self.tree.is_attached(node) {
                    tracing::warn!(%node, %event, "ignoring event for node that is not attached");
                    return Ok(());
                }

                let Some(handlers) = self.listeners.get_mut(&(node, event.clone())) else {
                    tracing::warn!(%node, %event, "ignoring event without a listener");
                    return Ok(());
                };
                for (_id, handler) in handlers.iter_mut() {
                    handler(&mut self.tree, &data)?;
                }
                Ok(())
            }
            ClientEvent::PropertySync { node, key, value } => {
                if !self.tree.is_attached(node) {
                    tracing::warn!(
                        %node,
                        %key,
                        "ignoring property sync for node that is not attached"
                    );
                    return Ok(());
                }
                self.tree.sync_property(node, key, value)
            }
            ClientEvent::Rpc { node, name, args } => {
                if node.is_some_and(|node| !self.tree.is_attached(node)) {
                    tracing::warn!(?node, %name, "ignoring rpc for node that is not attached");
                    return Ok(());
                }

                let Some(handler) = self.rpcs.get_mut(&name) else {
                    tracing::warn!(%name, "ignoring unknown rpc");
                    return Ok(());
                };
                handler(&mut self.tree, node, &args)
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        id
    }

    fn take_rpcs(&mut self) -> Vec<ClientRpc> {
        std::mem::take(&mut self.pending_rpcs)
    }
}

#[derive(Debug)]
struct SessionState {
    ui: UiContext,
    writer: MessageWriter,
    inbound: InboundSequencer<ClientMessage>,
    connected: bool,
}

impl SessionState {
    /// Flushes pending tree changes and rpcs into a new message. With
    /// `always` set an empty message is written too, to carry the ack.
    fn write_pending(&mut self, always: bool) -> Option<Arc<ServerEnvelope>> {
        self.ui.prepare_response();
        if !always && !self.ui.has_pending_output() {
            return None;
        }

        let batch = self.ui.tree.flush();
        let rpcs = self.ui.take_rpcs();
        if !always && batch.is_empty() && rpcs.is_empty() {
            return None;
        }
        Some(self.writer.write(batch, rpcs, self.inbound.last_applied()))
    }

    fn write_snapshot(&mut self) -> Arc<ServerEnvelope> {
        // Pending changes are part of the snapshot; flushing settles ids.
        self.ui.prepare_response();
        self.ui.tree.flush();
        let changes = self.ui.tree.snapshot();
        let rpcs = self.ui.take_rpcs();
        tracing::info!(entries = changes.len(), "sending snapshot");
        self.writer
            .write_snapshot(changes, rpcs, self.inbound.last_applied())
    }

    fn resume(&self) -> Arc<ServerEnvelope> {
        Arc::new(self.writer.resume(self.inbound.last_applied()))
    }
}

#[derive(Debug)]
pub struct ServerSession {
    sid: String,
    state: Mutex<SessionState>,
}

impl ServerSession {
    pub fn new(sid: impl Into<String>, config: &SyncConfig) -> Self {
        let sid = sid.into();
        Self {
            state: Mutex::new(SessionState {
                ui: UiContext::new(),
                writer: MessageWriter::new(sid.clone(), config.max_resend_messages),
                inbound: InboundSequencer::starting_at(
                    0,
                    config.max_buffered_messages,
                    config.gap_timeout_ms,
                ),
                connected: false,
            }),
            sid,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Runs `f` with exclusive access to the UI. Attach and detach listeners
    /// triggered by `f` run before the lock is released.
    pub fn access<R>(&self, f: impl FnOnce(&mut UiContext) -> R) -> Result<R, SyncError> {
        let mut state = self.lock()?;
        let result = f(&mut state.ui);
        state.ui.run_lifecycle_listeners();
        Ok(result)
    }

    pub fn is_connected(&self) -> Result<bool, SyncError> {
        Ok(self.lock()?.connected)
    }

    /// Turns pending changes into a message. Nothing is written while the
    /// client is disconnected; changes keep accumulating in the tree.
    pub fn flush_outgoing(&self) -> Result<Option<Arc<ServerEnvelope>>, SyncError> {
        let mut state = self.lock()?;
        if !state.connected {
            return Ok(None);
        }
        Ok(state.write_pending(false))
    }

    pub fn handle_client(
        &self,
        envelope: ClientEnvelope,
        now_ms: u64,
    ) -> Result<Vec<Arc<ServerEnvelope>>, SyncError> {
        let sid = match &envelope {
            ClientEnvelope::Hello { sid, .. } | ClientEnvelope::Ack { sid, .. } => sid,
            ClientEnvelope::Sync(message) => &message.sid,
        };
        if *sid != self.sid {
            tracing::warn!(expected = %self.sid, got = %sid, "envelope for unknown session");
            return Ok(vec![Arc::new(error_envelope(
                sid.clone(),
                crate::client::SESSION_EXPIRED,
                "unknown session id",
            ))]);
        }

        let mut state = self.lock()?;
        let out = match envelope {
            ClientEnvelope::Hello { last_applied, .. } => Self::hello(&mut state, last_applied),
            ClientEnvelope::Sync(message) => Self::receive(&mut state, message, now_ms),
            ClientEnvelope::Ack { seq, .. } => {
                state.writer.acknowledge(seq);
                Vec::new()
            }
        };
        Ok(out)
    }

    /// The connection is gone. Outgoing changes accumulate until the next
    /// `hello`.
    pub fn on_disconnect(&self) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        if state.connected {
            tracing::info!(sid = %self.sid, "client disconnected");
        }
        state.connected = false;
        state.inbound.clear_gap();
        Ok(())
    }

    /// Timer tick. A client gap that timed out is answered with `resume`,
    /// asking the client to resend everything after the last applied id.
    pub fn poll(&self, now_ms: u64) -> Result<Vec<Arc<ServerEnvelope>>, SyncError> {
        let mut state = self.lock()?;
        let Some(err) = state.inbound.poll_gap(now_ms) else {
            return Ok(Vec::new());
        };

        tracing::warn!(error = %err, "client message gap did not close");
        if !state.connected {
            return Ok(Vec::new());
        }
        Ok(vec![state.resume()])
    }

    fn hello(state: &mut SessionState, last_applied: Option<u64>) -> Vec<Arc<ServerEnvelope>> {
        state.connected = true;
        let mut out = Vec::new();

        let replay = last_applied.and_then(|last| state.writer.replay_after(last));
        match replay {
            Some(replay) => {
                tracing::info!(
                    last_applied = ?last_applied,
                    replayed = replay.len(),
                    "client reconnected; replaying unacknowledged messages"
                );
                out.extend(replay);
                out.extend(state.write_pending(false));
            }
            None => {
                if last_applied.is_some() {
                    tracing::warn!(
                        last_applied = ?last_applied,
                        "cannot replay from client position; sending snapshot"
                    );
                }
                out.push(state.write_snapshot());
            }
        }

        out.push(state.resume());
        out
    }

    fn receive(
        state: &mut SessionState,
        message: ClientMessage,
        now_ms: u64,
    ) -> Vec<Arc<ServerEnvelope>> {
        if let Some(ack) = message.ack {
            state.writer.acknowledge(ack);
        }

        match state.inbound.ingest(message.seq, message, now_ms) {
            Ingest::Deliver(messages) => {
                for message in messages {
                    for event in message.events {
                        if let Err(err) = state.ui.dispatch(event) {
                            tracing::warn!(
                                seq = message.seq,
                                error = %err,
                                "event handler failed"
                            );
                        }
                    }
                }
                state.write_pending(true).into_iter().collect()
            }
            // Answered so the client can drop its retained copy.
            Ingest::Duplicate => state.write_pending(true).into_iter().collect(),
            Ingest::Buffered { .. } => Vec::new(),
            Ingest::GaveUp(err) => {
                tracing::warn!(error = %err, "client message gap did not close");
                vec![state.resume()]
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, SyncError> {
        self.state.lock().map_err(|_| SyncError::Poisoned)
    }
}
