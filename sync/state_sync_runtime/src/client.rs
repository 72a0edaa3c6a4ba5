//! Client side of a synchronized UI.
//!
//! [`ClientSession`] owns the mirror tree, orders inbound server messages,
//! numbers and retains outgoing event messages and drives the connection
//! state machine. It performs no I/O: every call returns the envelopes the
//! host should send.

use std::collections::VecDeque;

use crate::config::SyncConfig;
use crate::error::ProtocolError;
use crate::mirror::MirrorTree;
use crate::protocol::{
    ClientEnvelope, ClientEvent, ClientMessage, ClientRpc, ServerEnvelope, ServerMessage,
    ack_envelope, hello_envelope,
};
use crate::reconnect::{ReconnectPolicy, ReconnectStep};
use crate::resend::ResendQueue;
use crate::sequencer::{InboundSequencer, Ingest};

pub const SESSION_EXPIRED: &str = "session_expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Synchronized,
    Reconnecting,
    Resyncing,
}

#[derive(Debug)]
pub struct ClientSession {
    sid: String,
    state: ConnectionState,
    mirror: MirrorTree,
    inbound: InboundSequencer<ServerMessage>,
    outbox: ResendQueue<ClientMessage>,
    queued_events: VecDeque<ClientEvent>,
    invocations: VecDeque<ClientRpc>,
    reconnect: ReconnectPolicy,
    resync_pending: bool,
    transport_up: bool,
}

impl ClientSession {
    pub fn new(sid: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            sid: sid.into(),
            state: ConnectionState::Disconnected,
            mirror: MirrorTree::new(),
            inbound: InboundSequencer::new(config.max_buffered_messages, config.gap_timeout_ms),
            outbox: ResendQueue::new(config.max_resend_messages),
            queued_events: VecDeque::new(),
            invocations: VecDeque::new(),
            reconnect: ReconnectPolicy::new(
                config.reconnect_attempts,
                config.reconnect_interval_ms,
            ),
            resync_pending: false,
            transport_up: false,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mirror(&self) -> &MirrorTree {
        &self.mirror
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.inbound.last_applied()
    }

    pub fn queued_events(&self) -> usize {
        self.queued_events.len()
    }

    pub fn unacknowledged(&self) -> usize {
        self.outbox.len()
    }

    /// Starts a session from nothing by asking for a snapshot.
    pub fn connect(&mut self) -> ClientEnvelope {
        self.set_state(ConnectionState::Connecting);
        self.reconnect.reset();
        self.transport_up = true;
        self.begin_resync()
    }

    /// Handles one server envelope and returns what must be sent back.
    /// Protocol violations never surface as errors: they trigger a resync.
    pub fn handle_server(
        &mut self,
        envelope: ServerEnvelope,
        now_ms: u64,
    ) -> Vec<ClientEnvelope> {
        if self.state == ConnectionState::Disconnected {
            tracing::debug!("ignoring server envelope while disconnected");
            return Vec::new();
        }

        let sid = match &envelope {
            ServerEnvelope::Sync(message) => &message.sid,
            ServerEnvelope::Resume { sid, .. } | ServerEnvelope::Error { sid, .. } => sid,
        };
        if *sid != self.sid {
            let err = ProtocolError::SessionMismatch {
                expected: self.sid.clone(),
                got: sid.clone(),
            };
            return self.protocol_failure(err);
        }

        match envelope {
            ServerEnvelope::Sync(message) if message.resync => self.apply_snapshot(message),
            ServerEnvelope::Sync(message) => self.receive(message, now_ms),
            ServerEnvelope::Resume { seq, ack, .. } => self.resume(seq, ack),
            ServerEnvelope::Error { code, message, .. } => self.server_error(&code, &message),
        }
    }

    /// Sends `event` right away when synchronized, otherwise queues it until
    /// the session is synchronized again.
    pub fn send_event(&mut self, event: ClientEvent) -> Option<ClientEnvelope> {
        self.queued_events.push_back(event);
        if self.state != ConnectionState::Synchronized {
            tracing::trace!(
                queued = self.queued_events.len(),
                state = ?self.state,
                "queued client event"
            );
        }
        self.flush_events()
    }

    /// Packs every queued event into one message, in queue order.
    pub fn flush_events(&mut self) -> Option<ClientEnvelope> {
        if self.state != ConnectionState::Synchronized || self.queued_events.is_empty() {
            return None;
        }

        let events: Vec<ClientEvent> = self.queued_events.drain(..).collect();
        let ack = self.inbound.last_applied();
        let sid = self.sid.clone();
        let message = self.outbox.push_with(|seq| ClientMessage {
            sid,
            seq,
            ack,
            events,
        });
        Some(ClientEnvelope::Sync(message.clone()))
    }

    /// Timer tick. Gives up on a gap that has been open for too long.
    pub fn poll(&mut self, now_ms: u64) -> Vec<ClientEnvelope> {
        match self.inbound.poll_gap(now_ms) {
            Some(err) => self.protocol_failure(err),
            None => Vec::new(),
        }
    }

    pub fn on_transport_lost(&mut self) {
        self.transport_up = false;
        match self.state {
            ConnectionState::Connecting | ConnectionState::Synchronized => {
                self.set_state(ConnectionState::Reconnecting);
                self.reconnect.reset();
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Resyncing => {}
        }
    }

    /// Next reconnect attempt. Exhausting the attempts while reconnecting
    /// switches to resyncing, which gets a fresh set of attempts; exhausting
    /// those as well is final.
    pub fn next_reconnect_step(&mut self) -> ReconnectStep {
        let step = self.reconnect.next_step();
        if step == ReconnectStep::GiveUp && self.state == ConnectionState::Reconnecting {
            tracing::warn!(
                attempts = self.reconnect.attempt().saturating_sub(1),
                "reconnect attempts exhausted; falling back to resync"
            );
            self.set_state(ConnectionState::Resyncing);
            self.reconnect.reset();
        }
        step
    }

    /// The transport is back. Returns the `hello` to send.
    pub fn on_transport_restored(&mut self) -> Option<ClientEnvelope> {
        if self.state != ConnectionState::Disconnected {
            self.transport_up = true;
        }

        match self.state {
            ConnectionState::Disconnected | ConnectionState::Synchronized => None,
            ConnectionState::Reconnecting if !self.resync_pending => {
                let hello = match self.inbound.last_applied() {
                    Some(last_applied) => hello_envelope(self.sid.clone(), Some(last_applied)),
                    None => self.begin_resync(),
                };
                tracing::info!(last_applied = ?self.inbound.last_applied(), "reconnecting");
                Some(hello)
            }
            ConnectionState::Connecting
            | ConnectionState::Reconnecting
            | ConnectionState::Resyncing => {
                tracing::info!("transport restored; requesting snapshot");
                Some(self.begin_resync())
            }
        }
    }

    /// Ends the session. Queued events are dropped.
    pub fn teardown(&mut self) {
        if !self.queued_events.is_empty() {
            tracing::warn!(
                dropped = self.queued_events.len(),
                "dropping queued events on teardown"
            );
        }

        self.set_state(ConnectionState::Disconnected);
        self.queued_events.clear();
        self.invocations.clear();
        self.outbox.reset();
        self.inbound.reset();
        self.mirror.reset();
        self.reconnect.reset();
        self.resync_pending = false;
        self.transport_up = false;
    }

    /// Server-initiated invocations, in the order they were applied.
    pub fn drain_invocations(&mut self) -> Vec<ClientRpc> {
        self.invocations.drain(..).collect()
    }

    fn apply_snapshot(&mut self, message: ServerMessage) -> Vec<ClientEnvelope> {
        let stale = !self.resync_pending
            && self
                .inbound
                .last_applied()
                .is_some_and(|last| message.seq <= last);
        if stale {
            tracing::debug!(seq = message.seq, "ignoring stale snapshot");
            return Vec::new();
        }

        let seq = message.seq;
        self.resync_pending = false;
        self.mirror.reset();
        if let Err(err) = self.apply_message(message) {
            return self.protocol_failure(err);
        }

        for next in self.inbound.rebase(seq) {
            if let Err(err) = self.apply_message(next) {
                return self.protocol_failure(err);
            }
        }

        tracing::debug!(seq, nodes = self.mirror.len(), "applied snapshot");
        self.ack().into_iter().collect()
    }

    fn receive(&mut self, message: ServerMessage, now_ms: u64) -> Vec<ClientEnvelope> {
        match self.inbound.ingest(message.seq, message, now_ms) {
            Ingest::Deliver(batch) => {
                for message in batch {
                    if let Err(err) = self.apply_message(message) {
                        return self.protocol_failure(err);
                    }
                }
                self.ack().into_iter().collect()
            }
            Ingest::Duplicate => self.ack().into_iter().collect(),
            Ingest::Buffered { .. } => Vec::new(),
            Ingest::GaveUp(err) => self.protocol_failure(err),
        }
    }

    fn apply_message(&mut self, message: ServerMessage) -> Result<(), ProtocolError> {
        let updated = self.mirror.apply(&message.changes)?;

        if let Some(ack) = message.ack {
            self.outbox.acknowledge(ack);
        }

        tracing::debug!(
            seq = message.seq,
            changes = message.changes.len(),
            nodes = updated.len(),
            rpcs = message.rpcs.len(),
            "applied server message"
        );
        self.invocations.extend(message.rpcs);
        Ok(())
    }

    fn resume(&mut self, seq: u64, ack: Option<u64>) -> Vec<ClientEnvelope> {
        if self.state == ConnectionState::Synchronized {
            return self.prune_and_resend(ack);
        }

        if self.resync_pending {
            tracing::debug!(seq, "waiting for snapshot; ignoring resume");
            return Vec::new();
        }

        let applied = self.inbound.last_applied();
        if applied.is_none_or(|last| last < seq) {
            return self.protocol_failure(ProtocolError::ResumeBehind {
                seq,
                last_applied: applied,
            });
        }

        let mut out = self.prune_and_resend(ack);
        self.set_state(ConnectionState::Synchronized);
        self.reconnect.reset();
        out.extend(self.flush_events());
        out
    }

    fn prune_and_resend(&mut self, ack: Option<u64>) -> Vec<ClientEnvelope> {
        if let Some(ack) = ack {
            if self.outbox.can_replay_after(ack) {
                self.outbox.acknowledge(ack);
            } else if ack >= self.outbox.acked() {
                self.renumber_outbox(ack);
            }
        }

        let resend: Vec<ClientEnvelope> = self
            .outbox
            .iter()
            .map(|(_seq, message)| ClientEnvelope::Sync(message.clone()))
            .collect();
        if !resend.is_empty() {
            tracing::info!(
                count = resend.len(),
                "resending unacknowledged client messages"
            );
        }
        resend
    }

    /// The server's position does not line up with the retained messages,
    /// either because it is ahead of the local counter or because messages
    /// were dropped on overflow. Retained messages are renumbered to follow
    /// `ack` so the server sees no gap and no duplicates.
    fn renumber_outbox(&mut self, ack: u64) {
        let retained: Vec<Vec<ClientEvent>> = self
            .outbox
            .iter()
            .map(|(_seq, message)| message.events.clone())
            .collect();
        tracing::warn!(
            ack,
            last_seq = self.outbox.last_seq(),
            retained = retained.len(),
            "server position does not match local message ids; renumbering"
        );

        self.outbox.restart_at(ack.saturating_add(1));
        let last_applied = self.inbound.last_applied();
        for events in retained {
            let sid = self.sid.clone();
            self.outbox.push_with(|seq| ClientMessage {
                sid,
                seq,
                ack: last_applied,
                events,
            });
        }
    }

    fn server_error(&mut self, code: &str, message: &str) -> Vec<ClientEnvelope> {
        tracing::warn!(code, message, "server reported error");

        if code == SESSION_EXPIRED {
            self.teardown();
            return Vec::new();
        }

        if should_resync_for_error(code) {
            return self.resync(&format!("server requested resync via error code '{code}'"));
        }

        Vec::new()
    }

    fn protocol_failure(&mut self, err: ProtocolError) -> Vec<ClientEnvelope> {
        self.resync(&err.to_string())
    }

    /// Discards the mirror and asks for a snapshot. Only one request is in
    /// flight at a time; while the transport is down the request is made on
    /// restore instead.
    fn resync(&mut self, reason: &str) -> Vec<ClientEnvelope> {
        if self.resync_pending {
            tracing::debug!(reason, "resync already pending");
            return Vec::new();
        }

        tracing::warn!(reason, "requesting resync");
        self.set_state(ConnectionState::Resyncing);
        let hello = self.begin_resync();

        if self.transport_up { vec![hello] } else { Vec::new() }
    }

    fn begin_resync(&mut self) -> ClientEnvelope {
        self.mirror.reset();
        self.inbound.reset();
        self.resync_pending = true;
        hello_envelope(self.sid.clone(), None)
    }

    fn ack(&self) -> Option<ClientEnvelope> {
        self.inbound
            .last_applied()
            .map(|seq| ack_envelope(self.sid.clone(), seq))
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "connection state changed");
            self.state = next;
        }
    }
}

/// Server error codes after which the mirror can no longer be trusted.
pub fn should_resync_for_error(code: &str) -> bool {
    matches!(
        code,
        "decode_error"
            | "frame_too_large"
            | "invalid_envelope"
            | "resync_required"
            | "seq_mismatch"
            | "apply_error"
    )
}
