//! Server-side message construction.
//!
//! Messages are built under the session lock and handed out as
//! `Arc<ServerEnvelope>` so that encoding and transmission can happen after
//! the lock is released. The same `Arc` stays in the resend queue until the
//! client acknowledges it.

use std::sync::Arc;

use crate::change::{ChangeBatch, ChangeEntry};
use crate::protocol::{ClientRpc, ServerEnvelope, ServerMessage};
use crate::resend::ResendQueue;

#[derive(Debug)]
pub struct MessageWriter {
    sid: String,
    outbox: ResendQueue<Arc<ServerEnvelope>>,
}

impl MessageWriter {
    pub fn new(sid: impl Into<String>, max_resend_messages: usize) -> Self {
        Self {
            sid: sid.into(),
            outbox: ResendQueue::new(max_resend_messages),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn last_seq(&self) -> u64 {
        self.outbox.last_seq()
    }

    pub fn unacknowledged(&self) -> usize {
        self.outbox.len()
    }

    pub fn write(
        &mut self,
        batch: ChangeBatch,
        rpcs: Vec<ClientRpc>,
        ack: Option<u64>,
    ) -> Arc<ServerEnvelope> {
        self.push(batch.into_entries(), rpcs, ack, false)
    }

    /// A snapshot supersedes everything retained so far.
    pub fn write_snapshot(
        &mut self,
        changes: Vec<ChangeEntry>,
        rpcs: Vec<ClientRpc>,
        ack: Option<u64>,
    ) -> Arc<ServerEnvelope> {
        self.outbox.reset();
        self.push(changes, rpcs, ack, true)
    }

    pub fn acknowledge(&mut self, seq: u64) -> usize {
        let released = self.outbox.acknowledge(seq);
        if released > 0 {
            tracing::trace!(seq, released, "client acknowledged server messages");
        }
        released
    }

    /// Messages after `last_applied` with their original sequence ids, or
    /// `None` when some of them are no longer retained.
    pub fn replay_after(&mut self, last_applied: u64) -> Option<Vec<Arc<ServerEnvelope>>> {
        if !self.outbox.can_replay_after(last_applied) {
            return None;
        }

        self.outbox.acknowledge(last_applied);
        Some(self.outbox.replay_after(last_applied).cloned().collect())
    }

    pub fn resume(&self, ack: Option<u64>) -> ServerEnvelope {
        ServerEnvelope::Resume {
            sid: self.sid.clone(),
            seq: self.outbox.last_seq(),
            ack,
        }
    }

    fn push(
        &mut self,
        changes: Vec<ChangeEntry>,
        rpcs: Vec<ClientRpc>,
        ack: Option<u64>,
        resync: bool,
    ) -> Arc<ServerEnvelope> {
        let sid = self.sid.clone();
        let envelope = self.outbox.push_with(|seq| {
            Arc::new(ServerEnvelope::Sync(ServerMessage {
                sid,
                seq,
                ack,
                resync,
                changes,
                rpcs,
            }))
        });
        Arc::clone(envelope)
    }
}
