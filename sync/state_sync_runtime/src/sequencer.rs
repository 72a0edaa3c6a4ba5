//! Receiver-side ordering: duplicate discard, gap buffering and gap timeout.

use std::collections::BTreeMap;

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq)]
pub enum Ingest<M> {
    /// Contiguous messages ready to apply, starting at `last_applied + 1`.
    Deliver(Vec<M>),
    Duplicate,
    Buffered { expected: u64 },
    /// The gap cannot be closed; buffered messages have been dropped.
    GaveUp(ProtocolError),
}

#[derive(Debug, Clone)]
pub struct InboundSequencer<M> {
    last_applied: Option<u64>,
    buffered: BTreeMap<u64, M>,
    gap_started_ms: Option<u64>,
    max_buffered: usize,
    gap_timeout_ms: u64,
}

impl<M> InboundSequencer<M> {
    pub fn new(max_buffered: usize, gap_timeout_ms: u64) -> Self {
        Self {
            last_applied: None,
            buffered: BTreeMap::new(),
            gap_started_ms: None,
            max_buffered,
            gap_timeout_ms,
        }
    }

    /// Starts from a known baseline, as if `last_applied` had been delivered.
    pub fn starting_at(last_applied: u64, max_buffered: usize, gap_timeout_ms: u64) -> Self {
        let mut sequencer = Self::new(max_buffered, gap_timeout_ms);
        sequencer.last_applied = Some(last_applied);
        sequencer
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Saturates at `u64::MAX`; once that id is applied everything counts as
    /// a duplicate.
    pub fn expected(&self) -> u64 {
        self.last_applied.map_or(1, |seq| seq.saturating_add(1))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn has_gap(&self) -> bool {
        !self.buffered.is_empty()
    }

    /// Until a baseline exists every message is buffered; the baseline comes
    /// from [`rebase`](Self::rebase) when a snapshot is applied.
    pub fn ingest(&mut self, seq: u64, message: M, now_ms: u64) -> Ingest<M> {
        if self.last_applied.is_some_and(|last| seq <= last) {
            tracing::warn!(
                seq,
                last_applied = ?self.last_applied,
                "ignoring already applied message"
            );
            return Ingest::Duplicate;
        }

        if self.buffered.contains_key(&seq) {
            return Ingest::Duplicate;
        }

        if self.last_applied.is_none() || seq != self.expected() {
            return self.buffer_gap(seq, message, now_ms);
        }

        let mut batch = vec![message];
        let last = self.drain_contiguous(seq, &mut batch);

        self.last_applied = Some(last);
        if self.buffered.is_empty() {
            self.gap_started_ms = None;
        }

        Ingest::Deliver(batch)
    }

    /// Reports a gap that has been open longer than the timeout. Drops the
    /// buffered messages when it does.
    pub fn poll_gap(&mut self, now_ms: u64) -> Option<ProtocolError> {
        let started = self.gap_started_ms?;
        let waited_ms = now_ms.saturating_sub(started);
        if waited_ms <= self.gap_timeout_ms {
            return None;
        }

        let expected = self.expected();
        tracing::warn!(expected, waited_ms, "gave up waiting for missing message");
        self.clear_gap();
        Some(ProtocolError::GapTimeout {
            expected,
            waited_ms,
        })
    }

    /// Moves the baseline to `seq` (a snapshot was applied there). Older
    /// buffered messages are dropped; newer contiguous ones are returned.
    pub fn rebase(&mut self, seq: u64) -> Vec<M> {
        self.buffered = match seq.checked_add(1) {
            Some(next) => self.buffered.split_off(&next),
            None => BTreeMap::new(),
        };

        let mut batch = Vec::new();
        let last = self.drain_contiguous(seq, &mut batch);
        self.last_applied = Some(last);

        if self.buffered.is_empty() {
            self.gap_started_ms = None;
        }
        batch
    }

    pub fn clear_gap(&mut self) {
        self.buffered.clear();
        self.gap_started_ms = None;
    }

    /// Forgets the baseline entirely.
    pub fn reset(&mut self) {
        self.last_applied = None;
        self.clear_gap();
    }

    /// Moves buffered messages following `last` into `batch` and returns the
    /// new last id.
    fn drain_contiguous(&mut self, mut last: u64, batch: &mut Vec<M>) -> u64 {
        while let Some(next) = last
            .checked_add(1)
            .and_then(|seq| self.buffered.remove(&seq))
        {
            batch.push(next);
            last += 1;
        }
        last
    }

    fn buffer_gap(&mut self, seq: u64, message: M, now_ms: u64) -> Ingest<M> {
        let expected = self.expected();

        if let Some(started) = self.gap_started_ms {
            let waited_ms = now_ms.saturating_sub(started);
            if waited_ms > self.gap_timeout_ms {
                self.clear_gap();
                return Ingest::GaveUp(ProtocolError::GapTimeout {
                    expected,
                    waited_ms,
                });
            }
        } else {
            self.gap_started_ms = Some(now_ms);
        }

        if self.buffered.len() >= self.max_buffered {
            let buffered = self.buffered.len();
            self.clear_gap();
            return Ingest::GaveUp(ProtocolError::GapOverflow { expected, buffered });
        }

        tracing::debug!(
            seq,
            expected,
            "received message out of order; postponing until missing messages arrive"
        );
        self.buffered.insert(seq, message);
        Ingest::Buffered { expected }
    }
}
