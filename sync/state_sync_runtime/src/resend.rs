//! Sender-side sequencing and retention of unacknowledged messages.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct ResendQueue<M> {
    last_seq: u64,
    acked: u64,
    unacked: VecDeque<(u64, M)>,
    capacity: usize,
    overflowed: bool,
}

impl<M> ResendQueue<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            last_seq: 0,
            acked: 0,
            unacked: VecDeque::new(),
            capacity: capacity.max(1),
            overflowed: false,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    /// `true` once messages had to be dropped unacknowledged; replay is no
    /// longer possible until the next [`reset`](Self::reset).
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Assigns the next sequence id and retains the message built for it.
    pub fn push_with<F>(&mut self, build: F) -> &M
    where
        F: FnOnce(u64) -> M,
    {
        self.last_seq += 1;
        let seq = self.last_seq;

        if self.unacked.len() >= self.capacity {
            self.unacked.pop_front();
            if !self.overflowed {
                tracing::warn!(
                    capacity = self.capacity,
                    "resend queue full; oldest unacknowledged message dropped"
                );
            }
            self.overflowed = true;
        }

        self.unacked.push_back((seq, build(seq)));
        &self.unacked[self.unacked.len() - 1].1
    }

    /// Prunes everything up to and including `upto`. Returns the number of
    /// messages released.
    pub fn acknowledge(&mut self, upto: u64) -> usize {
        let upto = upto.min(self.last_seq);
        if upto <= self.acked {
            return 0;
        }

        self.acked = upto;
        let before = self.unacked.len();
        while self
            .unacked
            .front()
            .is_some_and(|(seq, _message)| *seq <= upto)
        {
            self.unacked.pop_front();
        }
        before - self.unacked.len()
    }

    /// Whether every message after `last_applied` is still retained.
    pub fn can_replay_after(&self, last_applied: u64) -> bool {
        if last_applied > self.last_seq {
            return false;
        }
        if last_applied == self.last_seq {
            return true;
        }
        match self.unacked.front() {
            Some((first, _message)) => *first <= last_applied + 1,
            None => false,
        }
    }

    /// Retained messages with `seq > last_applied`, in order.
    pub fn replay_after(&self, last_applied: u64) -> impl Iterator<Item = &M> {
        self.unacked
            .iter()
            .filter(move |(seq, _message)| *seq > last_applied)
            .map(|(_seq, message)| message)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &M)> {
        self.unacked.iter().map(|(seq, message)| (*seq, message))
    }

    /// Drops retained messages and clears the overflow marker. The sequence
    /// counter keeps running.
    pub fn reset(&mut self) {
        self.unacked.clear();
        self.acked = self.last_seq;
        self.overflowed = false;
    }

    /// Restarts numbering so the next message gets `next_seq`. Used when the
    /// peer's receive side was rebuilt.
    pub fn restart_at(&mut self, next_seq: u64) {
        self.unacked.clear();
        self.last_seq = next_seq.saturating_sub(1);
        self.acked = self.last_seq;
        self.overflowed = false;
    }
}
