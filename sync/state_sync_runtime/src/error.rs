use std::io;

use thiserror::Error;

use crate::node::NodeId;

/// Misuse of the tree API by application code. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("node {0} does not exist in this tree")]
    UnknownNode(NodeId),

    #[error("node {0} has been detached and can no longer be modified")]
    DetachedNode(NodeId),

    #[error("node {0} is already attached to a parent")]
    AlreadyAttached(NodeId),

    #[error("node {child} is not a child of node {parent}")]
    NotAChild { parent: NodeId, child: NodeId },

    #[error("attaching node {child} under node {parent} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },

    #[error("child index {index} out of bounds for node {parent} with {len} children")]
    IndexOutOfBounds {
        parent: NodeId,
        index: usize,
        len: usize,
    },

    #[error("no listener registration {id} for event '{event}' on node {node}")]
    UnknownListener { node: NodeId, event: String, id: u64 },
}

/// Ordering or content violations on the wire. Fatal to the current
/// synchronization state and answered with a full resync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("change references unknown node {node}")]
    UnknownNode { node: NodeId },

    #[error("change references unknown parent {parent} for child {child}")]
    UnknownParent { parent: NodeId, child: NodeId },

    #[error("node {node} is already registered")]
    DuplicateNode { node: NodeId },

    #[error("node {child} is already a child of {parent}")]
    AlreadyChild { parent: NodeId, child: NodeId },

    #[error("node {child} is not a child of {parent}")]
    MissingChild { parent: NodeId, child: NodeId },

    #[error("child index {index} out of bounds for node {parent} with {len} children")]
    ChildIndex {
        parent: NodeId,
        index: usize,
        len: usize,
    },

    #[error("gave up waiting for message {expected} after {waited_ms} ms")]
    GapTimeout { expected: u64, waited_ms: u64 },

    #[error("gap buffer full waiting for message {expected} ({buffered} buffered)")]
    GapOverflow { expected: u64, buffered: usize },

    #[error("session id mismatch: expected {expected}, got {got}")]
    SessionMismatch { expected: String, got: String },

    #[error("server has applied up to {seq} but only {last_applied:?} was applied locally")]
    ResumeBehind { seq: u64, last_applied: Option<u64> },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transport disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session lock poisoned")]
    Poisoned,
}
