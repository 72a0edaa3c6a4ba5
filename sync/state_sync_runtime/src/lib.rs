//! Server-to-client state tree synchronization.
//!
//! The server side records mutations on a [`StateTree`], flushes them into
//! sequenced messages and retains those until acknowledged. The client side
//! applies them in order to a [`MirrorTree`] and recovers from lost
//! connections by replay or full resync.

pub mod change;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod mirror;
pub mod node;
pub mod protocol;
pub mod reconnect;
pub mod resend;
pub mod sequencer;
pub mod server;
pub mod tree;

pub use change::{ChangeBatch, ChangeEntry, ChangeOp};
pub use client::{ClientSession, ConnectionState};
pub use config::SyncConfig;
pub use error::{ProtocolError, StateError, SyncError, TransportError};
pub use mirror::{MirrorNode, MirrorTree};
pub use node::{FeatureKind, NodeFeature, NodeId, NodeStatus, StateNode};
pub use protocol::{ClientEnvelope, ClientEvent, ServerEnvelope};
pub use reconnect::ReconnectStep;
pub use server::{LifecycleRegistration, ListenerRegistration, ServerSession, UiContext};
pub use tree::{Lifecycle, StateTree};

pub use serde_json;
