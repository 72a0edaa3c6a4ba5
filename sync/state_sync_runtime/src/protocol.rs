use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

use crate::change::ChangeEntry;
use crate::error::TransportError;
use crate::node::NodeId;

pub const CLIENT_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_CLIENT_CAP: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub sid: String,
    pub seq: u64,
    #[serde(default)]
    pub ack: Option<u64>,
    #[serde(default)]
    pub resync: bool,
    #[serde(default)]
    pub changes: Vec<ChangeEntry>,
    #[serde(default)]
    pub rpcs: Vec<ClientRpc>,
}

/// Server-initiated invocation executed by the client after the changes of
/// the same message have been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRpc {
    #[serde(default)]
    pub node: Option<NodeId>,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub sid: String,
    pub seq: u64,
    #[serde(default)]
    pub ack: Option<u64>,
    pub events: Vec<ClientEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientEvent {
    Event {
        node: NodeId,
        event: String,
        #[serde(default)]
        data: Value,
    },
    PropertySync {
        node: NodeId,
        key: String,
        value: Value,
    },
    Rpc {
        #[serde(default)]
        node: Option<NodeId>,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ServerEnvelope {
    #[serde(rename = "sync")]
    Sync(ServerMessage),

    /// Replay after `hello` is complete: everything up to `seq` has been
    /// sent and client messages up to `ack` have been applied.
    #[serde(rename = "resume")]
    Resume {
        sid: String,
        seq: u64,
        #[serde(default)]
        ack: Option<u64>,
    },

    #[serde(rename = "error")]
    Error {
        sid: String,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ClientEnvelope {
    /// Connect, reconnect or request a snapshot (`last_applied: None`).
    #[serde(rename = "hello")]
    Hello {
        sid: String,
        #[serde(default)]
        last_applied: Option<u64>,
    },

    #[serde(rename = "sync")]
    Sync(ClientMessage),

    #[serde(rename = "ack")]
    Ack { sid: String, seq: u64 },
}

pub fn hello_envelope(sid: String, last_applied: Option<u64>) -> ClientEnvelope {
    ClientEnvelope::Hello { sid, last_applied }
}

pub fn ack_envelope(sid: String, seq: u64) -> ClientEnvelope {
    ClientEnvelope::Ack { sid, seq }
}

pub fn error_envelope(
    sid: String,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ServerEnvelope {
    ServerEnvelope::Error {
        sid,
        code: code.into(),
        message: message.into(),
    }
}

/// Writes every envelope received on `rx` as one frame. Returns when all
/// senders are gone.
pub fn writer_loop<W, T>(
    writer: &mut W,
    rx: Receiver<T>,
    max_payload: usize,
) -> Result<(), TransportError>
where
    W: Write,
    T: EnvelopeRef,
{
    for envelope in rx {
        let payload = serde_json::to_vec(envelope.envelope())?;
        write_frame(writer, &payload, max_payload)?;
        writer.flush()?;
    }

    Ok(())
}

/// Decodes frames until end of input. A clean EOF between frames is a normal
/// shutdown.
pub fn reader_loop<R, T, F>(
    reader: &mut R,
    max_payload: usize,
    mut on_envelope: F,
) -> Result<(), TransportError>
where
    R: Read,
    T: for<'de> Deserialize<'de>,
    F: FnMut(T),
{
    loop {
        match read_frame(reader, max_payload) {
            Ok(payload) => {
                let envelope = decode_envelope(&payload)?;
                on_envelope(envelope);
            }
            Err(TransportError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Lets the writer loop send owned envelopes as well as the shared ones
/// produced by a server flush.
pub trait EnvelopeRef {
    type Envelope: Serialize;

    fn envelope(&self) -> &Self::Envelope;
}

impl EnvelopeRef for ClientEnvelope {
    type Envelope = ClientEnvelope;

    fn envelope(&self) -> &ClientEnvelope {
        self
    }
}

impl EnvelopeRef for ServerEnvelope {
    type Envelope = ServerEnvelope;

    fn envelope(&self) -> &ServerEnvelope {
        self
    }
}

impl EnvelopeRef for std::sync::Arc<ServerEnvelope> {
    type Envelope = ServerEnvelope;

    fn envelope(&self) -> &ServerEnvelope {
        self
    }
}

pub fn encode_envelope<T: Serialize>(envelope: &T) -> Result<Vec<u8>, TransportError> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode_envelope<T>(payload: &[u8]) -> Result<T, TransportError>
where
    T: for<'de> Deserialize<'de>,
{
    Ok(serde_json::from_slice(payload)?)
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(
    writer: &mut impl Write,
    payload: &[u8],
    max_payload: usize,
) -> Result<(), TransportError> {
    if payload.len() > max_payload {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_payload,
        });
    }

    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}
