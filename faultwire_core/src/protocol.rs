//! Wire schema of the agent protocol.
//!
//! Every RPC carries exactly one [`Envelope`]. The envelope is a tagged union
//! ([`Message`]) plus the caller's session id and a protocol version, encoded with
//! `bincode`. Decoding fails closed: an unknown message variant, trailing bytes or a
//! foreign protocol version are all rejected instead of being coerced into something
//! the agent would act on.

use bincode::{
    Decode, Encode,
    config::{Configuration, Limit, LittleEndian, Varint},
    error::{DecodeError, EncodeError},
};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Version stamped into every envelope. Bump on any schema change.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound for a single encoded envelope.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Reserved key in monitor data that carries the crash-triage grouping label.
pub const BUCKET_KEY: &str = "Bucket";

pub type SessionId = String;

/// Configuration handed to a monitor constructor.
pub type MonitorParams = BTreeMap<String, String>;

/// Data a single monitor returns for a trial, keyed by an entry name
/// (for example `"Process.txt"` or [`BUCKET_KEY`]).
pub type MonitorData = BTreeMap<String, Vec<u8>>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Envelope encoding failed: {0}")]
    Encode(String),
    #[error("Envelope decoding failed: {0}")]
    Decode(String),
    #[error("Envelope has {trailing} trailing bytes after a {consumed}-byte message")]
    TrailingBytes { consumed: usize, trailing: usize },
    #[error("Protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },
}

impl From<EncodeError> for ProtocolError {
    fn from(err: EncodeError) -> Self {
        ProtocolError::Encode(err.to_string())
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

/// The bincode configuration shared by both ends of the wire.
pub fn wire_config() -> Configuration<LittleEndian, Varint, Limit<MAX_MESSAGE_LEN>> {
    bincode::config::standard().with_limit::<MAX_MESSAGE_LEN>()
}

/// Environment augmentations applied agent-side at handshake time, before any
/// monitor class is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct SessionEnvironment {
    /// Extra directories searched when a monitor needs to locate an executable.
    pub search_paths: Vec<String>,
    /// Catalog namespaces whose classes may be referenced without their prefix.
    pub imports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ClientHello {
    pub client_name: String,
    pub secret: Option<String>,
    pub environment: SessionEnvironment,
}

/// One monitor registration: caller-chosen name, catalog class and parameters.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MonitorSpec {
    pub name: String,
    pub class_id: String,
    pub params: MonitorParams,
}

impl MonitorSpec {
    pub fn new(
        name: impl Into<String>,
        class_id: impl Into<String>,
        params: MonitorParams,
    ) -> Self {
        Self {
            name: name.into(),
            class_id: class_id.into(),
            params,
        }
    }
}

/// One publisher registration: caller-chosen name, catalog class and positional args.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PublisherSpec {
    pub name: String,
    pub class_id: String,
    pub args: Vec<String>,
}

impl PublisherSpec {
    pub fn new(name: impl Into<String>, class_id: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            class_id: class_id.into(),
            args,
        }
    }
}

/// Why an agent refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum NackReason {
    AuthenticationFailed,
    SessionMismatch,
    MonitorConstruction(String),
    MonitorFailure(String),
    UnknownPublisher(String),
    PublisherConstruction(String),
    PublisherFailure(String),
    Protocol(String),
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::AuthenticationFailed => write!(f, "authentication failed"),
            NackReason::SessionMismatch => {
                write!(f, "session id does not match the agent's session")
            }
            NackReason::MonitorConstruction(reason) => {
                write!(f, "monitor construction failed: {reason}")
            }
            NackReason::MonitorFailure(reason) => write!(f, "monitor failed: {reason}"),
            NackReason::UnknownPublisher(name) => write!(f, "no publisher named '{name}'"),
            NackReason::PublisherConstruction(reason) => {
                write!(f, "publisher construction failed: {reason}")
            }
            NackReason::PublisherFailure(reason) => write!(f, "publisher failed: {reason}"),
            NackReason::Protocol(reason) => write!(f, "protocol violation: {reason}"),
        }
    }
}

/// Payload of an [`Message::Ack`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Reply {
    Done,
    Flag(bool),
    MonitorData(Vec<MonitorData>),
    Value(Option<Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Message {
    ClientHello(ClientHello),
    AgentHello,
    Ack(Reply),
    Nack(NackReason),
    ClientDisconnect,

    OnTestStarting,
    OnTestFinished,
    DetectFault,
    GetMonitorData,
    RedoTest,
    OnFault,
    OnShutdown,
    StopRun,
    StartMonitor(MonitorSpec),
    StopMonitor {
        name: String,
    },
    OnPublisherCall {
        method: String,
    },

    PublisherInitialize(PublisherSpec),
    PublisherStart {
        name: String,
    },
    PublisherStop {
        name: String,
    },
    PublisherAccept {
        name: String,
    },
    PublisherConnect {
        name: String,
    },
    PublisherClose {
        name: String,
    },
    PublisherCall {
        name: String,
        method: String,
        args: Vec<Vec<u8>>,
    },
    PublisherProperty {
        name: String,
        property: String,
        value: Option<Vec<u8>>,
    },
    PublisherSend {
        name: String,
        data: Vec<u8>,
    },
    PublisherReceive {
        name: String,
        size: Option<u64>,
    },
}

/// The discriminant of a [`Message`]. Each kind doubles as the RPC method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ClientHello,
    AgentHello,
    Ack,
    Nack,
    ClientDisconnect,
    OnTestStarting,
    OnTestFinished,
    DetectFault,
    GetMonitorData,
    RedoTest,
    OnFault,
    OnShutdown,
    StopRun,
    StartMonitor,
    StopMonitor,
    OnPublisherCall,
    PublisherInitialize,
    PublisherStart,
    PublisherStop,
    PublisherAccept,
    PublisherConnect,
    PublisherClose,
    PublisherCall,
    PublisherProperty,
    PublisherSend,
    PublisherReceive,
}

impl MessageKind {
    pub fn method_name(self) -> &'static str {
        match self {
            MessageKind::ClientHello => "clientHello",
            MessageKind::AgentHello => "agentHello",
            MessageKind::Ack => "ack",
            MessageKind::Nack => "nack",
            MessageKind::ClientDisconnect => "clientDisconnect",
            MessageKind::OnTestStarting => "onTestStarting",
            MessageKind::OnTestFinished => "onTestFinished",
            MessageKind::DetectFault => "detectFault",
            MessageKind::GetMonitorData => "getMonitorData",
            MessageKind::RedoTest => "redoTest",
            MessageKind::OnFault => "onFault",
            MessageKind::OnShutdown => "onShutdown",
            MessageKind::StopRun => "stopRun",
            MessageKind::StartMonitor => "startMonitor",
            MessageKind::StopMonitor => "stopMonitor",
            MessageKind::OnPublisherCall => "onPublisherCall",
            MessageKind::PublisherInitialize => "publisherInitialize",
            MessageKind::PublisherStart => "publisherStart",
            MessageKind::PublisherStop => "publisherStop",
            MessageKind::PublisherAccept => "publisherAccept",
            MessageKind::PublisherConnect => "publisherConnect",
            MessageKind::PublisherClose => "publisherClose",
            MessageKind::PublisherCall => "publisherCall",
            MessageKind::PublisherProperty => "publisherProperty",
            MessageKind::PublisherSend => "publisherSend",
            MessageKind::PublisherReceive => "publisherReceive",
        }
    }

    /// Replies travel back on the response path and are never valid requests.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::AgentHello | MessageKind::Ack | MessageKind::Nack
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ClientHello(_) => MessageKind::ClientHello,
            Message::AgentHello => MessageKind::AgentHello,
            Message::Ack(_) => MessageKind::Ack,
            Message::Nack(_) => MessageKind::Nack,
            Message::ClientDisconnect => MessageKind::ClientDisconnect,
            Message::OnTestStarting => MessageKind::OnTestStarting,
            Message::OnTestFinished => MessageKind::OnTestFinished,
            Message::DetectFault => MessageKind::DetectFault,
            Message::GetMonitorData => MessageKind::GetMonitorData,
            Message::RedoTest => MessageKind::RedoTest,
            Message::OnFault => MessageKind::OnFault,
            Message::OnShutdown => MessageKind::OnShutdown,
            Message::StopRun => MessageKind::StopRun,
            Message::StartMonitor(_) => MessageKind::StartMonitor,
            Message::StopMonitor { .. } => MessageKind::StopMonitor,
            Message::OnPublisherCall { .. } => MessageKind::OnPublisherCall,
            Message::PublisherInitialize(_) => MessageKind::PublisherInitialize,
            Message::PublisherStart { .. } => MessageKind::PublisherStart,
            Message::PublisherStop { .. } => MessageKind::PublisherStop,
            Message::PublisherAccept { .. } => MessageKind::PublisherAccept,
            Message::PublisherConnect { .. } => MessageKind::PublisherConnect,
            Message::PublisherClose { .. } => MessageKind::PublisherClose,
            Message::PublisherCall { .. } => MessageKind::PublisherCall,
            Message::PublisherProperty { .. } => MessageKind::PublisherProperty,
            Message::PublisherSend { .. } => MessageKind::PublisherSend,
            Message::PublisherReceive { .. } => MessageKind::PublisherReceive,
        }
    }

    pub fn ack() -> Self {
        Message::Ack(Reply::Done)
    }
}

/// A single protocol message as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Envelope {
    pub version: u16,
    pub session_id: Option<SessionId>,
    pub message: Message,
}

impl Envelope {
    pub fn new(session_id: Option<SessionId>, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session_id,
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, consumed): (Envelope, usize) =
            bincode::decode_from_slice(bytes, wire_config())?;
        if consumed != bytes.len() {
            return Err(ProtocolError::TrailingBytes {
                consumed,
                trailing: bytes.len() - consumed,
            });
        }
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: envelope.version,
            });
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_monitor_envelope_survives_the_wire() {
        let mut params = MonitorParams::new();
        params.insert("Command".to_string(), "/bin/true".to_string());
        let envelope = Envelope::new(
            Some("session-1".to_string()),
            Message::StartMonitor(MonitorSpec::new("proc", "Process", params)),
        );

        let bytes = envelope.encode().expect("encoding should succeed");
        let decoded = Envelope::decode(&bytes).expect("decoding should succeed");

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), MessageKind::StartMonitor);
        assert_eq!(decoded.kind().method_name(), "startMonitor");
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = Envelope::new(None, Message::DetectFault)
            .encode()
            .unwrap();
        bytes.push(0);

        match Envelope::decode(&bytes) {
            Err(ProtocolError::TrailingBytes { trailing, .. }) => assert_eq!(trailing, 1),
            other => panic!("Expected TrailingBytes, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_foreign_version() {
        let mut envelope = Envelope::new(None, Message::OnFault);
        envelope.version = PROTOCOL_VERSION + 1;
        let bytes = bincode::encode_to_vec(&envelope, wire_config()).unwrap();

        assert!(
            matches!(
                Envelope::decode(&bytes),
                Err(ProtocolError::VersionMismatch { found, .. }) if found == PROTOCOL_VERSION + 1
            ),
            "A newer protocol version must not be accepted"
        );
    }

    #[test]
    fn decode_rejects_unknown_message_variant() {
        // version 1, no session, variant index far beyond the last known kind
        let bytes = vec![1u8, 0u8, 200u8];
        assert!(
            matches!(Envelope::decode(&bytes), Err(ProtocolError::Decode(_))),
            "Unknown message kinds must fail closed"
        );
    }

    #[test]
    fn only_reply_kinds_are_flagged_as_replies() {
        assert!(MessageKind::Ack.is_reply());
        assert!(MessageKind::Nack.is_reply());
        assert!(MessageKind::AgentHello.is_reply());
        assert!(!MessageKind::ClientHello.is_reply());
        assert!(!MessageKind::PublisherReceive.is_reply());
    }
}
