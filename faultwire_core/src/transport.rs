//! Synchronous request/response transport between an [`AgentClient`] and an agent.
//!
//! One RPC is one connection: the caller writes a single length-prefixed frame
//! holding the method name and the encoded envelope, the agent answers with a single
//! length-prefixed frame holding the encoded reply envelope.
//!
//! [`AgentClient`]: crate::client::AgentClient

use crate::protocol::{MAX_MESSAGE_LEN, ProtocolError};
use bincode::config::{Configuration, Limit, LittleEndian, Varint};
use bincode::{Decode, Encode};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Port used when an agent URI does not name one.
pub const DEFAULT_AGENT_PORT: u16 = 9000;

pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Room for the method name and length prefixes wrapped around a full-size envelope.
pub const FRAME_HEADROOM: usize = 64 * 1024;

/// Upper bound for a single frame on the wire.
pub const MAX_FRAME_LEN: usize = MAX_MESSAGE_LEN + FRAME_HEADROOM;

fn frame_config() -> Configuration<LittleEndian, Varint, Limit<MAX_FRAME_LEN>> {
    bincode::config::standard().with_limit::<MAX_FRAME_LEN>()
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame of {0} bytes exceeds the {limit}-byte limit", limit = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error("Malformed message: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Invalid agent URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("Could not resolve any address for {0}")]
    Unresolved(String),
}

/// Carries one blob to the agent-side method of the same name and returns the reply blob.
pub trait Transport: Send {
    fn call(&mut self, method: &str, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// A parsed `scheme://host:port` agent address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUri {
    raw: String,
    host: String,
    port: u16,
}

impl AgentUri {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUri {
            uri: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = url.port().unwrap_or(DEFAULT_AGENT_PORT);
        Ok(Self {
            raw: raw.to_string(),
            host,
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, used as the agent's display name when none is configured.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(TransportError::Unresolved(self.authority()));
        }
        Ok(addrs)
    }
}

/// A request frame: which agent method to invoke and the encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RpcCall {
    pub method: String,
    pub blob: Vec<u8>,
}

impl RpcCall {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::encode_to_vec(self, frame_config())
            .map_err(|e| TransportError::Protocol(ProtocolError::from(e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (call, consumed): (RpcCall, usize) =
            bincode::decode_from_slice(bytes, frame_config())
                .map_err(|e| TransportError::Protocol(ProtocolError::from(e)))?;
        if consumed != bytes.len() {
            return Err(TransportError::Protocol(ProtocolError::TrailingBytes {
                consumed,
                trailing: bytes.len() - consumed,
            }));
        }
        Ok(call)
    }
}

/// Writes `payload` prefixed with its big-endian `u32` length.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len =
        u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge(payload.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// TCP transport: a fresh connection per call, bounded by `timeout` for connect,
/// read and write.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    uri: AgentUri,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(uri: AgentUri) -> Self {
        Self {
            uri,
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn open(&self) -> Result<TcpStream, TransportError> {
        let mut last_error = None;
        for addr in self.uri.socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .map(TransportError::Io)
            .unwrap_or_else(|| TransportError::Unresolved(self.uri.authority())))
    }
}

impl Transport for TcpTransport {
    fn call(&mut self, method: &str, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let frame = RpcCall {
            method: method.to_string(),
            blob: request.to_vec(),
        }
        .encode()?;
        let mut stream = self.open()?;
        write_frame(&mut stream, &frame)?;
        read_frame(&mut stream)
    }
}
