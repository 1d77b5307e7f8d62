//! Driver-side stub for a single agent.
//!
//! An [`AgentClient`] owns the session id handed out by its agent and two ledgers:
//! the monitors and the publishers it registered, in order. After a transport
//! failure the client reconnects and replays both ledgers, so the agent ends up
//! with the same registrations it had before the failure.

use crate::protocol::{
    ClientHello, Envelope, Message, MessageKind, MonitorData, MonitorSpec, NackReason,
    PublisherSpec, Reply, SessionEnvironment, SessionId,
};
use crate::transport::{AgentUri, TcpTransport, Transport, TransportError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent '{agent}' rejected the handshake: authentication failed")]
    AuthenticationFailed { agent: String },
    #[error("Unable to connect to agent '{agent}' at {uri} after {attempts} attempts: {reason}")]
    ConnectFailed {
        agent: String,
        uri: String,
        attempts: u32,
        reason: String,
    },
    #[error("Agent '{agent}' could not create monitor '{monitor}': {reason}")]
    MonitorConstruction {
        agent: String,
        monitor: String,
        reason: String,
    },
    #[error("Agent '{agent}' reported a monitor failure during {method}: {reason}")]
    MonitorFailure {
        agent: String,
        method: MessageKind,
        reason: String,
    },
    #[error("Connection to agent '{agent}' was lost and re-established; repeat the trial")]
    RedoTest { agent: String },
    #[error("Lost agent '{agent}' and could not reconnect: {reason}")]
    ReconnectFailed { agent: String, reason: String },
    #[error("Agent '{agent}' publisher request {method} failed: {reason}")]
    Publisher {
        agent: String,
        method: MessageKind,
        reason: NackReason,
    },
    #[error("Agent '{agent}' refused {method}: {reason}")]
    Rejected {
        agent: String,
        method: MessageKind,
        reason: NackReason,
    },
    #[error("Agent '{agent}' answered {method} with an unexpected {reply:?}")]
    UnexpectedReply {
        agent: String,
        method: MessageKind,
        reply: Message,
    },
    #[error("Transport to agent '{agent}' failed during {method}: {source}")]
    Transport {
        agent: String,
        method: MessageKind,
        #[source]
        source: TransportError,
    },
    #[error("No agent named '{0}'")]
    UnknownAgent(String),
}

/// How often and how patiently [`AgentClient::connect`] retries the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO)
    }
}

pub struct AgentClient {
    name: String,
    uri: String,
    secret: Option<String>,
    environment: SessionEnvironment,
    retry: RetryPolicy,
    transport: Box<dyn Transport>,
    session_id: Option<SessionId>,
    monitors: Vec<MonitorSpec>,
    publishers: Vec<PublisherSpec>,
}

impl AgentClient {
    pub fn new(
        name: impl Into<String>,
        uri: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            secret: None,
            environment: SessionEnvironment::default(),
            retry: RetryPolicy::default(),
            transport,
            session_id: None,
            monitors: Vec::new(),
            publishers: Vec::new(),
        }
    }

    /// A client speaking TCP to `uri`.
    pub fn tcp(name: impl Into<String>, uri: AgentUri, timeout: Duration) -> Self {
        let raw = uri.as_str().to_string();
        Self::new(name, raw, Box::new(TcpTransport::new(uri).with_timeout(timeout)))
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_environment(mut self, environment: SessionEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn monitor_ledger(&self) -> &[MonitorSpec] {
        &self.monitors
    }

    pub fn publisher_ledger(&self) -> &[PublisherSpec] {
        &self.publishers
    }

    /// Performs the handshake, retrying per the [`RetryPolicy`]. A rejected secret
    /// is final and not retried.
    pub fn connect(&mut self) -> Result<(), AgentError> {
        self.session_id = None;
        let hello = ClientHello {
            client_name: self.name.clone(),
            secret: self.secret.clone(),
            environment: self.environment.clone(),
        };

        let mut last_failure = String::new();
        for attempt in 1..=self.retry.attempts {
            match self.exchange(Message::ClientHello(hello.clone())) {
                Ok(Envelope {
                    message: Message::AgentHello,
                    session_id: Some(id),
                    ..
                }) if !id.is_empty() => {
                    info!(agent = %self.name, session = %id, attempt, "connected to agent");
                    self.session_id = Some(id);
                    return Ok(());
                }
                Ok(Envelope {
                    message: Message::Nack(NackReason::AuthenticationFailed),
                    ..
                }) => {
                    return Err(AgentError::AuthenticationFailed {
                        agent: self.name.clone(),
                    });
                }
                Ok(other) => {
                    last_failure = format!("unexpected handshake reply {:?}", other.message)
                }
                Err(e) => last_failure = e.to_string(),
            }
            debug!(agent = %self.name, attempt, error = %last_failure, "handshake attempt failed");
            if attempt < self.retry.attempts {
                thread::sleep(self.retry.backoff);
            }
        }
        Err(AgentError::ConnectFailed {
            agent: self.name.clone(),
            uri: self.uri.clone(),
            attempts: self.retry.attempts,
            reason: last_failure,
        })
    }

    /// Reconnects and replays the monitor ledger, then the publisher ledger, in
    /// registration order. The ledgers themselves are left untouched.
    pub fn reconnect(&mut self) -> Result<(), AgentError> {
        warn!(agent = %self.name, monitors = self.monitors.len(), "reconnecting to agent");
        self.connect()?;
        for spec in self.monitors.clone() {
            debug!(agent = %self.name, monitor = %spec.name, "restarting monitor");
            self.register_monitor(spec)?;
        }
        for spec in self.publishers.clone() {
            debug!(agent = %self.name, publisher = %spec.name, "restoring publisher");
            let reply = self.request(Message::PublisherInitialize(spec))?;
            self.expect_done(MessageKind::PublisherInitialize, reply)?;
        }
        Ok(())
    }

    pub fn start_monitor(&mut self, spec: MonitorSpec) -> Result<(), AgentError> {
        self.register_monitor(spec.clone())?;
        match self.monitors.iter_mut().find(|m| m.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.monitors.push(spec),
        }
        Ok(())
    }

    pub fn stop_monitor(&mut self, name: &str) -> Result<(), AgentError> {
        let reply = self.request(Message::StopMonitor {
            name: name.to_string(),
        })?;
        self.expect_done(MessageKind::StopMonitor, reply)?;
        self.monitors.retain(|m| m.name != name);
        Ok(())
    }

    pub fn on_test_starting(&mut self) -> Result<(), AgentError> {
        let reply = self.lifecycle(Message::OnTestStarting)?;
        self.expect_done(MessageKind::OnTestStarting, reply)
    }

    pub fn on_test_finished(&mut self) -> Result<(), AgentError> {
        let reply = self.lifecycle(Message::OnTestFinished)?;
        self.expect_done(MessageKind::OnTestFinished, reply)
    }

    pub fn detected_fault(&mut self) -> Result<bool, AgentError> {
        let reply = self.lifecycle(Message::DetectFault)?;
        self.expect_flag(MessageKind::DetectFault, reply)
    }

    pub fn get_monitor_data(&mut self) -> Result<Vec<MonitorData>, AgentError> {
        match self.lifecycle(Message::GetMonitorData)? {
            Reply::MonitorData(data) => Ok(data),
            other => Err(self.unexpected(MessageKind::GetMonitorData, Message::Ack(other))),
        }
    }

    pub fn redo_test(&mut self) -> Result<bool, AgentError> {
        let reply = self.lifecycle(Message::RedoTest)?;
        self.expect_flag(MessageKind::RedoTest, reply)
    }

    pub fn on_fault(&mut self) -> Result<(), AgentError> {
        let reply = self.lifecycle(Message::OnFault)?;
        self.expect_done(MessageKind::OnFault, reply)
    }

    pub fn stop_run(&mut self) -> Result<bool, AgentError> {
        let reply = self.lifecycle(Message::StopRun)?;
        self.expect_flag(MessageKind::StopRun, reply)
    }

    pub fn on_publisher_call(&mut self, method: &str) -> Result<Option<Vec<u8>>, AgentError> {
        let reply = self.lifecycle(Message::OnPublisherCall {
            method: method.to_string(),
        })?;
        self.expect_value(MessageKind::OnPublisherCall, reply)
    }

    /// A single attempt: no retry and no reconnect.
    pub fn on_shutdown(&mut self) -> Result<(), AgentError> {
        let reply = self.request(Message::OnShutdown)?;
        self.expect_done(MessageKind::OnShutdown, reply)
    }

    /// Ends the session on the agent. The ledgers are kept.
    pub fn disconnect(&mut self) -> Result<(), AgentError> {
        let result = self
            .request(Message::ClientDisconnect)
            .and_then(|reply| self.expect_done(MessageKind::ClientDisconnect, reply));
        self.session_id = None;
        result
    }

    pub fn publisher_initialize(&mut self, spec: PublisherSpec) -> Result<(), AgentError> {
        let reply = self
            .request(Message::PublisherInitialize(spec.clone()))
            .map_err(publisher_rejection)?;
        self.expect_done(MessageKind::PublisherInitialize, reply)?;
        match self.publishers.iter_mut().find(|p| p.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.publishers.push(spec),
        }
        Ok(())
    }

    pub fn has_publisher(&self, name: &str) -> bool {
        self.publishers.iter().any(|p| p.name == name)
    }

    pub fn publisher_start(&mut self, name: &str) -> Result<(), AgentError> {
        let reply = self.publisher_request(Message::PublisherStart {
            name: name.to_string(),
        })?;
        self.expect_done(MessageKind::PublisherStart, reply)
    }

    pub fn publisher_stop(&mut self, name: &str) -> Result<(), AgentError> {
        let reply = self.publisher_request(Message::PublisherStop {
            name: name.to_string(),
        })?;
        self.expect_done(MessageKind::PublisherStop, reply)
    }

    pub fn publisher_accept(&mut self, name: &str) -> Result<(), AgentError> {
        let reply = self.publisher_request(Message::PublisherAccept {
            name: name.to_string(),
        })?;
        self.expect_done(MessageKind::PublisherAccept, reply)
    }

    pub fn publisher_connect(&mut self, name: &str) -> Result<(), AgentError> {
        let reply = self.publisher_request(Message::PublisherConnect {
            name: name.to_string(),
        })?;
        self.expect_done(MessageKind::PublisherConnect, reply)
    }

    pub fn publisher_close(&mut self, name: &str) -> Result<(), AgentError> {
        let reply = self.publisher_request(Message::PublisherClose {
            name: name.to_string(),
        })?;
        self.expect_done(MessageKind::PublisherClose, reply)
    }

    pub fn publisher_call(
        &mut self,
        name: &str,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        let reply = self.publisher_request(Message::PublisherCall {
            name: name.to_string(),
            method: method.to_string(),
            args,
        })?;
        self.expect_value(MessageKind::PublisherCall, reply)
    }

    /// Reads a property when `value` is `None`, writes it otherwise.
    pub fn publisher_property(
        &mut self,
        name: &str,
        property: &str,
        value: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        let reply = self.publisher_request(Message::PublisherProperty {
            name: name.to_string(),
            property: property.to_string(),
            value,
        })?;
        self.expect_value(MessageKind::PublisherProperty, reply)
    }

    pub fn publisher_send(&mut self, name: &str, data: &[u8]) -> Result<(), AgentError> {
        let reply = self.publisher_request(Message::PublisherSend {
            name: name.to_string(),
            data: data.to_vec(),
        })?;
        self.expect_done(MessageKind::PublisherSend, reply)
    }

    pub fn publisher_receive(
        &mut self,
        name: &str,
        size: Option<usize>,
    ) -> Result<Vec<u8>, AgentError> {
        let reply = self.publisher_request(Message::PublisherReceive {
            name: name.to_string(),
            size: size.map(|n| n as u64),
        })?;
        Ok(self
            .expect_value(MessageKind::PublisherReceive, reply)?
            .unwrap_or_default())
    }

    fn exchange(&mut self, message: Message) -> Result<Envelope, TransportError> {
        let method = message.kind().method_name();
        let request = Envelope::new(self.session_id.clone(), message).encode()?;
        let reply = self.transport.call(method, &request)?;
        Ok(Envelope::decode(&reply)?)
    }

    /// One round trip. Transport failures surface as [`AgentError::Transport`].
    fn request(&mut self, message: Message) -> Result<Reply, AgentError> {
        let kind = message.kind();
        match self.exchange(message) {
            Ok(Envelope {
                message: Message::Ack(reply),
                ..
            }) => Ok(reply),
            Ok(Envelope {
                message: Message::Nack(reason),
                ..
            }) => Err(self.rejected(kind, reason)),
            Ok(other) => Err(self.unexpected(kind, other.message)),
            Err(source) => Err(AgentError::Transport {
                agent: self.name.clone(),
                method: kind,
                source,
            }),
        }
    }

    /// A round trip made during a trial. A lost connection or a session the agent
    /// no longer knows is never read as an answer: the client reconnects and asks
    /// the caller to repeat the trial.
    fn lifecycle(&mut self, message: Message) -> Result<Reply, AgentError> {
        let kind = message.kind();
        let failure = match self.request(message) {
            Ok(reply) => return Ok(reply),
            Err(AgentError::Transport { source, .. }) => source.to_string(),
            Err(AgentError::Rejected {
                reason: NackReason::SessionMismatch,
                ..
            }) => "agent no longer recognises the session".to_string(),
            Err(other) => return Err(other),
        };
        warn!(agent = %self.name, method = %kind, error = %failure, "lifecycle call failed");
        match self.reconnect() {
            Ok(()) => Err(AgentError::RedoTest {
                agent: self.name.clone(),
            }),
            Err(e) => Err(AgentError::ReconnectFailed {
                agent: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Publisher traffic is part of the trial, so a lost request redoes it.
    fn publisher_request(&mut self, message: Message) -> Result<Reply, AgentError> {
        self.lifecycle(message).map_err(publisher_rejection)
    }

    fn register_monitor(&mut self, spec: MonitorSpec) -> Result<(), AgentError> {
        let monitor = spec.name.clone();
        match self.request(Message::StartMonitor(spec)) {
            Ok(reply) => self.expect_done(MessageKind::StartMonitor, reply),
            Err(AgentError::Rejected {
                reason: NackReason::MonitorConstruction(reason),
                ..
            }) => Err(AgentError::MonitorConstruction {
                agent: self.name.clone(),
                monitor,
                reason,
            }),
            Err(other) => Err(other),
        }
    }

    fn rejected(&self, method: MessageKind, reason: NackReason) -> AgentError {
        match reason {
            NackReason::MonitorFailure(reason) => AgentError::MonitorFailure {
                agent: self.name.clone(),
                method,
                reason,
            },
            reason => AgentError::Rejected {
                agent: self.name.clone(),
                method,
                reason,
            },
        }
    }

    fn unexpected(&self, method: MessageKind, reply: Message) -> AgentError {
        AgentError::UnexpectedReply {
            agent: self.name.clone(),
            method,
            reply,
        }
    }

    fn expect_done(&self, method: MessageKind, reply: Reply) -> Result<(), AgentError> {
        match reply {
            Reply::Done => Ok(()),
            other => Err(self.unexpected(method, Message::Ack(other))),
        }
    }

    fn expect_flag(&self, method: MessageKind, reply: Reply) -> Result<bool, AgentError> {
        match reply {
            Reply::Flag(flag) => Ok(flag),
            other => Err(self.unexpected(method, Message::Ack(other))),
        }
    }

    fn expect_value(
        &self,
        method: MessageKind,
        reply: Reply,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        match reply {
            Reply::Value(value) => Ok(value),
            other => Err(self.unexpected(method, Message::Ack(other))),
        }
    }
}

fn publisher_rejection(err: AgentError) -> AgentError {
    match err {
        AgentError::Rejected {
            agent,
            method,
            reason,
        } => AgentError::Publisher {
            agent,
            method,
            reason,
        },
        other => other,
    }
}
