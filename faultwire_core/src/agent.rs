//! The agent: the process-side end of the protocol.
//!
//! An [`Agent`] owns at most one session, the live monitor and publisher registries
//! and the class catalog used to populate them. It handles one envelope at a time
//! and always answers with an envelope; failures travel back as `Nack`.

use crate::catalog::Catalog;
use crate::orchestrator::{MonitorCallError, Orchestrator};
use crate::protocol::{
    ClientHello, Envelope, MAX_MESSAGE_LEN, Message, MonitorSpec, NackReason, ProtocolError,
    PublisherSpec, Reply, SessionEnvironment, SessionId,
};
use crate::publisher::Publisher;
use crate::registry::{MonitorRegistry, PublisherRegistry};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub client_name: String,
    /// Whether a shared secret was checked when the session was opened.
    pub authenticated: bool,
    pub environment: SessionEnvironment,
}

pub struct Agent {
    secret: Option<String>,
    catalog: Catalog,
    session: Option<Session>,
    monitors: MonitorRegistry,
    publishers: PublisherRegistry,
}

impl Agent {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            secret: None,
            catalog,
            session: None,
            monitors: MonitorRegistry::new(),
            publishers: PublisherRegistry::new(),
        }
    }

    /// Requires clients to present exactly this secret. `None` disables authentication.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    /// Entry point for a transport: `request` is an encoded envelope sent to `method`.
    ///
    /// Malformed requests, and replies too large to send, are answered with
    /// `Nack(Protocol)`; the only error returned is a failure to encode the reply.
    pub fn handle_call(&mut self, method: &str, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let reply = match Envelope::decode(request) {
            Ok(envelope) if envelope.kind().method_name() != method => {
                warn!(method, kind = %envelope.kind(), "method does not match message kind");
                nack(
                    None,
                    NackReason::Protocol(format!(
                        "method '{method}' does not match message kind '{}'",
                        envelope.kind()
                    )),
                )
            }
            Ok(envelope) => self.handle(envelope),
            Err(e) => {
                warn!(method, error = %e, "rejecting undecodable request");
                nack(None, NackReason::Protocol(e.to_string()))
            }
        };
        let encoded = reply.encode()?;
        if encoded.len() > MAX_MESSAGE_LEN {
            warn!(method, len = encoded.len(), "reply too large for the wire; answering Nack");
            let reason = format!(
                "reply of {} bytes exceeds the {MAX_MESSAGE_LEN}-byte message limit",
                encoded.len()
            );
            return nack(reply.session_id, NackReason::Protocol(reason)).encode();
        }
        Ok(encoded)
    }

    pub fn handle(&mut self, envelope: Envelope) -> Envelope {
        let kind = envelope.kind();
        if kind.is_reply() {
            return nack(
                None,
                NackReason::Protocol(format!("'{kind}' is a reply, not a request")),
            );
        }
        if let Message::ClientHello(hello) = envelope.message {
            return self.handshake(hello);
        }

        let session_id = match &self.session {
            Some(session) if envelope.session_id.as_deref() == Some(session.id.as_str()) => {
                session.id.clone()
            }
            Some(session) => {
                warn!(
                    method = %kind,
                    session = %session.id,
                    presented = ?envelope.session_id,
                    "rejecting request for a foreign session"
                );
                return nack(None, NackReason::SessionMismatch);
            }
            None => {
                debug!(method = %kind, "rejecting request before handshake");
                return nack(None, NackReason::SessionMismatch);
            }
        };

        debug!(session = %session_id, method = %kind, "dispatching");
        let message = match self.dispatch(envelope.message) {
            Ok(reply) => Message::Ack(reply),
            Err(reason) => {
                warn!(session = %session_id, method = %kind, %reason, "request failed");
                Message::Nack(reason)
            }
        };
        Envelope::new(Some(session_id), message)
    }

    /// Tears down every monitor and publisher and forgets the session.
    pub fn shutdown(&mut self) {
        Orchestrator::new(&mut self.monitors).on_shutdown();
        self.publishers.clear();
        self.session = None;
    }

    fn handshake(&mut self, hello: ClientHello) -> Envelope {
        if hello.secret != self.secret {
            warn!(client = %hello.client_name, "handshake rejected: secret mismatch");
            return nack(None, NackReason::AuthenticationFailed);
        }
        if let Some(previous) = self.session.take() {
            info!(
                session = %previous.id,
                client = %previous.client_name,
                monitors = self.monitors.len(),
                "new handshake supersedes the active session"
            );
            self.shutdown();
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            client_name: hello.client_name,
            authenticated: self.secret.is_some(),
            environment: hello.environment,
        };
        info!(session = %session.id, client = %session.client_name, "session established");
        let id = session.id.clone();
        self.session = Some(session);
        Envelope::new(Some(id), Message::AgentHello)
    }

    fn dispatch(&mut self, message: Message) -> Result<Reply, NackReason> {
        match message {
            Message::OnTestStarting => {
                self.orchestrator().on_test_starting().map_err(monitor_failure)?;
                Ok(Reply::Done)
            }
            Message::OnTestFinished => {
                self.orchestrator().on_test_finished().map_err(monitor_failure)?;
                Ok(Reply::Done)
            }
            Message::DetectFault => Ok(Reply::Flag(
                self.orchestrator().detected_fault().map_err(monitor_failure)?,
            )),
            Message::GetMonitorData => Ok(Reply::MonitorData(
                self.orchestrator().get_monitor_data().map_err(monitor_failure)?,
            )),
            Message::RedoTest => Ok(Reply::Flag(
                self.orchestrator().redo_test().map_err(monitor_failure)?,
            )),
            Message::OnFault => {
                self.orchestrator().on_fault().map_err(monitor_failure)?;
                Ok(Reply::Done)
            }
            Message::StopRun => Ok(Reply::Flag(
                self.orchestrator().stop_run().map_err(monitor_failure)?,
            )),
            Message::OnShutdown => {
                self.orchestrator().on_shutdown();
                Ok(Reply::Done)
            }
            Message::OnPublisherCall { method } => Ok(Reply::Value(
                self.orchestrator()
                    .on_publisher_call(&method)
                    .map_err(monitor_failure)?,
            )),
            Message::StartMonitor(spec) => {
                self.start_monitor(spec)?;
                Ok(Reply::Done)
            }
            Message::StopMonitor { name } => {
                if !self.monitors.remove(&name) {
                    debug!(monitor = %name, "stop requested for unknown monitor");
                }
                Ok(Reply::Done)
            }
            Message::ClientDisconnect => {
                info!("client disconnected");
                self.shutdown();
                Ok(Reply::Done)
            }
            Message::PublisherInitialize(spec) => {
                self.initialize_publisher(spec)?;
                Ok(Reply::Done)
            }
            Message::PublisherStart { name } => {
                self.publisher(&name)?.start().map_err(publisher_failure)?;
                Ok(Reply::Done)
            }
            Message::PublisherStop { name } => {
                self.publisher(&name)?.stop().map_err(publisher_failure)?;
                Ok(Reply::Done)
            }
            Message::PublisherAccept { name } => {
                self.publisher(&name)?.accept().map_err(publisher_failure)?;
                Ok(Reply::Done)
            }
            Message::PublisherConnect { name } => {
                self.publisher(&name)?.connect().map_err(publisher_failure)?;
                Ok(Reply::Done)
            }
            Message::PublisherClose { name } => {
                self.publisher(&name)?.close().map_err(publisher_failure)?;
                Ok(Reply::Done)
            }
            Message::PublisherCall { name, method, args } => Ok(Reply::Value(
                self.publisher(&name)?
                    .call(&method, &args)
                    .map_err(publisher_failure)?,
            )),
            Message::PublisherProperty {
                name,
                property,
                value,
            } => Ok(Reply::Value(
                self.publisher(&name)?
                    .property(&property, value.as_deref())
                    .map_err(publisher_failure)?,
            )),
            Message::PublisherSend { name, data } => {
                self.publisher(&name)?.send(&data).map_err(publisher_failure)?;
                Ok(Reply::Done)
            }
            Message::PublisherReceive { name, size } => {
                let size = size.map(|n| usize::try_from(n).unwrap_or(usize::MAX));
                let data = self
                    .publisher(&name)?
                    .receive(size)
                    .map_err(publisher_failure)?;
                Ok(Reply::Value(Some(data)))
            }
            other @ (Message::ClientHello(_)
            | Message::AgentHello
            | Message::Ack(_)
            | Message::Nack(_)) => Err(NackReason::Protocol(format!(
                "'{}' cannot be dispatched",
                other.kind()
            ))),
        }
    }

    fn orchestrator(&mut self) -> Orchestrator<'_> {
        Orchestrator::new(&mut self.monitors)
    }

    fn environment(&self) -> SessionEnvironment {
        self.session
            .as_ref()
            .map(|s| s.environment.clone())
            .unwrap_or_default()
    }

    fn start_monitor(&mut self, spec: MonitorSpec) -> Result<(), NackReason> {
        let environment = self.environment();
        let instance = self
            .catalog
            .build_monitor(&spec.class_id, &spec.params, &environment)
            .map_err(|e| {
                warn!(
                    monitor = %spec.name,
                    class = %spec.class_id,
                    error = %e,
                    "monitor construction failed"
                );
                NackReason::MonitorConstruction(e.to_string())
            })?;
        info!(monitor = %spec.name, class = %spec.class_id, "monitor started");
        self.monitors.insert(spec, instance);
        Ok(())
    }

    fn initialize_publisher(&mut self, spec: PublisherSpec) -> Result<(), NackReason> {
        let environment = self.environment();
        let instance = self
            .catalog
            .build_publisher(&spec.class_id, &spec.args, &environment)
            .map_err(|e| NackReason::PublisherConstruction(e.to_string()))?;
        info!(publisher = %spec.name, class = %spec.class_id, "publisher initialized");
        self.publishers.insert(spec, instance);
        Ok(())
    }

    fn publisher(&mut self, name: &str) -> Result<&mut dyn Publisher, NackReason> {
        self.publishers
            .get_mut(name)
            .ok_or_else(|| NackReason::UnknownPublisher(name.to_string()))
    }
}

fn nack(session_id: Option<SessionId>, reason: NackReason) -> Envelope {
    Envelope::new(session_id, Message::Nack(reason))
}

fn monitor_failure(err: MonitorCallError) -> NackReason {
    NackReason::MonitorFailure(err.to_string())
}

fn publisher_failure(err: anyhow::Error) -> NackReason {
    NackReason::PublisherFailure(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, MonitorParams};
    use crate::testing::{EventLog, count, params, scripted_catalog};
    use pretty_assertions::assert_eq;

    fn hello(secret: Option<&str>) -> Message {
        Message::ClientHello(ClientHello {
            client_name: "driver".to_string(),
            secret: secret.map(String::from),
            environment: SessionEnvironment::default(),
        })
    }

    fn open_session(agent: &mut Agent, secret: Option<&str>) -> SessionId {
        let reply = agent.handle(Envelope::new(None, hello(secret)));
        assert_eq!(reply.message, Message::AgentHello);
        reply.session_id.expect("handshake must return a session id")
    }

    fn call(agent: &mut Agent, session: &SessionId, message: Message) -> Message {
        agent
            .handle(Envelope::new(Some(session.clone()), message))
            .message
    }

    fn start(agent: &mut Agent, session: &SessionId, name: &str, pairs: &[(&str, &str)]) {
        let mut p = params(pairs);
        p.insert("Label".to_string(), name.to_string());
        let reply = call(
            agent,
            session,
            Message::StartMonitor(MonitorSpec::new(name, "Scripted", p)),
        );
        assert_eq!(reply, Message::ack(), "starting {name}");
    }

    #[test]
    fn calls_before_handshake_are_refused() {
        let mut agent = Agent::new(Catalog::with_builtins());
        for message in [
            Message::OnTestStarting,
            Message::DetectFault,
            Message::GetMonitorData,
            Message::StopMonitor {
                name: "m1".to_string(),
            },
            Message::StartMonitor(MonitorSpec::new("m1", "EchoMonitor", MonitorParams::new())),
            Message::OnShutdown,
            Message::PublisherInitialize(PublisherSpec::new("net", "Loopback", Vec::new())),
            Message::PublisherStart {
                name: "net".to_string(),
            },
            Message::PublisherStop {
                name: "net".to_string(),
            },
            Message::PublisherAccept {
                name: "net".to_string(),
            },
            Message::PublisherConnect {
                name: "net".to_string(),
            },
            Message::PublisherClose {
                name: "net".to_string(),
            },
            Message::PublisherCall {
                name: "net".to_string(),
                method: "echo".to_string(),
                args: Vec::new(),
            },
            Message::PublisherProperty {
                name: "net".to_string(),
                property: "mode".to_string(),
                value: None,
            },
            Message::PublisherSend {
                name: "net".to_string(),
                data: b"x".to_vec(),
            },
            Message::PublisherReceive {
                name: "net".to_string(),
                size: None,
            },
        ] {
            let reply = agent.handle(Envelope::new(None, message.clone()));
            assert_eq!(
                reply.message,
                Message::Nack(NackReason::SessionMismatch),
                "{:?} before handshake",
                message.kind()
            );
        }
        assert!(agent.session().is_none());
        assert!(agent.monitors().is_empty());
        assert!(agent.publishers().is_empty());
    }

    #[test]
    fn handshake_scenario_with_secret() {
        let mut agent =
            Agent::new(Catalog::with_builtins()).with_secret(Some("s3cret".to_string()));

        let rejected = agent.handle(Envelope::new(None, hello(Some("wrong"))));
        assert_eq!(rejected.message, Message::Nack(NackReason::AuthenticationFailed));
        assert!(agent.session().is_none(), "No session after a bad secret");

        let missing = agent.handle(Envelope::new(None, hello(None)));
        assert_eq!(missing.message, Message::Nack(NackReason::AuthenticationFailed));

        let session = open_session(&mut agent, Some("s3cret"));
        assert!(!session.is_empty());
        assert!(agent.session().unwrap().authenticated);

        let started = call(
            &mut agent,
            &session,
            Message::StartMonitor(MonitorSpec::new("m1", "EchoMonitor", MonitorParams::new())),
        );
        assert_eq!(started, Message::ack());
        let stopped = call(
            &mut agent,
            &session,
            Message::StopMonitor {
                name: "m1".to_string(),
            },
        );
        assert_eq!(stopped, Message::ack());
        let data = call(&mut agent, &session, Message::GetMonitorData);
        assert_eq!(data, Message::Ack(Reply::MonitorData(Vec::new())));
    }

    #[test]
    fn new_handshake_shuts_down_every_monitor_exactly_once() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let first = open_session(&mut agent, None);
        start(&mut agent, &first, "a", &[]);
        start(&mut agent, &first, "b", &[("FailOn", "on_shutdown")]);

        let second = open_session(&mut agent, None);

        assert_ne!(first, second);
        assert!(agent.monitors().is_empty(), "Stale monitors must not survive");
        assert_eq!(count(&log, "a:on_shutdown"), 1);
        assert_eq!(count(&log, "b:on_shutdown"), 1);

        let stale = agent.handle(Envelope::new(Some(first), Message::DetectFault));
        assert_eq!(stale.message, Message::Nack(NackReason::SessionMismatch));
    }

    #[test]
    fn detect_fault_queries_every_monitor() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let session = open_session(&mut agent, None);
        start(&mut agent, &session, "m1", &[]);
        start(&mut agent, &session, "m2", &[("Fault", "true")]);
        start(&mut agent, &session, "m3", &[]);

        let reply = call(&mut agent, &session, Message::DetectFault);
        assert_eq!(reply, Message::Ack(Reply::Flag(true)));
        for name in ["m1", "m2", "m3"] {
            assert_eq!(count(&log, &format!("{name}:detected_fault")), 1);
        }
    }

    #[test]
    fn stop_monitor_is_idempotent() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let session = open_session(&mut agent, None);
        start(&mut agent, &session, "keep", &[]);
        start(&mut agent, &session, "drop", &[]);

        for name in ["drop", "drop", "never-existed"] {
            let reply = call(
                &mut agent,
                &session,
                Message::StopMonitor {
                    name: name.to_string(),
                },
            );
            assert_eq!(reply, Message::ack());
        }
        assert_eq!(agent.monitors().names(), vec!["keep"]);
        assert_eq!(count(&log, "drop:on_shutdown"), 1);
    }

    #[test]
    fn unknown_monitor_class_is_nacked_and_registry_unchanged() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let session = open_session(&mut agent, None);
        start(&mut agent, &session, "m1", &[]);

        let reply = call(
            &mut agent,
            &session,
            Message::StartMonitor(MonitorSpec::new("m2", "__import__('os')", MonitorParams::new())),
        );
        assert!(
            matches!(
                reply,
                Message::Nack(NackReason::MonitorConstruction(ref reason))
                    if reason.contains("Unknown monitor class")
            ),
            "Unexpected reply {reply:?}"
        );
        assert_eq!(agent.monitors().names(), vec!["m1"]);
    }

    #[test]
    fn monitor_failure_is_nacked_with_the_monitor_name() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let session = open_session(&mut agent, None);
        start(&mut agent, &session, "flaky", &[("FailOn", "on_test_starting")]);

        match call(&mut agent, &session, Message::OnTestStarting) {
            Message::Nack(NackReason::MonitorFailure(reason)) => assert!(reason.contains("flaky")),
            other => panic!("Expected MonitorFailure, got {other:?}"),
        }
    }

    #[test]
    fn publisher_operations_are_proxied() {
        let mut agent = Agent::new(Catalog::with_builtins());
        let session = open_session(&mut agent, None);

        let init = call(
            &mut agent,
            &session,
            Message::PublisherInitialize(PublisherSpec::new("net", "Loopback", Vec::new())),
        );
        assert_eq!(init, Message::ack());
        let send = call(
            &mut agent,
            &session,
            Message::PublisherSend {
                name: "net".to_string(),
                data: b"fuzz".to_vec(),
            },
        );
        assert_eq!(send, Message::ack());
        let received = call(
            &mut agent,
            &session,
            Message::PublisherReceive {
                name: "net".to_string(),
                size: Some(2),
            },
        );
        assert_eq!(received, Message::Ack(Reply::Value(Some(b"fu".to_vec()))));

        let missing = call(
            &mut agent,
            &session,
            Message::PublisherStart {
                name: "nope".to_string(),
            },
        );
        assert_eq!(
            missing,
            Message::Nack(NackReason::UnknownPublisher("nope".to_string()))
        );

        let unknown_class = call(
            &mut agent,
            &session,
            Message::PublisherInitialize(PublisherSpec::new("x", "Nope", Vec::new())),
        );
        assert!(matches!(
            unknown_class,
            Message::Nack(NackReason::PublisherConstruction(_))
        ));
    }

    #[test]
    fn disconnect_forgets_the_session() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let session = open_session(&mut agent, None);
        start(&mut agent, &session, "m1", &[]);

        assert_eq!(
            call(&mut agent, &session, Message::ClientDisconnect),
            Message::ack()
        );
        assert!(agent.session().is_none());
        assert_eq!(count(&log, "m1:on_shutdown"), 1);
        assert_eq!(
            call(&mut agent, &session, Message::OnTestStarting),
            Message::Nack(NackReason::SessionMismatch)
        );
    }

    #[test]
    fn handle_call_rejects_mismatched_method_and_garbage() {
        let mut agent = Agent::new(Catalog::with_builtins());
        let request = Envelope::new(None, hello(None)).encode().unwrap();

        let reply = Envelope::decode(&agent.handle_call("detectFault", &request).unwrap()).unwrap();
        assert!(matches!(reply.message, Message::Nack(NackReason::Protocol(_))));
        assert!(agent.session().is_none());

        let garbage = agent.handle_call("clientHello", b"\xff\xff").unwrap();
        let reply = Envelope::decode(&garbage).unwrap();
        assert!(matches!(reply.message, Message::Nack(NackReason::Protocol(_))));

        let reply = Envelope::decode(&agent.handle_call("clientHello", &request).unwrap()).unwrap();
        assert_eq!(reply.kind(), MessageKind::AgentHello);
    }

    #[test]
    fn replies_are_not_accepted_as_requests() {
        let mut agent = Agent::new(Catalog::with_builtins());
        let session = open_session(&mut agent, None);
        let reply = call(&mut agent, &session, Message::ack());
        assert!(matches!(reply, Message::Nack(NackReason::Protocol(_))));
    }

    #[test]
    fn oversized_monitor_data_is_answered_with_a_nack() {
        let log = EventLog::default();
        let mut agent = Agent::new(scripted_catalog(&log));
        let session = open_session(&mut agent, None);
        start(&mut agent, &session, "big", &[("Bulk", MAX_MESSAGE_LEN.to_string().as_str())]);
        let request = Envelope::new(Some(session.clone()), Message::GetMonitorData)
            .encode()
            .unwrap();

        let bytes = agent.handle_call("getMonitorData", &request).unwrap();

        assert!(bytes.len() <= MAX_MESSAGE_LEN);
        let reply = Envelope::decode(&bytes).unwrap();
        assert_eq!(reply.session_id, Some(session.clone()));
        match reply.message {
            Message::Nack(NackReason::Protocol(reason)) => {
                assert!(reason.contains("exceeds"), "{reason}")
            }
            other => panic!("Expected Nack(Protocol), got {other:?}"),
        }
        assert_eq!(agent.session().map(|s| &s.id), Some(&session), "session survives");
    }

    #[test]
    fn publishers_are_registered_by_name() {
        let mut agent = Agent::new(Catalog::with_builtins());
        let session = open_session(&mut agent, None);
        for name in ["b", "a"] {
            let spec = PublisherSpec::new(name, "Loopback", Vec::new());
            let reply = call(&mut agent, &session, Message::PublisherInitialize(spec));
            assert_eq!(reply, Message::ack());
        }

        assert_eq!(agent.publishers().names(), vec!["b", "a"]);
        assert_eq!(agent.publishers().len(), 2);
    }
}
