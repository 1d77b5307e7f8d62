pub mod agent;
pub mod catalog;
pub mod client;
pub mod config;
pub mod engine;
pub mod fault;
pub mod launcher;
pub mod monitor;
pub mod orchestrator;
pub mod plexer;
pub mod process;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testing;

pub use agent::{Agent, Session};
pub use catalog::{Catalog, CatalogError};
pub use client::{AgentClient, AgentError, RetryPolicy};
pub use config::{AgentConfig, DriverConfig, MonitorConfig, PublisherConfig, RunSettings};
pub use engine::{EngineError, RunSummary, Trial, TrialOutcome, TrialRunner};
pub use fault::FaultRecord;
pub use launcher::{LaunchError, LocalAgentLauncher, ProcessRegistry};
pub use monitor::{CleanupFolder, EchoMonitor, Monitor};
pub use orchestrator::{MonitorCallError, Orchestrator};
pub use plexer::AgentPlexer;
pub use process::{ProcessMonitor, ProcessMonitorConfig};
pub use protocol::{Envelope, Message, MessageKind, NackReason, ProtocolError, Reply};
pub use publisher::{FilePublisher, LoopbackPublisher, Publisher};
pub use server::{AgentServer, ShutdownHandle};
pub use transport::{AgentUri, TcpTransport, Transport, TransportError};
