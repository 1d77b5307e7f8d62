//! Spawning agents on the driver's own machine.
//!
//! When an agent URI points at the local host and nothing listens on its port yet,
//! the driver starts `<program> start-agent [--transport-timeout-ms <ms>] <port> [secret]`
//! itself. Every spawned
//! process lives in a [`ProcessRegistry`] that kills and reaps it when dropped.

use crate::transport::AgentUri;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to spawn local agent {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Local agent for port {port} exited before listening: {status}")]
    ExitedEarly { port: u16, status: String },
    #[error("Local agent did not start listening on port {port} within {waited:?}")]
    NotListening { port: u16, waited: Duration },
    #[error("Unable to locate the agent executable: {0}")]
    Executable(#[source] io::Error),
}

/// Whether `host` names this machine.
pub fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }
    hostname::get()
        .map(|own| own.to_string_lossy().eq_ignore_ascii_case(host))
        .unwrap_or(false)
}

/// Whether something accepts connections on `port` of the loopback interface.
pub fn is_listening(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// Child processes started by the driver, terminated when the registry is dropped.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    children: Vec<Child>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, child: Child) {
        debug!(pid = child.id(), "tracking child process");
        self.children.push(child);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Kills and reaps every tracked process still running.
    pub fn terminate_all(&mut self) {
        for mut child in self.children.drain(..) {
            let pid = child.id();
            match child.try_wait() {
                Ok(Some(status)) => debug!(pid, %status, "child already exited"),
                _ => {
                    if let Err(e) = child.kill() {
                        warn!(pid, error = %e, "failed to kill child");
                    }
                    match child.wait() {
                        Ok(status) => debug!(pid, %status, "child reaped"),
                        Err(e) => warn!(pid, error = %e, "failed to reap child"),
                    }
                }
            }
        }
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

pub struct LocalAgentLauncher {
    program: PathBuf,
    startup_timeout: Duration,
    transport_timeout: Option<Duration>,
    registry: ProcessRegistry,
}

impl LocalAgentLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            transport_timeout: None,
            registry: ProcessRegistry::new(),
        }
    }

    /// A launcher that re-executes the running binary.
    pub fn current_exe() -> Result<Self, LaunchError> {
        Ok(Self::new(
            std::env::current_exe().map_err(LaunchError::Executable)?,
        ))
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Per-connection deadline handed to every spawned agent.
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = Some(timeout);
        self
    }

    pub fn spawned(&self) -> usize {
        self.registry.len()
    }

    /// Starts an agent for `uri` if it is local and not already listening.
    /// Returns whether a process was spawned.
    pub fn ensure_running(
        &mut self,
        uri: &AgentUri,
        secret: Option<&str>,
    ) -> Result<bool, LaunchError> {
        if !is_local_host(uri.host()) {
            return Ok(false);
        }
        let port = uri.port();
        if is_listening(port) {
            debug!(port, "local agent already listening");
            return Ok(false);
        }

        let mut command = Command::new(&self.program);
        command
            .args(self.agent_args(port, secret))
            .stdin(Stdio::null());
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        info!(pid = child.id(), port, "spawned local agent");
        self.registry.track(child);
        self.wait_until_listening(port)?;
        Ok(true)
    }

    fn agent_args(&self, port: u16, secret: Option<&str>) -> Vec<String> {
        let mut args = vec!["start-agent".to_string()];
        if let Some(timeout) = self.transport_timeout {
            args.push("--transport-timeout-ms".to_string());
            args.push(timeout.as_millis().to_string());
        }
        args.push(port.to_string());
        args.extend(secret.map(String::from));
        args
    }

    fn wait_until_listening(&mut self, port: u16) -> Result<(), LaunchError> {
        let started = Instant::now();
        loop {
            if is_listening(port) {
                return Ok(());
            }
            if let Some(child) = self.registry.children.last_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(LaunchError::ExitedEarly {
                        port,
                        status: status.to_string(),
                    });
                }
            }
            if started.elapsed() >= self.startup_timeout {
                return Err(LaunchError::NotListening {
                    port,
                    waited: self.startup_timeout,
                });
            }
            thread::sleep(STARTUP_POLL_INTERVAL);
        }
    }
}
