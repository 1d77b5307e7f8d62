use crate::agent::Agent;
use crate::transport::{
    DEFAULT_TRANSPORT_TIMEOUT, RpcCall, TransportError, read_frame, write_frame,
};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stops a running [`AgentServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // wake the accept loop
        if let Err(e) = TcpStream::connect(self.addr) {
            debug!(addr = %self.addr, error = %e, "shutdown wake-up connect failed");
        }
    }
}

/// Serves one agent over TCP: one connection carries one request frame and one
/// reply frame, handled strictly one after another.
pub struct AgentServer {
    listener: TcpListener,
    agent: Agent,
    requested: Arc<AtomicBool>,
    timeout: Duration,
}

impl AgentServer {
    pub fn bind<A: ToSocketAddrs>(addr: A, agent: Agent) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            agent,
            requested: Arc::new(AtomicBool::new(false)),
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
        })
    }

    /// Read and write deadline for each connection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        Ok(ShutdownHandle {
            requested: Arc::clone(&self.requested),
            addr,
        })
    }

    /// Blocks until a shutdown is requested, then tears the agent down.
    pub fn serve(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "agent listening");
        for stream in self.listener.incoming() {
            if self.requested.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let peer = stream.peer_addr().ok();
                    if let Err(e) = handle_connection(&mut self.agent, stream, self.timeout) {
                        warn!(peer = ?peer, error = %e, "dropping connection");
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        info!("agent shutting down");
        self.agent.shutdown();
        Ok(())
    }
}

fn handle_connection(
    agent: &mut Agent,
    mut stream: TcpStream,
    timeout: Duration,
) -> Result<(), TransportError> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let call = RpcCall::decode(&read_frame(&mut stream)?)?;
    debug!(method = %call.method, bytes = call.blob.len(), "request");
    let reply = agent.handle_call(&call.method, &call.blob)?;
    write_frame(&mut stream, &reply)
}
