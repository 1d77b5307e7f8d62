//! Shared fixtures for unit tests: a monitor driven entirely by its parameters and
//! in-process agents wired to clients without sockets.

use crate::agent::Agent;
use crate::catalog::Catalog;
use crate::client::{AgentClient, RetryPolicy};
use crate::monitor::Monitor;
use crate::protocol::{MonitorData, MonitorParams};
use crate::transport::{Transport, TransportError};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Injects transport failures into an [`InProcessTransport`].
///
/// Clones share state, so a test can keep one handle and give another to the transport.
#[derive(Debug, Clone, Default)]
pub struct FailureSwitch {
    pending: Arc<AtomicUsize>,
}

impl FailureSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail before they reach the agent.
    pub fn fail_next(&self, count: usize) {
        self.pending.store(count, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Delivers calls straight to an [`Agent`] living in the same process.
#[derive(Clone)]
pub struct InProcessTransport {
    agent: Arc<Mutex<Agent>>,
    failures: FailureSwitch,
}

impl InProcessTransport {
    pub fn new(agent: Arc<Mutex<Agent>>) -> Self {
        Self {
            agent,
            failures: FailureSwitch::new(),
        }
    }

    pub fn with_failures(mut self, failures: FailureSwitch) -> Self {
        self.failures = failures;
        self
    }
}

impl Transport for InProcessTransport {
    fn call(&mut self, method: &str, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.failures.take() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected transport failure",
            )));
        }
        let mut agent = self.agent.lock().unwrap();
        Ok(agent.handle_call(method, request)?)
    }
}

/// Every call a [`ScriptedMonitor`] receives, as `"<label>:<event>"`.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn params(pairs: &[(&str, &str)]) -> MonitorParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn count(log: &EventLog, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == entry).count()
}

/// Params: `Label`, `Fault`, `Redo`, `Stop`, `Answer`, `FailOn` (event name),
/// `Bulk` (size of a filler `bulk` entry) and any number of `Data.<key>` entries
/// returned from `get_monitor_data`.
pub struct ScriptedMonitor {
    label: String,
    params: MonitorParams,
    log: EventLog,
}

impl ScriptedMonitor {
    pub const CLASS_ID: &'static str = "Scripted";

    pub fn new(params: &MonitorParams, log: EventLog) -> Self {
        Self {
            label: params
                .get("Label")
                .cloned()
                .unwrap_or_else(|| "scripted".to_string()),
            params: params.clone(),
            log,
        }
    }

    fn record(&self, event: &str) -> Result<(), anyhow::Error> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, event));
        if self.params.get("FailOn").map(String::as_str) == Some(event) {
            anyhow::bail!("{} refused {}", self.label, event);
        }
        Ok(())
    }

    fn flag(&self, key: &str) -> bool {
        self.params.get(key).map(String::as_str) == Some("true")
    }
}

impl Monitor for ScriptedMonitor {
    fn on_test_starting(&mut self) -> Result<(), anyhow::Error> {
        self.record("on_test_starting")
    }

    fn on_test_finished(&mut self) -> Result<(), anyhow::Error> {
        self.record("on_test_finished")
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        self.record("detected_fault")?;
        Ok(self.flag("Fault"))
    }

    fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        self.record("get_monitor_data")?;
        let mut data: MonitorData = self
            .params
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("Data.")
                    .map(|key| (key.to_string(), v.clone().into_bytes()))
            })
            .collect();
        if let Some(size) = self.params.get("Bulk") {
            data.insert("bulk".to_string(), vec![b'A'; size.parse::<usize>()?]);
        }
        Ok(if data.is_empty() { None } else { Some(data) })
    }

    fn on_fault(&mut self) -> Result<(), anyhow::Error> {
        self.record("on_fault")
    }

    fn redo_test(&mut self) -> Result<bool, anyhow::Error> {
        self.record("redo_test")?;
        Ok(self.flag("Redo"))
    }

    fn stop_run(&mut self) -> Result<bool, anyhow::Error> {
        self.record("stop_run")?;
        Ok(self.flag("Stop"))
    }

    fn on_shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.record("on_shutdown")
    }

    fn on_publisher_call(&mut self, _method: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
        self.record("on_publisher_call")?;
        Ok(self.params.get("Answer").map(|a| a.clone().into_bytes()))
    }
}

/// Builtins plus the `Scripted` class, all scripted instances sharing `log`.
pub fn scripted_catalog(log: &EventLog) -> Catalog {
    let mut catalog = Catalog::with_builtins();
    let log = Arc::clone(log);
    catalog.register_monitor(ScriptedMonitor::CLASS_ID, move |params, _env| {
        Ok(Box::new(ScriptedMonitor::new(params, Arc::clone(&log))))
    });
    catalog
}

pub fn shared_agent(log: &EventLog, secret: Option<&str>) -> Arc<Mutex<Agent>> {
    Arc::new(Mutex::new(
        Agent::new(scripted_catalog(log)).with_secret(secret.map(String::from)),
    ))
}

/// A client talking to `agent` in-process, with no backoff between handshake attempts.
pub fn in_process_client(name: &str, agent: &Arc<Mutex<Agent>>) -> (AgentClient, FailureSwitch) {
    let failures = FailureSwitch::new();
    let transport = InProcessTransport::new(Arc::clone(agent)).with_failures(failures.clone());
    let client = AgentClient::new(name, format!("inproc://{name}"), Box::new(transport))
        .with_retry(RetryPolicy::immediate(3));
    (client, failures)
}

#[test]
fn failure_switch_counts_down() {
    let switch = FailureSwitch::new();
    switch.fail_next(2);
    assert!(switch.take());
    assert!(switch.clone().take(), "Clones share the same counter");
    assert!(!switch.take());
}
