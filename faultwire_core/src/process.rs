use crate::monitor::Monitor;
use crate::protocol::{BUCKET_KEY, MonitorData, MonitorParams, SessionEnvironment};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Kept below the default transport timeout so a waiting agent still answers.
pub const DEFAULT_WAIT_FOR_EXIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Settings for the [`ProcessMonitor`], parsed from monitor parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMonitorConfig {
    pub command: Vec<String>,
    pub restart_on_each_test: bool,
    pub fault_on_early_exit: bool,
    /// Publisher call method that (re)starts the target instead of `on_test_starting`.
    pub start_on_call: Option<String>,
    /// Publisher call method that blocks until the target exits.
    pub wait_for_exit_on_call: Option<String>,
    /// Longest a `wait_for_exit_on_call` call blocks.
    pub wait_for_exit_timeout: Duration,
}

impl ProcessMonitorConfig {
    pub fn from_params(
        params: &MonitorParams,
        environment: &SessionEnvironment,
    ) -> Result<Self, anyhow::Error> {
        let command_line = params.get("Command").ok_or_else(|| {
            anyhow::anyhow!("Process monitor requires a parameter named 'Command'")
        })?;
        let mut command: Vec<String> = command_line.split_whitespace().map(String::from).collect();
        if command.is_empty() {
            anyhow::bail!("Process monitor 'Command' parameter is empty");
        }
        command[0] = resolve_program(&command[0], &environment.search_paths);
        let wait_for_exit_timeout = match params.get("WaitForExitTimeout") {
            Some(ms) => Duration::from_millis(ms.trim().parse().map_err(|e| {
                anyhow::anyhow!("Process monitor 'WaitForExitTimeout' is not milliseconds: {e}")
            })?),
            None => DEFAULT_WAIT_FOR_EXIT_TIMEOUT,
        };

        Ok(Self {
            command,
            restart_on_each_test: flag(params, "RestartOnEachTest", false),
            fault_on_early_exit: flag(params, "FaultOnEarlyExit", true),
            start_on_call: params.get("StartOnCall").map(|m| m.to_lowercase()),
            wait_for_exit_on_call: params.get("WaitForExitOnCall").map(|m| m.to_lowercase()),
            wait_for_exit_timeout,
        })
    }
}

fn flag(params: &MonitorParams, key: &str, default: bool) -> bool {
    params
        .get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Resolves a bare program name against the session's search paths.
fn resolve_program(program: &str, search_paths: &[String]) -> String {
    if Path::new(program).components().count() > 1 {
        return program.to_string();
    }
    search_paths
        .iter()
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
        .map(|found| found.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// Describes how a process ended, e.g. `"Exited with code 3"`.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Terminated by signal {signal}");
        }
    }
    "Exited abnormally".to_string()
}

/// Starts, stops and watches the target process; reports a fault when it exits
/// while a trial is running.
///
/// Parameters: `Command` (required), `RestartOnEachTest`, `FaultOnEarlyExit`
/// (default `true`), `StartOnCall`, `WaitForExitOnCall` and `WaitForExitTimeout`
/// (milliseconds).
#[derive(Debug)]
pub struct ProcessMonitor {
    config: ProcessMonitorConfig,
    child: Option<Child>,
    early_exit: Option<String>,
    exit_awaited: bool,
}

impl ProcessMonitor {
    pub const CLASS_ID: &'static str = "Process";

    pub fn new(config: ProcessMonitorConfig) -> Self {
        Self {
            config,
            child: None,
            early_exit: None,
            exit_awaited: false,
        }
    }

    pub fn from_params(
        params: &MonitorParams,
        environment: &SessionEnvironment,
    ) -> Result<Self, anyhow::Error> {
        Ok(Self::new(ProcessMonitorConfig::from_params(params, environment)?))
    }

    fn start_process(&mut self) -> Result<(), anyhow::Error> {
        self.stop_process();
        let mut cmd = Command::new(&self.config.command[0]);
        if self.config.command.len() > 1 {
            cmd.args(&self.config.command[1..]);
        }
        cmd.stdin(Stdio::null());
        let child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn command '{:?}': {}", self.config.command, e)
        })?;
        info!(pid = child.id(), command = ?self.config.command, "target started");
        self.child = Some(child);
        Ok(())
    }

    fn stop_process(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(pid = child.id(), "stopping target");
                if let Err(e) = child.kill() {
                    warn!(pid = child.id(), error = %e, "failed to kill target");
                }
                let _ = child.wait();
            }
            Err(e) => warn!(pid = child.id(), error = %e, "error polling target"),
        }
    }

    /// `None` while the target runs; the exit description once it has stopped.
    fn exit_state(&mut self) -> Option<String> {
        let Some(child) = self.child.as_mut() else {
            return Some("Process is not running".to_string());
        };
        match child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(describe_exit(&status)),
            Err(e) => Some(format!("Error waiting for child: {e}")),
        }
    }

    /// Polls until the target exits or the configured timeout passes.
    /// Returns whether the target exited.
    fn wait_for_exit(&mut self) -> bool {
        let deadline = Instant::now() + self.config.wait_for_exit_timeout;
        while self.exit_state().is_none() {
            if Instant::now() >= deadline {
                warn!(
                    timeout = ?self.config.wait_for_exit_timeout,
                    "target still running; giving up waiting"
                );
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
        true
    }
}

impl Monitor for ProcessMonitor {
    fn on_test_starting(&mut self) -> Result<(), anyhow::Error> {
        self.early_exit = None;
        self.exit_awaited = false;
        if self.config.start_on_call.is_some() {
            self.stop_process();
        } else if self.config.restart_on_each_test || self.exit_state().is_some() {
            self.start_process()?;
        }
        Ok(())
    }

    fn on_test_finished(&mut self) -> Result<(), anyhow::Error> {
        // an on-demand target that was never launched, or one whose exit was
        // explicitly awaited, did not stop early
        let never_launched = self.config.start_on_call.is_some() && self.child.is_none();
        self.early_exit = if never_launched || self.exit_awaited {
            None
        } else {
            self.exit_state()
        };
        if self.config.restart_on_each_test || self.config.start_on_call.is_some() {
            self.stop_process();
        }
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        Ok(self.config.fault_on_early_exit && self.early_exit.is_some())
    }

    fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        let Some(description) = &self.early_exit else {
            return Ok(None);
        };
        let mut data = MonitorData::new();
        data.insert(
            "Process.txt".to_string(),
            format!("Process exited early: {description}").into_bytes(),
        );
        let digest = md5::compute(description.as_bytes());
        data.insert(
            BUCKET_KEY.to_string(),
            format!("EarlyExit_{:x}", digest).into_bytes(),
        );
        Ok(Some(data))
    }

    fn on_fault(&mut self) -> Result<(), anyhow::Error> {
        self.stop_process();
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.stop_process();
        Ok(())
    }

    fn on_publisher_call(&mut self, method: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
        let method = method.to_lowercase();
        if self.config.start_on_call.as_deref() == Some(method.as_str()) {
            debug!(method, "start on call");
            self.start_process()?;
        } else if self.config.wait_for_exit_on_call.as_deref() == Some(method.as_str()) {
            debug!(method, "waiting for target exit");
            self.exit_awaited = self.wait_for_exit();
        }
        Ok(None)
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop_process();
    }
}
