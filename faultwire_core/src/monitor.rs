use crate::protocol::{MonitorData, MonitorParams};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A `Monitor` observes the target around each trial and reports whether a fault occurred.
///
/// Monitors are hosted by an agent and driven by its orchestrator, one call per
/// lifecycle event, in registration order:
///
/// `on_test_starting` → trial → `on_test_finished` → `redo_test` → `detected_fault`
/// → (`get_monitor_data`, `on_fault`) → `stop_run`, and finally `on_shutdown`.
///
/// Every method has a no-op default so an implementation only overrides what it
/// observes. Calls must return promptly: anything long-running (debugger attach,
/// packet capture) belongs on the monitor's own thread.
pub trait Monitor: Send {
    /// Called right before a trial starts.
    fn on_test_starting(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called right after a trial finished.
    fn on_test_finished(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Whether the trial just finished produced a fault.
    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    /// Data collected for the last trial, if any. A monitor that detected a fault
    /// should include a [`BUCKET_KEY`](crate::protocol::BUCKET_KEY) entry.
    fn get_monitor_data(&mut self) -> Result<Option<MonitorData>, anyhow::Error> {
        Ok(None)
    }

    /// Called after any monitor reported a fault, to let every monitor clean up.
    fn on_fault(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Whether the current trial should be repeated.
    fn redo_test(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    /// Whether the whole run must be aborted because of an unrecoverable condition.
    fn stop_run(&mut self) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    /// Called when the agent tears the monitor down.
    fn on_shutdown(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called when a publisher is about to perform a call action. Gives the
    /// monitor a chance to launch or wait on the target itself.
    fn on_publisher_call(&mut self, _method: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
        Ok(None)
    }
}

/// Logs every lifecycle event and never reports a fault.
///
/// Useful for checking that an agent is reachable and that events arrive in order.
#[derive(Debug, Default)]
pub struct EchoMonitor {
    label: String,
    events: u64,
}

impl EchoMonitor {
    pub const CLASS_ID: &'static str = "EchoMonitor";

    pub fn from_params(params: &MonitorParams) -> Self {
        Self {
            label: params
                .get("Label")
                .cloned()
                .unwrap_or_else(|| Self::CLASS_ID.to_string()),
            events: 0,
        }
    }

    pub fn events_seen(&self) -> u64 {
        self.events
    }

    fn echo(&mut self, event: &str) {
        self.events += 1;
        info!(monitor = %self.label, event, count = self.events, "echo");
    }
}

impl Monitor for EchoMonitor {
    fn on_test_starting(&mut self) -> Result<(), anyhow::Error> {
        self.echo("on_test_starting");
        Ok(())
    }

    fn on_test_finished(&mut self) -> Result<(), anyhow::Error> {
        self.echo("on_test_finished");
        Ok(())
    }

    fn detected_fault(&mut self) -> Result<bool, anyhow::Error> {
        self.echo("detected_fault");
        Ok(false)
    }

    fn on_fault(&mut self) -> Result<(), anyhow::Error> {
        self.echo("on_fault");
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.echo("on_shutdown");
        Ok(())
    }

    fn on_publisher_call(&mut self, method: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
        self.echo(method);
        Ok(None)
    }
}

/// Removes every entry that appeared in a folder since the monitor was created.
///
/// Targets that drop temp files or recovery state into a known directory would
/// otherwise change behaviour from one trial to the next. Cleanup runs at the start
/// of each trial.
///
/// Parameters: `Folder` (required).
#[derive(Debug)]
pub struct CleanupFolder {
    folder: PathBuf,
    baseline: HashSet<std::ffi::OsString>,
}

impl CleanupFolder {
    pub const CLASS_ID: &'static str = "CleanupFolder";

    pub fn from_params(params: &MonitorParams) -> Result<Self, anyhow::Error> {
        let folder = params
            .get("Folder")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("CleanupFolder requires a parameter named 'Folder'"))?;
        let baseline = Self::listing(&folder)?;
        debug!(folder = ?folder, entries = baseline.len(), "cleanup baseline recorded");
        Ok(Self { folder, baseline })
    }

    fn listing(folder: &PathBuf) -> Result<HashSet<std::ffi::OsString>, anyhow::Error> {
        let entries = fs::read_dir(folder)
            .map_err(|e| anyhow::anyhow!("Failed to list cleanup folder {:?}: {}", folder, e))?;
        let mut names = HashSet::new();
        for entry in entries {
            names.insert(entry?.file_name());
        }
        Ok(names)
    }
}

impl Monitor for CleanupFolder {
    fn on_test_starting(&mut self) -> Result<(), anyhow::Error> {
        for name in Self::listing(&self.folder)? {
            if self.baseline.contains(&name) {
                continue;
            }
            let path = self.folder.join(&name);
            debug!(path = ?path, "removing trial leftover");
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = ?path, error = %e, "failed to remove trial leftover");
            }
        }
        Ok(())
    }
}
