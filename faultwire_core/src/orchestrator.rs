use crate::monitor::Monitor;
use crate::protocol::MonitorData;
use crate::registry::MonitorRegistry;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
#[error("Monitor '{monitor}' failed in {event}: {source:#}")]
pub struct MonitorCallError {
    pub monitor: String,
    pub event: &'static str,
    #[source]
    pub source: anyhow::Error,
}

/// Sequences one lifecycle event across every live monitor, in registration order.
///
/// Setup events (`on_test_starting`, `on_test_finished`) stop at the first failing
/// monitor. Queries and cleanup visit every monitor even after a positive answer or
/// a failure, and report the first failure once all monitors were asked.
pub struct Orchestrator<'a> {
    monitors: &'a mut MonitorRegistry,
}

impl<'a> Orchestrator<'a> {
    pub fn new(monitors: &'a mut MonitorRegistry) -> Self {
        Self { monitors }
    }

    pub fn on_test_starting(&mut self) -> Result<(), MonitorCallError> {
        self.each_until_error("on_test_starting", |m| m.on_test_starting())
    }

    pub fn on_test_finished(&mut self) -> Result<(), MonitorCallError> {
        self.each_until_error("on_test_finished", |m| m.on_test_finished())
    }

    pub fn detected_fault(&mut self) -> Result<bool, MonitorCallError> {
        let (answers, error) = self.visit_all("detected_fault", |m| m.detected_fault());
        finish(answers.into_iter().any(|fault| fault), error)
    }

    pub fn get_monitor_data(&mut self) -> Result<Vec<MonitorData>, MonitorCallError> {
        let (answers, error) = self.visit_all("get_monitor_data", |m| m.get_monitor_data());
        finish(answers.into_iter().flatten().collect(), error)
    }

    pub fn on_fault(&mut self) -> Result<(), MonitorCallError> {
        let (_, error) = self.visit_all("on_fault", |m| m.on_fault());
        finish((), error)
    }

    pub fn redo_test(&mut self) -> Result<bool, MonitorCallError> {
        let (answers, error) = self.visit_all("redo_test", |m| m.redo_test());
        finish(answers.into_iter().any(|redo| redo), error)
    }

    pub fn stop_run(&mut self) -> Result<bool, MonitorCallError> {
        let (answers, error) = self.visit_all("stop_run", |m| m.stop_run());
        finish(answers.into_iter().any(|stop| stop), error)
    }

    /// Last non-null answer wins.
    pub fn on_publisher_call(&mut self, method: &str) -> Result<Option<Vec<u8>>, MonitorCallError> {
        let (answers, error) =
            self.visit_all("on_publisher_call", |m| m.on_publisher_call(method));
        finish(answers.into_iter().flatten().last(), error)
    }

    /// Shuts every monitor down and empties the registry. Never fails.
    pub fn on_shutdown(&mut self) {
        debug!(monitors = self.monitors.len(), "shutting down monitors");
        self.monitors.shutdown_all();
    }

    fn each_until_error<F>(
        &mut self,
        event: &'static str,
        mut call: F,
    ) -> Result<(), MonitorCallError>
    where
        F: FnMut(&mut dyn Monitor) -> Result<(), anyhow::Error>,
    {
        for (name, monitor) in self.monitors.iter_mut() {
            call(monitor.as_mut()).map_err(|source| MonitorCallError {
                monitor: name.to_string(),
                event,
                source,
            })?;
        }
        Ok(())
    }

    fn visit_all<T, F>(
        &mut self,
        event: &'static str,
        mut call: F,
    ) -> (Vec<T>, Option<MonitorCallError>)
    where
        F: FnMut(&mut dyn Monitor) -> Result<T, anyhow::Error>,
    {
        let mut answers = Vec::with_capacity(self.monitors.len());
        let mut first_error = None;
        for (name, monitor) in self.monitors.iter_mut() {
            match call(monitor.as_mut()) {
                Ok(answer) => answers.push(answer),
                Err(source) => {
                    warn!(monitor = name, event, error = %source, "monitor call failed");
                    if first_error.is_none() {
                        first_error = Some(MonitorCallError {
                            monitor: name.to_string(),
                            event,
                            source,
                        });
                    }
                }
            }
        }
        (answers, first_error)
    }
}

fn finish<T>(value: T, error: Option<MonitorCallError>) -> Result<T, MonitorCallError> {
    match error {
        Some(error) => Err(error),
        None => Ok(value),
    }
}
