//! The driver's trial loop.
//!
//! A [`TrialRunner`] wraps every trial body in the agent lifecycle and turns the
//! agents' answers into a [`TrialOutcome`]. Inconclusive trials (an agent asked
//! for a redo, or a connection had to be re-established) are repeated up to the
//! configured redo limit.

use crate::client::{AgentClient, AgentError};
use crate::config::DriverConfig;
use crate::fault::FaultRecord;
use crate::launcher::LocalAgentLauncher;
use crate::plexer::AgentPlexer;
use anyhow::Context;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// The work done during one trial, typically driving publishers through the plexer.
pub trait Trial {
    fn run(&mut self, iteration: u64, plexer: &mut AgentPlexer) -> Result<(), anyhow::Error>;
}

impl<F> Trial for F
where
    F: FnMut(u64, &mut AgentPlexer) -> Result<(), anyhow::Error>,
{
    fn run(&mut self, iteration: u64, plexer: &mut AgentPlexer) -> Result<(), anyhow::Error> {
        self(iteration, plexer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Clean,
    Fault(FaultRecord),
    /// A monitor asked to end the run. Carries the fault found in the same trial, if any.
    StopRun(Option<FaultRecord>),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Trial {iteration} stayed inconclusive after {attempts} attempts")]
    RedoLimitExceeded { iteration: u64, attempts: u32 },
    #[error("Lost an agent during trial {iteration}: {source}")]
    ConnectionLost {
        iteration: u64,
        fault: FaultRecord,
        #[source]
        source: AgentError,
    },
    #[error("Recording the fault of trial {iteration} failed: {source}")]
    FaultSink {
        iteration: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub trials: u64,
    pub faults: u64,
    pub redos: u64,
    pub stopped: bool,
}

enum Attempt {
    Finished(TrialOutcome),
    Redo,
}

pub struct TrialRunner {
    plexer: AgentPlexer,
    redo_limit: u32,
    redos: u64,
    launcher: Option<LocalAgentLauncher>,
}

impl TrialRunner {
    pub fn new(plexer: AgentPlexer, redo_limit: u32) -> Self {
        Self {
            plexer,
            redo_limit,
            redos: 0,
            launcher: None,
        }
    }

    /// Spawns local agents as needed, connects every configured agent and
    /// registers its monitors, then the configured publishers on all agents.
    pub fn from_config(config: &DriverConfig) -> Result<Self, anyhow::Error> {
        let mut launcher = match &config.run.agent_program {
            Some(program) => LocalAgentLauncher::new(program),
            None => LocalAgentLauncher::current_exe()?,
        }
        .with_transport_timeout(config.run.transport_timeout());
        let mut plexer = AgentPlexer::new();
        for agent in &config.agents {
            let uri = agent
                .uri()
                .with_context(|| format!("Agent '{}' has an invalid location", agent.name))?;
            launcher
                .ensure_running(&uri, agent.secret.as_deref())
                .with_context(|| format!("Unable to start local agent '{}'", agent.name))?;
            let client = AgentClient::tcp(&agent.name, uri, config.run.transport_timeout())
                .with_secret(agent.secret.clone())
                .with_environment(agent.environment())
                .with_retry(config.run.retry_policy());
            plexer.add_agent(client)?;
            for spec in agent.monitor_specs() {
                plexer.start_monitor(&agent.name, spec)?;
            }
        }
        for publisher in &config.publishers {
            plexer.publisher_initialize(publisher.spec())?;
        }

        let mut runner = Self::new(plexer, config.run.redo_limit);
        runner.launcher = Some(launcher);
        Ok(runner)
    }

    pub fn plexer_mut(&mut self) -> &mut AgentPlexer {
        &mut self.plexer
    }

    /// Runs one trial to a conclusive outcome, repeating it while it is inconclusive.
    pub fn run_trial<T: Trial + ?Sized>(
        &mut self,
        iteration: u64,
        body: &mut T,
    ) -> Result<TrialOutcome, EngineError> {
        let mut redos = 0u32;
        loop {
            match self.attempt(iteration, body) {
                Ok(Attempt::Finished(outcome)) => return Ok(outcome),
                Ok(Attempt::Redo) => info!(iteration, "monitors asked to repeat the trial"),
                Err(AgentError::RedoTest { agent }) => {
                    warn!(iteration, agent = %agent, "repeating trial after reconnect")
                }
                Err(source @ AgentError::ReconnectFailed { .. }) => {
                    let fault = FaultRecord::connection_failure(&source.to_string());
                    return Err(EngineError::ConnectionLost {
                        iteration,
                        fault,
                        source,
                    });
                }
                Err(other) => return Err(other.into()),
            }
            redos += 1;
            self.redos += 1;
            if redos > self.redo_limit {
                return Err(EngineError::RedoLimitExceeded {
                    iteration,
                    attempts: redos,
                });
            }
        }
    }

    /// Runs trials until `max_trials` is reached or a monitor stops the run.
    /// Every fault, including a lost agent, is handed to `on_fault` first.
    pub fn run<T, S>(
        &mut self,
        max_trials: Option<u64>,
        body: &mut T,
        mut on_fault: S,
    ) -> Result<RunSummary, EngineError>
    where
        T: Trial + ?Sized,
        S: FnMut(u64, &FaultRecord) -> Result<(), anyhow::Error>,
    {
        let mut summary = RunSummary::default();
        let mut iteration = 0u64;
        while max_trials.is_none_or(|max| iteration < max) {
            iteration += 1;
            let outcome = match self.run_trial(iteration, body) {
                Ok(outcome) => outcome,
                Err(EngineError::ConnectionLost {
                    iteration,
                    fault,
                    source,
                }) => {
                    error!(iteration, error = %source, "agent lost; recording connection fault");
                    on_fault(iteration, &fault)
                        .map_err(|source| EngineError::FaultSink { iteration, source })?;
                    return Err(EngineError::ConnectionLost {
                        iteration,
                        fault,
                        source,
                    });
                }
                Err(e) => return Err(e),
            };
            summary.trials = iteration;
            let (fault, stop) = match outcome {
                TrialOutcome::Clean => (None, false),
                TrialOutcome::Fault(record) => (Some(record), false),
                TrialOutcome::StopRun(record) => (record, true),
            };
            if let Some(record) = fault {
                summary.faults += 1;
                info!(
                    iteration,
                    bucket = record.bucket().as_deref().unwrap_or("Unknown"),
                    "fault detected"
                );
                on_fault(iteration, &record)
                    .map_err(|source| EngineError::FaultSink { iteration, source })?;
            }
            if stop {
                info!(iteration, "monitors requested the run to stop");
                summary.stopped = true;
                break;
            }
        }
        summary.redos = self.redos;
        Ok(summary)
    }

    /// Shuts down every agent's monitors and, through the launcher, any agent
    /// process this runner spawned.
    pub fn shutdown(mut self) -> Result<(), AgentError> {
        let result = self.plexer.on_shutdown();
        if let Some(launcher) = self.launcher.take() {
            debug!(spawned = launcher.spawned(), "stopping local agents");
        }
        result
    }

    fn attempt<T: Trial + ?Sized>(
        &mut self,
        iteration: u64,
        body: &mut T,
    ) -> Result<Attempt, AgentError> {
        self.plexer.on_test_starting()?;
        // publisher traffic lost in transit surfaces here as RedoTest
        if let Err(e) = body.run(iteration, &mut self.plexer) {
            match e.downcast::<AgentError>() {
                Ok(
                    inconclusive @ (AgentError::RedoTest { .. }
                    | AgentError::ReconnectFailed { .. }),
                ) => return Err(inconclusive),
                Ok(other) => warn!(iteration, error = %other, "trial body failed"),
                Err(other) => warn!(iteration, error = %other, "trial body failed"),
            }
        }
        self.plexer.on_test_finished()?;

        if self.plexer.redo_test()? {
            return Ok(Attempt::Redo);
        }
        let fault = if self.plexer.detected_fault()? {
            let mut record = FaultRecord::detected(self.plexer.get_monitor_data()?);
            record.ensure_bucket();
            self.plexer.on_fault()?;
            Some(record)
        } else {
            None
        };
        let outcome = match (self.plexer.stop_run()?, fault) {
            (true, fault) => TrialOutcome::StopRun(fault),
            (false, Some(record)) => TrialOutcome::Fault(record),
            (false, None) => TrialOutcome::Clean,
        };
        debug!(iteration, ?outcome, "trial finished");
        Ok(Attempt::Finished(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BUCKET_KEY, MonitorSpec, PublisherSpec};
    use crate::testing::{
        EventLog, FailureSwitch, count, in_process_client, params, shared_agent,
    };

    fn runner_with(
        log: &EventLog,
        monitors: &[(&str, &[(&str, &str)])],
    ) -> (TrialRunner, FailureSwitch) {
        let agent = shared_agent(log, None);
        let (client, failures) = in_process_client("A", &agent);
        let mut plexer = AgentPlexer::new();
        plexer.add_agent(client).unwrap();
        for (name, pairs) in monitors {
            let mut p = params(pairs);
            p.insert("Label".to_string(), name.to_string());
            plexer
                .start_monitor("A", MonitorSpec::new(*name, "Scripted", p))
                .unwrap();
        }
        (TrialRunner::new(plexer, 3), failures)
    }

    fn noop(_: u64, _: &mut AgentPlexer) -> Result<(), anyhow::Error> {
        Ok(())
    }

    const WATCH: &[(&str, &str)] = &[];
    const CRASHER: &[(&str, &str)] = &[("Fault", "true"), ("Data.log", "segv")];
    const PICKY: &[(&str, &str)] = &[("Redo", "true")];
    const STOPPER: &[(&str, &str)] = &[("Stop", "true")];

    #[test]
    fn lifecycle_runs_in_order_for_a_clean_trial() {
        let log = EventLog::default();
        let (mut runner, _) = runner_with(&log, &[("m", WATCH)]);

        let outcome = runner.run_trial(1, &mut noop).unwrap();

        assert_eq!(outcome, TrialOutcome::Clean);
        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "m:on_test_starting",
                "m:on_test_finished",
                "m:redo_test",
                "m:detected_fault",
                "m:stop_run",
            ]
        );
    }

    #[test]
    fn fault_collects_data_and_runs_on_fault() {
        let log = EventLog::default();
        let (mut runner, _) = runner_with(&log, &[("crash", CRASHER), ("m", WATCH)]);

        match runner.run_trial(1, &mut noop).unwrap() {
            TrialOutcome::Fault(record) => {
                assert_eq!(record.data["A_log"], b"segv".to_vec());
                assert!(
                    record.data.contains_key(BUCKET_KEY),
                    "A bucket is derived when monitors supply none"
                );
            }
            other => panic!("Expected a fault, got {other:?}"),
        }
        assert_eq!(count(&log, "m:on_fault"), 1);
        assert_eq!(count(&log, "crash:on_fault"), 1);
    }

    #[test]
    fn transport_failure_repeats_the_trial() {
        let log = EventLog::default();
        let (mut runner, failures) = runner_with(&log, &[("m", WATCH)]);
        let mut runs = 0;
        let mut body = |_: u64, _: &mut AgentPlexer| -> Result<(), anyhow::Error> {
            runs += 1;
            if runs == 1 {
                failures.fail_next(1);
            }
            Ok(())
        };

        let outcome = runner.run_trial(1, &mut body).unwrap();

        assert_eq!(outcome, TrialOutcome::Clean);
        assert_eq!(runs, 2, "The inconclusive trial is run again");
        assert_eq!(count(&log, "m:on_shutdown"), 1, "Reconnect replaced the session");
    }

    #[test]
    fn lost_publisher_send_repeats_the_trial() {
        let log = EventLog::default();
        let (mut runner, failures) = runner_with(&log, &[("m", WATCH)]);
        runner
            .plexer_mut()
            .publisher_initialize(PublisherSpec::new("p", "Loopback", Vec::new()))
            .unwrap();
        let mut runs = 0;
        let mut delivered = Vec::new();
        let mut body = |_: u64, plexer: &mut AgentPlexer| -> Result<(), anyhow::Error> {
            runs += 1;
            if runs == 1 {
                failures.fail_next(1);
            }
            plexer.publisher_send("p", b"payload")?;
            delivered.push(plexer.publisher_receive("p", None)?);
            Ok(())
        };

        let outcome = runner.run_trial(1, &mut body).unwrap();

        assert_eq!(outcome, TrialOutcome::Clean);
        assert_eq!(runs, 2, "A payload that never arrived is not a clean trial");
        assert_eq!(delivered, vec![b"payload".to_vec()]);
        assert_eq!(runner.redos, 1);
    }

    #[test]
    fn endless_redo_requests_hit_the_limit() {
        let log = EventLog::default();
        let (mut runner, _) = runner_with(&log, &[("picky", PICKY)]);

        match runner.run_trial(9, &mut noop) {
            Err(EngineError::RedoLimitExceeded { iteration, attempts }) => {
                assert_eq!(iteration, 9);
                assert_eq!(attempts, 4);
            }
            other => panic!("Expected RedoLimitExceeded, got {other:?}"),
        }
        assert_eq!(count(&log, "picky:on_test_starting"), 4);
    }

    #[test]
    fn lost_agent_is_recorded_as_a_connection_fault() {
        let log = EventLog::default();
        let (mut runner, failures) = runner_with(&log, &[("m", WATCH)]);
        let mut body = |_: u64, _: &mut AgentPlexer| -> Result<(), anyhow::Error> {
            failures.fail_next(100);
            Ok(())
        };
        let mut recorded = Vec::new();

        let err = runner
            .run(Some(5), &mut body, |iteration, fault| {
                recorded.push((iteration, fault.bucket()));
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, EngineError::ConnectionLost { iteration: 1, .. }));
        assert_eq!(
            recorded,
            vec![(1, Some(crate::fault::CONNECTION_FAILED_BUCKET.to_string()))]
        );
    }

    #[test]
    fn run_stops_when_a_monitor_asks() {
        let log = EventLog::default();
        let (mut runner, _) = runner_with(&log, &[("crash", CRASHER), ("stopper", STOPPER)]);
        let mut faults = 0;

        let summary = runner
            .run(Some(10), &mut noop, |_, _| {
                faults += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                trials: 1,
                faults: 1,
                redos: 0,
                stopped: true,
            }
        );
        assert_eq!(faults, 1, "The fault of the last trial is still recorded");
    }

    #[test]
    fn run_honours_max_trials() {
        let log = EventLog::default();
        let (mut runner, _) = runner_with(&log, &[("m", WATCH)]);

        let summary = runner.run(Some(3), &mut noop, |_, _| Ok(())).unwrap();

        assert_eq!(summary.trials, 3);
        assert!(!summary.stopped);
        assert_eq!(count(&log, "m:on_test_starting"), 3);
        runner.shutdown().unwrap();
        assert_eq!(count(&log, "m:on_shutdown"), 1);
    }
}
