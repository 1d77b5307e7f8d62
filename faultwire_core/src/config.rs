use crate::client::RetryPolicy;
use crate::protocol::{MonitorParams, MonitorSpec, PublisherSpec, SessionEnvironment};
use crate::transport::{AgentUri, DEFAULT_AGENT_PORT, TransportError};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `location` value that stands for an agent on this machine's default port.
pub const LOCAL_LOCATION: &str = "local";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default)]
    pub max_trials: Option<u64>,
    #[serde(default = "default_redo_limit")]
    pub redo_limit: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
    #[serde(default)]
    pub fault_dir: Option<PathBuf>,
    /// Binary used to spawn local agents; defaults to the running executable.
    #[serde(default)]
    pub agent_program: Option<PathBuf>,
    /// Bytes sent through every configured publisher on each trial.
    #[serde(default)]
    pub payload: Option<String>,
    /// Publisher call method announced to the monitors on each trial.
    #[serde(default)]
    pub trial_call: Option<String>,
}

pub fn default_redo_limit() -> u32 {
    3
}

pub fn default_connect_attempts() -> u32 {
    20
}

pub fn default_connect_backoff_ms() -> u64 {
    1000
}

pub fn default_transport_timeout_ms() -> u64 {
    30_000
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_trials: None,
            redo_limit: default_redo_limit(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            transport_timeout_ms: default_transport_timeout_ms(),
            fault_dir: None,
            agent_program: None,
            payload: None,
            trial_call: None,
        }
    }
}

impl RunSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.connect_backoff_ms),
        )
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub params: MonitorParams,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub search_paths: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default, rename = "monitor")]
    pub monitors: Vec<MonitorConfig>,
}

fn default_location() -> String {
    LOCAL_LOCATION.to_string()
}

impl AgentConfig {
    pub fn uri(&self) -> Result<AgentUri, TransportError> {
        if self.location == LOCAL_LOCATION {
            return AgentUri::parse(&format!("tcp://127.0.0.1:{DEFAULT_AGENT_PORT}"));
        }
        AgentUri::parse(&self.location)
    }

    pub fn environment(&self) -> SessionEnvironment {
        SessionEnvironment {
            search_paths: self.search_paths.clone(),
            imports: self.imports.clone(),
        }
    }

    pub fn monitor_specs(&self) -> Vec<MonitorSpec> {
        self.monitors
            .iter()
            .map(|m| MonitorSpec::new(m.name.clone(), m.class.clone(), m.params.clone()))
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PublisherConfig {
    pub fn spec(&self) -> PublisherSpec {
        PublisherSpec::new(self.name.clone(), self.class.clone(), self.args.clone())
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentConfig>,
    #[serde(default, rename = "publisher")]
    pub publishers: Vec<PublisherConfig>,
}

impl DriverConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config = Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Invalid config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: DriverConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the agents would refuse later: no agents, duplicate
    /// agent names, duplicate monitor names within an agent, unparsable locations.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.agents.is_empty() {
            anyhow::bail!("At least one [[agent]] must be configured");
        }
        let mut agent_names = HashSet::new();
        for agent in &self.agents {
            if !agent_names.insert(agent.name.as_str()) {
                anyhow::bail!("Duplicate agent name '{}'", agent.name);
            }
            agent
                .uri()
                .map_err(|e| anyhow::anyhow!("Agent '{}': {}", agent.name, e))?;
            let mut monitor_names = HashSet::new();
            for monitor in &agent.monitors {
                if !monitor_names.insert(monitor.name.as_str()) {
                    anyhow::bail!(
                        "Agent '{}' declares monitor '{}' twice",
                        agent.name,
                        monitor.name
                    );
                }
            }
        }
        let mut publisher_names = HashSet::new();
        for publisher in &self.publishers {
            if !publisher_names.insert(publisher.name.as_str()) {
                anyhow::bail!("Duplicate publisher name '{}'", publisher.name);
            }
        }
        Ok(())
    }
}
