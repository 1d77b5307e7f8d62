use crate::client::{AgentClient, AgentError};
use crate::protocol::{MonitorData, MonitorSpec, PublisherSpec};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

/// Drives several agents as if they were one.
///
/// Lifecycle calls fan out to every agent in the order they were added. Boolean
/// queries are OR-ed with every agent asked; monitor data is merged with each key
/// prefixed by the agent name; publisher traffic goes to every agent that holds
/// the publisher and the last non-null answer wins.
#[derive(Default)]
pub struct AgentPlexer {
    agents: IndexMap<String, AgentClient>,
}

impl AgentPlexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `client` and adds it under its name.
    pub fn add_agent(&mut self, mut client: AgentClient) -> Result<(), AgentError> {
        client.connect()?;
        let name = client.name().to_string();
        info!(agent = %name, uri = %client.uri(), "agent added");
        if let Some(mut previous) = self.agents.insert(name.clone(), client) {
            warn!(agent = %name, "replacing agent registered under the same name");
            if let Err(e) = previous.disconnect() {
                debug!(agent = %name, error = %e, "disconnecting replaced agent failed");
            }
        }
        Ok(())
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn start_monitor(&mut self, agent: &str, spec: MonitorSpec) -> Result<(), AgentError> {
        self.agents
            .get_mut(agent)
            .ok_or_else(|| AgentError::UnknownAgent(agent.to_string()))?
            .start_monitor(spec)
    }

    pub fn stop_monitor(&mut self, agent: &str, name: &str) -> Result<(), AgentError> {
        self.agents
            .get_mut(agent)
            .ok_or_else(|| AgentError::UnknownAgent(agent.to_string()))?
            .stop_monitor(name)
    }

    pub fn on_test_starting(&mut self) -> Result<(), AgentError> {
        for client in self.agents.values_mut() {
            client.on_test_starting()?;
        }
        Ok(())
    }

    pub fn on_test_finished(&mut self) -> Result<(), AgentError> {
        for client in self.agents.values_mut() {
            client.on_test_finished()?;
        }
        Ok(())
    }

    pub fn detected_fault(&mut self) -> Result<bool, AgentError> {
        self.any(AgentClient::detected_fault)
    }

    pub fn redo_test(&mut self) -> Result<bool, AgentError> {
        self.any(AgentClient::redo_test)
    }

    pub fn stop_run(&mut self) -> Result<bool, AgentError> {
        self.any(AgentClient::stop_run)
    }

    pub fn on_fault(&mut self) -> Result<(), AgentError> {
        let mut first_error = None;
        for (name, client) in self.agents.iter_mut() {
            if let Err(e) = client.on_fault() {
                warn!(agent = %name, error = %e, "on_fault failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Every agent's monitor data in one map, keys rewritten as `"<agent>_<key>"`.
    pub fn get_monitor_data(&mut self) -> Result<MonitorData, AgentError> {
        let mut merged = MonitorData::new();
        for (name, client) in self.agents.iter_mut() {
            for data in client.get_monitor_data()? {
                for (key, value) in data {
                    merged.insert(format!("{name}_{key}"), value);
                }
            }
        }
        Ok(merged)
    }

    pub fn on_publisher_call(&mut self, method: &str) -> Result<Option<Vec<u8>>, AgentError> {
        let mut answer = None;
        for client in self.agents.values_mut() {
            if let Some(value) = client.on_publisher_call(method)? {
                answer = Some(value);
            }
        }
        Ok(answer)
    }

    /// Asks every agent to shut its monitors down, then forgets all agents.
    /// Every agent is attempted; the first failure is returned afterwards.
    pub fn on_shutdown(&mut self) -> Result<(), AgentError> {
        let mut first_error = None;
        for (name, mut client) in self.agents.drain(..) {
            debug!(agent = %name, "shutting down agent");
            if let Err(e) = client.on_shutdown() {
                warn!(agent = %name, error = %e, "agent shutdown failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn publisher_initialize(&mut self, spec: PublisherSpec) -> Result<(), AgentError> {
        for client in self.agents.values_mut() {
            client.publisher_initialize(spec.clone())?;
        }
        Ok(())
    }

    pub fn publisher_start(&mut self, name: &str) -> Result<(), AgentError> {
        self.each_holder(name, |c| c.publisher_start(name))
    }

    pub fn publisher_stop(&mut self, name: &str) -> Result<(), AgentError> {
        self.each_holder(name, |c| c.publisher_stop(name))
    }

    pub fn publisher_accept(&mut self, name: &str) -> Result<(), AgentError> {
        self.each_holder(name, |c| c.publisher_accept(name))
    }

    pub fn publisher_connect(&mut self, name: &str) -> Result<(), AgentError> {
        self.each_holder(name, |c| c.publisher_connect(name))
    }

    pub fn publisher_close(&mut self, name: &str) -> Result<(), AgentError> {
        self.each_holder(name, |c| c.publisher_close(name))
    }

    pub fn publisher_send(&mut self, name: &str, data: &[u8]) -> Result<(), AgentError> {
        self.each_holder(name, |c| c.publisher_send(name, data))
    }

    pub fn publisher_call(
        &mut self,
        name: &str,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        self.last_answer(name, |c| c.publisher_call(name, method, args.clone()))
    }

    pub fn publisher_property(
        &mut self,
        name: &str,
        property: &str,
        value: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        self.last_answer(name, |c| c.publisher_property(name, property, value.clone()))
    }

    pub fn publisher_receive(
        &mut self,
        name: &str,
        size: Option<usize>,
    ) -> Result<Vec<u8>, AgentError> {
        let answer = self.last_answer(name, |c| {
            let data = c.publisher_receive(name, size)?;
            Ok((!data.is_empty()).then_some(data))
        })?;
        Ok(answer.unwrap_or_default())
    }

    fn any<F>(&mut self, mut query: F) -> Result<bool, AgentError>
    where
        F: FnMut(&mut AgentClient) -> Result<bool, AgentError>,
    {
        let mut any = false;
        let mut first_error = None;
        for (name, client) in self.agents.iter_mut() {
            match query(client) {
                Ok(answer) => any |= answer,
                Err(e) => {
                    warn!(agent = %name, error = %e, "agent query failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(any), Err)
    }

    fn holders<'a>(
        &'a mut self,
        publisher: &'a str,
    ) -> impl Iterator<Item = &'a mut AgentClient> + 'a {
        self.agents
            .values_mut()
            .filter(move |client| client.has_publisher(publisher))
    }

    fn each_holder<F>(&mut self, publisher: &str, mut action: F) -> Result<(), AgentError>
    where
        F: FnMut(&mut AgentClient) -> Result<(), AgentError>,
    {
        for client in self.holders(publisher) {
            action(client)?;
        }
        Ok(())
    }

    fn last_answer<F>(
        &mut self,
        publisher: &str,
        mut action: F,
    ) -> Result<Option<Vec<u8>>, AgentError>
    where
        F: FnMut(&mut AgentClient) -> Result<Option<Vec<u8>>, AgentError>,
    {
        let mut answer = None;
        for client in self.holders(publisher) {
            if let Some(value) = action(client)? {
                answer = Some(value);
            }
        }
        Ok(answer)
    }
}
