//! Startup-time factory registry for monitor and publisher classes.
//!
//! The agent never evaluates anything it receives over the network: a class id is
//! only ever looked up in this table. Ids may be namespaced (`"util.CleanupFolder"`);
//! a namespace listed in the session's imports lets callers use the bare name.

use crate::monitor::{CleanupFolder, EchoMonitor, Monitor};
use crate::process::ProcessMonitor;
use crate::protocol::{MonitorParams, SessionEnvironment};
use crate::publisher::{FilePublisher, LoopbackPublisher, Publisher};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub type MonitorConstructor = Arc<
    dyn Fn(&MonitorParams, &SessionEnvironment) -> Result<Box<dyn Monitor>, anyhow::Error>
        + Send
        + Sync,
>;

pub type PublisherConstructor = Arc<
    dyn Fn(&[String], &SessionEnvironment) -> Result<Box<dyn Publisher>, anyhow::Error>
        + Send
        + Sync,
>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown {kind} class '{class_id}' (looked up: {searched:?})")]
    UnknownClass {
        kind: &'static str,
        class_id: String,
        searched: Vec<String>,
    },
    #[error("Unable to create {kind} '{class_id}': {source}")]
    Construction {
        kind: &'static str,
        class_id: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone, Default)]
pub struct Catalog {
    monitors: HashMap<String, MonitorConstructor>,
    publishers: HashMap<String, PublisherConstructor>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("monitors", &self.monitor_classes())
            .field("publishers", &self.publisher_classes())
            .finish()
    }
}

impl Catalog {
    /// An empty catalog; nothing resolves until classes are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog an agent host starts with: the portable reference monitors
    /// and publishers shipped with the crate.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog
            .register_monitor(EchoMonitor::CLASS_ID, |params, _env| {
                Ok(Box::new(EchoMonitor::from_params(params)))
            })
            .register_monitor(CleanupFolder::CLASS_ID, |params, _env| {
                Ok(Box::new(CleanupFolder::from_params(params)?))
            })
            .register_monitor(ProcessMonitor::CLASS_ID, |params, env| {
                Ok(Box::new(ProcessMonitor::from_params(params, env)?))
            })
            .register_publisher(FilePublisher::CLASS_ID, |args, _env| {
                Ok(Box::new(FilePublisher::from_args(args)?))
            })
            .register_publisher(LoopbackPublisher::CLASS_ID, |_args, _env| {
                Ok(Box::new(LoopbackPublisher::new()))
            });
        catalog
    }

    pub fn register_monitor<F>(&mut self, class_id: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&MonitorParams, &SessionEnvironment) -> Result<Box<dyn Monitor>, anyhow::Error>
            + Send
            + Sync
            + 'static,
    {
        self.monitors.insert(class_id.into(), Arc::new(constructor));
        self
    }

    pub fn register_publisher<F>(
        &mut self,
        class_id: impl Into<String>,
        constructor: F,
    ) -> &mut Self
    where
        F: Fn(&[String], &SessionEnvironment) -> Result<Box<dyn Publisher>, anyhow::Error>
            + Send
            + Sync
            + 'static,
    {
        self.publishers.insert(class_id.into(), Arc::new(constructor));
        self
    }

    pub fn monitor_classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.monitors.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }

    pub fn publisher_classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.publishers.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }

    pub fn build_monitor(
        &self,
        class_id: &str,
        params: &MonitorParams,
        environment: &SessionEnvironment,
    ) -> Result<Box<dyn Monitor>, CatalogError> {
        let (resolved, constructor) = resolve(&self.monitors, "monitor", class_id, environment)?;
        constructor(params, environment).map_err(|source| CatalogError::Construction {
            kind: "monitor",
            class_id: resolved,
            source,
        })
    }

    pub fn build_publisher(
        &self,
        class_id: &str,
        args: &[String],
        environment: &SessionEnvironment,
    ) -> Result<Box<dyn Publisher>, CatalogError> {
        let (resolved, constructor) =
            resolve(&self.publishers, "publisher", class_id, environment)?;
        constructor(args, environment).map_err(|source| CatalogError::Construction {
            kind: "publisher",
            class_id: resolved,
            source,
        })
    }
}

/// Exact id first, then `<import>.<id>` for each import in declaration order.
fn resolve<'a, C>(
    table: &'a HashMap<String, C>,
    kind: &'static str,
    class_id: &str,
    environment: &SessionEnvironment,
) -> Result<(String, &'a C), CatalogError> {
    let candidates: Vec<String> = std::iter::once(class_id.to_string())
        .chain(
            environment
                .imports
                .iter()
                .map(|namespace| format!("{namespace}.{class_id}")),
        )
        .collect();
    for candidate in &candidates {
        if let Some(constructor) = table.get(candidate) {
            return Ok((candidate.clone(), constructor));
        }
    }
    Err(CatalogError::UnknownClass {
        kind,
        class_id: class_id.to_string(),
        searched: candidates,
    })
}
