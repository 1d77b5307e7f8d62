use crate::monitor::Monitor;
use crate::protocol::{MonitorSpec, PublisherSpec};
use crate::publisher::Publisher;
use indexmap::IndexMap;
use tracing::{debug, warn};

/// A live monitor and the registration that created it.
pub struct MonitorEntry {
    pub spec: MonitorSpec,
    pub instance: Box<dyn Monitor>,
}

/// Agent-side table of live monitors, in registration order, at most one per name.
#[derive(Default)]
pub struct MonitorRegistry {
    entries: IndexMap<String, MonitorEntry>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` under `spec.name`. A monitor already holding that name
    /// is shut down and replaced in place, keeping its position.
    pub fn insert(&mut self, spec: MonitorSpec, instance: Box<dyn Monitor>) {
        let name = spec.name.clone();
        if let Some(mut previous) = self.entries.insert(name, MonitorEntry { spec, instance }) {
            warn!(
                monitor = %previous.spec.name,
                "replacing monitor registered under the same name"
            );
            shutdown_quietly(&previous.spec.name, previous.instance.as_mut());
        }
    }

    /// Shuts down and removes the named monitor. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.entries.shift_remove(name) {
            Some(mut entry) => {
                shutdown_quietly(name, entry.instance.as_mut());
                true
            }
            None => false,
        }
    }

    /// Shuts down every monitor, swallowing individual failures, and empties the table.
    pub fn shutdown_all(&mut self) {
        for (name, mut entry) in self.entries.drain(..) {
            shutdown_quietly(&name, entry.instance.as_mut());
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Box<dyn Monitor>)> {
        self.entries
            .iter_mut()
            .map(|(name, entry)| (name.as_str(), &mut entry.instance))
    }
}

fn shutdown_quietly(name: &str, monitor: &mut dyn Monitor) {
    match monitor.on_shutdown() {
        Ok(()) => debug!(monitor = name, "monitor shut down"),
        Err(e) => warn!(monitor = name, error = %e, "monitor shutdown failed; ignoring"),
    }
}

pub struct PublisherEntry {
    pub spec: PublisherSpec,
    pub instance: Box<dyn Publisher>,
}

/// Agent-side table of publishers proxied for the driver, keyed by name.
#[derive(Default)]
pub struct PublisherRegistry {
    entries: IndexMap<String, PublisherEntry>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` under `spec.name`, dropping any publisher of that name.
    pub fn insert(&mut self, spec: PublisherSpec, instance: Box<dyn Publisher>) {
        let name = spec.name.clone();
        if let Some(mut previous) = self.entries.insert(name, PublisherEntry { spec, instance }) {
            close_quietly(&previous.spec.name, previous.instance.as_mut());
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn Publisher> {
        match self.entries.get_mut(name) {
            Some(entry) => Some(entry.instance.as_mut()),
            None => None,
        }
    }

    /// Stops every publisher, swallowing individual failures, and empties the table.
    pub fn clear(&mut self) {
        for (name, mut entry) in self.entries.drain(..) {
            close_quietly(&name, entry.instance.as_mut());
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn close_quietly(name: &str, publisher: &mut dyn Publisher) {
    if let Err(e) = publisher.stop() {
        warn!(publisher = name, error = %e, "publisher stop failed; ignoring");
    }
}
