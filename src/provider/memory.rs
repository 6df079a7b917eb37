use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::bail;

use crate::core::{Hash32, Kind};
use crate::model::Properties;
use crate::provider::{CreateRequest, Provisioned, Provisioner};

/// Something that happened to a resource inside a [`MemoryProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    Submitted(String),
    Created(String),
    Destroyed(String),
}

/// Provisions resources in memory.
///
/// Identifiers are derived from the resource URN, so repeated plans of the
/// same stack produce the same ids. Useful for dry runs and tests; failures
/// and slow resources can be simulated per logical name.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    fail_create: HashMap<String, String>,
    fail_destroy: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    journal: Mutex<Vec<Event>>,
    requests: Mutex<Vec<CreateRequest>>,
    live: Mutex<BTreeMap<String, Provisioned>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes creation of `name` fail with `message`.
    pub fn fail_on(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.fail_create.insert(name.into(), message.into());
        self
    }

    /// Makes destruction of `name` fail with `message`.
    pub fn fail_destroy(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.fail_destroy.insert(name.into(), message.into());
        self
    }

    /// Makes creation of `name` take at least `delay`.
    pub fn delay(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(name.into(), delay);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.journal.lock().unwrap().clone()
    }

    /// Names in the order their creation completed.
    pub fn created(&self) -> Vec<String> {
        self.filter_events(|event| match event {
            Event::Created(name) => Some(name),
            _ => None,
        })
    }

    /// Names in the order they were destroyed.
    pub fn destroyed(&self) -> Vec<String> {
        self.filter_events(|event| match event {
            Event::Destroyed(name) => Some(name),
            _ => None,
        })
    }

    fn filter_events(&self, f: impl Fn(&Event) -> Option<&String>) -> Vec<String> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(f)
            .cloned()
            .collect()
    }

    /// Every request received so far, in submission order.
    pub fn requests(&self) -> Vec<CreateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request(&self, name: &str) -> Option<CreateRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|request| request.name == name)
            .cloned()
    }

    /// Resources that currently exist.
    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().keys().cloned().collect()
    }

    /// Highest number of creations that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, event: Event) {
        self.journal.lock().unwrap().push(event);
    }

    fn provision(&self, request: &CreateRequest) -> anyhow::Result<Provisioned> {
        if let Some(delay) = self.delays.get(&request.name) {
            thread::sleep(*delay);
        }

        if let Some(message) = self.fail_create.get(&request.name) {
            bail!("{message}");
        }

        let id = Hash32::hash(request.urn()).to_hex();
        let id = &id[..12];
        let provisioned = Provisioned::new(request, id);

        let provisioned = match (&request.kind, &request.properties) {
            (Kind::Network, Properties::Network { .. }) => provisioned
                .output("name", &request.name)
                .output("id", id),
            (Kind::Volume, Properties::Volume) => provisioned.output("name", &request.name),
            (Kind::Image, Properties::Image { reference }) => {
                let digest = Hash32::hash(reference).to_hex();
                provisioned
                    .output("name", reference)
                    .output("image_id", format!("sha256:{digest}"))
            }
            (Kind::Service, Properties::Service(_)) => provisioned
                .output("name", &request.name)
                .output("host", &request.name)
                .output("id", id),
            (kind, _) => bail!("cannot provision a {kind} from these properties"),
        };

        Ok(provisioned)
    }
}

impl Provisioner for MemoryProvisioner {
    fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned> {
        self.requests.lock().unwrap().push(request.clone());
        self.record(Event::Submitted(request.name.clone()));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result = self.provision(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let provisioned = result?;
        self.live
            .lock()
            .unwrap()
            .insert(provisioned.name.clone(), provisioned.clone());
        self.record(Event::Created(request.name.clone()));

        Ok(provisioned)
    }

    fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()> {
        if let Some(message) = self.fail_destroy.get(&resource.name) {
            bail!("{message}");
        }

        if self.live.lock().unwrap().remove(&resource.name).is_none() {
            bail!("{} '{}' does not exist", resource.kind, resource.name);
        }

        self.record(Event::Destroyed(resource.name.clone()));
        Ok(())
    }
}
