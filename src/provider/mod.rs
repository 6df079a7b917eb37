//! The narrow interface to whatever actually creates resources.
mod memory;

#[cfg(feature = "tokio")]
mod asyncio;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::Kind;
use crate::model::Properties;

pub use memory::{Event, MemoryProvisioner};

#[cfg(feature = "tokio")]
pub use asyncio::{AsyncProvisioner, Blocking};

/// Everything a provisioner needs to create one resource. All values are
/// resolved by the time a request is built.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRequest {
    pub stack: String,
    pub name: String,
    pub kind: Kind,
    pub properties: Properties,
}

impl CreateRequest {
    /// Stable identifier of the resource across plan passes.
    pub fn urn(&self) -> String {
        format!("urn:{}::{}::{}", self.stack, self.kind, self.name)
    }
}

/// A created resource as reported by the provisioner.
///
/// Must carry every output field of its kind, see
/// [`Kind::fields`](crate::Kind::fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub kind: Kind,
    pub name: String,
    pub id: String,
    pub outputs: BTreeMap<String, String>,
}

impl Provisioned {
    pub fn new(request: &CreateRequest, id: impl Into<String>) -> Self {
        Self {
            kind: request.kind,
            name: request.name.clone(),
            id: id.into(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn output(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.outputs.get(field).map(String::as_str)
    }
}

/// Creates and destroys resources.
///
/// The orchestrator calls `create` from several worker threads at once, and
/// never twice for the same resource within one plan pass.
pub trait Provisioner: Send + Sync {
    fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned>;

    fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()>;
}

impl<P: Provisioner + ?Sized> Provisioner for &P {
    fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned> {
        (**self).create(request)
    }

    fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()> {
        (**self).destroy(resource)
    }
}

impl<P: Provisioner + ?Sized> Provisioner for std::sync::Arc<P> {
    fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned> {
        (**self).create(request)
    }

    fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()> {
        (**self).destroy(resource)
    }
}
