use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{ArcStr, Kind, Settings, StackId};
use crate::error::{PlanError, StackError};
use crate::executor::{Deployment, Stack};
use crate::model::{Definition, ServiceUnit};
use crate::provider::Provisioner;
use crate::registry::{Registry, ResourceHandle};
use crate::secret::{Generator, SecretEntry, SecretManager, SecretMaterial};
use crate::value::{OutputRef, Value};

/// The blueprint of a stack.
///
/// `Blueprint` is used to declare the resources of a stack and how they are
/// wired together. Each `define_*` method registers one resource and returns
/// its [`ResourceHandle`]; reading an output of a handle in the configuration
/// of another resource makes the latter depend on the former.
///
/// Once configured, [`Blueprint::finish`] validates the graph into a
/// [`Stack`], which can then be planned against a
/// [`Provisioner`].
///
/// # Example
///
/// ```rust
/// use kumiki::{Blueprint, MemoryProvisioner, RandomHex, ServiceUnit};
///
/// let mut blueprint = Blueprint::new("demo");
/// let net = blueprint.define_network("backend", true)?;
/// let db = blueprint.define_service(ServiceUnit::new("db", "postgres:14").network(&net), &[])?;
///
/// let key = blueprint.generate_once("secret-key", RandomHex::new(32))?;
/// let key = key.map(|material| material.expose().to_string());
///
/// let web = ServiceUnit::new("web", "app:latest")
///     .network(&net)
///     .env("DB_HOST", db.output("host")?)
///     .env("SECRET_KEY", key);
/// blueprint.define_service(web, &[])?;
///
/// let deployment = blueprint.plan(MemoryProvisioner::new())?;
/// assert_eq!(deployment.created().len(), 4);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Blueprint {
    name: ArcStr,
    settings: Settings,
    registry: Registry,
    secrets: SecretManager,
    exports: BTreeMap<String, Value<String>>,
}

impl Blueprint {
    /// Creates a new, empty stack definition.
    pub fn new(name: impl Into<ArcStr>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::default(),
            registry: Registry::new(StackId::next()),
            secrets: SecretManager::default(),
            exports: BTreeMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A network. Isolated networks have no route to the outside world.
    pub fn define_network(
        &mut self,
        name: impl Into<ArcStr>,
        isolated: bool,
    ) -> Result<ResourceHandle, StackError> {
        self.registry.register(
            name.into(),
            Definition::Network { internal: isolated },
            &[],
        )
    }

    pub fn define_volume(&mut self, name: impl Into<ArcStr>) -> Result<ResourceHandle, StackError> {
        self.registry.register(name.into(), Definition::Volume, &[])
    }

    /// A container image pulled from a registry. Its `image_id` output is
    /// meant to be used as the image of a [`ServiceUnit`].
    pub fn define_image(
        &mut self,
        name: impl Into<ArcStr>,
        reference: impl Into<Value<String>>,
    ) -> Result<ResourceHandle, StackError> {
        let definition = Definition::Image {
            reference: reference.into(),
        };
        self.registry.register(name.into(), definition, &[])
    }

    /// A service. `deps` are created before the service in addition to every
    /// resource whose outputs the service reads.
    pub fn define_service(
        &mut self,
        unit: ServiceUnit,
        deps: &[&ResourceHandle],
    ) -> Result<ResourceHandle, StackError> {
        for (handle, expected) in unit.attachments() {
            self.registry.check_owned(&unit.name, handle)?;

            if handle.kind() != expected {
                return Err(StackError::InvalidAttachment {
                    resource: unit.name.clone(),
                    target: handle.name_arc(),
                    expected,
                    found: handle.kind(),
                });
            }
        }

        let name = unit.name.clone();
        self.registry
            .register(name, Definition::Service(Box::new(unit)), deps)
    }

    /// A secret, generated during the plan pass by `generator`.
    ///
    /// Asking for the same name again returns the same value and the second
    /// generator is dropped, so the secret is generated once per stack no
    /// matter how many resources consume it. Every value derived from the
    /// material is secret.
    pub fn generate_once(
        &mut self,
        name: impl Into<ArcStr>,
        generator: impl Generator + 'static,
    ) -> Result<Value<SecretMaterial>, StackError> {
        let name = name.into();

        if let Some(entry) = self.secrets.get(&name) {
            return Ok(entry.material().clone());
        }

        if self.registry.get(&name).is_some() {
            return Err(StackError::DuplicateName(name));
        }

        let reference = OutputRef {
            stack: self.registry.stack(),
            index: self.registry.next_index(),
            resource: name.clone(),
            field: "value",
        };

        let material = Value::output(reference, true);
        let entry = Arc::new(SecretEntry::new(
            name.clone(),
            Arc::new(generator),
            material.clone(),
        ));

        self.registry
            .register(name, Definition::Secret(entry.clone()), &[])?;
        self.secrets.insert(entry);

        Ok(material)
    }

    /// Makes `dependent` wait for `dependency`, even though no value flows
    /// between them.
    pub fn depends_on(
        &mut self,
        dependent: &ResourceHandle,
        dependency: &ResourceHandle,
    ) -> Result<(), StackError> {
        self.registry.add_dependency(dependent, dependency)
    }

    /// Looks up a resource by its logical name.
    pub fn handle(&self, name: &str) -> Option<&ResourceHandle> {
        self.registry.get(name)
    }

    /// Publishes a value of the stack, available on the [`Deployment`].
    /// Exporting the same name twice replaces the earlier value.
    pub fn export(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value<String>>,
    ) -> Result<(), StackError> {
        let name = name.into();
        let value = value.into();
        let owner: ArcStr = name.as_str().into();

        for reference in value.references() {
            self.registry.check_reference(&owner, reference)?;
        }

        self.exports.insert(name, value);
        Ok(())
    }

    /// The order resources would be created in by a sequential plan.
    pub fn topo_order(&self) -> Result<Vec<ResourceHandle>, StackError> {
        let order = self.registry.topo_order()?;

        Ok(order
            .into_iter()
            .map(|index| self.registry.graph[index].handle.clone())
            .collect())
    }

    /// Validates the blueprint. Fails on dependency cycles.
    pub fn finish(self) -> Result<Stack, StackError> {
        let order = self.registry.topo_order()?;

        let secrets = self
            .registry
            .graph
            .node_weights()
            .filter(|resource| resource.handle.kind() == Kind::Secret)
            .count();
        tracing::debug!(stack = &*self.name, resources = order.len(), secrets, "stack is valid");

        Ok(Stack {
            name: self.name,
            settings: self.settings,
            graph: self.registry.graph,
            order,
            secrets: self.secrets,
            exports: self.exports,
        })
    }

    /// Shorthand for [`Blueprint::finish`] followed by [`Stack::plan`].
    pub fn plan<P: Provisioner>(self, provisioner: P) -> Result<Deployment, PlanError> {
        self.finish()?.plan(provisioner)
    }
}

/// Declares and provisions a stack in one go.
///
/// `define` registers the resources on the passed blueprint. Structural
/// errors abort before anything is created.
///
/// ```rust
/// use kumiki::{MemoryProvisioner, plan};
///
/// let deployment = plan("dev", MemoryProvisioner::new(), |stack| {
///     let net = stack.define_network("net", false)?;
///     stack.export("network", net.output("name")?)?;
///     Ok(())
/// })?;
///
/// assert_eq!(deployment.exports()["network"].expose().unwrap(), "net");
/// # Ok::<(), kumiki::PlanError>(())
/// ```
pub fn plan<P, F>(stack: &str, provisioner: P, define: F) -> Result<Deployment, PlanError>
where
    P: Provisioner,
    F: FnOnce(&mut Blueprint) -> Result<(), StackError>,
{
    let mut blueprint = Blueprint::new(stack);
    define(&mut blueprint)?;
    blueprint.plan(provisioner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryProvisioner, RandomHex};

    #[test]
    fn attachments_must_have_the_right_kind() {
        let mut blueprint = Blueprint::new("kinds");
        let data = blueprint.define_volume("data").unwrap();

        let err = blueprint
            .define_service(ServiceUnit::new("app", "img").network(&data), &[])
            .unwrap_err();

        assert!(matches!(
            err,
            StackError::InvalidAttachment {
                expected: Kind::Network,
                found: Kind::Volume,
                ..
            }
        ));
    }

    #[test]
    fn handles_from_another_blueprint_are_rejected() {
        let mut other = Blueprint::new("other");
        let net = other.define_network("net", false).unwrap();

        let mut blueprint = Blueprint::new("mine");
        let err = blueprint
            .define_service(ServiceUnit::new("app", "img").network(&net), &[])
            .unwrap_err();
        assert!(matches!(err, StackError::UnresolvedReference { .. }));

        let err = blueprint.export("net", net.output("name").unwrap()).unwrap_err();
        assert!(matches!(err, StackError::UnresolvedReference { .. }));
        assert!(blueprint.handle("net").is_none());
    }

    #[test]
    fn generate_once_returns_the_same_value() {
        let mut blueprint = Blueprint::new("once");
        let first = blueprint.generate_once("key", RandomHex::new(8)).unwrap();
        let second = blueprint.generate_once("key", RandomHex::new(16)).unwrap();

        assert_eq!(blueprint.topo_order().unwrap().len(), 1);
        assert!(first.is_secret());

        let deployment = blueprint.plan(MemoryProvisioner::new()).unwrap();
        let (a, b) = (first.resolve().unwrap(), second.resolve().unwrap());

        assert!(a.same_as(&b));
        assert_eq!(a.expose().len(), 16);
        assert_eq!(a.name(), "key");
        assert!(deployment.handle("key").is_some());
    }

    #[test]
    fn secret_names_share_the_resource_namespace() {
        let mut blueprint = Blueprint::new("names");
        blueprint.define_volume("key").unwrap();

        let err = blueprint.generate_once("key", RandomHex::new(8)).unwrap_err();
        assert!(matches!(err, StackError::DuplicateName(_)));
    }

    #[test]
    fn finish_rejects_cycles() {
        let mut blueprint = Blueprint::new("cycle");
        let a = blueprint.define_volume("a").unwrap();
        let b = blueprint.define_volume("b").unwrap();
        blueprint.depends_on(&a, &b).unwrap();
        blueprint.depends_on(&b, &a).unwrap();

        assert!(matches!(blueprint.finish(), Err(StackError::Cycle(_))));
    }

    #[test]
    fn image_outputs_feed_services() {
        let mut blueprint = Blueprint::new("images");
        let image = blueprint.define_image("pg-image", "postgres:14-alpine").unwrap();
        let db = blueprint
            .define_service(ServiceUnit::new("db", image.output("image_id").unwrap()), &[])
            .unwrap();

        let order: Vec<_> = blueprint
            .topo_order()
            .unwrap()
            .iter()
            .map(|handle| handle.name().to_string())
            .collect();
        assert_eq!(order, ["pg-image", "db"]);
        assert_eq!(db.kind(), Kind::Service);
    }
}
