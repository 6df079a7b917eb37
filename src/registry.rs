use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, Kind, StackId};
use crate::error::StackError;
use crate::model::Definition;
use crate::value::{OutputRef, Value};

/// A reference to a provisioned unit.
///
/// Handles are cheap to clone. Their output fields are [`Value`]s that stay
/// pending until the resource has been created, and then resolve exactly
/// once. A handle only means something inside the blueprint that issued it.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    stack: StackId,
    index: NodeIndex,
    name: ArcStr,
    kind: Kind,
    outputs: Vec<(&'static str, Value<String>)>,
}

impl ResourceHandle {
    fn new(stack: StackId, index: NodeIndex, name: ArcStr, kind: Kind) -> Self {
        let outputs = kind
            .fields()
            .iter()
            .map(|&field| {
                let reference = OutputRef {
                    stack,
                    index,
                    resource: name.clone(),
                    field,
                };
                (field, Value::output(reference, kind == Kind::Secret))
            })
            .collect();

        Self {
            inner: Arc::new(HandleInner {
                stack,
                index,
                name,
                kind,
                outputs,
            }),
        }
    }

    /// Logical name, unique within the stack.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn name_arc(&self) -> ArcStr {
        self.inner.name.clone()
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// Returns the underlying `NodeIndex` of the resource in the graph.
    pub fn index(&self) -> NodeIndex {
        self.inner.index
    }

    pub(crate) fn stack(&self) -> StackId {
        self.inner.stack
    }

    /// An output field of this resource, see [`Kind::fields`] for the fields
    /// available on each kind. Reading an output inside another resource's
    /// configuration makes that resource depend on this one.
    pub fn output(&self, field: &str) -> Result<Value<String>, StackError> {
        self.known(field)
            .cloned()
            .ok_or_else(|| StackError::UnknownField {
                resource: self.name_arc(),
                kind: self.kind(),
                field: field.to_string(),
            })
    }

    pub(crate) fn known(&self, field: &str) -> Option<&Value<String>> {
        self.inner
            .outputs
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, value)| value)
    }

    pub(crate) fn outputs(&self) -> impl Iterator<Item = (&'static str, &Value<String>)> {
        self.inner.outputs.iter().map(|(field, value)| (*field, value))
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.stack == other.inner.stack && self.inner.index == other.inner.index
    }
}

impl Eq for ResourceHandle {}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle({} '{}')", self.inner.kind, self.inner.name)
    }
}

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Declared with `depends_on`.
    Explicit,
    /// A configuration value reads an output of the dependency.
    DataFlow,
}

pub(crate) struct Resource {
    pub handle: ResourceHandle,
    pub definition: Definition,
}

/// The name table and dependency graph of one stack.
///
/// Edges point from a dependency to its dependent, so a topological walk of
/// the graph is a valid construction order.
pub(crate) struct Registry {
    stack: StackId,
    pub(crate) graph: Graph<Resource, Edge>,
    names: HashMap<ArcStr, NodeIndex>,
}

impl Registry {
    pub fn new(stack: StackId) -> Self {
        Self {
            stack,
            graph: Graph::new(),
            names: HashMap::new(),
        }
    }

    pub fn stack(&self) -> StackId {
        self.stack
    }

    /// Index the next registered resource will receive.
    pub fn next_index(&self) -> NodeIndex {
        NodeIndex::new(self.graph.node_count())
    }

    pub fn get(&self, name: &str) -> Option<&ResourceHandle> {
        self.names
            .get(name)
            .map(|&index| &self.graph[index].handle)
    }

    /// Records a resource and its declared predecessors. Outputs read by the
    /// definition are added as implicit predecessors.
    pub fn register(
        &mut self,
        name: ArcStr,
        definition: Definition,
        explicit: &[&ResourceHandle],
    ) -> Result<ResourceHandle, StackError> {
        if self.names.contains_key(&name) {
            return Err(StackError::DuplicateName(name));
        }

        for handle in explicit {
            self.check_owned(&name, handle)?;
        }

        let references = definition.references();
        for reference in &references {
            self.check_reference(&name, reference)?;
        }

        let kind = definition.kind();
        let index = self.next_index();
        let handle = ResourceHandle::new(self.stack, index, name.clone(), kind);

        let added = self.graph.add_node(Resource {
            handle: handle.clone(),
            definition,
        });
        debug_assert_eq!(added, index);
        self.names.insert(name, index);

        for dependency in explicit {
            self.add_edge(dependency.index(), index, Edge::Explicit);
        }

        for reference in references {
            self.add_edge(reference.index, index, Edge::DataFlow);
        }

        tracing::debug!(resource = handle.name(), %kind, "registered");
        Ok(handle)
    }

    /// Declares that `dependent` must be created after, and destroyed before,
    /// `dependency`.
    pub fn add_dependency(
        &mut self,
        dependent: &ResourceHandle,
        dependency: &ResourceHandle,
    ) -> Result<(), StackError> {
        self.check_owned(&dependent.name_arc(), dependent)?;
        self.check_owned(&dependent.name_arc(), dependency)?;
        self.add_edge(dependency.index(), dependent.index(), Edge::Explicit);
        Ok(())
    }

    fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, edge: Edge) {
        // Explicit and data flow edges between the same pair collapse into one.
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, edge);
        }
    }

    pub fn check_owned(&self, resource: &ArcStr, handle: &ResourceHandle) -> Result<(), StackError> {
        let registered = handle.stack() == self.stack
            && self
                .graph
                .node_weight(handle.index())
                .is_some_and(|node| node.handle == *handle);

        if registered {
            Ok(())
        } else {
            Err(StackError::UnresolvedReference {
                resource: resource.clone(),
                target: handle.name_arc(),
            })
        }
    }

    pub fn check_reference(&self, resource: &ArcStr, reference: &OutputRef) -> Result<(), StackError> {
        let registered = reference.stack == self.stack
            && self
                .graph
                .node_weight(reference.index)
                .is_some_and(|node| *node.handle.name() == *reference.resource);

        if registered {
            Ok(())
        } else {
            Err(StackError::UnresolvedReference {
                resource: resource.clone(),
                target: reference.resource.clone(),
            })
        }
    }

    /// A construction order. Among resources that are ready at the same time
    /// leaves come first, then secrets, then services, then registration
    /// order.
    pub fn topo_order(&self) -> Result<Vec<NodeIndex>, StackError> {
        topo_order(&self.graph)
    }
}

pub(crate) fn topo_order(graph: &Graph<Resource, Edge>) -> Result<Vec<NodeIndex>, StackError> {
    let mut remaining: Vec<usize> = graph
        .node_indices()
        .map(|index| graph.neighbors_directed(index, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<_> = graph
        .node_indices()
        .filter(|index| remaining[index.index()] == 0)
        .map(|index| Reverse((graph[index].handle.kind().tier(), index)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(Reverse((_, index))) = ready.pop() {
        order.push(index);

        for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
            let count = &mut remaining[dependent.index()];
            *count -= 1;
            if *count == 0 {
                ready.push(Reverse((graph[dependent].handle.kind().tier(), dependent)));
            }
        }
    }

    if order.len() == graph.node_count() {
        return Ok(order);
    }

    Err(StackError::Cycle(find_cycle(graph)))
}

/// Names along one cycle of the graph, first name repeated at the end.
fn find_cycle(graph: &Graph<Resource, Edge>) -> Vec<ArcStr> {
    let name = |index: NodeIndex| graph[index].handle.name_arc();

    for component in petgraph::algo::tarjan_scc(graph) {
        let start = match component.iter().min() {
            Some(&start) => start,
            None => continue,
        };

        if component.len() == 1 {
            if graph.contains_edge(start, start) {
                return vec![name(start), name(start)];
            }
            continue;
        }

        // Shortest way around the component, back to where we started.
        let members: HashSet<_> = component.iter().copied().collect();
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for next in graph.neighbors_directed(current, Direction::Outgoing) {
                if !members.contains(&next) {
                    continue;
                }

                if next == start {
                    let mut path = vec![current];
                    let mut cursor = current;
                    while let Some(&previous) = parent.get(&cursor) {
                        path.push(previous);
                        cursor = previous;
                    }
                    path.reverse();
                    path.push(start);
                    return path.into_iter().map(name).collect();
                }

                if !parent.contains_key(&next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
    }

    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceUnit;

    fn network(registry: &mut Registry, name: &str) -> ResourceHandle {
        registry
            .register(name.into(), Definition::Network { internal: true }, &[])
            .unwrap()
    }

    fn service(registry: &mut Registry, unit: ServiceUnit, deps: &[&ResourceHandle]) -> ResourceHandle {
        let name = unit.name.clone();
        registry
            .register(name, Definition::Service(Box::new(unit)), deps)
            .unwrap()
    }

    fn names(registry: &Registry, order: &[NodeIndex]) -> Vec<String> {
        order
            .iter()
            .map(|&index| registry.graph[index].handle.name().to_string())
            .collect()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new(StackId::next());
        network(&mut registry, "net");

        let err = registry
            .register("net".into(), Definition::Volume, &[])
            .unwrap_err();

        assert!(matches!(err, StackError::DuplicateName(name) if &*name == "net"));
    }

    #[test]
    fn implicit_dependencies_come_from_outputs() {
        let mut registry = Registry::new(StackId::next());
        let db = service(&mut registry, ServiceUnit::new("db", "postgres:14"), &[]);

        let unit = ServiceUnit::new("web", "app:1").env("DB_HOST", db.output("host").unwrap());
        let web = service(&mut registry, unit, &[]);

        let edge = registry.graph.find_edge(db.index(), web.index()).unwrap();
        assert_eq!(registry.graph[edge], Edge::DataFlow);
    }

    #[test]
    fn explicit_and_implicit_edges_merge() {
        let mut registry = Registry::new(StackId::next());
        let db = service(&mut registry, ServiceUnit::new("db", "postgres:14"), &[]);

        let unit = ServiceUnit::new("web", "app:1").env("DB_HOST", db.output("host").unwrap());
        service(&mut registry, unit, &[&db]);

        assert_eq!(registry.graph.edge_count(), 1);
    }

    #[test]
    fn order_puts_leaves_before_secrets_before_services() {
        let mut registry = Registry::new(StackId::next());
        let app = service(&mut registry, ServiceUnit::new("app", "app:1"), &[]);
        let net = network(&mut registry, "net");
        registry.add_dependency(&app, &net).unwrap();

        let order = registry.topo_order().unwrap();
        assert_eq!(names(&registry, &order), ["net", "app"]);
    }

    #[test]
    fn order_respects_every_edge() {
        let mut registry = Registry::new(StackId::next());
        let a = network(&mut registry, "a");
        let b = service(&mut registry, ServiceUnit::new("b", "img"), &[&a]);
        let c = service(&mut registry, ServiceUnit::new("c", "img"), &[&b]);
        let d = service(&mut registry, ServiceUnit::new("d", "img"), &[&a, &c]);
        let _ = d;

        let order = registry.topo_order().unwrap();
        let position: HashMap<_, _> = order.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        for edge in registry.graph.raw_edges() {
            assert!(position[&edge.source()] < position[&edge.target()]);
        }
    }

    #[test]
    fn cycles_are_reported_with_members() {
        let mut registry = Registry::new(StackId::next());
        let a = service(&mut registry, ServiceUnit::new("a", "img"), &[]);
        let b = service(&mut registry, ServiceUnit::new("b", "img"), &[&a]);
        registry.add_dependency(&a, &b).unwrap();

        let StackError::Cycle(members) = registry.topo_order().unwrap_err() else {
            panic!("expected a cycle");
        };

        assert_eq!(members.len(), 3);
        assert_eq!(members.first(), members.last());
        assert!(members.iter().any(|m| &**m == "a"));
        assert!(members.iter().any(|m| &**m == "b"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut registry = Registry::new(StackId::next());
        let a = network(&mut registry, "a");
        registry.add_dependency(&a, &a).unwrap();

        assert!(matches!(registry.topo_order(), Err(StackError::Cycle(_))));
    }

    #[test]
    fn handles_from_other_stacks_are_unresolved() {
        let mut first = Registry::new(StackId::next());
        let foreign = network(&mut first, "net");

        let mut second = Registry::new(StackId::next());
        let unit = ServiceUnit::new("web", "img").network(&foreign);
        let err = second
            .register("web".into(), Definition::Service(Box::new(unit)), &[])
            .unwrap_err();

        assert!(matches!(err, StackError::UnresolvedReference { .. }));
    }

    #[test]
    fn unknown_output_field_is_an_error() {
        let mut registry = Registry::new(StackId::next());
        let net = network(&mut registry, "net");

        assert!(matches!(
            net.output("host"),
            Err(StackError::UnknownField { kind: Kind::Network, .. })
        ));
    }
}
