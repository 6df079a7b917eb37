mod diagnostics;

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use console::style;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::{Serialize, Serializer};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, Kind, Settings};
use crate::error::{PartialApply, PlanError, StackError, TeardownError, ValueError};
use crate::model::Definition;
use crate::provider::{CreateRequest, Provisioned, Provisioner};
use crate::registry::{Edge, Resource, ResourceHandle};
use crate::secret::{SecretManager, SecretMaterial};
use crate::utils::{get_style_root, get_style_task};
use crate::value::Value;

pub use diagnostics::{Diagnostics, Execution};

/// Where a resource is in its lifecycle.
///
/// `Resolved` and `Failed` are terminal. Resources that are still `Pending`
/// after a plan pass were never attempted, because something they depend on
/// failed or the pass was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Pending,
    Creating,
    Resolved,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "pending",
            State::Creating => "creating",
            State::Resolved => "resolved",
            State::Failed => "failed",
        };
        f.pad(name)
    }
}

/// A validated stack. The dependency graph is known to be acyclic and every
/// reference points into this stack.
pub struct Stack {
    pub(crate) name: ArcStr,
    pub(crate) settings: Settings,
    pub(crate) graph: Graph<Resource, Edge>,
    pub(crate) order: Vec<NodeIndex>,
    pub(crate) secrets: SecretManager,
    pub(crate) exports: BTreeMap<String, Value<String>>,
}

impl Stack {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// The order resources are created in when planned sequentially.
    pub fn topo_order(&self) -> impl Iterator<Item = &ResourceHandle> {
        self.order.iter().map(|&index| &self.graph[index].handle)
    }

    /// Creates every resource of the stack.
    ///
    /// Resources are submitted as soon as everything they depend on has been
    /// created, up to [`Settings::parallelism`] at a time. A failed resource
    /// takes down everything that depends on it, unrelated resources are still
    /// created. A secret that cannot be generated stops the pass altogether:
    /// nothing new is submitted and resources in flight are allowed to finish.
    ///
    /// Nothing is rolled back on failure, the partial deployment is returned
    /// inside the error.
    pub fn plan<P: Provisioner>(self, provisioner: P) -> Result<Deployment, PlanError> {
        let Stack {
            name,
            settings,
            graph,
            order: _,
            secrets,
            exports,
        } = self;

        tracing::info!(stack = &*name, resources = graph.node_count(), "planning");

        let run = run_parallel(&name, &settings, &graph, &provisioner);

        let exports = exports
            .into_iter()
            .map(|(key, value)| {
                let exported = Exported {
                    value: value.resolve(),
                    secret: value.is_secret(),
                };
                (key, exported)
            })
            .collect();

        let deployment = Deployment {
            name,
            graph,
            states: run.states,
            created: run.created,
            records: run.records,
            secrets,
            exports,
            diagnostics: run.diagnostics,
        };

        if run.errors.is_empty() {
            tracing::info!(stack = deployment.name(), "plan complete");
            Ok(deployment)
        } else {
            Err(PlanError::Failed(Box::new(PartialApply {
                errors: run.errors,
                deployment,
            })))
        }
    }
}

enum Outcome {
    Created(Provisioned),
    Generated(SecretMaterial),
}

/// (index, result, start, duration)
type Message = (NodeIndex, Result<Outcome, StackError>, Instant, Duration);

struct Run {
    states: Vec<State>,
    created: Vec<NodeIndex>,
    records: HashMap<NodeIndex, Provisioned>,
    errors: Vec<StackError>,
    diagnostics: Diagnostics,
}

/// Executes the resource graph on the rayon thread pool.
///
/// The calling thread acts as the scheduler:
/// 1. Every resource without dependencies is put on a ready queue.
/// 2. Resources are taken off the queue, leaves first, and spawned onto the
///    pool while fewer than `parallelism` are in flight. Services are held
///    back until every secret that can run has been generated.
/// 3. Workers report back over a channel. On success the output slots of the
///    resource are filled and the dependency count of each dependent is
///    decremented; dependents reaching zero join the ready queue.
/// 4. On failure the outputs of the resource settle on an error and its
///    dependents are never counted down, so they stay pending.
/// 5. The loop ends when nothing is in flight and nothing more can be
///    submitted.
fn run_parallel<P: Provisioner>(
    stack: &str,
    settings: &Settings,
    graph: &Graph<Resource, Edge>,
    provisioner: &P,
) -> Run {
    let total = graph.node_count();
    let limit = settings.parallelism.get();
    let progress = settings.progress;

    let mut states = vec![State::Pending; total];
    let mut created = Vec::with_capacity(total);
    let mut records = HashMap::new();
    let mut errors = Vec::new();
    let mut execution_times = HashMap::new();

    let key = |index: NodeIndex| Reverse((graph[index].handle.kind().tier(), index));

    let mut remaining: Vec<usize> = graph
        .node_indices()
        .map(|index| graph.neighbors_directed(index, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<_> = graph
        .node_indices()
        .filter(|index| remaining[index.index()] == 0)
        .map(key)
        .collect();

    let root_span = tracing::span!(Level::INFO, "plan", stack);
    if progress {
        root_span.pb_set_style(&get_style_root());
        root_span.pb_set_length(total as u64);
        root_span.pb_set_message(&format!("Provisioning {stack}"));
    }
    let _enter = root_span.enter();

    let task_style = get_style_task();
    let mut in_flight = 0;
    let mut aborted = false;
    let mut secrets_open = graph
        .node_weights()
        .filter(|resource| resource.handle.kind() == Kind::Secret)
        .count();

    rayon::in_place_scope(|s| {
        let (sender, receiver) = channel::<Message>();

        let spawn = |index: NodeIndex| {
            let sender = sender.clone();
            let task_style = task_style.clone();
            let parent = root_span.clone();
            let resource = &graph[index];

            s.spawn(move |_| {
                let handle = &resource.handle;
                let span = tracing::span!(
                    parent: &parent,
                    Level::INFO,
                    "resource",
                    name = handle.name(),
                    kind = %handle.kind()
                );
                if progress {
                    span.pb_set_style(&task_style);
                    span.pb_set_message(&format!("Creating {} {}", handle.kind(), handle.name()));
                }
                let _enter = span.enter();

                let start = Instant::now();

                // Resolution and provisioning only read shared state, a panic
                // can't leave anything half-updated behind.
                let result = match catch_unwind(AssertUnwindSafe(|| {
                    execute(stack, resource, provisioner)
                })) {
                    Ok(result) => result,
                    Err(panic) => Err(panicked(resource, panic)),
                };

                let _ = sender.send((index, result, start, start.elapsed()));
            });
        };

        loop {
            while !aborted
                && in_flight < limit
                && let Some(&Reverse((_, index))) = ready.peek()
            {
                // Services wait for outstanding secrets, unless those are
                // stuck behind a service themselves.
                if graph[index].handle.kind() == Kind::Service && secrets_open > 0 && in_flight > 0 {
                    break;
                }

                ready.pop();
                tracing::info!(resource = graph[index].handle.name(), "submitting");
                states[index.index()] = State::Creating;
                in_flight += 1;
                spawn(index);
            }

            if in_flight == 0 {
                break;
            }

            let Ok((index, result, start, duration)) = receiver.recv() else {
                break;
            };

            in_flight -= 1;
            execution_times.insert(index, Execution { start, duration });
            if progress {
                root_span.pb_inc(1);
            }

            let resource = &graph[index];
            if resource.handle.kind() == Kind::Secret {
                secrets_open -= 1;
            }

            match result {
                Ok(outcome) => {
                    tracing::info!(
                        resource = resource.handle.name(),
                        kind = %resource.handle.kind(),
                        elapsed = ?duration,
                        "created"
                    );

                    settle(resource, &outcome);
                    states[index.index()] = State::Resolved;
                    created.push(index);

                    if let Outcome::Created(provisioned) = outcome {
                        records.insert(index, provisioned);
                    }

                    for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
                        let count = &mut remaining[dependent.index()];
                        *count -= 1;
                        if *count == 0 {
                            ready.push(key(dependent));
                        }
                    }
                }
                Err(error) => {
                    tracing::error!(resource = resource.handle.name(), "{error}");

                    poison(resource);
                    states[index.index()] = State::Failed;

                    if matches!(error, StackError::GenerationFailure { .. }) {
                        tracing::warn!("secret generation failed, no further resources will be submitted");
                        aborted = true;
                    }

                    errors.push(error);
                }
            }
        }
    });

    for index in graph.node_indices() {
        if states[index.index()] == State::Pending {
            poison(&graph[index]);
        }
    }

    Run {
        states,
        created,
        records,
        errors,
        diagnostics: Diagnostics { execution_times },
    }
}

/// Resolves the configuration of a single resource and creates it.
fn execute<P: Provisioner>(
    stack: &str,
    resource: &Resource,
    provisioner: &P,
) -> Result<Outcome, StackError> {
    let handle = &resource.handle;

    let definition = match &resource.definition {
        Definition::Secret(entry) => return entry.generate().map(Outcome::Generated),
        definition => definition,
    };

    let properties = definition
        .resolve()
        .map_err(|error| StackError::Binding {
            name: handle.name_arc(),
            error,
        })?;

    let request = CreateRequest {
        stack: stack.to_string(),
        name: handle.name().to_string(),
        kind: handle.kind(),
        properties,
    };

    let failure = |error: anyhow::Error| StackError::CreationFailure {
        name: handle.name_arc(),
        kind: handle.kind(),
        error,
    };

    let provisioned = provisioner.create(&request).map_err(failure)?;

    if let Some(field) = handle
        .kind()
        .fields()
        .iter()
        .find(|field| provisioned.get(field).is_none())
    {
        return Err(failure(anyhow::anyhow!(
            "provisioner did not report output '{field}'"
        )));
    }

    Ok(Outcome::Created(provisioned))
}

fn panicked(resource: &Resource, panic: Box<dyn Any + Send>) -> StackError {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        String::from("panicked with unknown payload")
    };

    let name = resource.handle.name_arc();
    let error = anyhow::anyhow!(msg);

    match resource.handle.kind() {
        Kind::Secret => StackError::GenerationFailure { name, error },
        kind => StackError::CreationFailure { name, kind, error },
    }
}

/// Fills the output slots of a created resource.
fn settle(resource: &Resource, outcome: &Outcome) {
    match outcome {
        Outcome::Created(provisioned) => {
            for (field, value) in resource.handle.outputs() {
                if let Some(output) = provisioned.get(field) {
                    value.fulfil(Ok(output.to_string()));
                }
            }
        }
        Outcome::Generated(material) => {
            if let Definition::Secret(entry) = &resource.definition {
                entry.material().fulfil(Ok(material.clone()));
            }
            if let Some(value) = resource.handle.known("value") {
                value.fulfil(Ok(material.expose().to_string()));
            }
        }
    }
}

/// Settles the output slots of a resource that was not created on an error.
fn poison(resource: &Resource) {
    let error = ValueError::Upstream(resource.handle.name_arc());

    for (_, value) in resource.handle.outputs() {
        value.fulfil(Err(error.clone()));
    }

    if let Definition::Secret(entry) = &resource.definition {
        entry.material().fulfil(Err(error));
    }
}

/// An exported stack value.
///
/// Secret values are printed as `[secret]`, use [`Exported::expose`] to get
/// at the plaintext.
#[derive(Clone)]
pub struct Exported {
    value: Result<String, ValueError>,
    secret: bool,
}

impl Exported {
    pub fn expose(&self) -> Result<&str, &ValueError> {
        self.value.as_deref()
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }
}

impl fmt::Display for Exported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.value, self.secret) {
            (Err(error), _) => write!(f, "<unavailable: {error}>"),
            (Ok(_), true) => f.write_str("[secret]"),
            (Ok(value), false) => f.write_str(value),
        }
    }
}

impl fmt::Debug for Exported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exported({self})")
    }
}

impl Serialize for Exported {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match (&self.value, self.secret) {
            (Err(_), _) => serializer.serialize_none(),
            (Ok(_), true) => serializer.serialize_str("[secret]"),
            (Ok(value), false) => serializer.serialize_str(value),
        }
    }
}

/// The outcome of a plan pass: what was created, in which order, and the
/// exported values of the stack.
pub struct Deployment {
    pub(crate) name: ArcStr,
    pub(crate) graph: Graph<Resource, Edge>,
    pub(crate) states: Vec<State>,
    pub(crate) created: Vec<NodeIndex>,
    pub(crate) records: HashMap<NodeIndex, Provisioned>,
    pub(crate) secrets: SecretManager,
    pub(crate) exports: BTreeMap<String, Exported>,
    pub(crate) diagnostics: Diagnostics,
}

impl Deployment {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].handle.name() == name)
    }

    /// Created resources in creation order.
    pub fn created(&self) -> Vec<&ResourceHandle> {
        self.created
            .iter()
            .map(|&index| &self.graph[index].handle)
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<State> {
        self.find(name).map(|index| self.states[index.index()])
    }

    pub fn handle(&self, name: &str) -> Option<&ResourceHandle> {
        self.find(name).map(|index| &self.graph[index].handle)
    }

    /// What the provisioner reported for a created resource. Secrets never
    /// reach the provisioner and have no record.
    pub fn provisioned(&self, name: &str) -> Option<&Provisioned> {
        self.find(name).and_then(|index| self.records.get(&index))
    }

    pub fn exports(&self) -> &BTreeMap<String, Exported> {
        &self.exports
    }

    /// Exports as pretty JSON. Secrets are redacted, unavailable values are
    /// `null`.
    pub fn exports_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.exports)
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// A human readable overview of every resource and export.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} {}", style("Stack").bold(), style(&*self.name).cyan());

        for index in self.graph.node_indices() {
            let handle = &self.graph[index].handle;
            let state = self.states[index.index()];
            let label = format!("{state:<8}");
            let label = match state {
                State::Resolved => style(label).green(),
                State::Failed => style(label).red(),
                State::Creating => style(label).yellow(),
                State::Pending => style(label).dim(),
            };

            let id = self
                .records
                .get(&index)
                .map(|record| record.id.as_str())
                .unwrap_or("-");

            let _ = writeln!(
                out,
                "  {} {:<8} {:<32} {}",
                label,
                handle.kind(),
                handle.name(),
                style(id).dim()
            );
        }

        if !self.exports.is_empty() {
            let _ = writeln!(out, "{}", style("Exports").bold());
            for (key, value) in &self.exports {
                let _ = writeln!(out, "  {key} = {value}");
            }
        }

        let _ = write!(out, "Done in {:.2?}", self.diagnostics.elapsed());
        out
    }

    /// Tears the deployment down in the reverse order of creation.
    ///
    /// Secrets are released through their generator, everything else goes
    /// through `provisioner`. If a resource cannot be destroyed, everything it
    /// depends on is retained as well, unrelated resources are still
    /// destroyed.
    pub fn destroy<P: Provisioner>(self, provisioner: P) -> Result<(), TeardownError> {
        let mut kept = HashSet::new();
        let mut errors = Vec::new();
        let mut retained = Vec::new();

        let root_span = tracing::span!(Level::INFO, "destroy", stack = &*self.name);
        let _enter = root_span.enter();

        for &index in self.created.iter().rev() {
            let handle = &self.graph[index].handle;

            let blocked = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .any(|dependent| kept.contains(&dependent));

            if blocked {
                tracing::warn!(resource = handle.name(), "retained, a consumer is still in place");
                kept.insert(index);
                retained.push(handle.name_arc());
                continue;
            }

            let result = match self.records.get(&index) {
                Some(record) => {
                    provisioner
                        .destroy(record)
                        .map_err(|error| StackError::DestroyFailure {
                            name: handle.name_arc(),
                            kind: handle.kind(),
                            error,
                        })
                }
                None => self.secrets.destroy(handle.name()),
            };

            match result {
                Ok(()) => tracing::info!(resource = handle.name(), kind = %handle.kind(), "destroyed"),
                Err(error) => {
                    tracing::error!(resource = handle.name(), "{error}");
                    kept.insert(index);
                    errors.push(error);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { errors, retained })
        }
    }
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("name", &self.name)
            .field("created", &self.created())
            .field("exports", &self.exports)
            .finish()
    }
}
