//! Lazily resolved values.
//!
//! A [`Value<T>`] is either known up front (a literal), an output field of a
//! resource that is filled in once the resource is created, or a derivation
//! over other values built with [`combine`]. Values are immutable nodes
//! shared behind an [`Arc`], so a value can only ever be derived from values
//! that already exist and self-reference is unrepresentable.
mod inputs;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, StackId};
use crate::error::ValueError;

pub use crate::value::inputs::{Inputs, Upstream};

/// Points at a single output field of a registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub(crate) stack: StackId,
    pub(crate) index: NodeIndex,
    pub(crate) resource: ArcStr,
    pub(crate) field: &'static str,
}

impl OutputRef {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn field(&self) -> &'static str {
        self.field
    }
}

pub(crate) trait Readiness: Send + Sync {
    fn is_ready(&self) -> bool;
}

type Thunk<T> = Box<dyn Fn() -> Result<T, ValueError> + Send + Sync>;

struct Node<T> {
    secret: bool,
    refs: BTreeSet<OutputRef>,
    inputs: Vec<Arc<dyn Readiness>>,
    /// Missing for literals and resource outputs, those are filled directly.
    thunk: Option<Thunk<T>>,
    state: OnceLock<Result<T, ValueError>>,
    /// Inputs never become pending again, so a positive answer sticks.
    ready: AtomicBool,
}

impl<T: Send + Sync> Readiness for Node<T> {
    fn is_ready(&self) -> bool {
        if self.ready.load(Ordering::Acquire) || self.state.get().is_some() {
            return true;
        }

        let ready = self.thunk.is_some() && self.inputs.iter().all(|input| input.is_ready());
        if ready {
            self.ready.store(true, Ordering::Release);
        }
        ready
    }
}

/// A lazily resolved datum.
///
/// Resolution is memoized: once a value has settled on `Ok` or `Err` it never
/// changes again, and the computation behind a derived value runs at most
/// once no matter how many dependents read it.
///
/// A value may be *secret*. Secrecy is sticky, every value derived from a
/// secret value is secret as well and there is no way to clear the flag.
pub struct Value<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T> Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wraps a known value, it is resolved right away.
    pub fn literal(value: T) -> Self {
        Self::settled(Ok(value), false)
    }

    /// Wraps a known value and marks it secret.
    pub fn secret(value: T) -> Self {
        Self::settled(Ok(value), true)
    }

    fn settled(result: Result<T, ValueError>, secret: bool) -> Self {
        Self {
            node: Arc::new(Node {
                secret,
                refs: BTreeSet::new(),
                inputs: Vec::new(),
                thunk: None,
                state: OnceLock::from(result),
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// An output field of a resource, resolved by the executor.
    pub(crate) fn output(reference: OutputRef, secret: bool) -> Self {
        Self {
            node: Arc::new(Node {
                secret,
                refs: BTreeSet::from([reference]),
                inputs: Vec::new(),
                thunk: None,
                state: OnceLock::new(),
                ready: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn derived(upstream: Upstream, thunk: Thunk<T>) -> Self {
        Self {
            node: Arc::new(Node {
                secret: upstream.secret,
                refs: upstream.refs,
                inputs: upstream.readiness,
                thunk: Some(thunk),
                state: OnceLock::new(),
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Settles an output slot. Returns `false` if it was already settled.
    pub(crate) fn fulfil(&self, result: Result<T, ValueError>) -> bool {
        self.node.state.set(result).is_ok()
    }

    /// Returns a secret version of this value.
    pub fn mark_secret(&self) -> Self {
        if self.node.secret {
            return self.clone();
        }

        let mut upstream = Upstream::default();
        upstream.add(self);
        upstream.secret = true;

        let source = self.clone();
        Self::derived(upstream, Box::new(move || source.resolve()))
    }

    pub fn is_secret(&self) -> bool {
        self.node.secret
    }

    /// Whether [`Value::get`] would return a settled result.
    pub fn is_ready(&self) -> bool {
        self.node.is_ready()
    }

    /// Resolves the value.
    ///
    /// Returns `None` while any resource output this value depends on is still
    /// pending. Nothing is cached in that case, so the computation runs once
    /// the inputs are in.
    pub fn get(&self) -> Option<Result<T, ValueError>> {
        if let Some(result) = self.node.state.get() {
            return Some(result.clone());
        }

        let thunk = self.node.thunk.as_ref()?;

        if !self.node.is_ready() {
            return None;
        }

        Some(self.node.state.get_or_init(thunk).clone())
    }

    /// Like [`Value::get`], but a pending value is reported as an error.
    pub fn resolve(&self) -> Result<T, ValueError> {
        self.get().unwrap_or_else(|| Err(self.pending()))
    }

    fn pending(&self) -> ValueError {
        match self.node.refs.iter().next() {
            Some(reference) => ValueError::Pending {
                resource: reference.resource.clone(),
                field: reference.field,
            },
            None => ValueError::compute(anyhow::anyhow!("value is not resolved yet")),
        }
    }

    /// Resource outputs this value reads, directly or through its inputs.
    pub fn references(&self) -> impl Iterator<Item = &OutputRef> {
        self.node.refs.iter()
    }

    pub(crate) fn readiness(&self) -> Arc<dyn Readiness> {
        self.node.clone()
    }

    /// Derives a new value by applying an infallible function.
    pub fn map<R, F>(&self, f: F) -> Value<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        combine(self.clone(), move |value| Ok(f(value)))
    }

    /// Derives a new value by applying a fallible function.
    pub fn try_map<R, F>(&self, f: F) -> Value<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        combine(self.clone(), f)
    }

    /// Collects many values into one.
    pub fn all(values: Vec<Value<T>>) -> Value<Vec<T>> {
        combine(values, Ok)
    }
}

impl<T> From<T> for Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Value::literal(value)
    }
}

impl From<&str> for Value<String> {
    fn from(value: &str) -> Self {
        Value::literal(value.to_string())
    }
}

impl<T: fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node.secret {
            return f.write_str("Value([secret])");
        }

        match self.node.state.get() {
            Some(Ok(value)) => write!(f, "Value({value:?})"),
            Some(Err(error)) => write!(f, "Value(<failed: {error}>)"),
            None => f.write_str("Value(<pending>)"),
        }
    }
}

/// Produces a new value from the resolved `inputs`.
///
/// The result waits for every input. If any input failed, or `f` fails, the
/// result fails with the same error. `f` runs at most once. Any secret input
/// makes the result secret.
///
/// `inputs` can be `()`, a single [`Value`], a tuple of values or a `Vec` of
/// values of one type.
///
/// # Example
///
/// ```rust
/// use kumiki::{Value, combine};
///
/// let host = Value::literal("db".to_string());
/// let port = Value::literal(5432u16);
/// let url = combine((host, port), |(host, port)| Ok(format!("postgres://{host}:{port}")));
///
/// assert_eq!(url.get().unwrap().unwrap(), "postgres://db:5432");
/// ```
pub fn combine<I, R, F>(inputs: I, f: F) -> Value<R>
where
    I: Inputs,
    R: Clone + Send + Sync + 'static,
    F: Fn(I::Output) -> anyhow::Result<R> + Send + Sync + 'static,
{
    let mut upstream = Upstream::default();
    inputs.upstream(&mut upstream);

    Value::derived(
        upstream,
        Box::new(move || {
            let resolved = inputs.resolve()?;
            f(resolved).map_err(ValueError::from)
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn output_ref(resource: &str, field: &'static str) -> OutputRef {
        OutputRef {
            stack: StackId::next(),
            index: NodeIndex::new(0),
            resource: resource.into(),
            field,
        }
    }

    #[test]
    fn literal_resolves_immediately() {
        let value = Value::literal(42);
        assert!(value.is_ready());
        assert_eq!(value.get().unwrap().unwrap(), 42);
    }

    #[test]
    fn combine_without_inputs_calls_function_with_unit() {
        let value = combine((), |()| Ok("ready"));
        assert_eq!(value.get().unwrap().unwrap(), "ready");
    }

    #[test]
    fn deep_diamonds_resolve_without_blowup() {
        let base: Value<u64> = Value::output(output_ref("counter", "value"), false);

        let mut top = base.clone();
        for _ in 0..64 {
            top = combine((top.clone(), top), |(a, b)| Ok(a.max(b) + 1));
        }

        assert!(!top.is_ready());
        assert!(top.get().is_none());

        base.fulfil(Ok(0));
        assert!(top.is_ready());
        assert_eq!(top.get().unwrap().unwrap(), 64);
    }

    #[test]
    fn derived_value_is_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let value = Value::literal(2).map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * 10
        });

        assert_eq!(value.get().unwrap().unwrap(), 20);
        assert_eq!(value.get().unwrap().unwrap(), 20);
        assert_eq!(value.clone().get().unwrap().unwrap(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn secrecy_is_transitive() {
        let token = Value::secret("hunter2".to_string());
        let plain = Value::literal("user".to_string());

        let dsn = combine((plain, token), |(user, token)| Ok(format!("{user}:{token}")));
        let len = dsn.map(|dsn| dsn.len());
        let shown = len.map(|_| "nothing to see here");

        assert!(dsn.is_secret());
        assert!(len.is_secret());
        assert!(shown.is_secret());
    }

    #[test]
    fn mark_secret_keeps_value() {
        let value = Value::literal("x".to_string()).mark_secret();
        assert!(value.is_secret());
        assert_eq!(value.get().unwrap().unwrap(), "x");
        assert_eq!(format!("{value:?}"), "Value([secret])");
    }

    #[test]
    fn failure_propagates_to_every_derived_value() {
        let broken: Value<u32> = combine((), |()| Err(anyhow::anyhow!("boom")));
        let derived = combine((broken.clone(), Value::literal(1u32)), |(a, b)| Ok(a + b));
        let further = derived.map(|x| x * 2);

        assert!(broken.get().unwrap().is_err());
        let error = further.get().unwrap().unwrap_err();
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn pending_output_blocks_without_caching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let host: Value<String> = Value::output(output_ref("db", "host"), false);
        let env = host.map(move |host| {
            counter.fetch_add(1, Ordering::SeqCst);
            format!("DB_HOST={host}")
        });

        assert!(!env.is_ready());
        assert!(env.get().is_none());
        assert!(matches!(env.resolve(), Err(ValueError::Pending { field: "host", .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(host.fulfil(Ok("db-1".to_string())));
        assert!(!host.fulfil(Ok("db-2".to_string())));

        assert_eq!(env.get().unwrap().unwrap(), "DB_HOST=db-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn references_are_collected_through_derivations() {
        let a: Value<String> = Value::output(output_ref("a", "name"), false);
        let b: Value<String> = Value::output(output_ref("b", "host"), false);

        let joined = combine((a, b.map(|b| b.to_uppercase())), |(a, b)| Ok(a + &b));
        let names: Vec<_> = joined.references().map(|r| r.resource().to_string()).collect();

        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[test]
    fn all_collects_in_order() {
        let values = vec![Value::literal(1), Value::literal(2), Value::literal(3)];
        assert_eq!(Value::all(values).get().unwrap().unwrap(), vec![1, 2, 3]);
    }
}
