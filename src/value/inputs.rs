use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::ValueError;
use crate::value::{OutputRef, Readiness, Value};

/// What a derived value needs to know about its inputs.
#[derive(Default)]
pub struct Upstream {
    pub(crate) secret: bool,
    pub(crate) refs: BTreeSet<OutputRef>,
    pub(crate) readiness: Vec<Arc<dyn Readiness>>,
}

impl Upstream {
    pub(crate) fn add<T>(&mut self, value: &Value<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.secret |= value.is_secret();
        self.refs.extend(value.references().cloned());
        self.readiness.push(value.readiness());
    }
}

/// A collection of [`Value`]s that can be fed into [`combine`](crate::combine).
///
/// Implemented for `()`, a single value, `Vec<Value<T>>` and tuples of up to
/// twelve values of arbitrary types.
pub trait Inputs: Send + Sync + 'static {
    /// The inputs after resolution, e.g. `(A, B)` for `(Value<A>, Value<B>)`.
    type Output;

    /// Records secrecy, references and readiness of every input.
    fn upstream(&self, upstream: &mut Upstream);

    /// Resolves every input. Only called once all inputs are ready.
    fn resolve(&self) -> Result<Self::Output, ValueError>;
}

impl Inputs for () {
    type Output = ();

    fn upstream(&self, _: &mut Upstream) {}

    fn resolve(&self) -> Result<Self::Output, ValueError> {
        Ok(())
    }
}

impl<T> Inputs for Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn upstream(&self, upstream: &mut Upstream) {
        upstream.add(self);
    }

    fn resolve(&self) -> Result<Self::Output, ValueError> {
        Value::resolve(self)
    }
}

impl<T> Inputs for Vec<Value<T>>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Vec<T>;

    fn upstream(&self, upstream: &mut Upstream) {
        for value in self {
            upstream.add(value);
        }
    }

    fn resolve(&self) -> Result<Self::Output, ValueError> {
        self.iter().map(Value::resolve).collect()
    }
}

macro_rules! impl_inputs {
    ($($T:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($T),*> Inputs for ($(Value<$T>,)*)
        where
            $($T: Clone + Send + Sync + 'static),* {
            type Output = ($($T,)*);

            fn upstream(&self, upstream: &mut Upstream) {
                let ($($T,)*) = self;
                $(upstream.add($T);)*
            }

            fn resolve(&self) -> Result<Self::Output, ValueError> {
                let ($($T,)*) = self;
                Ok(($($T.resolve()?,)*))
            }
        }
    };
}

impl_inputs!(A);
impl_inputs!(A, B);
impl_inputs!(A, B, C);
impl_inputs!(A, B, C, D);
impl_inputs!(A, B, C, D, E);
impl_inputs!(A, B, C, D, E, F);
impl_inputs!(A, B, C, D, E, F, G);
impl_inputs!(A, B, C, D, E, F, G, H);
impl_inputs!(A, B, C, D, E, F, G, H, I);
impl_inputs!(A, B, C, D, E, F, G, H, I, J);
impl_inputs!(A, B, C, D, E, F, G, H, I, J, K);
impl_inputs!(A, B, C, D, E, F, G, H, I, J, K, L);

#[cfg(test)]
mod tests {
    use crate::{Value, combine};

    #[test]
    fn tuples_of_mixed_types_resolve_in_order() {
        let value = combine(
            (
                Value::literal(1u8),
                Value::literal("two".to_string()),
                Value::literal(3.0f64),
            ),
            |(a, b, c)| Ok(format!("{a}-{b}-{c}")),
        );

        assert_eq!(value.get().unwrap().unwrap(), "1-two-3");
    }

    #[test]
    fn first_failing_input_wins() {
        let ok = Value::literal(1);
        let bad: Value<i32> = combine((), |()| Err(anyhow::anyhow!("first")));
        let value = combine(vec![ok, bad], |items| Ok(items.len()));

        assert_eq!(value.get().unwrap().unwrap_err().to_string(), "first");
    }
}
