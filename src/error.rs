use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::{ArcStr, Kind};
use crate::executor::Deployment;

/// Failure state of a [`Value`](crate::Value). Cheap to clone, so that every
/// value derived from a failed one can carry the same failure.
#[derive(Debug, Error, Clone)]
pub enum ValueError {
    #[error("Output '{field}' of '{resource}' is not resolved yet")]
    Pending {
        resource: ArcStr,
        field: &'static str,
    },

    #[error("'{0}' was not created, its outputs are unavailable")]
    Upstream(ArcStr),

    #[error("{0:#}")]
    Compute(Arc<anyhow::Error>),
}

impl ValueError {
    pub fn compute(err: impl Into<anyhow::Error>) -> Self {
        Self::Compute(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for ValueError {
    fn from(err: anyhow::Error) -> Self {
        Self::Compute(Arc::new(err))
    }
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("Resource '{0}' is already defined in this stack")]
    DuplicateName(ArcStr),

    #[error("Dependency cycle between {}", .0.join(" -> "))]
    Cycle(Vec<ArcStr>),

    #[error("'{resource}' refers to '{target}', which is not registered in this stack")]
    UnresolvedReference { resource: ArcStr, target: ArcStr },

    #[error("{kind} '{resource}' has no output field '{field}'")]
    UnknownField {
        resource: ArcStr,
        kind: Kind,
        field: String,
    },

    #[error("'{resource}' expects a {expected} but '{target}' is a {found}")]
    InvalidAttachment {
        resource: ArcStr,
        target: ArcStr,
        expected: Kind,
        found: Kind,
    },

    #[error("Secret '{name}' could not be generated:\n{error:#}")]
    GenerationFailure { name: ArcStr, error: anyhow::Error },

    #[error("{kind} '{name}' could not be created:\n{error:#}")]
    CreationFailure {
        name: ArcStr,
        kind: Kind,
        error: anyhow::Error,
    },

    #[error("Configuration of '{name}' could not be resolved:\n{error}")]
    Binding { name: ArcStr, error: ValueError },

    #[error("{kind} '{name}' could not be destroyed:\n{error:#}")]
    DestroyFailure {
        name: ArcStr,
        kind: Kind,
        error: anyhow::Error,
    },
}

impl StackError {
    /// Errors found while the graph is assembled, before anything is created.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StackError::DuplicateName(_)
                | StackError::Cycle(_)
                | StackError::UnresolvedReference { .. }
                | StackError::UnknownField { .. }
                | StackError::InvalidAttachment { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    /// The stack definition was rejected, nothing has been created.
    #[error("Stack definition is invalid:\n{0}")]
    Invalid(#[from] StackError),

    /// Some resources could not be created. Everything that did get created
    /// is left in place and can be inspected or destroyed via the partial
    /// deployment.
    #[error(transparent)]
    Failed(Box<PartialApply>),
}

impl PlanError {
    /// Every independent failure that was encountered in the plan pass.
    pub fn errors(&self) -> Vec<&StackError> {
        match self {
            PlanError::Invalid(error) => vec![error],
            PlanError::Failed(partial) => partial.errors.iter().collect(),
        }
    }

    /// The partially applied deployment, if any resource was attempted.
    pub fn into_partial(self) -> Option<Deployment> {
        match self {
            PlanError::Invalid(_) => None,
            PlanError::Failed(partial) => Some(partial.deployment),
        }
    }
}

/// Outcome of a plan pass in which at least one resource failed.
pub struct PartialApply {
    pub errors: Vec<StackError>,
    pub deployment: Deployment,
}

impl fmt::Display for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Plan of stack '{}' failed with {} error(s):",
            self.deployment.name(),
            self.errors.len()
        )?;

        for error in &self.errors {
            writeln!(f, "- {error}")?;
        }

        let created = self.deployment.created();
        if !created.is_empty() {
            let names: Vec<_> = created.iter().map(|handle| handle.name()).collect();
            write!(f, "Left in place: {}", names.join(", "))?;
        }

        Ok(())
    }
}

impl std::error::Error for PartialApply {}

impl fmt::Debug for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialApply")
            .field("stack", &self.deployment.name())
            .field("errors", &self.errors)
            .finish()
    }
}

#[derive(Debug)]
pub struct TeardownError {
    pub errors: Vec<StackError>,
    /// Resources that were kept because one of their consumers could not be
    /// destroyed.
    pub retained: Vec<ArcStr>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Teardown failed with {} error(s):", self.errors.len())?;

        for error in &self.errors {
            writeln!(f, "- {error}")?;
        }

        if !self.retained.is_empty() {
            write!(f, "Retained: {}", self.retained.join(", "))?;
        }

        Ok(())
    }
}

impl std::error::Error for TeardownError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_members() {
        let err = StackError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle between a -> b -> a");
        assert!(err.is_structural());
    }

    #[test]
    fn runtime_errors_are_not_structural() {
        let err = StackError::CreationFailure {
            name: "web".into(),
            kind: Kind::Service,
            error: anyhow::anyhow!("port taken"),
        };
        assert!(!err.is_structural());
        assert!(err.to_string().contains("port taken"));
    }

    #[test]
    fn value_error_is_cloneable_and_keeps_message() {
        let err = ValueError::compute(anyhow::anyhow!("bad template"));
        let copy = err.clone();
        assert_eq!(copy.to_string(), "bad template");
    }
}
