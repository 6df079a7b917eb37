use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::executor::{Deployment, State};
use crate::registry::Edge;

#[derive(Debug, Clone)]
pub struct Execution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timing of a plan pass.
///
/// Returned as part of every [`Deployment`]. Holds one entry per resource
/// that was attempted, whether it succeeded or not.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// A map of resource node indices to their execution metrics.
    pub execution_times: HashMap<NodeIndex, Execution>,
}

impl Diagnostics {
    /// Wall clock time between the first submission and the last completion.
    pub fn elapsed(&self) -> Duration {
        let start = self.execution_times.values().map(|t| t.start).min();
        let end = self
            .execution_times
            .values()
            .map(|t| t.start + t.duration)
            .max();

        match (start, end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Renders the resource graph as a Mermaid diagram, color-coded by the
    /// final state of each resource.
    ///
    /// * **Green**: Resolved
    /// * **Red**: Failed
    /// * **Grey**: Never attempted
    ///
    /// Explicit dependencies are drawn as solid arrows, data flow as dotted
    /// ones.
    pub fn render_mermaid(&self, deployment: &Deployment) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let graph = &deployment.graph;

        for index in graph.node_indices() {
            let handle = &graph[index].handle;
            let name = handle.name().replace('"', "\\\"");

            let timing = match self.execution_times.get(&index) {
                Some(exec) => format!("{:.2?}", exec.duration),
                None => "-".to_string(),
            };

            let color = match deployment.states[index.index()] {
                State::Resolved => "#90EE90",
                State::Failed => "#F08080",
                State::Pending | State::Creating => "#D3D3D3",
            };

            let _ = writeln!(
                f,
                "    {}[\"{}\\n{} {}\"]",
                index.index(),
                name,
                handle.kind(),
                timing
            );
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in graph.raw_edges() {
            let arrow = match edge.weight {
                Edge::Explicit => "-->",
                Edge::DataFlow => "-.->",
            };
            let _ = writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            );
        }

        f
    }
}
