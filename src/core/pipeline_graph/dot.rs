use crate::core::pipeline_graph::schema::{PipelineGraph, StageSpec};
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use serde::Serialize;
use std::fmt;

/// Node weight carrying stage display information.
struct StageNode {
    id: String,
    retries: u32,
    retry_delay: String,
    timeout: String,
}

impl fmt::Display for StageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (retries={} delay={} timeout={})",
            self.id, self.retries, self.retry_delay, self.timeout
        )
    }
}

impl From<&StageSpec> for StageNode {
    fn from(spec: &StageSpec) -> Self {
        Self {
            id: spec.id.to_string(),
            retries: spec.retry.retries,
            retry_delay: humantime::format_duration(spec.retry.retry_delay).to_string(),
            timeout: humantime::format_duration(spec.timeout).to_string(),
        }
    }
}

/// Render the pipeline as a Graphviz DOT string using petgraph.
pub fn graph_to_dot(graph: &PipelineGraph) -> String {
    let (ids, _) = graph.to_petgraph();
    let display: DiGraph<StageNode, &'static str> = ids.map(
        |_, id| {
            graph
                .stage(*id)
                .map(StageNode::from)
                .unwrap_or_else(|| StageNode {
                    id: id.to_string(),
                    retries: 0,
                    retry_delay: String::new(),
                    timeout: String::new(),
                })
        },
        |_, _| "",
    );
    format!("{}", Dot::with_config(&display, &[Config::EdgeNoLabel]))
}

/// Orchestrator-facing description of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub upstream: Vec<String>,
    pub downstream: Vec<String>,
    pub retries: u32,
    pub retry_delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_seconds: u64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphDescriptor {
    pub tasks: Vec<TaskDescriptor>,
    pub order: Vec<String>,
}

pub fn graph_descriptor(graph: &PipelineGraph) -> GraphDescriptor {
    let tasks = graph
        .order()
        .iter()
        .filter_map(|id| graph.stage(*id))
        .map(|spec| TaskDescriptor {
            task_id: spec.id.to_string(),
            upstream: spec.upstream.iter().map(|u| u.to_string()).collect(),
            downstream: graph
                .stages()
                .iter()
                .filter(|other| other.upstream.contains(&spec.id))
                .map(|other| other.id.to_string())
                .collect(),
            retries: spec.retry.retries,
            retry_delay_seconds: spec.retry.retry_delay.as_secs(),
            backoff_multiplier: spec.retry.backoff_multiplier,
            max_retry_delay_seconds: spec.retry.max_retry_delay.as_secs(),
            timeout_seconds: spec.timeout.as_secs(),
        })
        .collect();
    GraphDescriptor {
        tasks,
        order: graph.order().iter().map(|id| id.to_string()).collect(),
    }
}
