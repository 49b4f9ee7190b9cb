#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identifier of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Extract,
    Transform,
    Load,
}

impl StageId {
    pub const ALL: [StageId; 3] = [StageId::Extract, StageId::Transform, StageId::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Extract => "extract",
            StageId::Transform => "transform",
            StageId::Load => "load",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "extract" => Ok(StageId::Extract),
            "transform" => Ok(StageId::Transform),
            "load" => Ok(StageId::Load),
            other => Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("unknown stage '{}'", other),
            )
            .with_code("PIPE-GRAPH-002")),
        }
    }
}

/// Bounded retry settings of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    /// One retry after five minutes.
    fn default() -> Self {
        Self {
            retries: 1,
            retry_delay: Duration::from_secs(300),
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_secs(3600),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), without jitter:
    /// `retry_delay * multiplier^(retry - 1)` capped at `max_retry_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.retry_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_retry_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_retry_delay
        }
    }

    pub fn validate(&self, stage: StageId) -> Result<(), AppError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!(
                    "stages.{}.backoff_multiplier must be >= 1.0, got {}",
                    stage, self.backoff_multiplier
                ),
            )
            .with_code("CFG-STAGE-002"));
        }
        if self.max_retry_delay < self.retry_delay {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("stages.{}.max_retry_delay must be >= retry_delay", stage),
            )
            .with_code("CFG-STAGE-003"));
        }
        Ok(())
    }
}

/// Declared node of the pipeline graph.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub id: StageId,
    pub upstream: Vec<StageId>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl StageSpec {
    pub fn new(id: StageId, upstream: Vec<StageId>) -> Self {
        Self {
            id,
            upstream,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Validated stage graph, always the linear chain extract -> transform -> load.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    stages: Vec<StageSpec>,
    order: Vec<StageId>,
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self {
            stages: Self::standard_specs(),
            order: StageId::ALL.to_vec(),
        }
    }
}

impl PipelineGraph {
    fn standard_specs() -> Vec<StageSpec> {
        vec![
            StageSpec::new(StageId::Extract, Vec::new()),
            StageSpec::new(StageId::Transform, vec![StageId::Extract]),
            StageSpec::new(StageId::Load, vec![StageId::Transform]),
        ]
    }

    /// Validate `stages` and compute the execution order.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self, AppError> {
        let order = validate_stages(&stages)?;
        Ok(Self { stages, order })
    }

    /// The standard chain with per-stage retry and timeout overrides.
    pub fn standard(
        overrides: &HashMap<StageId, (RetryPolicy, Duration)>,
    ) -> Result<Self, AppError> {
        let stages = Self::standard_specs()
            .into_iter()
            .map(|spec| match overrides.get(&spec.id) {
                Some((retry, timeout)) => spec.with_retry(retry.clone()).with_timeout(*timeout),
                None => spec,
            })
            .collect();
        Self::new(stages)
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Stage ids in topological order.
    pub fn order(&self) -> &[StageId] {
        &self.order
    }

    /// Every stage reachable downstream of `id`, in execution order.
    pub fn downstream_of(&self, id: StageId) -> Vec<StageId> {
        let mut affected = vec![id];
        let mut result = Vec::new();
        for stage in &self.order {
            let spec = match self.stage(*stage) {
                Some(spec) => spec,
                None => continue,
            };
            if spec.upstream.iter().any(|u| affected.contains(u)) {
                affected.push(*stage);
                result.push(*stage);
            }
        }
        result
    }

    pub(crate) fn to_petgraph(&self) -> (DiGraph<StageId, ()>, HashMap<StageId, NodeIndex>) {
        build_graph(&self.stages)
    }
}

fn build_graph(stages: &[StageSpec]) -> (DiGraph<StageId, ()>, HashMap<StageId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for stage in stages {
        nodes.insert(stage.id, graph.add_node(stage.id));
    }
    for stage in stages {
        for upstream in &stage.upstream {
            if let (Some(&from), Some(&to)) = (nodes.get(upstream), nodes.get(&stage.id)) {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, nodes)
}

fn graph_error(code: &str, message: String) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code(code)
}

fn validate_stages(stages: &[StageSpec]) -> Result<Vec<StageId>, AppError> {
    let mut seen = HashMap::new();
    for stage in stages {
        if seen.insert(stage.id, ()).is_some() {
            return Err(graph_error(
                "PIPE-GRAPH-001",
                format!("duplicate stage id: {}", stage.id),
            ));
        }
        if stage.timeout.is_zero() {
            return Err(graph_error(
                "PIPE-GRAPH-005",
                format!("stage {} must have a non-zero timeout", stage.id),
            ));
        }
        stage.retry.validate(stage.id)?;
    }
    for stage in stages {
        for upstream in &stage.upstream {
            if !seen.contains_key(upstream) {
                return Err(graph_error(
                    "PIPE-GRAPH-002",
                    format!("stage {} depends on unknown stage {}", stage.id, upstream),
                ));
            }
        }
    }

    let (graph, _) = build_graph(stages);
    let order: Vec<StageId> = toposort(&graph, None)
        .map_err(|cycle| {
            graph_error(
                "PIPE-GRAPH-003",
                format!("stage graph has a cycle through {}", graph[cycle.node_id()]),
            )
        })?
        .into_iter()
        .map(|idx| graph[idx])
        .collect();

    let expected_upstream = |id: StageId| match id {
        StageId::Extract => vec![],
        StageId::Transform => vec![StageId::Extract],
        StageId::Load => vec![StageId::Transform],
    };
    let linear = order == StageId::ALL
        && stages.iter().all(|s| s.upstream == expected_upstream(s.id));
    if !linear {
        return Err(graph_error(
            "PIPE-GRAPH-004",
            "pipeline must be exactly extract -> transform -> load".to_string(),
        ));
    }
    Ok(order)
}
