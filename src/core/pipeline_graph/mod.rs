//! Declared extract -> transform -> load graph with per-stage retry metadata,
//! the stage state machine and the executor driving it.

pub mod dot;
pub mod executor;
pub mod history;
pub mod operator;
pub mod schema;
pub mod stages;
pub mod staging;
pub mod state;

pub use executor::{execute_cleanup, execute_run, execute_task, RunOptions};
pub use operator::{Stage, StageContext, StageData, StageRegistry};
pub use schema::{PipelineGraph, RetryPolicy, StageId, StageSpec};
pub use stages::{standard_registry, PipelineSettings};
pub use state::{RunCounters, RunKind, RunRecord, RunStatus, StageRecord, StageState};
