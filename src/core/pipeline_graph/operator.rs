#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::extract::Extraction;
use crate::core::load::LoadSummary;
use crate::core::pipeline_graph::schema::StageId;
use crate::core::transform::TransformOutput;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Data handed from one stage to the next.
#[derive(Debug, Clone, Default)]
pub enum StageData {
    #[default]
    Empty,
    Extracted(Extraction),
    Transformed(TransformOutput),
    Loaded(LoadSummary),
}

impl StageData {
    pub fn kind(&self) -> &'static str {
        match self {
            StageData::Empty => "empty",
            StageData::Extracted(_) => "extracted",
            StageData::Transformed(_) => "transformed",
            StageData::Loaded(_) => "loaded",
        }
    }
}

/// Execution context provided to each stage attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub logical_date: NaiveDate,
    pub stage: StageId,
    pub attempt: u32,
}

/// Trait implemented by the pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn id(&self) -> StageId;

    /// Run one attempt. `input` is the output of the upstream stage, or
    /// [`StageData::Empty`] for the first stage. Errors flagged transient are
    /// eligible for retry.
    async fn execute(&self, input: &StageData, ctx: &StageContext) -> Result<StageData, AppError>;
}

/// Builder used to register stages before execution.
pub struct StageRegistryBuilder {
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl Default for StageRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistryBuilder {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    pub fn register<T: Stage>(&mut self, stage: T) -> &mut Self {
        let id = stage.id();
        if self.stages.insert(id, Arc::new(stage)).is_some() {
            tracing::warn!(stage = %id, "stage registered twice, keeping the latest");
        }
        self
    }

    pub fn build(self) -> StageRegistry {
        StageRegistry {
            inner: Arc::new(self.stages),
        }
    }
}

/// Immutable registry available during pipeline execution.
#[derive(Clone)]
pub struct StageRegistry {
    inner: Arc<HashMap<StageId, Arc<dyn Stage>>>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        StageRegistryBuilder::new().build()
    }

    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::new()
    }

    pub fn get(&self, id: StageId) -> Option<Arc<dyn Stage>> {
        self.inner.get(&id).cloned()
    }
}
