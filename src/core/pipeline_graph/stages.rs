#![allow(clippy::result_large_err)]

use crate::core::dataset::{LoadBatch, SourceSchema};
use crate::core::error::AppError;
use crate::core::extract::{ExtractOptions, Extractor};
use crate::core::load::{self, ScopeMode, StoreConfig};
use crate::core::pipeline_graph::operator::{Stage, StageContext, StageData, StageRegistry};
use crate::core::pipeline_graph::schema::StageId;
use crate::core::transform::{TransformOptions, Transformer};
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use std::path::PathBuf;

/// Resolved runtime settings shared by the standard stages.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source_path: PathBuf,
    pub schema: SourceSchema,
    pub extract: ExtractOptions,
    pub transform: TransformOptions,
    pub store: StoreConfig,
    pub scope: ScopeMode,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("data/raw_data.csv"),
            schema: SourceSchema::default(),
            extract: ExtractOptions::default(),
            transform: TransformOptions::default(),
            store: StoreConfig::default(),
            scope: ScopeMode::default(),
        }
    }
}

/// Registry with the extract, transform and load stages wired to `settings`.
pub fn standard_registry(settings: &PipelineSettings) -> StageRegistry {
    let mut builder = StageRegistry::builder();
    builder
        .register(ExtractStage::new(
            Extractor::new(settings.schema.clone(), settings.extract.clone()),
            settings.source_path.clone(),
        ))
        .register(TransformStage::new(Transformer::new(
            settings.schema.clone(),
            settings.transform.clone(),
        )))
        .register(LoadStage::new(settings.store.clone(), settings.scope));
    builder.build()
}

fn unexpected_input(stage: StageId, input: &StageData) -> AppError {
    AppError::new(
        ErrorCategory::InternalError,
        format!("stage {} received {} input", stage, input.kind()),
    )
    .with_code("PIPE-STAGE-001")
}

pub struct ExtractStage {
    extractor: Extractor,
    source_path: PathBuf,
}

impl ExtractStage {
    pub fn new(extractor: Extractor, source_path: PathBuf) -> Self {
        Self {
            extractor,
            source_path,
        }
    }
}

#[async_trait]
impl Stage for ExtractStage {
    fn id(&self) -> StageId {
        StageId::Extract
    }

    async fn execute(
        &self,
        _input: &StageData,
        _ctx: &StageContext,
    ) -> Result<StageData, AppError> {
        let extraction = self.extractor.extract_path(&self.source_path).await?;
        Ok(StageData::Extracted(extraction))
    }
}

pub struct TransformStage {
    transformer: Transformer,
}

impl TransformStage {
    pub fn new(transformer: Transformer) -> Self {
        Self { transformer }
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn id(&self) -> StageId {
        StageId::Transform
    }

    async fn execute(
        &self,
        input: &StageData,
        _ctx: &StageContext,
    ) -> Result<StageData, AppError> {
        match input {
            StageData::Extracted(extraction) => {
                let transformer = self.transformer.clone();
                let records = extraction.records.clone();
                let output = tokio::task::spawn_blocking(move || transformer.transform(&records))
                    .await
                    .map_err(|err| {
                        AppError::new(
                            ErrorCategory::InternalError,
                            format!("transform worker failed: {}", err),
                        )
                        .with_code("PIPE-STAGE-003")
                    })??;
                Ok(StageData::Transformed(output))
            }
            other => Err(unexpected_input(StageId::Transform, other)),
        }
    }
}

pub struct LoadStage {
    store: StoreConfig,
    mode: ScopeMode,
}

impl LoadStage {
    pub fn new(store: StoreConfig, mode: ScopeMode) -> Self {
        Self { store, mode }
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn id(&self) -> StageId {
        StageId::Load
    }

    async fn execute(&self, input: &StageData, ctx: &StageContext) -> Result<StageData, AppError> {
        match input {
            StageData::Transformed(output) => {
                let batch = LoadBatch::new(ctx.logical_date, output.records.clone());
                let summary = load::load_batch(&self.store, self.mode, &batch).await?;
                Ok(StageData::Loaded(summary))
            }
            other => Err(unexpected_input(StageId::Load, other)),
        }
    }
}
