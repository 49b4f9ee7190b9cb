pub mod config;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod inspect;
pub mod load;
pub mod pipeline_graph;
pub mod transform;
pub mod types;

pub use config::{ConfigLoader, ConfigValidator, CovidEtlConfig};
pub use dataset::{
    CleanedRecord, ColumnKind, ColumnRole, ColumnSpec, LoadBatch, RawRecord, RunScope,
    SourceSchema,
};
pub use error::AppError;
pub use extract::{ExtractionError, Extractor};
pub use load::{CaseStore, LoadError, Loader, ScopeMode, StoreConfig};
pub use transform::{TransformationError, Transformer};
pub use types::*;
