//! SeaORM entity models
//!
//! Database entities for the extraction pipeline

mod document;
mod extraction_cache;
mod extraction_task;

pub use extraction_task::{
    Entity as ExtractionTaskEntity,
    Model as ExtractionTaskRow,
    ActiveModel as ExtractionTaskActiveModel,
    Column as ExtractionTaskColumn,
};

pub use extraction_cache::{
    Entity as ExtractionCacheEntity,
    Model as ExtractionCacheRow,
    ActiveModel as ExtractionCacheActiveModel,
    Column as ExtractionCacheColumn,
};

pub use document::{
    Entity as DocumentEntity,
    Model as DocumentRow,
    ActiveModel as DocumentActiveModel,
    Column as DocumentColumn,
};
