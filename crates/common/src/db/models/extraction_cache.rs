//! Content-hash keyed extraction cache entity

use crate::extraction::model::{CachedExtraction, DocumentCategory};
use chrono::Utc;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "extraction_cache")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub category: String,

    /// Hex SHA-256 of the file contents
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub content_hash: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub extracted_data: Json,

    #[sea_orm(column_type = "Double")]
    pub confidence_score: f64,

    pub use_count: i32,

    pub created_at: DateTimeWithTimeZone,

    pub last_used_at: DateTimeWithTimeZone,
}

impl From<Model> for CachedExtraction {
    fn from(model: Model) -> Self {
        Self {
            category: DocumentCategory::parse(&model.category),
            content_hash: model.content_hash,
            extracted_data: model.extracted_data.as_object().cloned().unwrap_or_default(),
            confidence_score: model.confidence_score,
            use_count: model.use_count,
            created_at: model.created_at.with_timezone(&Utc),
            last_used_at: model.last_used_at.with_timezone(&Utc),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
