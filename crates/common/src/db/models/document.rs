//! Uploaded documents, owned by the proposal domain

use crate::extraction::documents::DocumentHandle;
use crate::extraction::model::DocumentCategory;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub category: String,

    /// Path relative to the storage root
    #[sea_orm(column_type = "Text")]
    pub file_ref: String,

    pub is_verified: bool,

    pub created_at: DateTimeWithTimeZone,
}

impl From<Model> for DocumentHandle {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            category: DocumentCategory::parse(&model.category),
            file_ref: model.file_ref,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
