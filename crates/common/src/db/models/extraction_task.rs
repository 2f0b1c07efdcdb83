//! Extraction task entity, one row per document

use crate::extraction::model::{ExtractionTask, TaskStatus};
use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "extraction_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub document_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub progress: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub job_id: Option<String>,

    pub retry_count: i32,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub extracted_data: Option<Json>,

    #[sea_orm(column_type = "Double", nullable)]
    pub confidence_score: Option<f64>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub last_error_at: Option<DateTimeWithTimeZone>,

    pub process_time_ms: Option<i64>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the task status as an enum
    pub fn task_status(&self) -> TaskStatus {
        TaskStatus::from(self.status.clone())
    }
}

impl From<Model> for ExtractionTask {
    fn from(model: Model) -> Self {
        Self {
            document_id: model.document_id,
            status: model.task_status(),
            progress: model.progress,
            job_id: model.job_id,
            retry_count: model.retry_count,
            extracted_data: model.extracted_data.and_then(|v| v.as_object().cloned()),
            confidence_score: model.confidence_score,
            error_message: model.error_message,
            last_error_at: model.last_error_at.map(|t| t.with_timezone(&Utc)),
            process_time_ms: model.process_time_ms,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

impl From<&ExtractionTask> for ActiveModel {
    fn from(task: &ExtractionTask) -> Self {
        Self {
            document_id: Set(task.document_id),
            status: Set(task.status.into()),
            progress: Set(task.progress),
            job_id: Set(task.job_id.clone()),
            retry_count: Set(task.retry_count),
            extracted_data: Set(task.extracted_data.clone().map(Json::Object)),
            confidence_score: Set(task.confidence_score),
            error_message: Set(task.error_message.clone()),
            last_error_at: Set(task.last_error_at.map(Into::into)),
            process_time_ms: Set(task.process_time_ms),
            created_at: Set(task.created_at.into()),
            updated_at: Set(task.updated_at.into()),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::ActiveValue;

    #[test]
    fn test_model_conversion_keeps_fields() {
        let mut task = ExtractionTask::new(Uuid::new_v4());
        let mut data = serde_json::Map::new();
        data.insert("tax_id".into(), Json::String("123.456.789-00".into()));
        task.mark_succeeded(data.clone(), 0.9, 42);

        let active = ActiveModel::from(&task);
        assert_eq!(active.status, ActiveValue::Set("succeeded".to_string()));

        let model = Model {
            document_id: task.document_id,
            status: "succeeded".into(),
            progress: 100,
            job_id: None,
            retry_count: 0,
            extracted_data: Some(Json::Object(data.clone())),
            confidence_score: Some(0.9),
            error_message: None,
            last_error_at: None,
            process_time_ms: Some(42),
            created_at: task.created_at.into(),
            updated_at: task.updated_at.into(),
        };
        let back = ExtractionTask::from(model);
        assert_eq!(back.status, TaskStatus::Succeeded);
        assert_eq!(back.extracted_data, Some(data));
        assert_eq!(back.updated_at, task.updated_at);
    }
}
