use uuid::Uuid;

use crate::{
    error::{AppError, ErrorClass},
    storage::db::SurrealDbClient,
    stored_object,
};

use super::work_item::WorkItem;

/// Submission identity captured alongside a failure, so the dead-letter log
/// stays useful after the journal row is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionSnapshot {
    pub resource_id: String,
    pub resource_type: String,
    pub full_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

stored_object!(DeadLetterRecord, "dead_letter", {
    resource_id: String,
    chunk_id: Option<String>,
    error_class: ErrorClass,
    error_message: String,
    retry_count: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    metadata: SubmissionSnapshot
});

impl DeadLetterRecord {
    pub fn from_work_item(item: &WorkItem, class: ErrorClass, message: &str) -> Self {
        let now = Utc::now();
        let sub = &item.submission;
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            resource_id: sub.resource_id.clone(),
            chunk_id: None,
            error_class: class,
            error_message: message.to_string(),
            retry_count: item.retry_count,
            first_seen: item.created_at,
            last_seen: now,
            metadata: SubmissionSnapshot {
                resource_id: sub.resource_id.clone(),
                resource_type: sub.resource_type.clone(),
                full_url: sub.full_url.clone(),
                patient_id: sub.patient_id.clone(),
                source_file: sub.source_file.clone(),
            },
        }
    }

    /// Terminal failure: append the dead-letter record and drop the journal
    /// row in one transaction, so a crash cannot leave the item in both
    /// places or in neither.
    pub async fn record_and_remove(
        item: &WorkItem,
        class: ErrorClass,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let record = Self::from_work_item(item, class, message);

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "CREATE type::thing('{dl_table}', $dl_id) CONTENT $record;",
                dl_table = Self::table_name(),
            ))
            .query(format!(
                "DELETE type::thing('{wi_table}', $item_id);",
                wi_table = WorkItem::table_name(),
            ))
            .query("COMMIT TRANSACTION;")
            .bind(("dl_id", record.id.clone()))
            .bind(("record", record))
            .bind(("item_id", item.id.clone()))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn count(db: &SurrealDbClient) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: usize,
        }

        let mut response = db
            .query("SELECT count() AS count FROM type::table($table) GROUP ALL")
            .bind(("table", Self::table_name()))
            .await?;

        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::submission::ResourceSubmission;

    fn work_item(resource_id: &str) -> WorkItem {
        WorkItem::new(ResourceSubmission {
            resource_id: resource_id.to_string(),
            full_url: format!("urn:uuid:{resource_id}"),
            resource_type: "Condition".to_string(),
            content: "essential hypertension".to_string(),
            resource_json: r#"{"resourceType":"Condition"}"#.to_string(),
            patient_id: Some("p-9".to_string()),
            source_file: Some("bundle-1.json".to_string()),
        })
    }

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("dead_letter_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn record_and_remove_is_atomic() {
        let db = memory_db().await;
        let item = work_item("cond-1");
        let item_id = item.id.clone();
        let item = item.enqueue(&db).await.expect("enqueue");

        DeadLetterRecord::record_and_remove(&item, ErrorClass::Fatal, "schema violation", &db)
            .await
            .expect("dead letter");

        assert!(WorkItem::load(&item_id, &db).await.expect("load").is_none());

        let records: Vec<DeadLetterRecord> = db
            .get_all_stored_items()
            .await
            .expect("fetch dead letters");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_id, "cond-1");
        assert_eq!(records[0].error_class, ErrorClass::Fatal);
        assert_eq!(records[0].metadata.patient_id.as_deref(), Some("p-9"));
    }

    #[tokio::test]
    async fn count_tracks_appends() {
        let db = memory_db().await;
        assert_eq!(DeadLetterRecord::count(&db).await.expect("count"), 0);

        for n in 0..3 {
            let item = work_item(&format!("cond-{n}"))
                .enqueue(&db)
                .await
                .expect("enqueue");
            DeadLetterRecord::record_and_remove(&item, ErrorClass::MaxRetries, "gave up", &db)
                .await
                .expect("dead letter");
        }

        assert_eq!(DeadLetterRecord::count(&db).await.expect("count"), 3);
    }

    #[tokio::test]
    async fn snapshot_preserves_retry_count() {
        let item = {
            let mut item = work_item("cond-2");
            item.retry_count = 5;
            item
        };

        let record = DeadLetterRecord::from_work_item(&item, ErrorClass::MaxRetries, "timeout");
        assert_eq!(record.retry_count, 5);
        assert_eq!(record.error_class, ErrorClass::MaxRetries);
        assert_eq!(record.first_seen, item.created_at);
    }
}
