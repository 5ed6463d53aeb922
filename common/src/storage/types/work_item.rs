use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::submission::ResourceSubmission;

/// Journal state machine for one queued submission. Terminal outcomes are not
/// states: completion deletes the journal row, terminal failure moves it into
/// the dead-letter table. Whatever is present in the journal is live work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkItemState {
    Pending,
    InFlight {
        worker_id: String,
        leased_at: DateTime<Utc>,
    },
    RetryScheduled {
        next_attempt_at: DateTime<Utc>,
    },
}

stored_object!(WorkItem, "work_item", {
    submission: ResourceSubmission,
    state: WorkItemState,
    retry_count: u32,
    last_error: Option<String>
});

/// Journal depth by state, for the queue stats endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize, PartialEq, Eq)]
pub struct WorkItemCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub retry_scheduled: usize,
}

impl WorkItem {
    pub fn new(submission: ResourceSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            submission,
            state: WorkItemState::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Journal the item before it becomes visible to any worker.
    pub async fn enqueue(self, db: &SurrealDbClient) -> Result<Self, AppError> {
        let stored = db.store_item(self).await?;
        stored.ok_or_else(|| {
            AppError::InternalError("journal write returned no record".to_string())
        })
    }

    pub async fn load(id: &str, db: &SurrealDbClient) -> Result<Option<Self>, AppError> {
        Ok(db.get_item::<Self>(id).await?)
    }

    async fn update_state(
        id: &str,
        state: WorkItemState,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _item: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/state", state))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    pub async fn mark_in_flight(
        id: &str,
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        Self::update_state(
            id,
            WorkItemState::InFlight {
                worker_id: worker_id.to_string(),
                leased_at: Utc::now(),
            },
            db,
        )
        .await
    }

    pub async fn mark_pending(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        Self::update_state(id, WorkItemState::Pending, db).await
    }

    /// Record a retryable failure: bump the attempt counter and park the item
    /// until its backoff elapses.
    pub async fn schedule_retry(
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _item: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace(
                "/state",
                WorkItemState::RetryScheduled { next_attempt_at },
            ))
            .patch(PatchOp::replace("/retry_count", retry_count))
            .patch(PatchOp::replace("/last_error", Some(error.to_string())))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        Ok(())
    }

    /// Successful commit: the journal row is the only trace, remove it.
    pub async fn complete(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _item: Option<Self> = db.delete_item(id).await?;
        Ok(())
    }

    /// Every journaled item, oldest first. Used on startup recovery; anything
    /// present is by definition unfinished.
    pub async fn unfinished(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let items: Vec<Self> = db
            .query("SELECT * FROM type::table($table) ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .await?
            .take(0)?;

        Ok(items)
    }

    pub async fn counts(db: &SurrealDbClient) -> Result<WorkItemCounts, AppError> {
        let mut response = db
            .query(
                "SELECT \
                    count(state = 'Pending') AS pending, \
                    count(state.InFlight != NONE) AS in_flight, \
                    count(state.RetryScheduled != NONE) AS retry_scheduled \
                 FROM type::table($table) GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .await?;

        let counts: Option<WorkItemCounts> = response.take(0)?;
        Ok(counts.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(id: &str) -> ResourceSubmission {
        ResourceSubmission {
            resource_id: id.to_string(),
            full_url: format!("urn:uuid:{id}"),
            resource_type: "Observation".to_string(),
            content: "test content".to_string(),
            resource_json: r#"{"resourceType":"Observation"}"#.to_string(),
            patient_id: Some("p-1".to_string()),
            source_file: None,
        }
    }

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("work_item_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn enqueue_then_load_roundtrips() {
        let db = memory_db().await;
        let item = WorkItem::new(submission("obs-1"));
        let id = item.id.clone();

        item.enqueue(&db).await.expect("enqueue");

        let loaded = WorkItem::load(&id, &db)
            .await
            .expect("load")
            .expect("item present");
        assert_eq!(loaded.submission.resource_id, "obs-1");
        assert_eq!(loaded.state, WorkItemState::Pending);
        assert_eq!(loaded.retry_count, 0);
    }

    #[tokio::test]
    async fn state_transitions_are_journaled() {
        let db = memory_db().await;
        let item = WorkItem::new(submission("obs-2"));
        let id = item.id.clone();
        item.enqueue(&db).await.expect("enqueue");

        WorkItem::mark_in_flight(&id, "worker-1", &db)
            .await
            .expect("mark in flight");
        let loaded = WorkItem::load(&id, &db).await.expect("load").expect("item");
        assert!(matches!(
            loaded.state,
            WorkItemState::InFlight { ref worker_id, .. } if worker_id == "worker-1"
        ));

        let next = Utc::now() + chrono::Duration::seconds(2);
        WorkItem::schedule_retry(&id, 1, next, "store unavailable", &db)
            .await
            .expect("schedule retry");
        let loaded = WorkItem::load(&id, &db).await.expect("load").expect("item");
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("store unavailable"));
        assert!(matches!(loaded.state, WorkItemState::RetryScheduled { .. }));

        WorkItem::complete(&id, &db).await.expect("complete");
        assert!(WorkItem::load(&id, &db).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn counts_reflect_states() {
        let db = memory_db().await;

        let pending = WorkItem::new(submission("a"));
        let in_flight = WorkItem::new(submission("b"));
        let retry = WorkItem::new(submission("c"));

        let in_flight_id = in_flight.id.clone();
        let retry_id = retry.id.clone();

        pending.enqueue(&db).await.expect("enqueue pending");
        in_flight.enqueue(&db).await.expect("enqueue in flight");
        retry.enqueue(&db).await.expect("enqueue retry");

        WorkItem::mark_in_flight(&in_flight_id, "w", &db)
            .await
            .expect("in flight");
        WorkItem::schedule_retry(&retry_id, 2, Utc::now(), "again", &db)
            .await
            .expect("retry");

        let counts = WorkItem::counts(&db).await.expect("counts");
        assert_eq!(
            counts,
            WorkItemCounts {
                pending: 1,
                in_flight: 1,
                retry_scheduled: 1
            }
        );
    }

    #[tokio::test]
    async fn unfinished_returns_oldest_first() {
        let db = memory_db().await;

        let mut first = WorkItem::new(submission("first"));
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = WorkItem::new(submission("second"));
        second.created_at = Utc::now();

        second.enqueue(&db).await.expect("enqueue second");
        first.enqueue(&db).await.expect("enqueue first");

        let items = WorkItem::unfinished(&db).await.expect("unfinished");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].submission.resource_id, "first");
    }
}
