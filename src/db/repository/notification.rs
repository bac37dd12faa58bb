use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id,
    subject,
    body,
    recipients,
    push_token,
    email_action,
    push_action,
    provider,
    scheduled,
    delivery_time,
    status,
    schedule_state,
    provider_response,
    created_at,
    updated_at
"#;

// Intermediate structure for reading from DB (statuses and recipients as raw strings)
#[derive(sqlx::FromRow)]
struct RowNotification {
    id: i64,
    subject: String,
    body: String,
    recipients: String,
    push_token: Option<String>,
    email_action: bool,
    push_action: bool,
    provider: Option<String>,
    scheduled: bool,
    delivery_time: Option<chrono::NaiveDateTime>,
    status: String,
    schedule_state: String,
    provider_response: Option<String>,
    created_at: chrono::NaiveDateTime,
    updated_at: chrono::NaiveDateTime,
}

impl TryFrom<RowNotification> for Notification {
    type Error = AppError;

    fn try_from(row: RowNotification) -> Result<Self, Self::Error> {
        let status = NotificationStatus::from_str(&row.status).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "notification {} has unknown status '{}'",
                row.id,
                row.status
            ))
        })?;
        let schedule_state = ScheduleState::from_str(&row.schedule_state).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "notification {} has unknown schedule state '{}'",
                row.id,
                row.schedule_state
            ))
        })?;
        let recipients: Vec<String> = serde_json::from_str(&row.recipients)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        Ok(Notification {
            id: row.id,
            subject: row.subject,
            body: row.body,
            recipients,
            push_token: row.push_token,
            email_action: row.email_action,
            push_action: row.push_action,
            provider: row.provider,
            scheduled: row.scheduled,
            delivery_time: row.delivery_time,
            status,
            schedule_state,
            provider_response: row.provider_response,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_optional(row: Option<RowNotification>) -> AppResult<Option<Notification>> {
    row.map(Notification::try_from).transpose()
}

/// Optional filters for listing notification records.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub scheduled: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ============================================================================
// Notification Repository
// ============================================================================

/// Durable store for notification records.
///
/// Every lifecycle transition is a single guarded `UPDATE ... WHERE` statement,
/// so concurrent writers (request handlers, scheduled jobs, cancellation)
/// can never move a record out of a terminal state. Guarded updates return
/// whether (or which row) they applied to.
pub struct NotificationRepository;

impl NotificationRepository {
    /// Insert a new record.
    ///
    /// Records with a `delivery_time` start as `pending`/`queued`; the
    /// dispatcher promotes them to `scheduled` once the job is registered.
    pub async fn create(pool: &SqlitePool, input: CreateNotification) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let scheduled = input.is_scheduled();
        let schedule_state = if scheduled {
            ScheduleState::Queued
        } else {
            ScheduleState::NotScheduled
        };
        let recipients = serde_json::to_string(&input.recipients)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let sql = format!(
            r#"
            INSERT INTO notifications (
                subject, body, recipients, push_token, email_action, push_action,
                provider, scheduled, delivery_time, status, schedule_state,
                provider_response, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, RowNotification>(&sql)
            .bind(input.subject)
            .bind(input.body)
            .bind(recipients)
            .bind(input.push_token)
            .bind(input.email_action)
            .bind(input.push_action)
            .bind(input.provider)
            .bind(scheduled)
            .bind(input.delivery_time)
            .bind(NotificationStatus::Pending.as_str())
            .bind(schedule_state.as_str())
            .bind::<Option<String>>(None)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        row.try_into()
    }

    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> AppResult<Option<Notification>> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = ?");
        let row = sqlx::query_as::<_, RowNotification>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        convert_optional(row)
    }

    /// List records, newest first, with optional filters and pagination.
    pub async fn list(
        pool: &SqlitePool,
        filter: &NotificationFilter,
    ) -> AppResult<Vec<Notification>> {
        let status = filter.status.map(|s| s.as_str());
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM notifications
            WHERE (? IS NULL OR status = ?)
            AND (? IS NULL OR scheduled = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            OFFSET ?
            "#
        );

        let rows = sqlx::query_as::<_, RowNotification>(&sql)
            .bind(status)
            .bind(status)
            .bind(filter.scheduled)
            .bind(filter.scheduled)
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter().map(Notification::try_from).collect()
    }

    /// Count records matching the filter (pagination is ignored).
    pub async fn count(pool: &SqlitePool, filter: &NotificationFilter) -> AppResult<i64> {
        let status = filter.status.map(|s| s.as_str());
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE (? IS NULL OR status = ?) AND (? IS NULL OR scheduled = ?)",
        )
        .bind(status)
        .bind(status)
        .bind(filter.scheduled)
        .bind(filter.scheduled)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }

    /// Counts grouped by status
    pub async fn counts_by_status(pool: &SqlitePool) -> AppResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM notifications GROUP BY status")
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(rows.into_iter().collect())
    }

    /// `pending -> scheduled` once the job has been registered.
    ///
    /// Does nothing if the job already fired and completed, or was canceled
    /// in the meantime.
    pub async fn mark_scheduled(pool: &SqlitePool, id: i64) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'scheduled', updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// The job could not be registered: the record fails without ever being queued.
    pub async fn mark_registration_failed(
        pool: &SqlitePool,
        id: i64,
        provider_response: &str,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'failed',
                schedule_state = 'not_scheduled',
                provider_response = ?,
                updated_at = ?
            WHERE id = ? AND schedule_state = 'queued'
            "#,
        )
        .bind(provider_response)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim a queued record for delivery (`queued -> fired`).
    ///
    /// Returns `false` when the record was canceled (or already claimed); the
    /// caller must then not invoke any backend.
    pub async fn claim_for_delivery(pool: &SqlitePool, id: i64) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET schedule_state = 'fired', updated_at = ?
            WHERE id = ? AND schedule_state = 'queued'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Write the outcome of a delivery attempt.
    ///
    /// Applies only while the record is still `pending` or `scheduled`;
    /// returns the updated record, or `None` if it was already terminal.
    pub async fn complete(
        pool: &SqlitePool,
        id: i64,
        status: NotificationStatus,
        provider_response: &str,
    ) -> AppResult<Option<Notification>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE notifications
            SET status = ?, provider_response = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'scheduled')
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, RowNotification>(&sql)
            .bind(status.as_str())
            .bind(provider_response)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        convert_optional(row)
    }

    /// Cancel a queued record (`queued -> canceled`, status `canceled`).
    ///
    /// Returns `None` when the record is not queued anymore (fired, canceled
    /// or never scheduled).
    pub async fn cancel(pool: &SqlitePool, id: i64) -> AppResult<Option<Notification>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE notifications
            SET status = 'canceled', schedule_state = 'canceled', updated_at = ?
            WHERE id = ? AND schedule_state = 'queued'
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, RowNotification>(&sql)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        convert_optional(row)
    }

    /// Fail every record that never reached a terminal status.
    ///
    /// Used at startup: the in-memory job table is empty after a restart, and
    /// a record left `pending` or `scheduled` (queued, or claimed but never
    /// completed) has no task left to finish it. Queued records leave the
    /// queue; claimed ones keep `fired`.
    pub async fn fail_unfinished(pool: &SqlitePool, provider_response: &str) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'failed',
                schedule_state = CASE
                    WHEN schedule_state = 'queued' THEN 'not_scheduled'
                    ELSE schedule_state
                END,
                provider_response = ?,
                updated_at = ?
            WHERE status IN ('pending', 'scheduled')
            "#,
        )
        .bind(provider_response)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn email_input(delivery_time: Option<chrono::NaiveDateTime>) -> CreateNotification {
        CreateNotification {
            subject: "Hi".to_string(),
            body: "Test".to_string(),
            recipients: vec!["a@x.com".to_string(), "b@x.com".to_string()],
            push_token: None,
            email_action: true,
            push_action: false,
            provider: Some("Mailjet".to_string()),
            delivery_time,
        }
    }

    #[tokio::test]
    async fn create_and_find_immediate_record() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email_input(None))
            .await
            .unwrap();

        assert_eq!(created.status, NotificationStatus::Pending);
        assert_eq!(created.schedule_state, ScheduleState::NotScheduled);
        assert!(!created.scheduled);

        let found = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .expect("record exists");
        assert_eq!(found.recipients, vec!["a@x.com", "b@x.com"]);
        assert_eq!(found.provider.as_deref(), Some("Mailjet"));

        assert!(NotificationRepository::find_by_id(&pool, 999)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn scheduled_record_starts_queued() {
        let pool = test_pool().await;
        let at = Utc::now().naive_utc() + chrono::Duration::hours(1);
        let created = NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();

        assert!(created.scheduled);
        assert_eq!(created.schedule_state, ScheduleState::Queued);
        assert!(NotificationRepository::mark_scheduled(&pool, created.id)
            .await
            .unwrap());
        // Second promotion is a no-op
        assert!(!NotificationRepository::mark_scheduled(&pool, created.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_and_claim_are_mutually_exclusive() {
        let pool = test_pool().await;
        let at = Utc::now().naive_utc() + chrono::Duration::hours(1);

        let a = NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();
        assert!(NotificationRepository::cancel(&pool, a.id)
            .await
            .unwrap()
            .is_some());
        assert!(!NotificationRepository::claim_for_delivery(&pool, a.id)
            .await
            .unwrap());

        let b = NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();
        assert!(NotificationRepository::claim_for_delivery(&pool, b.id)
            .await
            .unwrap());
        assert!(NotificationRepository::cancel(&pool, b.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email_input(None))
            .await
            .unwrap();

        let failed = NotificationRepository::complete(
            &pool,
            created.id,
            NotificationStatus::Failed,
            "email: failed: rejected",
        )
        .await
        .unwrap()
        .expect("pending record completes");
        assert_eq!(failed.status, NotificationStatus::Failed);

        let again = NotificationRepository::complete(
            &pool,
            created.id,
            NotificationStatus::Sent,
            "email: sent",
        )
        .await
        .unwrap();
        assert!(again.is_none());

        let stored = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(
            stored.provider_response.as_deref(),
            Some("email: failed: rejected")
        );
    }

    #[tokio::test]
    async fn list_count_and_stats() {
        let pool = test_pool().await;
        let at = Utc::now().naive_utc() + chrono::Duration::hours(1);
        let sent = NotificationRepository::create(&pool, email_input(None))
            .await
            .unwrap();
        NotificationRepository::complete(&pool, sent.id, NotificationStatus::Sent, "email: sent")
            .await
            .unwrap();
        NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();

        let all = NotificationRepository::list(&pool, &NotificationFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let only_sent = NotificationFilter {
            status: Some(NotificationStatus::Sent),
            ..Default::default()
        };
        assert_eq!(
            NotificationRepository::count(&pool, &only_sent).await.unwrap(),
            1
        );

        let only_scheduled = NotificationFilter {
            scheduled: Some(true),
            ..Default::default()
        };
        assert_eq!(
            NotificationRepository::count(&pool, &only_scheduled)
                .await
                .unwrap(),
            1
        );

        let stats = NotificationRepository::counts_by_status(&pool).await.unwrap();
        assert_eq!(stats.get("sent"), Some(&1));
        assert_eq!(stats.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn unfinished_records_fail_on_restart() {
        let pool = test_pool().await;
        let at = Utc::now().naive_utc() + chrono::Duration::hours(1);
        let queued = NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();
        let immediate = NotificationRepository::create(&pool, email_input(None))
            .await
            .unwrap();
        let delivered = NotificationRepository::create(&pool, email_input(None))
            .await
            .unwrap();
        NotificationRepository::complete(&pool, delivered.id, NotificationStatus::Sent, "email: sent")
            .await
            .unwrap();

        let n = NotificationRepository::fail_unfinished(&pool, "restarted")
            .await
            .unwrap();
        assert_eq!(n, 2);

        let queued = NotificationRepository::find_by_id(&pool, queued.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.status, NotificationStatus::Failed);
        assert_eq!(queued.schedule_state, ScheduleState::NotScheduled);

        let immediate = NotificationRepository::find_by_id(&pool, immediate.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(immediate.status, NotificationStatus::Failed);
        assert_eq!(immediate.provider_response.as_deref(), Some("restarted"));

        let delivered = NotificationRepository::find_by_id(&pool, delivered.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn claimed_but_incomplete_record_fails_on_restart() {
        let pool = test_pool().await;
        let at = Utc::now().naive_utc() + chrono::Duration::hours(1);
        let created = NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();
        assert!(NotificationRepository::mark_scheduled(&pool, created.id)
            .await
            .unwrap());
        assert!(NotificationRepository::claim_for_delivery(&pool, created.id)
            .await
            .unwrap());

        let n = NotificationRepository::fail_unfinished(&pool, "restarted")
            .await
            .unwrap();
        assert_eq!(n, 1);

        let stored = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.schedule_state, ScheduleState::Fired);
        assert_eq!(stored.provider_response.as_deref(), Some("restarted"));
    }

    #[tokio::test]
    async fn registration_failure_fails_queued_record() {
        let pool = test_pool().await;
        let at = Utc::now().naive_utc() + chrono::Duration::hours(1);
        let created = NotificationRepository::create(&pool, email_input(Some(at)))
            .await
            .unwrap();

        assert!(
            NotificationRepository::mark_registration_failed(&pool, created.id, "job 1 is already scheduled")
                .await
                .unwrap()
        );

        let stored = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.schedule_state, ScheduleState::NotScheduled);
        assert_eq!(
            stored.provider_response.as_deref(),
            Some("job 1 is already scheduled")
        );

        // Only applies while the record is queued
        assert!(
            !NotificationRepository::mark_registration_failed(&pool, created.id, "again")
                .await
                .unwrap()
        );
    }
}
