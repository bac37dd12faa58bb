//! Notification dispatch: validation, backend resolution, delivery and the
//! record lifecycle for immediate, scheduled and canceled notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::{CreateNotification, Notification, NotificationStatus};
use crate::db::repository::NotificationRepository;
use crate::error::{AppError, AppResult, FieldErrors};
use crate::services::clock::Clock;
use crate::services::delivery::{DeliveryError, DeliveryResponse, EmailBackend, PushBackend};
use crate::services::providers::{EmailProvider, ProviderCredentials, ProviderRegistry};
use crate::services::push::ServiceAccountKey;
use crate::services::scheduler::{JobAction, JobScheduler};
use crate::AppState;

pub const MAX_SUBJECT_LENGTH: usize = 255;

const RESTART_RESPONSE: &str = "service restarted before delivery completed";

/// A notification to send: content, targets, requested actions and the
/// credentials needed to deliver it.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub subject: String,
    pub message: String,
    pub recipients: Vec<String>,
    pub push_token: Option<String>,
    pub email_action: bool,
    pub push_action: bool,
    pub email_service: Option<String>,
    pub credentials: ProviderCredentials,
    pub push_credentials: Option<ServiceAccountKey>,
    pub delivery_time: Option<DateTime<Utc>>,
}

impl DispatchRequest {
    /// Collect every field problem. `scheduled` requires a future `delivery_time`.
    pub fn validate(&self, now: DateTime<Utc>, scheduled: bool) -> AppResult<()> {
        let mut errors = FieldErrors::new();

        if self.subject.trim().is_empty() {
            errors.add("subject", "must not be empty");
        } else if self.subject.chars().count() > MAX_SUBJECT_LENGTH {
            errors.add(
                "subject",
                format!("must be at most {} characters", MAX_SUBJECT_LENGTH),
            );
        }

        if self.message.trim().is_empty() {
            errors.add("message", "must not be empty");
        }

        if !self.email_action && !self.push_action {
            errors.add(
                "actions",
                "at least one of mail_action or firebase_action must be set",
            );
        }

        if self.email_action {
            let recipients = normalize_recipients(&self.recipients);
            if recipients.is_empty() {
                errors.add("recipient_list", "must contain at least one recipient");
            }
            for address in recipients.iter().filter(|a| !is_valid_email(a)) {
                errors.add(
                    "recipient_list",
                    format!("'{}' is not a valid email address", address),
                );
            }
            if blank(self.email_service.as_deref()) {
                errors.add("email_service_name", "required when mail_action is set");
            }
        }

        if self.push_action && blank(self.push_token.as_deref()) {
            errors.add("token", "required when firebase_action is set");
        }

        if scheduled {
            match self.delivery_time {
                None => errors.add("delivery_time", "required"),
                Some(at) if at <= now => errors.add("delivery_time", "must be in the future"),
                Some(_) => {}
            }
        }

        errors.into_result()
    }

    fn to_create(&self, delivery_time: Option<DateTime<Utc>>) -> CreateNotification {
        let provider = if self.email_action {
            self.email_service.as_deref().map(|name| {
                EmailProvider::from_name(name)
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_else(|| name.to_string())
            })
        } else {
            None
        };

        CreateNotification {
            subject: self.subject.trim().to_string(),
            body: self.message.clone(),
            recipients: if self.email_action {
                normalize_recipients(&self.recipients)
            } else {
                Vec::new()
            },
            push_token: if self.push_action {
                self.push_token.clone()
            } else {
                None
            },
            email_action: self.email_action,
            push_action: self.push_action,
            provider,
            delivery_time: delivery_time.map(|t| t.naive_utc()),
        }
    }
}

fn blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// Trim, drop blanks and de-duplicate (case-insensitively), keeping first-seen order.
pub fn normalize_recipients(recipients: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .filter(|r| seen.insert(r.to_lowercase()))
        .map(|r| r.to_string())
        .collect()
}

/// Structural address check: one `@`, a non-empty local part and a dotted domain.
pub fn is_valid_email(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Email,
    Push,
}

impl ActionKind {
    fn as_str(self) -> &'static str {
        match self {
            ActionKind::Email => "email",
            ActionKind::Push => "push",
        }
    }
}

#[derive(Debug, Clone)]
enum ActionResult {
    Delivered(DeliveryResponse),
    Failed(DeliveryError),
    Skipped,
}

#[derive(Debug, Clone)]
struct ActionOutcome {
    kind: ActionKind,
    provider: Option<&'static str>,
    result: ActionResult,
}

impl ActionOutcome {
    fn describe(&self) -> String {
        let label = match self.provider {
            Some(provider) => format!("{}[{}]", self.kind.as_str(), provider),
            None => self.kind.as_str().to_string(),
        };
        match &self.result {
            ActionResult::Delivered(response) => match &response.message_id {
                Some(id) => format!("{}: sent: {} (id {})", label, response.detail, id),
                None => format!("{}: sent: {}", label, response.detail),
            },
            ActionResult::Failed(e) => format!("{}: failed: {}", label, e),
            ActionResult::Skipped => format!("{}: skipped after earlier failure", label),
        }
    }
}

/// Combined result of every requested action, in execution order.
#[derive(Debug, Clone, Default)]
struct DeliveryReport {
    outcomes: Vec<ActionOutcome>,
}

impl DeliveryReport {
    fn status(&self) -> NotificationStatus {
        let all_delivered = self
            .outcomes
            .iter()
            .all(|o| matches!(o.result, ActionResult::Delivered(_)));
        if all_delivered && !self.outcomes.is_empty() {
            NotificationStatus::Sent
        } else {
            NotificationStatus::Failed
        }
    }

    fn summary(&self) -> String {
        self.outcomes
            .iter()
            .map(ActionOutcome::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Backends resolved up front, together with the content they deliver.
#[derive(Clone)]
struct DeliveryPlan {
    subject: String,
    body: String,
    recipients: Vec<String>,
    push_token: String,
    email: Option<Arc<dyn EmailBackend>>,
    push: Option<Arc<dyn PushBackend>>,
}

impl DeliveryPlan {
    /// Email first, then push. An email failure skips the push.
    async fn execute(&self, id: i64) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut failed = false;

        if let Some(email) = &self.email {
            let result = match email
                .send_email(&self.subject, &self.body, &self.recipients)
                .await
            {
                Ok(response) => {
                    tracing::debug!("Notification {}: email sent via {}", id, email.name());
                    ActionResult::Delivered(response)
                }
                Err(e) => {
                    tracing::warn!(
                        "Notification {}: email via {} failed: {}",
                        id,
                        email.name(),
                        e
                    );
                    failed = true;
                    ActionResult::Failed(e)
                }
            };
            report.outcomes.push(ActionOutcome {
                kind: ActionKind::Email,
                provider: Some(email.name()),
                result,
            });
        }

        if let Some(push) = &self.push {
            let result = if failed {
                tracing::debug!("Notification {}: push skipped", id);
                ActionResult::Skipped
            } else {
                match push
                    .send_push(&self.subject, &self.body, &self.push_token)
                    .await
                {
                    Ok(response) => {
                        tracing::debug!("Notification {}: push sent", id);
                        ActionResult::Delivered(response)
                    }
                    Err(e) => {
                        tracing::warn!("Notification {}: push failed: {}", id, e);
                        ActionResult::Failed(e)
                    }
                }
            };
            report.outcomes.push(ActionOutcome {
                kind: ActionKind::Push,
                provider: None,
                result,
            });
        }

        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub id: i64,
    pub status: NotificationStatus,
    pub provider_response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleOutcome {
    pub id: i64,
    pub schedule_id: i64,
    pub delivery_time: DateTime<Utc>,
    pub status: NotificationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub id: i64,
    pub status: NotificationStatus,
    pub canceled: bool,
}

#[derive(Clone)]
pub struct DispatchService {
    pool: SqlitePool,
    registry: Arc<ProviderRegistry>,
    scheduler: Arc<JobScheduler>,
    clock: Arc<dyn Clock>,
}

impl DispatchService {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ProviderRegistry>,
        scheduler: Arc<JobScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            registry,
            scheduler,
            clock,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.db.clone(),
            state.registry.clone(),
            state.scheduler.clone(),
            state.clock.clone(),
        )
    }

    /// Resolve every backend the request needs. Nothing is persisted on failure.
    fn plan(&self, request: &DispatchRequest) -> AppResult<DeliveryPlan> {
        let email = if request.email_action {
            let service = request.email_service.as_deref().unwrap_or_default();
            Some(
                self.registry
                    .resolve_email_backend(service, &request.credentials)?,
            )
        } else {
            None
        };

        let push = if request.push_action {
            Some(
                self.registry
                    .resolve_push_backend(request.push_credentials.as_ref())?,
            )
        } else {
            None
        };

        Ok(DeliveryPlan {
            subject: request.subject.trim().to_string(),
            body: request.message.clone(),
            recipients: normalize_recipients(&request.recipients),
            push_token: request.push_token.clone().unwrap_or_default(),
            email,
            push,
        })
    }

    /// Send a notification now and record the combined outcome.
    ///
    /// A failed delivery is still recorded; the error carries the record id.
    pub async fn dispatch(&self, request: DispatchRequest) -> AppResult<DispatchOutcome> {
        request.validate(self.clock.now(), false)?;
        let plan = self.plan(&request)?;

        let record = NotificationRepository::create(&self.pool, request.to_create(None)).await?;
        tracing::info!(
            "Dispatching notification {} (email={}, push={})",
            record.id,
            record.email_action,
            record.push_action
        );

        let report = plan.execute(record.id).await;
        let summary = report.summary();
        let status = match NotificationRepository::complete(
            &self.pool,
            record.id,
            report.status(),
            &summary,
        )
        .await?
        {
            Some(updated) => updated.status,
            None => report.status(),
        };

        tracing::info!("Notification {} is {}", record.id, status.as_str());

        match status {
            NotificationStatus::Failed => Err(AppError::Delivery {
                id: record.id,
                message: summary,
            }),
            _ => Ok(DispatchOutcome {
                id: record.id,
                status,
                provider_response: summary,
            }),
        }
    }

    /// Persist a notification and queue it for delivery at `delivery_time`.
    pub async fn schedule_dispatch(&self, request: DispatchRequest) -> AppResult<ScheduleOutcome> {
        request.validate(self.clock.now(), true)?;
        let delivery_time = request.delivery_time.ok_or_else(|| {
            AppError::Validation(FieldErrors::single("delivery_time", "required"))
        })?;
        let plan = self.plan(&request)?;

        let record =
            NotificationRepository::create(&self.pool, request.to_create(Some(delivery_time)))
                .await?;
        let id = record.id;

        let service = self.clone();
        let action: JobAction = Box::new(move || service.run_scheduled(id, plan).boxed());

        if let Err(e) = self.scheduler.schedule(id, delivery_time, action) {
            tracing::warn!("Failed to register job for notification {}: {}", id, e);
            NotificationRepository::mark_registration_failed(&self.pool, id, &e.to_string())
                .await?;
            return Err(e);
        }

        let status = if NotificationRepository::mark_scheduled(&self.pool, id).await? {
            tracing::info!("Notification {} scheduled for {}", id, delivery_time);
            NotificationStatus::Scheduled
        } else {
            let status = self.stored_status(id).await?;
            tracing::debug!(
                "Notification {} left pending before it was marked scheduled ({})",
                id,
                status.as_str()
            );
            status
        };

        Ok(ScheduleOutcome {
            id,
            schedule_id: id,
            delivery_time,
            status,
        })
    }

    async fn run_scheduled(self, id: i64, plan: DeliveryPlan) {
        if let Err(e) = self.deliver_scheduled(id, &plan).await {
            tracing::error!("Scheduled notification {} could not complete: {:?}", id, e);
        }
    }

    async fn deliver_scheduled(&self, id: i64, plan: &DeliveryPlan) -> AppResult<()> {
        if !NotificationRepository::claim_for_delivery(&self.pool, id).await? {
            tracing::info!("Notification {} was canceled before delivery; skipping", id);
            return Ok(());
        }

        let report = plan.execute(id).await;
        match NotificationRepository::complete(&self.pool, id, report.status(), &report.summary())
            .await?
        {
            Some(updated) => {
                tracing::info!("Scheduled notification {} is {}", id, updated.status.as_str())
            }
            None => tracing::warn!(
                "Scheduled notification {} was already terminal; outcome not recorded",
                id
            ),
        }
        Ok(())
    }

    /// Cancel a queued notification.
    ///
    /// Canceling something that already fired, finished or was never
    /// scheduled succeeds without changes and reports the current status.
    pub async fn cancel_scheduled(&self, id: i64) -> AppResult<CancelOutcome> {
        let record = self.get(id).await?;

        let removed = self.scheduler.cancel(id);
        if let Some(canceled) = NotificationRepository::cancel(&self.pool, id).await? {
            tracing::info!("Notification {} canceled", id);
            return Ok(CancelOutcome {
                id,
                status: canceled.status,
                canceled: true,
            });
        }

        let current = NotificationRepository::find_by_id(&self.pool, id)
            .await?
            .unwrap_or(record);
        if removed {
            tracing::warn!(
                "Removed job {} but its record was no longer queued ({})",
                id,
                current.status.as_str()
            );
        }
        tracing::debug!(
            "Cancel of notification {} was a no-op ({})",
            id,
            current.status.as_str()
        );

        Ok(CancelOutcome {
            id,
            status: current.status,
            canceled: false,
        })
    }

    pub async fn get(&self, id: i64) -> AppResult<Notification> {
        NotificationRepository::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    async fn stored_status(&self, id: i64) -> AppResult<NotificationStatus> {
        Ok(self.get(id).await?.status)
    }

    /// Fail records a previous process left unfinished: queued jobs are gone
    /// and deliveries it had started never recorded a result.
    pub async fn reconcile_orphaned(&self) -> AppResult<u64> {
        let failed = NotificationRepository::fail_unfinished(&self.pool, RESTART_RESPONSE).await?;
        if failed > 0 {
            tracing::warn!(
                "Marked {} unfinished notification(s) as failed after restart",
                failed
            );
        }
        Ok(failed)
    }
}
