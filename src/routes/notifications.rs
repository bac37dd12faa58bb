use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Notification, NotificationStatus};
use crate::db::repository::{NotificationFilter, NotificationRepository};
use crate::error::{AppError, AppResult, FieldErrors};
use crate::services::dispatch::{
    CancelOutcome, DispatchOutcome, DispatchRequest, DispatchService, ScheduleOutcome,
};
use crate::services::providers::ProviderCredentials;
use crate::services::push::ServiceAccountKey;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/stats", get(get_notification_stats))
        .route("/send", post(send_notification))
        .route("/schedule", post(schedule_notification))
        .route("/scheduled/:id", delete(cancel_scheduled_notification))
        .route("/:id", get(get_notification))
}

// ============================================================================
// Credential headers
// ============================================================================

pub const EMAIL_SERVICE_HEADER: &str = "x-email-service";
pub const EMAIL_SERVICE_API_KEY_HEADER: &str = "x-email-service-api-key";
pub const EMAIL_SERVICE_API_SECRET_HEADER: &str = "x-email-service-api-secret";

/// Email provider name and credentials supplied as request headers.
///
/// Used only for fields the JSON body leaves out.
#[derive(Debug, Default)]
pub struct CredentialHeaders {
    pub service: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

fn header_value(parts: &Parts, name: &str) -> AppResult<Option<String>> {
    match parts.headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim().to_string()).filter(|v| !v.is_empty()))
            .map_err(|_| {
                tracing::debug!("Header {} is not valid UTF-8", name);
                AppError::BadRequest(format!("Header {} is not valid text", name))
            }),
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CredentialHeaders {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(CredentialHeaders {
            service: header_value(parts, EMAIL_SERVICE_HEADER)?,
            api_key: header_value(parts, EMAIL_SERVICE_API_KEY_HEADER)?,
            api_secret: header_value(parts, EMAIL_SERVICE_API_SECRET_HEADER)?,
        })
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct NotificationRequest {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub recipient_list: Vec<String>,
    pub token: Option<String>,
    #[serde(default)]
    pub mail_action: bool,
    #[serde(default)]
    pub firebase_action: bool,
    pub email_service_name: Option<String>,
    pub email_service_api_key: Option<String>,
    pub email_service_api_secret: Option<String>,
    /// Service-account key, either as a JSON object or as a JSON-encoded string.
    pub push_credentials: Option<serde_json::Value>,
    /// RFC 3339 timestamp; only used when scheduling.
    pub delivery_time: Option<String>,
}

impl NotificationRequest {
    fn into_dispatch_request(self, headers: CredentialHeaders) -> AppResult<DispatchRequest> {
        let delivery_time = match self.delivery_time.as_deref() {
            None => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| {
                        AppError::Validation(FieldErrors::single(
                            "delivery_time",
                            "must be an RFC 3339 timestamp",
                        ))
                    })?,
            ),
        };

        let push_credentials = match self.push_credentials {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(raw)) => Some(ServiceAccountKey::from_json(&raw)?),
            Some(value) => Some(serde_json::from_value(value).map_err(|e| {
                AppError::BadRequest(format!("Invalid push credentials: {}", e))
            })?),
        };

        Ok(DispatchRequest {
            subject: self.subject,
            message: self.message,
            recipients: self.recipient_list,
            push_token: self.token,
            email_action: self.mail_action,
            push_action: self.firebase_action,
            email_service: self.email_service_name.or(headers.service),
            credentials: ProviderCredentials {
                api_key: self.email_service_api_key.or(headers.api_key),
                api_secret: self.email_service_api_secret.or(headers.api_secret),
            },
            push_credentials,
            delivery_time,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<String>,
    pub scheduled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsListResponse {
    pub items: Vec<NotificationResponse>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub id: i64,
    pub subject: String,
    pub message: String,
    pub recipient_list: Vec<String>,
    pub mail_action: bool,
    pub firebase_action: bool,
    pub provider: Option<String>,
    pub scheduled: bool,
    pub delivery_time: Option<NaiveDateTime>,
    pub status: String,
    pub schedule_state: String,
    pub provider_response: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<Notification> for NotificationResponse {
    fn from(n: Notification) -> Self {
        NotificationResponse {
            id: n.id,
            subject: n.subject,
            message: n.body,
            recipient_list: n.recipients,
            mail_action: n.email_action,
            firebase_action: n.push_action,
            provider: n.provider,
            scheduled: n.scheduled,
            delivery_time: n.delivery_time,
            status: n.status.as_str().to_string(),
            schedule_state: n.schedule_state.as_str().to_string(),
            provider_response: n.provider_response,
            created_at: n.created_at,
            updated_at: n.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationStatsResponse {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    /// Jobs currently waiting in the in-process scheduler.
    pub queued_jobs: usize,
    /// Distinct push credential sets with an initialized client.
    pub push_clients: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Send a notification immediately
async fn send_notification(
    State(state): State<Arc<AppState>>,
    headers: CredentialHeaders,
    Json(body): Json<NotificationRequest>,
) -> AppResult<Json<DispatchOutcome>> {
    let request = body.into_dispatch_request(headers)?;
    let outcome = DispatchService::from_state(&state).dispatch(request).await?;
    Ok(Json(outcome))
}

/// Store a notification and queue it for later delivery
async fn schedule_notification(
    State(state): State<Arc<AppState>>,
    headers: CredentialHeaders,
    Json(body): Json<NotificationRequest>,
) -> AppResult<(StatusCode, Json<ScheduleOutcome>)> {
    let request = body.into_dispatch_request(headers)?;
    let outcome = DispatchService::from_state(&state)
        .schedule_dispatch(request)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Cancel a scheduled notification
async fn cancel_scheduled_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<CancelOutcome>> {
    let outcome = DispatchService::from_state(&state)
        .cancel_scheduled(id)
        .await?;
    Ok(Json(outcome))
}

/// Fetch one notification record
async fn get_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<NotificationResponse>> {
    let notification = DispatchService::from_state(&state).get(id).await?;
    Ok(Json(notification.into()))
}

/// List notification records, newest first
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1).saturating_mul(per_page);

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(NotificationStatus::try_from(raw).map_err(|e| {
            AppError::Validation(FieldErrors::single("status", e))
        })?),
    };

    let filter = NotificationFilter {
        status,
        scheduled: query.scheduled,
        limit: Some(per_page),
        offset: Some(offset),
    };

    let (notifications, total) = tokio::try_join!(
        NotificationRepository::list(&state.db, &filter),
        NotificationRepository::count(&state.db, &filter)
    )?;

    let total_pages = (total as f64 / per_page as f64).ceil() as i64;

    Ok(Json(NotificationsListResponse {
        items: notifications.into_iter().map(Into::into).collect(),
        total,
        page,
        per_page,
        total_pages,
    }))
}

/// Record counts per status
async fn get_notification_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<NotificationStatsResponse>> {
    let by_status = NotificationRepository::counts_by_status(&state.db).await?;

    Ok(Json(NotificationStatsResponse {
        total: by_status.values().sum(),
        by_status,
        queued_jobs: state.scheduler.len(),
        push_clients: state.registry.push_client_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{test_state, StubEmailBackend, StubPushBackend};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        crate::routes::api_router().with_state(state)
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn mailjet_body() -> Value {
        json!({
            "subject": "Hi",
            "message": "Test",
            "recipient_list": ["a@x.com"],
            "mail_action": true,
            "email_service_name": "Mailjet",
            "email_service_api_key": "k",
            "email_service_api_secret": "s"
        })
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::succeeding(),
        )
        .await;
        let (status, body) = call(app(state), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn send_delivers_and_records() {
        let email = StubEmailBackend::succeeding();
        let (state, _shutdown) = test_state(email.clone(), StubPushBackend::succeeding()).await;

        let (status, body) = call(
            app(state.clone()),
            post_json("/api/notifications/send", mailjet_body()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(email.calls(), 1);

        let id = body["id"].as_i64().unwrap();
        let (status, record) = call(app(state), get(&format!("/api/notifications/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "sent");
        assert_eq!(record["provider"], "Mailjet");
        assert_eq!(record["recipient_list"], json!(["a@x.com"]));
    }

    #[tokio::test]
    async fn credentials_fall_back_to_headers() {
        let email = StubEmailBackend::succeeding();
        let (state, _shutdown) = test_state(email.clone(), StubPushBackend::succeeding()).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/notifications/send")
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Email-Service", "SendGrid")
            .header("X-Email-Service-API-Key", "sg-key")
            .body(Body::from(
                json!({
                    "subject": "Hi",
                    "message": "Test",
                    "recipient_list": ["a@x.com"],
                    "mail_action": true
                })
                .to_string(),
            ))
            .unwrap();

        let (status, body) = call(app(state), request).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_bad_request() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::succeeding(),
        )
        .await;

        let mut body = mailjet_body();
        body["email_service_name"] = json!("Pigeon");
        let (status, body) = call(app(state), post_json("/api/notifications/send", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "UNSUPPORTED_PROVIDER");
    }

    #[tokio::test]
    async fn failed_delivery_is_bad_gateway_with_record_id() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::failing("FCM API error (404): UNREGISTERED"),
        )
        .await;

        let mut body = mailjet_body();
        body["firebase_action"] = json!(true);
        body["token"] = json!("device-1");
        body["push_credentials"] = json!({
            "project_id": "demo",
            "client_email": "svc@demo.iam.gserviceaccount.com",
            "private_key": "pem"
        });

        let (status, body) = call(app(state), post_json("/api/notifications/send", body)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "DELIVERY_ERROR");
        assert_eq!(body["error"]["details"]["status"], "failed");
        assert!(body["error"]["details"]["id"].is_i64());
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("UNREGISTERED"));
    }

    #[tokio::test]
    async fn schedule_rejects_past_and_malformed_times() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::succeeding(),
        )
        .await;

        let mut body = mailjet_body();
        body["delivery_time"] = json!("2020-01-01T00:00:00Z");
        let (status, resp) = call(
            app(state.clone()),
            post_json("/api/notifications/schedule", body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(resp["error"]["code"], "VALIDATION_ERROR");
        assert!(resp["error"]["details"]["delivery_time"].is_array());

        body["delivery_time"] = json!("tomorrow");
        let (status, resp) =
            call(app(state), post_json("/api/notifications/schedule", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(resp["error"]["details"]["delivery_time"].is_array());
    }

    #[tokio::test]
    async fn schedule_then_cancel() {
        let email = StubEmailBackend::succeeding();
        let (state, _shutdown) = test_state(email.clone(), StubPushBackend::succeeding()).await;

        let mut body = mailjet_body();
        body["delivery_time"] = json!((Utc::now() + chrono::Duration::hours(1)).to_rfc3339());
        let (status, scheduled) = call(
            app(state.clone()),
            post_json("/api/notifications/schedule", body),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(scheduled["status"], "scheduled");
        assert_eq!(scheduled["schedule_id"], scheduled["id"]);

        let id = scheduled["id"].as_i64().unwrap();
        let cancel = Request::builder()
            .method("DELETE")
            .uri(format!("/api/notifications/scheduled/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, canceled) = call(app(state.clone()), cancel).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["canceled"], true);
        assert_eq!(canceled["status"], "canceled");
        assert_eq!(state.scheduler.len(), 0);
        assert_eq!(email.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_is_not_found() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::succeeding(),
        )
        .await;

        let cancel = Request::builder()
            .method("DELETE")
            .uri("/api/notifications/scheduled/999")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(state), cancel).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn list_filters_and_stats() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::succeeding(),
        )
        .await;

        for _ in 0..3 {
            let (status, _) = call(
                app(state.clone()),
                post_json("/api/notifications/send", mailjet_body()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, page) = call(
            app(state.clone()),
            get("/api/notifications?per_page=2&status=sent"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 3);
        assert_eq!(page["total_pages"], 2);
        assert_eq!(page["items"].as_array().unwrap().len(), 2);

        let (status, body) = call(app(state.clone()), get("/api/notifications?status=bogus")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"]["details"]["status"].is_array());

        let (status, stats) = call(app(state), get("/api/notifications/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["by_status"]["sent"], 3);
        assert_eq!(stats["queued_jobs"], 0);
        assert_eq!(stats["push_clients"], 0);
    }

    #[tokio::test]
    async fn huge_page_number_is_an_empty_page() {
        let (state, _shutdown) = test_state(
            StubEmailBackend::succeeding(),
            StubPushBackend::succeeding(),
        )
        .await;
        let (status, _) = call(
            app(state.clone()),
            post_json("/api/notifications/send", mailjet_body()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, page) = call(
            app(state),
            get("/api/notifications?page=9223372036854775807&per_page=100"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert!(page["items"].as_array().unwrap().is_empty());
    }
}
