//! 资源锁 HTTP 处理器：获取、释放、续期、查询与统计。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::manager::{LockError, LockGrant, LockManager, LockRecord, LockStats};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AcquireRequest {
    resource: String,
    client_id: String,
    ttl: Option<i64>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AcquireResponse {
    acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_ms: Option<u64>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReleaseRequest {
    resource: String,
    token: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReleaseResponse {
    released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExtendRequest {
    resource: String,
    token: String,
    ttl: Option<i64>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExtendResponse {
    extended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// 锁记录加上剩余存活时间。
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LockView {
    #[serde(flatten)]
    lock: LockRecord,
    time_remaining: u64,
}

impl LockView {
    fn new(lock: LockRecord, now: i64) -> Self {
        let time_remaining = lock.remaining_ms(now);
        Self {
            lock,
            time_remaining,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientReleaseResponse {
    client_id: String,
    released: usize,
}

/// 获取资源锁；被占用时返回 409 与剩余时间。
pub async fn acquire_lock(
    Extension(manager): Extension<Arc<LockManager>>,
    payload: Result<Json<AcquireRequest>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<AcquireResponse>), ApiError> {
    let Json(payload) = payload?;
    match manager
        .acquire(&payload.resource, &payload.client_id, payload.ttl)
        .await
    {
        Ok(LockGrant {
            token,
            expires_in,
            expires_at,
        }) => {
            info!(
                resource = %payload.resource,
                client_id = %payload.client_id,
                ttl_ms = expires_in,
                "lock acquired"
            );
            Ok((
                StatusCode::OK,
                JsonResponse(AcquireResponse {
                    acquired: true,
                    token: Some(token),
                    expires_in: Some(expires_in),
                    expires_at: Some(expires_at),
                    error: None,
                    remaining_ms: None,
                }),
            ))
        }
        Err(LockError::Unavailable { remaining_ms }) => Ok((
            StatusCode::CONFLICT,
            JsonResponse(AcquireResponse {
                acquired: false,
                token: None,
                expires_in: None,
                expires_at: None,
                error: Some(LockError::Unavailable { remaining_ms }.to_string()),
                remaining_ms: Some(remaining_ms),
            }),
        )),
        Err(err) => Err(err.into()),
    }
}

/// 凭令牌释放资源锁。
pub async fn release_lock(
    Extension(manager): Extension<Arc<LockManager>>,
    payload: Result<Json<ReleaseRequest>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<ReleaseResponse>), ApiError> {
    let Json(payload) = payload?;
    match manager.release(&payload.resource, &payload.token).await {
        Ok(()) => {
            info!(resource = %payload.resource, "lock released");
            Ok((
                StatusCode::OK,
                JsonResponse(ReleaseResponse {
                    released: true,
                    error: None,
                }),
            ))
        }
        Err(err @ (LockError::NotFound | LockError::TokenMismatch)) => Ok((
            rejection_status(&err),
            JsonResponse(ReleaseResponse {
                released: false,
                error: Some(err.to_string()),
            }),
        )),
        Err(err) => Err(err.into()),
    }
}

/// 续期持有中的资源锁。
pub async fn extend_lock(
    Extension(manager): Extension<Arc<LockManager>>,
    payload: Result<Json<ExtendRequest>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<ExtendResponse>), ApiError> {
    let Json(payload) = payload?;
    match manager
        .extend(&payload.resource, &payload.token, payload.ttl)
        .await
    {
        Ok(grant) => {
            info!(resource = %payload.resource, ttl_ms = grant.expires_in, "lock extended");
            Ok((
                StatusCode::OK,
                JsonResponse(ExtendResponse {
                    extended: true,
                    expires_in: Some(grant.expires_in),
                    expires_at: Some(grant.expires_at),
                    error: None,
                }),
            ))
        }
        Err(err @ (LockError::NotFound | LockError::TokenMismatch)) => Ok((
            rejection_status(&err),
            JsonResponse(ExtendResponse {
                extended: false,
                expires_in: None,
                expires_at: None,
                error: Some(err.to_string()),
            }),
        )),
        Err(err) => Err(err.into()),
    }
}

/// 查询单个资源的锁信息。
pub async fn get_lock_info(
    Path(resource): Path<String>,
    Extension(manager): Extension<Arc<LockManager>>,
) -> Result<JsonResponse<LockView>, ApiError> {
    let lock = manager
        .lock_info(&resource)
        .await
        .ok_or(LockError::NotFound)?;
    Ok(JsonResponse(LockView::new(lock, manager.now_ms())))
}

/// 列出全部有效锁。
pub async fn list_locks(
    Extension(manager): Extension<Arc<LockManager>>,
) -> JsonResponse<Vec<LockView>> {
    let locks = manager.all_locks().await;
    let now = manager.now_ms();
    JsonResponse(
        locks
            .into_iter()
            .map(|lock| LockView::new(lock, now))
            .collect(),
    )
}

/// 强制释放某客户端的全部锁（客户端断开后的清理）。
pub async fn release_client_locks(
    Path(client_id): Path<String>,
    Extension(manager): Extension<Arc<LockManager>>,
) -> Result<JsonResponse<ClientReleaseResponse>, ApiError> {
    let released = manager.release_client_locks(&client_id).await?;
    info!(client_id = %client_id, count = released, "client locks force-released");
    Ok(JsonResponse(ClientReleaseResponse {
        client_id,
        released,
    }))
}

pub async fn get_lock_stats(
    Extension(manager): Extension<Arc<LockManager>>,
) -> JsonResponse<LockStats> {
    JsonResponse(manager.stats().await)
}

fn rejection_status(err: &LockError) -> StatusCode {
    match err {
        LockError::NotFound => StatusCode::NOT_FOUND,
        LockError::TokenMismatch => StatusCode::FORBIDDEN,
        LockError::Unavailable { .. } => StatusCode::CONFLICT,
        LockError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use axum::response::IntoResponse;

    use crate::manager::{ManualClock, TtlPolicy};

    fn make_manager() -> (Arc<ManualClock>, Arc<LockManager>) {
        let clock = ManualClock::new(1_000_000);
        let manager = Arc::new(LockManager::with_clock(
            TtlPolicy {
                default_ttl_ms: 30_000,
                max_ttl_ms: 300_000,
            },
            clock.clone(),
        ));
        (clock, manager)
    }

    async fn acquire(
        manager: &Arc<LockManager>,
        resource: &str,
        client_id: &str,
    ) -> (StatusCode, AcquireResponse) {
        let (status, JsonResponse(body)) = acquire_lock(
            Extension(manager.clone()),
            Ok(Json(AcquireRequest {
                resource: resource.to_string(),
                client_id: client_id.to_string(),
                ttl: None,
            })),
        )
        .await
        .unwrap_or_else(|_| panic!("acquire handler failed"));
        (status, body)
    }

    async fn release(
        manager: &Arc<LockManager>,
        resource: &str,
        token: &str,
    ) -> (StatusCode, ReleaseResponse) {
        let (status, JsonResponse(body)) = release_lock(
            Extension(manager.clone()),
            Ok(Json(ReleaseRequest {
                resource: resource.to_string(),
                token: token.to_string(),
            })),
        )
        .await
        .unwrap_or_else(|_| panic!("release handler failed"));
        (status, body)
    }

    #[tokio::test]
    async fn truck_lock_handoff_between_clients() {
        let (_clock, manager) = make_manager();

        let (status, first) = acquire(&manager, "camion-42", "c1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(first.acquired);
        assert_eq!(first.expires_in, Some(30_000));
        let token = first.token.expect("token");
        assert!(token.starts_with("lock-"));

        let (status, second) = acquire(&manager, "camion-42", "c2").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!second.acquired);
        assert!(
            second
                .error
                .as_deref()
                .is_some_and(|msg| msg.starts_with("Recurso bloqueado"))
        );
        assert_eq!(second.remaining_ms, Some(30_000));

        let (status, released) = release(&manager, "camion-42", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert!(released.released);

        let (status, third) = acquire(&manager, "camion-42", "c2").await;
        assert_eq!(status, StatusCode::OK);
        assert!(third.acquired);
    }

    #[tokio::test]
    async fn release_reports_not_found_and_token_mismatch() {
        let (_clock, manager) = make_manager();

        let (status, body) = release(&manager, "missing", "lock-x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.released);
        assert_eq!(body.error.as_deref(), Some("Lock no encontrado"));

        acquire(&manager, "r", "c1").await;
        let (status, body) = release(&manager, "r", "lock-wrong").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body.released);
        assert!(manager.lock_info("r").await.is_some());
    }

    #[tokio::test]
    async fn acquire_rejects_empty_resource() {
        let (_clock, manager) = make_manager();
        let result = acquire_lock(
            Extension(manager),
            Ok(Json(AcquireRequest {
                resource: String::new(),
                client_id: "c1".to_string(),
                ttl: None,
            })),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    async fn parse_body<T>(body: &'static str) -> Result<Json<T>, JsonRejection>
    where
        T: serde::de::DeserializeOwned,
    {
        let request = Request::builder()
            .method("POST")
            .uri("/api/locks/acquire")
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(body))
            .expect("build request");
        Json::<T>::from_request(request, &()).await
    }

    #[tokio::test]
    async fn malformed_acquire_body_is_bad_request() {
        let (_clock, manager) = make_manager();
        for body in [
            r#"{"resource":"camion-42"}"#,
            r#"{"resource":"camion-42","clientId":"c1","ttl":100.5}"#,
            r#"{"resource":"camion-42","clientId":"c1","ttl":"30s"}"#,
            r#"{"resource":"camion-42","clientId":"c1","ttl":99999999999999999999}"#,
        ] {
            let result = acquire_lock(
                Extension(manager.clone()),
                parse_body::<AcquireRequest>(body).await,
            )
            .await;
            assert!(
                matches!(result, Err(ApiError::BadRequest(_))),
                "body {body} should be rejected"
            );
        }
        assert_eq!(manager.stats().await.total_locks, 0);
    }

    #[tokio::test]
    async fn malformed_release_and_extend_bodies_are_bad_request() {
        let (_clock, manager) = make_manager();
        let released = release_lock(
            Extension(manager.clone()),
            parse_body::<ReleaseRequest>(r#"{"resource":"r"}"#).await,
        )
        .await;
        assert!(matches!(released, Err(ApiError::BadRequest(_))));

        let extended = extend_lock(
            Extension(manager.clone()),
            parse_body::<ExtendRequest>(r#"{"resource":"r","token":"lock-x","ttl":1.5}"#).await,
        )
        .await;
        assert!(matches!(extended, Err(ApiError::BadRequest(_))));

        let response = ApiError::from(
            parse_body::<ReleaseRequest>("not json")
                .await
                .expect_err("invalid json"),
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn acquire_rejects_non_positive_ttl() {
        let (_clock, manager) = make_manager();
        let result = acquire_lock(
            Extension(manager),
            Ok(Json(AcquireRequest {
                resource: "r".to_string(),
                client_id: "c1".to_string(),
                ttl: Some(0),
            })),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn info_returns_time_remaining_then_not_found_after_expiry() {
        let (clock, manager) = make_manager();
        acquire(&manager, "r", "c1").await;
        clock.advance(10_000);

        let JsonResponse(view) = get_lock_info(Path("r".to_string()), Extension(manager.clone()))
            .await
            .unwrap_or_else(|_| panic!("info handler failed"));
        assert_eq!(view.time_remaining, 20_000);

        let value = serde_json::to_value(&view).expect("serialize view");
        assert_eq!(value["resource"], "r");
        assert_eq!(value["clientId"], "c1");
        assert_eq!(value["timeRemaining"], 20_000);
        assert!(value["acquiredAt"].is_i64());

        clock.advance(20_000);
        let result = get_lock_info(Path("r".to_string()), Extension(manager)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_only_contains_active_locks() {
        let (clock, manager) = make_manager();
        acquire(&manager, "b", "c1").await;
        let (status, _) = acquire_lock(
            Extension(manager.clone()),
            Ok(Json(AcquireRequest {
                resource: "a".to_string(),
                client_id: "c2".to_string(),
                ttl: Some(50),
            })),
        )
        .await
        .unwrap_or_else(|_| panic!("acquire handler failed"));
        assert_eq!(status, StatusCode::OK);
        clock.advance(50);

        let JsonResponse(views) = list_locks(Extension(manager)).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].lock.resource, "b");
        assert_eq!(views[0].time_remaining, 29_950);
    }

    #[tokio::test]
    async fn client_release_and_stats() {
        let (_clock, manager) = make_manager();
        acquire(&manager, "R1", "A").await;
        acquire(&manager, "R2", "A").await;
        acquire(&manager, "R3", "B").await;

        let JsonResponse(before) = get_lock_stats(Extension(manager.clone())).await;
        let value = serde_json::to_value(&before).expect("serialize stats");
        assert_eq!(value["totalLocks"], 3);
        assert_eq!(value["activeLocks"], 3);
        assert_eq!(value["expiredLocks"], 0);
        assert_eq!(value["locksByClient"]["A"], 2);

        let JsonResponse(body) =
            release_client_locks(Path("A".to_string()), Extension(manager.clone()))
                .await
                .unwrap_or_else(|_| panic!("client release failed"));
        assert_eq!(body.released, 2);

        let JsonResponse(after) = get_lock_stats(Extension(manager)).await;
        assert_eq!(after.total_locks, 1);
        assert_eq!(after.locks_by_client.get("B"), Some(&1));
    }

    #[tokio::test]
    async fn extend_keeps_lock_alive() {
        let (clock, manager) = make_manager();
        let (_, body) = acquire(&manager, "r", "c1").await;
        let token = body.token.expect("token");
        clock.advance(25_000);

        let (status, JsonResponse(extended)) = extend_lock(
            Extension(manager.clone()),
            Ok(Json(ExtendRequest {
                resource: "r".to_string(),
                token: token.clone(),
                ttl: Some(60_000),
            })),
        )
        .await
        .unwrap_or_else(|_| panic!("extend handler failed"));
        assert_eq!(status, StatusCode::OK);
        assert!(extended.extended);
        assert_eq!(extended.expires_in, Some(60_000));

        clock.advance(30_000);
        let (status, body) = release(&manager, "r", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.released);
    }
}
