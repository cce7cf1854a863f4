//! 服务状态：构建信息、锁策略与当前锁数量。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::manager::LockManager;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
    default_ttl_ms: u64,
    max_ttl_ms: u64,
    active_locks: usize,
}

/// 返回版本信息与锁表概况。
pub async fn get_status(
    Extension(manager): Extension<Arc<LockManager>>,
) -> JsonResponse<ServiceStatus> {
    let policy = manager.policy();
    let stats = manager.stats().await;
    JsonResponse(ServiceStatus {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
        default_ttl_ms: policy.default_ttl_ms,
        max_ttl_ms: policy.max_ttl_ms,
        active_locks: stats.active_locks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TtlPolicy;

    #[tokio::test]
    async fn status_reports_policy_and_active_locks() {
        let manager = Arc::new(LockManager::new(TtlPolicy {
            default_ttl_ms: 1_000,
            max_ttl_ms: 5_000,
        }));
        manager.acquire("r", "c1", None).await.expect("acquire");

        let JsonResponse(status) = get_status(Extension(manager)).await;
        let value = serde_json::to_value(&status).expect("serialize status");
        assert_eq!(value["defaultTtlMs"], 1_000);
        assert_eq!(value["maxTtlMs"], 5_000);
        assert_eq!(value["activeLocks"], 1);
        assert_eq!(value["version"], crate::build::PKG_VERSION);
    }
}
