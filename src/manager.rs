//! 进程内资源锁表：按资源名互斥、TTL 惰性过期与所有权令牌校验。
//!
//! 所有操作在同一把 `tokio::sync::Mutex` 下完成“检查-写入”，因此 `acquire`
//! 对其他调用是原子的。过期完全惰性判定（读取时视为不存在）并由后台清扫
//! 任务周期性回收，不为单个锁挂定时器。

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// 毫秒级时间源。
pub trait Clock: Send + Sync + fmt::Debug {
    /// 当前 Unix 毫秒时间戳。
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 锁的默认 TTL 与上限（毫秒）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub default_ttl_ms: u64,
    pub max_ttl_ms: u64,
}

/// 单个资源的独占锁记录，对外只暴露副本。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub resource: String,
    pub token: String,
    pub client_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl LockRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ms(&self, now: i64) -> u64 {
        u64::try_from(self.expires_at.saturating_sub(now)).unwrap_or(0)
    }
}

/// acquire/extend 成功后返回给持有者的凭据。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub token: String,
    pub expires_in: u64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStats {
    pub total_locks: usize,
    pub active_locks: usize,
    pub expired_locks: usize,
    pub locks_by_client: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    Unavailable { remaining_ms: u64 },
    NotFound,
    TokenMismatch,
    InvalidArgument(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Unavailable { remaining_ms } => {
                write!(f, "Recurso bloqueado. Tiempo restante: {remaining_ms}ms")
            }
            LockError::NotFound => f.write_str("Lock no encontrado"),
            LockError::TokenMismatch => f.write_str("Token inválido"),
            LockError::InvalidArgument(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for LockError {}

/// 按资源名管理独占锁的锁表。
#[derive(Debug)]
pub struct LockManager {
    locks: Mutex<HashMap<String, LockRecord>>,
    policy: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    /// 使用系统时钟创建锁管理器。
    pub fn new(policy: TtlPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: TtlPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// 尝试获取资源锁；资源被未过期的锁占用时立即失败，不排队、不阻塞。
    pub async fn acquire(
        &self,
        resource: &str,
        client_id: &str,
        ttl_ms: Option<i64>,
    ) -> Result<LockGrant, LockError> {
        require_non_empty("resource", resource)?;
        require_non_empty("clientId", client_id)?;
        let ttl = self.resolve_ttl(ttl_ms)?;

        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        if let Some(existing) = locks.get(resource)
            && !existing.is_expired(now)
        {
            return Err(LockError::Unavailable {
                remaining_ms: existing.remaining_ms(now),
            });
        }

        let record = LockRecord {
            resource: resource.to_string(),
            token: generate_token(now),
            client_id: client_id.to_string(),
            acquired_at: now,
            expires_at: expires_at(now, ttl),
        };
        let grant = LockGrant {
            token: record.token.clone(),
            expires_in: ttl,
            expires_at: record.expires_at,
        };
        if let Some(stale) = locks.insert(resource.to_string(), record) {
            debug!(resource, previous_client = %stale.client_id, "replaced expired lock");
        }
        debug!(resource, client_id, ttl_ms = ttl, "lock acquired");
        Ok(grant)
    }

    /// 凭令牌释放锁。
    pub async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        require_non_empty("resource", resource)?;
        require_non_empty("token", token)?;

        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        let lock = active_entry(&mut locks, resource, now).ok_or(LockError::NotFound)?;
        if lock.token != token {
            warn!(resource, "release rejected: token mismatch");
            return Err(LockError::TokenMismatch);
        }
        if let Some(removed) = locks.remove(resource) {
            debug!(resource, client_id = %removed.client_id, "lock released");
        }
        Ok(())
    }

    /// 续期持有中的锁：令牌与获取时间不变，过期时间重置为 now + ttl。
    pub async fn extend(
        &self,
        resource: &str,
        token: &str,
        ttl_ms: Option<i64>,
    ) -> Result<LockGrant, LockError> {
        require_non_empty("resource", resource)?;
        require_non_empty("token", token)?;
        let ttl = self.resolve_ttl(ttl_ms)?;

        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        let lock = active_entry(&mut locks, resource, now).ok_or(LockError::NotFound)?;
        if lock.token != token {
            warn!(resource, "extend rejected: token mismatch");
            return Err(LockError::TokenMismatch);
        }
        lock.expires_at = expires_at(now, ttl);
        debug!(resource, client_id = %lock.client_id, ttl_ms = ttl, "lock extended");
        Ok(LockGrant {
            token: lock.token.clone(),
            expires_in: ttl,
            expires_at: lock.expires_at,
        })
    }

    /// 查询资源当前的锁；已过期的记录顺带清除。
    pub async fn lock_info(&self, resource: &str) -> Option<LockRecord> {
        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        active_entry(&mut locks, resource, now).cloned()
    }

    /// 列出全部有效锁（按资源名排序），过期记录在遍历中清除。
    pub async fn all_locks(&self) -> Vec<LockRecord> {
        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        locks.retain(|_, lock| !lock.is_expired(now));
        let mut active: Vec<LockRecord> = locks.values().cloned().collect();
        active.sort_by(|a, b| a.resource.cmp(&b.resource));
        active
    }

    /// 强制释放某客户端持有的全部锁，不校验令牌。
    ///
    /// 返回值只计入仍有效的锁；同一遍历中顺带清除所有过期记录。
    pub async fn release_client_locks(&self, client_id: &str) -> Result<usize, LockError> {
        require_non_empty("clientId", client_id)?;

        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        let mut released = 0;
        locks.retain(|_, lock| {
            if lock.is_expired(now) {
                return false;
            }
            if lock.client_id == client_id {
                released += 1;
                return false;
            }
            true
        });
        if released > 0 {
            debug!(client_id, count = released, "client locks released");
        }
        Ok(released)
    }

    /// 锁表快照统计，不清除任何记录。
    ///
    /// `locks_by_client` 统计全部存量记录，包括尚未被清扫的过期锁。
    pub async fn stats(&self) -> LockStats {
        let locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        let mut stats = LockStats {
            total_locks: locks.len(),
            active_locks: 0,
            expired_locks: 0,
            locks_by_client: BTreeMap::new(),
        };
        for lock in locks.values() {
            if lock.is_expired(now) {
                stats.expired_locks += 1;
            } else {
                stats.active_locks += 1;
            }
            *stats
                .locks_by_client
                .entry(lock.client_id.clone())
                .or_insert(0) += 1;
        }
        stats
    }

    /// 清除所有过期记录，返回清除数量。
    pub async fn sweep(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let now = self.clock.now_ms();
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired(now));
        before - locks.len()
    }

    fn resolve_ttl(&self, ttl_ms: Option<i64>) -> Result<u64, LockError> {
        match ttl_ms {
            None => Ok(self.policy.default_ttl_ms.min(self.policy.max_ttl_ms)),
            Some(value) if value <= 0 => Err(LockError::InvalidArgument(
                "ttl must be a positive number of milliseconds".into(),
            )),
            Some(value) => Ok((value as u64).min(self.policy.max_ttl_ms)),
        }
    }
}

fn active_entry<'a>(
    locks: &'a mut HashMap<String, LockRecord>,
    resource: &str,
    now: i64,
) -> Option<&'a mut LockRecord> {
    if locks.get(resource).is_some_and(|lock| lock.is_expired(now)) {
        locks.remove(resource);
        debug!(resource, "expired lock removed");
        return None;
    }
    locks.get_mut(resource)
}

fn require_non_empty(field: &str, value: &str) -> Result<(), LockError> {
    if value.trim().is_empty() {
        return Err(LockError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

fn expires_at(now: i64, ttl: u64) -> i64 {
    now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))
}

fn generate_token(now: i64) -> String {
    format!("lock-{now}-{}", Uuid::new_v4().simple())
}

/// 测试用的手动推进时钟。
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: std::sync::atomic::AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: i64) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::atomic::AtomicI64::new(start),
        })
    }

    pub(crate) fn advance(&self, ms: i64) {
        self.now
            .fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}
