//! 过期锁的周期性清扫任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::manager::LockManager;

/// 启动后台清扫任务，返回句柄以便关停时中止。
pub fn spawn_lock_sweeper(manager: Arc<LockManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = manager.sweep().await;
            if removed > 0 {
                debug!(count = removed, "swept expired locks");
            }
        }
    })
}
