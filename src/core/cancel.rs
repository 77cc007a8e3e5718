//! 取消注册表：run_id -> CancellationToken
//!
//! 由 RunEngine 实例持有（非全局状态）。同一 run_id 同时只能有一个登记；register 返回 RunRegistration 守卫，
//! Drop 时只移除自己登记的条目，保证成功 / 失败 / 取消任一路径退出都会清理。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::core::EngineError;

#[derive(Debug)]
struct Entry {
    generation: u64,
    token: CancellationToken,
}

/// 并发安全的取消注册表
#[derive(Debug, Default)]
pub struct CancelRegistry {
    runs: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记 run 的取消令牌；返回的守卫释放时自动注销
    ///
    /// run_id 已登记时返回 AlreadyRunning，原条目保持不变。
    pub fn register(
        self: &Arc<Self>,
        run_id: &str,
        token: CancellationToken,
    ) -> Result<RunRegistration, EngineError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut runs = self.runs();
            if runs.contains_key(run_id) {
                return Err(EngineError::AlreadyRunning(run_id.to_string()));
            }
            runs.insert(
                run_id.to_string(),
                Entry {
                    generation,
                    token: token.clone(),
                },
            );
        }
        tracing::debug!(run_id = %run_id, "run registered");
        Ok(RunRegistration {
            registry: Arc::clone(self),
            run_id: run_id.to_string(),
            generation,
            token,
        })
    }

    /// 触发取消；run 未登记时返回 NotRunning，不做其他事
    pub fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        let token = self.runs().get(run_id).map(|e| e.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "cancellation requested");
                Ok(())
            }
            None => Err(EngineError::NotRunning(run_id.to_string())),
        }
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.runs().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 仅当条目仍属于 generation 对应的登记时移除
    fn remove(&self, run_id: &str, generation: u64) {
        let mut runs = self.runs();
        if runs.get(run_id).is_some_and(|e| e.generation == generation) {
            runs.remove(run_id);
        }
    }
}

/// 注册守卫：Drop 时取消令牌并移除条目
#[derive(Debug)]
pub struct RunRegistration {
    registry: Arc<CancelRegistry>,
    run_id: String,
    generation: u64,
    token: CancellationToken,
}

impl RunRegistration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.token.cancel();
        self.registry.remove(&self.run_id, self.generation);
        tracing::debug!(run_id = %self.run_id, "run unregistered");
    }
}
