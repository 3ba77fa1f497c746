//! InMemoryReplayQueue - 開発用のリプレイキュー
//!
//! # 学習ポイント
//! - Mutex + Condvar による blocking pop
//! - Async での blocking 処理の扱い（spawn_blocking）
//! - namespace による複数キューの管理

use crate::domain::{EnqueueError, RecordId};
use crate::ports::ReplayQueue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct QueueState {
    /// namespace ごとの未消費キュー
    pending: HashMap<String, VecDeque<RecordId>>,
    /// namespace ごとの push 履歴（pop しても消えない）
    history: HashMap<String, Vec<RecordId>>,
    /// 残り何回 push を失敗させるか
    fail_next: usize,
}

/// InMemoryReplayQueue は開発用のリプレイキュー
///
/// # 実装詳細
/// - namespace ごとに VecDeque<RecordId> を管理
/// - Mutex で排他制御、Condvar で push 時に pop 待ちを起こす
/// - `fail_next` で下流障害（step 2 の失敗）を再現できる
pub struct InMemoryReplayQueue {
    state: Arc<Mutex<QueueState>>,
    condvar: Arc<Condvar>,
}

impl InMemoryReplayQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// 次の `n` 回の push を `EnqueueError::Unavailable` にする
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).fail_next = n;
    }

    /// namespace に push された record_id（成功分のみ、push 順）
    pub fn enqueued(&self, ns: &str) -> Vec<RecordId> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryReplayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ReplayQueue for InMemoryReplayQueue {
    async fn push(&self, ns: &str, record_id: RecordId) -> Result<(), EnqueueError> {
        let state = self.state.clone();
        let condvar = self.condvar.clone();
        let ns = ns.to_string();

        tokio::task::spawn_blocking(move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(EnqueueError::Unavailable("injected failure".to_string()));
            }
            state.pending.entry(ns.clone()).or_default().push_back(record_id);
            state.history.entry(ns).or_default().push(record_id);

            // 待機中のスレッドに通知
            condvar.notify_all();
            Ok(())
        })
        .await
        .map_err(|e| EnqueueError::OperationFailed(format!("push failed: {e}")))?
    }

    async fn pop(&self, ns: &str, timeout: Duration) -> Result<Option<RecordId>, EnqueueError> {
        let state = self.state.clone();
        let condvar = self.condvar.clone();
        let ns = ns.to_string();
        tokio::task::spawn_blocking(move || {
            let start = std::time::Instant::now();
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(queue) = guard.pending.get_mut(&ns)
                    && let Some(record_id) = queue.pop_front()
                {
                    return Ok(Some(record_id));
                }
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Ok(None);
                }
                let remaining = timeout.saturating_sub(elapsed);
                let (new_guard, _) = condvar
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                guard = new_guard;
            }
        })
        .await
        .map_err(|e| EnqueueError::OperationFailed(format!("pop failed: {e}")))?
    }
}
