//! ReplayDispatcher - フォールバックストアのレコードを canonical に戻す
//!
//! # フロー（1 レコード）
//! 1. canonical ストアに再 insert（live と同じ検証経路）
//! 2. 新しい canonical ID を ReplayQueue に投入
//! 3. フォールバック側のコピーを削除
//!
//! step 1 が失敗したらレコードはフォールバックに残り、次の sweep で再試行する。
//! プロセス内で即座にリトライはしない（落ちているストアを叩き続けないため）。
//!
//! # 同時実行
//! - 同じレコードを 2 つのワーカーが同時にリプレイしないよう、プロセス内で claim を取る
//!   （claim の集合は action ごとに 1 つで、同じ action のディスパッチャはすべて共有する）
//! - プロセスをまたぐ場合は条件付き delete が最後の砦になる
//!
//! # ページング
//! ストアごとにカーソル（前回読んだ最後の ID）を持ち、次の sweep はその後ろから読む。
//! 末尾まで読んだらカーソルを戻す。失敗し続けるレコードが先頭に溜まっても、
//! 後ろのレコードは次の sweep で必ず読まれる。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::action::ResilientAction;
use crate::domain::{LoggedRecord, RecordId, ReplayFailure, SweepId, mask_url};
use crate::ports::{Datastore, IdGenerator, SystemClock, UlidGenerator};

/// Sweep の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// 1 ストアあたり 1 回の sweep で読む最大件数
    pub batch_size: usize,
    /// 同時にリプレイするレコード数の上限
    pub concurrency: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Moved to the canonical store; fallback copy deleted.
    Replayed { canonical_id: RecordId },
    /// Another worker holds the claim, or already moved the record.
    Skipped,
}

/// Result of one sweep over all fallback stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sweep_id: SweepId,
    pub scanned: usize,
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Fallback stores whose scan failed (masked URLs).
    pub unreachable_stores: Vec<String>,
}

impl SweepReport {
    fn new(sweep_id: SweepId) -> Self {
        Self {
            sweep_id,
            scanned: 0,
            replayed: 0,
            skipped: 0,
            failed: 0,
            unreachable_stores: Vec::new(),
        }
    }

    /// Nothing was left behind and every store could be read.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.unreachable_stores.is_empty()
    }
}

/// ReplayClaims はリプレイ中のレコード ID の集合
///
/// `ResilientAction` が 1 つ持ち、その action のディスパッチャすべてで共有する。
#[derive(Debug, Clone, Default)]
pub struct ReplayClaims {
    held: Arc<Mutex<HashSet<RecordId>>>,
}

impl ReplayClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, id: RecordId) -> bool {
        self.lock().contains(&id)
    }

    fn acquire(&self, id: RecordId) -> Option<ClaimGuard> {
        let inserted = self.lock().insert(id);
        inserted.then(|| ClaimGuard {
            claims: self.clone(),
            id,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<RecordId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim を保持している間だけレコードを占有する（drop で解放）
struct ClaimGuard {
    claims: ReplayClaims,
    id: RecordId,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.id);
    }
}

/// ReplayDispatcher はクローンして複数タスクで共有できる
#[derive(Clone)]
pub struct ReplayDispatcher {
    action: Arc<ResilientAction>,
    config: SweepConfig,
    /// store URL → 前回の sweep で読んだ最後の ID
    cursors: Arc<Mutex<HashMap<String, RecordId>>>,
    ids: Arc<dyn IdGenerator>,
}

impl ReplayDispatcher {
    pub fn new(action: Arc<ResilientAction>, config: SweepConfig) -> Self {
        Self {
            action,
            config,
            cursors: Arc::new(Mutex::new(HashMap::new())),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn action(&self) -> &Arc<ResilientAction> {
        &self.action
    }

    /// Replay one record sitting in `from`, a fallback store of this action.
    pub async fn replay(
        &self,
        from: &dyn Datastore,
        record: &LoggedRecord,
    ) -> Result<ReplayOutcome, ReplayFailure> {
        let Some(_claim) = self.action.replay_claims().acquire(record.id) else {
            debug!(record_id = %record.id, "record already claimed, skipping");
            return Ok(ReplayOutcome::Skipped);
        };
        // claim を取る前に別ワーカーが移し終えていることがある
        match from.contains(self.action.table(), record.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(record_id = %record.id, "record already moved, skipping");
                return Ok(ReplayOutcome::Skipped);
            }
            Err(source) => {
                return Err(ReplayFailure::Lookup {
                    record_id: record.id,
                    source,
                });
            }
        }

        let canonical = self.action.replay_into_canonical(record, from.url()).await?;

        match from.delete(self.action.table(), record.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(record_id = %record.id, "fallback copy already removed");
            }
            Err(source) => {
                return Err(ReplayFailure::Delete {
                    record_id: record.id,
                    canonical_id: canonical.id,
                    source,
                });
            }
        }

        info!(
            action = %self.action.name(),
            record_id = %record.id,
            canonical_id = %canonical.id,
            from = %mask_url(from.url()),
            "record replayed"
        );
        Ok(ReplayOutcome::Replayed {
            canonical_id: canonical.id,
        })
    }

    /// Scan every fallback store in priority order and replay what is found.
    ///
    /// Failures are counted and logged; they never abort the sweep.
    pub async fn sweep(&self) -> SweepReport {
        let sweep_id = self.ids.generate_sweep_id();
        let span = info_span!("sweep", %sweep_id, action = %self.action.name());
        self.sweep_inner(sweep_id).instrument(span).await
    }

    async fn sweep_inner(&self, sweep_id: SweepId) -> SweepReport {
        let mut report = SweepReport::new(sweep_id);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        for store in self.action.stores().iter().skip(1) {
            let url = mask_url(store.url());
            let after = self.cursor(store.url());
            let records = match store
                .scan(self.action.table(), after, self.config.batch_size)
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(store = %url, error = %e, "fallback store scan failed");
                    report.unreachable_stores.push(url);
                    continue;
                }
            };
            self.advance_cursor(store.url(), &records);
            if records.is_empty() {
                continue;
            }
            debug!(store = %url, count = records.len(), "replaying fallback records");
            report.scanned += records.len();

            let mut tasks = JoinSet::new();
            for record in records {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let this = self.clone();
                let store = store.clone();
                tasks.spawn(
                    async move {
                        let _permit = permit;
                        this.replay(store.as_ref(), &record).await
                    }
                    .in_current_span(),
                );
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(ReplayOutcome::Replayed { .. })) => report.replayed += 1,
                    Ok(Ok(ReplayOutcome::Skipped)) => report.skipped += 1,
                    Ok(Err(failure)) => {
                        report.failed += 1;
                        warn!(
                            record_id = %failure.record_id(),
                            error = %failure,
                            "replay failed, record stays in fallback store"
                        );
                    }
                    Err(join_error) => {
                        report.failed += 1;
                        error!(error = %join_error, "replay task aborted");
                    }
                }
            }
        }

        info!(
            scanned = report.scanned,
            replayed = report.replayed,
            skipped = report.skipped,
            failed = report.failed,
            unreachable = report.unreachable_stores.len(),
            "sweep finished"
        );
        report
    }

    fn cursor(&self, store_url: &str) -> Option<RecordId> {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store_url)
            .copied()
    }

    /// ページが埋まっていれば最後の ID まで進め、そうでなければ先頭に戻す
    fn advance_cursor(&self, store_url: &str, page: &[LoggedRecord]) {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        match page.last() {
            Some(last) if page.len() >= self.config.batch_size => {
                cursors.insert(store_url.to_string(), last.id);
            }
            _ => {
                cursors.remove(store_url);
            }
        }
    }
}
