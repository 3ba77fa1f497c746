//! InMemoryDatastore - 開発用・テスト用のデータストア
//!
//! # 学習ポイント
//! - `std::sync::Mutex` は await をまたがない短いクリティカルセクションに使う
//! - 障害注入（StoreMode）でフォールバック経路を決定的にテストする
//! - 採番はストア側（IdGenerator）で行う

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{LoggedRecord, NewRecord, RecordId, StoreError, StoreErrorKind, mask_url};
use crate::ports::{Clock, Datastore, IdGenerator, SystemClock, UlidGenerator};

/// StoreMode は注入する障害
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    #[default]
    Available,
    /// すべての操作が指定 kind で失敗し、ping は false
    Unavailable(StoreErrorKind),
    /// 到達はできるが insert を指定 kind で拒否する
    Rejecting(StoreErrorKind),
    /// insert の前に待つ（その後は成功する）
    Slow(Duration),
}

type Tables = HashMap<String, BTreeMap<RecordId, LoggedRecord>>;

/// InMemoryDatastore は table ごとに BTreeMap を持つストア
///
/// 反復順は ID（ULID）順。同じストアが採番した ID は単調増加なので、
/// 1 つのストア内では挿入順と一致する。
pub struct InMemoryDatastore {
    url: String,
    tables: Mutex<Tables>,
    mode: Mutex<StoreMode>,
    delete_fault: Mutex<Option<StoreErrorKind>>,
    insert_calls: AtomicUsize,
    ids: Box<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDatastore {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_clock(url, Arc::new(SystemClock))
    }

    pub fn with_clock(url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            url: url.into(),
            tables: Mutex::new(HashMap::new()),
            mode: Mutex::new(StoreMode::Available),
            delete_fault: Mutex::new(None),
            insert_calls: AtomicUsize::new(0),
            ids: Box::new(UlidGenerator::new(clock.clone())),
            clock,
        }
    }

    pub fn set_mode(&self, mode: StoreMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn mode(&self) -> StoreMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `delete` だけを失敗させる（リプレイの step 3 障害の再現用）
    pub fn fail_deletes(&self, kind: Option<StoreErrorKind>) {
        *self.delete_fault.lock().unwrap_or_else(PoisonError::into_inner) = kind;
    }

    /// `try_insert` が呼ばれた回数（失敗も含む）
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self, table: &str) -> usize {
        self.lock_tables().get(table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// table の中身のスナップショット（ID 順）
    pub fn records(&self, table: &str) -> Vec<LoggedRecord> {
        self.lock_tables()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        match self.mode() {
            StoreMode::Unavailable(kind) => Err(self.error(kind, "store unreachable")),
            _ => Ok(()),
        }
    }

    fn error(&self, kind: StoreErrorKind, message: &str) -> StoreError {
        StoreError::new(kind, mask_url(&self.url), message)
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    fn url(&self) -> &str {
        &self.url
    }

    async fn try_insert(&self, table: &str, record: NewRecord) -> Result<LoggedRecord, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        match self.mode() {
            StoreMode::Unavailable(kind) => return Err(self.error(kind, "store unreachable")),
            StoreMode::Rejecting(kind) => return Err(self.error(kind, "insert rejected")),
            StoreMode::Slow(delay) => tokio::time::sleep(delay).await,
            StoreMode::Available => {}
        }

        let logged = record.into_logged(self.ids.generate_record_id(), self.clock.now());
        self.lock_tables()
            .entry(table.to_string())
            .or_default()
            .insert(logged.id, logged.clone());
        Ok(logged)
    }

    async fn ping(&self) -> bool {
        self.check_reachable().is_ok()
    }

    async fn scan(
        &self,
        table: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<LoggedRecord>, StoreError> {
        self.check_reachable()?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(self
            .lock_tables()
            .get(table)
            .map(|t| {
                t.range((lower, Bound::Unbounded))
                    .take(limit)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn contains(&self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        self.check_reachable()?;
        Ok(self
            .lock_tables()
            .get(table)
            .is_some_and(|t| t.contains_key(&id)))
    }

    async fn delete(&self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        self.check_reachable()?;
        if let Some(kind) = *self.delete_fault.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(self.error(kind, "delete failed"));
        }
        Ok(self
            .lock_tables()
            .get_mut(table)
            .is_some_and(|t| t.remove(&id).is_some()))
    }
}
