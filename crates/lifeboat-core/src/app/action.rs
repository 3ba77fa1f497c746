//! ResilientAction - 耐久書き込みのユースケースを組み立てる strategy オブジェクト
//!
//! 具体的なユースケース（webhook ロギングなど）は以下を差し込むだけで、
//! フォールバック・リプレイのオーケストレーションを共有できます。
//! - table 名（フォールバックストアでも同じスキーマを使う）
//! - 優先順位付きのストア一覧
//! - 「利用不可」とみなす StoreErrorKind の集合
//! - insert 前の検証・整形（RecordPolicy）
//! - リプレイ後の投入先（ReplayQueue）
//!
//! ログは `tracing` に流し、すべてのイベントに action 名を付けます。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::coordinator::WriteCoordinator;
use super::health::HealthMap;
use super::replay::ReplayClaims;
use crate::domain::{
    LoggedRecord, NewRecord, PersistenceFailure, ReplayFailure, StoreErrorKind, ValidationError,
    mask_url, meta,
};
use crate::ports::{Clock, Datastore, ReplayQueue, SystemClock};

/// Default per-store timeout.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// RecordPolicy は insert 前にフィールドを検証・整形する
///
/// live の insert とリプレイの再 insert の両方で同じ policy を通す。
pub trait RecordPolicy: Send + Sync {
    fn prepare(&self, record: NewRecord) -> Result<NewRecord, ValidationError>;
}

/// 何も検証しない policy
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RecordPolicy for AcceptAll {
    fn prepare(&self, record: NewRecord) -> Result<NewRecord, ValidationError> {
        Ok(record)
    }
}

/// BuildError は action 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("action '{0}' has no table name")]
    MissingTable(String),

    #[error("action '{0}' has no datastore")]
    NoStores(String),

    #[error("datastore '{0}' is registered twice")]
    DuplicateStore(String),

    #[error("action '{0}' has no replay queue")]
    MissingQueue(String),

    #[error("store timeout must be greater than zero")]
    ZeroTimeout,
}

/// ActionBuilder は ResilientAction を構築
///
/// # 使用例
/// ```ignore
/// let action = ResilientAction::builder("webhook_log")
///     .table("logged_webhooks")
///     .store(primary)
///     .store(fallback)
///     .queue(queue)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - table 名・ストア・キューが揃っていなければ BuildError
/// - 同じ URL のストアを二重に登録すると BuildError
pub struct ActionBuilder {
    name: String,
    table: Option<String>,
    stores: Vec<Arc<dyn Datastore>>,
    unavailable: HashSet<StoreErrorKind>,
    store_timeout: Duration,
    policy: Arc<dyn RecordPolicy>,
    queue: Option<Arc<dyn ReplayQueue>>,
    clock: Arc<dyn Clock>,
}

impl ActionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            stores: Vec::new(),
            unavailable: StoreErrorKind::DEFAULT_UNAVAILABLE.into_iter().collect(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            policy: Arc::new(AcceptAll),
            queue: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// ストアを追加する。呼び出し順が優先順位（最初が canonical）
    pub fn store(mut self, store: Arc<dyn Datastore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn stores<I>(mut self, stores: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Datastore>>,
    {
        self.stores.extend(stores);
        self
    }

    /// 「利用不可」とみなす kind を置き換える（Timeout は常に含まれる）
    pub fn treat_as_unavailable<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = StoreErrorKind>,
    {
        self.unavailable = kinds.into_iter().collect();
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn RecordPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(mut self, queue: Arc<dyn ReplayQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<ResilientAction, BuildError> {
        let table = match self.table {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(BuildError::MissingTable(self.name)),
        };
        if self.stores.is_empty() {
            return Err(BuildError::NoStores(self.name));
        }
        let mut seen = HashSet::new();
        for store in &self.stores {
            if !seen.insert(store.url()) {
                return Err(BuildError::DuplicateStore(mask_url(store.url())));
            }
        }
        let Some(queue) = self.queue else {
            return Err(BuildError::MissingQueue(self.name));
        };
        if self.store_timeout.is_zero() {
            return Err(BuildError::ZeroTimeout);
        }

        let coordinator = WriteCoordinator::new(
            self.name.clone(),
            self.stores,
            self.unavailable,
            self.store_timeout,
            self.clock.clone(),
        );
        info!(
            action = %self.name,
            table = %table,
            stores = coordinator.stores().len(),
            "resilient action ready"
        );
        Ok(ResilientAction {
            name: self.name,
            table,
            coordinator,
            policy: self.policy,
            queue,
            claims: ReplayClaims::new(),
            clock: self.clock,
        })
    }
}

/// ResilientAction は 1 つの耐久書き込みユースケース
pub struct ResilientAction {
    name: String,
    table: String,
    coordinator: WriteCoordinator,
    policy: Arc<dyn RecordPolicy>,
    queue: Arc<dyn ReplayQueue>,
    claims: ReplayClaims,
    clock: Arc<dyn Clock>,
}

impl ResilientAction {
    pub fn builder(name: impl Into<String>) -> ActionBuilder {
        ActionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// 優先順位順のストア（index 0 が canonical）
    pub fn stores(&self) -> &[Arc<dyn Datastore>] {
        self.coordinator.stores()
    }

    pub fn health(&self) -> &Arc<HealthMap> {
        self.coordinator.health()
    }

    pub fn store_timeout(&self) -> Duration {
        self.coordinator.store_timeout()
    }

    pub fn queue(&self) -> &Arc<dyn ReplayQueue> {
        &self.queue
    }

    /// この action のレコードに対するリプレイ中の claim（全ディスパッチャで共有）
    pub fn replay_claims(&self) -> &ReplayClaims {
        &self.claims
    }

    /// Validate, then persist into the first store that accepts the record.
    pub async fn insert(&self, record: NewRecord) -> Result<LoggedRecord, PersistenceFailure> {
        let record = self.policy.prepare(record).inspect_err(|e| {
            warn!(action = %self.name, error = %e, "record failed validation");
        })?;
        self.coordinator.insert(&self.table, record).await
    }

    /// Replay steps 1 and 2: re-insert into the canonical store through the
    /// live insert path, then hand the new canonical id to the replay queue.
    ///
    /// The caller deletes the fallback copy only after this returns `Ok`.
    pub async fn replay_into_canonical(
        &self,
        record: &LoggedRecord,
        from_store: &str,
    ) -> Result<LoggedRecord, ReplayFailure> {
        let record_id = record.id;
        let mut fields = NewRecord::from_logged(record);
        fields.annotate(meta::ORIGIN_ID, record_id.to_string());
        fields.annotate(meta::REPLAYED_FROM, mask_url(from_store));
        fields.annotate(meta::REPLAYED_AT, self.clock.now().to_rfc3339());

        let fields = self
            .policy
            .prepare(fields)
            .map_err(|e| ReplayFailure::Reinsert {
                record_id,
                source: e.into(),
            })?;
        let canonical = self
            .coordinator
            .insert_canonical(&self.table, fields)
            .await
            .map_err(|source| ReplayFailure::Reinsert { record_id, source })?;

        self.queue
            .push(&self.name, canonical.id)
            .await
            .map_err(|source| ReplayFailure::Enqueue {
                record_id,
                canonical_id: canonical.id,
                source,
            })?;
        Ok(canonical)
    }

    /// Ping every store in priority order. Each ping is bounded by the store timeout.
    pub async fn ping_all(&self) -> Vec<bool> {
        let mut results = Vec::with_capacity(self.stores().len());
        for store in self.stores() {
            let reachable = tokio::time::timeout(self.store_timeout(), store.ping())
                .await
                .unwrap_or(false);
            results.push(reachable);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryDatastore, InMemoryReplayQueue, StoreMode};

    struct RequireSource;

    impl RecordPolicy for RequireSource {
        fn prepare(&self, record: NewRecord) -> Result<NewRecord, ValidationError> {
            if record.metadata().contains_key(meta::SOURCE_IP) {
                Ok(record)
            } else {
                Err(ValidationError::MissingMetadata(meta::SOURCE_IP.to_string()))
            }
        }
    }

    fn store(url: &str) -> Arc<InMemoryDatastore> {
        Arc::new(InMemoryDatastore::new(url))
    }

    #[test]
    fn test_build_success() {
        let action = ResilientAction::builder("webhook_log")
            .table("logged_webhooks")
            .store(store("memory://a"))
            .store(store("memory://b"))
            .queue(Arc::new(InMemoryReplayQueue::new()))
            .build()
            .unwrap();
        assert_eq!(action.name(), "webhook_log");
        assert_eq!(action.stores().len(), 2);
        assert_eq!(action.stores()[0].url(), "memory://a");
    }

    #[test]
    fn test_build_missing_table() {
        let result = ResilientAction::builder("webhook_log")
            .store(store("memory://a"))
            .queue(Arc::new(InMemoryReplayQueue::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingTable(name)) if name == "webhook_log"));
    }

    #[test]
    fn test_build_no_stores() {
        let result = ResilientAction::builder("webhook_log")
            .table("t")
            .queue(Arc::new(InMemoryReplayQueue::new()))
            .build();
        assert!(matches!(result, Err(BuildError::NoStores(_))));
    }

    #[test]
    fn test_build_duplicate_store() {
        let result = ResilientAction::builder("webhook_log")
            .table("t")
            .store(store("postgres://u:pw@db/x"))
            .store(store("postgres://u:pw@db/x"))
            .queue(Arc::new(InMemoryReplayQueue::new()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::DuplicateStore(url)) if url == "postgres://u:***@db/x"
        ));
    }

    #[test]
    fn test_build_missing_queue() {
        let result = ResilientAction::builder("webhook_log")
            .table("t")
            .store(store("memory://a"))
            .build();
        assert!(matches!(result, Err(BuildError::MissingQueue(_))));
    }

    #[tokio::test]
    async fn policy_rejection_touches_no_store() {
        let primary = store("memory://a");
        let action = ResilientAction::builder("webhook_log")
            .table("t")
            .store(primary.clone())
            .policy(Arc::new(RequireSource))
            .queue(Arc::new(InMemoryReplayQueue::new()))
            .build()
            .unwrap();

        let err = action.insert(NewRecord::new("x")).await.unwrap_err();
        assert!(matches!(err, PersistenceFailure::Invalid(ValidationError::MissingMetadata(_))));
        assert_eq!(primary.insert_calls(), 0);
    }

    #[tokio::test]
    async fn replay_into_canonical_annotates_and_enqueues() {
        let canonical = store("memory://a");
        let fallback = store("memory://b");
        let queue = Arc::new(InMemoryReplayQueue::new());
        let action = ResilientAction::builder("webhook_log")
            .table("t")
            .store(canonical.clone())
            .store(fallback.clone())
            .queue(queue.clone())
            .build()
            .unwrap();

        let original = fallback
            .try_insert("t", NewRecord::new("p").with_meta(meta::SOURCE_IP, "1.2.3.4"))
            .await
            .unwrap();
        let replayed = action
            .replay_into_canonical(&original, fallback.url())
            .await
            .unwrap();

        assert_ne!(replayed.id, original.id);
        assert_eq!(replayed.payload(), original.payload());
        assert_eq!(replayed.origin_id(), Some(original.id));
        assert_eq!(replayed.meta(meta::REPLAYED_FROM), Some("memory://b"));
        assert_eq!(replayed.meta(meta::SOURCE_IP), Some("1.2.3.4"));
        assert!(replayed.meta(meta::REPLAYED_AT).is_some());
        assert_eq!(queue.enqueued("webhook_log"), vec![replayed.id]);
        // 削除は呼び出し側の責務
        assert_eq!(fallback.len("t"), 1);
    }

    #[tokio::test]
    async fn ping_all_reports_in_priority_order() {
        let a = store("memory://a");
        let b = store("memory://b");
        b.set_mode(StoreMode::Unavailable(StoreErrorKind::Connection));
        let action = ResilientAction::builder("webhook_log")
            .table("t")
            .store(a)
            .store(b)
            .queue(Arc::new(InMemoryReplayQueue::new()))
            .build()
            .unwrap();

        assert_eq!(action.ping_all().await, vec![true, false]);
    }
}
