//! WriteCoordinator - 優先順位付きストアへのフォールバック書き込み
//!
//! # フロー
//! 1. index 0（canonical）から順にストアを試す（並列にはしない）
//! 2. 成功したら即座に返す（first success wins、二重書き込みしない）
//! 3. 「利用不可」と宣言された kind のエラーなら unhealthy を記録して次へ
//! 4. それ以外のエラーはデータの問題なので、フォールバックせずに即座に返す
//! 5. 全ストアが利用不可なら `AllStoresExhausted`
//!
//! live insert は最初の試行の前に `capture_id` を付ける。timeout 後に遅れて書かれた
//! コピーも同じ値を持つので、下流はそれで重複を判定できる。
//! リプレイの再 insert は live の `inserted_at` / `insert_attempt` / 試行履歴を
//! そのまま残し、`replay_inserted_at` だけを付ける。
//!
//! # Timeout
//! 各試行は spawn したタスクで実行し、`store_timeout` だけ待つ。
//! 待ちきれなくてもタスクはキャンセルしない（完了するかエラーになるまで走る）。
//! timeout は常に利用不可として扱う。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::health::HealthMap;
use crate::domain::{
    LoggedRecord, NewRecord, PersistenceFailure, StoreError, StoreErrorKind, mask_url, meta,
};
use crate::ports::{Clock, Datastore, IdGenerator, UlidGenerator};

/// 書き込みの種類でメタデータの付け方が変わる
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Live,
    Replay,
}

pub struct WriteCoordinator {
    action: String,
    stores: Vec<Arc<dyn Datastore>>,
    unavailable: HashSet<StoreErrorKind>,
    store_timeout: Duration,
    health: Arc<HealthMap>,
    ids: Box<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl WriteCoordinator {
    pub fn new(
        action: impl Into<String>,
        stores: Vec<Arc<dyn Datastore>>,
        unavailable: HashSet<StoreErrorKind>,
        store_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health = Arc::new(HealthMap::new(stores.iter().map(|s| s.url().to_string())));
        Self {
            action: action.into(),
            stores,
            unavailable,
            store_timeout,
            health,
            ids: Box::new(UlidGenerator::new(clock.clone())),
            clock,
        }
    }

    pub fn stores(&self) -> &[Arc<dyn Datastore>] {
        &self.stores
    }

    pub fn health(&self) -> &Arc<HealthMap> {
        &self.health
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// `kind` が「利用不可」（フォールバック対象）かどうか
    pub fn is_unavailable(&self, kind: StoreErrorKind) -> bool {
        kind == StoreErrorKind::Timeout || self.unavailable.contains(&kind)
    }

    /// Insert into the first store that accepts the record.
    ///
    /// A `capture_id` is added before the first attempt unless the caller set one.
    pub async fn insert(
        &self,
        table: &str,
        mut record: NewRecord,
    ) -> Result<LoggedRecord, PersistenceFailure> {
        record.annotate(meta::CAPTURE_ID, self.ids.generate_capture_id().to_string());
        self.insert_into(&self.stores, table, record, Pass::Live).await
    }

    /// Insert into the canonical store only. Used by replay, so a record
    /// never moves from one fallback store to another.
    ///
    /// Live insert metadata and the attempt trail are left as they are;
    /// only `replay_inserted_at` is set.
    pub async fn insert_canonical(
        &self,
        table: &str,
        record: NewRecord,
    ) -> Result<LoggedRecord, PersistenceFailure> {
        let canonical = self.stores.get(..1).unwrap_or(&[]);
        self.insert_into(canonical, table, record, Pass::Replay).await
    }

    async fn insert_into(
        &self,
        stores: &[Arc<dyn Datastore>],
        table: &str,
        mut record: NewRecord,
        pass: Pass,
    ) -> Result<LoggedRecord, PersistenceFailure> {
        let mut attempts = Vec::with_capacity(stores.len());

        for (index, store) in stores.iter().enumerate() {
            let url = mask_url(store.url());
            let now = self.clock.now().to_rfc3339();
            match pass {
                Pass::Live => {
                    record.push_attempt(url.clone());
                    record.stamp(meta::INSERT_ATTEMPT, (index + 1).to_string());
                    record.stamp(meta::INSERTED_AT, now);
                }
                Pass::Replay => record.stamp(meta::REPLAY_INSERTED_AT, now),
            }

            match self.attempt(store, table, record.clone()).await {
                Ok(logged) => {
                    self.health.record_success(store.url(), self.clock.now());
                    if index > 0 {
                        warn!(
                            action = %self.action,
                            store = %url,
                            record_id = %logged.id,
                            skipped = index,
                            "record captured in fallback store"
                        );
                    } else {
                        debug!(action = %self.action, store = %url, record_id = %logged.id, "record stored");
                    }
                    return Ok(logged);
                }
                Err(err) if self.is_unavailable(err.kind) => {
                    self.health
                        .record_failure(store.url(), err.kind, self.clock.now());
                    warn!(
                        action = %self.action,
                        store = %url,
                        kind = %err.kind,
                        error = %err.message,
                        "store unavailable, falling back"
                    );
                    attempts.push(err);
                }
                Err(err) => {
                    // 応答は返ってきたので到達可能
                    self.health.record_success(store.url(), self.clock.now());
                    error!(
                        action = %self.action,
                        store = %url,
                        kind = %err.kind,
                        error = %err.message,
                        "store rejected record, not falling back"
                    );
                    return Err(PersistenceFailure::Rejected {
                        store: url,
                        error: err,
                    });
                }
            }
        }

        error!(
            action = %self.action,
            stores = attempts.len(),
            "all datastores unavailable, record not captured"
        );
        Err(PersistenceFailure::AllStoresExhausted { attempts })
    }

    async fn attempt(
        &self,
        store: &Arc<dyn Datastore>,
        table: &str,
        record: NewRecord,
    ) -> Result<LoggedRecord, StoreError> {
        let url = mask_url(store.url());
        let mut task = tokio::spawn({
            let store = store.clone();
            let table = table.to_string();
            async move { store.try_insert(&table, record).await }
        });

        match tokio::time::timeout(self.store_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StoreError::new(
                StoreErrorKind::Internal,
                url,
                format!("insert task failed: {join_error}"),
            )),
            Err(_) => {
                let action = self.action.clone();
                let late_url = url.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(logged)) = task.await {
                        warn!(
                            action = %action,
                            store = %late_url,
                            record_id = %logged.id,
                            "insert completed after timeout, record may exist in two stores"
                        );
                    }
                });
                Err(StoreError::new(
                    StoreErrorKind::Timeout,
                    url,
                    format!("no answer within {}ms", self.store_timeout.as_millis()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HealthState;
    use crate::impls::{InMemoryDatastore, StoreMode};
    use crate::ports::SystemClock;
    use rstest::rstest;

    const TABLE: &str = "logged_webhooks";

    fn coordinator(stores: &[Arc<InMemoryDatastore>]) -> WriteCoordinator {
        WriteCoordinator::new(
            "test",
            stores
                .iter()
                .map(|s| s.clone() as Arc<dyn Datastore>)
                .collect(),
            StoreErrorKind::DEFAULT_UNAVAILABLE.into_iter().collect(),
            Duration::from_millis(200),
            Arc::new(SystemClock),
        )
    }

    fn stores(n: usize) -> Vec<Arc<InMemoryDatastore>> {
        (0..n)
            .map(|i| Arc::new(InMemoryDatastore::new(format!("memory://store-{i}"))))
            .collect()
    }

    #[tokio::test]
    async fn primary_success_does_not_touch_fallbacks() {
        let stores = stores(3);
        let coord = coordinator(&stores);

        let logged = coord.insert(TABLE, NewRecord::new("p1")).await.unwrap();

        assert_eq!(logged.insert_attempted_stores, vec!["memory://store-0"]);
        assert_eq!(logged.meta(meta::INSERT_ATTEMPT), Some("1"));
        assert!(logged.meta(meta::INSERTED_AT).is_some());
        assert_eq!(stores[0].len(TABLE), 1);
        assert_eq!(stores[1].insert_calls(), 0);
        assert_eq!(stores[2].insert_calls(), 0);
    }

    #[tokio::test]
    async fn falls_back_in_priority_order_and_stops_at_first_success() {
        let stores = stores(3);
        stores[0].set_mode(StoreMode::Unavailable(StoreErrorKind::Connection));
        let coord = coordinator(&stores);

        let logged = coord.insert(TABLE, NewRecord::new("p2")).await.unwrap();

        assert_eq!(
            logged.insert_attempted_stores,
            vec!["memory://store-0", "memory://store-1"]
        );
        assert_eq!(logged.meta(meta::INSERT_ATTEMPT), Some("2"));
        assert!(stores[0].is_empty(TABLE));
        assert_eq!(stores[1].len(TABLE), 1);
        assert_eq!(stores[2].insert_calls(), 0);

        assert_eq!(coord.health().get("memory://store-0").state, HealthState::Unhealthy);
        assert_eq!(coord.health().get("memory://store-1").state, HealthState::Healthy);
        assert_eq!(coord.health().get("memory://store-2").state, HealthState::Unknown);
    }

    #[rstest]
    #[case::connection(StoreErrorKind::Connection)]
    #[case::pool_exhausted(StoreErrorKind::PoolExhausted)]
    #[case::read_only(StoreErrorKind::ReadOnly)]
    #[tokio::test]
    async fn every_store_unavailable_exhausts(#[case] kind: StoreErrorKind) {
        let stores = stores(3);
        for s in &stores {
            s.set_mode(StoreMode::Unavailable(kind));
        }
        let coord = coordinator(&stores);

        let err = coord.insert(TABLE, NewRecord::new("p3")).await.unwrap_err();

        let PersistenceFailure::AllStoresExhausted { attempts } = &err else {
            panic!("expected AllStoresExhausted, got {err:?}");
        };
        let order: Vec<_> = attempts.iter().map(|e| e.store.as_str()).collect();
        assert_eq!(order, vec!["memory://store-0", "memory://store-1", "memory://store-2"]);
        assert!(attempts.iter().all(|e| e.kind == kind));
        assert!(stores.iter().all(|s| s.is_empty(TABLE)));
    }

    #[rstest]
    #[case::constraint(StoreErrorKind::Constraint)]
    #[case::malformed(StoreErrorKind::Malformed)]
    #[case::internal(StoreErrorKind::Internal)]
    #[tokio::test]
    async fn undeclared_error_does_not_fall_back(#[case] kind: StoreErrorKind) {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Rejecting(kind));
        let coord = coordinator(&stores);

        let err = coord.insert(TABLE, NewRecord::new("bad")).await.unwrap_err();

        assert!(err.is_validation_failure());
        assert_eq!(stores[1].insert_calls(), 0);
        // 拒否されたストアは到達可能
        assert_eq!(coord.health().get("memory://store-0").state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn declared_set_is_configurable() {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Rejecting(StoreErrorKind::Internal));
        let coord = WriteCoordinator::new(
            "test",
            stores.iter().map(|s| s.clone() as Arc<dyn Datastore>).collect(),
            [StoreErrorKind::Internal].into_iter().collect(),
            Duration::from_millis(200),
            Arc::new(SystemClock),
        );

        let logged = coord.insert(TABLE, NewRecord::new("x")).await.unwrap();
        assert_eq!(logged.meta(meta::INSERT_ATTEMPT), Some("2"));
    }

    #[tokio::test]
    async fn slow_store_times_out_and_falls_back() {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Slow(Duration::from_millis(600)));
        let coord = coordinator(&stores);

        let logged = coord.insert(TABLE, NewRecord::new("slow")).await.unwrap();
        assert_eq!(stores[1].len(TABLE), 1);
        assert_eq!(logged.meta(meta::INSERT_ATTEMPT), Some("2"));
        assert_eq!(
            coord.health().get("memory://store-0").last_error,
            Some(StoreErrorKind::Timeout)
        );

        // タイムアウトした insert はキャンセルされずに完了する
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(stores[0].len(TABLE), 1);
    }

    #[tokio::test]
    async fn unhealthy_store_is_retried_on_next_call() {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Unavailable(StoreErrorKind::Connection));
        let coord = coordinator(&stores);

        coord.insert(TABLE, NewRecord::new("a")).await.unwrap();
        assert_eq!(coord.health().get("memory://store-0").state, HealthState::Unhealthy);

        stores[0].set_mode(StoreMode::Available);
        let logged = coord.insert(TABLE, NewRecord::new("b")).await.unwrap();

        assert_eq!(stores[0].insert_calls(), 2);
        assert_eq!(logged.insert_attempted_stores, vec!["memory://store-0"]);
        assert_eq!(coord.health().get("memory://store-0").state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn every_copy_of_a_timed_out_insert_shares_the_capture_id() {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Slow(Duration::from_millis(300)));
        let coord = coordinator(&stores);

        let parked = coord.insert(TABLE, NewRecord::new("late")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let late = stores[0].records(TABLE);
        assert_eq!(late.len(), 1);
        assert_ne!(late[0].id, parked.id);
        assert!(parked.capture_id().is_some());
        assert_eq!(late[0].capture_id(), parked.capture_id());
        assert_eq!(late[0].dedup_key(), parked.dedup_key());
    }

    #[tokio::test]
    async fn caller_supplied_capture_id_is_kept() {
        let stores = stores(1);
        let coord = coordinator(&stores);
        let capture = coord.ids.generate_capture_id();

        let logged = coord
            .insert(
                TABLE,
                NewRecord::new("x").with_meta(meta::CAPTURE_ID, capture.to_string()),
            )
            .await
            .unwrap();
        assert_eq!(logged.capture_id(), Some(capture));
    }

    #[tokio::test]
    async fn insert_canonical_keeps_live_insert_metadata() {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Unavailable(StoreErrorKind::Connection));
        let coord = coordinator(&stores);
        let parked = coord.insert(TABLE, NewRecord::new("p")).await.unwrap();
        stores[0].set_mode(StoreMode::Available);

        let canonical = coord
            .insert_canonical(TABLE, NewRecord::from_logged(&parked))
            .await
            .unwrap();

        assert_eq!(canonical.meta(meta::INSERT_ATTEMPT), Some("2"));
        assert_eq!(canonical.meta(meta::INSERTED_AT), parked.meta(meta::INSERTED_AT));
        assert_eq!(canonical.insert_attempted_stores, parked.insert_attempted_stores);
        assert_eq!(canonical.capture_id(), parked.capture_id());
        assert!(canonical.meta(meta::REPLAY_INSERTED_AT).is_some());
        assert!(parked.meta(meta::REPLAY_INSERTED_AT).is_none());
    }

    #[tokio::test]
    async fn insert_canonical_never_touches_fallbacks() {
        let stores = stores(2);
        stores[0].set_mode(StoreMode::Unavailable(StoreErrorKind::Connection));
        let coord = coordinator(&stores);

        let err = coord
            .insert_canonical(TABLE, NewRecord::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(stores[1].insert_calls(), 0);
    }
}
