//! Errors - エラー型と分類
//!
//! # 分類
//! - **StoreError**: ストア 1 台に対する操作の失敗。`StoreErrorKind` で分類し、
//!   action が「利用不可」と宣言した kind だけがフォールバックの対象になる
//! - **ValidationError**: ストアに触れる前の policy による拒否
//! - **PersistenceFailure**: insert 1 回の最終結果（呼び出し元に返す）
//! - **ReplayFailure**: リプレイ 1 件の失敗（sweep は止めない）

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::RecordId;

/// StoreErrorKind はストア操作エラーの分類
///
/// どの kind を「利用不可」とみなすかは action の設定で決まる。
/// `Timeout` だけは coordinator 自身が生成し、常に利用不可として扱う。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// 接続できない（refused, DNS, TLS など）
    Connection,
    /// coordinator の per-store timeout を超えた
    Timeout,
    /// コネクションプールが枯渇
    PoolExhausted,
    /// フェイルオーバー中などで書き込み不可
    ReadOnly,
    /// 制約違反（NOT NULL, CHECK など）
    Constraint,
    /// 値がスキーマに合わない
    Malformed,
    /// 分類できない内部エラー
    Internal,
}

impl StoreErrorKind {
    /// デフォルトで「利用不可」とみなす kind
    pub const DEFAULT_UNAVAILABLE: [StoreErrorKind; 4] = [
        StoreErrorKind::Connection,
        StoreErrorKind::Timeout,
        StoreErrorKind::PoolExhausted,
        StoreErrorKind::ReadOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::PoolExhausted => "pool_exhausted",
            Self::ReadOnly => "read_only",
            Self::Constraint => "constraint",
            Self::Malformed => "malformed",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single datastore operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error on {store}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    /// Masked URL of the store that failed.
    pub store: String,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, store: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            store: store.into(),
            message: message.into(),
        }
    }
}

/// ValidationError は policy がストアに触れる前に拒否したことを表す
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("required metadata '{0}' is missing")]
    MissingMetadata(String),

    #[error("metadata '{key}' is invalid: {reason}")]
    InvalidMetadata { key: String, reason: String },
}

/// Outcome of [`crate::app::WriteCoordinator::insert`] when nothing was persisted.
#[derive(Debug, Clone, Error)]
pub enum PersistenceFailure {
    /// Rejected by the action policy; no store was tried.
    #[error("record rejected before insert: {0}")]
    Invalid(#[from] ValidationError),

    /// A store answered with an error outside the declared unavailable set.
    /// Fallback stores are not tried: the data is the problem, not the store.
    #[error("store {store} rejected record: {error}")]
    Rejected { store: String, error: StoreError },

    /// Every configured store failed with a declared unavailable error.
    /// `attempts` holds one entry per store, in priority order.
    #[error("all {} datastores unavailable: {}", .attempts.len(), summarize(.attempts))]
    AllStoresExhausted { attempts: Vec<StoreError> },
}

impl PersistenceFailure {
    /// `ValidationFailure`: a data problem, never retried against another store.
    pub fn is_validation_failure(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Rejected { .. })
    }

    /// Per-store errors, in the order the stores were tried.
    pub fn attempts(&self) -> &[StoreError] {
        match self {
            Self::AllStoresExhausted { attempts } => attempts,
            Self::Rejected { error, .. } => std::slice::from_ref(error),
            Self::Invalid(_) => &[],
        }
    }
}

fn summarize(attempts: &[StoreError]) -> String {
    attempts
        .iter()
        .map(|e| format!("{}={}", e.store, e.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// EnqueueError は下流ジョブキューへの投入失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("replay queue unavailable: {0}")]
    Unavailable(String),

    #[error("enqueue failed: {0}")]
    OperationFailed(String),
}

/// Failure of one record's replay. Non-fatal to the sweep; the fallback copy stays put.
#[derive(Debug, Clone, Error)]
pub enum ReplayFailure {
    /// The fallback store could not confirm the record is still there.
    #[error("lookup of {record_id} in fallback store failed: {source}")]
    Lookup {
        record_id: RecordId,
        #[source]
        source: StoreError,
    },

    /// Step 1 failed: the canonical store did not take the record.
    #[error("re-insert of {record_id} into canonical store failed: {source}")]
    Reinsert {
        record_id: RecordId,
        #[source]
        source: PersistenceFailure,
    },

    /// Step 2 failed after step 1 succeeded. A canonical copy exists and the
    /// next sweep will create another one; downstream dedups on `origin_id`.
    #[error("enqueue of {canonical_id} (from {record_id}) failed: {source}")]
    Enqueue {
        record_id: RecordId,
        canonical_id: RecordId,
        #[source]
        source: EnqueueError,
    },

    /// Step 3 failed. The record now exists in both stores until a later sweep.
    #[error("delete of fallback copy {record_id} failed: {source}")]
    Delete {
        record_id: RecordId,
        canonical_id: RecordId,
        #[source]
        source: StoreError,
    },
}

impl ReplayFailure {
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::Lookup { record_id, .. }
            | Self::Reinsert { record_id, .. }
            | Self::Enqueue { record_id, .. }
            | Self::Delete { record_id, .. } => *record_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::invalid(PersistenceFailure::Invalid(ValidationError::EmptyPayload), true)]
    #[case::rejected(
        PersistenceFailure::Rejected {
            store: "memory://a".into(),
            error: StoreError::new(StoreErrorKind::Constraint, "memory://a", "null payload"),
        },
        true
    )]
    #[case::exhausted(PersistenceFailure::AllStoresExhausted { attempts: vec![] }, false)]
    fn validation_failure_classification(#[case] failure: PersistenceFailure, #[case] expected: bool) {
        assert_eq!(failure.is_validation_failure(), expected);
    }

    #[test]
    fn exhausted_message_lists_stores_in_order() {
        let failure = PersistenceFailure::AllStoresExhausted {
            attempts: vec![
                StoreError::new(StoreErrorKind::Connection, "memory://a", "refused"),
                StoreError::new(StoreErrorKind::Timeout, "memory://b", "2000ms"),
            ],
        };
        assert_eq!(
            failure.to_string(),
            "all 2 datastores unavailable: memory://a=connection, memory://b=timeout"
        );
        assert_eq!(failure.attempts().len(), 2);
    }

    #[test]
    fn kinds_deserialize_from_snake_case() {
        let kinds: Vec<StoreErrorKind> =
            serde_json::from_str(r#"["connection","pool_exhausted","read_only"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![
                StoreErrorKind::Connection,
                StoreErrorKind::PoolExhausted,
                StoreErrorKind::ReadOnly
            ]
        );
    }
}
