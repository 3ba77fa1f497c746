//! ReplayQueue port - 下流の非同期ジョブ基盤への投入口
//!
//! ReplayQueue は record_id のみを流します（payload は canonical ストアにある）。
//! 消費側は record の `dedup_key` で冪等に処理する前提です。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EnqueueError, RecordId};

/// ReplayQueue は record_id を下流処理に渡すためのキュー
///
/// # 設計原則
/// - record_id のみを保持（payload・metadata は canonical ストアに保存）
/// - namespace は action 名（use case ごとにキューを分ける）
/// - fire-and-forget: push の成功は「受け付けた」ことだけを意味する
#[async_trait]
pub trait ReplayQueue: Send + Sync {
    async fn push(&self, ns: &str, record_id: RecordId) -> Result<(), EnqueueError>;

    /// blocking pop（timeout 付き）。ワーカー側が使う
    async fn pop(&self, ns: &str, timeout: Duration) -> Result<Option<RecordId>, EnqueueError>;
}
