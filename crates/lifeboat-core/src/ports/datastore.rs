//! Datastore port - 物理データベース 1 台分のハンドル
//!
//! 本番ではコネクション 1 組（URL + 認証情報）をラップする。
//! canonical ストアもフォールバックストアも同じスキーマ（`LoggedRecord`）を持つ。
//!
//! # 設計原則
//! - `try_insert` の可否は実際に書き込んで判断する（事前の ping で gate しない）
//! - `ping` は外部向けのヘルスレポート専用
//! - `delete` は条件付き: 実際に消した呼び出し元だけが `true` を受け取る

use async_trait::async_trait;

use crate::domain::{LoggedRecord, NewRecord, RecordId, StoreError};

/// Datastore はレコードの保存先 1 台を表す
///
/// # Thread Safety
/// - `Send + Sync` を要求（リクエストごとのタスクから並行に呼ばれる）
#[async_trait]
pub trait Datastore: Send + Sync {
    /// 接続先 URL（優先順位はリスト上の位置で決まる）
    fn url(&self) -> &str;

    /// レコードを 1 件挿入し、ストアが採番した ID を含む記録を返す
    async fn try_insert(&self, table: &str, record: NewRecord) -> Result<LoggedRecord, StoreError>;

    /// 軽い往復クエリ（`SELECT 1` 相当）。到達できれば true
    async fn ping(&self) -> bool;

    /// ID 順に最大 `limit` 件を返す。`after` があればその ID より後ろだけ
    async fn scan(
        &self,
        table: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<LoggedRecord>, StoreError>;

    /// レコードがまだ残っているか
    async fn contains(&self, table: &str, id: RecordId) -> Result<bool, StoreError>;

    /// レコードを削除する。既に存在しなければ `Ok(false)`
    async fn delete(&self, table: &str, id: RecordId) -> Result<bool, StoreError>;
}
