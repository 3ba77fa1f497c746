//! HealthMap - プロセス単位で共有する advisory ヘルスマップ
//!
//! # ライフサイクル
//! - 起動時に action の全ストアを `Unknown` で初期化
//! - 失敗した試行のたびに更新（成功時も更新）
//! - 永続化しない。プロセス再起動で消える
//!
//! 読み取り中心なので `RwLock` を使い、await をまたいでロックを持たない。
//! 古い値が読まれても問題ない（ルーティングには使わない）。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::domain::{StoreErrorKind, StoreHealth};

#[derive(Debug, Default)]
pub struct HealthMap {
    entries: RwLock<HashMap<String, StoreHealth>>,
}

impl HealthMap {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = urls
            .into_iter()
            .map(|url| (url.into(), StoreHealth::default()))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn record_success(&self, url: &str, at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(url.to_string()).or_default().record_success(at);
    }

    pub fn record_failure(&self, url: &str, kind: StoreErrorKind, at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(url.to_string())
            .or_default()
            .record_failure(kind, at);
    }

    /// 未登録の URL は `Unknown` を返す
    pub fn get(&self, url: &str) -> StoreHealth {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<String, StoreHealth> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
