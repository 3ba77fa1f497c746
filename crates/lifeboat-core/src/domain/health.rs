//! Health - ストアごとの助言的（advisory）ヘルス状態
//!
//! プロセス内だけで保持し、永続化しない。
//! ルーティングの判断には使わない（次の insert は unhealthy なストアも必ず試す）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreErrorKind;

/// HealthState はストアの直近の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// まだ一度も試していない
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// StoreHealth は 1 ストア分の advisory エントリ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub state: HealthState,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<StoreErrorKind>,
    /// 連続失敗回数（成功で 0 に戻る）
    pub consecutive_failures: u32,
}

impl StoreHealth {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.state = HealthState::Healthy;
        self.updated_at = Some(at);
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, kind: StoreErrorKind, at: DateTime<Utc>) {
        self.state = HealthState::Unhealthy;
        self.updated_at = Some(at);
        self.last_error = Some(kind);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_then_success_resets() {
        let now = Utc::now();
        let mut health = StoreHealth::default();
        assert_eq!(health.state, HealthState::Unknown);

        health.record_failure(StoreErrorKind::Connection, now);
        health.record_failure(StoreErrorKind::Timeout, now);
        assert_eq!(health.state, HealthState::Unhealthy);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.last_error, Some(StoreErrorKind::Timeout));

        health.record_success(now);
        assert_eq!(health.state, HealthState::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_error, None);
    }
}
