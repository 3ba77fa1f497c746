//! IdGenerator port - ID 生成の抽象化
//!
//! レコード ID は「受け入れたストア」が採番するので、
//! datastore 実装がこの trait を使います。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::domain::ids::{CaptureId, RecordId, SweepId};
use crate::ports::Clock;
use ulid::{Generator, Ulid};

/// IdGenerator は分散システムで使える ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能（1 つの生成器の中では単調増加）
/// - 分散環境で生成可能（調整不要）。複数ストアが独立に採番しても衝突しない
/// - 128-bit（UUID 互換）
pub trait IdGenerator: Send + Sync {
    fn generate_record_id(&self) -> RecordId;

    fn generate_capture_id(&self) -> CaptureId;

    fn generate_sweep_id(&self) -> SweepId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に FixedClock を使うと timestamp 部分が決定的になります。
///
/// `ulid::Generator` で単調増加にしているので、同じミリ秒内の ID も発行順に並ぶ。
pub struct UlidGenerator<C> {
    clock: C,
    monotonic: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            monotonic: Mutex::new(Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let now = self.clock.now();
        let mut generator = self.monotonic.lock().unwrap_or_else(PoisonError::into_inner);
        // 同一ミリ秒で乱数部が溢れたときだけ失敗する
        generator
            .generate_from_datetime(SystemTime::from(now))
            .unwrap_or_else(|_| Ulid::from_parts(now.timestamp_millis() as u64, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_record_id(&self) -> RecordId {
        RecordId::from(self.next_ulid())
    }

    fn generate_capture_id(&self) -> CaptureId {
        CaptureId::from(self.next_ulid())
    }

    fn generate_sweep_id(&self) -> SweepId {
        SweepId::from(self.next_ulid())
    }
}
