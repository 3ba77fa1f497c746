//! SweepLoop - 定期的に ReplayDispatcher::sweep を回す
//!
//! # 設計原則
//! - 間隔は `interval`（遅れた tick は詰めずにスキップ）
//! - `trigger()` で即時 sweep を要求できる（ヘルスチェック復帰時など）
//! - `CancellationToken` でループを止める。実行中の sweep は最後まで走らせる

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::replay::{ReplayDispatcher, SweepReport};

/// `interval` はこれより短くならない（tokio の interval は 0 を受け付けない）
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub struct SweepLoop {
    dispatcher: ReplayDispatcher,
    interval: Duration,
    cancellation_token: CancellationToken,
    wake: Arc<Notify>,
}

/// Handle for requesting an out-of-schedule sweep.
#[derive(Clone)]
pub struct SweepTrigger {
    wake: Arc<Notify>,
}

impl SweepTrigger {
    pub fn fire(&self) {
        self.wake.notify_one();
    }
}

impl SweepLoop {
    pub fn new(
        dispatcher: ReplayDispatcher,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            cancellation_token,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) -> SweepTrigger {
        SweepTrigger {
            wake: self.wake.clone(),
        }
    }

    /// Run until cancelled. Returns the number of sweeps performed.
    ///
    /// The first tick fires immediately, so records parked before startup
    /// are picked up without waiting a full interval.
    pub async fn run(self) -> usize {
        let action = self.dispatcher.action().name().to_string();
        info!(%action, interval_ms = self.interval.as_millis() as u64, "sweep loop starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps = 0;

        loop {
            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.wake.notified() => {
                    debug!(%action, "sweep triggered");
                }
            }

            let report: SweepReport = self.dispatcher.sweep().await;
            sweeps += 1;
            if !report.is_clean() {
                debug!(
                    %action,
                    failed = report.failed,
                    unreachable = report.unreachable_stores.len(),
                    "sweep left records behind"
                );
            }
        }

        info!(%action, sweeps, "sweep loop stopped");
        sweeps
    }
}
