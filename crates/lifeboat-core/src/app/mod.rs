//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて durable write とリプレイを実装します。
//!
//! # 主要コンポーネント
//! - **ResilientAction**: ユースケースごとの設定（table、ストア、ポリシー、キュー）
//! - **WriteCoordinator**: ストアを優先順に試す insert
//! - **HealthMap**: ストアごとのアドバイザリな健康状態
//! - **ReplayDispatcher**: フォールバックから canonical へのリプレイ
//! - **SweepLoop**: 定期 sweep
//! - **HealthReport**: ヘルスエンドポイント用のレポート

pub mod action;
pub mod coordinator;
pub mod health;
pub mod replay;
pub mod status;
pub mod sweep_loop;

// 主要な型を再エクスポート
pub use self::action::{AcceptAll, ActionBuilder, BuildError, RecordPolicy, ResilientAction};
pub use self::coordinator::WriteCoordinator;
pub use self::health::HealthMap;
pub use self::replay::{ReplayClaims, ReplayDispatcher, ReplayOutcome, SweepConfig, SweepReport};
pub use self::status::{HealthReport, StoreRole, StoreStatus};
pub use self::sweep_loop::{SweepLoop, SweepTrigger};
