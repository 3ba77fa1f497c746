//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（PostgreSQL, ジョブキュー など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - canonical ストアが source of truth（正本）
//! - フォールバックストアは一時的な避難先（リプレイ後に削除）
//! - ジョブキューは record_id のみを運ぶ

pub mod clock;
pub mod datastore;
pub mod id_generator;
pub mod replay_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::datastore::Datastore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::replay_queue::ReplayQueue;
