//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryDatastore**: 障害注入できるデータストア
//! - **InMemoryReplayQueue**: 開発用のリプレイキュー
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します（PostgreSQL の Datastore、
//! ジョブ基盤の ReplayQueue など）。

pub mod inmem_queue;
pub mod inmem_store;

pub use self::inmem_queue::InMemoryReplayQueue;
pub use self::inmem_store::{InMemoryDatastore, StoreMode};
