//! lifeboat-core
//!
//! Durable writes that survive a datastore outage, and replay of what was
//! parked in fallback stores once the canonical store is back.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, record, health, errors）
//! - **ports**: 抽象化レイヤー（Datastore, ReplayQueue, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（action, coordinator, replay, sweep_loop, status）
//! - **impls**: 実装（InMemoryDatastore / InMemoryReplayQueue など開発用）
//! - **webhook**: webhook ロギングのユースケース
//! - **config**: figment による設定読み込み
//!
//! # 書き込みとリプレイの流れ
//! ```text
//! insert ──▶ store[0] ──(unavailable)──▶ store[1] ──▶ ... ──▶ AllStoresExhausted
//!                                          │
//!                      sweep ◀─────────────┘
//!                        │ 1. store[0] に再 insert
//!                        │ 2. ReplayQueue に投入
//!                        └ 3. フォールバックのコピーを削除
//! ```

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod webhook;

pub use app::{HealthReport, ReplayDispatcher, ResilientAction, SweepLoop};
pub use config::LifeboatConfig;
pub use domain::{LoggedRecord, NewRecord, PersistenceFailure, ReplayFailure};
