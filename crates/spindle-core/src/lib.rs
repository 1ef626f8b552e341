//! spindle-core
//!
//! Multi-worker task orchestration over a shared filesystem.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, queue, state, task, outcome, decision, retry, fractal, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, LockManager, Executor, RateLimiter, Clock, など）
//! - **impls**: 実装（ファイルシステム backend、in-memory backend、外部コマンド executor）
//! - **gate**: QualityGate（executor の「成功」を鵜呑みにしない検証）
//! - **app**: アプリケーションロジック（worker_loop, reaper, reconciler, chainer, pool）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod gate;
pub mod impls;
pub mod ports;
