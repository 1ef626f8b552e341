//! App - アプリケーション層
//!
//! ports を組み合わせてオーケストレーションのロジックを実装する。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: Orchestrator の構築とワイヤリング
//! - **WorkerLoop**: claim → execute → verify → finalize
//! - **StaleLockReaper**: 死んだワーカーの lock と IN_PROGRESS の回収
//! - **Reconciler**: DECOMPOSED 親の集約と連鎖の補完
//! - **QueueChainer**: TDD の完了から DEPLOY タスクを生成
//! - **WorkerPool**: 上記ループ群の起動と graceful shutdown
//! - **admin / status**: 運用コマンド

pub mod admin;
pub mod builder;
pub mod chainer;
mod finalize;
pub mod pool;
pub mod reaper_loop;
pub mod reconcile_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{AppBuilder, BuildError, Orchestrator};
pub use self::chainer::{ChainOutcome, QueueChainer};
pub use self::pool::{ShutdownTrigger, WorkerPool};
pub use self::reaper_loop::{ReapReport, StaleLockReaper};
pub use self::reconcile_loop::{ReconcileReport, Reconciler};
pub use self::status::{QueueCounts, StatusReport};
pub use self::worker_loop::{WorkerLoop, WorkerStep};
