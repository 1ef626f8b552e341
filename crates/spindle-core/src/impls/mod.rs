//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **FsTaskStore / FsLockManager**: 複数プロセスで共有するファイル実装（本番用）
//! - **InMemoryTaskStore / InMemoryLockManager**: 単一プロセス・テスト用
//! - **ProcessProbe**: pid と起動時刻による生存確認
//! - **CommandExecutor / ExecutorChain**: 外部コマンド実行と優先順位付きフォールバック
//! - **FileRateLimiter / InMemoryRateLimiter**: sliding window の呼び出し予算

pub mod command_executor;
pub mod executor_chain;
pub mod fs_lock;
pub mod fs_store;
mod fs_util;
pub mod memory;
pub mod process_probe;
pub mod rate_limit;

pub use self::command_executor::CommandExecutor;
pub use self::executor_chain::ExecutorChain;
pub use self::fs_lock::FsLockManager;
pub use self::fs_store::FsTaskStore;
pub use self::memory::{InMemoryLockManager, InMemoryTaskStore};
pub use self::process_probe::{ProcessProbe, current_holder};
pub use self::rate_limit::{FileRateLimiter, InMemoryRateLimiter, SlidingWindow};
