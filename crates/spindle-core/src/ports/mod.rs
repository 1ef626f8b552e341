//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。app 層はここの trait だけに依存し、
//! ファイルシステム・プロセス・外部コマンドの詳細は impls 側に閉じ込める。
//!
//! # 共有状態
//! - TaskStore と LockManager だけが共有可変リソース
//! - RateLimiter のカウンタも同様に原子的に更新する
//! - ワーカー間でメモリ上の状態は共有しない

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod liveness;
pub mod lock_manager;
pub mod rate_limiter;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use self::executor::Executor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::liveness::LivenessProbe;
pub use self::lock_manager::{Lock, LockManager};
pub use self::rate_limiter::{Admission, RateLimitStats, RateLimiter};
pub use self::task_store::{TaskSnapshot, TaskStore, list_with_status};
