//! 服务器进程管理
//!
//! 进程监管器、PTY 封装和控制台回放缓冲区。

pub mod pty;
pub mod replay;
pub mod supervisor;

pub use replay::ReplayBuffer;
pub use supervisor::{ExitResult, LaunchConfig, ServerSupervisor};
