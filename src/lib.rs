//! 游戏服务器进程监管与控制台广播守护进程
//!
//! 在 PTY 上托管唯一的服务器进程，把控制台输出、生命周期状态
//! 与资源用量广播给任意数量的远程订阅者，并接受订阅者的控制台
//! 输入与生命周期操作。

pub mod hub;
pub mod metrics;
pub mod proc;
pub mod rpc;
pub mod utils;
