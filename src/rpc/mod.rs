//! JSON-RPC 服务
//!
//! 协议类型、方法分发和 TCP 传输。

pub mod methods;
pub mod server;
pub mod types;

pub use methods::RpcMethods;
pub use server::RpcServer;
