//! 广播帧定义
//!
//! 控制台广播中心下发给订阅者的统一消息载体。所有帧类型
//! 都可序列化为 JSON-RPC 通知的 params。

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::rpc::types::ServerStatus;

/// 服务器复合状态
///
/// 进程生命周期信息与资源用量的合成快照，定期广播给所有订阅者。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerState {
    /// 进程状态
    pub status: ServerStatus,
    /// 进程 ID（仅运行时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// 运行时长（秒，停止时为 0）
    pub uptime_sec: u64,
    /// 内存用量（字节）
    pub memory_usage: u64,
    /// 内存上限（字节，无限制为 0）
    pub memory_limit: u64,
    /// CPU 使用率（核数，1.0 = 一个核满载）
    pub cpu_usage: f64,
    /// CPU 上限（核数，无限制时为宿主核数）
    pub cpu_limit: f64,
    /// 磁盘用量（字节）
    pub disk_usage: u64,
    /// 磁盘总量（字节）
    pub disk_size: u64,
}

/// 广播帧
///
/// `type` 字段区分帧类型，载荷内联在同一对象中。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// 控制台输出（Base64 编码的原始字节）
    Output { data: String },
    /// 生命周期状态变更
    Status {
        status: ServerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<u32>,
    },
    /// 复合状态快照
    State(ServerState),
    /// 面向单个订阅者的错误提示
    Error { message: String },
}

impl Frame {
    /// 从原始输出字节构造输出帧
    pub fn output(data: &[u8]) -> Self {
        Frame::Output {
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    /// 帧对应的通知方法名
    pub fn method(&self) -> &'static str {
        match self {
            Frame::Output { .. } => "console.output",
            Frame::Status { .. } => "server.status",
            Frame::State(_) => "server.state",
            Frame::Error { .. } => "console.error",
        }
    }
}
