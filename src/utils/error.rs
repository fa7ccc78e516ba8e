//! 错误类型定义
//!
//! 定义 mcrunner 的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 RunnerError 枚举，涵盖所有可能的错误类型
//! - 实现错误转换（From trait）
//! - 提供错误分类和辅助方法
//! - 支持转换为 JSON-RPC 错误格式
//!
//! 其中 AlreadyRunning / NotRunning 属于"状态冲突"类错误：
//! 控制请求在错误的生命周期状态下到达时返回，便于调用方区分
//! "状态不对"和"真正的故障"。

use crate::rpc::types::JsonRpcError;
use thiserror::Error;

/// mcrunner 错误类型
#[derive(Debug, Error)]
pub enum RunnerError {
    /// 服务器进程已在运行（Start 冲突）
    #[error("服务器已在运行")]
    AlreadyRunning,

    /// 服务器进程未运行（Stop/Kill/Write/Resize 冲突）
    #[error("服务器未运行")]
    NotRunning,

    /// PTY/进程创建失败
    #[error("进程启动失败: {0}")]
    SpawnFailed(String),

    /// 子进程异常退出（非零且非预期终止信号）
    #[error("进程异常退出: 退出码 {0}")]
    AbnormalExit(u32),

    /// 订阅者发送队列已满（仅内部使用，触发强制断开）
    #[error("订阅者发送队列已满: {0}")]
    SubscriberQueueFull(String),

    /// 订阅者不存在
    #[error("订阅者不存在: {0}")]
    SubscriberNotFound(String),

    /// 服务正在关闭，拒绝新订阅
    #[error("服务正在关闭")]
    ShuttingDown,

    /// 无效的请求
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl RunnerError {
    /// 获取错误码
    pub fn code(&self) -> i32 {
        match self {
            RunnerError::AlreadyRunning => 1001,
            RunnerError::NotRunning => 1002,
            RunnerError::SpawnFailed(_) => 1003,
            RunnerError::AbnormalExit(_) => 1004,
            RunnerError::SubscriberQueueFull(_) => 1005,
            RunnerError::SubscriberNotFound(_) => 1006,
            RunnerError::ShuttingDown => 1007,
            RunnerError::InvalidRequest(_) => 1008,
            RunnerError::IoError(_) => 1009,
            RunnerError::SerializationError(_) => 1010,
        }
    }

    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            RunnerError::AlreadyRunning => "already_running",
            RunnerError::NotRunning => "not_running",
            RunnerError::SpawnFailed(_) => "spawn_failed",
            RunnerError::AbnormalExit(_) => "abnormal_exit",
            RunnerError::SubscriberQueueFull(_) => "subscriber_queue_full",
            RunnerError::SubscriberNotFound(_) => "subscriber_not_found",
            RunnerError::ShuttingDown => "shutting_down",
            RunnerError::InvalidRequest(_) => "invalid_request",
            RunnerError::IoError(_) => "io_error",
            RunnerError::SerializationError(_) => "serialization_error",
        }
    }

    /// 检查是否为状态冲突错误（对应 HTTP 409 语义）
    pub fn is_conflict(&self) -> bool {
        matches!(self, RunnerError::AlreadyRunning | RunnerError::NotRunning)
    }
}

impl From<RunnerError> for JsonRpcError {
    fn from(err: RunnerError) -> Self {
        // 根据错误类型映射到适当的 JSON-RPC 错误码
        // 使用应用特定的错误码范围 (-32000 到 -32099)
        let code = match &err {
            RunnerError::AlreadyRunning => -32001,
            RunnerError::NotRunning => -32002,
            RunnerError::SubscriberNotFound(_) => -32003,
            RunnerError::ShuttingDown => -32004,
            RunnerError::SpawnFailed(_) => -32010,
            RunnerError::AbnormalExit(_) => -32011,
            RunnerError::SubscriberQueueFull(_) => -32012,
            RunnerError::InvalidRequest(_) => -32602, // 标准的无效参数错误码
            RunnerError::SerializationError(_) => -32700, // 标准的解析错误码
            RunnerError::IoError(_) => -32603,       // 标准的内部错误码
        };

        JsonRpcError {
            code,
            message: err.to_string(),
            data: Some(serde_json::json!({
                "error_type": err.error_type(),
                "error_code": err.code(),
                "conflict": err.is_conflict(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunnerError::NotRunning;
        assert_eq!(err.to_string(), "服务器未运行");

        let err = RunnerError::SpawnFailed("no such file".to_string());
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RunnerError::AlreadyRunning.code(), 1001);
        assert_eq!(RunnerError::NotRunning.code(), 1002);
        assert_eq!(RunnerError::AbnormalExit(1).code(), 1004);
        assert_eq!(RunnerError::ShuttingDown.code(), 1007);
    }

    #[test]
    fn test_error_types() {
        assert_eq!(RunnerError::AlreadyRunning.error_type(), "already_running");
        assert_eq!(
            RunnerError::SubscriberQueueFull("id".to_string()).error_type(),
            "subscriber_queue_full"
        );
    }

    #[test]
    fn test_is_conflict() {
        assert!(RunnerError::AlreadyRunning.is_conflict());
        assert!(RunnerError::NotRunning.is_conflict());
        assert!(!RunnerError::SpawnFailed("".to_string()).is_conflict());
        assert!(!RunnerError::ShuttingDown.is_conflict());
    }

    #[test]
    fn test_runner_error_to_json_rpc_error() {
        // 状态冲突错误映射为专用错误码
        let rpc_err: JsonRpcError = RunnerError::AlreadyRunning.into();
        assert_eq!(rpc_err.code, -32001);

        let rpc_err: JsonRpcError = RunnerError::NotRunning.into();
        assert_eq!(rpc_err.code, -32002);

        let data = rpc_err.data.unwrap();
        assert_eq!(data["error_type"], "not_running");
        assert_eq!(data["conflict"], true);

        // 普通故障不标记为冲突
        let rpc_err: JsonRpcError = RunnerError::SpawnFailed("boom".to_string()).into();
        assert_eq!(rpc_err.code, -32010);
        assert_eq!(rpc_err.data.unwrap()["conflict"], false);
    }
}
