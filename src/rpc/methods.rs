//! RPC 方法分发
//!
//! 把 JSON-RPC 请求路由到监管器与广播中心。每个连接对应一个
//! 订阅者，`console.*` 方法携带该连接的订阅者 ID 以便把错误帧
//! 只推送给发起者。

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::hub::ConsoleHub;
use crate::proc::ServerSupervisor;
use crate::rpc::types::{CommandRequest, InputRequest, JsonRpcError, JsonRpcResponse, ResizeRequest};

/// RPC 方法处理器
pub struct RpcMethods {
    supervisor: Arc<ServerSupervisor>,
    hub: Arc<ConsoleHub>,
}

impl RpcMethods {
    /// 创建方法处理器
    pub fn new(supervisor: Arc<ServerSupervisor>, hub: Arc<ConsoleHub>) -> Self {
        Self { supervisor, hub }
    }

    /// 分发一次方法调用
    pub async fn call(
        &self,
        subscriber_id: &Uuid,
        method: &str,
        params: Option<Value>,
        id: Value,
    ) -> JsonRpcResponse {
        tracing::debug!("处理 RPC 调用: {}", method);
        match self.dispatch(subscriber_id, method, params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        }
    }

    async fn dispatch(
        &self,
        subscriber_id: &Uuid,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        match method {
            "server.start" => {
                self.supervisor.start()?;
                Ok(json!({ "status": self.supervisor.status() }))
            }
            "server.stop" => {
                self.supervisor.stop().await?;
                Ok(json!({ "status": self.supervisor.status() }))
            }
            "server.kill" => {
                self.supervisor.kill()?;
                Ok(json!({ "status": self.supervisor.status() }))
            }
            "server.restart" => {
                self.supervisor.restart().await?;
                Ok(json!({ "status": self.supervisor.status() }))
            }
            "server.command" => {
                let req: CommandRequest = parse_params(params)?;
                self.supervisor.send_command(&req.command)?;
                Ok(json!({ "ok": true }))
            }
            "server.state" => {
                let state = self.hub.server_state();
                serde_json::to_value(state)
                    .map_err(|e| JsonRpcError::internal_error(e.to_string()))
            }
            "console.input" => {
                let req: InputRequest = parse_params(params)?;
                let written = self.hub.handle_input(subscriber_id, &req.data)?;
                Ok(json!({ "written": written }))
            }
            "console.resize" => {
                let req: ResizeRequest = parse_params(params)?;
                self.hub.handle_resize(subscriber_id, req.rows, req.cols)?;
                Ok(json!({ "ok": true }))
            }
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }
}

/// 解析方法参数
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("缺少参数"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("参数解析错误: {}", e)))
}
