//! RPC 服务器
//!
//! 在 TCP 上提供换行分隔的 JSON-RPC 2.0 服务。每个连接即一个
//! 广播订阅者：请求/响应与服务端推送的通知复用同一条连接，
//! 由单一写入任务串行写出。
//!
//! 订阅者被广播中心移除（队列溢出或关停）后，连接必须随之关闭：
//! 通知泵观察到帧队列关闭时发出断开信号，请求循环收到信号立即
//! 放弃连接并丢弃两个半边。

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::hub::ConsoleHub;
use crate::rpc::methods::RpcMethods;
use crate::rpc::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// 连接内写出队列容量
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// RPC 服务器
pub struct RpcServer {
    methods: RpcMethods,
    hub: Arc<ConsoleHub>,
}

impl RpcServer {
    /// 创建 RPC 服务器
    pub fn new(methods: RpcMethods, hub: Arc<ConsoleHub>) -> Self {
        Self { methods, hub }
    }

    /// 绑定地址并开始服务
    pub async fn run(self: Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("RPC 服务已监听: {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// 在已绑定的监听器上接受连接
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!("客户端已连接: {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    tracing::debug!("连接 {} 处理结束: {}", peer, e);
                }
                tracing::info!("客户端已断开: {}", peer);
            });
        }
    }

    /// 处理单个连接的完整生命周期
    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (subscriber_id, mut frame_rx) = match self.hub.subscribe() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("拒绝新连接: {}", e);
                return Ok(());
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);
        // 通知泵退出即要求强制断开本连接
        let disconnect = Arc::new(Notify::new());

        // 写入任务：响应与通知都经由此任务串行写出
        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        });

        // 通知泵：把订阅者队列中的帧转成 JSON-RPC 通知。
        // 写出队列满说明写入任务已失速（客户端不再读取），与订阅者
        // 队列溢出同属慢订阅者，一律断开；因此这里绝不阻塞等待，
        // 泵一定能及时观察到帧队列被广播中心关闭。
        let pump = {
            let out_tx = out_tx.clone();
            let disconnect = disconnect.clone();
            tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    let params = match serde_json::to_value(&frame) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::error!("序列化通知失败: {}", e);
                            continue;
                        }
                    };
                    let notification = JsonRpcNotification::new(frame.method(), params);
                    let line = match serde_json::to_string(&notification) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!("序列化通知失败: {}", e);
                            continue;
                        }
                    };
                    if out_tx.try_send(line).is_err() {
                        tracing::warn!("连接写出队列已满，按慢订阅者断开");
                        break;
                    }
                }
                disconnect.notify_one();
            })
        };

        // 请求循环：逐行读取并分发；断开信号随时可抢占
        let mut forced = false;
        let mut lines = BufReader::new(read_half).lines();
        let result = loop {
            tokio::select! {
                _ = disconnect.notified() => {
                    forced = true;
                    break Ok(());
                }
                next = lines.next_line() => match next {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let response = self.handle_request(&subscriber_id, line).await;
                        let serialized = match serde_json::to_string(&response) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::error!("序列化响应失败: {}", e);
                                continue;
                            }
                        };
                        tokio::select! {
                            res = out_tx.send(serialized) => {
                                if res.is_err() {
                                    break Ok(());
                                }
                            }
                            _ = disconnect.notified() => {
                                forced = true;
                                break Ok(());
                            }
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        // 清理顺序：先注销订阅者，再关闭写出队列。
        // 强制断开时不等写入任务排空，直接丢弃写端关闭连接。
        self.hub.unsubscribe(&subscriber_id);
        pump.abort();
        drop(out_tx);
        if forced {
            writer.abort();
        }
        let _ = writer.await;
        result
    }

    /// 解析并处理一条请求
    async fn handle_request(&self, subscriber_id: &Uuid, line: &str) -> JsonRpcResponse {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return JsonRpcResponse::error(
                    serde_json::Value::Null,
                    JsonRpcError::parse_error(format!("请求解析失败: {}", e)),
                );
            }
        };
        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::invalid_request("仅支持 JSON-RPC 2.0"),
            );
        }
        self.methods
            .call(subscriber_id, &request.method, request.params, request.id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Frame, HubConfig};
    use crate::metrics::ResourceMonitor;
    use crate::proc::{LaunchConfig, ReplayBuffer, ServerSupervisor};
    use crate::rpc::types::TermSize;
    use std::time::Duration;

    async fn start_test_server(
        replay_seed: &[u8],
        config: HubConfig,
    ) -> (std::net::SocketAddr, Arc<ConsoleHub>) {
        let replay = Arc::new(ReplayBuffer::default());
        if !replay_seed.is_empty() {
            replay.write(replay_seed);
        }
        let launch = LaunchConfig {
            command: "/bin/echo".to_string(),
            args: vec!["ready".to_string()],
            working_dir: None,
            initial_size: TermSize::default(),
            echo: false,
        };
        let (supervisor, output_rx) = ServerSupervisor::new(launch, replay.clone());
        let supervisor = Arc::new(supervisor);
        let monitor = Arc::new(ResourceMonitor::new(std::env::temp_dir()));
        let hub = Arc::new(ConsoleHub::new(
            supervisor.clone(),
            replay,
            monitor,
            config,
        ));
        hub.clone().start(output_rx);

        let server = Arc::new(RpcServer::new(
            RpcMethods::new(supervisor, hub.clone()),
            hub.clone(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, hub)
    }

    /// 读取直到出现包含指定 id 的响应行
    async fn read_response(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        id: i64,
    ) -> JsonRpcResponse {
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                if resp.id == serde_json::json!(id) {
                    return resp;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_state_request_over_tcp() {
        let (addr, _hub) = start_test_server(b"", HubConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"server.state\",\"id\":1}\n")
            .await
            .unwrap();

        let resp = read_response(&mut lines, 1).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "stopped");
    }

    #[tokio::test]
    async fn test_stop_conflict_over_tcp() {
        let (addr, _hub) = start_test_server(b"", HubConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"server.stop\",\"id\":2}\n")
            .await
            .unwrap();

        let resp = read_response(&mut lines, 2).await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, -32002);
        assert_eq!(error.data.unwrap()["conflict"], true);
    }

    #[tokio::test]
    async fn test_catch_up_notification_on_connect() {
        let (addr, _hub) = start_test_server(b"hello", HubConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // 连接后第一条消息是追赶快照通知
        let line = lines.next_line().await.unwrap().unwrap();
        let notification: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(notification["method"], "console.output");
        assert_eq!(notification["params"]["data"], "aGVsbG8=");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_parse_error() {
        let (addr, _hub) = start_test_server(b"", HubConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"not json at all\n").await.unwrap();

        let line = lines.next_line().await.unwrap().unwrap();
        let resp: JsonRpcResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.error.unwrap().code, -32700);
    }

    #[tokio::test]
    async fn test_wrong_jsonrpc_version_rejected() {
        let (addr, _hub) = start_test_server(b"", HubConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"jsonrpc\":\"1.0\",\"method\":\"server.state\",\"id\":3}\n")
            .await
            .unwrap();

        let resp = read_response(&mut lines, 3).await;
        assert_eq!(resp.error.unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_forced_disconnect_closes_socket() {
        use tokio::io::AsyncReadExt;

        let (addr, hub) = start_test_server(
            b"",
            HubConfig {
                queue_capacity: 2,
                state_interval: Duration::from_secs(60),
            },
        )
        .await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        // 等待连接完成订阅
        for _ in 0..100 {
            if hub.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count(), 1);

        // 客户端不读取：队列溢出后订阅者被广播中心移除
        for i in 0..100u8 {
            hub.broadcast(Frame::output(&[i; 64]));
        }
        assert_eq!(hub.subscriber_count(), 0);

        // 被移除的连接必须随之关闭：排空残留数据后读到 EOF
        let mut drained = Vec::new();
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            stream.read_to_end(&mut drained),
        )
        .await;
        assert!(read.is_ok(), "强制断开后连接仍未关闭");
    }
}
