//! 控制台广播中心
//!
//! 把监管器的单一输出流扇出给 N 个订阅者，并处理订阅者的
//! 输入与调整终端大小请求。每个订阅者持有一条有界帧队列；
//! 新订阅者先收到回放缓冲区的追赶快照，再按序接收后续输出。
//!
//! 背压策略与生产者路径相反：订阅者队列满即移除该订阅者
//! （慢消费者不拖垮整体），而不是丢帧继续。

pub mod frame;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::ResourceMonitor;
use crate::proc::{ReplayBuffer, ServerSupervisor};
use crate::rpc::types::ServerStatus;
use crate::utils::error::RunnerError;

pub use frame::{Frame, ServerState};

/// 广播中心配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 每个订阅者的帧队列容量
    pub queue_capacity: usize,
    /// 复合状态广播间隔
    pub state_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            state_interval: Duration::from_secs(5),
        }
    }
}

/// 控制台广播中心
pub struct ConsoleHub {
    supervisor: Arc<ServerSupervisor>,
    replay: Arc<ReplayBuffer>,
    monitor: Arc<ResourceMonitor>,
    config: HubConfig,
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Frame>>>,
    closed: AtomicBool,
}

impl ConsoleHub {
    /// 创建广播中心
    pub fn new(
        supervisor: Arc<ServerSupervisor>,
        replay: Arc<ReplayBuffer>,
        monitor: Arc<ResourceMonitor>,
        config: HubConfig,
    ) -> Self {
        Self {
            supervisor,
            replay,
            monitor,
            config,
            subscribers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// 启动广播循环
    ///
    /// 注册状态监听器，并启动输出泵与复合状态定时广播两个任务。
    /// `output_rx` 是监管器的输出通道接收端。
    pub fn start(self: Arc<Self>, mut output_rx: mpsc::Receiver<Vec<u8>>) {
        // 监听器通过弱引用持有广播中心，避免与监管器形成引用环
        let weak: Weak<ConsoleHub> = Arc::downgrade(&self);
        self.supervisor.on_status_changed(move |status| {
            if let Some(hub) = weak.upgrade() {
                let exit_code = match status {
                    ServerStatus::Stopped => hub.supervisor.exit_result().map(|e| e.code),
                    _ => None,
                };
                hub.broadcast(Frame::Status { status, exit_code });
            }
        });

        // 输出泵：唯一的消费者，保证所有订阅者看到同一字节顺序
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                hub.broadcast(Frame::output(&chunk));
            }
            tracing::debug!("输出通道已关闭，输出泵退出");
        });

        // 复合状态定时广播
        let interval = self.config.state_interval;
        let hub = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if hub.closed.load(Ordering::SeqCst) {
                    break;
                }
                hub.broadcast(Frame::State(hub.server_state()));
            }
        });
    }

    /// 注册新订阅者
    ///
    /// 返回订阅者 ID 和帧队列接收端。回放缓冲区非空时，队列中的
    /// 第一帧是追赶快照，其后的输出帧保证不与快照重叠或乱序。
    pub fn subscribe(&self) -> Result<(Uuid, mpsc::Receiver<Frame>), RunnerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        // 持锁期间完成快照和注册，保证追赶快照与后续广播帧无缝衔接
        let mut subscribers = self.lock_subscribers();
        let snapshot = self.replay.snapshot();
        if !snapshot.is_empty() {
            // 新建的队列必然有空位
            let _ = tx.try_send(Frame::output(&snapshot));
        }
        let id = Uuid::new_v4();
        subscribers.insert(id, tx);
        tracing::info!("订阅者已连接: {} (当前 {} 个)", id, subscribers.len());
        Ok((id, rx))
    }

    /// 移除订阅者
    pub fn unsubscribe(&self, id: &Uuid) {
        let mut subscribers = self.lock_subscribers();
        if subscribers.remove(id).is_some() {
            tracing::info!("订阅者已断开: {} (剩余 {} 个)", id, subscribers.len());
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// 广播一帧给所有订阅者
    ///
    /// 队列已满或已关闭的订阅者被当场移除。
    pub fn broadcast(&self, frame: Frame) {
        let mut subscribers = self.lock_subscribers();
        let mut dead = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("订阅者 {} 队列已满，断开连接", id);
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }

    /// 发送一帧给指定订阅者
    pub fn send_to(&self, id: &Uuid, frame: Frame) -> Result<(), RunnerError> {
        let mut subscribers = self.lock_subscribers();
        let tx = subscribers
            .get(id)
            .ok_or_else(|| RunnerError::SubscriberNotFound(id.to_string()))?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(_) => {
                subscribers.remove(id);
                Err(RunnerError::SubscriberQueueFull(id.to_string()))
            }
        }
    }

    /// 处理订阅者的控制台输入（Base64 编码）
    ///
    /// 进程未运行时向该订阅者推送错误帧并返回 NotRunning，
    /// 其余订阅者不受影响。
    pub fn handle_input(&self, subscriber_id: &Uuid, data: &str) -> Result<usize, RunnerError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| RunnerError::InvalidRequest(format!("输入数据解码失败: {}", e)))?;
        match self.supervisor.write(&bytes) {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = self.send_to(
                    subscriber_id,
                    Frame::Error {
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// 处理订阅者的调整终端大小请求
    pub fn handle_resize(
        &self,
        subscriber_id: &Uuid,
        rows: u16,
        cols: u16,
    ) -> Result<(), RunnerError> {
        match self.supervisor.resize(rows, cols) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.send_to(
                    subscriber_id,
                    Frame::Error {
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// 合成当前的复合状态快照
    pub fn server_state(&self) -> ServerState {
        let status = self.supervisor.status();
        let pid = self.supervisor.pid();
        let uptime_sec = self
            .supervisor
            .start_time()
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let usage = self.monitor.snapshot();
        ServerState {
            status,
            pid,
            uptime_sec,
            memory_usage: usage.memory_usage,
            memory_limit: usage.memory_limit,
            cpu_usage: usage.cpu_usage,
            cpu_limit: usage.cpu_limit,
            disk_usage: usage.disk_usage,
            disk_size: usage.disk_size,
        }
    }

    /// 关闭广播中心：拒绝新订阅并断开所有现有订阅者
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut subscribers = self.lock_subscribers();
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            tracing::info!("广播中心已关闭，断开 {} 个订阅者", count);
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<Uuid, mpsc::Sender<Frame>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
