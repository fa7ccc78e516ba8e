//! 进程监管器
//!
//! 管理唯一的服务器进程及其 PTY 的完整生命周期：
//! Start/Stop/Kill/Restart/Write/SendCommand/Resize。
//!
//! 状态机：`Stopped --Start--> Running --Stop--> Stopping --(进程退出)--> Stopped`；
//! Kill 在 Running/Stopping 下直接触发进程退出。任意时刻最多存在
//! 一对存活的进程/PTY 句柄；Running/Stopping 期间的第二次 Start
//! 返回 AlreadyRunning 而不是替换句柄。
//!
//! 输出由唯一的读取任务摄取（保证字节全序），同时写入回放缓冲区、
//! 可选的本地回显和广播中心的输出通道。输出通道满时丢弃该块而
//! 不阻塞读取任务（与订阅者队列"满即断开"是两种不同的背压策略）。

use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

use super::pty::ServerPty;
use super::replay::ReplayBuffer;
use crate::rpc::types::{ServerStatus, TermSize};
use crate::utils::error::RunnerError;

/// PTY 读取缓冲区大小
const READ_BUFFER_SIZE: usize = 4096;

/// 输出通道容量（读取任务 -> 广播中心）
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// SIGTERM 导致的退出码（128 + 15）
const SIGTERM_EXIT_CODE: u32 = 143;

/// 状态变更监听器
pub type StatusListener = Box<dyn Fn(ServerStatus) + Send + Sync>;

/// 服务器进程启动配置
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// 启动命令
    pub command: String,
    /// 命令参数
    pub args: Vec<String>,
    /// 工作目录
    pub working_dir: Option<PathBuf>,
    /// 初始终端尺寸
    pub initial_size: TermSize,
    /// 是否将输出回显到本进程 stdout
    pub echo: bool,
}

impl LaunchConfig {
    /// 创建新的启动配置（默认尺寸 80x24，开启回显）
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
            initial_size: TermSize::default(),
            echo: true,
        }
    }
}

/// 进程终止结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    /// 退出码；被信号终止时为 128 + 信号值
    pub code: u32,
}

impl ExitResult {
    /// 是否正常退出（退出码 0）
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// 是否为"干净停止"
    ///
    /// 正常退出，或被预期的终止信号（SIGTERM，退出码 143）终止。
    /// Stop() 将干净停止视为成功而非错误。
    pub fn is_clean_stop(&self) -> bool {
        self.code == 0 || self.code == SIGTERM_EXIT_CODE
    }
}

struct Inner {
    status: ServerStatus,
    /// 进程存活期间的 PTY 句柄；子进程句柄由退出监视任务取走
    pty: Option<ServerPty>,
    pid: Option<u32>,
    start_time: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
    /// 当前（或最近一次）运行的退出通知接收端
    exit_rx: Option<watch::Receiver<Option<ExitResult>>>,
}

/// 监听器与运行时状态的共享部分（退出监视任务持有一份引用）
struct Shared {
    inner: Mutex<Inner>,
    /// PTY 写入端用独立的锁，阻塞在 PTY 写入上时不占用状态锁
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    listeners: Mutex<Vec<StatusListener>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 通知所有状态监听器
    fn notify(&self, status: ServerStatus) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(status);
        }
    }
}

/// 进程监管器
///
/// 进程级单例：一个监管器对应一个服务器进程。
pub struct ServerSupervisor {
    config: LaunchConfig,
    replay: Arc<ReplayBuffer>,
    output_tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl ServerSupervisor {
    /// 创建监管器，返回监管器和输出通道接收端
    ///
    /// 接收端交给广播中心消费；监管器的 PTY 读取任务是通道的
    /// 唯一生产者。
    pub fn new(
        config: LaunchConfig,
        replay: Arc<ReplayBuffer>,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let supervisor = Self {
            config,
            replay,
            output_tx,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: ServerStatus::Stopped,
                    pty: None,
                    pid: None,
                    start_time: None,
                    exit_result: None,
                    exit_rx: None,
                }),
                writer: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
        };
        (supervisor, output_rx)
    }

    /// 注册状态变更监听器
    ///
    /// 监听器列表支持多个消费者；每次状态转换按注册顺序逐个调用。
    pub fn on_status_changed<F>(&self, listener: F)
    where
        F: Fn(ServerStatus) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// 启动服务器进程
    ///
    /// 状态不为 Stopped 时返回 AlreadyRunning；spawn 失败时返回错误
    /// 且状态保持不变。成功后启动 PTY 读取任务和退出监视任务。
    pub fn start(&self) -> Result<(), RunnerError> {
        let (reader, child, exit_tx) = {
            let mut inner = self.shared.lock();
            if inner.status != ServerStatus::Stopped {
                return Err(RunnerError::AlreadyRunning);
            }

            let mut pty = ServerPty::spawn(
                &self.config.command,
                &self.config.args,
                self.config.working_dir.as_deref(),
                self.config.initial_size,
            )?;
            let reader = pty.try_clone_reader()?;
            let child = pty
                .take_child()
                .ok_or_else(|| RunnerError::SpawnFailed("子进程句柄缺失".to_string()))?;
            let writer = pty
                .take_writer()
                .ok_or_else(|| RunnerError::SpawnFailed("PTY 写入端缺失".to_string()))?;

            let (exit_tx, exit_rx) = watch::channel(None);
            inner.pid = pty.pid();
            inner.start_time = Some(Utc::now());
            inner.exit_result = None;
            inner.exit_rx = Some(exit_rx);
            inner.pty = Some(pty);
            inner.status = ServerStatus::Running;
            *self
                .shared
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(writer);
            tracing::info!("服务器进程已启动: pid={:?}", inner.pid);
            (reader, child, exit_tx)
        };

        self.shared.notify(ServerStatus::Running);
        self.spawn_reader(reader);
        self.spawn_exit_watcher(child, exit_tx);
        Ok(())
    }

    /// PTY 读取任务：唯一的输出摄取点
    fn spawn_reader(&self, reader: Box<dyn Read + Send>) {
        let replay = self.replay.clone();
        let output_tx = self.output_tx.clone();
        let echo = self.config.echo;

        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::info!("PTY 输出 EOF，进程已退出");
                        break;
                    }
                    Ok(n) => {
                        let chunk = &buffer[..n];
                        replay.write(chunk);
                        if echo {
                            let mut stdout = std::io::stdout();
                            let _ = stdout.write_all(chunk);
                            let _ = stdout.flush();
                        }
                        match output_tx.try_send(chunk.to_vec()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // 不阻塞唯一的生产者：丢弃该块
                                tracing::warn!("输出通道已满，丢弃 {} 字节", n);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                // 广播中心已关闭，继续排空 PTY 防止子进程阻塞
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!("读取 PTY 输出结束: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// 退出监视任务：回收进程，清理句柄并广播 Stopped
    fn spawn_exit_watcher(
        &self,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        exit_tx: watch::Sender<Option<ExitResult>>,
    ) {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let exit = match child.wait() {
                Ok(status) => ExitResult {
                    code: status.exit_code(),
                },
                Err(e) => {
                    tracing::error!("等待进程退出失败: {}", e);
                    ExitResult { code: 1 }
                }
            };
            {
                let mut inner = shared.lock();
                inner.exit_result = Some(exit);
                inner.status = ServerStatus::Stopped;
                // 进程与 PTY 句柄同生共死：丢弃 ServerPty 即关闭 PTY
                inner.pty = None;
                inner.pid = None;
                inner.start_time = None;
                *shared
                    .writer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = None;
            }
            tracing::info!("服务器进程已退出: 退出码 {}", exit.code);
            let _ = exit_tx.send(Some(exit));
            shared.notify(ServerStatus::Stopped);
        });
    }

    /// 优雅停止服务器进程
    ///
    /// 发送 SIGTERM，状态转为 Stopping，阻塞直到退出监视任务完成。
    /// 干净停止（退出码 0 或 143）返回 Ok；其他退出返回 AbnormalExit。
    /// 进程恰在发信号前退出时视为信号已生效，照常等待收尾。
    /// 不做超时升级——需要硬截止时间的调用方自行计时并调用 kill()。
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let pid = {
            let mut inner = self.shared.lock();
            if inner.status == ServerStatus::Stopped {
                return Err(RunnerError::NotRunning);
            }
            let pid = inner.pid.ok_or(RunnerError::NotRunning)?;
            inner.status = ServerStatus::Stopping;
            pid
        };
        self.shared.notify(ServerStatus::Stopping);
        tracing::info!("发送 SIGTERM 到进程 {}", pid);

        send_sigterm(pid)?;

        let exit = self.wait().await?;
        if exit.is_clean_stop() {
            Ok(())
        } else {
            Err(RunnerError::AbnormalExit(exit.code))
        }
    }

    /// 强制终止服务器进程（SIGKILL），立即返回
    ///
    /// 清理工作仍由退出监视任务异步完成。
    pub fn kill(&self) -> Result<(), RunnerError> {
        let mut inner = self.shared.lock();
        if inner.status == ServerStatus::Stopped {
            return Err(RunnerError::NotRunning);
        }
        let pty = inner.pty.as_mut().ok_or(RunnerError::NotRunning)?;
        tracing::info!("强制终止服务器进程");
        pty.kill()
    }

    /// 重启服务器进程：Stop 后 Start；Stop 失败则不尝试 Start
    pub async fn restart(&self) -> Result<(), RunnerError> {
        self.stop().await?;
        self.start()
    }

    /// 写入数据到服务器控制台（PTY master）
    ///
    /// 写入端持有独立的锁，阻塞在 PTY 写入上时状态查询与其他操作
    /// 不受影响。
    pub fn write(&self, data: &[u8]) -> Result<usize, RunnerError> {
        let mut guard = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let writer = guard.as_mut().ok_or(RunnerError::NotRunning)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    /// 发送控制台命令，末尾无换行符时自动补上
    pub fn send_command(&self, command: &str) -> Result<(), RunnerError> {
        let line = ensure_trailing_newline(command);
        self.write(line.as_bytes())?;
        Ok(())
    }

    /// 调整 PTY 窗口大小
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), RunnerError> {
        let inner = self.shared.lock();
        let pty = inner.pty.as_ref().ok_or(RunnerError::NotRunning)?;
        pty.resize(TermSize { rows, cols })
    }

    /// 获取当前状态
    pub fn status(&self) -> ServerStatus {
        self.shared.lock().status
    }

    /// 获取进程 ID（仅进程存活期间）
    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    /// 获取启动时间（仅进程存活期间）
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().start_time
    }

    /// 获取最近一次的终止结果
    pub fn exit_result(&self) -> Option<ExitResult> {
        self.shared.lock().exit_result
    }

    /// 等待进程退出并返回终止结果
    ///
    /// 进程已退出时立即返回最近的结果；从未启动过时返回 NotRunning。
    pub async fn wait(&self) -> Result<ExitResult, RunnerError> {
        let mut rx = {
            let inner = self.shared.lock();
            inner.exit_rx.clone().ok_or(RunnerError::NotRunning)?
        };
        loop {
            if let Some(exit) = *rx.borrow() {
                return Ok(exit);
            }
            rx.changed().await.map_err(|_| RunnerError::NotRunning)?;
        }
    }
}

/// 向进程发送 SIGTERM
///
/// ESRCH 表示进程已经退出并被回收，视为信号已生效，
/// 收尾交给退出监视任务。
fn send_sigterm(pid: u32) -> Result<(), RunnerError> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(RunnerError::IoError(err))
}

/// 为命令补上末尾换行符（已有则不重复）
fn ensure_trailing_newline(command: &str) -> String {
    if command.ends_with('\n') {
        command.to_string()
    } else {
        format!("{}\n", command)
    }
}
