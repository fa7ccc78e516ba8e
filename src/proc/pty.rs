//! 服务器进程 PTY 封装
//!
//! 使用 portable-pty 创建伪终端并在其上启动服务器进程。
//! 子进程的 stdin/stdout/stderr 全部由 PTY 接管。

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;

use crate::rpc::types::TermSize;
use crate::utils::error::RunnerError;

/// 附着在 PTY 上的服务器进程
///
/// master/writer/killer 与子进程句柄同生共死：进程退出后整个
/// 结构被丢弃，PTY 随之关闭。
pub struct ServerPty {
    /// PTY master
    master: Box<dyn MasterPty + Send>,
    /// PTY writer（子进程的 stdin），由监管器取走
    writer: Option<Box<dyn Write + Send>>,
    /// 子进程句柄，由退出监视任务取走
    child: Option<Box<dyn Child + Send + Sync>>,
    /// 终止器，子进程被取走后仍可用于 Kill
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// 进程 ID
    pid: Option<u32>,
}

impl ServerPty {
    /// 创建 PTY 并在其上启动服务器进程
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        size: TermSize,
    ) -> Result<Self, RunnerError> {
        let pty_system = native_pty_system();

        let pty_size = PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(pty_size)
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        if let Some(dir) = working_dir {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

        // slave 端只用于 spawn，master 端归监管器所有
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

        let killer = child.clone_killer();
        let pid = child.process_id();

        Ok(Self {
            master: pair.master,
            writer: Some(writer),
            child: Some(child),
            killer,
            pid,
        })
    }

    /// 获取 PTY reader（用于读取输出）
    pub fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, RunnerError> {
        self.master
            .try_clone_reader()
            .map_err(|e| RunnerError::IoError(std::io::Error::other(e.to_string())))
    }

    /// 取走子进程句柄（退出监视任务持有）
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    /// 取走 PTY 写入端（子进程的 stdin）
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    /// 调整 PTY 窗口大小
    pub fn resize(&self, size: TermSize) -> Result<(), RunnerError> {
        self.master
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RunnerError::IoError(std::io::Error::other(e.to_string())))
    }

    /// 强制终止子进程（SIGKILL）
    pub fn kill(&mut self) -> Result<(), RunnerError> {
        self.killer.kill().map_err(RunnerError::IoError)
    }

    /// 获取进程 ID
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}
