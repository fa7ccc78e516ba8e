//! 资源用量采集
//!
//! 从 cgroup（v2 优先，回退 v1）读取内存与 CPU 用量，
//! 通过 statvfs 读取服务器目录所在文件系统的磁盘用量。
//! 文件不存在或解析失败时按"无限制/不可用"处理（上限为 0），
//! 不向调用方传播错误。
//!
//! CPU 使用率以核数表示（1.0 = 一个核满载），由相邻两次采样的
//! 累计用量差值计算，因此第一次采样的 CPU 使用率恒为 0。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 内存用量文件（cgroup v2 / v1）
const MEMORY_USAGE_PATHS: &[&str] = &[
    "/sys/fs/cgroup/memory.current",
    "/sys/fs/cgroup/memory/memory.usage_in_bytes",
];

/// 内存上限文件（cgroup v2 / v1）
const MEMORY_LIMIT_PATHS: &[&str] = &[
    "/sys/fs/cgroup/memory.max",
    "/sys/fs/cgroup/memory/memory.limit_in_bytes",
];

/// v1 未设上限时的占位值下界（接近地址空间上限的大数）
const MEMORY_UNLIMITED_THRESHOLD: u64 = 1 << 60;

/// 资源用量快照
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// 内存用量（字节）
    pub memory_usage: u64,
    /// 内存上限（字节，无限制为 0）
    pub memory_limit: u64,
    /// CPU 使用率（核数）
    pub cpu_usage: f64,
    /// CPU 上限（核数，无限制时为宿主核数）
    pub cpu_limit: f64,
    /// 磁盘用量（字节）
    pub disk_usage: u64,
    /// 磁盘总量（字节）
    pub disk_size: u64,
}

struct MonitorState {
    usage: ResourceUsage,
    last_cpu_ns: Option<u64>,
    last_sample: Option<Instant>,
}

/// 资源监视器
///
/// 定期采样并缓存最近一次的资源用量，`snapshot` 随时可读。
pub struct ResourceMonitor {
    /// 服务器数据目录，磁盘用量按其所在文件系统统计
    run_dir: PathBuf,
    inner: Mutex<MonitorState>,
}

impl ResourceMonitor {
    /// 创建资源监视器
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            inner: Mutex::new(MonitorState {
                usage: ResourceUsage::default(),
                last_cpu_ns: None,
                last_sample: None,
            }),
        }
    }

    /// 启动定期采样任务
    pub fn spawn(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.refresh();
            }
        });
    }

    /// 采样一次并更新缓存
    pub fn refresh(&self) {
        let memory_usage = read_first_u64(MEMORY_USAGE_PATHS).unwrap_or(0);
        let memory_limit = read_memory_limit();
        let cpu_limit = read_cpu_limit();
        let cpu_ns = read_cpu_usage_ns();
        let (disk_size, disk_usage) = match disk_stats(&self.run_dir) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::debug!("读取磁盘用量失败: {}", e);
                (0, 0)
            }
        };

        let now = Instant::now();
        let mut state = self.lock();
        let cpu_usage = match (cpu_ns, state.last_cpu_ns, state.last_sample) {
            (Some(current), Some(previous), Some(at)) => {
                let elapsed = now.duration_since(at).as_nanos() as u64;
                if elapsed > 0 && current >= previous {
                    (current - previous) as f64 / elapsed as f64
                } else {
                    state.usage.cpu_usage
                }
            }
            _ => 0.0,
        };
        state.last_cpu_ns = cpu_ns;
        state.last_sample = Some(now);
        state.usage = ResourceUsage {
            memory_usage,
            memory_limit,
            cpu_usage,
            cpu_limit,
            disk_usage,
            disk_size,
        };
    }

    /// 返回最近一次采样的资源用量
    pub fn snapshot(&self) -> ResourceUsage {
        self.lock().usage
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 依次尝试读取文件列表，返回第一个成功解析出的数值
fn read_first_u64(paths: &[&str]) -> Option<u64> {
    for path in paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(value) = content.trim().parse::<u64>() {
                return Some(value);
            }
        }
    }
    None
}

/// 读取内存上限，未设置时返回 0
fn read_memory_limit() -> u64 {
    for path in MEMORY_LIMIT_PATHS {
        if let Ok(content) = std::fs::read_to_string(path) {
            let trimmed = content.trim();
            // v2 用 "max" 表示无限制
            if trimmed == "max" {
                return 0;
            }
            if let Ok(value) = trimmed.parse::<u64>() {
                // v1 未设上限时是一个接近 u64 上限的占位值
                if value >= MEMORY_UNLIMITED_THRESHOLD {
                    return 0;
                }
                return value;
            }
        }
    }
    0
}

/// 读取 CPU 上限（核数）
///
/// cgroup 未设配额时回退到宿主逻辑核数。
fn read_cpu_limit() -> f64 {
    // cgroup v2: "<quota> <period>" 或 "max <period>"
    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(limit) = parse_cpu_max(&content) {
            return limit;
        }
    }
    // cgroup v1: cfs_quota_us / cfs_period_us，-1 表示无限制
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok());
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok());
    if let (Some(quota), Some(period)) = (quota, period) {
        if quota > 0 && period > 0 {
            return quota as f64 / period as f64;
        }
    }
    host_cpu_count()
}

/// 解析 cgroup v2 的 cpu.max 内容；无限制返回 None
fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: f64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0.0 {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    Some(quota / period)
}

fn host_cpu_count() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

/// 读取累计 CPU 用量（纳秒）
fn read_cpu_usage_ns() -> Option<u64> {
    // cgroup v2: cpu.stat 的 usage_usec 行
    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.stat") {
        if let Some(usec) = parse_cpu_stat_usec(&content) {
            return Some(usec * 1000);
        }
    }
    // cgroup v1: cpuacct.usage 直接是纳秒
    std::fs::read_to_string("/sys/fs/cgroup/cpuacct/cpuacct.usage")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// 从 cpu.stat 内容提取 usage_usec 值
fn parse_cpu_stat_usec(content: &str) -> Option<u64> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("usage_usec") {
            return parts.next()?.parse().ok();
        }
    }
    None
}

/// 读取路径所在文件系统的（总量, 用量）字节数
fn disk_stats(path: &Path) -> std::io::Result<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let available = stat.f_bavail as u64 * frsize;
    Ok((total, total.saturating_sub(available)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_max() {
        assert_eq!(parse_cpu_max("200000 100000\n"), Some(2.0));
        assert_eq!(parse_cpu_max("50000 100000"), Some(0.5));
        assert_eq!(parse_cpu_max("max 100000\n"), None);
        assert_eq!(parse_cpu_max("garbage"), None);
        assert_eq!(parse_cpu_max(""), None);
    }

    #[test]
    fn test_parse_cpu_stat_usec() {
        let content = "usage_usec 1234567\nuser_usec 1000000\nsystem_usec 234567\n";
        assert_eq!(parse_cpu_stat_usec(content), Some(1234567));
        assert_eq!(parse_cpu_stat_usec("user_usec 100\n"), None);
        assert_eq!(parse_cpu_stat_usec(""), None);
    }

    #[test]
    fn test_disk_stats_on_temp_dir() {
        let (total, usage) = disk_stats(&std::env::temp_dir()).unwrap();
        assert!(total > 0);
        assert!(usage <= total);
    }

    #[test]
    fn test_disk_stats_nonexistent_path() {
        assert!(disk_stats(Path::new("/nonexistent/path-xyz")).is_err());
    }

    #[test]
    fn test_snapshot_before_refresh_is_zero() {
        let monitor = ResourceMonitor::new(std::env::temp_dir());
        assert_eq!(monitor.snapshot(), ResourceUsage::default());
    }

    #[test]
    fn test_refresh_populates_disk_and_cpu_limit() {
        let monitor = ResourceMonitor::new(std::env::temp_dir());
        monitor.refresh();
        let usage = monitor.snapshot();
        assert!(usage.disk_size > 0);
        assert!(usage.cpu_limit > 0.0);
        // 第一次采样没有 CPU 差值可算
        assert_eq!(usage.cpu_usage, 0.0);
    }

    #[test]
    fn test_host_cpu_count_positive() {
        assert!(host_cpu_count() >= 1.0);
    }
}
