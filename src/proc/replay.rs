//! 回放缓冲区
//!
//! 固定容量的环形字节缓冲区，保留最近产生的控制台输出。
//! 新订阅者连接时通过 `snapshot` 获取"追赶"上下文。
//!
//! 写入超过容量时丢弃最旧的字节；单次写入超过容量时只保留
//! 末尾 `capacity` 字节。单写多读：PTY 读取任务是唯一写入者，
//! 任意数量的订阅者可并发快照。

use std::sync::{Mutex, PoisonError};

/// 默认缓冲区容量（1 MiB）
pub const DEFAULT_CAPACITY: usize = 1 << 20;

/// 回放缓冲区
pub struct ReplayBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    buf: Vec<u8>,
    start: usize,
    size: usize,
}

impl ReplayBuffer {
    /// 创建指定容量的回放缓冲区
    ///
    /// 容量为 0 时使用默认容量 1 MiB。
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                start: 0,
                size: 0,
            }),
            capacity,
        }
    }

    /// 获取缓冲区容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 获取当前内容长度
    pub fn len(&self) -> usize {
        self.lock().size
    }

    /// 检查缓冲区是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 写入一块数据
    ///
    /// 超出容量时淘汰最旧的字节；块本身超过容量时整个内容被
    /// 替换为块的末尾 `capacity` 字节。
    pub fn write(&self, chunk: &[u8]) {
        let n = chunk.len();
        if n == 0 {
            return;
        }
        let cap = self.capacity;
        let mut inner = self.lock();

        // 超大块：只保留末尾 cap 字节，逻辑内容整体替换
        if n >= cap {
            inner.buf.copy_from_slice(&chunk[n - cap..]);
            inner.start = 0;
            inner.size = cap;
            return;
        }

        // 先淘汰将被覆盖的旧字节
        if inner.size + n > cap {
            let over = inner.size + n - cap;
            inner.start = (inner.start + over) % cap;
            inner.size -= over;
        }

        // 写入位置可能跨越环的末尾，分两段复制
        let widx = (inner.start + inner.size) % cap;
        let tail = cap - widx;
        if n <= tail {
            inner.buf[widx..widx + n].copy_from_slice(chunk);
        } else {
            inner.buf[widx..].copy_from_slice(&chunk[..tail]);
            inner.buf[..n - tail].copy_from_slice(&chunk[tail..]);
        }
        inner.size += n;
    }

    /// 返回当前内容的有序拷贝
    ///
    /// 不阻塞并发写入（写入者只短暂持锁），返回值始终是
    /// 连续、按产生顺序排列的副本。
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = vec![0u8; inner.size];
        if inner.size == 0 {
            return out;
        }
        let tail = self.capacity - inner.start;
        if inner.size <= tail {
            out.copy_from_slice(&inner.buf[inner.start..inner.start + inner.size]);
        } else {
            out[..tail].copy_from_slice(&inner.buf[inner.start..]);
            out[tail..].copy_from_slice(&inner.buf[..inner.size - tail]);
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}


/// Property-based tests for the replay buffer
/// 有界历史定律：任意写入序列后，快照等于全部写入内容的末尾 capacity 字节。
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Strategy for generating chunk sequences
    fn chunks_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..32)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// *对于任意*写入块序列，快照等于拼接后内容的末尾 capacity 字节
        #[test]
        fn prop_snapshot_is_tail_of_written(chunks in chunks_strategy(), cap in 1usize..128) {
            let buf = ReplayBuffer::new(cap);
            let mut all: Vec<u8> = Vec::new();
            for chunk in &chunks {
                buf.write(chunk);
                all.extend_from_slice(chunk);
            }
            let expected_start = all.len().saturating_sub(cap);
            prop_assert_eq!(buf.snapshot(), &all[expected_start..]);
        }

        /// *对于任意*写入序列，内容长度不超过容量
        #[test]
        fn prop_size_never_exceeds_capacity(chunks in chunks_strategy(), cap in 1usize..128) {
            let buf = ReplayBuffer::new(cap);
            for chunk in &chunks {
                buf.write(chunk);
                prop_assert!(buf.len() <= cap);
            }
        }
    }
}
