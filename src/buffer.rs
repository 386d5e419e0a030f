use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::TransportError;

/// 字节累积器
///
/// 保存已接收但尚未组成完整帧的字节。只允许所属会话的 I/O 任务写入,
/// 分割器只读取, 切出的帧以 `Bytes` 所有权副本交给上层, 绝不共享活动缓冲区。
pub struct ByteAccumulator {
    buf: BytesMut,
    limit: usize,
    /// 当前未消费数据的首字节到达时间, 供超时分割器使用
    first_byte_at: Option<Instant>,
}

impl ByteAccumulator {
    /// 创建累积器, `limit` 是帧完成前允许缓冲的最大字节数
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096.min(limit)),
            limit,
            first_byte_at: None,
        }
    }

    /// 追加收到的字节
    ///
    /// 超过上限返回 `OversizedFrame`, 按协议违规处理。
    pub fn append(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.buf.len() + data.len() > self.limit {
            return Err(TransportError::OversizedFrame {
                buffered: self.buf.len() + data.len(),
                limit: self.limit,
            });
        }
        if self.buf.is_empty() {
            self.first_byte_at = Some(Instant::now());
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// 查看当前未消费的全部字节, 不移动任何游标
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// 从头部消费 `n` 字节, 返回所有权副本
    ///
    /// 调用方必须保证 `n <= len()`, 即分割器刚刚返回过 `Frame(n)`。
    pub fn consume(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.buf.len());
        let frame = self.buf.split_to(n).freeze();
        if self.buf.is_empty() {
            self.first_byte_at = None;
            self.compact();
        }
        frame
    }

    /// 未消费字节数
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 首字节已等待的时长, 缓冲区为空时为 None
    pub fn age(&self) -> Option<Duration> {
        self.first_byte_at.map(|at| at.elapsed())
    }

    /// 丢弃全部未消费字节
    pub fn clear(&mut self) {
        self.buf.clear();
        self.first_byte_at = None;
    }

    /// 收缩底层存储, 避免单个大帧之后长期占用容量
    fn compact(&mut self) {
        if self.buf.capacity() > 64 * 1024 {
            self.buf = BytesMut::with_capacity(4096);
        }
    }
}
