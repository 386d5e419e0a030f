use std::time::Duration;

use super::{MessageSplitter, SplitResult};
use crate::buffer::ByteAccumulator;
use crate::session::SessionHandle;

/// 超时分割器
///
/// 用于没有显式终止符的协议: 自首字节到达起超过配置时长后,
/// 当前累积的全部字节视为一帧, 与内容无关。
pub struct TimedSplitter {
    timeout: Duration,
}

impl TimedSplitter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl MessageSplitter for TimedSplitter {
    fn can_split(&self, _session: &SessionHandle, accumulated: &ByteAccumulator) -> SplitResult {
        match accumulated.age() {
            Some(age) if age >= self.timeout && !accumulated.is_empty() => {
                SplitResult::Frame(accumulated.len())
            }
            _ => SplitResult::Incomplete,
        }
    }
}
