use super::{MessageSplitter, SplitResult};
use crate::buffer::ByteAccumulator;
use crate::session::SessionHandle;

/// 定长分割器: 累积到配置的字节数即为一帧
pub struct FixedLengthSplitter {
    frame_size: usize,
}

impl FixedLengthSplitter {
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame size must be positive");
        Self { frame_size }
    }
}

impl MessageSplitter for FixedLengthSplitter {
    fn can_split(&self, _session: &SessionHandle, accumulated: &ByteAccumulator) -> SplitResult {
        if accumulated.len() >= self.frame_size {
            SplitResult::Frame(self.frame_size)
        } else {
            SplitResult::Incomplete
        }
    }
}
