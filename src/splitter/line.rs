use super::{MessageSplitter, SplitResult};
use crate::buffer::ByteAccumulator;
use crate::session::SessionHandle;

/// 行分割器: 帧在第一个 `\n` 处结束 (含换行符本身)
pub struct LineSplitter;

impl MessageSplitter for LineSplitter {
    fn can_split(&self, _session: &SessionHandle, accumulated: &ByteAccumulator) -> SplitResult {
        match accumulated.peek().iter().position(|byte| *byte == b'\n') {
            Some(index) => SplitResult::Frame(index + 1),
            None => SplitResult::Incomplete,
        }
    }
}
