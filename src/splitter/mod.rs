/// 报文分割器: 判断累积字节中是否已有完整帧
///
/// 分割器从不消费字节 (消费是会话的职责), 因此对同一段未消费缓冲
/// 重复调用是幂等的; 逐字节喂入与整段喂入得到相同的帧边界。
mod fixed;
mod http;
mod line;
mod timed;
mod websocket;

pub use fixed::FixedLengthSplitter;
pub use http::{HttpSplitter, WEBSOCKET_MODE_ATTR};
pub use line::LineSplitter;
pub use timed::TimedSplitter;
pub use websocket::WebSocketSplitter;

use crate::buffer::ByteAccumulator;
use crate::session::SessionHandle;

/// 分割判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitResult {
    /// 还需要更多字节
    Incomplete,
    /// 协议违规, 会话必须关闭
    Invalid,
    /// 缓冲区头部起 n 字节构成一个完整帧
    Frame(usize),
}

pub trait MessageSplitter: Send + Sync {
    fn can_split(&self, session: &SessionHandle, accumulated: &ByteAccumulator) -> SplitResult;
}

/// 每条会话持有独立的分割器实例 (分割器可以有状态, 比如按时间聚帧)
pub type SplitterFactory =
    std::sync::Arc<dyn Fn() -> Box<dyn MessageSplitter> + Send + Sync>;
