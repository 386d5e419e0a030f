//! evsock - 事件驱动套接字引擎
//!
//! 把 "就绪式" 和 "完成式" 两种 I/O 模型收敛到同一套会话契约之下:
//! 字节经分割器组装成帧, 帧经对称过滤链变换为应用对象,
//! 生命周期事件在自适应线程池上按会话串行派发。
//!
//! ```no_run
//! use evsock::{LineSplitter, Message, SocketServer};
//! use evsock::handler::Handler;
//! use evsock::session::SessionHandle;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_receive(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
//!         Some(message)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SocketServer::builder()
//!         .bind("127.0.0.1:9000")
//!         .handler(Echo)
//!         .splitter(|| LineSplitter)
//!         .build()?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod handler;
pub mod heartbeat;
pub mod pool;
pub(crate) mod reactor;
pub mod server;
pub mod session;
pub mod splitter;
pub mod timer;
pub mod tls;

pub use client::{NoopHandler, SocketClient};
pub use config::{EngineConfig, ReactorModel};
pub use context::EngineContext;
pub use dispatcher::SessionEvent;
pub use error::{CloseReason, TransportError};
pub use filter::{Filter, FilterChain, JsonFilter, Message, StringFilter};
pub use handler::Handler;
pub use heartbeat::Heartbeat;
pub use server::SocketServer;
pub use session::{SessionHandle, SessionState};
pub use splitter::{
    FixedLengthSplitter, HttpSplitter, LineSplitter, MessageSplitter, SplitResult,
    TimedSplitter, WebSocketSplitter,
};
pub use tls::TlsConfig;

/// 统一的结果类型
pub type Result<T> = std::result::Result<T, TransportError>;

/// 会话唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
