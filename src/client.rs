use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::context::EngineContext;
use crate::dispatcher::EventDispatcher;
use crate::error::TransportError;
use crate::filter::FilterChain;
use crate::handler::Handler;
use crate::reactor::{driver_for, prepare, SessionSetup};
use crate::session::SessionHandle;
use crate::splitter::SplitterFactory;
use crate::tls::TlsEngine;
use crate::SessionId;

/// 客户端会话 ID 独立编号, 避免与服务器侧混淆
static NEXT_CLIENT_SESSION: AtomicU64 = AtomicU64::new(1);

/// 不关心回调的客户端用这个占位 Handler
pub struct NoopHandler;

impl Handler for NoopHandler {}

/// 套接字客户端
///
/// 一个实例描述一种连接方式 (协议栈 + 回调), 可多次 connect 建立多条会话;
/// 返回的 SessionHandle 与服务器侧同型, 收发语义完全一致。
pub struct SocketClient {
    context: Arc<EngineContext>,
    dispatcher: EventDispatcher,
    chain: Arc<FilterChain>,
    splitter_factory: SplitterFactory,
    server_name: Option<String>,
}

pub struct SocketClientBuilder {
    context: Option<Arc<EngineContext>>,
    handler: Option<Arc<dyn Handler>>,
    chain: FilterChain,
    splitter_factory: Option<SplitterFactory>,
    server_name: Option<String>,
}

impl SocketClientBuilder {
    pub fn context(mut self, context: Arc<EngineContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn filter_chain(mut self, chain: FilterChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn splitter<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: crate::splitter::MessageSplitter + 'static,
    {
        self.splitter_factory = Some(Arc::new(move || Box::new(factory())));
        self
    }

    /// TLS 证书校验用的主机名, 默认取连接地址的主机部分
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<SocketClient, TransportError> {
        let context = self.context.unwrap_or_else(EngineContext::with_defaults);
        let handler = self.handler.unwrap_or_else(|| Arc::new(NoopHandler));
        let splitter_factory = self.splitter_factory.ok_or_else(|| {
            TransportError::configuration("splitter", "a MessageSplitter factory is required")
        })?;
        let dispatcher =
            EventDispatcher::new(handler, context.pool().clone(), context.timer().clone());
        Ok(SocketClient {
            context,
            dispatcher,
            chain: Arc::new(self.chain),
            splitter_factory,
            server_name: self.server_name,
        })
    }
}

impl SocketClient {
    pub fn builder() -> SocketClientBuilder {
        SocketClientBuilder {
            context: None,
            handler: None,
            chain: FilterChain::new(),
            splitter_factory: None,
            server_name: None,
        }
    }

    /// 连接到 `host:port`, 返回的会话句柄立即可用于 send
    ///
    /// TLS 配置存在时在此连接上发起客户端握手, Connected 在握手完成后触发;
    /// send 在握手期间也可以调用, 帧会排队等传输就绪。
    pub async fn connect(&self, addr: &str) -> Result<SessionHandle, TransportError> {
        self.context.start();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|error| TransportError::from_io(&error))?;
        let _ = stream.set_nodelay(true);

        let tls = match &self.context.config().tls {
            Some(config) => {
                let name = match &self.server_name {
                    Some(name) => name.clone(),
                    None => host_of(addr).to_string(),
                };
                Some(TlsEngine::client(config, &name)?)
            }
            None => None,
        };

        let id = SessionId::new(NEXT_CLIENT_SESSION.fetch_add(1, Ordering::Relaxed));
        let setup = SessionSetup {
            id,
            context: self.context.clone(),
            dispatcher: self.dispatcher.clone(),
            chain: self.chain.clone(),
            splitter: (self.splitter_factory)(),
            tls,
        };
        let parts = prepare(&stream, setup).map_err(|error| TransportError::from_io(&error))?;
        let session = parts.session.clone();

        let driver = driver_for(self.context.config().reactor);
        tracing::debug!("🔗 已连接 {} ({})", addr, id);
        tokio::spawn(async move {
            driver.drive(stream, parts).await;
        });
        Ok(session)
    }
}

/// 取 `host:port` 的主机部分; IPv6 字面量形如 `[::1]:9000`, 要去掉方括号
fn host_of(addr: &str) -> &str {
    if let Some(end) = addr.find(']') {
        if let Some(host) = addr[..end].strip_prefix('[') {
            return host;
        }
    }
    match addr.rsplit_once(':') {
        // 主机部分还有冒号说明是不带端口的裸 IPv6 地址
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}
