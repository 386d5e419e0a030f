use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::Notify;

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

/// 接受路径连续失败这么多次后放弃该引擎实例
const MAX_ACCEPT_FAILURES: u32 = 16;

/// 套接字服务器
///
/// 一个实例绑定一个监听地址; 每个接受的连接成为一条独立会话,
/// 由配置选定的反应器驱动。关闭服务器会请求关闭全部在册会话。
pub struct SocketServer {
    bind: String,
    context: Arc<EngineContext>,
    dispatcher: EventDispatcher,
    chain: Arc<FilterChain>,
    splitter_factory: SplitterFactory,
    next_session: AtomicU64,
    sessions: Arc<Mutex<Slab<SessionHandle>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Notify,
}

pub struct SocketServerBuilder {
    bind: Option<String>,
    context: Option<Arc<EngineContext>>,
    handler: Option<Arc<dyn Handler>>,
    chain: FilterChain,
    splitter_factory: Option<SplitterFactory>,
}

impl SocketServerBuilder {
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = Some(addr.into());
        self
    }

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

    /// 每条会话用工厂造一个新分割器实例
    pub fn splitter<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: crate::splitter::MessageSplitter + 'static,
    {
        self.splitter_factory = Some(Arc::new(move || Box::new(factory())));
        self
    }

    pub fn build(self) -> Result<SocketServer, TransportError> {
        let bind = self
            .bind
            .ok_or_else(|| TransportError::configuration("bind", "listen address is required"))?;
        let context = self.context.unwrap_or_else(EngineContext::with_defaults);
        let handler = self
            .handler
            .ok_or_else(|| TransportError::configuration("handler", "a Handler is required"))?;
        let splitter_factory = self.splitter_factory.ok_or_else(|| {
            TransportError::configuration("splitter", "a MessageSplitter factory is required")
        })?;
        let dispatcher =
            EventDispatcher::new(handler, context.pool().clone(), context.timer().clone());
        Ok(SocketServer {
            bind,
            context,
            dispatcher,
            chain: Arc::new(self.chain),
            splitter_factory,
            next_session: AtomicU64::new(1),
            sessions: Arc::new(Mutex::new(Slab::new())),
            local_addr: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }
}

impl SocketServer {
    pub fn builder() -> SocketServerBuilder {
        SocketServerBuilder {
            bind: None,
            context: None,
            handler: None,
            chain: FilterChain::new(),
            splitter_factory: None,
        }
    }

    /// 实际绑定到的地址, serve 启动完成前为 None (绑定端口 0 时从这里拿真实端口)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// 请求停止接受循环并关闭全部会话
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// 接受循环, 运行到 shutdown 被调用或接受路径持续失败
    pub async fn serve(&self) -> Result<(), TransportError> {
        self.context.start();
        let listener = TcpListener::bind(&self.bind).await.map_err(|error| {
            TransportError::configuration("bind", format!("cannot listen on {}: {}", self.bind, error))
        })?;
        let local = listener
            .local_addr()
            .map_err(|error| TransportError::from_io(&error))?;
        *self.local_addr.lock() = Some(local);
        tracing::info!("🚀 服务器监听 {} ({:?})", local, self.context.config().reactor);

        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_failures = 0;
                        if let Err(error) = self.admit(stream, peer) {
                            tracing::warn!("连接 {} 建立会话失败: {}", peer, error);
                        }
                    }
                    Err(error) => {
                        accept_failures += 1;
                        tracing::warn!("接受连接失败 ({}/{}): {}", accept_failures, MAX_ACCEPT_FAILURES, error);
                        if accept_failures >= MAX_ACCEPT_FAILURES {
                            tracing::error!("接受路径持续失败, 该服务器实例终止");
                            self.close_all();
                            return Err(TransportError::transport("accept path failed repeatedly"));
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }

        tracing::info!("🔌 服务器 {} 停止, 关闭 {} 条会话", local, self.session_count());
        self.close_all();
        Ok(())
    }

    /// 为一个已接受的连接组装会话并交给反应器驱动
    fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) -> Result<(), TransportError> {
        let _ = stream.set_nodelay(true);
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        let tls = match &self.context.config().tls {
            Some(config) => Some(TlsEngine::server(config)?),
            None => None,
        };
        let setup = SessionSetup {
            id,
            context: self.context.clone(),
            dispatcher: self.dispatcher.clone(),
            chain: self.chain.clone(),
            splitter: (self.splitter_factory)(),
            tls,
        };
        let parts = prepare(&stream, setup).map_err(|error| TransportError::from_io(&error))?;

        let key = self.sessions.lock().insert(parts.session.clone());
        let sessions = self.sessions.clone();
        let driver = driver_for(self.context.config().reactor);
        tracing::debug!("✅ 接受 {} -> {}", peer, id);
        tokio::spawn(async move {
            driver.drive(stream, parts).await;
            sessions.lock().try_remove(key);
        });
        Ok(())
    }

    fn close_all(&self) {
        for (_, session) in self.sessions.lock().iter() {
            session.close();
        }
    }
}
