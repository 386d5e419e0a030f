use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::dispatcher::SessionEvent;
use crate::error::TransportError;
use crate::filter::{FilterChain, Message};
use crate::timer::TaskHandle;
use crate::SessionId;

/// 会话状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已建立传输但尚未就绪 (如 TLS 握手未完成)
    Connecting,
    /// 可收发应用数据
    Connected,
    /// 已请求关闭, 等待 I/O 任务收尾
    Closing,
    /// 终态, 资源已释放
    Closed,
}

/// 写队列条目
///
/// `Frame` 是经过过滤链编码的应用帧, 写完后触发 on_sent;
/// `Raw` 是握手等引擎自产字节, 直接落盘, 不触发事件。
pub(crate) enum WriteItem {
    Frame { bytes: Bytes, origin: Message },
    Raw(Bytes),
}

struct SessionInner {
    id: SessionId,
    local: SocketAddr,
    remote: SocketAddr,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    /// 属性表: I/O 任务做协议记账, 池线程跑应用代码, 两侧并发读写
    attributes: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    chain: Arc<FilterChain>,
    writes: mpsc::UnboundedSender<WriteItem>,
    /// Connecting 阶段的应用帧先在这里排队, 就绪后按序冲入写队列;
    /// TLS 会话因此不会在握手期间把明文压进引擎, Sent 不会早于实际写出
    pending: Mutex<Option<Vec<WriteItem>>>,
    created: Instant,
    /// 距 created 的毫秒数
    last_activity: AtomicU64,
    /// 事件按到达顺序排队, 同一会话串行派发
    events: Mutex<VecDeque<SessionEvent>>,
    dispatching: AtomicBool,
    idle_task: Mutex<Option<TaskHandle>>,
}

/// 会话句柄
///
/// I/O 任务与 Handler 回调共享的轻量引用, 克隆开销为一次 Arc 计数。
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        local: SocketAddr,
        remote: SocketAddr,
        chain: Arc<FilterChain>,
        writes: mpsc::UnboundedSender<WriteItem>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        Self {
            inner: Arc::new(SessionInner {
                id,
                local,
                remote,
                state_tx,
                state_rx,
                attributes: RwLock::new(HashMap::new()),
                chain,
                writes,
                pending: Mutex::new(Some(Vec::new())),
                created: Instant::now(),
                last_activity: AtomicU64::new(0),
                events: Mutex::new(VecDeque::new()),
                dispatching: AtomicBool::new(false),
                idle_task: Mutex::new(None),
            }),
        }
    }

    /// 创建不挂接任何传输的会话, 供协议分割器/过滤器的单元测试使用
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
        Self::new(SessionId::new(0), addr, addr, Arc::new(FilterChain::new()), tx)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.remote.port()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// 发送一个应用对象
    ///
    /// 对象先经过过滤链按链序编码为字节, 再进入该会话的待写队列;
    /// 同一会话同一时刻只有一个在途写操作, 发送顺序即入队顺序。
    /// 传输未就绪 (如 TLS 握手中) 时帧先排队, 就绪后按序写出。
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        match self.state() {
            SessionState::Connecting | SessionState::Connected => {}
            _ => {
                return Err(TransportError::transport(format!(
                    "{} is closed, send rejected",
                    self.inner.id
                )))
            }
        }
        let bytes = self.inner.chain.encode(self, message.clone())?;
        let item = WriteItem::Frame { bytes, origin: message };
        {
            let mut pending = self.inner.pending.lock();
            if let Some(queue) = pending.as_mut() {
                queue.push(item);
                return Ok(());
            }
        }
        self.inner
            .writes
            .send(item)
            .map_err(|_| TransportError::transport(format!("{} writer is gone", self.inner.id)))
    }

    /// 绕过过滤链直接写原始字节, 用于握手记录
    pub(crate) fn send_raw(&self, bytes: Bytes) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.inner
            .writes
            .send(WriteItem::Raw(bytes))
            .map_err(|_| TransportError::transport(format!("{} writer is gone", self.inner.id)))
    }

    /// 请求关闭会话, 可重复调用
    ///
    /// 多方发起的关闭 (Handler / 错误 / 对端) 最终折叠为一次 on_disconnect。
    pub fn close(&self) {
        self.begin_close();
    }

    /// Connecting -> Connected, 返回是否是本次调用完成的迁移
    ///
    /// 迁移成功时把 Connecting 阶段排队的帧按序冲入写队列;
    /// 持锁冲入, 并发的 send 不会插到排队帧前面。
    pub(crate) fn mark_connected(&self) -> bool {
        let transitioned = self.inner.state_tx.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        });
        if transitioned {
            let mut pending = self.inner.pending.lock();
            if let Some(items) = pending.take() {
                for item in items {
                    let _ = self.inner.writes.send(item);
                }
            }
        }
        transitioned
    }

    pub(crate) fn begin_close(&self) -> bool {
        self.inner.state_tx.send_if_modified(|state| match *state {
            SessionState::Connecting | SessionState::Connected => {
                *state = SessionState::Closing;
                true
            }
            _ => false,
        })
    }

    /// 进入终态; 只有第一个成功者负责触发 on_disconnect
    pub(crate) fn mark_closed(&self) -> bool {
        let transitioned = self.inner.state_tx.send_if_modified(|state| {
            if *state != SessionState::Closed {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        if transitioned {
            if let Some(task) = self.inner.idle_task.lock().take() {
                task.cancel();
            }
            // 从未就绪就关闭的会话, 排队帧直接丢弃
            self.inner.pending.lock().take();
        }
        transitioned
    }

    /// 等待会话进入 Closed
    pub async fn closed(&self) {
        let mut rx = self.inner.state_rx.clone();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// I/O 任务等待关闭请求
    pub(crate) async fn close_requested(&self) {
        let mut rx = self.inner.state_rx.clone();
        let _ = rx
            .wait_for(|state| matches!(state, SessionState::Closing | SessionState::Closed))
            .await;
    }

    // ---- 属性表 ----

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.inner
            .attributes
            .write()
            .insert(key.to_string(), Arc::new(value));
    }

    pub fn get_attribute<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .attributes
            .read()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.inner.attributes.read().contains_key(key)
    }

    pub fn remove_attribute(&self, key: &str) {
        self.inner.attributes.write().remove(key);
    }

    // ---- 活跃时间 ----

    /// 刷新最后活跃时间, 读到字节或写出字节时调用
    pub(crate) fn touch(&self) {
        let millis = self.inner.created.elapsed().as_millis() as u64;
        self.inner.last_activity.store(millis, Ordering::Relaxed);
    }

    /// 距最后一次活跃的时长
    pub fn idle_for(&self) -> Duration {
        let last = self.inner.last_activity.load(Ordering::Relaxed);
        self.inner
            .created
            .elapsed()
            .saturating_sub(Duration::from_millis(last))
    }

    pub(crate) fn set_idle_task(&self, handle: TaskHandle) {
        *self.inner.idle_task.lock() = Some(handle);
    }

    // ---- 事件队列 (派发器专用) ----

    pub(crate) fn push_event(&self, event: SessionEvent) {
        self.inner.events.lock().push_back(event);
    }

    pub(crate) fn pop_event(&self) -> Option<SessionEvent> {
        self.inner.events.lock().pop_front()
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.inner.events.lock().is_empty()
    }

    pub(crate) fn try_begin_dispatch(&self) -> bool {
        self.inner
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_dispatch(&self) {
        self.inner.dispatching.store(false, Ordering::Release);
    }

    pub(crate) fn filter_chain(&self) -> &FilterChain {
        &self.inner.chain
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}
