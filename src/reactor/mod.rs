//! 反应器层: 就绪式与完成式两种 I/O 驱动
//!
//! 两个驱动共享同一条入站流水线 (解密 -> 累积 -> 分帧 -> 解码 -> 派发)
//! 和同一套写准备逻辑, 因此对外产出的事件序列完全一致,
//! 上层代码无须关心会话跑在哪种模型上。

pub(crate) mod completion;
pub(crate) mod readiness;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::buffer::ByteAccumulator;
use crate::config::ReactorModel;
use crate::context::EngineContext;
use crate::dispatcher::{EventDispatcher, SessionEvent};
use crate::error::TransportError;
use crate::filter::{FilterChain, Message};
use crate::session::{SessionHandle, SessionState, WriteItem};
use crate::splitter::{MessageSplitter, SplitResult};
use crate::tls::TlsEngine;
use crate::SessionId;

/// 建立一条会话所需的全部材料
pub(crate) struct SessionSetup {
    pub id: SessionId,
    pub context: Arc<EngineContext>,
    pub dispatcher: EventDispatcher,
    pub chain: Arc<FilterChain>,
    pub splitter: Box<dyn MessageSplitter>,
    pub tls: Option<TlsEngine>,
}

/// prepare 的产物, 交给驱动接管
pub(crate) struct SessionParts {
    pub session: SessionHandle,
    pub writes: mpsc::UnboundedReceiver<WriteItem>,
    pub pipeline: Pipeline,
    pub tls: Option<Arc<Mutex<TlsEngine>>>,
    pub dispatcher: EventDispatcher,
    pub read_buffer_size: usize,
}

/// 驱动一条已建立的 TCP 连接直到会话终结
#[async_trait]
pub(crate) trait IoDriver: Send + Sync {
    async fn drive(&self, stream: TcpStream, parts: SessionParts);
}

pub(crate) fn driver_for(model: ReactorModel) -> Arc<dyn IoDriver> {
    match model {
        ReactorModel::Readiness => Arc::new(readiness::ReadinessDriver),
        ReactorModel::Completion => Arc::new(completion::CompletionDriver),
    }
}

/// 组装会话句柄、写队列和流水线, 并把空闲检测/握手超时挂上时间轮
pub(crate) fn prepare(stream: &TcpStream, setup: SessionSetup) -> io::Result<SessionParts> {
    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let session = SessionHandle::new(setup.id, local, remote, setup.chain, writes_tx);
    let tls = setup.tls.map(|engine| Arc::new(Mutex::new(engine)));

    let pipeline = Pipeline {
        session: session.clone(),
        dispatcher: setup.dispatcher.clone(),
        accumulator: ByteAccumulator::new(setup.context.config().max_frame_size),
        splitter: setup.splitter,
        tls: tls.clone(),
        announced: false,
    };

    arm_idle_probe(&setup.context, &session, &setup.dispatcher);
    if let Some(tls) = &tls {
        arm_handshake_deadline(&setup.context, &session, &setup.dispatcher, tls);
    }

    Ok(SessionParts {
        session,
        writes: writes_rx,
        pipeline,
        tls,
        dispatcher: setup.dispatcher,
        read_buffer_size: setup.context.config().read_buffer_size,
    })
}

/// 每 tick 检查一次活跃时间, 超过阈值派发 Idle 并重置计时
fn arm_idle_probe(context: &Arc<EngineContext>, session: &SessionHandle, dispatcher: &EventDispatcher) {
    let Some(interval) = context.config().idle_interval else {
        return;
    };
    let probe_session = session.clone();
    let probe_dispatcher = dispatcher.clone();
    let handle = context.timer().add_task(
        move || {
            if !probe_session.is_connected() {
                return;
            }
            if probe_session.idle_for() >= interval {
                probe_dispatcher.dispatch(&probe_session, SessionEvent::Idle);
                probe_session.touch();
            }
        },
        1,
        true,
        true,
    );
    session.set_idle_task(handle);
}

/// 握手超时是一次性任务; 握手按时完成后到期检查自然落空
fn arm_handshake_deadline(
    context: &Arc<EngineContext>,
    session: &SessionHandle,
    dispatcher: &EventDispatcher,
    tls: &Arc<Mutex<TlsEngine>>,
) {
    let ticks = context.config().ticks_for(context.config().handshake_timeout);
    let deadline_session = session.clone();
    let deadline_dispatcher = dispatcher.clone();
    let deadline_tls = tls.clone();
    context.timer().add_task(
        move || {
            let stalled =
                deadline_tls.lock().is_handshaking() && deadline_session.state() != SessionState::Closed;
            if stalled {
                tracing::warn!("会话 {} TLS 握手超时, 强制关闭", deadline_session.id());
                deadline_dispatcher.dispatch(
                    &deadline_session,
                    SessionEvent::ExceptionCaught(TransportError::handshake("handshake timed out")),
                );
                deadline_session.close();
            }
        },
        ticks,
        true,
        false,
    );
}

/// 入站流水线
///
/// 单次读到的字节可能补齐上一帧的尾部, 也可能一口气带来多帧;
/// 分帧循环保证每个完整帧各触发一次 Received, 顺序即字节到达顺序。
pub(crate) struct Pipeline {
    pub session: SessionHandle,
    pub dispatcher: EventDispatcher,
    accumulator: ByteAccumulator,
    splitter: Box<dyn MessageSplitter>,
    tls: Option<Arc<Mutex<TlsEngine>>>,
    announced: bool,
}

impl Pipeline {
    /// 会话起步: 客户端 TLS 先送出 ClientHello; 明文会话立即宣告 Connected
    pub fn begin(&mut self) -> Result<(), TransportError> {
        match &self.tls {
            Some(tls) => {
                let hello = tls.lock().take_outbound()?;
                self.session.send_raw(hello)?;
            }
            None => self.announce_connected(),
        }
        Ok(())
    }

    /// TLS 会话推迟到握手完成才宣告 Connected
    fn announce_connected(&mut self) {
        if self.announced {
            return;
        }
        self.announced = true;
        self.session.mark_connected();
        self.dispatcher.dispatch(&self.session, SessionEvent::Connected);
    }

    /// 消化一段刚从传输读到的字节
    pub fn ingest(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.session.touch();
        match self.tls.clone() {
            Some(tls) => {
                let (plain, outbound, settled) = {
                    let mut engine = tls.lock();
                    let plain = engine.unwrap_inbound(data)?;
                    let outbound = engine.take_outbound()?;
                    (plain, outbound, !engine.is_handshaking())
                };
                // 握手应答不走过滤链
                self.session.send_raw(outbound)?;
                if settled {
                    self.announce_connected();
                }
                if !plain.is_empty() {
                    self.accumulator.append(&plain)?;
                }
            }
            None => self.accumulator.append(data)?,
        }
        self.split_frames()
    }

    fn split_frames(&mut self) -> Result<(), TransportError> {
        loop {
            match self.splitter.can_split(&self.session, &self.accumulator) {
                SplitResult::Frame(length) => {
                    let frame = self.accumulator.consume(length);
                    let message = self.session.filter_chain().decode(&self.session, frame)?;
                    self.dispatcher
                        .dispatch(&self.session, SessionEvent::Received(message));
                }
                SplitResult::Incomplete => return Ok(()),
                SplitResult::Invalid => {
                    return Err(TransportError::protocol("inbound stream rejected by splitter"))
                }
            }
        }
    }
}

/// 把一个写条目变成待落盘字节; Frame 在 TLS 会话上先封装成记录
///
/// 会话就绪前应用帧不会进写队列, 走到这里时握手必已完成,
/// 封装产出的记录即该帧的全部密文, 写完即可报 Sent。
pub(crate) fn prepare_write(
    tls: &Option<Arc<Mutex<TlsEngine>>>,
    item: WriteItem,
) -> Result<(Bytes, Option<Message>), TransportError> {
    match item {
        WriteItem::Raw(bytes) => Ok((bytes, None)),
        WriteItem::Frame { bytes, origin } => match tls {
            Some(engine) => Ok((engine.lock().wrap_outbound(&bytes)?, Some(origin))),
            None => Ok((bytes, Some(origin))),
        },
    }
}

/// 会话收尾
///
/// 错误先于 Disconnected 送达; 对端正常断开不算异常, 只走断开路径。
/// mark_closed 的 CAS 保证多路关闭折叠为恰好一次 on_disconnect。
pub(crate) fn finish(
    session: &SessionHandle,
    dispatcher: &EventDispatcher,
    error: Option<TransportError>,
) {
    if let Some(error) = error {
        if matches!(error, TransportError::RemoteDisconnect) {
            tracing::debug!("会话 {} 对端断开", session.id());
        } else {
            tracing::warn!("会话 {} 因错误关闭: {}", session.id(), error);
            dispatcher.dispatch(session, SessionEvent::ExceptionCaught(error));
        }
    }
    if session.mark_closed() {
        dispatcher.dispatch(session, SessionEvent::Disconnected);
    }
}

/// 关闭前尽力送出 TLS close_notify
pub(crate) fn flush_close_notify(tls: &Option<Arc<Mutex<TlsEngine>>>) -> Option<Bytes> {
    let tls = tls.as_ref()?;
    let mut engine = tls.lock();
    engine.send_close_notify();
    match engine.take_outbound() {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}
