use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::TransportError;
use crate::filter::Message;
use crate::handler::Handler;
use crate::pool::AdaptiveThreadPool;
use crate::session::SessionHandle;
use crate::timer::HashWheelTimer;

/// 会话生命周期事件
///
/// 两种反应器产出完全相同的事件序列, 这是统一契约的外显部分。
#[derive(Debug)]
pub enum SessionEvent {
    /// 连接可用 (TLS 会话在握手完成后)
    Connected,
    /// 一个完整帧已解码
    Received(Message),
    /// 某次 send 的字节已全部写出
    Sent(Message),
    /// 会话级错误, 在 Disconnected 之前送达
    ExceptionCaught(TransportError),
    /// 会话终结, 每会话恰好一次
    Disconnected,
    /// 空闲超时
    Idle,
}

/// 事件派发器
///
/// 把反应器产出的事件路由到 Handler, 回调全部在线程池执行。
/// 同一会话的事件借助会话上的 FIFO 队列和派发标志串行化,
/// 保证 on_receive 按帧组装顺序触发; 不同会话并行。
#[derive(Clone)]
pub struct EventDispatcher {
    handler: Arc<dyn Handler>,
    pool: AdaptiveThreadPool,
    timer: Arc<HashWheelTimer>,
}

impl EventDispatcher {
    pub fn new(
        handler: Arc<dyn Handler>,
        pool: AdaptiveThreadPool,
        timer: Arc<HashWheelTimer>,
    ) -> Self {
        Self { handler, pool, timer }
    }

    /// 入队并在需要时启动该会话的派发循环
    pub fn dispatch(&self, session: &SessionHandle, event: SessionEvent) {
        session.push_event(event);
        self.kick(session);
    }

    /// 为会话争取派发循环; 线程池饱和时挂时间轮任务下个 tick 再试,
    /// 事件留在会话队列里绝不丢失, 终结性的 Disconnected 也一样
    fn kick(&self, session: &SessionHandle) {
        if !session.has_events() || !session.try_begin_dispatch() {
            // 队列已空或已有派发循环在跑, 事件会被它顺带消费
            return;
        }
        let handler = self.handler.clone();
        let job_session = session.clone();
        if let Err(error) = self
            .pool
            .submit(Box::new(move || drain(handler, job_session)))
        {
            session.end_dispatch();
            tracing::warn!("会话 {} 事件派发提交被拒绝, 下个 tick 重试: {}", session.id(), error);
            let retry = self.clone();
            let retry_session = session.clone();
            // 重试任务只做一次 try_send, 同步跑在步进线程上也足够轻
            self.timer
                .add_task(move || retry.kick(&retry_session), 1, false, false);
        }
    }
}

fn drain(handler: Arc<dyn Handler>, session: SessionHandle) {
    loop {
        let Some(event) = session.pop_event() else {
            session.end_dispatch();
            // 关闭窗口期塞入的事件由本线程继续消费, 避免丢派发
            if session.has_events() && session.try_begin_dispatch() {
                continue;
            }
            return;
        };
        deliver(handler.as_ref(), &session, event);
    }
}

fn deliver(handler: &dyn Handler, session: &SessionHandle, event: SessionEvent) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| match event {
        SessionEvent::Connected => {
            if let Some(first) = handler.on_connect(session) {
                send_reply(session, first);
            }
        }
        SessionEvent::Received(message) => {
            if let Some(reply) = handler.on_receive(session, message) {
                send_reply(session, reply);
            }
        }
        SessionEvent::Sent(message) => handler.on_sent(session, message),
        SessionEvent::ExceptionCaught(error) => handler.on_exception(session, &error),
        SessionEvent::Disconnected => handler.on_disconnect(session),
        SessionEvent::Idle => handler.on_idle(session),
    }));
    if result.is_err() {
        tracing::error!("会话 {} 的 Handler 回调 panic, 已捕获", session.id());
    }
}

fn send_reply(session: &SessionHandle, reply: Message) {
    if let Err(error) = session.send(reply) {
        tracing::warn!("会话 {} 应答发送失败: {}", session.id(), error);
    }
}
