use crate::error::TransportError;
use crate::filter::Message;
use crate::session::SessionHandle;

/// 业务回调契约
///
/// 所有回调都在工作线程池上执行, 绝不占用 I/O 任务, 因此可以自由阻塞;
/// 同一会话的回调按事件到达顺序串行, 不同会话之间并行。
///
/// `on_connect` / `on_receive` 返回的对象会经过滤链编码后回写给对端。
pub trait Handler: Send + Sync + 'static {
    /// 连接建立 (TLS 会话在握手完成后才触发), 可返回首条消息
    fn on_connect(&self, _session: &SessionHandle) -> Option<Message> {
        None
    }

    /// 收到一个完整解码后的应用对象, 可返回应答
    fn on_receive(&self, _session: &SessionHandle, _message: Message) -> Option<Message> {
        None
    }

    /// 某次 send 的字节已全部写出
    fn on_sent(&self, _session: &SessionHandle, _message: Message) {}

    /// 会话级错误, 总是在会话进入 Closed 之前送达
    fn on_exception(&self, session: &SessionHandle, error: &TransportError) {
        tracing::error!("会话 {} 异常: {}", session.id(), error);
    }

    /// 会话已关闭, 对每个会话恰好触发一次
    fn on_disconnect(&self, _session: &SessionHandle) {}

    /// 会话空闲超过配置阈值
    fn on_idle(&self, _session: &SessionHandle) {}
}
