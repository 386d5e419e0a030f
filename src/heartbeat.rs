use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::filter::Message;
use crate::session::SessionHandle;

/// 心跳对象在会话属性表里的键
pub const HEARTBEAT_ATTR: &str = "heartbeat";

/// 会话心跳
///
/// 挂接在会话属性表上, 由 on_idle 驱动: 每次 beat 发送 ping,
/// on_receive 里用 intercept 截留对端的 ping/pong 报文并自动应答。
/// 连续 miss 次数由调用方决定何时判定对端失联并关闭会话。
pub struct Heartbeat {
    ping: Bytes,
    pong: Bytes,
    /// 自上次 beat 以来是否收到过对端心跳
    alive: AtomicBool,
    misses: AtomicU32,
}

impl Heartbeat {
    /// 绑定心跳到会话; 已绑定时返回现有对象
    pub fn attach(
        session: &SessionHandle,
        ping: impl Into<Bytes>,
        pong: impl Into<Bytes>,
    ) -> Arc<Heartbeat> {
        if let Some(existing) = Self::of(session) {
            return existing;
        }
        let heartbeat = Arc::new(Heartbeat {
            ping: ping.into(),
            pong: pong.into(),
            // 第一次 beat 之前不算 miss
            alive: AtomicBool::new(true),
            misses: AtomicU32::new(0),
        });
        session.set_attribute(HEARTBEAT_ATTR, heartbeat.clone());
        heartbeat
    }

    /// 默认 "PING"/"PONG" 报文
    pub fn attach_default(session: &SessionHandle) -> Arc<Heartbeat> {
        Self::attach(session, &b"PING"[..], &b"PONG"[..])
    }

    pub fn of(session: &SessionHandle) -> Option<Arc<Heartbeat>> {
        session.get_attribute::<Arc<Heartbeat>>(HEARTBEAT_ATTR)
    }

    /// 在 on_receive 里截留心跳报文
    ///
    /// 收到 ping 自动回 pong; ping/pong 都标记对端存活并返回 None
    /// (报文被消费); 业务消息原样返回。
    pub fn intercept(&self, session: &SessionHandle, message: Message) -> Option<Message> {
        let Message::Bytes(bytes) = &message else {
            return Some(message);
        };
        if bytes == &self.ping {
            self.alive.store(true, Ordering::Release);
            if let Err(error) = session.send(Message::Bytes(self.pong.clone())) {
                tracing::warn!("会话 {} 心跳应答失败: {}", session.id(), error);
            }
            None
        } else if bytes == &self.pong {
            self.alive.store(true, Ordering::Release);
            None
        } else {
            Some(message)
        }
    }

    /// 一次心跳动作, 从 on_idle 调用
    ///
    /// 返回上个周期内对端是否有心跳; false 时连续失败计数加一。
    pub fn beat(&self, session: &SessionHandle) -> bool {
        let responded = self.alive.swap(false, Ordering::AcqRel);
        if responded {
            self.misses.store(0, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(error) = session.send(Message::Bytes(self.ping.clone())) {
            tracing::warn!("会话 {} 心跳发送失败: {}", session.id(), error);
        }
        responded
    }

    /// 连续未收到对端心跳的周期数, 成功一次即归零
    pub fn failed_count(&self) -> u32 {
        self.misses.load(Ordering::Relaxed)
    }
}
