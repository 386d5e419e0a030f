use std::time::Duration;

use crate::pool::PoolConfig;
use crate::tls::TlsConfig;

/// 反应器模型
///
/// 两种模型遵守同一份会话契约, 产出完全相同的生命周期事件序列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReactorModel {
    /// 就绪通知: 等待 "可读/可写" 后自行执行非阻塞读写
    Readiness,
    /// 完成通知: 发起异步操作, 完成后处理数据并立即重新发起下一次读
    Completion,
}

/// 引擎配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    pub reactor: ReactorModel,
    /// 单次读取的缓冲大小
    pub read_buffer_size: usize,
    /// 帧完成前允许累积的最大字节数, 超出按协议违规处理
    pub max_frame_size: usize,
    /// 空闲检测间隔, None 表示不做空闲检测
    pub idle_interval: Option<Duration>,
    /// TLS 握手超时
    pub handshake_timeout: Duration,
    /// 时间轮槽数
    pub wheel_slots: usize,
    /// 时间轮每槽步长
    pub tick_interval: Duration,
    pub pool: PoolConfig,
    pub tls: Option<TlsConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reactor: ReactorModel::Readiness,
            read_buffer_size: 4096,
            max_frame_size: 4 * 1024 * 1024,
            idle_interval: None,
            handshake_timeout: Duration::from_secs(30),
            wheel_slots: 60,
            tick_interval: Duration::from_secs(1),
            pool: PoolConfig::default(),
            tls: None,
        }
    }
}

impl EngineConfig {
    pub fn with_reactor(mut self, reactor: ReactorModel) -> Self {
        self.reactor = reactor;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = Some(interval);
        self
    }

    pub fn with_tick(mut self, wheel_slots: usize, tick_interval: Duration) -> Self {
        self.wheel_slots = wheel_slots;
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// 把时长换算成时间轮步数, 至少 1 步
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let tick = self.tick_interval.as_millis().max(1);
        ((duration.as_millis() + tick - 1) / tick).max(1) as u64
    }
}
