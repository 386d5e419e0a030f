use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::pool::{AdaptiveThreadPool, ShutdownMode};
use crate::timer::{HashWheelTimer, TaskHandle};

/// 引擎上下文
///
/// 显式持有线程池和时间轮, 由服务器/客户端实例共享;
/// 生命周期由创建者掌控, 多个引擎实例互不影响。
pub struct EngineContext {
    config: EngineConfig,
    pool: AdaptiveThreadPool,
    timer: Arc<HashWheelTimer>,
    started: AtomicBool,
    monitor: Mutex<Option<TaskHandle>>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let pool = AdaptiveThreadPool::new(config.pool.clone());
        let timer = Arc::new(HashWheelTimer::new(
            config.wheel_slots,
            config.tick_interval,
            Some(pool.clone()),
        ));
        Arc::new(Self {
            config,
            pool,
            timer,
            started: AtomicBool::new(false),
            monitor: Mutex::new(None),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EngineConfig::default())
    }

    /// 启动时间轮并把线程池伸缩检查挂为周期任务
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.start();
        // 伸缩检查要读 /proc/loadavg, 走线程池, 不占步进线程
        let handle = self.timer.add_task(self.pool.monitor_job(), 1, true, true);
        *self.monitor.lock() = Some(handle);
        tracing::info!(
            "⚙️ 引擎上下文启动: {} 槽时间轮 / 步长 {:?} / 线程池 {}..{}",
            self.config.wheel_slots,
            self.config.tick_interval,
            self.config.pool.min_size,
            self.config.pool.max_size
        );
    }

    /// 停轮、排空线程池; 幂等
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.monitor.lock().take() {
            handle.cancel();
        }
        self.timer.shutdown();
        self.pool.shutdown(ShutdownMode::Drain);
        tracing::info!("⚙️ 引擎上下文已关闭");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &AdaptiveThreadPool {
        &self.pool
    }

    pub fn timer(&self) -> &Arc<HashWheelTimer> {
        &self.timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_start_and_shutdown_are_idempotent() {
        let context = EngineContext::new(
            EngineConfig::default().with_tick(16, Duration::from_millis(10)),
        );
        context.start();
        context.start();

        let fired = Arc::new(AtomicUsize::new(0));
        let cloned = fired.clone();
        context.timer().add_task(
            move || {
                cloned.fetch_add(1, Ordering::SeqCst);
            },
            1,
            false,
            false,
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        context.shutdown();
        context.shutdown();
    }
}
