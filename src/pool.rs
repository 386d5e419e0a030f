use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use parking_lot::Mutex;

use crate::error::TransportError;

/// 提交给线程池的工作单元
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 关闭模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// 排空队列中已接受的任务后退出
    Drain,
    /// 丢弃队列中未执行的任务
    Discard,
}

/// 线程池配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    /// 最小(初始)线程数, 默认为逻辑核数
    pub min_size: usize,
    /// 线程数上限, 默认为逻辑核数的 4 倍
    pub max_size: usize,
    /// 有界任务队列容量
    pub queue_capacity: usize,
    /// 空闲线程回收阈值
    pub idle_timeout: Duration,
    /// 每核负载均值超过该值时监控任务不再扩容
    pub load_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            min_size: cores,
            max_size: cores * 4,
            queue_capacity: 1000,
            idle_timeout: Duration::from_secs(60),
            load_threshold: 1.0,
        }
    }
}

struct PoolInner {
    sender: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    receiver: Receiver<Job>,
    core_size: AtomicUsize,
    min_size: usize,
    max_size: usize,
    queue_capacity: usize,
    idle_timeout: Duration,
    load_threshold: f64,
    alive: AtomicUsize,
    active: AtomicUsize,
    worker_seq: AtomicUsize,
    shutting_down: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// 自适应工作线程池
///
/// Handler 回调和异步定时任务都在这里执行, I/O 任务绝不直接跑业务逻辑。
/// 队列有界: 饱和时提交被拒绝并返回 `PoolSaturation`, 绝不静默丢弃。
/// 周期性监控任务根据队列积压和系统负载在上下限之间调整核心线程数。
#[derive(Clone)]
pub struct AdaptiveThreadPool {
    inner: Arc<PoolInner>,
}

impl AdaptiveThreadPool {
    pub fn new(config: PoolConfig) -> Self {
        let (tx, rx) = bounded(config.queue_capacity);
        let min_size = config.min_size.max(1);
        let max_size = config.max_size.max(min_size);
        let inner = Arc::new(PoolInner {
            sender: Mutex::new(Some(tx)),
            receiver: rx,
            core_size: AtomicUsize::new(min_size),
            min_size,
            max_size,
            queue_capacity: config.queue_capacity,
            idle_timeout: config.idle_timeout,
            load_threshold: config.load_threshold,
            alive: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            worker_seq: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        for _ in 0..min_size {
            spawn_worker(&inner);
        }
        Self { inner }
    }

    /// 提交一个任务
    ///
    /// 队列满且线程数未到上限时先补充线程再重试;
    /// 到达上限仍满则返回 `PoolSaturation`, 由调用方决定重试或丢弃。
    pub fn submit(&self, job: Job) -> Result<(), TransportError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(TransportError::transport("thread pool is shut down"));
        }
        let guard = self.inner.sender.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::transport("thread pool is shut down"));
        };

        let mut pending = job;
        loop {
            match tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(job)) => {
                    // 补充线程失败时直接拒绝, 不能原地重试
                    if self.inner.alive.load(Ordering::Acquire) < self.inner.max_size
                        && spawn_worker(&self.inner)
                    {
                        pending = job;
                    } else {
                        return Err(TransportError::PoolSaturation {
                            queued: tx.len(),
                            limit: self.inner.queue_capacity,
                        });
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(TransportError::transport("thread pool is shut down"));
                }
            }
        }
    }

    /// 当前排队任务数
    pub fn queued(&self) -> usize {
        self.inner.receiver.len()
    }

    /// 当前核心线程数
    pub fn core_size(&self) -> usize {
        self.inner.core_size.load(Ordering::Relaxed)
    }

    /// 存活线程数
    pub fn alive(&self) -> usize {
        self.inner.alive.load(Ordering::Relaxed)
    }

    /// 正在执行任务的线程数
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// 生成监控任务闭包, 由时间轮周期调度
    ///
    /// 队列有积压且负载允许时核心数按 1.25 倍上调,
    /// 活跃线程不足一半时按 0.75 倍下调, 空闲线程由超时回收。
    pub fn monitor_job(&self) -> impl Fn() + Send + Sync + 'static {
        let inner = self.inner.clone();
        move || {
            if inner.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let backlog = inner.receiver.len();
            let core = inner.core_size.load(Ordering::Relaxed);
            if backlog > 0
                && core < inner.max_size
                && load_avg_per_core().unwrap_or(0.0) < inner.load_threshold
            {
                let new_core = (core * 5 / 4 + 1).min(inner.max_size);
                if new_core != core {
                    inner.core_size.store(new_core, Ordering::Relaxed);
                    tracing::debug!("PoolSizeChange: {} -> {}", core, new_core);
                }
                // 最多补到 new_core, 线程创建失败就停, 下个周期再试
                let alive = inner.alive.load(Ordering::Acquire);
                for _ in alive..new_core {
                    if !spawn_worker(&inner) {
                        break;
                    }
                }
            } else {
                let active = inner.active.load(Ordering::Relaxed);
                let alive = inner.alive.load(Ordering::Relaxed);
                if active <= alive / 2 && core > inner.min_size {
                    let new_core = (core * 3 / 4).max(inner.min_size);
                    if new_core != core {
                        inner.core_size.store(new_core, Ordering::Relaxed);
                        tracing::debug!("PoolSizeChange: {} -> {}", core, new_core);
                    }
                }
            }
        }
    }

    /// 关闭线程池
    ///
    /// 停止接受新任务; Drain 模式等待队列排空, Discard 模式丢弃未执行任务。
    pub fn shutdown(&self, mode: ShutdownMode) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if mode == ShutdownMode::Discard {
            let mut discarded = 0usize;
            while self.inner.receiver.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                tracing::warn!("线程池关闭, 丢弃 {} 个未执行任务", discarded);
            }
        }
        // 丢弃发送端, 队列排空后工作线程依次退出
        *self.inner.sender.lock() = None;
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn spawn_worker(inner: &Arc<PoolInner>) -> bool {
    let seq = inner.worker_seq.fetch_add(1, Ordering::Relaxed);
    let cloned = inner.clone();
    let result = thread::Builder::new()
        .name(format!("evsock-worker-{}", seq))
        .spawn(move || worker_loop(cloned));
    match result {
        Ok(handle) => {
            inner.alive.fetch_add(1, Ordering::AcqRel);
            inner.workers.lock().push(handle);
            true
        }
        Err(error) => {
            tracing::error!("工作线程启动失败: {}", error);
            false
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.receiver.recv_timeout(inner.idle_timeout) {
            Ok(job) => {
                inner.active.fetch_add(1, Ordering::AcqRel);
                // 任务 panic 在执行边界捕获, 不会带走工作线程
                let result = std::panic::catch_unwind(AssertUnwindSafe(job));
                inner.active.fetch_sub(1, Ordering::AcqRel);
                if result.is_err() {
                    tracing::error!("线程池任务 panic, 已捕获");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // 空闲回收: 超出核心数的线程退出
                let core = inner.core_size.load(Ordering::Relaxed).max(inner.min_size);
                if inner.alive.load(Ordering::Acquire) > core {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    inner.alive.fetch_sub(1, Ordering::AcqRel);
}

/// 读取系统每核负载均值, 非 Linux 平台返回 None (按低负载处理)
fn load_avg_per_core() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let text = std::fs::read_to_string("/proc/loadavg").ok()?;
        let load: f64 = text.split_whitespace().next()?.parse().ok()?;
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        Some(load / cores)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn small_pool(queue: usize) -> AdaptiveThreadPool {
        AdaptiveThreadPool::new(PoolConfig {
            min_size: 2,
            max_size: 2,
            queue_capacity: queue,
            idle_timeout: Duration::from_secs(60),
            load_threshold: f64::MAX,
        })
    }

    fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_saturation_is_rejected_not_dropped() {
        let pool = small_pool(2);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let done = Arc::new(AtomicUsize::new(0));

        // 占满两个工作线程
        for _ in 0..2 {
            let rx = gate_rx.clone();
            let done = done.clone();
            pool.submit(Box::new(move || {
                let _ = rx.recv();
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || pool.active() == 2));

        // 填满队列
        for _ in 0..2 {
            let done = done.clone();
            pool.submit(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        // 超出 max + queue 的提交必须被拒绝
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(err.error_code(), "POOL_SATURATION");

        drop(gate_tx);
        assert!(wait_until(Duration::from_secs(2), || {
            done.load(Ordering::SeqCst) == 4
        }));
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn test_shutdown_drain_runs_queued_jobs() {
        let pool = AdaptiveThreadPool::new(PoolConfig {
            min_size: 1,
            max_size: 1,
            queue_capacity: 16,
            idle_timeout: Duration::from_secs(60),
            load_threshold: f64::MAX,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown(ShutdownMode::Drain);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.submit(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = AdaptiveThreadPool::new(PoolConfig {
            min_size: 1,
            max_size: 1,
            queue_capacity: 16,
            idle_timeout: Duration::from_secs(60),
            load_threshold: f64::MAX,
        });
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let cloned = done.clone();
        pool.submit(Box::new(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            done.load(Ordering::SeqCst) == 1
        }));
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn test_monitor_grows_core_size_on_backlog() {
        let pool = AdaptiveThreadPool::new(PoolConfig {
            min_size: 1,
            max_size: 4,
            queue_capacity: 16,
            idle_timeout: Duration::from_secs(60),
            load_threshold: f64::MAX,
        });
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let rx = gate_rx.clone();
        pool.submit(Box::new(move || {
            let _ = rx.recv();
        }))
        .unwrap();
        assert!(wait_until(Duration::from_secs(2), || pool.active() == 1));
        // 制造积压
        for _ in 0..4 {
            let rx = gate_rx.clone();
            pool.submit(Box::new(move || {
                let _ = rx.recv();
            }))
            .unwrap();
        }
        let monitor = pool.monitor_job();
        monitor();
        assert!(pool.core_size() > 1);
        assert!(pool.core_size() <= 4);
        // 持续积压下反复运行也收敛在上限, 不会无界补线程
        for _ in 0..8 {
            monitor();
        }
        assert!(pool.core_size() <= 4);
        assert!(pool.alive() <= 4);
        drop(gate_tx);
        pool.shutdown(ShutdownMode::Drain);
    }
}
