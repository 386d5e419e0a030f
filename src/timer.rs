use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::pool::AdaptiveThreadPool;

/// 时间轮任务条目
struct WheelEntry {
    job: Box<dyn Fn() + Send + Sync>,
    /// 以 tick 计的延迟/周期
    delay: u64,
    /// 剩余圈数, 延迟超过一圈时在每次轮转经过时递减
    rounds: AtomicU64,
    cancelled: AtomicBool,
    /// true: 提交线程池执行, 慢任务不会拖慢步进线程
    asynchronous: bool,
    /// true: 执行完成后重新入轮
    periodic: bool,
}

/// 任务句柄, 取消是 O(1) 的打标操作, 任务已到期也安全
#[derive(Clone)]
pub struct TaskHandle {
    entry: Arc<WheelEntry>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::Acquire)
    }
}

/// 时间轮本体: 固定槽位环形数组, 增删改和步进都是 O(1)
struct HashWheel {
    slots: Vec<Mutex<Vec<Arc<WheelEntry>>>>,
    current: AtomicUsize,
    size: usize,
    pool: Option<AdaptiveThreadPool>,
}

impl HashWheel {
    fn new(size: usize, pool: Option<AdaptiveThreadPool>) -> Self {
        Self {
            slots: (0..size).map(|_| Mutex::new(Vec::new())).collect(),
            current: AtomicUsize::new(0),
            size,
            pool,
        }
    }

    /// 把任务放入 `(current + delay) % size` 槽, 超过一圈的部分记为 rounds
    fn schedule(&self, entry: Arc<WheelEntry>) {
        let delay = entry.delay.max(1) as usize;
        let current = self.current.load(Ordering::Relaxed);
        let target = (current + delay) % self.size;
        let rounds = ((delay - 1) / self.size) as u64;
        entry.rounds.store(rounds, Ordering::Relaxed);
        self.slots[target].lock().push(entry);
    }

    /// 前进一个槽位并执行到期任务
    fn tick(self: &Arc<Self>) {
        let current = (self.current.load(Ordering::Relaxed) + 1) % self.size;
        self.current.store(current, Ordering::Relaxed);

        let mut due = Vec::new();
        {
            let mut slot = self.slots[current].lock();
            slot.retain(|entry| {
                if entry.cancelled.load(Ordering::Acquire) {
                    return false;
                }
                let rounds = entry.rounds.load(Ordering::Relaxed);
                if rounds > 0 {
                    entry.rounds.store(rounds - 1, Ordering::Relaxed);
                    true
                } else {
                    due.push(entry.clone());
                    false
                }
            });
        }

        for entry in due {
            self.execute(entry);
        }
    }

    fn execute(self: &Arc<Self>, entry: Arc<WheelEntry>) {
        let asynchronous = entry.asynchronous;
        let wheel = self.clone();
        let run = move || {
            if entry.cancelled.load(Ordering::Acquire) {
                return;
            }
            // 任务 panic 只记录, 不影响步进线程和其他任务
            if std::panic::catch_unwind(AssertUnwindSafe(|| (entry.job)())).is_err() {
                tracing::error!("定时任务 panic, 已捕获");
            }
            // 周期任务执行完成后重新入轮
            if entry.periodic && !entry.cancelled.load(Ordering::Acquire) {
                wheel.schedule(entry);
            }
        };

        if asynchronous {
            match &self.pool {
                Some(pool) => {
                    if let Err(error) = pool.submit(Box::new(run)) {
                        tracing::error!("异步定时任务提交失败: {}", error);
                    }
                }
                None => run(),
            }
        } else {
            run();
        }
    }
}

/// 时间轮定时器
///
/// 专用步进线程按固定间隔逐槽推进, 用于空闲检测、握手超时和周期性维护。
pub struct HashWheelTimer {
    wheel: Arc<HashWheel>,
    tick_interval: Duration,
    running: Arc<AtomicBool>,
    stepper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl HashWheelTimer {
    /// `slots` 是轮的槽数, `tick_interval` 是每槽的步长;
    /// 带 `pool` 时异步任务交给线程池执行
    pub fn new(slots: usize, tick_interval: Duration, pool: Option<AdaptiveThreadPool>) -> Self {
        assert!(slots > 0, "wheel needs at least one slot");
        Self {
            wheel: Arc::new(HashWheel::new(slots, pool)),
            tick_interval,
            running: Arc::new(AtomicBool::new(false)),
            stepper: Mutex::new(None),
        }
    }

    /// 注册任务, 延迟 `delay_ticks` 个步长后执行
    pub fn add_task(
        &self,
        job: impl Fn() + Send + Sync + 'static,
        delay_ticks: u64,
        asynchronous: bool,
        periodic: bool,
    ) -> TaskHandle {
        let entry = Arc::new(WheelEntry {
            job: Box::new(job),
            delay: delay_ticks.max(1),
            rounds: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            asynchronous,
            periodic,
        });
        self.wheel.schedule(entry.clone());
        TaskHandle { entry }
    }

    /// 手动推进一个步长, 供测试和内嵌场景使用
    pub fn tick(&self) {
        self.wheel.tick();
    }

    /// 启动步进线程; 已启动时返回 false
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let wheel = self.wheel.clone();
        let running = self.running.clone();
        let interval = self.tick_interval;
        let result = thread::Builder::new()
            .name("evsock-wheel".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if running.load(Ordering::Acquire) {
                        wheel.tick();
                    }
                }
            });
        match result {
            Ok(handle) => {
                *self.stepper.lock() = Some(handle);
                true
            }
            Err(error) => {
                tracing::error!("步进线程启动失败: {}", error);
                self.running.store(false, Ordering::Release);
                false
            }
        }
    }

    /// 停止步进线程
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.stepper.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}
