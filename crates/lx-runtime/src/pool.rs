//! The worker pool.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

/// Closure priority. Strict: a worker never runs a lower-priority closure
/// while a higher-priority one is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Med,
    Immediate,
}

/// Identity of one worker thread; used for affinity dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// The worker this thread belongs to, if it is a pool thread.
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(|c| c.get())
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerHandle {
    imm: mpsc::UnboundedSender<Job>,
    med: mpsc::UnboundedSender<Job>,
    low: mpsc::UnboundedSender<Job>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn send(&self, priority: Priority, job: Job) {
        let sender = match priority {
            Priority::Immediate => &self.imm,
            Priority::Med => &self.med,
            Priority::Low => &self.low,
        };
        // a send failure means the pool is shutting down; the closure is
        // dropped, which is the documented cancel-on-shutdown behavior
        let _ = sender.send(job);
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `count` workers named `{name}-{i}`.
    pub fn new(name: &str, count: usize) -> Arc<Self> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);

        for i in 0..count {
            let (imm_tx, imm_rx) = mpsc::unbounded_channel::<Job>();
            let (med_tx, med_rx) = mpsc::unbounded_channel::<Job>();
            let (low_tx, low_rx) = mpsc::unbounded_channel::<Job>();

            let thread_name = format!("{name}-{i}");
            let id = WorkerId(i);
            let thread = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_main(id, imm_rx, med_rx, low_rx))
                .expect("failed to spawn worker thread");

            workers.push(WorkerHandle {
                imm: imm_tx,
                med: med_tx,
                low: low_tx,
                thread: Some(thread),
            });
        }

        Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Run `job` on some worker (round-robin placement).
    pub fn run(&self, priority: Priority, job: impl FnOnce() + Send + 'static) -> WorkerId {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].send(priority, Box::new(job));
        WorkerId(i)
    }

    /// Run `job` on a specific worker. This is the only cross-thread
    /// communication primitive: state owned by a worker is only touched by
    /// closures dispatched to it.
    pub fn run_on(&self, id: WorkerId, priority: Priority, job: impl FnOnce() + Send + 'static) {
        let Some(worker) = self.workers.get(id.0) else {
            debug!(worker = %id, "dispatch to unknown worker dropped");
            return;
        };
        worker.send(priority, Box::new(job));
    }

    /// Stop accepting work and join every worker. Queued closures still
    /// drain; delayed closures that have not fired are dropped.
    pub fn shutdown(&mut self) {
        for w in &mut self.workers {
            // closing the channels ends the dispatch loop
            let (dead_tx, _) = mpsc::unbounded_channel();
            w.imm = dead_tx.clone();
            w.med = dead_tx.clone();
            w.low = dead_tx;
        }
        for w in &mut self.workers {
            if let Some(t) = w.thread.take() {
                let _ = t.join();
            }
        }
    }
}

fn worker_main(
    id: WorkerId,
    mut imm: mpsc::UnboundedReceiver<Job>,
    mut med: mpsc::UnboundedReceiver<Job>,
    mut low: mpsc::UnboundedReceiver<Job>,
) {
    CURRENT_WORKER.with(|c| c.set(Some(id)));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let mut imm_open = true;
        let mut med_open = true;
        let mut low_open = true;

        while imm_open || med_open || low_open {
            tokio::select! {
                biased;

                job = imm.recv(), if imm_open => match job {
                    Some(job) => job(),
                    None => imm_open = false,
                },
                job = med.recv(), if med_open => match job {
                    Some(job) => job(),
                    None => med_open = false,
                },
                job = low.recv(), if low_open => match job {
                    Some(job) => job(),
                    None => low_open = false,
                },
            }
        }
    });

    debug!(worker = %id, "worker exited");
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
