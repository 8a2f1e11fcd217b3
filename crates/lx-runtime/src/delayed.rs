//! Delayed and periodic closures with cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::pool::{Priority, WorkerPool};

/// Cancel handle for a delayed closure.
///
/// `cancel()` is idempotent. It races with dispatch by design: it either
/// prevents the closure from running at all, or is a no-op because the
/// closure already started.
#[derive(Debug, Clone)]
pub struct DelayedHandle {
    fired_or_canceled: Arc<AtomicBool>,
}

impl DelayedHandle {
    pub fn cancel(&self) {
        self.fired_or_canceled.store(true, Ordering::SeqCst);
    }

    /// True once the closure ran or was canceled.
    pub fn is_settled(&self) -> bool {
        self.fired_or_canceled.load(Ordering::SeqCst)
    }
}

/// Cancel handle for a periodic closure; cancellation stops future firings.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
    canceled: Arc<AtomicBool>,
}

impl PeriodicHandle {
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Run `job` after `delay` at the given priority.
    pub fn run_delayed(
        &self,
        delay: Duration,
        priority: Priority,
        job: impl FnOnce() + Send + 'static,
    ) -> DelayedHandle {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = DelayedHandle {
            fired_or_canceled: flag.clone(),
        };

        // the timer sleeps on a worker's local set; the flag decides the
        // cancel-vs-dispatch race atomically
        self.run(priority, move || {
            tokio::task::spawn_local(async move {
                tokio::time::sleep(delay).await;
                if !flag.swap(true, Ordering::SeqCst) {
                    job();
                }
            });
        });

        handle
    }

    /// Run `job` every `interval` until canceled.
    pub fn run_periodic(
        &self,
        interval: Duration,
        mut job: impl FnMut() + Send + 'static,
    ) -> PeriodicHandle {
        let canceled = Arc::new(AtomicBool::new(false));
        let handle = PeriodicHandle {
            canceled: canceled.clone(),
        };

        self.run(Priority::Immediate, move || {
            tokio::task::spawn_local(async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // the first tick of tokio's interval is immediate; skip it
                timer.tick().await;
                loop {
                    timer.tick().await;
                    if canceled.load(Ordering::SeqCst) {
                        break;
                    }
                    job();
                }
            });
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn delayed_closure_fires() {
        let pool = WorkerPool::new("test", 1);
        let (tx, rx) = mpsc::channel();
        let _handle = pool.run_delayed(Duration::from_millis(10), Priority::Med, move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn cancel_prevents_execution() {
        let pool = WorkerPool::new("test", 1);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = pool.run_delayed(Duration::from_millis(50), Priority::Med, move || {
            tx.send(()).unwrap();
        });
        handle.cancel();
        handle.cancel(); // idempotent
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let pool = WorkerPool::new("test", 1);
        let (tx, rx) = mpsc::channel();
        let handle = pool.run_delayed(Duration::from_millis(5), Priority::Med, move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.cancel();
        assert!(handle.is_settled());
    }

    #[test]
    fn periodic_fires_until_canceled() {
        let pool = WorkerPool::new("test", 1);
        let (tx, rx) = mpsc::channel();
        let handle = pool.run_periodic(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.cancel();

        // drain anything in flight, then confirm silence
        while rx.recv_timeout(Duration::from_millis(50)).is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
