//! Execution context: the single-threaded lane a handler's deliveries run on.
//!
//! The scheduler that drives a context's future is deliberately out of scope for this crate —
//! callers may plug in whatever runtime they like by implementing [`Context`]. [`LaneContext`] is
//! the one reference implementation provided, backed by an unbounded channel and a single
//! dedicated worker task, matching the "single-threaded execution lane" the design calls for.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, type-erased unit-returning future, the shape every scheduled delivery takes.
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A single-threaded execution lane.
///
/// Deliveries to handlers bound to the same `Context` run serially and in the order they were
/// spawned; deliveries on different contexts may run concurrently with each other. Callers
/// outside this crate are responsible for actually polling the spawned tasks to completion
/// (typically by handing them to an async runtime); this crate only guarantees FIFO ordering of
/// the calls to [`Context::spawn`], not of task completion without cooperation from the runtime.
pub trait Context: Send + Sync {
    /// Schedule `task` to run on this context.
    fn spawn(&self, task: BoxedTask);
}

/// Reference [`Context`] implementation: an unbounded `flume` channel drained by one worker
/// task spawned once at construction.
///
/// This is the default context assigned to handlers that do not specify one explicitly. It is a
/// minimal, runtime-agnostic lane — not a general-purpose scheduler — matching the crate's
/// stance that the scheduler abstraction itself is an external collaborator.
pub struct LaneContext {
    tx: flume::Sender<BoxedTask>,
}

impl LaneContext {
    /// Spawn a new lane, handing its worker loop to `spawn_fn` (typically
    /// `compio::runtime::spawn` or an equivalent executor entry point).
    pub fn new<F>(spawn_fn: F) -> Arc<Self>
    where
        F: FnOnce(BoxedTask),
    {
        let (tx, rx) = flume::unbounded::<BoxedTask>();
        let worker: BoxedTask = Box::pin(async move {
            while let Ok(task) = rx.recv_async().await {
                task.await;
            }
        });
        spawn_fn(worker);
        Arc::new(Self { tx })
    }
}

impl Context for LaneContext {
    fn spawn(&self, task: BoxedTask) {
        // The lane's worker loop holds the receiver for as long as the lane is alive; a send
        // error here means the worker task itself has already exited (e.g. runtime shutdown),
        // which is a best-effort drop, not a bug to propagate.
        let _ = self.tx.send(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context as TaskContext, Poll, Wake, Waker};
    use std::time::Duration;

    struct ParkWaker;
    impl Wake for ParkWaker {
        fn wake(self: Arc<Self>) {}
    }

    /// A minimal, std-only executor: polls `fut` on the current thread until ready, sleeping
    /// briefly between polls. Good enough to drive a `LaneContext` worker loop in tests without
    /// pulling in an async runtime dependency.
    fn block_on(mut fut: BoxedTask) {
        let waker = Waker::from(Arc::new(ParkWaker));
        let mut cx = TaskContext::from_waker(&waker);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => return,
                Poll::Pending => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    #[test]
    fn lane_runs_tasks_in_fifo_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let lane = LaneContext::new(|worker| {
            std::thread::spawn(move || block_on(worker));
        });

        for i in 0..5 {
            let order = order.clone();
            lane.spawn(Box::pin(async move {
                order.lock().unwrap().push(i);
            }));
        }

        // Give the worker thread a moment to drain the channel.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn lane_delivers_after_drop_is_a_noop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let lane = LaneContext::new(|worker| {
            std::thread::spawn(move || block_on(worker));
        });
        drop(lane.clone());
        let counter2 = counter.clone();
        lane.spawn(Box::pin(async move {
            counter2.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
