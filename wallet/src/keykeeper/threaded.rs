//! Key keeper running its inner keeper on a dedicated worker thread.
//!
//! ```text
//!   owner thread                         worker thread
//!   ────────────                         ─────────────
//!   invoke_async ──► task queue ──────►  inner.invoke_sync
//!                    (Mutex+Condvar)          │
//!   dispatch_completions ◄── completion queue ◄┘ (+ Notify)
//! ```
//!
//! Handlers never run on the worker. They run when the owner drains the
//! completion queue, so the owner's state is only ever touched from the
//! owner's own context.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, trace};

use super::{Handler, KeeperError, KeeperResult, Method, PrivateKeyKeeper, Reply};

enum Task {
    Async { method: Method, handler: Handler },
    Sync { method: Method, reply: oneshot::Sender<KeeperResult<Reply>> },
}

struct Completion {
    handler: Handler,
    result: KeeperResult<Reply>,
}

struct TaskQueue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct Shared {
    tasks: Mutex<TaskQueue>,
    task_signal: Condvar,
    completions: Mutex<VecDeque<Completion>>,
    completion_signal: Condvar,
    /// Async calls whose handler has not run yet.
    outstanding: AtomicUsize,
    notify: Option<Arc<Notify>>,
}

pub struct ThreadedKeyKeeper {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedKeyKeeper {
    pub fn new(inner: Arc<dyn PrivateKeyKeeper>) -> KeeperResult<Self> {
        Self::spawn(inner, None)
    }

    /// Like [`ThreadedKeyKeeper::new`], signalling `notify` after every
    /// completion so an async owner can await it.
    pub fn with_notifier(inner: Arc<dyn PrivateKeyKeeper>, notify: Arc<Notify>) -> KeeperResult<Self> {
        Self::spawn(inner, Some(notify))
    }

    fn spawn(inner: Arc<dyn PrivateKeyKeeper>, notify: Option<Arc<Notify>>) -> KeeperResult<Self> {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                running: true,
            }),
            task_signal: Condvar::new(),
            completions: Mutex::new(VecDeque::new()),
            completion_signal: Condvar::new(),
            outstanding: AtomicUsize::new(0),
            notify,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("umbra-keykeeper".into())
            .spawn(move || run_worker(inner, worker_shared))
            .map_err(|e| KeeperError::State(format!("cannot start key keeper worker: {e}")))?;
        debug!("key keeper worker started");

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    fn push(&self, task: Task) {
        let mut queue = self.shared.tasks.lock();
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.task_signal.notify_one();
    }
}

fn run_worker(inner: Arc<dyn PrivateKeyKeeper>, shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.tasks.lock();
            loop {
                if !queue.running {
                    debug!("key keeper worker stopping");
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                shared.task_signal.wait(&mut queue);
            }
        };

        match task {
            Task::Sync { method, reply } => {
                trace!(method = method.name(), "sync keeper call");
                let _ = reply.send(inner.invoke_sync(method));
            }
            Task::Async { method, handler } => {
                trace!(method = method.name(), "async keeper call");
                let result = inner.invoke_sync(method);
                shared.completions.lock().push_back(Completion { handler, result });
                shared.completion_signal.notify_all();
                if let Some(notify) = &shared.notify {
                    notify.notify_one();
                }
            }
        }
    }
}

impl PrivateKeyKeeper for ThreadedKeyKeeper {
    fn invoke_sync(&self, method: Method) -> KeeperResult<Reply> {
        let (reply, rx) = oneshot::channel();
        self.push(Task::Sync { method, reply });
        futures::executor::block_on(rx).unwrap_or(Err(KeeperError::Abandoned))
    }

    fn invoke_async(&self, method: Method, handler: Handler) {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        self.push(Task::Async { method, handler });
    }

    fn dispatch_completions(&self) -> usize {
        let batch = std::mem::take(&mut *self.shared.completions.lock());
        let count = batch.len();
        for completion in batch {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            (completion.handler)(completion.result);
        }
        count
    }

    fn wait_completions(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        {
            let mut queue = self.shared.completions.lock();
            while queue.is_empty() && self.outstanding() > 0 {
                if self
                    .shared
                    .completion_signal
                    .wait_until(&mut queue, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        self.dispatch_completions()
    }

    fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadedKeyKeeper {
    fn drop(&mut self) {
        let discarded = {
            let mut queue = self.shared.tasks.lock();
            queue.running = false;
            let n = queue.tasks.len();
            queue.tasks.clear();
            n
        };
        self.shared.task_signal.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("key keeper worker panicked");
            }
        }

        let undispatched = {
            let mut completions = self.shared.completions.lock();
            let n = completions.len();
            completions.clear();
            n
        };
        debug!(discarded, undispatched, "key keeper shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keykeeper::{KeyKeeperExt, LocalKeyKeeper};
    use crate::storage::WalletDb;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    fn threaded() -> ThreadedKeyKeeper {
        let db = Arc::new(WalletDb::open_temporary().unwrap());
        let inner = Arc::new(LocalKeyKeeper::from_seed(db, &[4u8; 32]).unwrap());
        ThreadedKeyKeeper::new(inner).unwrap()
    }

    /// Inner keeper that records which thread served each call.
    struct ThreadRecorder {
        worker: Mutex<Option<std::thread::ThreadId>>,
    }

    impl PrivateKeyKeeper for ThreadRecorder {
        fn invoke_sync(&self, _method: Method) -> KeeperResult<Reply> {
            *self.worker.lock() = Some(std::thread::current().id());
            Ok(Reply::NonceSlot(0))
        }
    }

    #[test]
    fn handlers_run_only_when_dispatched() {
        let keeper = threaded();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        keeper.invoke_async(
            Method::AllocateNonceSlot,
            Box::new(move |_| flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(keeper.outstanding(), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst), "handler ran without dispatch");

        while keeper.outstanding() > 0 {
            keeper.wait_completions(Duration::from_secs(5));
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn work_runs_on_the_worker_and_handlers_on_the_owner() {
        let recorder = Arc::new(ThreadRecorder {
            worker: Mutex::new(None),
        });
        let keeper = ThreadedKeyKeeper::new(recorder.clone()).unwrap();
        let handler_thread = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&handler_thread);
        keeper.invoke_async(
            Method::AllocateNonceSlot,
            Box::new(move |_| *seen.lock() = Some(std::thread::current().id())),
        );
        while keeper.outstanding() > 0 {
            keeper.wait_completions(Duration::from_secs(5));
        }
        let owner = std::thread::current().id();
        assert_eq!(*handler_thread.lock(), Some(owner));
        assert_ne!(*recorder.worker.lock(), Some(owner));
    }

    #[test]
    fn completions_arrive_in_fifo_order() {
        let keeper = threaded();
        let order = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..16 {
            let order = Arc::clone(&order);
            keeper.invoke_async(
                Method::AllocateNonceSlot,
                Box::new(move |result| {
                    if let Ok(Reply::NonceSlot(slot)) = result {
                        order.lock().push(slot);
                    }
                }),
            );
        }
        while keeper.outstanding() > 0 {
            keeper.wait_completions(Duration::from_secs(5));
        }
        let order = order.lock().clone();
        assert_eq!(order, (1..=16).collect::<Vec<u64>>());
    }

    #[test]
    fn concurrent_callers_get_unique_slots() {
        let keeper = Arc::new(threaded());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let keeper = Arc::clone(&keeper);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| keeper.allocate_nonce_slot().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut slots = HashSet::new();
        for handle in handles {
            for slot in handle.join().unwrap() {
                assert!(slots.insert(slot), "slot {slot} handed out twice");
            }
        }
        assert_eq!(slots.len(), 100);
    }

    #[test]
    fn notifier_is_signalled() {
        let db = Arc::new(WalletDb::open_temporary().unwrap());
        let inner = Arc::new(LocalKeyKeeper::from_seed(db, &[4u8; 32]).unwrap());
        let notify = Arc::new(Notify::new());
        let keeper = ThreadedKeyKeeper::with_notifier(inner, Arc::clone(&notify)).unwrap();
        keeper.invoke_async(Method::AllocateNonceSlot, Box::new(|_| {}));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), notify.notified())
                .await
                .expect("no completion signal");
        });
        assert_eq!(keeper.dispatch_completions(), 1);
    }

    #[test]
    fn drop_discards_pending_handlers() {
        let keeper = threaded();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let fired = Arc::clone(&fired);
            keeper.invoke_async(
                Method::AllocateNonceSlot,
                Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        drop(keeper);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
