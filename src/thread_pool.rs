use crossbeam_deque::{Injector, Stealer, Worker};
use std::{
    io, iter,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker queue is full ({0} pending tasks)")]
pub struct PoolFull(pub usize);

struct Parker {
    tokens: Mutex<usize>,
    condvar: Condvar,
    max_tokens: usize,
}

impl Parker {
    fn new(max_tokens: usize) -> Self {
        Self {
            tokens: Mutex::new(0),
            condvar: Condvar::new(),
            max_tokens,
        }
    }

    fn wait(&self, closed: &AtomicBool) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        while *tokens == 0 && !closed.load(Ordering::Acquire) {
            tokens = self
                .condvar
                .wait(tokens)
                .unwrap_or_else(|e| e.into_inner());
        }
        *tokens = tokens.saturating_sub(1);
    }

    fn notify_one(&self) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if *tokens < self.max_tokens {
            *tokens += 1;
            self.condvar.notify_one();
        }
    }

    fn notify_all(&self) {
        let _tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        self.condvar.notify_all();
    }
}

struct Shared {
    injector: Injector<Task>,
    parker: Parker,
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// Bounded work-stealing pool. Tasks still queued when the pool is dropped
/// are drained before the workers exit.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    queue_size: usize,
}

impl ThreadPool {
    pub fn new(size: usize, queue_size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            parker: Parker::new(size),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let locals: Vec<Worker<Task>> = (0..size).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Task>> = locals.iter().map(Worker::stealer).collect();

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(size),
            queue_size,
        };
        for (idx, local) in locals.into_iter().enumerate() {
            let shared = Arc::clone(&pool.shared);
            let stealers = stealers.clone();
            // on error the workers spawned so far are shut down by Drop
            let handle = thread::Builder::new()
                .name(format!("dispatch-worker-{}", idx))
                .spawn(move || work(local, &stealers, &shared))?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolFull>
    where
        F: FnOnce() + Send + 'static,
    {
        let pending = self.shared.pending.load(Ordering::Relaxed);
        if pending >= self.queue_size {
            return Err(PoolFull(pending));
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.injector.push(Box::new(f));
        self.shared.parker.notify_one();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.parker.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn work(local: Worker<Task>, stealers: &[Stealer<Task>], shared: &Shared) {
    loop {
        let task = local.pop().or_else(|| {
            iter::repeat_with(|| {
                shared
                    .injector
                    .steal_batch_and_pop(&local)
                    .or_else(|| stealers.iter().map(|s| s.steal()).collect())
            })
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        });

        match task {
            Some(task) => {
                shared.pending.fetch_sub(1, Ordering::SeqCst);
                let _ = catch_unwind(AssertUnwindSafe(task));
            }
            None if shared.closed.load(Ordering::Acquire) => {
                if shared.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
            }
            None => {
                let mut spun = false;
                for _ in 0..64 {
                    if shared.pending.load(Ordering::Relaxed) > 0 {
                        spun = true;
                        break;
                    }
                    std::hint::spin_loop();
                }
                if !spun {
                    shared.parker.wait(&shared.closed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_on_workers() {
        let pool = ThreadPool::new(4, 64).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let mut seen: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_bound_is_enforced() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // the worker is busy, so this one sits in the queue
        pool.execute(|| {}).unwrap();
        assert_eq!(pool.execute(|| {}), Err(PoolFull(1)));

        block_tx.send(()).unwrap();
    }

    #[test]
    fn test_drop_drains_queue_and_survives_panics() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2, 128).unwrap();
            pool.execute(|| panic!("task failure")).unwrap();
            for _ in 0..32 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
