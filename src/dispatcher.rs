use bytes::Bytes;
use std::{
    io,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, info, warn};

use crate::{
    bootstrap::{Dispatch, DispatcherFlags},
    thread_pool::ThreadPool,
};

pub const DEFAULT_MSG_BUF_SIZE: usize = 32 * 1024;

const WORKERS: usize = 4;
const QUEUE_SIZE: usize = 4096;

/// One-shot latch shared by the backend, its dispatchers and the signal
/// handler.
#[derive(Default)]
pub struct StopSignal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        *raised = true;
        self.condvar.notify_all();
    }

    pub fn wait(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        while !*raised {
            raised = self
                .condvar
                .wait(raised)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Default)]
struct Stats {
    messages: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub messages: u64,
    pub bytes: u64,
    pub dropped: u64,
}

pub struct Dispatcher {
    flags: DispatcherFlags,
    msg_buf_size: usize,
    pool: ThreadPool,
    stats: Arc<Stats>,
    stop: Arc<StopSignal>,
}

impl Dispatcher {
    pub fn new(
        flags: DispatcherFlags,
        msg_buf_size: u32,
        stop: Arc<StopSignal>,
    ) -> io::Result<Self> {
        let msg_buf_size = match msg_buf_size {
            0 => DEFAULT_MSG_BUF_SIZE,
            n => n as usize,
        };
        Ok(Self {
            flags,
            msg_buf_size,
            pool: ThreadPool::new(WORKERS, QUEUE_SIZE)?,
            stats: Arc::new(Stats::default()),
            stop,
        })
    }

    /// Largest message a listener hands over in one piece.
    pub fn msg_buf_size(&self) -> usize {
        self.msg_buf_size
    }

    pub fn deliver(&self, endpoint: &Arc<str>, message: Bytes) {
        let stats = Arc::clone(&self.stats);
        let endpoint = Arc::clone(endpoint);
        let monitor = self.flags.monitor;
        let queued = self.pool.execute(move || {
            stats.messages.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes
                .fetch_add(message.len() as u64, Ordering::Relaxed);
            if monitor {
                debug!("{} bytes from {}", message.len(), endpoint);
            }
        });
        if let Err(e) = queued {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping message: {}", e);
        }
    }

    pub fn counters(&self) -> Counters {
        Counters {
            messages: self.stats.messages.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Dispatch for Dispatcher {
    fn run(&self, blocking: bool) {
        if !blocking {
            return;
        }
        self.stop.wait();
        if self.flags.monitor {
            let c = self.counters();
            info!(
                "Dispatcher stopped: {} messages, {} bytes, {} dropped, {} pending",
                c.messages,
                c.bytes,
                c.dropped,
                self.pool.pending()
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    cond()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn test_zero_size_uses_default() {
        let stop = Arc::new(StopSignal::default());
        let d = Dispatcher::new(DispatcherFlags::default(), 0, Arc::clone(&stop)).unwrap();
        assert_eq!(d.msg_buf_size(), DEFAULT_MSG_BUF_SIZE);

        let d = Dispatcher::new(DispatcherFlags::default(), 4096, stop).unwrap();
        assert_eq!(d.msg_buf_size(), 4096);
    }

    #[test]
    fn test_delivered_messages_are_counted() {
        let flags = DispatcherFlags { monitor: true };
        let d = Dispatcher::new(flags, 0, Arc::new(StopSignal::default())).unwrap();
        let endpoint: Arc<str> = Arc::from("unix:test");

        d.deliver(&endpoint, Bytes::from_static(b"hello"));
        d.deliver(&endpoint, Bytes::from_static(b"world!"));

        assert!(wait_for(|| d.counters().messages == 2));
        assert_eq!(
            d.counters(),
            Counters {
                messages: 2,
                bytes: 11,
                dropped: 0
            }
        );
    }

    #[test]
    fn test_blocking_run_returns_on_stop() {
        let stop = Arc::new(StopSignal::default());
        let d = Dispatcher::new(DispatcherFlags::default(), 0, Arc::clone(&stop)).unwrap();
        let d = Arc::new(d);

        // non-blocking run never waits
        d.run(false);

        let (tx, rx) = mpsc::channel();
        let runner = {
            let d = Arc::clone(&d);
            thread::spawn(move || {
                d.run(true);
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        stop.raise();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        runner.join().unwrap();
    }
}
