//! Serialized worker.
//!
//! Every call into a loaded program that changes its state runs on one
//! thread, one job at a time. Callers on other threads block until their job
//! finished; a call made from inside a job runs inline.

#![allow(missing_docs)]

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::RuntimeError;

type Job = Box<dyn FnOnce() + Send>;
type JobResult<R> = Result<R, Box<dyn Any + Send>>;

const REPLY_CHECK: Duration = Duration::from_millis(100);

enum Message {
    Job(Job),
    Quit,
}

struct WorkerInner {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    thread: Mutex<Option<ThreadId>>,
    finished: AtomicBool,
}

/// Handle to the serialized worker. Clones share the same queue.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("thread", &*self.inner.thread.lock())
            .field("finished", &self.inner.finished.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(WorkerInner {
                tx,
                rx,
                thread: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Execute queued jobs on the calling thread until [`Worker::quit`].
    pub fn run_loop(&self) {
        *self.inner.thread.lock() = Some(thread::current().id());
        debug!("worker loop running");
        while let Ok(message) = self.inner.rx.recv() {
            match message {
                Message::Job(job) => job(),
                Message::Quit => break,
            }
        }
        self.inner.finished.store(true, Ordering::SeqCst);
        // Dropping pending jobs releases their callers.
        while self.inner.rx.try_recv().is_ok() {}
        debug!("worker loop finished");
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(&self, name: impl Into<String>) -> Result<JoinHandle<()>, RuntimeError> {
        let worker = self.clone();
        let (id_tx, id_rx) = crossbeam_channel::bounded(1);
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                *worker.inner.thread.lock() = Some(thread::current().id());
                let _ = id_tx.send(());
                worker.run_loop();
            })
            .map_err(|err| RuntimeError::ThreadSpawn(err.to_string().into()))?;
        let _ = id_rx.recv();
        Ok(join)
    }

    /// Ask the loop to stop after the job in progress.
    pub fn quit(&self) {
        let _ = self.inner.tx.send(Message::Quit);
    }

    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        *self.inner.thread.lock() == Some(thread::current().id())
    }

    /// Run `job` on the worker thread and return its result.
    ///
    /// A panic inside the job resumes on the caller with its original payload.
    pub fn call<F, R>(&self, job: F) -> Result<R, RuntimeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker_thread() {
            return Ok(job());
        }
        if self.inner.finished.load(Ordering::SeqCst) {
            return Err(RuntimeError::WorkerUnavailable);
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<JobResult<R>>(1);
        let wrapped: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = reply_tx.send(result);
        });
        self.inner
            .tx
            .send(Message::Job(wrapped))
            .map_err(|_| RuntimeError::WorkerUnavailable)?;
        let result = loop {
            match reply_rx.recv_timeout(REPLY_CHECK) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Disconnected) => return Err(RuntimeError::WorkerUnavailable),
                Err(RecvTimeoutError::Timeout) => {
                    if self.inner.finished.load(Ordering::SeqCst) {
                        match reply_rx.try_recv() {
                            Ok(result) => break result,
                            Err(_) => return Err(RuntimeError::WorkerUnavailable),
                        }
                    }
                }
            }
        };
        match result {
            Ok(value) => Ok(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn call_returns_job_result() {
        let worker = Worker::new();
        let handle = worker.spawn("test-worker").unwrap();
        assert_eq!(worker.call(|| 40 + 2).unwrap(), 42);
        let err: Result<(), RuntimeError> = worker
            .call(|| Err(RuntimeError::Load("bad".into())))
            .unwrap();
        assert_eq!(err, Err(RuntimeError::Load("bad".into())));
        worker.quit();
        handle.join().unwrap();
    }

    #[test]
    fn jobs_run_in_order_without_overlap() {
        let worker = Worker::new();
        let handle = worker.spawn("test-worker").unwrap();
        let busy = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(Vec::new()));
        let threads: Vec<_> = (0..4)
            .map(|client| {
                let worker = worker.clone();
                let busy = busy.clone();
                let log = log.clone();
                thread::spawn(move || {
                    for seq in 0..25 {
                        let busy = busy.clone();
                        let log = log.clone();
                        worker
                            .call(move || {
                                assert!(!busy.swap(true, Ordering::SeqCst), "jobs overlapped");
                                log.lock().push((client, seq));
                                busy.store(false, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let log = log.lock();
        assert_eq!(log.len(), 100);
        for client in 0..4 {
            let seqs: Vec<_> = log
                .iter()
                .filter(|(c, _)| *c == client)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        }
        worker.quit();
        handle.join().unwrap();
    }

    #[test]
    fn nested_call_runs_inline() {
        let worker = Worker::new();
        let handle = worker.spawn("test-worker").unwrap();
        let inner = worker.clone();
        let value = worker
            .call(move || inner.call(|| 7).unwrap() * 2)
            .unwrap();
        assert_eq!(value, 14);
        worker.quit();
        handle.join().unwrap();
    }

    #[test]
    fn panic_resumes_on_caller() {
        let worker = Worker::new();
        let handle = worker.spawn("test-worker").unwrap();
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = worker.call(|| panic!("native fault"));
        }));
        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"native fault"));
        // The worker survives the panic.
        assert_eq!(worker.call(|| 1).unwrap(), 1);
        worker.quit();
        handle.join().unwrap();
    }

    #[test]
    fn call_after_quit_fails() {
        let worker = Worker::new();
        let handle = worker.spawn("test-worker").unwrap();
        worker.quit();
        handle.join().unwrap();
        assert_eq!(worker.call(|| ()), Err(RuntimeError::WorkerUnavailable));
    }

    #[test]
    fn run_loop_on_current_thread() {
        let worker = Worker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let client = {
            let worker = worker.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                while worker.inner.thread.lock().is_none() {
                    thread::sleep(Duration::from_millis(1));
                }
                for _ in 0..3 {
                    let counter = counter.clone();
                    worker
                        .call(move || counter.fetch_add(1, Ordering::SeqCst))
                        .unwrap();
                }
                worker.quit();
            })
        };
        worker.run_loop();
        client.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
