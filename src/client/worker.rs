//! Per-device worker threads
//!
//! Each device gets exactly one persistent thread fed by an `mpsc` queue.
//! Tasks for one device therefore run one at a time in submission order,
//! while different devices make progress in parallel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::{ForgeError, ForgeResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Run(Task),
    Shutdown,
}

/// A named thread running tasks for one device
#[derive(Debug)]
pub struct WorkerThread {
    device_ordinal: usize,
    sender: Mutex<Sender<WorkerMessage>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl WorkerThread {
    pub(crate) fn spawn(device_ordinal: usize, name: String) -> ForgeResult<Self> {
        let (sender, receiver) = mpsc::channel::<WorkerMessage>();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!(device_ordinal, "WorkerThread: started");
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Run(task) => {
                            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                tracing::error!(device_ordinal, "WorkerThread: task panicked");
                            }
                        }
                        WorkerMessage::Shutdown => break,
                    }
                }
                tracing::debug!(device_ordinal, "WorkerThread: stopped");
            })
            .map_err(|e| {
                ForgeError::Internal(format!("failed to spawn worker thread {}: {}", name, e))
            })?;
        let thread_id = handle.thread().id();
        Ok(WorkerThread {
            device_ordinal,
            sender: Mutex::new(sender),
            handle: Some(handle),
            thread_id,
        })
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    /// Queue `task` behind everything already submitted to this device
    pub fn schedule<F>(&self, task: F) -> ForgeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .lock()?
            .send(WorkerMessage::Run(Box::new(task)))
            .map_err(|_| {
                ForgeError::Internal(format!(
                    "worker thread for device {} has stopped",
                    self.device_ordinal
                ))
            })
    }

    /// Whether the calling thread is this worker
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            // The last client reference can be released by a task on this
            // very thread; it exits on its own after the Shutdown message.
            if self.is_current() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(
                    device_ordinal = self.device_ordinal,
                    "WorkerThread: thread panicked during shutdown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_order() {
        let worker = WorkerThread::spawn(0, "test-worker-0".to_string()).unwrap();
        let (tx, rx) = channel();
        for i in 0..16 {
            let tx = tx.clone();
            worker.schedule(move || tx.send(i).unwrap()).unwrap();
        }
        let received: Vec<i32> = (0..16).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let worker = WorkerThread::spawn(1, "test-worker-1".to_string()).unwrap();
        worker.schedule(|| panic!("task failure")).unwrap();

        let (tx, rx) = channel();
        worker.schedule(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn test_drop_on_own_thread_does_not_deadlock() {
        let worker = Arc::new(WorkerThread::spawn(2, "test-worker-2".to_string()).unwrap());
        let (tx, rx) = channel();
        let inner = Arc::clone(&worker);
        worker
            .schedule(move || {
                tx.send(inner.is_current()).unwrap();
                drop(inner);
            })
            .unwrap();
        assert!(rx.recv().unwrap());
        drop(worker);
    }
}
