//! Fixed-size worker pool for instruction dispatch and other work that must
//! not run on a manager's poll-loop thread.

use solder::logging;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<TaskQueue>,
    available: Condvar,
    log: logging::Logger,
}

struct TaskQueue {
    tasks: VecDeque<Task>,
    stopping: bool,
}

/// A task queue drained by a fixed set of worker threads. Stopping drains
/// the queue before the workers exit.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(size: usize, log: L) -> WorkerPool {
        assert!(size > 0, "Worker pool must have at least one thread");

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
            log: logging::child(log),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("conduit-worker-{}", index))
                .spawn(move || Self::worker_loop(shared))
                .expect("Worker thread spawn failed");
            workers.push(handle);
        }

        WorkerPool {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a task. Tasks submitted after `stop` are dropped.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, task: F) {
        let mut queue = self.shared.queue.lock().expect("Task queue lock poisoned");

        if queue.stopping {
            logging::debug!(self.shared.log, "task dropped, pool is stopping");
            return;
        }

        queue.tasks.push_back(Box::new(task));
        self.shared.available.notify_one();
    }

    /// Signals the workers to finish the queued tasks and exit, then joins
    /// them.
    pub fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("Task queue lock poisoned");
            queue.stopping = true;
        }
        self.shared.available.notify_all();

        let mut workers = self.workers.lock().expect("Worker list lock poisoned");
        for handle in workers.drain(..) {
            drop(handle.join());
        }
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            let task = {
                let mut queue = shared.queue.lock().expect("Task queue lock poisoned");

                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break Some(task);
                    }

                    if queue.stopping {
                        break None;
                    }

                    queue = shared
                        .available
                        .wait(queue)
                        .expect("Task queue lock poisoned");
                }
            };

            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
