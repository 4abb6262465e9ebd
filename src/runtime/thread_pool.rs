//! Fixed-size worker pool draining a shared FIFO of closures.
//!
//! One mutex guards the queue and the closed flag; one condition variable
//! wakes idle workers. Dropping the pool closes it: workers finish whatever
//! is still queued, then exit, and the drop joins them.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by `ThreadPool::submit`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("thread pool is shut down")]
    Closed,
}

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Pool of `N` named worker threads.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(num_threads),
        };

        for worker_id in 0..num_threads {
            let shared = Arc::clone(&pool.shared);
            // On spawn failure `pool` is dropped here, which joins the
            // workers already started.
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &shared))?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks waiting to be picked up.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Enqueue a task and wake one idle worker.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(PoolError::Closed);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Stop accepting tasks and wake every worker.
    ///
    /// Workers drain the queue before exiting; in-flight tasks are never
    /// interrupted.
    pub fn shutdown(&self) {
        self.shared.queue.lock().closed = true;
        self.shared.available.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    debug!(worker = worker_id, "Worker started");
    let mut queue = shared.queue.lock();
    loop {
        if let Some(task) = queue.tasks.pop_front() {
            drop(queue);
            task();
            queue = shared.queue.lock();
        } else if queue.closed {
            break;
        } else {
            shared.available.wait(&mut queue);
        }
    }
    debug!(worker = worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_each_task_runs_once() {
        let pool = ThreadPool::new(4).unwrap();
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..500).map(|_| AtomicUsize::new(0)).collect());

        for i in 0..500 {
            let counts = Arc::clone(&counts);
            pool.submit(move || {
                counts[i].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        drop(pool);
        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_concurrent_submitters() {
        let pool = Arc::new(ThreadPool::new(3).unwrap());
        let total = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    for _ in 0..250 {
                        let total = Arc::clone(&total);
                        pool.submit(move || {
                            total.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pool = Arc::try_unwrap(pool).ok().unwrap();
        drop(pool);
        assert_eq!(total.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_tasks_run_on_named_workers() {
        let pool = ThreadPool::new(2).unwrap();
        assert_eq!(pool.size(), 2);
        let (tx, rx) = mpsc::channel();
        for _ in 0..20 {
            let tx = tx.clone();
            pool.submit(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send(name).unwrap();
            })
            .unwrap();
        }
        drop(tx);

        let names: HashSet<_> = rx.iter().flatten().collect();
        assert!(!names.is_empty());
        assert!(names.iter().all(|n| n.starts_with("worker-")));
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = ThreadPool::new(1).unwrap();
        pool.shutdown();
        assert_eq!(pool.submit(|| {}), Err(PoolError::Closed));
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = ThreadPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        // Block the only worker so the rest pile up in the queue.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        release_tx.send(()).unwrap();
        drop(pool);
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }
}
