//! Fixed-size worker pool
//!
//! One task per input file, plus one per output chunk at finalize. `join`
//! drains the queue and then holds dispatch closed, which is the barrier
//! `save` relies on; `go` reopens it. Tasks queued while closed simply wait
//! for the next `go`.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    open: bool,
    active: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    drained: Condvar,
}

pub struct Pool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                open: true,
                active: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
        });

        let workers = (0..num_threads.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();

        Self { shared, workers }
    }

    pub fn add<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.queue.push_back(Box::new(job));
        if state.open {
            self.shared.work_ready.notify_one();
        }
    }

    /// Drain every queued task, then hold dispatch closed until [`Pool::go`].
    pub fn join(&self) {
        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.active == 0) {
            self.shared.drained.wait(&mut state);
        }
        state.open = false;
    }

    /// Reopen dispatch after a join.
    pub fn go(&self) {
        let mut state = self.shared.state.lock();
        state.open = true;
        self.shared.work_ready.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if state.open {
                    if let Some(job) = state.queue.pop_front() {
                        state.active += 1;
                        break job;
                    }
                }
                shared.work_ready.wait(&mut state);
            }
        };

        // A panicking task must not take its worker down with it.
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("worker task panicked");
        }

        let mut state = shared.state.lock();
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            shared.drained.notify_all();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_join_drains_all_tasks() {
        let pool = Pool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.add(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_tasks_queued_while_closed_run_after_go() {
        let pool = Pool::new(2);
        pool.join();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.add(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Closed pool: nothing runs yet.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.go();
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        let pool = Pool::new(1);
        pool.add(|| panic!("boom"));
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.add(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
