// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A sticky thread-per-worker-object pool. Constructing a worker object
//! (e.g. a database connection) is assumed to be expensive, so each spawned
//! thread keeps its object for as long as the thread lives and is returned
//! to an idle pool between jobs rather than torn down. `add_work` reuses an
//! idle thread if one exists, spawns a new one (with a freshly-built worker
//! object) up to the configured limit, or blocks until a thread frees up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

/// A unit of work handed to a worker object running on its own thread.
pub type Work<T> = Box<dyn FnOnce(&mut T) + Send>;

enum Job<T> {
    Run(Work<T>),
    Exit,
}

struct Worker<T> {
    tx: Sender<Job<T>>,
}

struct State<T> {
    inactive: Vec<Worker<T>>,
    num_running: usize,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerPool<T: Send + 'static> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    max_threads: AtomicUsize,
    state: Mutex<State<T>>,
    inactive_available: Condvar,
    all_inactive: Condvar,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(factory: F) -> Arc<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Arc::new(WorkerPool {
            factory: Box::new(factory),
            max_threads: AtomicUsize::new(usize::MAX),
            state: Mutex::new(State {
                inactive: Vec::new(),
                num_running: 0,
                handles: Vec::new(),
            }),
            inactive_available: Condvar::new(),
            all_inactive: Condvar::new(),
        })
    }

    pub fn set_max_threads(&self, n: usize) {
        self.max_threads.store(n, Ordering::SeqCst);
        self.inactive_available.notify_all();
    }

    fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::SeqCst)
    }

    /// Spawns `num_threads` new idle threads ahead of any work arriving,
    /// ignoring the `max_threads` cap (which only governs how many threads
    /// `add_work` will let run concurrently).
    pub fn spawn(self: &Arc<Self>, num_threads: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..num_threads {
            let worker = self.spawn_worker();
            state.inactive.push(worker.0);
            state.handles.push(worker.1);
        }
    }

    /// Runs `work` on a reused idle worker object, or a freshly spawned one
    /// if under the thread limit, or blocks until one becomes available.
    pub fn add_work<F>(self: &Arc<Self>, work: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let work: Work<T> = Box::new(work);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(worker) = state.inactive.pop() {
                state.num_running += 1;
                let _ = worker.tx.send(Job::Run(work));
                return;
            }
            if state.num_running < self.max_threads() {
                state.num_running += 1;
                let (worker, handle) = self.spawn_worker();
                state.handles.push(handle);
                let _ = worker.tx.send(Job::Run(work));
                return;
            }
            state = self.inactive_available.wait(state).unwrap();
        }
    }

    pub fn num_threads(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.num_running + state.inactive.len()
    }

    pub fn num_running_threads(&self) -> usize {
        self.state.lock().unwrap().num_running
    }

    pub fn num_inactive_threads(&self) -> usize {
        self.state.lock().unwrap().inactive.len()
    }

    /// Waits for all in-flight work to complete, then tells every thread
    /// (idle or newly finished) to exit and joins them all.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        while state.num_running > 0 {
            state = self.all_inactive.wait(state).unwrap();
        }
        for worker in state.inactive.drain(..) {
            let _ = worker.tx.send(Job::Exit);
        }
        let handles = std::mem::take(&mut state.handles);
        drop(state);
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> (Worker<T>, JoinHandle<()>) {
        let (tx, rx) = unbounded::<Job<T>>();
        let tx_for_worker = tx.clone();
        let pool: Weak<Self> = Arc::downgrade(self);
        let worker_object = (self.factory)();
        let handle = thread::spawn(move || {
            let mut worker_object = worker_object;
            loop {
                match rx.recv() {
                    Ok(Job::Run(work)) => {
                        work(&mut worker_object);
                        match pool.upgrade() {
                            Some(pool) => pool.mark_inactive(Worker { tx: tx_for_worker.clone() }),
                            None => break,
                        }
                    }
                    Ok(Job::Exit) | Err(_) => break,
                }
            }
        });
        (Worker { tx }, handle)
    }

    fn mark_inactive(&self, worker: Worker<T>) {
        let mut state = self.state.lock().unwrap();
        state.num_running -= 1;
        state.inactive.push(worker);
        self.inactive_available.notify_all();
        if state.num_running == 0 {
            self.all_inactive.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn spawn_prewarms_idle_threads() {
        let pool = WorkerPool::new(|| 0u32);
        pool.spawn(3);
        assert_eq!(pool.num_threads(), 3);
        assert_eq!(pool.num_inactive_threads(), 3);
        pool.shutdown();
    }

    #[test]
    fn add_work_reuses_the_same_worker_object() {
        let built = Arc::new(AtomicUsize::new(0));
        let b = built.clone();
        let pool = WorkerPool::new(move || {
            b.fetch_add(1, Ordering::SeqCst);
            0u32
        });

        let (tx, rx) = mpsc::channel();
        for _ in 0..5 {
            let tx = tx.clone();
            pool.add_work(move |counter: &mut u32| {
                *counter += 1;
                tx.send(*counter).unwrap();
            });
            // Serialize: only one thread exists until work completes and it
            // goes back to idle, so results arrive in submission order.
            rx.recv().unwrap();
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn max_threads_bounds_concurrency() {
        let pool = WorkerPool::new(|| ());
        pool.set_max_threads(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.add_work(move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(15));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn shutdown_joins_every_thread() {
        let pool = WorkerPool::new(|| ());
        pool.spawn(2);
        pool.add_work(|_| {});
        pool.shutdown();
        assert_eq!(pool.num_threads(), 0);
    }
}
