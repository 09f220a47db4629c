// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A write-once, thread-safe value cell, plus an aggregating variant that
//! folds many partial contributions into one final value.

use std::sync::{Condvar, Mutex};

struct Inner<T> {
    value: Option<T>,
    callbacks: Vec<Box<dyn FnOnce(&T) + Send>>,
}

/// Fired exactly once. `wait`/`value` block until that happens; callbacks
/// registered before or after firing each run exactly once, on whichever
/// thread causes them to run (the firing thread if registered late, the
/// registering thread if the value was already present).
pub struct Future<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T: Clone + Send + 'static> Future<T> {
    pub fn new() -> Self {
        Future {
            inner: Mutex::new(Inner {
                value: None,
                callbacks: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Sets the value and wakes all waiters. Firing a future a second time
    /// is a programming error, not a runtime condition to recover from.
    pub fn fire(&self, value: T) {
        let callbacks;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.value.is_some() {
                panic!("Future fired more than once");
            }
            inner.value = Some(value.clone());
            callbacks = std::mem::take(&mut inner.callbacks);
        }
        self.cond.notify_all();
        for cb in callbacks {
            cb(&value);
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.lock().unwrap().value.is_some()
    }

    pub fn wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.value.is_none() {
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Blocks until fired, then returns a clone of the value.
    pub fn value(&self) -> T {
        let mut inner = self.inner.lock().unwrap();
        while inner.value.is_none() {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.value.clone().unwrap()
    }

    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        match &inner.value {
            Some(v) => {
                let v = v.clone();
                drop(inner);
                callback(&v);
            }
            None => inner.callbacks.push(Box::new(callback)),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Future::new()
    }
}

/// Subclass hook for [`AggregatingFuture`]: accumulates partial results from
/// any thread, then folds them into one final value when the future is
/// declared done.
pub trait Aggregator: Send {
    type Partial;
    type Result;

    fn add_partial(&mut self, partial: Self::Partial);
    fn finalize(self) -> Self::Result;
}

/// Wraps a `Future<A::Result>` with a fold over partial contributions
/// accumulated under a lock, from any number of threads, until `done` is
/// called.
pub struct AggregatingFuture<A: Aggregator> {
    future: Future<A::Result>,
    state: Mutex<Option<A>>,
}

impl<A: Aggregator + 'static> AggregatingFuture<A>
where
    A::Result: Clone + Send + 'static,
{
    pub fn new(aggregator: A) -> Self {
        AggregatingFuture {
            future: Future::new(),
            state: Mutex::new(Some(aggregator)),
        }
    }

    pub fn add_partial_result(&self, partial: A::Partial) {
        let mut state = self.state.lock().unwrap();
        if let Some(agg) = state.as_mut() {
            agg.add_partial(partial);
        }
    }

    /// Finalizes accumulated partials into a result and fires the future.
    /// Calling this twice is a programming error (same as firing a plain
    /// `Future` twice).
    pub fn done(&self) {
        let aggregator = self
            .state
            .lock()
            .unwrap()
            .take()
            .expect("AggregatingFuture::done called more than once");
        let result = aggregator.finalize();
        self.future.fire(result);
    }

    pub fn future(&self) -> &Future<A::Result> {
        &self.future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_unblocks_after_fire() {
        let fut: Arc<Future<i32>> = Arc::new(Future::new());
        let f2 = fut.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            f2.fire(42);
        });
        assert_eq!(fut.value(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn callback_runs_exactly_once_registered_before_or_after() {
        let fut: Future<i32> = Future::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        fut.add_callback(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        fut.fire(7);
        let c2 = count.clone();
        fut.add_callback(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic]
    fn firing_twice_panics() {
        let fut: Future<i32> = Future::new();
        fut.fire(1);
        fut.fire(2);
    }

    struct SumAggregator {
        total: i64,
    }
    impl Aggregator for SumAggregator {
        type Partial = i64;
        type Result = i64;
        fn add_partial(&mut self, partial: i64) {
            self.total += partial;
        }
        fn finalize(self) -> i64 {
            self.total
        }
    }

    #[test]
    fn aggregating_future_folds_partials() {
        let agg: AggregatingFuture<SumAggregator> = AggregatingFuture::new(SumAggregator { total: 0 });
        agg.add_partial_result(10);
        agg.add_partial_result(5);
        agg.done();
        assert_eq!(agg.future().value(), 15);
    }
}
