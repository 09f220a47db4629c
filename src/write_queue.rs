// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Per-descriptor outbound buffering. A `WriteQueue` is a FIFO of `Knot`s
//! drained by exactly one consumer — the event loop thread for the
//! descriptor it is bound to — while any number of producer threads enqueue
//! concurrently. A `StreamingWriter` reserves the queue so one producer's
//! multi-part write appears to the descriptor as a single contiguous run,
//! even while other producers keep calling `write`/`write_with_block`.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::HarnessResult;
use crate::knot::{Knot, KnotIter};

struct Inner {
    pending: VecDeque<Knot>,
    pending_bytes: usize,
    max_pending_bytes: usize,
    blocked_threads: usize,
    active_writer: bool,
    deferred: VecDeque<Knot>,
    write_cursor: Option<KnotIter>,
}

/// A callback fired when the queue transitions from empty to non-empty, so
/// the owning event loop can nudge its poll with a `mio::Waker`. Queues not
/// bound to a loop (used standalone in tests) simply pass `None`.
type WakeFn = dyn Fn() + Send + Sync;

pub struct WriteQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    writer_released: Condvar,
    wake: Option<Arc<WakeFn>>,
}

impl WriteQueue {
    pub fn new(max_pending_bytes: usize) -> Arc<WriteQueue> {
        Arc::new(WriteQueue {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                pending_bytes: 0,
                max_pending_bytes,
                blocked_threads: 0,
                active_writer: false,
                deferred: VecDeque::new(),
                write_cursor: None,
            }),
            not_full: Condvar::new(),
            writer_released: Condvar::new(),
            wake: None,
        })
    }

    pub fn with_waker(max_pending_bytes: usize, wake: Arc<WakeFn>) -> Arc<WriteQueue> {
        Arc::new(WriteQueue {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                pending_bytes: 0,
                max_pending_bytes,
                blocked_threads: 0,
                active_writer: false,
                deferred: VecDeque::new(),
                write_cursor: None,
            }),
            not_full: Condvar::new(),
            writer_released: Condvar::new(),
            wake: Some(wake),
        })
    }

    pub fn set_maximum_pending_bytes(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_pending_bytes = n;
        self.not_full.notify_all();
    }

    pub fn num_blocked_threads(&self) -> usize {
        self.inner.lock().unwrap().blocked_threads
    }

    fn enqueue_locked(&self, inner: &mut Inner, knot: Knot) {
        let was_empty = inner.pending.is_empty();
        let size = knot.size();
        if inner.active_writer {
            inner.deferred.push_back(knot);
        } else {
            inner.pending.push_back(knot);
        }
        inner.pending_bytes += size;
        if was_empty {
            if let Some(wake) = &self.wake {
                wake();
            }
        }
    }

    /// Enqueues `knot` if doing so would not exceed the configured
    /// threshold. Returns `false` without side effects otherwise; the
    /// caller keeps ownership of `knot` in that case.
    pub fn write(&self, knot: Knot) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_bytes + knot.size() > inner.max_pending_bytes {
            return false;
        }
        self.enqueue_locked(&mut inner, knot);
        true
    }

    /// Blocks until queued bytes are at or below the threshold, then
    /// enqueues unconditionally.
    pub fn write_with_block(&self, knot: Knot) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked_threads += 1;
        while inner.pending_bytes > inner.max_pending_bytes {
            inner = self.not_full.wait(inner).unwrap();
        }
        inner.blocked_threads -= 1;
        self.enqueue_locked(&mut inner, knot);
    }

    /// Reserves the queue for one producer's atomic multi-part write.
    /// Blocks until any existing streaming writer has released.
    pub fn get_streaming_writer(self: &Arc<Self>) -> StreamingWriter {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked_threads += 1;
        while inner.active_writer {
            inner = self.writer_released.wait(inner).unwrap();
        }
        inner.blocked_threads -= 1;
        inner.active_writer = true;
        StreamingWriter {
            queue: self.clone(),
            released: false,
        }
    }

    /// Called by the single descriptor-owning thread when the descriptor
    /// becomes writable. Writes as much as possible without blocking.
    /// Returns `true` once the queue has fully drained.
    pub fn drain_once<W: Write>(&self, sink: &mut W) -> HarnessResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let front = match inner.pending.front() {
                Some(k) => k.clone(),
                None => return Ok(true),
            };
            let start = inner.write_cursor.unwrap_or_else(|| front.begin());
            let (next, res) = front.write_to(sink, start);
            match res {
                Ok(()) => {
                    if next == front.end() {
                        let done = inner.pending.pop_front().unwrap();
                        inner.pending_bytes -= done.size();
                        inner.write_cursor = None;
                        self.not_full.notify_all();
                        if inner.pending.is_empty() {
                            return Ok(true);
                        }
                        continue;
                    }
                    if next == start {
                        // No progress: the sink is full for now.
                        return Ok(false);
                    }
                    inner.write_cursor = Some(next);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }
}

/// A reserved atomic-write session on a [`WriteQueue`]. While held, writes
/// from other producers are deferred until [`StreamingWriter::done`] (or
/// `Drop`) flushes them back onto the queue after this session's bytes.
pub struct StreamingWriter {
    queue: Arc<WriteQueue>,
    released: bool,
}

impl StreamingWriter {
    /// Writes directly into the queue's pending deque, ahead of anything
    /// deferred during this session.
    pub fn write(&self, knot: Knot) {
        let mut inner = self.queue.inner.lock().unwrap();
        let was_empty = inner.pending.is_empty();
        inner.pending_bytes += knot.size();
        inner.pending.push_back(knot);
        if was_empty {
            if let Some(wake) = &self.queue.wake {
                wake();
            }
        }
    }

    /// Ends the session: flushes anything deferred by concurrent producers
    /// onto the back of the queue and releases the reservation.
    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut inner = self.queue.inner.lock().unwrap();
        inner.active_writer = false;
        while let Some(k) = inner.deferred.pop_front() {
            inner.pending.push_back(k);
        }
        self.queue.writer_released.notify_all();
    }
}

impl Drop for StreamingWriter {
    fn drop(&mut self) {
        self.release();
    }
}
