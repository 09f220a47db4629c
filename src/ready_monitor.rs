// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Client-side throttle for an SUT connection that only accepts one
//! in-flight command at a time, signalling acceptance of the previous one by
//! sending a bare "READY" line. A [`ReadyMonitor`] queues sends made while a
//! command is still outstanding and releases them strictly in order as
//! "READY" lines arrive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::dispatch::{ExtOutcome, ProtocolExtension};
use crate::error::{HarnessError, HarnessResult};
use crate::future::Future;
use crate::knot::Knot;
use crate::write_queue::WriteQueue;

struct QueuedSend {
    knot: Knot,
    callback: Option<Box<dyn FnOnce() + Send>>,
    sent: Option<Arc<Future<()>>>,
}

struct State {
    ready: bool,
    queue: VecDeque<QueuedSend>,
}

/// Tracks readiness for one outbound stream and serializes sends against it.
/// Starts not-ready: nothing is written until the first "READY" is observed,
/// matching an SUT that announces its own startup before accepting input.
pub struct ReadyMonitor {
    write_queue: Arc<WriteQueue>,
    state: Mutex<State>,
}

impl ReadyMonitor {
    pub fn new(write_queue: Arc<WriteQueue>) -> Arc<Self> {
        Arc::new(ReadyMonitor {
            write_queue,
            state: Mutex::new(State {
                ready: false,
                queue: VecDeque::new(),
            }),
        })
    }

    /// Enqueues `knot` and blocks the calling thread until it has actually
    /// been written to the queue (i.e. its turn came up and readiness was
    /// available).
    pub fn block_until_ready_and_send(&self, knot: Knot) {
        let sent = Arc::new(Future::new());
        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(QueuedSend {
                knot,
                callback: None,
                sent: Some(sent.clone()),
            });
            self.drain_locked(&mut state);
        }
        sent.wait();
    }

    /// Enqueues `knot` without blocking. `callback` runs immediately before
    /// the item is actually written — useful for e.g. stamping a timestamp
    /// no earlier than the moment the send truly happens.
    pub fn schedule_send<F>(&self, knot: Knot, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(QueuedSend {
            knot,
            callback: Some(Box::new(callback)),
            sent: None,
        });
        self.drain_locked(&mut state);
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    pub fn num_queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn on_ready_received(&self) {
        let mut state = self.state.lock().unwrap();
        state.ready = true;
        self.drain_locked(&mut state);
    }

    /// Sends at most one queued item while ready, consuming readiness.
    /// Looping isn't needed: after one send `ready` goes false again, so the
    /// while-condition stops the loop on its own.
    fn drain_locked(&self, state: &mut State) {
        while state.ready {
            let item = match state.queue.pop_front() {
                Some(item) => item,
                None => break,
            };
            state.ready = false;
            if let Some(callback) = item.callback {
                callback();
            }
            self.write_queue.write_with_block(item.knot);
            if let Some(sent) = item.sent {
                sent.fire(());
            }
        }
    }

    /// Registers this monitor's "READY" handling on a dispatcher, as a
    /// stateless extension reused across every occurrence.
    pub fn install(self: &Arc<Self>, dispatcher: &mut crate::dispatch::Dispatcher) {
        dispatcher.add_shared_handler("READY", Box::new(ReadyExtension(self.clone())));
    }
}

struct ReadyExtension(Arc<ReadyMonitor>);

impl ProtocolExtension for ReadyExtension {
    fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome> {
        if !first_line.equal(b"READY") {
            return Err(HarnessError::ProtocolViolation(format!(
                "expected a bare READY line, got {:?}",
                first_line.to_string_lossy()
            )));
        }
        self.0.on_ready_received();
        Ok(ExtOutcome::Done)
    }

    fn line_received(&mut self, _line: Knot) -> HarnessResult<ExtOutcome> {
        unreachable!("READY sessions never continue past on_protocol_start")
    }

    fn raw_received(&mut self, _data: Knot) -> HarnessResult<ExtOutcome> {
        Err(HarnessError::ProtocolViolation("unexpected raw data in a READY session".into()))
    }
}
