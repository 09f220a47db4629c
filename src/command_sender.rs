// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Client/originator side of the numbered-command protocol, paired with
//! [`crate::numbered_command`] on the receiving end. Each call to
//! [`NumberedCommandSender::send_command`] gets its own monotonically
//! increasing number, written as a single atomic `Knot` so the command frame
//! can never be split by a concurrent write. The matching "RESULTS n" reply
//! is correlated back to the call by that number through an extension
//! registered on the caller's own inbound dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dispatch::{ExtOutcome, ExtensionFactory, ProtocolExtension};
use crate::error::{HarnessError, HarnessResult};
use crate::future::Future;
use crate::knot::Knot;
use crate::numbered_command::{Body, BodyItem};
use crate::ready_monitor::ReadyMonitor;
use crate::write_queue::WriteQueue;

struct PendingRequest {
    start: Arc<Future<()>>,
    done: Arc<Future<Knot>>,
}

/// Issues numbered commands and resolves their results. One instance per
/// stream; register `extension_factory()` under the peer's "RESULTS" token
/// on the same stream's inbound dispatcher.
///
/// An SUT connection additionally only accepts one in-flight command at a
/// time, signalled by "READY"; give such a sender a [`ReadyMonitor`] via
/// [`NumberedCommandSender::with_ready_monitor`] so sends are throttled
/// accordingly. Harness-to-harness peers have no such throttle and use
/// [`NumberedCommandSender::new`] directly.
pub struct NumberedCommandSender {
    write_queue: Arc<WriteQueue>,
    ready_monitor: Option<Arc<ReadyMonitor>>,
    next_number: Mutex<u64>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

impl NumberedCommandSender {
    pub fn new(write_queue: Arc<WriteQueue>) -> Self {
        NumberedCommandSender {
            write_queue,
            ready_monitor: None,
            next_number: Mutex::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_ready_monitor(write_queue: Arc<WriteQueue>, ready_monitor: Arc<ReadyMonitor>) -> Self {
        NumberedCommandSender {
            write_queue,
            ready_monitor: Some(ready_monitor),
            next_number: Mutex::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Emits "COMMAND n\n" + `body` + "ENDCOMMAND\n" as one atomic write.
    /// Returns a start future, fired when "RESULTS n" first arrives, and a
    /// done future, fired with the accumulated results body once
    /// "ENDRESULTS" arrives.
    pub fn send_command(&self, body: Knot) -> (Arc<Future<()>>, Arc<Future<Knot>>) {
        let number = {
            let mut next = self.next_number.lock().unwrap();
            let n = *next;
            *next += 1;
            n
        };

        let start = Arc::new(Future::new());
        let done = Arc::new(Future::new());
        self.pending.lock().unwrap().insert(
            number,
            PendingRequest {
                start: start.clone(),
                done: done.clone(),
            },
        );

        let mut frame = Knot::from(format!("COMMAND {}\n", number));
        frame.append(&body);
        frame.append_owned(b"ENDCOMMAND\n".to_vec());
        match &self.ready_monitor {
            Some(ready) => ready.block_until_ready_and_send(frame),
            None => {
                if !self.write_queue.write(frame.clone()) {
                    self.write_queue.write_with_block(frame);
                }
            }
        }

        (start, done)
    }

    pub fn num_pending_commands(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Produces a fresh [`ResultsSession`] per "RESULTS n" occurrence;
    /// register under the "RESULTS" token of the dispatcher reading this
    /// stream's inbound data.
    pub fn extension_factory(&self) -> ExtensionFactory {
        let pending = self.pending.clone();
        Box::new(move || {
            Box::new(ResultsSession {
                pending: pending.clone(),
                request: None,
                body: Vec::new(),
            }) as Box<dyn ProtocolExtension + Send>
        })
    }
}

struct ResultsSession {
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    request: Option<PendingRequest>,
    body: Vec<BodyItem>,
}

impl ProtocolExtension for ResultsSession {
    fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome> {
        let text = first_line.to_string_lossy();
        let mut parts = text.split_whitespace();
        match parts.next() {
            Some("RESULTS") => {}
            _ => return Err(HarnessError::ProtocolViolation(format!("malformed results header {:?}", text))),
        }
        let number: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HarnessError::ProtocolViolation(format!("malformed results number in {:?}", text)))?;

        let request = self
            .pending
            .lock()
            .unwrap()
            .remove(&number)
            .ok_or_else(|| HarnessError::ProtocolViolation(format!("unexpected RESULTS {} with no pending command", number)))?;
        request.start.fire(());
        self.request = Some(request);
        Ok(ExtOutcome::Continue)
    }

    fn line_received(&mut self, line: Knot) -> HarnessResult<ExtOutcome> {
        if line.equal(b"ENDRESULTS") {
            let request = self
                .request
                .take()
                .expect("ENDRESULTS received without a started results session");
            let body = Body(std::mem::take(&mut self.body));
            request.done.fire(body.to_knot());
            Ok(ExtOutcome::Done)
        } else {
            self.body.push(BodyItem::Line(line));
            Ok(ExtOutcome::Continue)
        }
    }

    fn raw_received(&mut self, data: Knot) -> HarnessResult<ExtOutcome> {
        self.body.push(BodyItem::Raw(data));
        Ok(ExtOutcome::Continue)
    }
}
