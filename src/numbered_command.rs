// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Server/responder side of the numbered-command protocol: buffers
//! everything between "COMMAND n" and "ENDCOMMAND", dispatches the body to a
//! handler selected by its first line's first token, and tracks how many
//! commands are currently outstanding so a caller can drain on shutdown.
//!
//! One [`NumberedCommandReceiver`] is shared for the life of a stream; each
//! "COMMAND n" cycle gets its own [`CommandSession`], produced via
//! [`NumberedCommandReceiver::extension_factory`] for registration under the
//! dispatcher's "COMMAND" token.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::dispatch::{ExtOutcome, ExtensionFactory, ProtocolExtension};
use crate::error::{HarnessError, HarnessResult};
use crate::knot::Knot;
use crate::write_queue::{StreamingWriter, WriteQueue};

#[derive(Clone, Debug)]
pub enum BodyItem {
    Line(Knot),
    Raw(Knot),
}

/// The ordered sequence of lines and raw blocks between "COMMAND n" and
/// "ENDCOMMAND".
#[derive(Clone, Debug, Default)]
pub struct Body(pub Vec<BodyItem>);

impl Body {
    pub fn first_line(&self) -> Option<&Knot> {
        self.0.iter().find_map(|item| match item {
            BodyItem::Line(k) => Some(k),
            BodyItem::Raw(_) => None,
        })
    }

    /// Re-serializes the body into the wire framing it was parsed from:
    /// LF-terminated lines, raw blocks wrapped in RAW/count/ENDRAW. Used by
    /// handlers (e.g. RUNSCRIPT) that forward a body on rather than
    /// interpreting it directly.
    pub fn to_knot(&self) -> Knot {
        let mut out = Knot::new();
        for item in &self.0 {
            match item {
                BodyItem::Line(line) => {
                    out.append(line);
                    out.append_owned(b"\n".to_vec());
                }
                BodyItem::Raw(data) => {
                    out.append_owned(b"RAW\n".to_vec());
                    out.append_owned(format!("{}\n", data.size()).into_bytes());
                    out.append(data);
                    out.append_owned(b"\nENDRAW\n".to_vec());
                }
            }
        }
        out
    }
}

/// Tracks how many dispatched commands have not yet called
/// [`CommandContext::done`].
pub struct PendingCommands {
    count: Mutex<usize>,
    cond: Condvar,
}

impl PendingCommands {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingCommands {
            count: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }

    pub fn wait_for_all(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }
}

/// Handed to a [`NumberedCommandHandler`] before `execute` runs. The last
/// thing a handler does is consume this via [`CommandContext::done`].
pub struct CommandContext {
    command_number: u64,
    write_queue: Arc<WriteQueue>,
    pending: Arc<PendingCommands>,
}

impl CommandContext {
    pub fn command_number(&self) -> u64 {
        self.command_number
    }

    /// Atomically emits "RESULTS n\n" + `data` + "ENDRESULTS\n".
    pub fn write_results(&self, data: Knot) {
        let mut out = Knot::from(format!("RESULTS {}\n", self.command_number));
        out.append(&data);
        out.append_owned(b"ENDRESULTS\n".to_vec());
        self.send(out);
    }

    /// Reserves a streaming session on the write queue and emits the
    /// "RESULTS n\n" prefix immediately; the caller writes the body in
    /// chunks and finishes with [`ResultsStreamingWriter::done`].
    pub fn get_streaming_writer(&self) -> ResultsStreamingWriter {
        let writer = self.write_queue.get_streaming_writer();
        writer.write(Knot::from(format!("RESULTS {}\n", self.command_number)));
        ResultsStreamingWriter {
            writer,
            command_number: self.command_number,
        }
    }

    /// Emits "EVENTMSG\n<n> <event_id>[ <info>]\n" outside of any active
    /// streaming session.
    pub fn write_event(&self, event_id: u32, info: Option<&str>) {
        self.send(Knot::from(event_message(self.command_number, event_id, info)));
    }

    fn send(&self, knot: Knot) {
        if !self.write_queue.write(knot.clone()) {
            self.write_queue.write_with_block(knot);
        }
    }

    /// The last call a handler makes: marks the command no longer pending.
    pub fn done(self) {
        self.pending.decrement();
    }
}

fn event_message(command_number: u64, event_id: u32, info: Option<&str>) -> String {
    match info {
        Some(info) => format!("EVENTMSG\n{} {} {}\n", command_number, event_id, info),
        None => format!("EVENTMSG\n{} {}\n", command_number, event_id),
    }
}

/// A reserved atomic group for streaming a RESULTS body.
pub struct ResultsStreamingWriter {
    writer: StreamingWriter,
    command_number: u64,
}

impl ResultsStreamingWriter {
    pub fn write(&self, data: Knot) {
        self.writer.write(data);
    }

    pub fn write_event(&self, event_id: u32, info: Option<&str>) {
        self.writer
            .write(Knot::from(event_message(self.command_number, event_id, info)));
    }

    pub fn done(self) {
        self.writer.write(Knot::from("ENDRESULTS\n"));
        self.writer.done();
    }
}

/// Implemented by whatever handles one specific command (by trigger token).
/// `execute` should return promptly — real work is expected to continue on
/// another thread (e.g. a [`crate::worker_pool::WorkerPool`]) and call
/// `ctx.done()` once results have been written.
pub trait NumberedCommandHandler: Send {
    fn execute(&mut self, ctx: CommandContext, body: Body);
}

pub type CommandHandlerFactory = Box<dyn Fn() -> Box<dyn NumberedCommandHandler> + Send + Sync>;

/// Owns the handler map and the shared pending-command counter for one
/// stream's numbered-command traffic. Register it under the dispatcher's
/// "COMMAND" token via [`NumberedCommandReceiver::extension_factory`].
pub struct NumberedCommandReceiver {
    handlers: Arc<HashMap<String, CommandHandlerFactory>>,
    write_queue: Arc<WriteQueue>,
    pending: Arc<PendingCommands>,
}

impl NumberedCommandReceiver {
    pub fn new(write_queue: Arc<WriteQueue>, handlers: HashMap<String, CommandHandlerFactory>) -> Self {
        NumberedCommandReceiver {
            handlers: Arc::new(handlers),
            write_queue,
            pending: PendingCommands::new(),
        }
    }

    pub fn num_pending_commands(&self) -> usize {
        self.pending.count()
    }

    pub fn wait_for_all_commands(&self) {
        self.pending.wait_for_all();
    }

    pub fn extension_factory(&self) -> ExtensionFactory {
        let handlers = self.handlers.clone();
        let write_queue = self.write_queue.clone();
        let pending = self.pending.clone();
        Box::new(move || {
            Box::new(CommandSession {
                handlers: handlers.clone(),
                write_queue: write_queue.clone(),
                pending: pending.clone(),
                command_number: 0,
                body: Vec::new(),
            }) as Box<dyn ProtocolExtension + Send>
        })
    }
}

struct CommandSession {
    handlers: Arc<HashMap<String, CommandHandlerFactory>>,
    write_queue: Arc<WriteQueue>,
    pending: Arc<PendingCommands>,
    command_number: u64,
    body: Vec<BodyItem>,
}

impl CommandSession {
    fn dispatch(&mut self) -> HarnessResult<()> {
        let body = Body(std::mem::take(&mut self.body));
        let first_token = body
            .first_line()
            .map(|l| l.to_string_lossy())
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .ok_or_else(|| HarnessError::ProtocolViolation("empty command body".into()))?;

        let factory = self.handlers.get(&first_token).ok_or_else(|| {
            HarnessError::ProtocolViolation(format!("no command handler for token {:?}", first_token))
        })?;

        let mut handler = factory();
        self.pending.increment();
        let ctx = CommandContext {
            command_number: self.command_number,
            write_queue: self.write_queue.clone(),
            pending: self.pending.clone(),
        };
        handler.execute(ctx, body);
        Ok(())
    }
}

impl ProtocolExtension for CommandSession {
    fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome> {
        let text = first_line.to_string_lossy();
        let mut parts = text.split_whitespace();
        match parts.next() {
            Some("COMMAND") => {}
            _ => return Err(HarnessError::ProtocolViolation(format!("malformed command header {:?}", text))),
        }
        let number: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HarnessError::ProtocolViolation(format!("malformed command number in {:?}", text)))?;
        self.command_number = number;
        Ok(ExtOutcome::Continue)
    }

    fn line_received(&mut self, line: Knot) -> HarnessResult<ExtOutcome> {
        if line.equal(b"ENDCOMMAND") {
            self.dispatch()?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::parser::ParseHandler;

    struct Echo;
    impl NumberedCommandHandler for Echo {
        fn execute(&mut self, ctx: CommandContext, body: Body) {
            let reply = body.first_line().cloned().unwrap_or_else(Knot::new);
            ctx.write_results(reply);
            ctx.done();
        }
    }

    #[test]
    fn dispatches_and_writes_results_with_matching_number() {
        let wq = WriteQueue::new(8192);
        let mut handlers: HashMap<String, CommandHandlerFactory> = HashMap::new();
        handlers.insert("ECHO".into(), Box::new(|| Box::new(Echo) as Box<dyn NumberedCommandHandler>));
        let receiver = NumberedCommandReceiver::new(wq.clone(), handlers);

        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler_factory("COMMAND", receiver.extension_factory());

        dispatcher.line_received(Knot::from("COMMAND 7")).unwrap();
        dispatcher.line_received(Knot::from("ECHO payload")).unwrap();
        dispatcher.line_received(Knot::from("ENDCOMMAND")).unwrap();

        assert_eq!(receiver.num_pending_commands(), 0);

        let mut out = Vec::new();
        loop {
            if wq.drain_once(&mut out).unwrap() {
                break;
            }
        }
        assert_eq!(out, b"RESULTS 7\nECHO payload\nENDRESULTS\n");
    }

    #[test]
    fn unknown_command_token_is_protocol_violation() {
        let wq = WriteQueue::new(8192);
        let handlers: HashMap<String, CommandHandlerFactory> = HashMap::new();
        let receiver = NumberedCommandReceiver::new(wq, handlers);
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler_factory("COMMAND", receiver.extension_factory());

        dispatcher.line_received(Knot::from("COMMAND 1")).unwrap();
        dispatcher.line_received(Knot::from("BOGUS")).unwrap();
        let err = dispatcher.line_received(Knot::from("ENDCOMMAND")).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }

    #[test]
    fn streaming_writer_wraps_results_and_endresults() {
        let wq = WriteQueue::new(8192);
        let pending = PendingCommands::new();
        let ctx = CommandContext {
            command_number: 3,
            write_queue: wq.clone(),
            pending,
        };
        let writer = ctx.get_streaming_writer();
        writer.write(Knot::from("chunk1"));
        writer.write(Knot::from("chunk2"));
        writer.done();

        let mut out = Vec::new();
        loop {
            if wq.drain_once(&mut out).unwrap() {
                break;
            }
        }
        assert_eq!(out, b"RESULTS 3\nchunk1chunk2ENDRESULTS\n");
    }
}
