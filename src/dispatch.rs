// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Sub-protocol dispatch by first-token. A [`Dispatcher`] is itself a
//! [`ParseHandler`]: in LINE mode, it reads the first whitespace-delimited
//! token of a line to pick an extension, then routes every subsequent
//! line/raw call to that extension until the extension reports `Done`.
//! Extensions nest: a dispatcher can itself be registered as the extension
//! under some other dispatcher's token.
//!
//! The original carried a `Done()` callback the handler invoked whenever it
//! was ready to hand control back; every call site in the source does this
//! synchronously from inside a line/raw callback, so here it collapses into
//! a plain return value.

use std::collections::HashMap;

use crate::error::{HarnessError, HarnessResult};
use crate::knot::Knot;
use crate::parser::ParseHandler;
use crate::write_queue::WriteQueue;
use std::sync::Arc;

/// Whether an extension wants to keep receiving lines/raw blocks for the
/// current session, or is handing control back to its parent dispatcher.
#[derive(PartialEq, Eq, Debug)]
pub enum ExtOutcome {
    Continue,
    Done,
}

/// A pluggable sub-protocol handler, dispatched by the first token of the
/// line that started its session.
pub trait ProtocolExtension {
    fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome>;
    fn line_received(&mut self, line: Knot) -> HarnessResult<ExtOutcome>;
    fn raw_received(&mut self, data: Knot) -> HarnessResult<ExtOutcome>;
}

/// Produces a fresh, per-session extension instance. Used for stateful
/// extensions (e.g. one `NumberedCommandHandler` per command); stateless
/// extensions are registered directly and reused across sessions.
pub type ExtensionFactory = Box<dyn Fn() -> Box<dyn ProtocolExtension + Send> + Send + Sync>;

enum Registration {
    Shared(Box<dyn ProtocolExtension + Send>),
    Factory(ExtensionFactory),
}

/// An in-progress extension session: its instance plus, for shared
/// extensions, the token to return it under once the session ends.
enum Session {
    Shared(String, Box<dyn ProtocolExtension + Send>),
    OneShot(Box<dyn ProtocolExtension + Send>),
}

impl Session {
    fn ext_mut(&mut self) -> &mut (dyn ProtocolExtension + Send) {
        match self {
            Session::Shared(_, ext) => ext.as_mut(),
            Session::OneShot(ext) => ext.as_mut(),
        }
    }
}

/// Dispatches lines by their first token to registered extensions. Handler
/// registration is only safe before the dispatcher starts receiving data;
/// the map is treated as immutable once the event loop is running.
pub struct Dispatcher {
    handlers: HashMap<String, Registration>,
    active: Option<Session>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            handlers: HashMap::new(),
            active: None,
        }
    }

    pub fn add_shared_handler(&mut self, token: impl Into<String>, ext: Box<dyn ProtocolExtension + Send>) {
        self.handlers.insert(token.into(), Registration::Shared(ext));
    }

    pub fn add_handler_factory(&mut self, token: impl Into<String>, factory: ExtensionFactory) {
        self.handlers.insert(token.into(), Registration::Factory(factory));
    }

    fn first_token(line: &Knot) -> String {
        let text = line.to_string_lossy();
        text.split_whitespace().next().unwrap_or("").to_string()
    }

    /// Returns a shared extension to the handler map once its session ends;
    /// no-op for one-shot (factory-produced) sessions.
    fn retire(&mut self, session: Session) {
        if let Session::Shared(token, ext) = session {
            self.handlers.insert(token, Registration::Shared(ext));
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl ParseHandler for Dispatcher {
    fn line_received(&mut self, line: Knot) -> HarnessResult<()> {
        if let Some(mut session) = self.active.take() {
            let outcome = session.ext_mut().line_received(line)?;
            if outcome == ExtOutcome::Continue {
                self.active = Some(session);
            } else {
                self.retire(session);
            }
            return Ok(());
        }

        let token = Self::first_token(&line);
        let registration = self.handlers.remove(&token).ok_or_else(|| {
            HarnessError::ProtocolViolation(format!("no handler registered for token {:?}", token))
        })?;

        let mut session = match registration {
            Registration::Shared(ext) => Session::Shared(token, ext),
            Registration::Factory(factory) => {
                let ext = factory();
                self.handlers.insert(token, Registration::Factory(factory));
                Session::OneShot(ext)
            }
        };

        let outcome = session.ext_mut().on_protocol_start(&line)?;
        if outcome == ExtOutcome::Continue {
            self.active = Some(session);
        } else {
            self.retire(session);
        }
        Ok(())
    }

    fn raw_received(&mut self, data: Knot) -> HarnessResult<()> {
        match self.active.take() {
            Some(mut session) => {
                let outcome = session.ext_mut().raw_received(data)?;
                if outcome == ExtOutcome::Continue {
                    self.active = Some(session);
                } else {
                    self.retire(session);
                }
                Ok(())
            }
            None => Err(HarnessError::ProtocolViolation(
                "raw data received outside an active extension".into(),
            )),
        }
    }
}

/// Lets a `Dispatcher` be registered as a child extension under another
/// dispatcher's token, so sub-protocols can nest. The child session lasts as
/// long as this dispatcher has an active extension of its own; once it goes
/// idle again, control returns to the parent.
impl ProtocolExtension for Dispatcher {
    fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome> {
        ParseHandler::line_received(self, first_line.clone())?;
        Ok(if self.active.is_some() { ExtOutcome::Continue } else { ExtOutcome::Done })
    }

    fn line_received(&mut self, line: Knot) -> HarnessResult<ExtOutcome> {
        ParseHandler::line_received(self, line)?;
        Ok(if self.active.is_some() { ExtOutcome::Continue } else { ExtOutcome::Done })
    }

    fn raw_received(&mut self, data: Knot) -> HarnessResult<ExtOutcome> {
        ParseHandler::raw_received(self, data)?;
        Ok(if self.active.is_some() { ExtOutcome::Continue } else { ExtOutcome::Done })
    }
}

/// The outermost dispatcher on the SUT side. Emits `READY` after
/// construction and after every child extension session completes, using
/// `write_with_block` as a fallback so the token is never dropped on
/// backpressure.
pub struct ReadyHandler {
    dispatcher: Dispatcher,
    write_queue: Arc<WriteQueue>,
}

impl ReadyHandler {
    pub fn new(write_queue: Arc<WriteQueue>) -> Self {
        let handler = ReadyHandler {
            dispatcher: Dispatcher::new(),
            write_queue,
        };
        handler.send_ready();
        handler
    }

    pub fn add_shared_handler(&mut self, token: impl Into<String>, ext: Box<dyn ProtocolExtension + Send>) {
        self.dispatcher.add_shared_handler(token, ext);
    }

    pub fn add_handler_factory(&mut self, token: impl Into<String>, factory: ExtensionFactory) {
        self.dispatcher.add_handler_factory(token, factory);
    }

    fn send_ready(&self) {
        let ready = Knot::from("READY\n");
        if !self.write_queue.write(ready.clone()) {
            self.write_queue.write_with_block(ready);
        }
    }
}

impl ParseHandler for ReadyHandler {
    fn line_received(&mut self, line: Knot) -> HarnessResult<()> {
        let was_idle = self.dispatcher.active.is_none();
        self.dispatcher.line_received(line)?;
        let became_idle = self.dispatcher.active.is_none();
        if was_idle && !became_idle {
            // A new session just started; nothing to announce yet.
        } else if !was_idle && became_idle {
            self.send_ready();
        }
        Ok(())
    }

    fn raw_received(&mut self, data: Knot) -> HarnessResult<()> {
        let was_active = self.dispatcher.active.is_some();
        self.dispatcher.raw_received(data)?;
        if was_active && self.dispatcher.active.is_none() {
            self.send_ready();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        write_queue: Arc<WriteQueue>,
    }

    impl ProtocolExtension for Echo {
        fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome> {
            let mut out = first_line.to_vec();
            out.push(b'\n');
            self.write_queue.write(Knot::from_bytes(out));
            Ok(ExtOutcome::Done)
        }
        fn line_received(&mut self, _line: Knot) -> HarnessResult<ExtOutcome> {
            Ok(ExtOutcome::Done)
        }
        fn raw_received(&mut self, _data: Knot) -> HarnessResult<ExtOutcome> {
            Ok(ExtOutcome::Done)
        }
    }

    #[test]
    fn unknown_token_is_fatal() {
        let mut d = Dispatcher::new();
        let err = d.line_received(Knot::from("BOGUS 1\n")).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }

    #[test]
    fn raw_without_active_extension_is_fatal() {
        let mut d = Dispatcher::new();
        let err = d.raw_received(Knot::from("x")).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }

    #[test]
    fn nested_dispatcher_is_itself_an_extension() {
        let wq = WriteQueue::new(4096);
        let mut inner = Dispatcher::new();
        inner.add_handler_factory(
            "ECHO",
            Box::new({
                let wq = wq.clone();
                move || Box::new(Echo { write_queue: wq.clone() }) as Box<dyn ProtocolExtension + Send>
            }),
        );

        let mut outer = Dispatcher::new();
        outer.add_shared_handler("ECHO", Box::new(inner));
        outer.line_received(Knot::from("ECHO hi")).unwrap();

        let mut out = Vec::new();
        loop {
            if wq.drain_once(&mut out).unwrap() {
                break;
            }
        }
        assert_eq!(out, b"ECHO hi\n");
    }

    #[test]
    fn ready_handler_emits_ready_on_construction_and_after_session() {
        let wq = WriteQueue::new(4096);
        let mut rh = ReadyHandler::new(wq.clone());
        rh.add_handler_factory(
            "ECHO",
            Box::new({
                let wq = wq.clone();
                move || Box::new(Echo { write_queue: wq.clone() }) as Box<dyn ProtocolExtension + Send>
            }),
        );
        rh.line_received(Knot::from("ECHO hi")).unwrap();

        let mut out = Vec::new();
        loop {
            if wq.drain_once(&mut out).unwrap() {
                break;
            }
        }
        assert_eq!(out, b"READY\nECHO hi\nREADY\n");
    }
}
