// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Glues a [`Parser`] to a [`ParseHandler`] and registers the pair with an
//! [`EventLoop`](crate::event_loop::EventLoop) as a single descriptor's
//! `on_data` callback. Used identically for TCP peers (one transport serves
//! both directions) and for a spawned SUT (stdout feeds the parser, stdin
//! carries the write queue, on two independent pipe transports).

use std::sync::{Arc, Mutex};

use mio::Token;

use crate::error::HarnessResult;
use crate::event_loop::{EofCallback, EventLoopHandle, Transport};
use crate::parser::{ParseHandler, Parser};
use crate::write_queue::WriteQueue;

/// Registers a bidirectional transport (typically a TCP stream): inbound
/// bytes drive `handler` through a fresh `Parser`, outbound bytes flow
/// through the returned write queue.
pub fn attach_duplex<H>(
    event_loop: &EventLoopHandle,
    transport: Transport,
    write_queue_max_bytes: usize,
    handler: H,
    on_eof: EofCallback,
) -> HarnessResult<(Token, Arc<WriteQueue>)>
where
    H: ParseHandler + Send + 'static,
{
    let mut parser = Parser::new();
    let mut handler = handler;
    let on_data = Box::new(move |chunk| {
        if let Err(e) = parser.data_received(chunk, &mut handler) {
            crate::logging::fatal(&e);
        }
    });
    let (token, write_queue) =
        event_loop.register(transport, Some(on_data), Some(on_eof), Some(write_queue_max_bytes))?;
    Ok((token, write_queue.expect("write queue requested but loop returned none")))
}

/// Registers a read-only transport (e.g. a spawned SUT's stdout): inbound
/// bytes drive `handler`, no write queue is created.
pub fn attach_read_only<H>(
    event_loop: &EventLoopHandle,
    transport: Transport,
    handler: H,
    on_eof: EofCallback,
) -> HarnessResult<Token>
where
    H: ParseHandler + Send + 'static,
{
    let mut parser = Parser::new();
    let mut handler = handler;
    let on_data = Box::new(move |chunk| {
        if let Err(e) = parser.data_received(chunk, &mut handler) {
            crate::logging::fatal(&e);
        }
    });
    let (token, _) = event_loop.register(transport, Some(on_data), Some(on_eof), None)?;
    Ok(token)
}

/// Like [`attach_duplex`], but for the common case where the handler itself
/// needs the stream's own write queue (e.g. a numbered-command sender whose
/// "RESULTS" extension must be wired into the dispatcher it's registered
/// under). `build_handler` runs once, right after registration, with the
/// freshly minted write queue; any bytes arriving in the narrow window
/// before that are a protocol violation for every peer in this system,
/// since none speaks before being spoken to.
pub fn attach_duplex_lazy<F, H>(
    event_loop: &EventLoopHandle,
    transport: Transport,
    write_queue_max_bytes: usize,
    build_handler: F,
    on_eof: EofCallback,
) -> HarnessResult<(Token, Arc<WriteQueue>)>
where
    F: FnOnce(Arc<WriteQueue>) -> H,
    H: ParseHandler + Send + 'static,
{
    let mut parser = Parser::new();
    let handler_cell: Arc<Mutex<Option<H>>> = Arc::new(Mutex::new(None));
    let on_data_cell = handler_cell.clone();
    let on_data = Box::new(move |chunk| {
        let mut guard = on_data_cell.lock().unwrap();
        let handler = guard
            .as_mut()
            .expect("data arrived on a duplex stream before its handler was attached");
        if let Err(e) = parser.data_received(chunk, handler) {
            crate::logging::fatal(&e);
        }
    });
    let (token, write_queue) =
        event_loop.register(transport, Some(on_data), Some(on_eof), Some(write_queue_max_bytes))?;
    let write_queue = write_queue.expect("write queue requested but loop returned none");
    *handler_cell.lock().unwrap() = Some(build_handler(write_queue.clone()));
    Ok((token, write_queue))
}

/// Registers a write-only transport (e.g. a spawned SUT's stdin): no data
/// is read from it, only written through the returned write queue.
pub fn register_write_only(
    event_loop: &EventLoopHandle,
    transport: Transport,
    write_queue_max_bytes: usize,
) -> HarnessResult<(Token, Arc<WriteQueue>)> {
    let (token, write_queue) = event_loop.register(transport, None, None, Some(write_queue_max_bytes))?;
    Ok((token, write_queue.expect("write queue requested but loop returned none")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::knot::Knot;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::dispatch::{ExtOutcome, ProtocolExtension};
    use crate::error::HarnessResult as Result_;

    struct Echo(mpsc::Sender<String>);
    impl ProtocolExtension for Echo {
        fn on_protocol_start(&mut self, first_line: &Knot) -> Result_<ExtOutcome> {
            let _ = self.0.send(first_line.to_string_lossy());
            Ok(ExtOutcome::Done)
        }
        fn line_received(&mut self, _line: Knot) -> Result_<ExtOutcome> {
            Ok(ExtOutcome::Done)
        }
        fn raw_received(&mut self, _data: Knot) -> Result_<ExtOutcome> {
            Ok(ExtOutcome::Done)
        }
    }

    #[test]
    fn attach_duplex_drives_handler_from_socket_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let (event_loop, handle) = crate::event_loop::EventLoop::new(Default::default()).unwrap();
        let join = std::thread::spawn(move || event_loop.run());

        let (tx, rx) = mpsc::channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler_factory("HELLO", {
            let tx = tx.clone();
            Box::new(move || Box::new(Echo(tx.clone())) as Box<dyn ProtocolExtension + Send>)
        });

        attach_duplex(
            &handle,
            Transport::from_raw_fd(b.into_raw_fd()),
            4096,
            dispatcher,
            Box::new(|| {}),
        )
        .unwrap();

        let mut a = a;
        std::io::Write::write_all(&mut a, b"HELLO world\n").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, "HELLO world");

        handle.exit_loop_and_wait();
        join.join().unwrap();
    }
}
