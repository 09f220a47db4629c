// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Master side of the harness network topology (spec.md §4.9). Listens for
//! slave connections, hands each off to the shared event loop with a
//! numbered-command stack identical in shape to the SUT stack, and
//! identifies it by issuing a HARNESS_INFO command as soon as it's
//! registered.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::command_sender::NumberedCommandSender;
use crate::dispatch::Dispatcher;
use crate::error::{HarnessError, HarnessResult};
use crate::event_loop::{EventLoopHandle, Transport};
use crate::knot::Knot;
use crate::net::event_message::EventMessageSink;

pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    pub write_queue_max_bytes: usize,
}

/// One identified slave connection. `sender` is what scripts use to issue
/// RUNSCRIPT (or any other numbered command) to that slave.
pub struct SlaveConnection {
    pub id: String,
    pub sut_count: usize,
    pub sender: Arc<NumberedCommandSender>,
}

struct State {
    connections: Vec<Arc<SlaveConnection>>,
}

/// Owns the accept loop and the registry of identified slave connections.
/// A background thread blocks on `TcpListener::accept()` — the event loop's
/// `Transport` enum only models already-connected streams, so the listener
/// itself stays off it; each accepted stream is handed to the loop via
/// `stack::attach_duplex_lazy` immediately after converting it to a
/// non-blocking `mio::net::TcpStream`.
pub struct Master {
    state: Mutex<State>,
    cond: Condvar,
}

impl Master {
    pub fn listen(config: MasterConfig, event_loop: EventLoopHandle) -> HarnessResult<Arc<Self>> {
        let listener = TcpListener::bind(config.listen_addr).map_err(HarnessError::TransientIo)?;
        let master = Arc::new(Master {
            state: Mutex::new(State { connections: Vec::new() }),
            cond: Condvar::new(),
        });

        let accept_master = master.clone();
        let write_queue_max_bytes = config.write_queue_max_bytes;
        thread::Builder::new()
            .name("master-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(s) => s,
                        Err(e) => crate::logging::fatal(&e),
                    };
                    let event_loop = event_loop.clone();
                    let master = accept_master.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &event_loop, &master, write_queue_max_bytes) {
                            crate::logging::fatal(&e);
                        }
                    });
                }
            })
            .expect("failed to spawn master accept thread");

        Ok(master)
    }

    /// Blocks the calling thread until at least `n` slaves have completed
    /// the HARNESS_INFO handshake, then returns all of them.
    pub fn block_until_num_connections(&self, n: usize) -> Vec<Arc<SlaveConnection>> {
        let mut state = self.state.lock().unwrap();
        while state.connections.len() < n {
            state = self.cond.wait(state).unwrap();
        }
        state.connections.clone()
    }

    pub fn get_protocol_stack(&self, id: &str) -> Option<Arc<SlaveConnection>> {
        self.state.lock().unwrap().connections.iter().find(|c| c.id == id).cloned()
    }

    fn add_connection(&self, conn: Arc<SlaveConnection>) {
        let mut state = self.state.lock().unwrap();
        state.connections.push(conn);
        self.cond.notify_all();
    }
}

fn handle_connection(
    stream: std::net::TcpStream,
    event_loop: &EventLoopHandle,
    master: &Arc<Master>,
    write_queue_max_bytes: usize,
) -> HarnessResult<()> {
    stream.set_nonblocking(true).map_err(HarnessError::TransientIo)?;
    let mio_stream = mio::net::TcpStream::from_std(stream);

    let sender_cell: Arc<Mutex<Option<Arc<NumberedCommandSender>>>> = Arc::new(Mutex::new(None));
    let sender_cell_build = sender_cell.clone();
    let on_eof = Box::new(|| crate::logging::fatal(&"slave connection closed unexpectedly"));

    crate::stack::attach_duplex_lazy(
        event_loop,
        Transport::Tcp(mio_stream),
        write_queue_max_bytes,
        move |write_queue| {
            let sender = Arc::new(NumberedCommandSender::new(write_queue));
            let mut dispatcher = Dispatcher::new();
            dispatcher.add_handler_factory("RESULTS", sender.extension_factory());
            dispatcher.add_shared_handler("EVENTMSG", Box::new(EventMessageSink));
            *sender_cell_build.lock().unwrap() = Some(sender);
            dispatcher
        },
        on_eof,
    )?;

    let sender = sender_cell
        .lock()
        .unwrap()
        .clone()
        .expect("attach_duplex_lazy always invokes the handler builder before returning");

    let (_, done) = sender.send_command(Knot::from("HARNESS_INFO\n"));
    let body = done.value();
    let text = body.to_string_lossy();
    let mut parts = text.split_whitespace();
    let id = parts
        .next()
        .ok_or_else(|| HarnessError::ProtocolViolation("empty HARNESS_INFO response".into()))?
        .to_string();
    let sut_count: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HarnessError::ProtocolViolation(format!("malformed HARNESS_INFO response {:?}", text)))?;

    master.add_connection(Arc::new(SlaveConnection { id, sut_count, sender }));
    Ok(())
}
