// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Single-threaded reactor: one thread owns a `mio::Poll` and is the sole
//! reader and writer of every registered descriptor (TCP sockets, SUT pipe
//! ends). Everything else talks to it through [`EventLoopHandle`], whose
//! calls cross to the loop thread over a command channel paired with a
//! `mio::Waker` so the loop never has to poll that channel on a timer.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::{HarnessError, HarnessResult};
use crate::knot::Knot;
use crate::write_queue::WriteQueue;

pub struct EventLoopConfig {
    pub poll_capacity: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        EventLoopConfig { poll_capacity: 1024 }
    }
}

pub type DataCallback = Box<dyn FnMut(Knot) + Send>;
pub type EofCallback = Box<dyn FnMut() + Send>;

const WAKE_TOKEN: Token = Token(0);
const FIRST_STREAM_TOKEN: usize = 1;
const READ_CHUNK: usize = 64 * 1024;

/// The readable/writable end of a descriptor the loop owns. TCP connections
/// are both ends of the same socket; a spawned SUT's stdin/stdout are two
/// independent pipe fds, each wrapped as its own `Transport`.
pub enum Transport {
    Tcp(TcpStream),
    Pipe(File, RawFd),
}

impl Transport {
    pub fn from_raw_fd(fd: RawFd) -> Transport {
        // Safety: callers hand us an fd they own and are giving up ownership
        // of to the event loop (mirrors the contract of `spawn`'s pipe ends).
        let file = unsafe { File::from_raw_fd(fd) };
        Transport::Pipe(file, fd)
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => registry.register(s, token, interest),
            Transport::Pipe(_, fd) => registry.register(&mut SourceFd(fd), token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => registry.reregister(s, token, interest),
            Transport::Pipe(_, fd) => registry.reregister(&mut SourceFd(fd), token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => registry.deregister(s),
            Transport::Pipe(_, fd) => registry.deregister(&mut SourceFd(fd)),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Pipe(f, _) => f.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Pipe(f, _) => f.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Pipe(f, _) => f.flush(),
        }
    }
}

struct StreamEntry {
    transport: Transport,
    on_data: Option<DataCallback>,
    on_eof: Option<EofCallback>,
    write_queue: Option<Arc<WriteQueue>>,
    write_interest: bool,
}

enum Command {
    Register {
        transport: Transport,
        on_data: Option<DataCallback>,
        on_eof: Option<EofCallback>,
        write_queue_max_bytes: Option<usize>,
        reply: crossbeam_channel::Sender<(Token, Option<Arc<WriteQueue>>)>,
    },
    NeedsWrite(Token),
    Deregister(Token),
    Exit,
}

/// A cloneable, thread-safe front door to the loop thread. All of its
/// methods may be called from any thread.
#[derive(Clone)]
pub struct EventLoopHandle {
    commands: crossbeam_channel::Sender<Command>,
    waker: Arc<Waker>,
    finished: crossbeam_channel::Receiver<()>,
}

impl EventLoopHandle {
    fn send(&self, cmd: Command) {
        let _ = self.commands.send(cmd);
        let _ = self.waker.wake();
    }

    /// Registers a descriptor with the loop. `write_queue_max_bytes`, when
    /// `Some`, gives the descriptor its own write queue; its waker callback
    /// notifies this same loop so writable interest is added precisely when
    /// there is something to write.
    pub fn register(
        &self,
        transport: Transport,
        on_data: Option<DataCallback>,
        on_eof: Option<EofCallback>,
        write_queue_max_bytes: Option<usize>,
    ) -> HarnessResult<(Token, Option<Arc<WriteQueue>>)> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(Command::Register {
            transport,
            on_data,
            on_eof,
            write_queue_max_bytes,
            reply: reply_tx,
        });
        reply_rx.recv().map_err(|_| {
            HarnessError::ResourceExhaustion("event loop thread is gone".into())
        })
    }

    pub fn deregister(&self, token: Token) {
        self.send(Command::Deregister(token));
    }

    /// Schedules loop termination without waiting for it.
    pub fn exit_loop(&self) {
        self.send(Command::Exit);
    }

    /// Schedules loop termination and blocks until the loop thread has
    /// drained every write queue and returned from `run`.
    pub fn exit_loop_and_wait(&self) {
        self.send(Command::Exit);
        let _ = self.finished.recv();
    }
}

pub struct EventLoop {
    poll: Poll,
    streams: HashMap<Token, StreamEntry>,
    next_token: usize,
    commands: crossbeam_channel::Receiver<Command>,
    command_sender: crossbeam_channel::Sender<Command>,
    waker: Arc<Waker>,
    finished: crossbeam_channel::Sender<()>,
    exiting: bool,
    poll_capacity: usize,
}

impl EventLoop {
    /// Builds a loop and its handle. The loop itself must be driven by
    /// calling [`EventLoop::run`], typically on a dedicated thread:
    /// `thread::Builder::new().name("event-loop").spawn(move || event_loop.run())`.
    pub fn new(config: EventLoopConfig) -> HarnessResult<(EventLoop, EventLoopHandle)> {
        let poll = Poll::new().map_err(HarnessError::TransientIo)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| HarnessError::ResourceExhaustion(e.to_string()))?;
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (finished_tx, finished_rx) = crossbeam_channel::bounded(1);
        let waker = Arc::new(waker);
        let event_loop = EventLoop {
            poll,
            streams: HashMap::new(),
            next_token: FIRST_STREAM_TOKEN,
            commands: commands_rx,
            command_sender: commands_tx.clone(),
            waker: waker.clone(),
            finished: finished_tx,
            exiting: false,
            poll_capacity: config.poll_capacity,
        };
        let handle = EventLoopHandle {
            commands: commands_tx,
            waker,
            finished: finished_rx,
        };
        Ok((event_loop, handle))
    }

    /// Runs until `exit_loop`/`exit_loop_and_wait` is called and every
    /// write queue has drained. Consumes `self`; intended to be the whole
    /// body of the loop thread.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(self.poll_capacity);
        loop {
            if self.exiting && self.all_write_queues_drained() {
                let _ = self.finished.send(());
                return;
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                crate::logging::fatal(&e);
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.drain_commands();
                    continue;
                }
                self.handle_event(event.token(), event.is_readable(), event.is_writable());
            }
        }
    }

    fn all_write_queues_drained(&self) -> bool {
        self.streams
            .values()
            .all(|e| e.write_queue.as_ref().map_or(true, |q| !q.has_pending()))
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Register {
                    mut transport,
                    on_data,
                    on_eof,
                    write_queue_max_bytes,
                    reply,
                } => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    let write_queue = write_queue_max_bytes.map(|max| {
                        let commands = self.command_sender.clone();
                        let waker = self.waker.clone();
                        WriteQueue::with_waker(
                            max,
                            Arc::new(move || {
                                let _ = commands.send(Command::NeedsWrite(token));
                                let _ = waker.wake();
                            }),
                        )
                    });

                    let mut interest: Option<Interest> = None;
                    if on_data.is_some() || on_eof.is_some() {
                        interest = Some(Interest::READABLE);
                    }
                    let write_interest = write_queue.is_some();
                    if write_interest {
                        interest = Some(interest.map_or(Interest::WRITABLE, |i| i.add(Interest::WRITABLE)));
                    }
                    if let Some(interest) = interest {
                        if let Err(e) = transport.register(self.poll.registry(), token, interest) {
                            crate::logging::fatal(&e);
                        }
                    }

                    self.streams.insert(
                        token,
                        StreamEntry {
                            transport,
                            on_data,
                            on_eof,
                            write_queue: write_queue.clone(),
                            write_interest,
                        },
                    );
                    let _ = reply.send((token, write_queue));
                }
                Command::NeedsWrite(token) => {
                    if let Some(entry) = self.streams.get_mut(&token) {
                        if !entry.write_interest {
                            entry.write_interest = true;
                            let mut interest = Interest::WRITABLE;
                            if entry.on_data.is_some() || entry.on_eof.is_some() {
                                interest = interest.add(Interest::READABLE);
                            }
                            let _ = entry.transport.reregister(self.poll.registry(), token, interest);
                        }
                    }
                }
                Command::Deregister(token) => {
                    self.remove_stream(token);
                }
                Command::Exit => {
                    self.exiting = true;
                }
            }
        }
    }

    fn handle_event(&mut self, token: Token, readable: bool, writable: bool) {
        let mut saw_eof = false;
        let mut fatal_err: Option<io::Error> = None;

        if readable {
            if let Some(entry) = self.streams.get_mut(&token) {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match entry.transport.read(&mut buf) {
                        Ok(0) => {
                            saw_eof = true;
                            break;
                        }
                        Ok(n) => {
                            if let Some(cb) = entry.on_data.as_mut() {
                                cb(Knot::from_bytes(buf[..n].to_vec()));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            fatal_err = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        if writable && fatal_err.is_none() {
            if let Some(entry) = self.streams.get_mut(&token) {
                if let Some(wq) = entry.write_queue.clone() {
                    match wq.drain_once(&mut entry.transport) {
                        Ok(true) => {
                            if entry.write_interest {
                                entry.write_interest = false;
                                let mut interest = None;
                                if entry.on_data.is_some() || entry.on_eof.is_some() {
                                    interest = Some(Interest::READABLE);
                                }
                                match interest {
                                    Some(i) => {
                                        let _ = entry.transport.reregister(self.poll.registry(), token, i);
                                    }
                                    None => {
                                        let _ = entry.transport.deregister(self.poll.registry());
                                    }
                                }
                            }
                        }
                        Ok(false) => {}
                        Err(HarnessError::TransientIo(e)) => fatal_err = Some(e),
                        Err(_) => {}
                    }
                }
            }
        }

        if let Some(e) = fatal_err {
            crate::logging::fatal(&e);
        }

        if saw_eof {
            if let Some(entry) = self.streams.get_mut(&token) {
                if let Some(cb) = entry.on_eof.as_mut() {
                    cb();
                }
            }
            self.remove_stream(token);
        }
    }

    fn remove_stream(&mut self, token: Token) {
        if let Some(mut entry) = self.streams.remove(&token) {
            let _ = entry.transport.deregister(self.poll.registry());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn delivers_chunks_and_then_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let (event_loop, handle) = EventLoop::new(EventLoopConfig::default()).unwrap();
        let join = std::thread::spawn(move || event_loop.run());

        let (lines_tx, lines_rx) = mpsc::channel();
        let (eof_tx, eof_rx) = mpsc::channel();
        let on_data: DataCallback = Box::new(move |k| {
            let _ = lines_tx.send(k.to_vec());
        });
        let on_eof: EofCallback = Box::new(move || {
            let _ = eof_tx.send(());
        });
        handle
            .register(Transport::from_raw_fd(b.into_raw_fd()), Some(on_data), Some(on_eof), None)
            .unwrap();

        use std::io::Write as _;
        let mut a = a;
        a.write_all(b"hello\n").unwrap();
        let got = lines_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, b"hello\n");

        drop(a);
        eof_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        handle.exit_loop_and_wait();
        join.join().unwrap();
    }

    #[test]
    fn write_queue_drains_to_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let (event_loop, handle) = EventLoop::new(EventLoopConfig::default()).unwrap();
        let join = std::thread::spawn(move || event_loop.run());

        let (_, wq) = handle
            .register(Transport::from_raw_fd(b.into_raw_fd()), None, None, Some(4096))
            .unwrap();
        let wq = wq.unwrap();
        assert!(wq.write(Knot::from("payload\n")));

        let mut buf = [0u8; 64];
        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut a = a;
        while received.is_empty() && std::time::Instant::now() < deadline {
            match std::io::Read::read(&mut a, &mut buf) {
                Ok(0) | Err(_) => std::thread::sleep(Duration::from_millis(10)),
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(received, b"payload\n");

        handle.exit_loop_and_wait();
        join.join().unwrap();
    }
}
