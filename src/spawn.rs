// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Spawns the system under test as a child process and wires its stdio into
//! the event loop: stdout feeds a [`Parser`]/[`Dispatcher`] pair reading
//! READY/RESULTS/EVENTMSG, stdin carries a write queue gated by a
//! [`ReadyMonitor`]. A dedicated reaper thread owns the `Child` and blocks on
//! `wait()`, reporting the exit to a [`SutRunningMonitor`], which treats an
//! unexpected exit as fatal and a post-shutdown exit as the expected case.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use mio::Token;

use crate::command_sender::NumberedCommandSender;
use crate::dispatch::Dispatcher;
use crate::error::HarnessResult;
use crate::event_loop::{EventLoopHandle, Transport};
use crate::knot::Knot;
use crate::net::EventMessageSink;
use crate::parser::Parser;
use crate::ready_monitor::ReadyMonitor;

/// Tracks whether the SUT process is still alive so an abrupt exit can be
/// distinguished from a graceful one driven by a SHUTDOWN command.
pub struct SutRunningMonitor {
    running: Mutex<bool>,
    cond: Condvar,
    shutdown_expected: Mutex<bool>,
}

impl SutRunningMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(SutRunningMonitor {
            running: Mutex::new(true),
            cond: Condvar::new(),
            shutdown_expected: Mutex::new(false),
        })
    }

    pub fn set_shutdown_expected(&self, value: bool) {
        *self.shutdown_expected.lock().unwrap() = value;
    }

    /// Called by the reaper thread once the child has exited. Fatal unless
    /// a shutdown was already expected.
    fn sut_exited(&self) {
        *self.running.lock().unwrap() = false;
        self.cond.notify_all();
        if *self.shutdown_expected.lock().unwrap() {
            log::info!("SUT process exited after an expected shutdown");
        } else {
            crate::logging::fatal(&"unexpected exit of SUT process");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    pub fn wait_for_shutdown(&self) {
        let mut running = self.running.lock().unwrap();
        while *running {
            running = self.cond.wait(running).unwrap();
        }
    }
}

pub struct SpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub write_queue_max_bytes: usize,
    /// When set, every byte read from the SUT's stdout is additionally
    /// appended to `<debug_dir>/sut.stdout.log`, for offline replay of
    /// flaky interactions.
    pub debug_dir: Option<PathBuf>,
}

/// The running SUT: a sender for the numbered-command protocol (throttled
/// by `ready_monitor`'s READY handshake) and the liveness monitor.
pub struct SutProcess {
    pub sender: Arc<NumberedCommandSender>,
    pub ready_monitor: Arc<ReadyMonitor>,
    pub running: Arc<SutRunningMonitor>,
    pub stdin_token: Token,
    pub stdout_token: Token,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
}

impl SutProcess {
    /// Marks the upcoming exit as expected (typically called just before
    /// sending a SHUTDOWN command) and blocks until the reaper thread has
    /// observed and reaped it.
    pub fn wait_for_shutdown(&self) {
        self.running.set_shutdown_expected(true);
        self.running.wait_for_shutdown();
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock().unwrap()
    }
}

/// Spawns the SUT and registers its stdio with `event_loop`. The returned
/// handle's `sender` issues numbered commands throttled by `ready_monitor`,
/// matching the SUT's one-command-at-a-time READY protocol.
pub fn spawn_sut(config: SpawnConfig, event_loop: &EventLoopHandle) -> HarnessResult<Arc<SutProcess>> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(crate::error::HarnessError::TransientIo)?;

    let stdin = child.stdin.take().expect("stdin was piped");
    let stdout = child.stdout.take().expect("stdout was piped");

    use std::os::unix::io::IntoRawFd;
    let stdin_transport = Transport::from_raw_fd(stdin.into_raw_fd());
    let stdout_transport = Transport::from_raw_fd(stdout.into_raw_fd());

    let (stdin_token, write_queue) =
        crate::stack::register_write_only(event_loop, stdin_transport, config.write_queue_max_bytes)?;

    let ready_monitor = ReadyMonitor::new(write_queue.clone());
    let sender = Arc::new(NumberedCommandSender::with_ready_monitor(write_queue, ready_monitor.clone()));

    let mut dispatcher = Dispatcher::new();
    ready_monitor.install(&mut dispatcher);
    dispatcher.add_handler_factory("RESULTS", sender.extension_factory());
    dispatcher.add_shared_handler("EVENTMSG", Box::new(EventMessageSink));

    let debug_log = config.debug_dir.as_ref().map(|dir| {
        let path = dir.join("sut.stdout.log");
        match File::create(&path) {
            Ok(f) => Mutex::new(f),
            Err(e) => crate::logging::fatal(&format!("could not open debug log {}: {}", path.display(), e)),
        }
    });

    let stdout_token = register_stdout(event_loop, stdout_transport, dispatcher, debug_log)?;

    let running = SutRunningMonitor::new();
    let exit_status = Arc::new(Mutex::new(None));
    let reaper_running = running.clone();
    let reaper_exit_status = exit_status.clone();
    thread::Builder::new()
        .name("sut-reaper".into())
        .spawn(move || {
            let status = child.wait();
            *reaper_exit_status.lock().unwrap() = status.ok();
            reaper_running.sut_exited();
        })
        .expect("failed to spawn SUT reaper thread");

    Ok(Arc::new(SutProcess {
        sender,
        ready_monitor,
        running,
        stdin_token,
        stdout_token,
        exit_status,
    }))
}

fn register_stdout(
    event_loop: &EventLoopHandle,
    transport: Transport,
    mut dispatcher: Dispatcher,
    debug_log: Option<Mutex<File>>,
) -> HarnessResult<Token> {
    let mut parser = Parser::new();
    let on_data = Box::new(move |chunk: Knot| {
        if let Some(log) = &debug_log {
            let _ = log.lock().unwrap().write_all(&chunk.to_vec());
        }
        if let Err(e) = parser.data_received(chunk, &mut dispatcher) {
            crate::logging::fatal(&e);
        }
    });
    let on_eof = Box::new(|| {});
    let (token, _) = event_loop.register(transport, Some(on_data), Some(on_eof), None)?;
    Ok(token)
}
