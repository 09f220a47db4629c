// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Slave side of the harness network topology (spec.md §4.9). Connects out
//! to the master and answers two numbered commands: HARNESS_INFO (identity)
//! and RUNSCRIPT (dispatches to a registered [`Script`]).
//!
//! RUNSCRIPT's wire contract as described in spec.md is two RESULTS frames
//! per command number — one acknowledging start, one on completion — which
//! spec.md itself flags as irreconcilable with the bijective per-command
//! RESULTS pairing required everywhere else. This implementation resolves
//! that by keeping RESULTS bijective: the start acknowledgement is an
//! EVENTMSG (event id 1) emitted immediately, with the single RESULTS
//! (empty body) reserved for completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::error::{HarnessError, HarnessResult};
use crate::event_loop::{EventLoopHandle, Transport};
use crate::knot::Knot;
use crate::numbered_command::{Body, CommandContext, CommandHandlerFactory, NumberedCommandHandler, NumberedCommandReceiver};
use crate::script::ScriptManager;
use crate::worker_pool::WorkerPool;

/// Event id used for the RUNSCRIPT start-acknowledgement EVENTMSG.
pub const RUNSCRIPT_STARTED_EVENT: u32 = 1;

pub struct SlaveConfig {
    pub harness_id: String,
    pub sut_count: usize,
    pub connect_addr: SocketAddr,
    pub write_queue_max_bytes: usize,
}

/// Connects to the master and registers the slave's numbered-command
/// handlers on the shared event loop. Scripts run on `worker_pool` so a
/// long-running RUNSCRIPT never blocks the event loop thread.
pub fn connect(
    config: SlaveConfig,
    event_loop: &EventLoopHandle,
    scripts: Arc<ScriptManager>,
    worker_pool: Arc<WorkerPool<()>>,
) -> HarnessResult<()> {
    let stream = std::net::TcpStream::connect(config.connect_addr).map_err(HarnessError::TransientIo)?;
    stream.set_nonblocking(true).map_err(HarnessError::TransientIo)?;
    let mio_stream = mio::net::TcpStream::from_std(stream);

    let harness_id = config.harness_id;
    let sut_count = config.sut_count;
    let on_eof = Box::new(|| crate::logging::fatal(&"master connection closed unexpectedly"));

    crate::stack::attach_duplex_lazy(
        event_loop,
        Transport::Tcp(mio_stream),
        config.write_queue_max_bytes,
        move |write_queue| {
            let mut handlers: HashMap<String, CommandHandlerFactory> = HashMap::new();
            handlers.insert(
                "HARNESS_INFO".into(),
                Box::new(move || {
                    Box::new(HarnessInfoHandler {
                        harness_id: harness_id.clone(),
                        sut_count,
                    }) as Box<dyn NumberedCommandHandler>
                }),
            );
            handlers.insert(
                "RUNSCRIPT".into(),
                Box::new(move || {
                    Box::new(RunScriptHandler {
                        scripts: scripts.clone(),
                        worker_pool: worker_pool.clone(),
                    }) as Box<dyn NumberedCommandHandler>
                }),
            );
            let receiver = NumberedCommandReceiver::new(write_queue, handlers);
            let mut dispatcher = Dispatcher::new();
            dispatcher.add_handler_factory("COMMAND", receiver.extension_factory());
            dispatcher
        },
        on_eof,
    )?;
    Ok(())
}

struct HarnessInfoHandler {
    harness_id: String,
    sut_count: usize,
}

impl NumberedCommandHandler for HarnessInfoHandler {
    fn execute(&mut self, ctx: CommandContext, _body: Body) {
        ctx.write_results(Knot::from(format!("{} {}\n", self.harness_id, self.sut_count)));
        ctx.done();
    }
}

struct RunScriptHandler {
    scripts: Arc<ScriptManager>,
    worker_pool: Arc<WorkerPool<()>>,
}

impl NumberedCommandHandler for RunScriptHandler {
    fn execute(&mut self, ctx: CommandContext, body: Body) {
        let script_name = body
            .first_line()
            .map(|line| line.to_string_lossy())
            .and_then(|text| text.splitn(2, ' ').nth(1).map(str::trim).map(str::to_string))
            .unwrap_or_default();

        let scripts = self.scripts.clone();
        self.worker_pool.add_work(move |_| {
            ctx.write_event(RUNSCRIPT_STARTED_EVENT, Some("script started"));
            match scripts.create(&script_name) {
                Some(mut script) => {
                    if let Err(e) = script.run(body) {
                        log::error!("script {:?} failed: {}", script_name, e);
                    }
                }
                None => log::error!("no script registered named {:?}", script_name),
            }
            ctx.write_results(Knot::new());
            ctx.done();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use crate::write_queue::WriteQueue;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn drain(wq: &Arc<WriteQueue>) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            if wq.drain_once(&mut out).unwrap() {
                break;
            }
        }
        out
    }

    #[test]
    fn harness_info_reports_id_and_sut_count() {
        let wq = WriteQueue::new(4096);
        let mut handlers: HashMap<String, CommandHandlerFactory> = HashMap::new();
        handlers.insert(
            "HARNESS_INFO".into(),
            Box::new(|| {
                Box::new(HarnessInfoHandler {
                    harness_id: "slave-a".into(),
                    sut_count: 3,
                }) as Box<dyn NumberedCommandHandler>
            }),
        );
        let receiver = NumberedCommandReceiver::new(wq.clone(), handlers);
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler_factory("COMMAND", receiver.extension_factory());

        dispatcher.line_received(Knot::from("COMMAND 1")).unwrap();
        dispatcher.line_received(Knot::from("HARNESS_INFO")).unwrap();
        dispatcher.line_received(Knot::from("ENDCOMMAND")).unwrap();

        assert_eq!(drain(&wq), b"RESULTS 1\nslave-a 3\nENDRESULTS\n");
    }

    #[test]
    fn runscript_emits_start_event_then_runs_and_completes() {
        struct FlagScript(Arc<AtomicBool>);
        impl Script for FlagScript {
            fn run(&mut self, _args: Body) -> HarnessResult<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let ran = Arc::new(AtomicBool::new(false));
        let scripts = Arc::new(ScriptManager::new());
        {
            let ran = ran.clone();
            scripts.register("flag", Box::new(move || Box::new(FlagScript(ran.clone())) as Box<dyn Script>));
        }
        let pool = WorkerPool::new(|| ());

        let wq = WriteQueue::new(4096);
        let mut handlers: HashMap<String, CommandHandlerFactory> = HashMap::new();
        handlers.insert("RUNSCRIPT".into(), {
            let pool = pool.clone();
            Box::new(move || {
                Box::new(RunScriptHandler {
                    scripts: scripts.clone(),
                    worker_pool: pool.clone(),
                }) as Box<dyn NumberedCommandHandler>
            })
        });
        let receiver = NumberedCommandReceiver::new(wq.clone(), handlers);
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler_factory("COMMAND", receiver.extension_factory());

        dispatcher.line_received(Knot::from("COMMAND 5")).unwrap();
        dispatcher.line_received(Knot::from("RUNSCRIPT flag")).unwrap();
        dispatcher.line_received(Knot::from("ENDCOMMAND")).unwrap();
        receiver.wait_for_all_commands();

        assert!(ran.load(Ordering::SeqCst));
        let out = drain(&wq);
        assert!(out.starts_with(b"EVENTMSG\n5 1 script started\n"), "{:?}", String::from_utf8_lossy(&out));
        assert!(out.ends_with(b"RESULTS 5\nENDRESULTS\n"), "{:?}", String::from_utf8_lossy(&out));
    }
}
