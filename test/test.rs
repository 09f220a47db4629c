// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving the real event loop over TCP loopback —
//! the wire protocol doesn't distinguish a spawned SUT's pipe from a TCP
//! peer, so these exercise the same command_sender/dispatch/parser stack
//! a real SUT or harness peer would.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use harness_engine::attach_duplex_lazy;
use harness_engine::command_sender::NumberedCommandSender;
use harness_engine::dispatch::Dispatcher;
use harness_engine::event_loop::{EventLoop, EventLoopConfig, EventLoopHandle, Transport};
use harness_engine::knot::Knot;
use harness_engine::net::{connect_slave, EventMessageSink, Master, MasterConfig, SlaveConfig};
use harness_engine::ready_monitor::ReadyMonitor;
use harness_engine::script::ScriptManager;
use harness_engine::worker_pool::WorkerPool;

fn start_loop() -> EventLoopHandle {
    let (event_loop, handle) = EventLoop::new(EventLoopConfig::default()).unwrap();
    thread::Builder::new()
        .name("event-loop".into())
        .spawn(move || event_loop.run())
        .unwrap();
    handle
}

/// A minimal stand-in for a spawned SUT, speaking the READY/COMMAND/RESULTS
/// protocol directly over a blocking `TcpStream`. Responds to any single-line
/// "ECHO <text>" body by echoing `<text>` back as the results body.
fn fake_echo_sut(stream: TcpStream) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    writer.write_all(b"READY\n").unwrap();

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).unwrap() == 0 {
            return;
        }
        let header = line.trim_end();
        let number = match header.strip_prefix("COMMAND ") {
            Some(n) => n.to_string(),
            None => continue,
        };

        let mut body_line = String::new();
        line.clear();
        reader.read_line(&mut line).unwrap();
        if let Some(rest) = line.trim_end().strip_prefix("ECHO ") {
            body_line = rest.to_string();
        }
        line.clear();
        reader.read_line(&mut line).unwrap(); // ENDCOMMAND

        write!(writer, "RESULTS {}\n{}\nENDRESULTS\nREADY\n", number, body_line).unwrap();
    }
}

#[test]
fn echo_command_round_trip() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        fake_echo_sut(stream);
    });

    let event_loop = start_loop();
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    let mio_stream = mio::net::TcpStream::from_std(stream);

    let sender_cell: Arc<Mutex<Option<Arc<NumberedCommandSender>>>> = Arc::new(Mutex::new(None));
    let sender_cell_build = sender_cell.clone();
    attach_duplex_lazy(
        &event_loop,
        Transport::Tcp(mio_stream),
        64 * 1024,
        move |write_queue| {
            let ready_monitor = ReadyMonitor::new(write_queue.clone());
            let sender = Arc::new(NumberedCommandSender::with_ready_monitor(write_queue, ready_monitor.clone()));
            let mut dispatcher = Dispatcher::new();
            ready_monitor.install(&mut dispatcher);
            dispatcher.add_handler_factory("RESULTS", sender.extension_factory());
            dispatcher.add_shared_handler("EVENTMSG", Box::new(EventMessageSink));
            *sender_cell_build.lock().unwrap() = Some(sender);
            dispatcher
        },
        Box::new(|| {}),
    )
    .unwrap();
    let sender = sender_cell.lock().unwrap().clone().unwrap();

    let mut dones = Vec::new();
    for _ in 0..100 {
        let (_, done) = sender.send_command(Knot::from("ECHO foo\n"));
        dones.push(done);
    }
    for done in dones {
        assert_eq!(done.value(), Knot::from("foo\n"));
    }
}

#[test]
fn master_slave_identify_and_runscript() {
    let _ = env_logger::try_init();
    let master_loop = start_loop();
    let listener_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bind_listener = TcpListener::bind(listener_addr).unwrap();
    let addr = bind_listener.local_addr().unwrap();
    drop(bind_listener);

    let master = Master::listen(
        MasterConfig {
            listen_addr: addr,
            write_queue_max_bytes: 64 * 1024,
        },
        master_loop,
    )
    .unwrap();

    let ids = ["sh1", "sh2", "sh3", "sh4", "sh5"];
    for (i, id) in ids.iter().enumerate() {
        let slave_loop = start_loop();
        let scripts = Arc::new(ScriptManager::new());
        let pool = WorkerPool::new(|| ());
        connect_slave(
            SlaveConfig {
                harness_id: (*id).to_string(),
                sut_count: i + 1,
                connect_addr: addr,
                write_queue_max_bytes: 64 * 1024,
            },
            &slave_loop,
            scripts,
            pool,
        )
        .unwrap();
    }

    let connections = master.block_until_num_connections(5);
    assert_eq!(connections.len(), 5);
    for (i, id) in ids.iter().enumerate() {
        let conn = master.get_protocol_stack(id).expect("slave should be identified");
        assert_eq!(conn.sut_count, i + 1);
    }

    let sh1 = master.get_protocol_stack("sh1").unwrap();
    let (start, done) = sh1.sender.send_command(Knot::from("RUNSCRIPT noop\n"));
    start.wait();
    done.wait();
    assert_eq!(done.value(), Knot::new());
}
