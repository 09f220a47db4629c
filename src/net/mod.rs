// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Master/slave harness network topology (spec.md §4.9): the master listens
//! for slave connections and identifies each via a HARNESS_INFO handshake;
//! each slave connects out to the master and answers HARNESS_INFO and
//! RUNSCRIPT. Both sides share the "EVENTMSG" dispatcher entry via
//! [`event_message::EventMessageSink`].

mod event_message;
mod master;
mod slave;

pub use event_message::EventMessageSink;
pub use master::{Master, MasterConfig, SlaveConnection};
pub use slave::{connect as connect_slave, SlaveConfig, RUNSCRIPT_STARTED_EVENT};
