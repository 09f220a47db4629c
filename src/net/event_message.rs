// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Consumes standalone "EVENTMSG\n<n> <event_id>[ <info>]\n" occurrences
//! emitted by [`crate::numbered_command::CommandContext::write_event`]. These
//! are not paired with a RESULTS session — they can arrive at any point
//! while a command is in flight — so they get their own shared, stateless
//! dispatcher entry rather than living inside `ResultsSession`.

use crate::dispatch::{ExtOutcome, ProtocolExtension};
use crate::error::{HarnessError, HarnessResult};
use crate::knot::Knot;

/// Shared (stateless) handler for the "EVENTMSG" token. Logs every
/// occurrence at debug level; callers needing to act on specific events
/// should parse `log`'s output or replace this with their own extension.
pub struct EventMessageSink;

impl ProtocolExtension for EventMessageSink {
    fn on_protocol_start(&mut self, first_line: &Knot) -> HarnessResult<ExtOutcome> {
        if !first_line.equal(b"EVENTMSG") {
            return Err(HarnessError::ProtocolViolation(format!(
                "expected a bare EVENTMSG line, got {:?}",
                first_line.to_string_lossy()
            )));
        }
        Ok(ExtOutcome::Continue)
    }

    fn line_received(&mut self, line: Knot) -> HarnessResult<ExtOutcome> {
        let text = line.to_string_lossy();
        let mut parts = text.splitn(3, ' ');
        let command_number = parts.next().unwrap_or("");
        let event_id = parts.next().unwrap_or("");
        let info = parts.next();
        match info {
            Some(info) => log::debug!("EVENTMSG {} {} {}", command_number, event_id, info),
            None => log::debug!("EVENTMSG {} {}", command_number, event_id),
        }
        Ok(ExtOutcome::Done)
    }

    fn raw_received(&mut self, _data: Knot) -> HarnessResult<ExtOutcome> {
        Err(HarnessError::ProtocolViolation("unexpected raw data in an EVENTMSG session".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;

    #[test]
    fn logs_and_closes_the_session() {
        let mut d = Dispatcher::new();
        d.add_shared_handler("EVENTMSG", Box::new(EventMessageSink));
        d.line_received(Knot::from("EVENTMSG")).unwrap();
        d.line_received(Knot::from("7 1 script started")).unwrap();
        // A second occurrence reuses the same shared handler.
        d.line_received(Knot::from("EVENTMSG")).unwrap();
        d.line_received(Knot::from("7 2")).unwrap();
    }

    #[test]
    fn malformed_trigger_is_protocol_violation() {
        let mut d = Dispatcher::new();
        d.add_shared_handler("EVENTMSG", Box::new(EventMessageSink));
        let err = d.line_received(Knot::from("EVENTMSG extra")).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }
}
