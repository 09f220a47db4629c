// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Error taxonomy for the harness coordination engine.
//!
//! Most of these are fatal by design: the harness drives a single SUT through
//! one deterministic script and is restarted from scratch on failure, so the
//! right response to a protocol violation or a dropped peer is to log and
//! exit rather than to retry.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Unknown trigger token, raw data outside raw mode, malformed count
    /// line, command number mismatch. Always fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// EOF on a pipe or socket where more data was contractually expected.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Cannot spawn a thread, cannot open a file, and similar.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// A single read/write returned partial data or WouldBlock. Recovered
    /// locally by the event loop; callers should rarely see this variant
    /// escape a loop iteration.
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] io::Error),

    /// A RESULTS body beginning with FAILED/ENDFAILED. Carried verbatim;
    /// interpretation is left to the caller.
    #[error("application reported failure")]
    ApplicationFailure(Vec<u8>),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
