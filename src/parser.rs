// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! LINE/RAW framing: alternates between reading LF-terminated lines and, once
//! a line equal to `RAW` is seen, reading decimal-count-prefixed binary
//! chunks until a line equal to `ENDRAW` closes the block.

use crate::error::{HarnessError, HarnessResult};
use crate::knot::{Knot, KnotIter};

const RAW_DELIMITER: &[u8] = b"RAW";
const END_RAW_DELIMITER: &[u8] = b"ENDRAW";

/// Receives parsed lines and raw blocks as they become available.
pub trait ParseHandler {
    fn line_received(&mut self, line: Knot) -> HarnessResult<()>;
    fn raw_received(&mut self, data: Knot) -> HarnessResult<()>;
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Mode {
    Line,
    Raw,
}

/// Incremental LINE/RAW parser. Feed it bytes as they arrive with
/// [`Parser::data_received`]; it calls back into a [`ParseHandler`] for each
/// complete line or raw block found, and buffers everything else for the
/// next call.
pub struct Parser {
    cur_data: Knot,
    line_search_position: Option<KnotIter>,
    mode: Mode,
    raw_byte_count: Option<usize>,
    raw_data: Knot,
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            cur_data: Knot::new(),
            line_search_position: None,
            mode: Mode::Line,
            raw_byte_count: None,
            raw_data: Knot::new(),
        }
    }

    /// Appends newly read bytes and runs the parser forward as far as
    /// possible, invoking `handler` for each line or raw block found.
    pub fn data_received(
        &mut self,
        data: Knot,
        handler: &mut dyn ParseHandler,
    ) -> HarnessResult<()> {
        self.cur_data.append(&data);
        let mut keep_going = true;
        while keep_going {
            keep_going = match self.mode {
                Mode::Line => self.line_mode(handler)?,
                Mode::Raw => self.raw_mode_step(handler)?,
            };
        }
        Ok(())
    }

    pub fn has_unparsed_data(&self) -> bool {
        self.cur_data.size() > 0
    }

    /// Extracts the next complete LF-terminated line, if any, leaving the
    /// terminator out and advancing the internal search cursor so repeated
    /// calls don't re-scan bytes already known not to contain a line break.
    fn get_line(&mut self) -> Option<Knot> {
        if self.cur_data.is_empty() {
            return None;
        }

        let search_from = match self.line_search_position {
            None => self.cur_data.begin(),
            Some(it) if it == self.cur_data.end() => self.cur_data.begin(),
            Some(it) => it,
        };

        let lf = self.cur_data.find(b'\n', search_from);
        if lf != self.cur_data.end() {
            let line = self.cur_data.sub_knot(self.cur_data.begin(), lf);
            let after_lf = self.cur_data.advance(lf);
            if after_lf == self.cur_data.end() {
                self.cur_data.clear();
            } else {
                self.cur_data.left_erase(after_lf);
            }
            self.line_search_position = Some(self.cur_data.end());
            Some(line)
        } else {
            self.line_search_position = Some(search_from);
            None
        }
    }

    fn get_bytes(&mut self, byte_count: usize) -> Option<Knot> {
        if self.cur_data.size() < byte_count {
            return None;
        }
        if self.cur_data.size() == byte_count {
            let result = self.cur_data.clone();
            self.cur_data.clear();
            Some(result)
        } else {
            let split_at = self.cur_data.iter_for_char(byte_count);
            Some(self.cur_data.split(split_at))
        }
    }

    fn line_mode(&mut self, handler: &mut dyn ParseHandler) -> HarnessResult<bool> {
        while let Some(line) = self.get_line() {
            if line.equal(RAW_DELIMITER) {
                self.mode = Mode::Raw;
                self.raw_byte_count = None;
                self.raw_data = Knot::new();
                return Ok(self.has_unparsed_data());
            }
            handler.line_received(line)?;
        }
        Ok(false)
    }

    fn raw_mode_step(&mut self, handler: &mut dyn ParseHandler) -> HarnessResult<bool> {
        loop {
            match self.raw_byte_count {
                None => {
                    let count_line = match self.get_line() {
                        Some(l) => l,
                        None => return Ok(false),
                    };
                    if count_line.equal(END_RAW_DELIMITER) {
                        let data = std::mem::replace(&mut self.raw_data, Knot::new());
                        handler.raw_received(data)?;
                        self.mode = Mode::Line;
                        return Ok(self.has_unparsed_data());
                    }
                    let bytes = count_line.to_vec();
                    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
                        return Err(HarnessError::ProtocolViolation(format!(
                            "invalid raw mode count: {:?}",
                            String::from_utf8_lossy(&bytes)
                        )));
                    }
                    let count: usize = count_line.to_string_lossy().parse().map_err(|_| {
                        HarnessError::ProtocolViolation(format!(
                            "invalid raw mode count: {:?}",
                            String::from_utf8_lossy(&bytes)
                        ))
                    })?;
                    self.raw_byte_count = Some(count);
                }
                Some(0) => {
                    // A zero-length chunk is valid and resolves immediately;
                    // go back to waiting for the next count line.
                    self.raw_byte_count = None;
                }
                Some(n) => match self.get_bytes(n) {
                    None => return Ok(false),
                    Some(chunk) => {
                        self.raw_byte_count = None;
                        self.raw_data.append(&chunk);
                    }
                },
            }
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
        raws: Vec<Vec<u8>>,
    }

    impl ParseHandler for Recorder {
        fn line_received(&mut self, line: Knot) -> HarnessResult<()> {
            self.lines.push(line.to_string_lossy());
            Ok(())
        }
        fn raw_received(&mut self, data: Knot) -> HarnessResult<()> {
            self.raws.push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn parses_simple_lines() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        p.data_received(Knot::from("hello\nworld\n"), &mut h).unwrap();
        assert_eq!(h.lines, vec!["hello", "world"]);
    }

    #[test]
    fn parses_lines_split_across_calls() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        p.data_received(Knot::from("hel"), &mut h).unwrap();
        assert!(h.lines.is_empty());
        p.data_received(Knot::from("lo\n"), &mut h).unwrap();
        assert_eq!(h.lines, vec!["hello"]);
    }

    #[test]
    fn parses_raw_block() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        p.data_received(Knot::from("RAW\n5\nhelloENDRAW\nafter\n"), &mut h)
            .unwrap();
        assert_eq!(h.raws, vec![b"hello".to_vec()]);
        assert_eq!(h.lines, vec!["after"]);
    }

    #[test]
    fn raw_block_with_multiple_chunks() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        p.data_received(Knot::from("RAW\n2\nab3\ncdeENDRAW\n"), &mut h)
            .unwrap();
        assert_eq!(h.raws, vec![b"abcde".to_vec()]);
    }

    #[test]
    fn raw_block_split_across_calls_on_count_boundary() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        p.data_received(Knot::from("RAW\n1"), &mut h).unwrap();
        p.data_received(Knot::from("0\n"), &mut h).unwrap();
        assert!(h.raws.is_empty());
        p.data_received(Knot::from("0123456789ENDRAW\n"), &mut h)
            .unwrap();
        assert_eq!(h.raws, vec![b"0123456789".to_vec()]);
    }

    #[test]
    fn negative_byte_count_is_protocol_violation() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        let err = p
            .data_received(Knot::from("RAW\n-1\n"), &mut h)
            .unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }

    #[test]
    fn zero_length_raw_chunk_then_more_chunks() {
        let mut p = Parser::new();
        let mut h = Recorder::default();
        p.data_received(Knot::from("RAW\n0\n3\nabcENDRAW\n"), &mut h)
            .unwrap();
        assert_eq!(h.raws, vec![b"abc".to_vec()]);
    }
}
