// Copyright the harness-engine contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Knot: an immutable-append byte rope built from zero-copy strands.
//!
//! The original implementation distinguished strands the knot owns from
//! strands merely borrowed from the caller, because it had to manage raw
//! pointer lifetimes by hand. Rust's ownership model makes that distinction
//! unnecessary: every strand here is backed by an `Arc<[u8]>`, so cloning a
//! strand (or a whole knot) is always a handful of refcount bumps, never a
//! copy of the bytes. `Arc` rather than `Rc` because knots cross the
//! worker-pool / write-queue thread boundary.

use std::io::{self, Write};
use std::ops::Range;
use std::sync::Arc;

/// A contiguous slice of a shared byte buffer.
#[derive(Clone)]
pub struct Strand {
    data: Arc<[u8]>,
    range: Range<usize>,
}

impl Strand {
    pub fn new(bytes: Vec<u8>) -> Self {
        let data: Arc<[u8]> = Arc::from(bytes.into_boxed_slice());
        let len = data.len();
        Strand { data, range: 0..len }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Strand::new(bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    fn sub(&self, start: usize, end: usize) -> Strand {
        debug_assert!(start <= end && end <= self.range.len());
        Strand {
            data: self.data.clone(),
            range: (self.range.start + start)..(self.range.start + end),
        }
    }
}

/// A cursor into a [`Knot`]: a (strand index, byte offset) pair. Stable
/// across `Append` because appends only ever push new strands; they never
/// move or remove existing ones.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KnotIter {
    strand: usize,
    offset: usize,
}

/// An immutable-append byte rope.
#[derive(Clone, Default)]
pub struct Knot {
    strands: Arc<Vec<Strand>>,
    size: usize,
}

impl Knot {
    pub fn new() -> Self {
        Knot::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut k = Knot::new();
        k.append_strand(Strand::new(bytes));
        k
    }

    pub fn from_static(bytes: &'static str) -> Self {
        Knot::from_bytes(bytes.as_bytes().to_vec())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn begin(&self) -> KnotIter {
        KnotIter { strand: 0, offset: 0 }
    }

    pub fn end(&self) -> KnotIter {
        KnotIter {
            strand: self.strands.len(),
            offset: 0,
        }
    }

    fn strands_mut(&mut self) -> &mut Vec<Strand> {
        Arc::make_mut(&mut self.strands)
    }

    pub fn append_strand(&mut self, strand: Strand) {
        if strand.is_empty() {
            return;
        }
        self.size += strand.len();
        self.strands_mut().push(strand);
    }

    pub fn append_owned(&mut self, bytes: Vec<u8>) {
        self.append_strand(Strand::new(bytes));
    }

    pub fn append(&mut self, other: &Knot) {
        for s in other.strands.iter() {
            self.append_strand(s.clone());
        }
    }

    /// Advances `iter` by one byte, skipping over empty strands. Returns
    /// `end()` when there is nothing left.
    pub fn advance(&self, iter: KnotIter) -> KnotIter {
        let mut strand = iter.strand;
        let mut offset = iter.offset + 1;
        while strand < self.strands.len() && offset >= self.strands[strand].len() {
            strand += 1;
            offset = 0;
        }
        KnotIter { strand, offset }
    }

    fn normalize(&self, mut iter: KnotIter) -> KnotIter {
        while iter.strand < self.strands.len() && self.strands[iter.strand].len() == 0 {
            iter.strand += 1;
            iter.offset = 0;
        }
        iter
    }

    fn byte_at(&self, iter: KnotIter) -> Option<u8> {
        self.strands
            .get(iter.strand)
            .map(|s| s.as_bytes()[iter.offset])
    }

    /// Finds the first occurrence of `byte` at or after `start`, returning
    /// an iterator pointing at it, or `end()` if not found.
    pub fn find(&self, byte: u8, start: KnotIter) -> KnotIter {
        let mut it = self.normalize(start);
        while it.strand < self.strands.len() {
            if self.byte_at(it) == Some(byte) {
                return it;
            }
            it = self.advance(it);
        }
        self.end()
    }

    /// An iterator pointing at the `index`-th byte of the knot (0-based).
    pub fn iter_for_char(&self, index: usize) -> KnotIter {
        let mut remaining = index;
        let mut it = self.begin();
        it = self.normalize(it);
        while it.strand < self.strands.len() {
            let len = self.strands[it.strand].len();
            if remaining < len {
                return KnotIter {
                    strand: it.strand,
                    offset: remaining,
                };
            }
            remaining -= len;
            it = KnotIter {
                strand: it.strand + 1,
                offset: 0,
            };
        }
        self.end()
    }

    /// A knot sharing storage with `self`, covering `[begin, end)`.
    pub fn sub_knot(&self, begin: KnotIter, end: KnotIter) -> Knot {
        if begin == end {
            return Knot::new();
        }
        let mut out = Knot::new();
        if begin.strand == end.strand {
            let strand = &self.strands[begin.strand];
            out.append_strand(strand.sub(begin.offset, end.offset));
            return out;
        }
        {
            let first = &self.strands[begin.strand];
            out.append_strand(first.sub(begin.offset, first.len()));
        }
        for s in &self.strands[begin.strand + 1..end.strand] {
            out.append_strand(s.clone());
        }
        if end.strand < self.strands.len() && end.offset > 0 {
            let last = &self.strands[end.strand];
            out.append_strand(last.sub(0, end.offset));
        }
        out
    }

    /// Splits the knot at `at`: returns the left part, `self` becomes the
    /// right part (sharing storage, no bytes copied).
    pub fn split(&mut self, at: KnotIter) -> Knot {
        let left = self.sub_knot(self.begin(), at);
        let right = self.sub_knot(at, self.end());
        *self = right;
        left
    }

    /// Drops everything strictly before `at`.
    pub fn left_erase(&mut self, at: KnotIter) {
        *self = self.sub_knot(at, self.end());
    }

    pub fn clear(&mut self) {
        *self = Knot::new();
    }

    pub fn equal(&self, bytes: &[u8]) -> bool {
        if self.size != bytes.len() {
            return false;
        }
        self.starts_with(bytes)
    }

    pub fn starts_with(&self, probe: &[u8]) -> bool {
        if probe.len() > self.size {
            return false;
        }
        let mut remaining = probe;
        for s in self.strands.iter() {
            if remaining.is_empty() {
                break;
            }
            let take = remaining.len().min(s.len());
            if &s.as_bytes()[..take] != &remaining[..take] {
                return false;
            }
            remaining = &remaining[take..];
        }
        remaining.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for s in self.strands.iter() {
            out.extend_from_slice(s.as_bytes());
        }
        out
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    /// Writes as much of `[start, end())` as the sink will accept without
    /// blocking. Returns the cursor just past the last byte actually
    /// written, and the I/O result (so a partial write is never lost: the
    /// caller resumes from the returned cursor on the next readiness event).
    pub fn write_to<W: Write>(&self, w: &mut W, start: KnotIter) -> (KnotIter, io::Result<()>) {
        let mut cursor = self.normalize(start);
        loop {
            if cursor.strand >= self.strands.len() {
                return (cursor, Ok(()));
            }
            let strand = &self.strands[cursor.strand];
            let bytes = &strand.as_bytes()[cursor.offset..];
            match w.write(bytes) {
                Ok(0) => return (cursor, Ok(())),
                Ok(n) if n == bytes.len() => {
                    cursor = self.normalize(KnotIter {
                        strand: cursor.strand + 1,
                        offset: 0,
                    });
                }
                Ok(n) => {
                    return (
                        KnotIter {
                            strand: cursor.strand,
                            offset: cursor.offset + n,
                        },
                        Ok(()),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return (cursor, Err(e)),
            }
        }
    }
}

impl From<&str> for Knot {
    fn from(s: &str) -> Self {
        Knot::from_bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Knot {
    fn from(s: String) -> Self {
        Knot::from_bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Knot {
    fn from(bytes: Vec<u8>) -> Self {
        Knot::from_bytes(bytes)
    }
}

impl PartialEq for Knot {
    fn eq(&self, other: &Knot) -> bool {
        self.size == other.size && self.to_vec() == other.to_vec()
    }
}

impl Eq for Knot {}

impl std::fmt::Debug for Knot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Knot({:?})", String::from_utf8_lossy(&self.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_find_line() {
        let mut k = Knot::new();
        k.append_owned(b"hello\nworld".to_vec());
        let lf = k.find(b'\n', k.begin());
        assert_ne!(lf, k.end());
        let line = k.sub_knot(k.begin(), lf);
        assert!(line.equal(b"hello"));
    }

    #[test]
    fn split_preserves_bytes_on_both_sides() {
        let mut k = Knot::new();
        k.append_owned(b"abc".to_vec());
        k.append_owned(b"def".to_vec());
        let mid = k.iter_for_char(2);
        let left = k.split(mid);
        assert!(left.equal(b"ab"));
        assert!(k.equal(b"cdef"));
        let mut rebuilt = left.clone();
        rebuilt.append(&k);
        assert!(rebuilt.equal(b"abcdef"));
    }

    #[test]
    fn left_erase_drops_prefix() {
        let mut k = Knot::new();
        k.append_owned(b"xxhello".to_vec());
        let at = k.iter_for_char(2);
        k.left_erase(at);
        assert!(k.equal(b"hello"));
    }

    #[test]
    fn sub_knot_shares_storage_and_survives_clear() {
        let mut k = Knot::new();
        k.append_owned(b"hello world".to_vec());
        let sub = k.sub_knot(k.begin(), k.iter_for_char(5));
        k.clear();
        assert!(sub.equal(b"hello"));
        assert!(k.is_empty());
    }

    #[test]
    fn starts_with_rejects_longer_probe() {
        let k = Knot::from("ab");
        assert!(!k.starts_with(b"abc"));
        assert!(k.starts_with(b"ab"));
        assert!(k.starts_with(b""));
    }

    #[test]
    fn write_to_resumes_after_partial_write() {
        struct OneByteWriter(Vec<u8>);
        impl Write for OneByteWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.push(buf[0]);
                Ok(1)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let k = Knot::from("abcde");
        let mut sink = OneByteWriter(Vec::new());
        let mut cursor = k.begin();
        loop {
            let (next, res) = k.write_to(&mut sink, cursor);
            res.unwrap();
            if next == k.end() {
                break;
            }
            cursor = next;
        }
        assert_eq!(sink.0, b"abcde");
    }

    #[test]
    fn knot_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Knot>();
    }
}
