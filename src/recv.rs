//! The stream recv-buffer (layer L1): absolute offsets, out-of-order gap
//! tracking, and the read/drain protocol built on top of [`Ring`](crate::Ring).

use std::ops::Range;

use log::{debug, trace, warn};

use crate::error::{Error, ErrorKind, Operation};
use crate::gap::GapSet;
use crate::ring::{wrap_split, Ring};

/// Selects how outstanding reads are sequenced.
///
/// Set once at construction; it constrains read/drain call sequencing, not
/// the underlying storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// At most one in-flight read. The read always returns a single
    /// contiguous span — the buffer grows itself rather than hand back a
    /// wrapped, two-part span.
    Single,
    /// At most one in-flight read, which may return two spans (the wrap
    /// halves), to be treated by the caller as one logical run.
    Circular,
    /// Successive reads may hand out disjoint spans before any of them is
    /// drained. Each call returns a [`ReadToken`] that must later be
    /// presented to [`RecvBuffer::drain_token`]; tokens are released
    /// strictly in the order they were issued.
    Multiple,
}

/// Construction-time parameters for a [`RecvBuffer`].
///
/// Mirrors the builder-style configuration object the rest of this crate's
/// lineage uses for allocation policy: callers set the pieces they care
/// about and leave sensible defaults for the rest.
#[derive(Clone, Copy, Debug)]
pub struct RecvBufferConfig {
    initial_alloc: u32,
    virtual_alloc: u32,
    mode: ReadMode,
}

impl RecvBufferConfig {
    /// Starts a config with the given initial and virtual (ceiling)
    /// capacities, both of which must be positive powers of two, defaulting
    /// to [`ReadMode::Circular`].
    pub fn new(initial_alloc: u32, virtual_alloc: u32) -> Self {
        Self {
            initial_alloc,
            virtual_alloc,
            mode: ReadMode::Circular,
        }
    }

    /// Overrides the read mode.
    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }
}

/// An opaque handle identifying one outstanding read issued in
/// [`ReadMode::Multiple`].
///
/// Must be presented to [`RecvBuffer::drain_token`] to release the bytes it
/// covers. Tokens can only be drained in the order they were issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadToken(u64);

/// The result of a successful [`RecvBuffer::write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes of this write that were not already accounted for (received or
    /// already tracked as a gap) and so were charged against the caller's
    /// quota.
    pub quota_consumed: u64,
    /// Whether the contiguous prefix grew as a result of this write.
    pub ready: bool,
}

/// One or two zero-copy spans over a recv-buffer's contiguous prefix,
/// borrowing the buffer for as long as the spans are alive.
///
/// While a `ReadSpans` value is alive, the borrow checker refuses any
/// `&mut self` call on the buffer that produced it — including the resize a
/// subsequent write might need — so a pending read can never be invalidated
/// out from under its caller.
#[derive(Debug)]
pub struct ReadSpans<'a> {
    /// The absolute stream offset at which this read begins.
    pub stream_offset: u64,
    first: &'a [u8],
    second: Option<&'a [u8]>,
}

impl<'a> ReadSpans<'a> {
    /// The spans making up this read, in stream order. The second element
    /// is `None` unless the contiguous prefix wrapped the ring's end.
    pub fn spans(&self) -> (&'a [u8], Option<&'a [u8]>) {
        (self.first, self.second)
    }

    /// Total bytes covered across both spans.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.map_or(0, |s| s.len())
    }

    /// Whether this read covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expose_range<'a>(ring: &'a Ring, rel_start: u32, length: u32) -> (&'a [u8], Option<&'a [u8]>) {
    let (buffer, read_start, alloc_length) = ring.expose();
    let alloc = alloc_length.max(1);
    let phys = (read_start + rel_start) % alloc;
    let (off1, len1, off2, len2) = wrap_split(phys, length, alloc_length);
    let first = &buffer[off1 as usize..(off1 + len1) as usize];
    let second = if len2 > 0 {
        Some(&buffer[off2 as usize..(off2 + len2) as usize])
    } else {
        None
    };
    (first, second)
}

fn overlap(lo: u64, hi: u64, range: Range<u64>) -> Range<u64> {
    let start = range.start.max(lo);
    let end = range.end.min(hi);
    if start < end {
        start..end
    } else {
        start..start
    }
}

/// A stream receive buffer: reassembles out-of-order byte ranges into a
/// contiguous, drainable prefix over a [`Ring`].
#[derive(Debug)]
pub struct RecvBuffer {
    ring: Ring,
    base_offset: u64,
    gaps: GapSet,
    written_high_water: u64,
    mode: ReadMode,
    read_pending_length: u32,
    read_pending_offset: u64,
    /// Next unissued token id and the cursor marking how much of the
    /// contiguous prefix has already been handed out, used only in
    /// [`ReadMode::Multiple`].
    next_token_id: u64,
    read_cursor: u64,
    outstanding: Vec<(u64, u64, u32)>,
}

/// A point-in-time view of a [`RecvBuffer`]'s bookkeeping state, returned by
/// [`RecvBuffer::inspect`] for tests and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inspect {
    /// The absolute offset of the first byte of the contiguous prefix.
    pub base_offset: u64,
    /// The length of the contiguous, readable prefix.
    pub prefix_length: u32,
    /// The current set of missing byte ranges, in ascending order.
    pub gaps: Vec<Range<u64>>,
    /// The ring's current physical capacity.
    pub alloc_length: u32,
    /// The ring's virtual length ceiling.
    pub virtual_length: u32,
    /// Bytes currently checked out to the consumer but not yet drained.
    pub read_pending_length: u32,
}

impl RecvBuffer {
    /// Creates a new recv-buffer from the given configuration.
    pub fn new(config: RecvBufferConfig) -> Result<Self, Error> {
        let ring = Ring::new(config.initial_alloc, config.virtual_alloc)?;
        Ok(Self {
            ring,
            base_offset: 0,
            gaps: GapSet::new(),
            written_high_water: 0,
            mode: config.mode,
            read_pending_length: 0,
            read_pending_offset: 0,
            next_token_id: 0,
            read_cursor: 0,
            outstanding: Vec::new(),
        })
    }

    /// The absolute offset of the first byte of the contiguous prefix.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The length of the contiguous, readable prefix.
    pub fn prefix_length(&self) -> u32 {
        self.ring.prefix_length()
    }

    /// Bytes of a `[lo, hi)` range not yet received, whether tracked as an
    /// explicit gap or simply beyond `written_high_water`.
    fn missing_bytes(&self, lo: u64, hi: u64) -> u64 {
        let tracked_missing = self.gaps.missing_within(lo, hi);
        let beyond = overlap(lo, hi, self.written_high_water..u64::MAX);
        tracked_missing + (beyond.end - beyond.start)
    }

    /// Writes `length` bytes of `source` at absolute stream offset
    /// `absolute_offset`, admitting at most `quota` new (previously unseen)
    /// bytes.
    pub fn write(&mut self, absolute_offset: u64, source: &[u8], quota: u64) -> Result<WriteOutcome, Error> {
        let length = source.len() as u64;
        let rel_signed = absolute_offset as i64 - self.base_offset as i64;
        if (rel_signed as i128) + (length as i128) <= 0 {
            trace!("write at {} len {} already fully drained, ignoring", absolute_offset, length);
            return Ok(WriteOutcome {
                quota_consumed: 0,
                ready: false,
            });
        }

        let (source, rel_u64) = if rel_signed < 0 {
            let clip = (-rel_signed) as usize;
            (&source[clip.min(source.len())..], 0u64)
        } else {
            (source, rel_signed as u64)
        };
        if source.is_empty() {
            return Ok(WriteOutcome {
                quota_consumed: 0,
                ready: false,
            });
        }

        // Stay in u64 until the virtual_length check below has run: `rel_u64`
        // is derived from a 64-bit stream offset and can exceed `u32::MAX` on
        // a multi-GB stream, so narrowing to `u32` before this check would
        // wrap a legitimate `exceeds_virtual` rejection into a small, wrong
        // offset instead of rejecting it.
        let end_u64 = rel_u64 + source.len() as u64;
        if end_u64 > self.ring.virtual_length() as u64 {
            warn!("write rejected: end {} exceeds virtual_length {}", end_u64, self.ring.virtual_length());
            return Err(Error::new(
                Operation::Write,
                ErrorKind::ExceedsVirtual { needed: end_u64 },
            ));
        }
        let rel = rel_u64 as u32;
        let len32 = source.len() as u32;
        let end = end_u64 as u32;

        let lo = self.base_offset + rel as u64;
        let hi = self.base_offset + end as u64;
        let new_bytes = self.missing_bytes(lo, hi);
        if new_bytes > quota {
            warn!("write rejected: needs {} new bytes, quota is {}", new_bytes, quota);
            return Err(Error::new(Operation::Write, ErrorKind::FlowControl { needed: new_bytes }));
        }

        if end > self.ring.alloc_length() {
            self.ring.ensure_capacity(end)?;
        }

        self.ring.write_at(rel, source);

        if lo > self.written_high_water {
            self.gaps.insert(self.written_high_water, lo);
        }
        self.written_high_water = self.written_high_water.max(hi);
        self.gaps.subtract(lo, hi);

        let old_prefix_end = self.base_offset + self.ring.prefix_length() as u64;
        let new_prefix_end = self.gaps.first_lo().unwrap_or(self.written_high_water);
        let ready = new_prefix_end > old_prefix_end;
        if ready {
            self.ring.set_prefix_length((new_prefix_end - self.base_offset) as u32);
        }

        trace!(
            "write accepted: offset {} len {} quota_consumed {} ready {}",
            absolute_offset,
            len32,
            new_bytes,
            ready
        );
        Ok(WriteOutcome {
            quota_consumed: new_bytes,
            ready,
        })
    }

    /// Reads the contiguous prefix as one or two zero-copy spans.
    ///
    /// Valid only in [`ReadMode::Single`] or [`ReadMode::Circular`]; see
    /// [`RecvBuffer::read_multi`] for [`ReadMode::Multiple`].
    pub fn read(&mut self) -> Result<ReadSpans<'_>, Error> {
        debug_assert_ne!(self.mode, ReadMode::Multiple, "use read_multi in ReadMode::Multiple");
        if self.ring.prefix_length() == 0 {
            return Err(Error::new(Operation::Read, ErrorKind::Unavailable));
        }
        if self.read_pending_length > 0 {
            return Err(Error::new(Operation::Read, ErrorKind::Unavailable));
        }

        let prefix_length = self.ring.prefix_length();
        let (_, read_start, alloc_length) = self.ring.expose();
        let wraps = read_start + prefix_length > alloc_length;
        if wraps && self.mode == ReadMode::Single {
            let doubled = alloc_length.saturating_mul(2);
            if doubled > self.ring.virtual_length() {
                return Err(Error::new(Operation::Read, ErrorKind::Unavailable));
            }
            debug!("single-mode read coalescing wrap: resizing {} -> {}", alloc_length, doubled);
            self.ring.resize(doubled)?;
        }

        let (first, second) = expose_range(&self.ring, 0, self.ring.prefix_length());
        self.read_pending_length = self.ring.prefix_length();
        self.read_pending_offset = self.base_offset;
        trace!("read: offset {} pending {}", self.base_offset, self.read_pending_length);
        Ok(ReadSpans {
            stream_offset: self.base_offset,
            first,
            second,
        })
    }

    /// Hands out the next not-yet-issued chunk of the contiguous prefix as a
    /// new outstanding read, valid only in [`ReadMode::Multiple`].
    pub fn read_multi(&mut self) -> Result<(ReadToken, ReadSpans<'_>), Error> {
        debug_assert_eq!(self.mode, ReadMode::Multiple, "read_multi requires ReadMode::Multiple");
        let prefix_end = self.base_offset + self.ring.prefix_length() as u64;
        if self.read_cursor < self.base_offset {
            self.read_cursor = self.base_offset;
        }
        if self.read_cursor >= prefix_end {
            return Err(Error::new(Operation::Read, ErrorKind::Unavailable));
        }

        let start = self.read_cursor;
        let length = (prefix_end - start) as u32;
        let rel_start = (start - self.base_offset) as u32;
        let (first, second) = expose_range(&self.ring, rel_start, length);

        let token = ReadToken(self.next_token_id);
        self.next_token_id += 1;
        self.outstanding.push((token.0, start, length));
        self.read_cursor = prefix_end;
        self.read_pending_length += length;

        trace!("read_multi: token {} offset {} len {}", token.0, start, length);
        Ok((
            token,
            ReadSpans {
                stream_offset: start,
                first,
                second,
            },
        ))
    }

    /// Releases `n` bytes of a single in-flight read (modes [`ReadMode::Single`]
    /// and [`ReadMode::Circular`]).
    ///
    /// A partial drain (`n < read_pending_length`) leaves the remainder
    /// checked out.
    pub fn drain(&mut self, n: u32) -> Result<(), Error> {
        debug_assert_ne!(self.mode, ReadMode::Multiple, "use drain_token in ReadMode::Multiple");
        if n > self.read_pending_length {
            return Err(Error::new(
                Operation::Drain,
                ErrorKind::PreconditionViolation("drain exceeds read_pending_length"),
            ));
        }
        self.ring.drain(n);
        self.base_offset += n as u64;
        self.read_pending_length -= n;
        trace!("drain {}: base_offset now {}", n, self.base_offset);
        Ok(())
    }

    /// Releases `n` bytes of the outstanding read identified by `token`,
    /// which must be the lowest-offset outstanding token.
    pub fn drain_token(&mut self, token: ReadToken, n: u32) -> Result<(), Error> {
        debug_assert_eq!(self.mode, ReadMode::Multiple, "drain_token requires ReadMode::Multiple");
        let front = self.outstanding.first().copied().ok_or_else(|| {
            Error::new(
                Operation::Drain,
                ErrorKind::PreconditionViolation("no outstanding read to drain"),
            )
        })?;
        if front.0 != token.0 {
            return Err(Error::new(
                Operation::Drain,
                ErrorKind::PreconditionViolation("tokens must be drained in issuance order"),
            ));
        }
        if n > front.2 {
            return Err(Error::new(
                Operation::Drain,
                ErrorKind::PreconditionViolation("drain exceeds this token's outstanding length"),
            ));
        }

        self.ring.drain(n);
        self.base_offset += n as u64;
        self.read_pending_length -= n;
        if n == front.2 {
            self.outstanding.remove(0);
        } else {
            self.outstanding[0] = (front.0, front.1 + n as u64, front.2 - n);
        }
        trace!("drain_token {}: base_offset now {}", token.0, self.base_offset);
        Ok(())
    }

    /// Raises the virtual length ceiling; see [`Ring::set_virtual_length`].
    pub fn grow_virtual(&mut self, new_virtual: u32) -> Result<(), Error> {
        self.ring.set_virtual_length(new_virtual)
    }

    /// A snapshot of the buffer's bookkeeping state, for tests.
    pub fn inspect(&self) -> Inspect {
        Inspect {
            base_offset: self.base_offset,
            prefix_length: self.ring.prefix_length(),
            gaps: self.gaps.ranges().to_vec(),
            alloc_length: self.ring.alloc_length(),
            virtual_length: self.ring.virtual_length(),
            read_pending_length: self.read_pending_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans_to_vec(spans: &ReadSpans<'_>) -> Vec<u8> {
        let (a, b) = spans.spans();
        let mut out = a.to_vec();
        if let Some(b) = b {
            out.extend_from_slice(b);
        }
        out
    }

    #[test]
    fn in_order_small_writes() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Circular)).unwrap();
        rb.write(0, b"ABCD", 100).unwrap();
        rb.write(4, b"EFGH", 100).unwrap();
        rb.write(8, b"IJKL", 100).unwrap();

        let spans = rb.read().unwrap();
        assert_eq!(spans.stream_offset, 0);
        assert_eq!(spans_to_vec(&spans), b"ABCDEFGHIJKL");
        drop(spans);

        rb.drain(12).unwrap();
        let snap = rb.inspect();
        assert_eq!(snap.base_offset, 12);
        assert_eq!(snap.prefix_length, 0);
        assert_eq!(snap.alloc_length, 16);
    }

    #[test]
    fn wrap_after_drain() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Circular)).unwrap();
        rb.write(0, b"ABCDEFGHIJKL", 100).unwrap();
        rb.read().unwrap();
        rb.drain(12).unwrap();

        rb.write(12, b"MNOPQRST", 100).unwrap();
        let spans = rb.read().unwrap();
        assert_eq!(spans.stream_offset, 12);
        assert_eq!(spans_to_vec(&spans), b"MNOPQRST");
        let (first, second) = spans.spans();
        assert_eq!(first, b"MNOP");
        assert_eq!(second, Some(&b"QRST"[..]));
    }

    #[test]
    fn out_of_order_fill() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Circular)).unwrap();
        let out = rb.write(8, b"XXXX", 100).unwrap();
        assert_eq!(out.ready, false);
        assert_eq!(rb.prefix_length(), 0);
        assert_eq!(rb.inspect().gaps, vec![0..8]);

        let out = rb.write(0, b"YYYYYYYY", 100).unwrap();
        assert!(out.ready);
        assert!(rb.inspect().gaps.is_empty());
        assert_eq!(rb.prefix_length(), 12);
    }

    #[test]
    fn growth_under_wrap() {
        // The write that forces growth runs while 2 bytes of an earlier read
        // are still checked out but not yet drained; this crate permits
        // that (see the Ring::resize doc comment on linearization).
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(8, 32).with_mode(ReadMode::Circular)).unwrap();
        rb.write(0, b"ABCDEF", 100).unwrap();
        let spans = rb.read().unwrap();
        assert_eq!(spans_to_vec(&spans), b"ABCDEF");
        drop(spans);
        rb.drain(4).unwrap();

        rb.write(6, b"0123456789", 100).unwrap();
        let snap = rb.inspect();
        assert_eq!(snap.alloc_length, 16);
        assert_eq!(snap.prefix_length, 12);

        // release the remainder of the first read before starting another
        rb.drain(2).unwrap();
        let spans = rb.read().unwrap();
        assert_eq!(spans_to_vec(&spans), b"0123456789");
        let (first, second) = spans.spans();
        assert_eq!(first.len() + second.map_or(0, |s| s.len()), 10);
    }

    #[test]
    fn quota_refusal_leaves_state_unchanged() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Circular)).unwrap();
        let data = vec![0u8; 100];
        let err = rb.write(0, &data, 50).unwrap_err();
        match err.kind() {
            ErrorKind::FlowControl { needed } => assert_eq!(needed, 100),
            other => panic!("unexpected kind: {:?}", other),
        }
        assert_eq!(rb.prefix_length(), 0);
    }

    #[test]
    fn single_mode_refuses_second_read() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Single)).unwrap();
        rb.write(0, b"ABCDEFGH", 100).unwrap();
        let spans = rb.read().unwrap();
        assert_eq!(spans_to_vec(&spans), b"ABCDEFGH");
        drop(spans);

        assert!(rb.read().is_err());
        rb.drain(8).unwrap();
        assert!(rb.read().is_err());
    }

    #[test]
    fn multiple_mode_tokens_drain_in_order() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Multiple)).unwrap();
        rb.write(0, b"AAAA", 100).unwrap();
        let (tok_a, spans_a) = rb.read_multi().unwrap();
        assert_eq!(spans_to_vec(&spans_a), b"AAAA");
        drop(spans_a);

        rb.write(4, b"BBBB", 100).unwrap();
        let (tok_b, spans_b) = rb.read_multi().unwrap();
        assert_eq!(spans_to_vec(&spans_b), b"BBBB");
        drop(spans_b);

        assert!(rb.drain_token(tok_b, 4).is_err());
        rb.drain_token(tok_a, 4).unwrap();
        rb.drain_token(tok_b, 4).unwrap();
        assert_eq!(rb.base_offset(), 8);
    }

    #[test]
    fn overlapping_rewrite_is_idempotent_quota_free() {
        let mut rb = RecvBuffer::new(RecvBufferConfig::new(16, 64).with_mode(ReadMode::Circular)).unwrap();
        rb.write(0, b"ABCDEFGH", 100).unwrap();
        let out = rb.write(0, b"ABCDEFGH", 0).unwrap();
        assert_eq!(out.quota_consumed, 0);
        assert_eq!(rb.prefix_length(), 8);
    }
}
