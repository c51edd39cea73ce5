use std::io::{self, Read, Write};

/// Outcome of a single `recv` attempt against a non-blocking source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes were appended to the buffer.
    Received(usize),
    /// The buffer had no free space; the fd was not touched.
    Full,
    /// The underlying read would have blocked.
    WouldBlock,
    /// A zero-length read: the peer closed its write side.
    Disconnected,
}

/// Outcome of a single `send` attempt against a non-blocking sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// `n` bytes were written out of the buffer.
    Sent(usize),
    /// There was nothing queued to send.
    Empty,
    /// The underlying write would have blocked.
    WouldBlock,
    /// The peer has gone away.
    Disconnected,
}

/// A fixed-capacity ring of bytes that always hands the OS a single
/// contiguous span for `read`/`write`, compacting itself when the wrap
/// would otherwise split the span in two.
pub struct CyclicBuffer {
    data: Box<[u8]>,
    start: usize,
    count: usize,
}

impl CyclicBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity].into_boxed_slice(), start: 0, count: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.data.len()
    }

    pub fn free_space(&self) -> usize {
        self.data.len() - self.count
    }

    fn write_cursor(&self) -> usize {
        (self.start + self.count) % self.data.len()
    }

    pub fn contiguous_readable(&self) -> usize {
        (self.data.len() - self.start).min(self.count)
    }

    pub fn contiguous_writable(&self) -> usize {
        let free = self.free_space();
        let until_wrap = self.data.len() - self.write_cursor();
        until_wrap.min(free)
    }

    /// Moves all readable bytes to offset 0, so `contiguous_readable` becomes
    /// equal to `count` and `readable_slice` exposes everything at once.
    pub fn make_contiguous(&mut self) {
        if self.start == 0 || self.count == 0 {
            self.start = 0;
            return;
        }
        let mut rotated = vec![0u8; self.count];
        let first = self.contiguous_readable();
        rotated[..first].copy_from_slice(&self.data[self.start..self.start + first]);
        if first < self.count {
            rotated[first..].copy_from_slice(&self.data[..self.count - first]);
        }
        self.data[..self.count].copy_from_slice(&rotated);
        self.start = 0;
    }

    /// The contiguous readable prefix. Call `make_contiguous` first to see
    /// the whole buffer in one slice regardless of current wrap position.
    pub fn readable_slice(&self) -> &[u8] {
        let n = self.contiguous_readable();
        &self.data[self.start..self.start + n]
    }

    pub fn peek(&self) -> Option<u8> {
        if self.count == 0 { None } else { Some(self.data[self.start]) }
    }

    pub fn getc(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.skip(1);
        Some(b)
    }

    pub fn putc(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        let at = self.write_cursor();
        self.data[at] = byte;
        self.count += 1;
        true
    }

    /// Writes as much of `bytes` as fits, returning the number written.
    pub fn puts(&mut self, bytes: &[u8]) -> usize {
        let mut n = 0;
        for &b in bytes {
            if !self.putc(b) {
                break;
            }
            n += 1;
        }
        n
    }

    /// Reads up to `out.len()` bytes into `out`, returning the number read.
    pub fn gets(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        for slot in out.iter_mut() {
            match self.getc() {
                Some(b) => {
                    *slot = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Advances the read cursor by `n` bytes (consuming them without
    /// copying them out). `n` is clamped to `count`.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.count);
        self.start = (self.start + n) % self.data.len().max(1);
        self.count -= n;
        if self.count == 0 {
            self.start = 0;
        }
    }

    /// Advances the write cursor by `n` bytes after a caller has written
    /// directly into the contiguous-writable window returned by a prior
    /// call. `n` is clamped to the available free space.
    pub fn skip_right(&mut self, n: usize) {
        self.count += n.min(self.free_space());
    }

    /// Reads from `src` into the buffer's free space. Compacts first if the
    /// free space is split by the wrap, so the read always targets one span.
    pub fn recv<R: Read>(&mut self, src: &mut R) -> io::Result<RecvOutcome> {
        if self.is_full() {
            return Ok(RecvOutcome::Full);
        }
        if self.contiguous_writable() == 0 {
            self.make_contiguous();
        }
        let at = self.write_cursor();
        let room = self.contiguous_writable();
        match src.read(&mut self.data[at..at + room]) {
            Ok(0) => Ok(RecvOutcome::Disconnected),
            Ok(n) => {
                self.count += n;
                Ok(RecvOutcome::Received(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Writes the readable region to `dst`. Compacts first if the data
    /// wraps, so the write always covers the whole readable region in one
    /// contiguous span — required by the framing layer, which forbids a
    /// frame byte ever being split across two `write` calls.
    pub fn send<W: Write>(&mut self, dst: &mut W) -> io::Result<SendOutcome> {
        if self.is_empty() {
            return Ok(SendOutcome::Empty);
        }
        if self.contiguous_readable() < self.count {
            self.make_contiguous();
        }
        match dst.write(self.readable_slice()) {
            Ok(0) => Ok(SendOutcome::Disconnected),
            Ok(n) => {
                self.skip(n);
                Ok(SendOutcome::Sent(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(SendOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn putc_getc_roundtrip() {
        let mut cb = CyclicBuffer::new(4);
        assert!(cb.putc(1));
        assert!(cb.putc(2));
        assert_eq!(cb.getc(), Some(1));
        assert_eq!(cb.getc(), Some(2));
        assert_eq!(cb.getc(), None);
    }

    #[test]
    fn full_buffer_rejects_putc() {
        let mut cb = CyclicBuffer::new(2);
        assert!(cb.putc(1));
        assert!(cb.putc(2));
        assert!(!cb.putc(3));
        assert_eq!(cb.len(), 2);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let mut cb = CyclicBuffer::new(4);
        cb.puts(&[1, 2, 3]);
        cb.skip(2); // start now at 2, count 1
        cb.puts(&[4, 5, 6]); // wraps: writes at index 3, then 0, then 1
        let mut out = [0u8; 4];
        let n = cb.gets(&mut out);
        assert_eq!(&out[..n], &[3, 4, 5, 6]);
    }

    #[test]
    fn make_contiguous_exposes_full_region() {
        let mut cb = CyclicBuffer::new(4);
        cb.puts(&[1, 2, 3]);
        cb.skip(2);
        cb.puts(&[4, 5]);
        cb.make_contiguous();
        assert_eq!(cb.readable_slice(), &[3, 4, 5]);
    }

    #[test]
    fn recv_on_full_buffer_does_not_touch_source() {
        struct PoisonRead;
        impl Read for PoisonRead {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                panic!("recv must not read from a full buffer");
            }
        }
        let mut cb = CyclicBuffer::new(2);
        cb.puts(&[1, 2]);
        let outcome = cb.recv(&mut PoisonRead).unwrap();
        assert_eq!(outcome, RecvOutcome::Full);
        assert_eq!(cb.len(), 2);
    }

    #[test]
    fn send_compacts_wrapped_data_before_write() {
        let mut cb = CyclicBuffer::new(4);
        cb.puts(&[1, 2, 3]);
        cb.skip(2);
        cb.puts(&[4, 5]);
        let mut out = Vec::new();
        let outcome = cb.send(&mut out).unwrap();
        assert_eq!(outcome, SendOutcome::Sent(3));
        assert_eq!(out, vec![3, 4, 5]);
        assert!(cb.is_empty());
    }

    #[test]
    fn invariants_hold_under_fuzzed_sequence() {
        let mut cb = CyclicBuffer::new(8);
        let mut model: Vec<u8> = Vec::new();
        let mut next: u8 = 0;
        for step in 0..200 {
            assert!(cb.len() <= cb.capacity());
            if step % 3 == 0 && !model.is_empty() {
                let take = (step % model.len().max(1)).max(1).min(model.len());
                let mut out = vec![0u8; take];
                let n = cb.gets(&mut out);
                assert_eq!(&model[..n], &out[..n]);
                model.drain(..n);
            } else {
                let b = next;
                next = next.wrapping_add(1);
                if cb.putc(b) {
                    model.push(b);
                }
            }
        }
    }
}
