//! `Bring`: the bounded sliding-window buffer in front of the source
//! file during delta generation.
//!
//! The buffer holds every byte read past but not yet accounted for. Two
//! regions are exposed over it: the *tail* is the current match window
//! (the last `window` bytes), the *head* is everything before it -
//! literal data waiting to be emitted. Consuming operations only ever
//! drop bytes from the front.

use std::io::{self, Read};

use bytes::{Buf, Bytes, BytesMut};

/// Least power of two greater than or equal to `n`, for `n >= 1`.
pub fn roundup_power_of_2(n: usize) -> usize {
    n.next_power_of_two()
}

pub struct Bring<R> {
    r: R,
    buf: BytesMut,
    window: usize,
}

impl<R: Read> Bring<R> {
    pub fn new(r: R, window: usize) -> Self {
        Self {
            r,
            buf: BytesMut::with_capacity(roundup_power_of_2(2 * window + 1)),
            window,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.r
    }

    /// Reads up to `want` bytes from upstream, teeing them into the
    /// buffer. Returns the number of bytes read; 0 means EOF.
    pub fn fill(&mut self, want: usize) -> io::Result<usize> {
        let old = self.buf.len();
        self.buf.resize(old + want, 0);
        let mut n = 0;
        while n < want {
            match self.r.read(&mut self.buf[old + n..old + want]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old);
                    return Err(e);
                }
            }
        }
        self.buf.truncate(old + n);
        Ok(n)
    }

    /// Reads one byte, sliding the window forward. Returns the incoming
    /// byte and the byte leaving the window, or `None` at EOF. With a
    /// short window (near EOF) the leaving byte is the oldest buffered
    /// one.
    pub fn read_byte(&mut self) -> io::Result<Option<(u8, u8)>> {
        let mut b = [0u8; 1];
        loop {
            match self.r.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let out = self.buf[self.buf.len().saturating_sub(self.window)];
        self.buf.extend_from_slice(&b);
        Ok(Some((b[0], out)))
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Length of the pending-literal region.
    pub fn head_len(&self) -> usize {
        self.buf.len().saturating_sub(self.window)
    }

    /// Non-consuming view of the pending-literal region.
    pub fn head(&self) -> &[u8] {
        &self.buf[..self.head_len()]
    }

    /// Non-consuming view of the match window: the last `window` bytes,
    /// or everything buffered if less is available.
    pub fn tail(&self) -> &[u8] {
        let tail_len = self.buf.len().min(self.window);
        &self.buf[self.buf.len() - tail_len..]
    }

    /// Consumes up to `n` bytes from the front of the head region.
    pub fn take_head(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.head_len());
        self.buf.split_to(n).freeze()
    }

    /// Consumes up to `n` bytes from the front of the whole buffer,
    /// window included. Used for the final flush at EOF.
    pub fn take_buffered(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Drops `n` bytes from the front, acknowledging a matched block.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.buf.advance(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_region_invariant<R: std::io::Read>(b: &Bring<R>) {
        // head + tail always account for exactly the buffered bytes
        let tail_len = b.buffered_len().min(8);
        assert_eq!(b.head_len() + tail_len, b.buffered_len());
    }

    #[test]
    fn test_roundup_power_of_2() {
        let cases = [(1, 1), (2, 2), (3, 4), (8, 8), (9, 16), (1025, 2048)];
        for (n, want) in cases {
            let got = roundup_power_of_2(n);
            assert_eq!(got, want, "roundup_power_of_2({n})");
            assert!(got >= n && got.is_power_of_two());
        }
    }

    #[test]
    fn test_fill_and_regions() {
        let data = b"abcdefghij";
        let mut b = Bring::new(&data[..], 8);

        assert_eq!(b.fill(8).unwrap(), 8);
        assert_eq!(b.head_len(), 0);
        assert_eq!(b.tail(), b"abcdefgh");
        assert_region_invariant(&b);

        // sliding forward grows the head one byte at a time
        assert_eq!(b.read_byte().unwrap(), Some((b'i', b'a')));
        assert_eq!(b.head(), b"a");
        assert_eq!(b.tail(), b"bcdefghi");
        assert_eq!(b.read_byte().unwrap(), Some((b'j', b'b')));
        assert_eq!(b.head(), b"ab");
        assert_region_invariant(&b);

        // EOF
        assert_eq!(b.read_byte().unwrap(), None);
    }

    #[test]
    fn test_fill_short_at_eof() {
        let data = b"xyz";
        let mut b = Bring::new(&data[..], 8);
        assert_eq!(b.fill(8).unwrap(), 3);
        assert_eq!(b.head_len(), 0);
        assert_eq!(b.tail(), b"xyz");
        assert_eq!(b.fill(8).unwrap(), 0);
    }

    #[test]
    fn test_take_head_partial() {
        let data = b"abcdefghijklmnop";
        let mut b = Bring::new(&data[..], 8);
        b.fill(8).unwrap();
        b.fill(8).unwrap();
        assert_eq!(b.head(), b"abcdefgh");

        let taken = b.take_head(3);
        assert_eq!(&taken[..], b"abc");
        assert_eq!(b.head(), b"defgh");
        assert_eq!(b.tail(), b"ijklmnop");
        assert_region_invariant(&b);
    }

    #[test]
    fn test_skip_drops_from_front() {
        let data = b"abcdefgh";
        let mut b = Bring::new(&data[..], 8);
        b.fill(8).unwrap();
        b.skip(8);
        assert_eq!(b.buffered_len(), 0);
        assert_eq!(b.fill(8).unwrap(), 0);
    }

    #[test]
    fn test_take_buffered_drains_window() {
        let data = b"abcde";
        let mut b = Bring::new(&data[..], 8);
        b.fill(8).unwrap();
        let rest = b.take_buffered(5);
        assert_eq!(&rest[..], b"abcde");
        assert_eq!(b.buffered_len(), 0);
    }
}
