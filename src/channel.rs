//! Stream endpoints bound to one peer rank.
//!
//! [`OutputChannel`] and [`InputChannel`] wrap the point-to-point calls of a
//! [`Context`] for callers that want stream semantics. Typed buffers go
//! through `send`/`recv` unchanged. Byte streams are framed: every
//! `write` becomes a [`FrameLen`] header followed by the payload, and
//! `close` sends an end-of-stream frame, so the reader can serve short reads
//! from a partially consumed frame and report EOF.

use crate::context::{Context, check_rank};
use crate::data::buffer::{Buffer, BufferMut, ElemType};
use crate::mp_error::MpError;
use crate::wire::{FrameLen, cast_slice, cast_slice_mut};
use bytemuck::Zeroable;
use std::io;

/// Sending side of a link to `peer`.
pub struct OutputChannel<'c> {
    ctx: &'c dyn Context,
    peer: usize,
}

impl<'c> OutputChannel<'c> {
    pub fn new(ctx: &'c dyn Context, peer: usize) -> Result<Self, MpError> {
        check_rank(peer, ctx.size())?;
        Ok(Self { ctx, peer })
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    /// Blocking send of a typed buffer.
    pub fn send(&self, buf: Buffer<'_>) -> Result<(), MpError> {
        self.ctx.send(buf, self.peer)
    }

    /// Send `bytes` as one frame. An empty slice sends nothing.
    pub fn write_frame(&self, bytes: &[u8]) -> Result<(), MpError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let header = [FrameLen::new(bytes.len())];
        self.ctx.send(Buffer::from_bytes(cast_slice(&header), ElemType::U8)?, self.peer)?;
        self.ctx.send(Buffer::from_slice(bytes), self.peer)
    }

    /// Send the end-of-stream frame.
    pub fn close(&self) -> Result<(), MpError> {
        let header = [FrameLen::end()];
        self.ctx.send(Buffer::from_bytes(cast_slice(&header), ElemType::U8)?, self.peer)
    }
}

impl io::Write for OutputChannel<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_frame(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiving side of a link from `peer`.
pub struct InputChannel<'c> {
    ctx: &'c dyn Context,
    peer: usize,
    frame: Vec<u8>,
    cursor: usize,
    eof: bool,
}

impl<'c> InputChannel<'c> {
    pub fn new(ctx: &'c dyn Context, peer: usize) -> Result<Self, MpError> {
        check_rank(peer, ctx.size())?;
        Ok(Self {
            ctx,
            peer,
            frame: Vec::new(),
            cursor: 0,
            eof: false,
        })
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    /// Blocking receive into a typed buffer; returns the element count
    /// actually received.
    pub fn recv(&self, buf: BufferMut<'_>) -> Result<usize, MpError> {
        self.ctx.recv(buf, self.peer).map(|st| st.count)
    }

    /// Next frame, or `None` once the peer closed the stream.
    ///
    /// Bytes of a frame partially consumed through `io::Read` are returned
    /// first.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, MpError> {
        if self.cursor < self.frame.len() {
            let rest = self.frame.split_off(self.cursor);
            self.frame.clear();
            self.cursor = 0;
            return Ok(Some(rest));
        }
        if self.eof {
            return Ok(None);
        }
        let mut header = [FrameLen::zeroed()];
        let got = self.ctx.recv(
            BufferMut::from_bytes(cast_slice_mut(&mut header), ElemType::U8)?,
            self.peer,
        )?;
        if got.count != std::mem::size_of::<FrameLen>() {
            return Err(MpError::LengthMismatch {
                what: "channel frame header",
                expected: std::mem::size_of::<FrameLen>(),
                actual: got.count,
            });
        }
        if header[0].is_end() {
            self.eof = true;
            return Ok(None);
        }
        let len = header[0].get();
        let mut payload = vec![0u8; len];
        let got = self.ctx.recv(BufferMut::from_slice(&mut payload), self.peer)?;
        if got.count != len {
            return Err(MpError::LengthMismatch {
                what: "channel frame payload",
                expected: len,
                actual: got.count,
            });
        }
        Ok(Some(payload))
    }

    /// `true` once the end-of-stream frame has been received.
    pub fn is_eof(&self) -> bool {
        self.eof && self.cursor >= self.frame.len()
    }
}

impl io::Read for InputChannel<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cursor >= self.frame.len() {
            match self.read_frame().map_err(io::Error::other)? {
                Some(frame) => {
                    self.frame = frame;
                    self.cursor = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.frame.len() - self.cursor);
        buf[..n].copy_from_slice(&self.frame[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UniContext;
    use std::io::{Read, Write};

    #[test]
    fn frames_survive_short_reads() {
        let ctx = UniContext::new();
        let mut out = OutputChannel::new(&ctx, 0).unwrap();
        out.write_all(b"hello ").unwrap();
        out.write_all(b"world").unwrap();
        out.close().unwrap();

        let mut input = InputChannel::new(&ctx, 0).unwrap();
        let mut small = [0u8; 4];
        let n = input.read(&mut small).unwrap();
        assert_eq!(&small[..n], b"hell");
        let mut rest = String::new();
        input.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "o world");
        assert!(input.is_eof());
        assert_eq!(input.read(&mut small).unwrap(), 0);
    }

    #[test]
    fn bad_peer_rejected() {
        let ctx = UniContext::new();
        assert!(matches!(
            OutputChannel::new(&ctx, 1),
            Err(MpError::InvalidRank { rank: 1, size: 1 })
        ));
    }

    #[test]
    fn typed_recv_reports_count() {
        let ctx = UniContext::new();
        let out = OutputChannel::new(&ctx, 0).unwrap();
        out.send(Buffer::from_slice(&[1.5f64, 2.5])).unwrap();
        let input = InputChannel::new(&ctx, 0).unwrap();
        let mut buf = [0.0f64; 8];
        assert_eq!(input.recv(BufferMut::from_slice(&mut buf)).unwrap(), 2);
        assert_eq!(&buf[..2], &[1.5, 2.5]);
    }
}
