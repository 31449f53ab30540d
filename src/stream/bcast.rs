use crate::config::config;
use crate::context::Context;
use crate::data::buffer::{BufferMut, ElemType};
use crate::mp_error::MpError;
use crate::stream::open_collective;
use crate::wire::{ChunkHeader, cast_slice_mut};
use bytemuck::Zeroable;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Reads `R` on the root and delivers the same bytes to every rank.
///
/// Every `read` that needs more data is a collective refill: the root reads
/// up to `chunk_size` bytes and broadcasts a [`ChunkHeader`] followed by the
/// payload. End of input travels in the header, so all ranks reach EOF after
/// the same number of bytes however they size their reads. All ranks must
/// read the stream to the end (or drop it together).
pub struct BcastReader<'c, R: Read> {
    ctx: &'c dyn Context,
    root: usize,
    source: Option<R>,
    chunk_size: usize,
    chunk: Vec<u8>,
    cursor: usize,
    eof: bool,
    failed: bool,
}

impl<'c, R: Read> BcastReader<'c, R> {
    /// Collective open; `source` must be `Some` on the root and is ignored
    /// elsewhere.
    pub fn open(ctx: &'c dyn Context, root: usize, source: Option<R>) -> Result<Self, MpError> {
        let source = open_collective(ctx, root, source.map(Ok))?;
        Ok(Self::ready(ctx, root, source))
    }

    fn ready(ctx: &'c dyn Context, root: usize, source: Option<R>) -> Self {
        Self {
            ctx,
            root,
            source: if ctx.rank() == root { source } else { None },
            chunk_size: config().stream_chunk_size,
            chunk: Vec::new(),
            cursor: 0,
            eof: false,
            failed: false,
        }
    }

    /// Bytes the root reads per refill. Only the root's value matters.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn root(&self) -> usize {
        self.root
    }

    fn is_root(&self) -> bool {
        self.ctx.rank() == self.root
    }

    /// Fill a chunk from the source, up to `chunk_size` bytes.
    fn fill_from_source(&mut self) -> io::Result<(Vec<u8>, bool)> {
        let mut data = vec![0u8; self.chunk_size];
        let mut filled = 0;
        let Some(source) = self.source.as_mut() else {
            return Ok((Vec::new(), true));
        };
        while filled < data.len() {
            match source.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        data.truncate(filled);
        let eof = filled < self.chunk_size;
        Ok((data, eof))
    }

    /// Collective refill of the current chunk.
    fn refill(&mut self) -> Result<(), MpError> {
        let mut local_err = None;
        let mut header = [ChunkHeader::zeroed()];
        let mut data = Vec::new();
        if self.is_root() {
            match self.fill_from_source() {
                Ok((bytes, eof)) => {
                    header[0] = ChunkHeader::data(bytes.len(), eof);
                    data = bytes;
                }
                Err(e) => {
                    header[0] = ChunkHeader::error();
                    local_err = Some(e);
                }
            }
        }
        self.ctx.bcast(
            BufferMut::from_bytes(cast_slice_mut(&mut header), ElemType::U8)?,
            self.root,
        )?;
        if header[0].is_error() {
            self.failed = true;
            return Err(match local_err {
                Some(e) => MpError::Io(e),
                None => MpError::RemoteIo { root: self.root },
            });
        }
        if !self.is_root() {
            data = vec![0u8; header[0].len()];
        }
        // Both sides know the length now; an empty chunk still stays in step.
        self.ctx.bcast(BufferMut::from_slice(&mut data), self.root)?;
        log::trace!(
            "rank {} refilled {} bytes (eof={})",
            self.ctx.rank(),
            data.len(),
            header[0].is_eof()
        );
        self.chunk = data;
        self.cursor = 0;
        self.eof = header[0].is_eof();
        Ok(())
    }
}

impl<'c> BcastReader<'c, File> {
    /// Collective open of `path` on the root.
    pub fn open_file(
        ctx: &'c dyn Context,
        root: usize,
        path: impl AsRef<Path>,
    ) -> Result<Self, MpError> {
        let local = (ctx.rank() == root).then(|| File::open(path.as_ref()));
        let source = open_collective(ctx, root, local)?;
        Ok(Self::ready(ctx, root, source))
    }
}

impl<R: Read> Read for BcastReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::other("broadcast stream failed earlier"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        while self.cursor >= self.chunk.len() {
            if self.eof {
                return Ok(0);
            }
            self.refill().map_err(io::Error::other)?;
        }
        let n = buf.len().min(self.chunk.len() - self.cursor);
        buf[..n].copy_from_slice(&self.chunk[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}
