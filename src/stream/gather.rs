use crate::context::{Chunks, Context};
use crate::data::buffer::{Buffer, BufferMut, ElemType};
use crate::mp_error::MpError;
use crate::stream::open_collective;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Collects every rank's writes into one sink on the root.
///
/// `write` only appends to a private buffer. `flush` is collective: the
/// per-rank lengths are gathered first, then the payloads, and the root
/// writes them to its sink in ascending rank order. Non-root ranks produce no
/// local output.
pub struct GatherWriter<'c, W: Write> {
    ctx: &'c dyn Context,
    root: usize,
    sink: Option<W>,
    pending: Vec<u8>,
}

impl<'c, W: Write> GatherWriter<'c, W> {
    /// Collective open; `sink` must be `Some` on the root and is ignored
    /// elsewhere.
    pub fn open(ctx: &'c dyn Context, root: usize, sink: Option<W>) -> Result<Self, MpError> {
        let sink = open_collective(ctx, root, sink.map(Ok))?;
        Ok(Self::ready(ctx, root, sink))
    }

    fn ready(ctx: &'c dyn Context, root: usize, sink: Option<W>) -> Self {
        Self {
            ctx,
            root,
            sink: if ctx.rank() == root { sink } else { None },
            pending: Vec::new(),
        }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    /// Bytes written on this rank since the last flush.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Collective flush of every rank's pending bytes to the root's sink.
    pub fn flush_all(&mut self) -> Result<(), MpError> {
        let size = self.ctx.size();
        let is_root = self.ctx.rank() == self.root;
        let mine = [self.pending.len() as u64];
        let mut lengths = vec![0u64; if is_root { size } else { 0 }];
        self.ctx.gather(
            Buffer::from_slice(&mine),
            BufferMut::from_slice(&mut lengths),
            Chunks::Uniform,
            self.root,
        )?;
        let counts: Vec<usize> = lengths.iter().map(|&n| n as usize).collect();
        let mut merged = vec![0u8; counts.iter().sum()];
        self.ctx.gather(
            Buffer::from_slice(&self.pending),
            if is_root {
                BufferMut::from_slice(&mut merged)
            } else {
                BufferMut::empty(ElemType::U8)
            },
            Chunks::PerRank(&counts),
            self.root,
        )?;
        log::trace!(
            "rank {} flushed {} bytes to root {}",
            self.ctx.rank(),
            self.pending.len(),
            self.root
        );
        self.pending.clear();
        if let Some(sink) = self.sink.as_mut() {
            sink.write_all(&merged)?;
            sink.flush()?;
        }
        Ok(())
    }

    /// Collective final flush; the sink is returned on the root.
    pub fn finish(mut self) -> Result<Option<W>, MpError> {
        self.flush_all()?;
        Ok(self.sink.take())
    }
}

impl<'c> GatherWriter<'c, File> {
    /// Collective create of `path` on the root.
    pub fn create_file(
        ctx: &'c dyn Context,
        root: usize,
        path: impl AsRef<Path>,
    ) -> Result<Self, MpError> {
        let local = (ctx.rank() == root).then(|| File::create(path.as_ref()));
        let sink = open_collective(ctx, root, local)?;
        Ok(Self::ready(ctx, root, sink))
    }
}

impl<W: Write> Write for GatherWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Collective, see [`GatherWriter::flush_all`].
    fn flush(&mut self) -> io::Result<()> {
        self.flush_all().map_err(io::Error::other)
    }
}

impl<W: Write> Drop for GatherWriter<'_, W> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!(
                "rank {} dropped a gather stream with {} unflushed bytes",
                self.ctx.rank(),
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UniContext;

    #[test]
    fn single_rank_passes_through() {
        let ctx = UniContext::new();
        let mut w = GatherWriter::open(&ctx, 0, Some(Vec::new())).unwrap();
        w.write_all(b"abc").unwrap();
        w.flush().unwrap();
        w.write_all(b"def").unwrap();
        assert_eq!(w.pending(), 3);
        let out = w.finish().unwrap().unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn root_without_sink_fails() {
        let ctx = UniContext::new();
        assert!(matches!(
            GatherWriter::<Vec<u8>>::open(&ctx, 0, None),
            Err(MpError::Io(_))
        ));
    }
}
