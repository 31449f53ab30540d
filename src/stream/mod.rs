//! Byte streams over collectives.
//!
//! [`BcastReader`] reads a source on one root rank and hands every rank the
//! same bytes. [`GatherWriter`] collects every rank's output and writes it,
//! in ascending rank order, on one root rank. Both open with a collective
//! handshake: the root reports whether its resource opened before any data
//! moves, so a failed open never leaves the other ranks waiting.

pub mod bcast;
pub mod gather;

pub use bcast::BcastReader;
pub use gather::GatherWriter;

use crate::context::{Context, check_rank};
use crate::data::buffer::{BufferMut, ElemType};
use crate::mp_error::MpError;
use crate::wire::{OpenStatus, WIRE_VERSION, cast_slice_mut};
use bytemuck::Zeroable;
use std::io;

/// Broadcast the root's open status; every rank learns whether it succeeded.
fn handshake(ctx: &dyn Context, root: usize, ok: bool) -> Result<bool, MpError> {
    check_rank(root, ctx.size())?;
    let mut status = [if ctx.rank() == root {
        OpenStatus::new(ok)
    } else {
        OpenStatus::zeroed()
    }];
    ctx.bcast(BufferMut::from_bytes(cast_slice_mut(&mut status), ElemType::U8)?, root)?;
    if status[0].version() != WIRE_VERSION {
        return Err(MpError::CollectiveMismatch(format!(
            "stream wire version {} on root {root}, {WIRE_VERSION} here",
            status[0].version()
        )));
    }
    Ok(status[0].ok())
}

/// Open a stream collectively.
///
/// `local` is the root's own open result (ignored elsewhere). The root gets
/// its I/O error back, the other ranks get [`MpError::RemoteIo`].
fn open_collective<T>(
    ctx: &dyn Context,
    root: usize,
    local: Option<io::Result<T>>,
) -> Result<Option<T>, MpError> {
    let (resource, err) = match local {
        Some(Ok(r)) => (Some(r), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let is_root = ctx.rank() == root;
    let ok = !is_root || resource.is_some();
    if handshake(ctx, root, ok)? {
        return Ok(resource);
    }
    if is_root {
        let e = err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "root rank has no stream resource")
        });
        log::warn!("stream root {root} failed to open: {e}");
        Err(MpError::Io(e))
    } else {
        Err(MpError::RemoteIo { root })
    }
}
