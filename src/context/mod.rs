//! Communicator abstraction over single-rank, threaded and MPI execution.
//!
//! A [`Context`] is a communicator of `size()` ranks. It moves typed data
//! between ranks (blocking and posted point-to-point calls) and runs
//! collective operations (broadcast, reduce, gather, scatter). Backends:
//!
//! - [`UniContext`]: one rank, every call is an identity copy.
//! - [`MtContext`]: ranks are threads sharing one monitor.
//! - `MpiContext`: native MPI, only with the `mpi-support` feature.
//!
//! Programmer errors (bad ranks, mismatched buffers, unsupported opcodes)
//! fail fast with a descriptive [`MpError`] on the rank that made them, and
//! collective argument mismatches fail on every participating rank.

pub(crate) mod collective;
pub(crate) mod monitor;
pub mod mt;
pub mod request_list;
pub mod uni;

#[cfg(feature = "mpi-support")]
pub mod mpi;

pub use mt::MtContext;
pub use request_list::RequestList;
pub use uni::UniContext;

#[cfg(feature = "mpi-support")]
pub use self::mpi::MpiContext;

use crate::data::buffer::{Buffer, BufferMut, ElemType, Element, OwnedBuffer};
use crate::data::opcode::Opcode;
use crate::data::status::Status;
use crate::mp_error::MpError;
use bytes::Bytes;

/// Chunk layout for [`Context::gather`] and [`Context::scatter`].
#[derive(Debug, Clone, Copy)]
pub enum Chunks<'a> {
    /// Every rank contributes (or receives) the same number of elements.
    Uniform,
    /// Element count per rank, indexed by rank; only the root's copy is used.
    PerRank(&'a [usize]),
}

/// Handle of a posted non-blocking operation.
///
/// Consumed by [`Context::wait`] or [`Context::cancel`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Request {
    id: u64,
    peer: usize,
}

impl Request {
    pub(crate) fn new(id: u64, peer: usize) -> Self {
        Self { id, peer }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Destination of a posted send, source of a posted receive.
    pub fn peer(&self) -> usize {
        self.peer
    }
}

/// Result of waiting on (or testing) a request.
#[derive(Debug)]
pub struct Completion {
    pub status: Status,
    /// Received payload; `None` for sends and for pending requests.
    pub data: Option<OwnedBuffer>,
}

impl Completion {
    pub(crate) fn sent(dest: usize, count: usize) -> Self {
        Self {
            status: Status::complete(dest, count),
            data: None,
        }
    }

    pub(crate) fn received(source: usize, data: OwnedBuffer) -> Self {
        Self {
            status: Status::complete(source, data.len()),
            data: Some(data),
        }
    }

    pub(crate) fn pending(peer: usize) -> Self {
        Self {
            status: Status::pending(peer),
            data: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.complete
    }
}

/// Point-to-point and collective communication among `size()` ranks.
///
/// All calls block until complete (or until the communicator is aborted),
/// except the posted variants which return a [`Request`] immediately.
pub trait Context {
    fn size(&self) -> usize;

    /// This rank, in `[0, size)`.
    fn rank(&self) -> usize;

    /// Blocking send of `buf` to `dest`.
    ///
    /// Sends from one rank to one destination are received in send order.
    /// An empty buffer returns immediately.
    fn send(&self, buf: Buffer<'_>, dest: usize) -> Result<(), MpError>;

    /// Blocking receive from `source` into `buf`.
    ///
    /// Returns the number of elements received, which may be less than the
    /// capacity of `buf`. A message longer than `buf` fails with
    /// [`MpError::Truncated`]. An empty buffer returns immediately.
    fn recv(&self, buf: BufferMut<'_>, source: usize) -> Result<Status, MpError>;

    /// After the call every rank's `buf` holds `root`'s contents.
    fn bcast(&self, buf: BufferMut<'_>, root: usize) -> Result<(), MpError>;

    /// Elementwise fold of every rank's `send` with `op`, delivered to `root`.
    ///
    /// Non-root ranks may pass an empty `recv`.
    fn reduce(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        op: Opcode,
        root: usize,
    ) -> Result<(), MpError>;

    /// Like [`reduce`](Context::reduce) with the result delivered everywhere.
    fn all_reduce(&self, send: Buffer<'_>, recv: BufferMut<'_>, op: Opcode) -> Result<(), MpError>;

    /// Concatenate every rank's `send` into `recv` on `root`, in rank order.
    fn gather(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        chunks: Chunks<'_>,
        root: usize,
    ) -> Result<(), MpError>;

    /// Split `root`'s `send` into per-rank chunks delivered into each `recv`.
    fn scatter(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        chunks: Chunks<'_>,
        root: usize,
    ) -> Result<(), MpError>;

    /// Uniform gather delivered to every rank.
    fn all_gather(&self, send: Buffer<'_>, recv: BufferMut<'_>) -> Result<(), MpError>;

    fn barrier(&self) -> Result<(), MpError>;

    /// Start a send of an owned payload; never blocks.
    fn post_send(&self, data: OwnedBuffer, dest: usize) -> Result<Request, MpError>;

    /// Start a receive of at most `capacity` elements of `elem` from `source`.
    fn post_recv(&self, elem: ElemType, capacity: usize, source: usize) -> Result<Request, MpError>;

    /// Block until the request completes.
    fn wait(&self, req: Request) -> Result<Completion, MpError>;

    /// Poll a request. A complete result retires the request; later calls
    /// with the same handle fail with [`MpError::UnknownRequest`].
    fn test(&self, req: &Request) -> Result<Completion, MpError>;

    /// Withdraw a posted request.
    ///
    /// Returns `true` if it was withdrawn before matching a peer, `false` if
    /// it had already matched (its result is discarded). The request is
    /// retired either way.
    fn cancel(&self, req: Request) -> Result<bool, MpError>;

    /// Poison the communicator: every rank blocked in, or later entering, a
    /// communication call fails.
    fn abort(&self, reason: &str);

    /// Fail if this rank has been cancelled or the communicator aborted.
    fn checkpoint(&self) -> Result<(), MpError> {
        Ok(())
    }
}

/// Typed conveniences over any [`Context`].
pub trait ContextExt: Context {
    fn send_slice<T: Element>(&self, data: &[T], dest: usize) -> Result<(), MpError> {
        self.send(Buffer::from_slice(data), dest)
    }

    fn recv_slice<T: Element>(&self, data: &mut [T], source: usize) -> Result<Status, MpError> {
        self.recv(BufferMut::from_slice(data), source)
    }

    fn bcast_slice<T: Element>(&self, data: &mut [T], root: usize) -> Result<(), MpError> {
        self.bcast(BufferMut::from_slice(data), root)
    }

    /// All-reduce of a single value.
    fn all_reduce_scalar<T: Element>(&self, value: T, op: Opcode) -> Result<T, MpError> {
        let send = [value];
        let mut out = [value];
        self.all_reduce(Buffer::from_slice(&send), BufferMut::from_slice(&mut out), op)?;
        Ok(out[0])
    }

    fn sum<T: Element>(&self, value: T) -> Result<T, MpError> {
        self.all_reduce_scalar(value, Opcode::Sum)
    }

    fn max<T: Element>(&self, value: T) -> Result<T, MpError> {
        self.all_reduce_scalar(value, Opcode::Max)
    }

    fn min<T: Element>(&self, value: T) -> Result<T, MpError> {
        self.all_reduce_scalar(value, Opcode::Min)
    }
}

impl<C: Context + ?Sized> ContextExt for C {}

/// A message in flight: payload plus element type and a sender-side id.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub id: u64,
    pub elem: ElemType,
    pub data: Bytes,
}

impl Envelope {
    /// Copy into a receive buffer, checking type and capacity.
    pub fn deliver(&self, buf: &mut BufferMut<'_>, from: usize) -> Result<Status, MpError> {
        let count = buf.fill(&self.data, self.elem, from)?;
        Ok(Status::complete(from, count))
    }

    /// Check that a receive of `capacity` `elem`s can take this message
    /// whole. Nothing is consumed either way.
    pub fn fits(&self, elem: ElemType, capacity: usize, from: usize) -> Result<(), MpError> {
        if self.elem != elem {
            return Err(MpError::TypeMismatch {
                expected: elem,
                actual: self.elem,
            });
        }
        let sent = self.elem.elements_in(self.data.len())?;
        if sent > capacity {
            return Err(MpError::Truncated { from, sent, capacity });
        }
        Ok(())
    }

    /// Turn into an owned payload for a posted receive of `capacity` elements.
    pub fn into_completion(
        self,
        elem: ElemType,
        capacity: usize,
        from: usize,
    ) -> Result<Completion, MpError> {
        self.fits(elem, capacity, from)?;
        let data = OwnedBuffer::from_bytes(self.data.to_vec(), elem)?;
        Ok(Completion::received(from, data))
    }
}

pub(crate) fn check_rank(rank: usize, size: usize) -> Result<(), MpError> {
    if rank < size {
        Ok(())
    } else {
        Err(MpError::InvalidRank { rank, size })
    }
}
