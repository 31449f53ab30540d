//! Native MPI context (feature `mpi-support`).
//!
//! Point-to-point payloads travel as bytes tagged with their element type;
//! receivers probe first so that oversized or mistyped messages fail with
//! the same errors as the in-process backends and stay queued for the next
//! receive. Posted receives are matched when waited or tested, in posting
//! order per source; posted sends are native non-blocking sends. Empty
//! posts complete at once without touching MPI. Reductions run on typed
//! slices so the native reduction operators apply.

use crate::context::request_list::RequestList;
use crate::context::{Chunks, Completion, Context, Request, check_rank};
use crate::data::buffer::{Buffer, BufferMut, ElemType, OwnedBuffer, with_elem_type};
use crate::data::opcode::Opcode;
use crate::data::status::Status;
use crate::mp_error::MpError;
use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::request::{Request as MpiRequest, StaticScope};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::{Count, Rank, Tag};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

fn elem_tag(elem: ElemType) -> Tag {
    ElemType::ALL.iter().position(|e| *e == elem).unwrap_or(0) as Tag + 1
}

fn tag_elem(tag: Tag) -> Option<ElemType> {
    usize::try_from(tag - 1).ok().and_then(|i| ElemType::ALL.get(i).copied())
}

fn system_op(op: Opcode) -> SystemOperation {
    match op {
        Opcode::Sum => SystemOperation::sum(),
        Opcode::Prod => SystemOperation::product(),
        Opcode::Min => SystemOperation::min(),
        Opcode::Max => SystemOperation::max(),
        Opcode::Bor => SystemOperation::bitwise_or(),
        Opcode::Band => SystemOperation::bitwise_and(),
        Opcode::Lor => SystemOperation::logical_or(),
        Opcode::Land => SystemOperation::logical_and(),
    }
}

fn counts_and_displs(counts: &[usize], esz: usize) -> (Vec<Count>, Vec<Count>) {
    let bytes: Vec<Count> = counts.iter().map(|c| (c * esz) as Count).collect();
    let displs = bytes
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect();
    (bytes, displs)
}

/// Length and element type as seen by every rank of a collective, folded
/// with a max-reduction. Minima travel complemented.
fn agreement(elem: ElemType, len: usize) -> [u64; 4] {
    let tag = elem_tag(elem) as u64;
    [len as u64, u64::MAX - len as u64, tag, u64::MAX - tag]
}

fn check_agreement(what: &'static str, folded: [u64; 4]) -> Result<(), MpError> {
    let (max, min) = (folded[0], u64::MAX - folded[1]);
    if max != min {
        return Err(MpError::CollectiveMismatch(format!(
            "{what}: ranks disagree on length ({min}..={max} elements)"
        )));
    }
    let (max_tag, min_tag) = (folded[2], u64::MAX - folded[3]);
    if max_tag != min_tag {
        let name = |tag: u64| tag_elem(tag as Tag).map_or("unknown", |e| e.name());
        return Err(MpError::CollectiveMismatch(format!(
            "{what}: ranks disagree on element type ({} vs {})",
            name(min_tag),
            name(max_tag)
        )));
    }
    Ok(())
}

/// Check a message announced by `status` against a receive of `capacity`
/// `elem`s from `source`; returns its length in bytes. Nothing is received.
fn accept(
    status: &mpi::point_to_point::Status,
    elem: ElemType,
    capacity: usize,
    source: usize,
) -> Result<usize, MpError> {
    let actual = tag_elem(status.tag()).unwrap_or(elem);
    if actual != elem {
        return Err(MpError::TypeMismatch { expected: elem, actual });
    }
    let len = status.count(u8::equivalent_datatype()) as usize;
    let sent = elem.elements_in(len)?;
    if sent > capacity {
        return Err(MpError::Truncated { from: source, sent, capacity });
    }
    Ok(len)
}

/// A native non-blocking send.
struct InFlight {
    request: MpiRequest<'static, [u8], StaticScope>,
    /// Leaked at post time; reclaimed exactly once when the entry retires.
    buffer: *mut [u8],
    elem: ElemType,
    dest: usize,
}

impl InFlight {
    /// Reclaim the payload of a retired send.
    ///
    /// # Safety
    /// The native request must be complete (waited, tested complete or
    /// cancelled and waited), and this must be the only call for `buffer`.
    unsafe fn reclaim(buffer: *mut [u8]) -> Vec<u8> {
        // SAFETY: `buffer` came from `Box::into_raw` in `post_send` and the
        // caller guarantees MPI no longer references it.
        unsafe { Box::from_raw(buffer) }.into_vec()
    }

    fn finish(elem: ElemType, dest: usize, bytes: Vec<u8>) -> Result<Completion, MpError> {
        Ok(Completion::sent(dest, elem.elements_in(bytes.len())?))
    }

    /// Cancel unless already complete; `true` if it was withdrawn.
    fn cancel(self) -> bool {
        let withdrawn = match self.request.test() {
            Ok(_) => false,
            Err(request) => {
                request.cancel();
                request.wait();
                true
            }
        };
        // SAFETY: the request completed or was cancelled and waited out.
        drop(unsafe { Self::reclaim(self.buffer) });
        withdrawn
    }
}

enum MpiPending {
    Send(InFlight),
    /// Matched against incoming messages when waited or tested, in posting
    /// order per source.
    Recv {
        source: usize,
        elem: ElemType,
        capacity: usize,
    },
    /// Finished at post time, or matched while settling an earlier receive.
    Done(Result<Completion, MpError>),
}

/// This process's rank of `MPI_COMM_WORLD`.
///
/// Not `Sync`: the request list is only touched by the owning thread.
pub struct MpiContext {
    // Declared before `universe` so it is dropped before MPI finalizes.
    world: SimpleCommunicator,
    _universe: Universe,
    rank: usize,
    size: usize,
    requests: RefCell<RequestList<MpiPending>>,
    /// Ids of posted receives not matched yet, in posting order.
    deferred: RefCell<VecDeque<u64>>,
    next_id: Cell<u64>,
}

impl MpiContext {
    /// Initialize MPI and bind to the world communicator.
    ///
    /// # Errors
    /// `Transport` if MPI was already initialized in this process.
    pub fn new() -> Result<Self, MpError> {
        let universe = mpi::initialize().ok_or_else(|| MpError::Transport {
            rank: 0,
            detail: "MPI is already initialized".into(),
        })?;
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        log::debug!("MPI context up: rank {rank} of {size}");
        Ok(Self {
            world,
            _universe: universe,
            rank,
            size,
            requests: RefCell::new(RequestList::new()),
            deferred: RefCell::new(VecDeque::new()),
            next_id: Cell::new(1),
        })
    }

    fn process(&self, rank: usize) -> mpi::topology::Process<'_> {
        self.world.process_at_rank(rank as Rank)
    }

    /// Fail unless every rank passed the same `elem` and `len`.
    fn agree(&self, what: &'static str, elem: ElemType, len: usize) -> Result<(), MpError> {
        let mine = agreement(elem, len);
        let mut folded = [0u64; 4];
        self.world
            .all_reduce_into(&mine[..], &mut folded[..], SystemOperation::max());
        check_agreement(what, folded)
    }

    fn post(&self, pending: MpiPending, peer: usize) -> Result<Request, MpError> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.requests.borrow_mut().insert(id, pending)?;
        Ok(Request::new(id, peer))
    }

    /// Receive the next message from `source` if it fits `capacity` `elem`s.
    /// `None` when `block` is off and nothing has arrived yet; an unfit
    /// message is left for the next receive.
    fn take_message(
        &self,
        source: usize,
        elem: ElemType,
        capacity: usize,
        block: bool,
    ) -> Option<Result<Completion, MpError>> {
        let proc = self.process(source);
        let status = if block {
            proc.probe()
        } else {
            proc.immediate_probe()?
        };
        Some(accept(&status, elem, capacity, source).and_then(|len| {
            let mut bytes = vec![0u8; len];
            proc.receive_into_with_tag(&mut bytes[..], status.tag());
            Ok(Completion::received(source, OwnedBuffer::from_bytes(bytes, elem)?))
        }))
    }

    /// Match posted receives from `source` in posting order, stopping after
    /// `upto` if given. `false` if a non-blocking pass ran out of messages.
    fn settle(&self, source: usize, upto: Option<u64>, block: bool) -> Result<bool, MpError> {
        loop {
            let next = {
                let requests = self.requests.borrow();
                self.deferred.borrow().iter().find_map(|&id| match requests.get(id) {
                    Ok(&MpiPending::Recv {
                        source: s,
                        elem,
                        capacity,
                    }) if s == source => Some((id, elem, capacity)),
                    _ => None,
                })
            };
            let Some((id, elem, capacity)) = next else {
                return Ok(true);
            };
            if upto.is_some_and(|last| id > last) {
                return Ok(true);
            }
            let Some(outcome) = self.take_message(source, elem, capacity, block) else {
                return Ok(false);
            };
            if let Err(err) = &outcome {
                log::debug!("rank {} posted receive {id} failed: {err}", self.rank);
            }
            self.deferred.borrow_mut().retain(|&d| d != id);
            let mut requests = self.requests.borrow_mut();
            requests.remove(id)?;
            requests.insert(id, MpiPending::Done(outcome))?;
        }
    }

    /// Source of request `id` if it is a posted receive still unmatched.
    fn unmatched_source(&self, id: u64) -> Result<Option<usize>, MpError> {
        Ok(match self.requests.borrow().get(id)? {
            MpiPending::Recv { source, .. } => Some(*source),
            _ => None,
        })
    }

    fn reduce_impl(
        &self,
        send: Buffer<'_>,
        mut recv: BufferMut<'_>,
        op: Opcode,
        root: Option<usize>,
    ) -> Result<(), MpError> {
        op.check(send.elem_type())?;
        let receives = root.is_none_or(|r| r == self.rank);
        if receives {
            if send.elem_type() != recv.elem_type() {
                return Err(MpError::TypeMismatch {
                    expected: recv.elem_type(),
                    actual: send.elem_type(),
                });
            }
            if send.len() != recv.len() {
                return Err(MpError::LengthMismatch {
                    what: "reduce receive buffer",
                    expected: send.len(),
                    actual: recv.len(),
                });
            }
        }
        self.agree("reduce send buffer", send.elem_type(), send.len())?;
        let native = system_op(op);
        with_elem_type!(send.elem_type(), |T| {
            let mine: Vec<T> = send.to_vec()?;
            let mut out: Vec<T> = vec![bytemuck::Zeroable::zeroed(); mine.len()];
            match root {
                None => self.world.all_reduce_into(&mine[..], &mut out[..], native),
                Some(r) if r == self.rank => {
                    self.process(r).reduce_into_root(&mine[..], &mut out[..], native)
                }
                Some(r) => self.process(r).reduce_into(&mine[..], native),
            }
            if receives {
                recv.as_bytes_mut().copy_from_slice(bytemuck::cast_slice(&out[..]));
            }
        });
        Ok(())
    }
}

impl Context for MpiContext {
    fn size(&self) -> usize {
        self.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&self, buf: Buffer<'_>, dest: usize) -> Result<(), MpError> {
        check_rank(dest, self.size)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.process(dest)
            .send_with_tag(buf.as_bytes(), elem_tag(buf.elem_type()));
        Ok(())
    }

    fn recv(&self, mut buf: BufferMut<'_>, source: usize) -> Result<Status, MpError> {
        check_rank(source, self.size)?;
        if buf.is_empty() {
            return Ok(Status::complete(source, 0));
        }
        // Earlier posted receives from `source` take their messages first.
        self.settle(source, None, true)?;
        let elem = buf.elem_type();
        let proc = self.process(source);
        let status = proc.probe();
        let len = accept(&status, elem, buf.len(), source)?;
        proc.receive_into_with_tag(&mut buf.as_bytes_mut()[..len], status.tag());
        Ok(Status::complete(source, elem.elements_in(len)?))
    }

    fn bcast(&self, mut buf: BufferMut<'_>, root: usize) -> Result<(), MpError> {
        check_rank(root, self.size)?;
        self.agree("bcast buffer", buf.elem_type(), buf.len())?;
        self.process(root).broadcast_into(buf.as_bytes_mut());
        Ok(())
    }

    fn reduce(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        op: Opcode,
        root: usize,
    ) -> Result<(), MpError> {
        check_rank(root, self.size)?;
        self.reduce_impl(send, recv, op, Some(root))
    }

    fn all_reduce(&self, send: Buffer<'_>, recv: BufferMut<'_>, op: Opcode) -> Result<(), MpError> {
        self.reduce_impl(send, recv, op, None)
    }

    fn gather(
        &self,
        send: Buffer<'_>,
        mut recv: BufferMut<'_>,
        chunks: Chunks<'_>,
        root: usize,
    ) -> Result<(), MpError> {
        check_rank(root, self.size)?;
        let proc = self.process(root);
        let is_root = root == self.rank;
        match chunks {
            Chunks::Uniform => {
                self.agree("gather send chunk", send.elem_type(), send.len())?;
                if is_root {
                    let expected = send.len() * self.size;
                    if recv.len() != expected || recv.elem_type() != send.elem_type() {
                        return Err(MpError::LengthMismatch {
                            what: "gather receive buffer",
                            expected,
                            actual: recv.len(),
                        });
                    }
                    proc.gather_into_root(send.as_bytes(), recv.as_bytes_mut());
                } else {
                    proc.gather_into(send.as_bytes());
                }
            }
            Chunks::PerRank(counts) => {
                if is_root {
                    if counts.len() != self.size {
                        return Err(MpError::InvalidChunks(format!(
                            "{} counts given for {} ranks",
                            counts.len(),
                            self.size
                        )));
                    }
                    let total: usize = counts.iter().sum();
                    if recv.len() != total || counts[self.rank] != send.len() {
                        return Err(MpError::InvalidChunks(format!(
                            "counts sum to {total} for a receive buffer of {}",
                            recv.len()
                        )));
                    }
                    let (bytes, displs) = counts_and_displs(counts, send.elem_size());
                    let mut part = PartitionMut::new(recv.as_bytes_mut(), bytes, &displs[..]);
                    proc.gather_varcount_into_root(send.as_bytes(), &mut part);
                } else {
                    proc.gather_varcount_into(send.as_bytes());
                }
            }
        }
        Ok(())
    }

    fn scatter(
        &self,
        send: Buffer<'_>,
        mut recv: BufferMut<'_>,
        chunks: Chunks<'_>,
        root: usize,
    ) -> Result<(), MpError> {
        check_rank(root, self.size)?;
        let proc = self.process(root);
        let is_root = root == self.rank;
        match chunks {
            Chunks::Uniform => {
                self.agree("scatter receive buffer", recv.elem_type(), recv.len())?;
                if is_root {
                    let expected = recv.len() * self.size;
                    if send.len() != expected || recv.elem_type() != send.elem_type() {
                        return Err(MpError::LengthMismatch {
                            what: "scatter send buffer",
                            expected,
                            actual: send.len(),
                        });
                    }
                    proc.scatter_into_root(send.as_bytes(), recv.as_bytes_mut());
                } else {
                    proc.scatter_into(recv.as_bytes_mut());
                }
            }
            Chunks::PerRank(counts) => {
                if is_root {
                    let total: usize = counts.iter().sum();
                    if counts.len() != self.size || send.len() != total {
                        return Err(MpError::InvalidChunks(format!(
                            "{} counts summing to {total} for a send buffer of {} \
                             on {} ranks",
                            counts.len(),
                            send.len(),
                            self.size
                        )));
                    }
                    let (bytes, displs) = counts_and_displs(counts, send.elem_size());
                    let part = Partition::new(send.as_bytes(), bytes, &displs[..]);
                    proc.scatter_varcount_into_root(&part, recv.as_bytes_mut());
                } else {
                    proc.scatter_varcount_into(recv.as_bytes_mut());
                }
            }
        }
        Ok(())
    }

    fn all_gather(&self, send: Buffer<'_>, mut recv: BufferMut<'_>) -> Result<(), MpError> {
        let expected = send.len() * self.size;
        if recv.len() != expected || recv.elem_type() != send.elem_type() {
            return Err(MpError::LengthMismatch {
                what: "all_gather receive buffer",
                expected,
                actual: recv.len(),
            });
        }
        self.agree("all_gather send chunk", send.elem_type(), send.len())?;
        self.world.all_gather_into(send.as_bytes(), recv.as_bytes_mut());
        Ok(())
    }

    fn barrier(&self) -> Result<(), MpError> {
        self.world.barrier();
        Ok(())
    }

    fn post_send(&self, data: OwnedBuffer, dest: usize) -> Result<Request, MpError> {
        check_rank(dest, self.size)?;
        if data.is_empty() {
            return self.post(MpiPending::Done(Ok(Completion::sent(dest, 0))), dest);
        }
        let elem = data.elem_type();
        let buffer = Box::into_raw(data.into_bytes().into_boxed_slice());
        // SAFETY: `buffer` stays allocated until `InFlight::reclaim`, which
        // only runs after the request has completed.
        let slice: &'static [u8] = unsafe { &*buffer };
        let request = self
            .process(dest)
            .immediate_send_with_tag(StaticScope, slice, elem_tag(elem));
        self.post(
            MpiPending::Send(InFlight {
                request,
                buffer,
                elem,
                dest,
            }),
            dest,
        )
    }

    fn post_recv(
        &self,
        elem: ElemType,
        capacity: usize,
        source: usize,
    ) -> Result<Request, MpError> {
        check_rank(source, self.size)?;
        if capacity == 0 {
            let empty = OwnedBuffer::from_bytes(Vec::new(), elem)?;
            return self.post(MpiPending::Done(Ok(Completion::received(source, empty))), source);
        }
        let req = self.post(
            MpiPending::Recv {
                source,
                elem,
                capacity,
            },
            source,
        )?;
        self.deferred.borrow_mut().push_back(req.id());
        Ok(req)
    }

    fn wait(&self, req: Request) -> Result<Completion, MpError> {
        if let Some(source) = self.unmatched_source(req.id())? {
            self.settle(source, Some(req.id()), true)?;
        }
        match self.requests.borrow_mut().remove(req.id())? {
            MpiPending::Send(InFlight {
                request,
                buffer,
                elem,
                dest,
            }) => {
                request.wait();
                // SAFETY: the request completed above.
                let bytes = unsafe { InFlight::reclaim(buffer) };
                InFlight::finish(elem, dest, bytes)
            }
            MpiPending::Done(outcome) => outcome,
            MpiPending::Recv { .. } => Err(MpError::InvariantViolation(format!(
                "posted receive {} still unmatched after a blocking settle",
                req.id()
            ))),
        }
    }

    fn test(&self, req: &Request) -> Result<Completion, MpError> {
        if let Some(source) = self.unmatched_source(req.id())? {
            if !self.settle(source, Some(req.id()), false)? {
                return Ok(Completion::pending(req.peer()));
            }
        }
        let mut requests = self.requests.borrow_mut();
        match requests.remove(req.id())? {
            MpiPending::Send(InFlight {
                request,
                buffer,
                elem,
                dest,
            }) => match request.test() {
                Ok(_) => {
                    // SAFETY: the request tested complete.
                    let bytes = unsafe { InFlight::reclaim(buffer) };
                    InFlight::finish(elem, dest, bytes)
                }
                Err(request) => {
                    let pending = InFlight {
                        request,
                        buffer,
                        elem,
                        dest,
                    };
                    requests.insert(req.id(), MpiPending::Send(pending))?;
                    Ok(Completion::pending(dest))
                }
            },
            MpiPending::Done(outcome) => outcome,
            MpiPending::Recv { .. } => Err(MpError::InvariantViolation(format!(
                "posted receive {} still unmatched after settling",
                req.id()
            ))),
        }
    }

    fn cancel(&self, req: Request) -> Result<bool, MpError> {
        let pending = self.requests.borrow_mut().remove(req.id())?;
        Ok(match pending {
            MpiPending::Send(in_flight) => in_flight.cancel(),
            MpiPending::Recv { .. } => {
                self.deferred.borrow_mut().retain(|&d| d != req.id());
                true
            }
            MpiPending::Done(_) => false,
        })
    }

    fn abort(&self, reason: &str) {
        log::error!("rank {} aborting MPI job: {reason}", self.rank);
        self.world.abort(1)
    }
}

impl Drop for MpiContext {
    fn drop(&mut self) {
        let leftover = self.requests.get_mut().drain();
        if !leftover.is_empty() {
            log::warn!(
                "rank {} dropped with {} outstanding MPI requests; cancelling",
                self.rank,
                leftover.len()
            );
        }
        for (_, pending) in leftover {
            if let MpiPending::Send(in_flight) = pending {
                in_flight.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(parts: &[[u64; 4]]) -> [u64; 4] {
        let mut out = [0u64; 4];
        for part in parts {
            for (o, p) in out.iter_mut().zip(part) {
                *o = (*o).max(*p);
            }
        }
        out
    }

    #[test]
    fn agreeing_ranks_pass() {
        let part = agreement(ElemType::F64, 12);
        check_agreement("bcast buffer", fold(&[part, part, part])).unwrap();
    }

    #[test]
    fn length_disagreement_is_reported() {
        let folded = fold(&[agreement(ElemType::U8, 3), agreement(ElemType::U8, 5)]);
        let err = check_agreement("bcast buffer", folded).unwrap_err();
        assert!(err.to_string().contains("3..=5"));
    }

    #[test]
    fn element_type_disagreement_is_reported() {
        let folded = fold(&[agreement(ElemType::U32, 4), agreement(ElemType::F32, 4)]);
        let err = check_agreement("all_gather send chunk", folded).unwrap_err();
        assert!(matches!(err, MpError::CollectiveMismatch(_)));
        assert!(err.to_string().contains("element type"));
    }

    #[test]
    fn tags_name_every_element_type() {
        for elem in ElemType::ALL {
            assert_eq!(tag_elem(elem_tag(elem)), Some(elem));
        }
        assert_eq!(tag_elem(0), None);
    }
}
