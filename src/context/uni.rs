//! Single-rank context. Every call talks to rank 0, i.e. to itself.

use crate::context::collective::{self, Contribution, Fault, Rendezvous, resolve};
use crate::context::request_list::RequestList;
use crate::context::{Chunks, Completion, Context, Envelope, Request, check_rank};
use crate::data::buffer::{Buffer, BufferMut, ElemType, OwnedBuffer};
use crate::data::opcode::Opcode;
use crate::data::status::Status;
use crate::mp_error::MpError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
enum UniPending {
    /// The envelope went to the self-queue at post time.
    Send { envelope: u64, count: usize },
    Recv { elem: ElemType, capacity: usize },
}

/// Context of size 1.
///
/// Self-sends are queued and satisfied by later self-receives in FIFO order.
/// Receiving with an empty queue fails with [`MpError::NoMatchingSend`]
/// instead of deadlocking.
#[derive(Debug, Default)]
pub struct UniContext {
    queue: Mutex<VecDeque<Envelope>>,
    requests: Mutex<RequestList<UniPending>>,
    next_id: AtomicU64,
    aborted: Mutex<Option<String>>,
}

impl UniContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent to self and not yet received.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn alive(&self) -> Result<(), MpError> {
        match self.aborted.lock().as_ref() {
            Some(reason) => Err(MpError::Aborted {
                rank: 0,
                culprit: 0,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pop the oldest queued message if a receive of `capacity` `elem`s can
    /// take it. An unfit message stays at the front of the queue.
    fn take_fitting(&self, elem: ElemType, capacity: usize) -> Result<Option<Envelope>, MpError> {
        let mut queue = self.queue.lock();
        match queue.front() {
            Some(env) => env.fits(elem, capacity, 0)?,
            None => return Ok(None),
        }
        Ok(queue.pop_front())
    }

    fn empty_completion(elem: ElemType) -> Result<Completion, MpError> {
        Ok(Completion::received(0, OwnedBuffer::from_bytes(Vec::new(), elem)?))
    }
}

impl Rendezvous for UniContext {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, part: Contribution) -> Result<Option<Bytes>, MpError> {
        self.alive()?;
        let mut out = resolve(std::slice::from_ref(&part)).map_err(Fault::into_error)?;
        Ok(out.pop().flatten())
    }
}

impl Context for UniContext {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn send(&self, buf: Buffer<'_>, dest: usize) -> Result<(), MpError> {
        check_rank(dest, 1)?;
        self.alive()?;
        if buf.is_empty() {
            return Ok(());
        }
        let id = self.fresh_id();
        self.queue.lock().push_back(Envelope {
            id,
            elem: buf.elem_type(),
            data: Bytes::copy_from_slice(buf.as_bytes()),
        });
        Ok(())
    }

    fn recv(&self, mut buf: BufferMut<'_>, source: usize) -> Result<Status, MpError> {
        check_rank(source, 1)?;
        self.alive()?;
        if buf.is_empty() {
            return Ok(Status::complete(0, 0));
        }
        let env = self
            .take_fitting(buf.elem_type(), buf.len())?
            .ok_or(MpError::NoMatchingSend { rank: 0 })?;
        env.deliver(&mut buf, 0)
    }

    fn bcast(&self, buf: BufferMut<'_>, root: usize) -> Result<(), MpError> {
        collective::bcast(self, buf, root)
    }

    fn reduce(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        op: Opcode,
        root: usize,
    ) -> Result<(), MpError> {
        collective::reduce(self, send, recv, op, Some(root))
    }

    fn all_reduce(&self, send: Buffer<'_>, recv: BufferMut<'_>, op: Opcode) -> Result<(), MpError> {
        collective::reduce(self, send, recv, op, None)
    }

    fn gather(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        chunks: Chunks<'_>,
        root: usize,
    ) -> Result<(), MpError> {
        collective::gather(self, send, recv, chunks, root)
    }

    fn scatter(
        &self,
        send: Buffer<'_>,
        recv: BufferMut<'_>,
        chunks: Chunks<'_>,
        root: usize,
    ) -> Result<(), MpError> {
        collective::scatter(self, send, recv, chunks, root)
    }

    fn all_gather(&self, send: Buffer<'_>, recv: BufferMut<'_>) -> Result<(), MpError> {
        collective::all_gather(self, send, recv)
    }

    fn barrier(&self) -> Result<(), MpError> {
        collective::barrier(self)
    }

    fn post_send(&self, data: OwnedBuffer, dest: usize) -> Result<Request, MpError> {
        check_rank(dest, 1)?;
        self.alive()?;
        let count = data.len();
        let envelope = self.fresh_id();
        if !data.is_empty() {
            let elem = data.elem_type();
            self.queue.lock().push_back(Envelope {
                id: envelope,
                elem,
                data: Bytes::from(data.into_bytes()),
            });
        }
        let id = self.fresh_id();
        self.requests.lock().insert(id, UniPending::Send { envelope, count })?;
        Ok(Request::new(id, 0))
    }

    fn post_recv(
        &self,
        elem: ElemType,
        capacity: usize,
        source: usize,
    ) -> Result<Request, MpError> {
        check_rank(source, 1)?;
        self.alive()?;
        let id = self.fresh_id();
        self.requests.lock().insert(id, UniPending::Recv { elem, capacity })?;
        Ok(Request::new(id, 0))
    }

    fn wait(&self, req: Request) -> Result<Completion, MpError> {
        let entry = self.requests.lock().remove(req.id())?;
        self.alive()?;
        match entry {
            UniPending::Send { count, .. } => Ok(Completion::sent(0, count)),
            UniPending::Recv { elem, capacity } => {
                if capacity == 0 {
                    return Self::empty_completion(elem);
                }
                let env = self
                    .take_fitting(elem, capacity)?
                    .ok_or(MpError::NoMatchingSend { rank: 0 })?;
                env.into_completion(elem, capacity, 0)
            }
        }
    }

    fn test(&self, req: &Request) -> Result<Completion, MpError> {
        let mut requests = self.requests.lock();
        match requests.get(req.id())? {
            UniPending::Send { count, .. } => {
                let count = *count;
                requests.remove(req.id())?;
                Ok(Completion::sent(0, count))
            }
            UniPending::Recv { elem, capacity } => {
                let (elem, capacity) = (*elem, *capacity);
                if capacity == 0 {
                    requests.remove(req.id())?;
                    return Self::empty_completion(elem);
                }
                match self.take_fitting(elem, capacity) {
                    Ok(Some(env)) => {
                        requests.remove(req.id())?;
                        env.into_completion(elem, capacity, 0)
                    }
                    Ok(None) => Ok(Completion::pending(0)),
                    Err(err) => {
                        requests.remove(req.id())?;
                        Err(err)
                    }
                }
            }
        }
    }

    fn cancel(&self, req: Request) -> Result<bool, MpError> {
        let entry = self.requests.lock().remove(req.id())?;
        Ok(match entry {
            UniPending::Send { envelope, .. } => {
                let mut queue = self.queue.lock();
                match queue.iter().position(|e| e.id == envelope) {
                    Some(pos) => {
                        queue.remove(pos);
                        true
                    }
                    None => false,
                }
            }
            // Receives only match at wait/test time.
            UniPending::Recv { .. } => true,
        })
    }

    fn abort(&self, reason: &str) {
        log::warn!("single-rank context aborted: {reason}");
        self.aborted.lock().get_or_insert_with(|| reason.to_owned());
    }

    fn checkpoint(&self) -> Result<(), MpError> {
        self.alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextExt;

    #[test]
    fn self_messages_are_fifo() {
        let ctx = UniContext::new();
        ctx.send_slice(&[1i32], 0).unwrap();
        ctx.send_slice(&[2i32, 3], 0).unwrap();
        let mut a = [0i32; 2];
        assert_eq!(ctx.recv_slice(&mut a, 0).unwrap().count, 1);
        assert_eq!(a[0], 1);
        assert_eq!(ctx.recv_slice(&mut a, 0).unwrap().count, 2);
        assert_eq!(a, [2, 3]);
    }

    #[test]
    fn empty_queue_does_not_block() {
        let ctx = UniContext::new();
        let mut a = [0u8; 4];
        assert!(matches!(
            ctx.recv_slice(&mut a, 0),
            Err(MpError::NoMatchingSend { rank: 0 })
        ));
    }

    #[test]
    fn unfit_receive_keeps_message_queued() {
        let ctx = UniContext::new();
        ctx.send_slice(&[1u32, 2, 3], 0).unwrap();
        let mut short = [0u32; 2];
        assert!(matches!(
            ctx.recv_slice(&mut short, 0),
            Err(MpError::Truncated { from: 0, sent: 3, capacity: 2 })
        ));
        let mut wrong = [0i64; 3];
        assert!(matches!(
            ctx.recv_slice(&mut wrong, 0),
            Err(MpError::TypeMismatch { .. })
        ));
        let req = ctx.post_recv(ElemType::U32, 1, 0).unwrap();
        assert!(matches!(ctx.test(&req), Err(MpError::Truncated { .. })));
        assert_eq!(ctx.queued(), 1);

        let mut full = [0u32; 3];
        assert_eq!(ctx.recv_slice(&mut full, 0).unwrap().count, 3);
        assert_eq!(full, [1, 2, 3]);
        assert_eq!(ctx.queued(), 0);
    }

    #[test]
    fn cancel_withdraws_queued_send() {
        let ctx = UniContext::new();
        let req = ctx.post_send(OwnedBuffer::from_vec(vec![5u64]), 0).unwrap();
        assert_eq!(ctx.queued(), 1);
        assert!(ctx.cancel(req).unwrap());
        assert_eq!(ctx.queued(), 0);
    }

    #[test]
    fn abort_poisons_later_calls() {
        let ctx = UniContext::new();
        ctx.abort("stop");
        assert!(matches!(ctx.barrier(), Err(MpError::Aborted { .. })));
        assert!(ctx.checkpoint().is_err());
    }
}
