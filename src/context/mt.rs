//! Thread-based context: every rank is an OS thread of the same process.

use crate::context::collective::{self, Contribution, Rendezvous};
use crate::context::monitor::Monitor;
use crate::context::request_list::RequestList;
use crate::context::{Chunks, Completion, Context, Request, check_rank};
use crate::data::buffer::{Buffer, BufferMut, ElemType, OwnedBuffer};
use crate::data::opcode::Opcode;
use crate::data::status::Status;
use crate::mp_error::MpError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
enum MtPending {
    Send { dest: usize, ticket: u64, count: usize },
    Recv {
        source: usize,
        ticket: u64,
        elem: ElemType,
        capacity: usize,
    },
    /// Completed at post time (zero-length operations).
    Ready(Completion),
}

/// One rank of a thread group.
///
/// Siblings are created together by [`MtContext::group`] (or by
/// [`MtDriver`](crate::driver::MtDriver)) and share one monitor.
pub struct MtContext {
    rank: usize,
    monitor: Arc<Monitor>,
    requests: Mutex<RequestList<MtPending>>,
    next_request: AtomicU64,
}

impl MtContext {
    /// `size` sibling contexts sharing one fresh monitor, indexed by rank.
    pub fn group(size: usize) -> Vec<MtContext> {
        Self::with_monitor(Arc::new(Monitor::new(size)))
    }

    pub(crate) fn with_monitor(monitor: Arc<Monitor>) -> Vec<MtContext> {
        (0..monitor.size())
            .map(|rank| MtContext {
                rank,
                monitor: Arc::clone(&monitor),
                requests: Mutex::new(RequestList::new()),
                next_request: AtomicU64::new(1),
            })
            .collect()
    }

    /// Cancel `rank` of this group: it fails with `Cancelled` at its next
    /// blocking point and every sibling fails with `Aborted`.
    pub fn cancel_rank(&self, rank: usize) -> Result<(), MpError> {
        check_rank(rank, self.monitor.size())?;
        self.monitor.cancel(rank, &format!("requested by rank {}", self.rank));
        Ok(())
    }

    /// Number of posted requests not yet waited on, tested complete or cancelled.
    pub fn outstanding_requests(&self) -> usize {
        self.requests.lock().len()
    }

    fn post(&self, entry: MtPending, peer: usize) -> Result<Request, MpError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().insert(id, entry)?;
        Ok(Request::new(id, peer))
    }

    fn withdraw(&self, entry: &MtPending) -> bool {
        match *entry {
            MtPending::Send { dest, ticket, .. } => {
                self.monitor.withdraw_send(self.rank, dest, ticket)
            }
            MtPending::Recv { source, ticket, .. } => {
                self.monitor.withdraw_recv(self.rank, source, ticket)
            }
            MtPending::Ready(_) => false,
        }
    }
}

impl Rendezvous for MtContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.monitor.size()
    }

    fn exchange(&self, part: Contribution) -> Result<Option<Bytes>, MpError> {
        self.monitor.collective(self.rank, part)
    }
}

impl Context for MtContext {
    fn size(&self) -> usize {
        self.monitor.size()
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&self, buf: Buffer<'_>, dest: usize) -> Result<(), MpError> {
        check_rank(dest, self.monitor.size())?;
        if buf.is_empty() {
            return Ok(());
        }
        let data = Bytes::copy_from_slice(buf.as_bytes());
        let ticket = self.monitor.enqueue_send(self.rank, dest, buf.elem_type(), data)?;
        // A send to self is buffered; waiting for the match would deadlock.
        if dest == self.rank {
            return Ok(());
        }
        self.monitor
            .wait_delivered(self.rank, dest, ticket)
            .inspect_err(|_| {
                self.monitor.withdraw_send(self.rank, dest, ticket);
            })
    }

    fn recv(&self, mut buf: BufferMut<'_>, source: usize) -> Result<Status, MpError> {
        check_rank(source, self.monitor.size())?;
        if buf.is_empty() {
            return Ok(Status::complete(source, 0));
        }
        let ticket = self
            .monitor
            .register_recv(self.rank, source, buf.elem_type(), buf.len())?;
        let env = self
            .monitor
            .wait_matched(self.rank, source, ticket)
            .inspect_err(|_| {
                self.monitor.withdraw_recv(self.rank, source, ticket);
            })?;
        env.deliver(&mut buf, source)
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
        check_rank(dest, self.monitor.size())?;
        let count = data.len();
        if data.is_empty() {
            return self.post(MtPending::Ready(Completion::sent(dest, 0)), dest);
        }
        let elem = data.elem_type();
        let ticket = self
            .monitor
            .enqueue_send(self.rank, dest, elem, Bytes::from(data.into_bytes()))?;
        self.post(MtPending::Send { dest, ticket, count }, dest)
    }

    fn post_recv(
        &self,
        elem: ElemType,
        capacity: usize,
        source: usize,
    ) -> Result<Request, MpError> {
        check_rank(source, self.monitor.size())?;
        if capacity == 0 {
            let empty = OwnedBuffer::from_bytes(Vec::new(), elem)?;
            return self.post(MtPending::Ready(Completion::received(source, empty)), source);
        }
        let ticket = self.monitor.register_recv(self.rank, source, elem, capacity)?;
        self.post(
            MtPending::Recv {
                source,
                ticket,
                elem,
                capacity,
            },
            source,
        )
    }

    fn wait(&self, req: Request) -> Result<Completion, MpError> {
        let entry = self.requests.lock().remove(req.id())?;
        match entry {
            MtPending::Ready(done) => Ok(done),
            MtPending::Send { dest, ticket, count } => self
                .monitor
                .wait_delivered(self.rank, dest, ticket)
                .inspect_err(|_| {
                    self.monitor.withdraw_send(self.rank, dest, ticket);
                })
                .map(|()| Completion::sent(dest, count)),
            MtPending::Recv {
                source,
                ticket,
                elem,
                capacity,
            } => {
                let env = self
                    .monitor
                    .wait_matched(self.rank, source, ticket)
                    .inspect_err(|_| {
                        self.monitor.withdraw_recv(self.rank, source, ticket);
                    })?;
                env.into_completion(elem, capacity, source)
            }
        }
    }

    fn test(&self, req: &Request) -> Result<Completion, MpError> {
        let mut requests = self.requests.lock();
        // Retired up front; put back below if still pending.
        let entry = requests.remove(req.id())?;
        let done = match &entry {
            MtPending::Ready(_) => None,
            MtPending::Send { dest, ticket, count } => self
                .monitor
                .poll_delivered(self.rank, *dest, *ticket)?
                .then(|| Completion::sent(*dest, *count)),
            MtPending::Recv {
                source,
                ticket,
                elem,
                capacity,
            } => self
                .monitor
                .poll_matched(self.rank, *source, *ticket)?
                .map(|env| env.into_completion(*elem, *capacity, *source))
                .transpose()?,
        };
        if let Some(done) = done {
            return Ok(done);
        }
        match entry {
            MtPending::Ready(done) => Ok(done),
            pending => {
                requests.insert(req.id(), pending)?;
                Ok(Completion::pending(req.peer()))
            }
        }
    }

    fn cancel(&self, req: Request) -> Result<bool, MpError> {
        let entry = self.requests.lock().remove(req.id())?;
        let withdrawn = self.withdraw(&entry);
        log::trace!(
            "rank {} cancelled request {} (withdrawn={withdrawn})",
            self.rank,
            req.id()
        );
        Ok(withdrawn)
    }

    fn abort(&self, reason: &str) {
        self.monitor.abort(self.rank, reason);
    }

    fn checkpoint(&self) -> Result<(), MpError> {
        self.monitor.checkpoint(self.rank)
    }
}

impl Drop for MtContext {
    fn drop(&mut self) {
        let requests = self.requests.get_mut();
        let leftover = requests.drain();
        let (posted, retired) = requests.counters();
        log::trace!("rank {} posted {posted} requests, retired {retired}", self.rank);
        if !leftover.is_empty() {
            log::warn!(
                "rank {} dropped with {} outstanding requests",
                self.rank,
                leftover.len()
            );
        }
        for (_, entry) in leftover {
            self.withdraw(&entry);
        }
    }
}
