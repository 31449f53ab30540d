//! Argument capture and resolution of collective calls.
//!
//! Every rank entering a collective deposits a [`Contribution`]. Once all
//! `size` contributions are present, [`resolve`] checks that the ranks agree
//! (same kind, root, opcode, element type and compatible lengths) and
//! computes each rank's output bytes. The same routine backs the threaded
//! monitor (last arriver resolves) and the single-rank context (one
//! contribution), so both validate identically.

use crate::context::{Chunks, check_rank};
use crate::data::buffer::{Buffer, BufferMut, ElemType};
use crate::data::opcode::Opcode;
use crate::mp_error::MpError;
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectiveKind {
    Barrier,
    Bcast,
    Reduce,
    AllReduce,
    Gather,
    Scatter,
    AllGather,
}

/// One rank's arguments to a collective call.
#[derive(Debug, Clone)]
pub(crate) struct Contribution {
    pub kind: CollectiveKind,
    pub root: usize,
    pub op: Option<Opcode>,
    pub elem: ElemType,
    /// Outgoing bytes (empty where the rank sends nothing).
    pub data: Bytes,
    /// Capacity of the receive buffer, in elements.
    pub recv_len: usize,
    /// Per-rank element counts (`None` for uniform chunks).
    pub counts: Option<Vec<usize>>,
}

impl Contribution {
    pub fn barrier() -> Self {
        Self {
            kind: CollectiveKind::Barrier,
            root: 0,
            op: None,
            elem: ElemType::U8,
            data: Bytes::new(),
            recv_len: 0,
            counts: None,
        }
    }

    pub fn bcast(buf: Buffer<'_>, root: usize, is_root: bool) -> Self {
        Self {
            kind: CollectiveKind::Bcast,
            root,
            op: None,
            elem: buf.elem_type(),
            data: if is_root {
                Bytes::copy_from_slice(buf.as_bytes())
            } else {
                Bytes::new()
            },
            recv_len: buf.len(),
            counts: None,
        }
    }

    pub fn reduce(send: Buffer<'_>, recv_len: usize, op: Opcode, root: Option<usize>) -> Self {
        Self {
            kind: if root.is_some() {
                CollectiveKind::Reduce
            } else {
                CollectiveKind::AllReduce
            },
            root: root.unwrap_or(0),
            op: Some(op),
            elem: send.elem_type(),
            data: Bytes::copy_from_slice(send.as_bytes()),
            recv_len,
            counts: None,
        }
    }

    pub fn gather(send: Buffer<'_>, recv_len: usize, chunks: Chunks<'_>, root: usize) -> Self {
        Self {
            kind: CollectiveKind::Gather,
            root,
            op: None,
            elem: send.elem_type(),
            data: Bytes::copy_from_slice(send.as_bytes()),
            recv_len,
            counts: per_rank(chunks),
        }
    }

    /// `elem` is the receive buffer's element type; the root's send buffer
    /// has been checked against it by the caller.
    pub fn scatter(
        send: Buffer<'_>,
        elem: ElemType,
        recv_len: usize,
        chunks: Chunks<'_>,
        root: usize,
        is_root: bool,
    ) -> Self {
        Self {
            kind: CollectiveKind::Scatter,
            root,
            op: None,
            elem,
            data: if is_root {
                Bytes::copy_from_slice(send.as_bytes())
            } else {
                Bytes::new()
            },
            recv_len,
            counts: per_rank(chunks),
        }
    }

    pub fn all_gather(send: Buffer<'_>, recv_len: usize) -> Self {
        Self {
            kind: CollectiveKind::AllGather,
            root: 0,
            op: None,
            elem: send.elem_type(),
            data: Bytes::copy_from_slice(send.as_bytes()),
            recv_len,
            counts: None,
        }
    }

    fn elements(&self) -> usize {
        self.data.len() / self.elem.size()
    }
}

fn per_rank(chunks: Chunks<'_>) -> Option<Vec<usize>> {
    match chunks {
        Chunks::Uniform => None,
        Chunks::PerRank(c) => Some(c.to_vec()),
    }
}

/// Why a collective could not be resolved; delivered to every rank.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    Mismatch(String),
    Chunks(String),
    Op { op: Opcode, elem: ElemType },
}

impl Fault {
    pub fn into_error(self) -> MpError {
        match self {
            Fault::Mismatch(msg) => MpError::CollectiveMismatch(msg),
            Fault::Chunks(msg) => MpError::InvalidChunks(msg),
            Fault::Op { op, elem } => MpError::OpcodeNotSupported { op, elem },
        }
    }
}

fn expect_len(what: &str, rank: usize, expected: usize, actual: usize) -> Result<(), Fault> {
    if expected == actual {
        Ok(())
    } else {
        Err(Fault::Mismatch(format!(
            "{what} on rank {rank}: expected {expected} elements, got {actual}"
        )))
    }
}

/// Per-rank element counts for gather/scatter, taken from the root.
fn layout(parts: &[Contribution], root: usize, uniform: usize) -> Result<Vec<usize>, Fault> {
    let n = parts.len();
    match &parts[root].counts {
        None => Ok(vec![uniform; n]),
        Some(counts) if counts.len() == n => Ok(counts.clone()),
        Some(counts) => Err(Fault::Chunks(format!(
            "root {root} passed {} counts for {n} ranks",
            counts.len()
        ))),
    }
}

fn concat(parts: &[Contribution]) -> Bytes {
    let total = parts.iter().map(|p| p.data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for p in parts {
        out.extend_from_slice(&p.data);
    }
    out.freeze()
}

/// Validate all contributions and compute each rank's output.
///
/// `None` in the result means the rank's receive buffer is left untouched.
pub(crate) fn resolve(parts: &[Contribution]) -> Result<Vec<Option<Bytes>>, Fault> {
    let n = parts.len();
    let first = &parts[0];
    for (r, p) in parts.iter().enumerate().skip(1) {
        if p.kind != first.kind {
            return Err(Fault::Mismatch(format!(
                "rank {r} entered {:?} while rank 0 entered {:?}",
                p.kind, first.kind
            )));
        }
        if p.root != first.root {
            return Err(Fault::Mismatch(format!(
                "rank {r} names root {} while rank 0 names root {}",
                p.root, first.root
            )));
        }
        if p.op != first.op {
            return Err(Fault::Mismatch(format!(
                "rank {r} reduces with {:?} while rank 0 uses {:?}",
                p.op, first.op
            )));
        }
        if p.elem != first.elem {
            return Err(Fault::Mismatch(format!(
                "rank {r} passes {} elements while rank 0 passes {}",
                p.elem, first.elem
            )));
        }
    }
    let root = first.root;
    if root >= n {
        return Err(Fault::Mismatch(format!("root {root} out of range for {n} ranks")));
    }
    let elem = first.elem;
    let esz = elem.size();

    match first.kind {
        CollectiveKind::Barrier => Ok(vec![None; n]),

        CollectiveKind::Bcast => {
            let len = parts[root].recv_len;
            for (r, p) in parts.iter().enumerate() {
                expect_len("bcast buffer", r, len, p.recv_len)?;
            }
            let data = parts[root].data.clone();
            Ok((0..n)
                .map(|r| (r != root).then(|| data.clone()))
                .collect())
        }

        CollectiveKind::Reduce | CollectiveKind::AllReduce => {
            let op = first
                .op
                .ok_or_else(|| Fault::Mismatch("reduction without opcode".into()))?;
            let len = first.elements();
            for (r, p) in parts.iter().enumerate() {
                expect_len("reduce send buffer", r, len, p.elements())?;
            }
            let mut acc = first.data.to_vec();
            for p in &parts[1..] {
                op.fold_bytes(elem, &mut acc, &p.data)
                    .map_err(|_| Fault::Op { op, elem })?;
            }
            let acc = Bytes::from(acc);
            let everywhere = first.kind == CollectiveKind::AllReduce;
            let mut out = Vec::with_capacity(n);
            for (r, p) in parts.iter().enumerate() {
                if everywhere || r == root {
                    expect_len("reduce receive buffer", r, len, p.recv_len)?;
                    out.push(Some(acc.clone()));
                } else {
                    out.push(None);
                }
            }
            Ok(out)
        }

        CollectiveKind::Gather => {
            let counts = layout(parts, root, parts[root].elements())?;
            for (r, p) in parts.iter().enumerate() {
                expect_len("gather send chunk", r, counts[r], p.elements())?;
            }
            let total: usize = counts.iter().sum();
            expect_len("gather receive buffer", root, total, parts[root].recv_len)?;
            let gathered = concat(parts);
            Ok((0..n)
                .map(|r| (r == root).then(|| gathered.clone()))
                .collect())
        }

        CollectiveKind::Scatter => {
            let counts = layout(parts, root, parts[root].recv_len)?;
            let total: usize = counts.iter().sum();
            if total != parts[root].elements() {
                return Err(Fault::Chunks(format!(
                    "scatter counts sum to {total} but root {root} sends {}",
                    parts[root].elements()
                )));
            }
            let mut out = Vec::with_capacity(n);
            let mut offset = 0;
            for (r, p) in parts.iter().enumerate() {
                expect_len("scatter receive buffer", r, counts[r], p.recv_len)?;
                let end = offset + counts[r] * esz;
                out.push(Some(parts[root].data.slice(offset..end)));
                offset = end;
            }
            Ok(out)
        }

        CollectiveKind::AllGather => {
            let chunk = first.elements();
            for (r, p) in parts.iter().enumerate() {
                expect_len("all_gather send chunk", r, chunk, p.elements())?;
                expect_len("all_gather receive buffer", r, chunk * n, p.recv_len)?;
            }
            let gathered = concat(parts);
            Ok(vec![Some(gathered); n])
        }
    }
}

/// The exchange step shared by backends that resolve collectives in-process.
pub(crate) trait Rendezvous {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Deposit `part` and block until every rank's output is known.
    fn exchange(&self, part: Contribution) -> Result<Option<Bytes>, MpError>;
}

fn same_elem(send: &Buffer<'_>, recv: &BufferMut<'_>) -> Result<(), MpError> {
    if send.elem_type() != recv.elem_type() {
        return Err(MpError::TypeMismatch {
            expected: recv.elem_type(),
            actual: send.elem_type(),
        });
    }
    Ok(())
}

fn land(out: Option<Bytes>, recv: &mut BufferMut<'_>, from: usize) -> Result<(), MpError> {
    if let Some(bytes) = out {
        let elem = recv.elem_type();
        recv.fill(&bytes, elem, from)?;
    }
    Ok(())
}

pub(crate) fn barrier<R: Rendezvous + ?Sized>(r: &R) -> Result<(), MpError> {
    r.exchange(Contribution::barrier()).map(|_| ())
}

pub(crate) fn bcast<R: Rendezvous + ?Sized>(
    r: &R,
    mut buf: BufferMut<'_>,
    root: usize,
) -> Result<(), MpError> {
    check_rank(root, r.size())?;
    let part = Contribution::bcast(buf.as_buffer(), root, r.rank() == root);
    let out = r.exchange(part)?;
    land(out, &mut buf, root)
}

pub(crate) fn reduce<R: Rendezvous + ?Sized>(
    r: &R,
    send: Buffer<'_>,
    mut recv: BufferMut<'_>,
    op: Opcode,
    root: Option<usize>,
) -> Result<(), MpError> {
    if let Some(root) = root {
        check_rank(root, r.size())?;
    }
    op.check(send.elem_type())?;
    let receives = root.is_none_or(|root| root == r.rank());
    if receives {
        same_elem(&send, &recv)?;
        if recv.len() != send.len() {
            return Err(MpError::LengthMismatch {
                what: "reduce receive buffer",
                expected: send.len(),
                actual: recv.len(),
            });
        }
    }
    let from = root.unwrap_or(r.rank());
    let out = r.exchange(Contribution::reduce(send, recv.len(), op, root))?;
    land(out, &mut recv, from)
}

pub(crate) fn gather<R: Rendezvous + ?Sized>(
    r: &R,
    send: Buffer<'_>,
    mut recv: BufferMut<'_>,
    chunks: Chunks<'_>,
    root: usize,
) -> Result<(), MpError> {
    check_rank(root, r.size())?;
    if r.rank() == root {
        same_elem(&send, &recv)?;
    }
    let out = r.exchange(Contribution::gather(send, recv.len(), chunks, root))?;
    land(out, &mut recv, root)
}

pub(crate) fn scatter<R: Rendezvous + ?Sized>(
    r: &R,
    send: Buffer<'_>,
    mut recv: BufferMut<'_>,
    chunks: Chunks<'_>,
    root: usize,
) -> Result<(), MpError> {
    check_rank(root, r.size())?;
    let is_root = r.rank() == root;
    if is_root {
        same_elem(&send, &recv)?;
    }
    let part = Contribution::scatter(send, recv.elem_type(), recv.len(), chunks, root, is_root);
    let out = r.exchange(part)?;
    land(out, &mut recv, root)
}

pub(crate) fn all_gather<R: Rendezvous + ?Sized>(
    r: &R,
    send: Buffer<'_>,
    mut recv: BufferMut<'_>,
) -> Result<(), MpError> {
    same_elem(&send, &recv)?;
    let expected = send.len() * r.size();
    if recv.len() != expected {
        return Err(MpError::LengthMismatch {
            what: "all_gather receive buffer",
            expected,
            actual: recv.len(),
        });
    }
    let out = r.exchange(Contribution::all_gather(send, recv.len()))?;
    land(out, &mut recv, r.rank())
}
