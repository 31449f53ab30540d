//! Shared monitor of one group of [`MtContext`](crate::context::MtContext)s.
//!
//! One `parking_lot::Mutex` guards all rendezvous and barrier state of the
//! group, and one `Condvar` wakes waiters on every state change. Every wait
//! predicate also checks the poison flag, so cancelling one rank or aborting
//! the group releases every blocked sibling instead of leaving it parked.
//!
//! Point-to-point matching is per `(src, dst)` link: envelopes and waiting
//! receives queue in FIFO order and the oldest of each are paired, which
//! keeps one sender's messages to one receiver in order. A receive whose
//! buffer cannot take the oldest envelope fails without consuming it.

use crate::context::Envelope;
use crate::context::collective::{Contribution, Fault, resolve};
use crate::data::buffer::ElemType;
use crate::debug_invariants::DebugInvariants;
use crate::mp_error::MpError;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// A registered receive and the buffer shape it can take.
#[derive(Debug, Clone, Copy)]
struct Waiting {
    id: u64,
    elem: ElemType,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Link {
    unmatched: VecDeque<Envelope>,
    waiting: VecDeque<Waiting>,
    /// Receive id -> envelope matched to it, not yet picked up.
    matched: HashMap<u64, Envelope>,
    /// Receive id -> why the oldest envelope did not fit it.
    rejected: HashMap<u64, MpError>,
    /// Send ids whose envelope has been matched, not yet acknowledged.
    delivered: HashSet<u64>,
}

impl Link {
    /// Pair the oldest envelope with the oldest receive while both exist.
    /// `src` is the sending rank of this link.
    fn pair_up(&mut self, src: usize) {
        while let (Some(env), Some(&w)) = (self.unmatched.front(), self.waiting.front()) {
            self.waiting.pop_front();
            if let Err(err) = env.fits(w.elem, w.capacity, src) {
                log::debug!("receive {} rejected send {}: {err}", w.id, env.id);
                self.rejected.insert(w.id, err);
                continue;
            }
            if let Some(env) = self.unmatched.pop_front() {
                log::trace!("matched send {} with receive {}", env.id, w.id);
                self.delivered.insert(env.id);
                self.matched.insert(w.id, env);
            }
        }
    }

    /// Hand back the outcome of receive `id`, if it has one.
    fn take_outcome(&mut self, id: u64) -> Option<Result<Envelope, MpError>> {
        if let Some(env) = self.matched.remove(&id) {
            return Some(Ok(env));
        }
        self.rejected.remove(&id).map(Err)
    }
}

#[derive(Debug, Clone)]
struct Poison {
    culprit: usize,
    reason: String,
}

struct Round {
    seq: u64,
    arrived: Vec<Option<Contribution>>,
    count: usize,
}

impl Round {
    fn new(seq: u64, size: usize) -> Self {
        Self {
            seq,
            arrived: vec![None; size],
            count: 0,
        }
    }
}

struct Published {
    outcome: Result<Vec<Option<Bytes>>, Fault>,
    remaining: usize,
}

struct MonitorState {
    links: HashMap<(usize, usize), Link>,
    next_id: u64,
    round: Round,
    published: HashMap<u64, Published>,
    poison: Option<Poison>,
    cancelled: Vec<bool>,
}

impl MonitorState {
    fn link(&mut self, src: usize, dst: usize) -> &mut Link {
        self.links.entry((src, dst)).or_default()
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, me: usize) -> Result<(), MpError> {
        if self.cancelled[me] {
            return Err(MpError::Cancelled { rank: me });
        }
        match &self.poison {
            Some(p) => Err(MpError::Aborted {
                rank: me,
                culprit: p.culprit,
                reason: p.reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

pub(crate) struct Monitor {
    size: usize,
    state: Mutex<MonitorState>,
    cond: Condvar,
}

/// What the driver learns about a poisoned group after the run.
#[derive(Debug, Clone)]
pub(crate) struct PoisonInfo {
    pub culprit: usize,
    pub cancelled: bool,
}

impl Monitor {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(MonitorState {
                links: HashMap::new(),
                next_id: 0,
                round: Round::new(0, size),
                published: HashMap::new(),
                poison: None,
                cancelled: vec![false; size],
            }),
            cond: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock()
    }

    pub fn checkpoint(&self, me: usize) -> Result<(), MpError> {
        self.lock().check(me)
    }

    // --- point to point ------------------------------------------------------

    /// Queue a message on `(me, dest)`; returns the send id.
    pub fn enqueue_send(
        &self,
        me: usize,
        dest: usize,
        elem: ElemType,
        data: Bytes,
    ) -> Result<u64, MpError> {
        let mut st = self.lock();
        st.check(me)?;
        let id = st.alloc_id();
        let link = st.link(me, dest);
        link.unmatched.push_back(Envelope { id, elem, data });
        link.pair_up(me);
        crate::debug_invariants!(self.validate_link(link), "enqueue_send");
        drop(st);
        self.cond.notify_all();
        Ok(id)
    }

    /// Block until send `id` has been matched by a receive on `dest`.
    pub fn wait_delivered(&self, me: usize, dest: usize, id: u64) -> Result<(), MpError> {
        let mut st = self.lock();
        loop {
            if st.link(me, dest).delivered.remove(&id) {
                return Ok(());
            }
            st.check(me)?;
            self.cond.wait(&mut st);
        }
    }

    pub fn poll_delivered(&self, me: usize, dest: usize, id: u64) -> Result<bool, MpError> {
        let mut st = self.lock();
        if st.link(me, dest).delivered.remove(&id) {
            return Ok(true);
        }
        st.check(me)?;
        Ok(false)
    }

    /// Withdraw send `id`. `true` if it had not been matched yet.
    pub fn withdraw_send(&self, me: usize, dest: usize, id: u64) -> bool {
        let mut st = self.lock();
        let link = st.link(me, dest);
        if let Some(pos) = link.unmatched.iter().position(|e| e.id == id) {
            link.unmatched.remove(pos);
            return true;
        }
        link.delivered.remove(&id);
        false
    }

    /// Register a receive of up to `capacity` `elem`s on `(source, me)`;
    /// returns the receive id.
    pub fn register_recv(
        &self,
        me: usize,
        source: usize,
        elem: ElemType,
        capacity: usize,
    ) -> Result<u64, MpError> {
        let mut st = self.lock();
        st.check(me)?;
        let id = st.alloc_id();
        let link = st.link(source, me);
        link.waiting.push_back(Waiting { id, elem, capacity });
        link.pair_up(source);
        crate::debug_invariants!(self.validate_link(link), "register_recv");
        drop(st);
        self.cond.notify_all();
        Ok(id)
    }

    /// Block until receive `id` has been matched; returns its envelope, or
    /// the error that made the oldest envelope unfit for it.
    pub fn wait_matched(&self, me: usize, source: usize, id: u64) -> Result<Envelope, MpError> {
        let mut st = self.lock();
        loop {
            if let Some(outcome) = st.link(source, me).take_outcome(id) {
                return outcome;
            }
            st.check(me)?;
            self.cond.wait(&mut st);
        }
    }

    pub fn poll_matched(
        &self,
        me: usize,
        source: usize,
        id: u64,
    ) -> Result<Option<Envelope>, MpError> {
        let mut st = self.lock();
        if let Some(outcome) = st.link(source, me).take_outcome(id) {
            return outcome.map(Some);
        }
        st.check(me)?;
        Ok(None)
    }

    /// Withdraw receive `id`. `true` if it had not been matched yet; a
    /// matched envelope is dropped.
    pub fn withdraw_recv(&self, me: usize, source: usize, id: u64) -> bool {
        let mut st = self.lock();
        let link = st.link(source, me);
        if let Some(pos) = link.waiting.iter().position(|w| w.id == id) {
            link.waiting.remove(pos);
            return true;
        }
        link.rejected.remove(&id);
        link.matched.remove(&id);
        false
    }

    // --- collectives ---------------------------------------------------------

    /// Enter a barrier collective with `part`; returns this rank's output.
    ///
    /// The last rank to arrive resolves the round for everyone.
    pub fn collective(&self, me: usize, part: Contribution) -> Result<Option<Bytes>, MpError> {
        let mut st = self.lock();
        st.check(me)?;
        let seq = st.round.seq;
        debug_assert!(st.round.arrived[me].is_none(), "rank {me} entered round {seq} twice");
        st.round.arrived[me] = Some(part);
        st.round.count += 1;
        if st.round.count == self.size {
            let round = std::mem::replace(&mut st.round, Round::new(seq + 1, self.size));
            let parts: Vec<Contribution> = round.arrived.into_iter().flatten().collect();
            let outcome = resolve(&parts);
            log::trace!("collective round {seq} resolved by rank {me}: ok={}", outcome.is_ok());
            st.published.insert(
                seq,
                Published {
                    outcome,
                    remaining: self.size,
                },
            );
            self.cond.notify_all();
        }
        loop {
            if let Some(p) = st.published.get_mut(&seq) {
                let mine = match &mut p.outcome {
                    Ok(outputs) => Ok(outputs[me].take()),
                    Err(fault) => Err(fault.clone().into_error()),
                };
                p.remaining -= 1;
                if p.remaining == 0 {
                    st.published.remove(&seq);
                }
                return mine;
            }
            st.check(me)?;
            self.cond.wait(&mut st);
        }
    }

    // --- failure -------------------------------------------------------------

    /// Mark `rank` cancelled and poison the group.
    pub fn cancel(&self, rank: usize, reason: &str) {
        let mut st = self.lock();
        if rank < self.size {
            st.cancelled[rank] = true;
        }
        if st.poison.is_none() {
            log::warn!("rank {rank} cancelled: {reason}");
            st.poison = Some(Poison {
                culprit: rank,
                reason: format!("cancelled: {reason}"),
            });
        }
        drop(st);
        self.cond.notify_all();
    }

    /// Poison the group on behalf of `culprit`. The first poison wins.
    pub fn abort(&self, culprit: usize, reason: &str) {
        let mut st = self.lock();
        if st.poison.is_none() {
            log::warn!("communicator aborted by rank {culprit}: {reason}");
            st.poison = Some(Poison {
                culprit,
                reason: reason.to_owned(),
            });
        }
        drop(st);
        self.cond.notify_all();
    }

    pub fn poison_info(&self) -> Option<PoisonInfo> {
        let st = self.lock();
        st.poison.as_ref().map(|p| PoisonInfo {
            culprit: p.culprit,
            cancelled: st.cancelled.get(p.culprit).copied().unwrap_or(false),
        })
    }

    fn validate_link(&self, link: &Link) -> Result<(), MpError> {
        if !link.unmatched.is_empty() && !link.waiting.is_empty() {
            return Err(MpError::InvariantViolation(format!(
                "link holds {} unmatched sends and {} waiting receives",
                link.unmatched.len(),
                link.waiting.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Monitor");
        d.field("size", &self.size);
        if let Some(st) = self.state.try_lock() {
            d.field("round", &st.round.seq)
                .field("poisoned", &st.poison.is_some());
        }
        d.finish()
    }
}

impl DebugInvariants for Monitor {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Monitor");
    }

    /// Every link is fully paired up, and no collective round holds more
    /// arrivals than ranks.
    fn validate_invariants(&self) -> Result<(), MpError> {
        let st = self.lock();
        for link in st.links.values() {
            self.validate_link(link)?;
        }
        let arrived = st.round.arrived.iter().filter(|a| a.is_some()).count();
        if arrived != st.round.count || arrived > self.size {
            return Err(MpError::InvariantViolation(format!(
                "round {} counts {} arrivals but holds {arrived}",
                st.round.seq, st.round.count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::buffer::Buffer;

    #[test]
    fn links_pair_oldest_first() {
        let m = Monitor::new(2);
        let r1 = m.register_recv(1, 0, ElemType::U8, 1).unwrap();
        let r2 = m.register_recv(1, 0, ElemType::U8, 1).unwrap();
        let s1 = m.enqueue_send(0, 1, ElemType::U8, Bytes::from_static(b"a")).unwrap();
        let s2 = m.enqueue_send(0, 1, ElemType::U8, Bytes::from_static(b"b")).unwrap();
        assert!(m.poll_delivered(0, 1, s2).unwrap());
        assert!(m.poll_delivered(0, 1, s1).unwrap());
        assert_eq!(&m.wait_matched(1, 0, r2).unwrap().data[..], b"b");
        assert_eq!(&m.wait_matched(1, 0, r1).unwrap().data[..], b"a");
        m.validate_invariants().unwrap();
    }

    #[test]
    fn withdrawn_send_is_never_matched() {
        let m = Monitor::new(2);
        let s = m.enqueue_send(0, 1, ElemType::U8, Bytes::from_static(b"x")).unwrap();
        assert!(m.withdraw_send(0, 1, s));
        let r = m.register_recv(1, 0, ElemType::U8, 1).unwrap();
        assert!(m.poll_matched(1, 0, r).unwrap().is_none());
        assert!(m.withdraw_recv(1, 0, r));
    }

    #[test]
    fn unfit_receive_leaves_envelope_queued() {
        let m = Monitor::new(2);
        let s = m.enqueue_send(0, 1, ElemType::U8, Bytes::from_static(b"abcd")).unwrap();
        let short = m.register_recv(1, 0, ElemType::U8, 2).unwrap();
        assert!(matches!(
            m.wait_matched(1, 0, short),
            Err(MpError::Truncated { from: 0, sent: 4, capacity: 2 })
        ));
        let wrong = m.register_recv(1, 0, ElemType::I32, 1).unwrap();
        assert!(matches!(
            m.poll_matched(1, 0, wrong),
            Err(MpError::TypeMismatch { .. })
        ));
        assert!(!m.poll_delivered(0, 1, s).unwrap());

        let ok = m.register_recv(1, 0, ElemType::U8, 4).unwrap();
        assert_eq!(&m.wait_matched(1, 0, ok).unwrap().data[..], b"abcd");
        assert!(m.poll_delivered(0, 1, s).unwrap());
        m.validate_invariants().unwrap();
    }

    #[test]
    fn first_poison_wins() {
        let m = Monitor::new(3);
        m.abort(2, "first");
        m.cancel(0, "second");
        let info = m.poison_info().unwrap();
        assert_eq!(info.culprit, 2);
        assert!(!info.cancelled);
        assert!(matches!(m.checkpoint(0), Err(MpError::Cancelled { rank: 0 })));
        assert!(matches!(
            m.checkpoint(1),
            Err(MpError::Aborted { rank: 1, culprit: 2, .. })
        ));
    }

    #[test]
    fn single_rank_round_resolves_at_once() {
        let m = Monitor::new(1);
        let data = [4u32, 5];
        let out = m
            .collective(0, Contribution::all_gather(Buffer::from_slice(&data), 2))
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), 8);
        m.debug_assert_invariants();
    }
}
