//! Bookkeeping of posted non-blocking operations.
//!
//! A `RequestList` maps request ids to backend-specific entries. Every id is
//! inserted at most once and removed at most once, so whatever resource an
//! entry owns is released exactly once.

use crate::debug_invariants::DebugInvariants;
use crate::mp_error::MpError;
use std::collections::HashMap;

#[derive(Debug)]
pub struct RequestList<E> {
    entries: HashMap<u64, E>,
    posted: u64,
    retired: u64,
}

impl<E> Default for RequestList<E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            posted: 0,
            retired: 0,
        }
    }
}

impl<E> RequestList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `entry` under `id`.
    ///
    /// # Errors
    /// `DuplicateRequest` if `id` is already live; the list is unchanged.
    pub fn insert(&mut self, id: u64, entry: E) -> Result<(), MpError> {
        if self.entries.contains_key(&id) {
            return Err(MpError::DuplicateRequest { id });
        }
        self.entries.insert(id, entry);
        self.posted += 1;
        crate::debug_invariants!(self.validate_invariants(), "RequestList::insert");
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<&E, MpError> {
        self.entries.get(&id).ok_or(MpError::UnknownRequest { id })
    }

    /// Retire `id`, handing back its entry.
    pub fn remove(&mut self, id: u64) -> Result<E, MpError> {
        let entry = self.entries.remove(&id).ok_or(MpError::UnknownRequest { id })?;
        self.retired += 1;
        crate::debug_invariants!(self.validate_invariants(), "RequestList::remove");
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every live entry, e.g. when the owning context is dropped.
    pub fn drain(&mut self) -> Vec<(u64, E)> {
        let mut out: Vec<(u64, E)> = self.entries.drain().collect();
        self.retired += out.len() as u64;
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Total number of requests ever inserted and removed.
    pub fn counters(&self) -> (u64, u64) {
        (self.posted, self.retired)
    }
}

impl<E> DebugInvariants for RequestList<E> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "RequestList");
    }

    fn validate_invariants(&self) -> Result<(), MpError> {
        let live = self.posted - self.retired;
        if live != self.entries.len() as u64 {
            return Err(MpError::InvariantViolation(format!(
                "request list posted {} and retired {} but holds {}",
                self.posted,
                self.retired,
                self.entries.len()
            )));
        }
        Ok(())
    }
}
