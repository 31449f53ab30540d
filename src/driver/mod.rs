//! Running one task per rank.
//!
//! A [`Driver`] owns the lifecycle of a parallel run: it builds the contexts,
//! runs a [`Task`] once per rank and folds every rank's outcome into one
//! result. The driver decides the backend; tasks only see `&dyn Context`.

pub mod mt;
pub mod uni;

#[cfg(feature = "mpi-support")]
pub mod mpi;

pub use mt::{CancelHandle, MtDriver};
pub use uni::UniDriver;

#[cfg(feature = "mpi-support")]
pub use self::mpi::MpiDriver;

use crate::context::Context;
use crate::mp_error::MpError;
use std::any::Any;

/// Unit of user work, run once per rank.
pub trait Task: Sync {
    fn run(&self, ctx: &dyn Context) -> Result<(), MpError>;
}

impl<F> Task for F
where
    F: Fn(&dyn Context) -> Result<(), MpError> + Sync,
{
    fn run(&self, ctx: &dyn Context) -> Result<(), MpError> {
        self(ctx)
    }
}

/// Pin a closure's signature so it can be passed as a [`Task`].
pub fn task<F>(f: F) -> F
where
    F: Fn(&dyn Context) -> Result<(), MpError> + Sync,
{
    f
}

pub trait Driver {
    /// Number of ranks a run starts.
    fn size(&self) -> usize;

    /// Run `task` on every rank and block until all ranks have stopped.
    ///
    /// A failure is reported as [`MpError::RankFailed`] naming the rank.
    fn run(&self, task: &dyn Task) -> Result<(), MpError>;
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(p.as_ref()), "non-string panic payload");
    }
}
