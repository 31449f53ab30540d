//! Single-rank driver.

use crate::context::UniContext;
use crate::driver::{Driver, Task, panic_message};
use crate::mp_error::MpError;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Runs a task once, on the calling thread, against a fresh [`UniContext`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UniDriver;

impl UniDriver {
    pub fn new() -> Self {
        UniDriver
    }
}

impl Driver for UniDriver {
    fn size(&self) -> usize {
        1
    }

    fn run(&self, task: &dyn Task) -> Result<(), MpError> {
        let ctx = UniContext::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| task.run(&ctx)));
        let result = outcome.unwrap_or_else(|payload| {
            Err(MpError::Panicked {
                rank: 0,
                message: panic_message(payload.as_ref()),
            })
        });
        if ctx.queued() > 0 {
            log::debug!("{} self-sent messages were never received", ctx.queued());
        }
        result.map_err(|e| MpError::RankFailed {
            rank: 0,
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextExt};
    use crate::driver::task;

    #[test]
    fn runs_once_on_rank_zero() {
        let seen = std::sync::atomic::AtomicUsize::new(0);
        UniDriver::new()
            .run(&task(|ctx| {
                assert_eq!((ctx.rank(), ctx.size()), (0, 1));
                assert_eq!(ctx.sum(21i64)?, 21);
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_is_reported() {
        let err = UniDriver::new()
            .run(&task(|_| panic!("kaboom")))
            .unwrap_err();
        assert_eq!(err.failed_rank(), Some(0));
        assert!(err.to_string().contains("kaboom"));
    }
}
