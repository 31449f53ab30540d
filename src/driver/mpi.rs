//! One rank per MPI process (feature `mpi-support`).

use crate::config::RuntimeConfig;
use crate::context::{Context, MpiContext};
use crate::driver::{Driver, Task, panic_message};
use crate::mp_error::MpError;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Runs a task once in this process, against the world communicator.
///
/// Every process of the job calls `run`; a failing rank can abort the whole
/// job (`mpi_abort_on_error`) so that its peers do not block forever in a
/// collective it will never enter.
pub struct MpiDriver {
    ctx: MpiContext,
    abort_on_error: bool,
}

impl MpiDriver {
    pub fn new() -> Result<Self, MpError> {
        Self::from_config(crate::config::config())
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self, MpError> {
        Ok(Self {
            ctx: MpiContext::new()?,
            abort_on_error: cfg.mpi_abort_on_error,
        })
    }

    pub fn context(&self) -> &MpiContext {
        &self.ctx
    }
}

impl Driver for MpiDriver {
    fn size(&self) -> usize {
        self.ctx.size()
    }

    fn run(&self, task: &dyn Task) -> Result<(), MpError> {
        let rank = self.ctx.rank();
        let outcome = catch_unwind(AssertUnwindSafe(|| task.run(&self.ctx)));
        let result = outcome.unwrap_or_else(|payload| {
            Err(MpError::Panicked {
                rank,
                message: panic_message(payload.as_ref()),
            })
        });
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.abort_on_error {
                    self.ctx.abort(&e.to_string());
                }
                Err(MpError::RankFailed {
                    rank,
                    source: Box::new(e),
                })
            }
        }
    }
}
