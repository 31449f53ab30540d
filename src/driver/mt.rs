//! Thread-per-rank driver.

use crate::config::RuntimeConfig;
use crate::context::{Context, MtContext};
use crate::context::monitor::Monitor;
use crate::driver::{Driver, Task, panic_message};
use crate::mp_error::MpError;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

type ActiveRun = Arc<Mutex<Option<Arc<Monitor>>>>;

/// Runs a task on `ranks` OS threads sharing one monitor.
///
/// When a rank fails (error, panic or cancellation) the monitor is aborted,
/// so siblings blocked in a rendezvous or collective are released with
/// [`MpError::Aborted`]. `run` returns only after every worker has been
/// joined.
#[derive(Debug)]
pub struct MtDriver {
    ranks: usize,
    stack_size: Option<usize>,
    name_prefix: String,
    active: ActiveRun,
}

impl MtDriver {
    pub fn new(ranks: usize) -> Result<Self, MpError> {
        Self::from_config(&RuntimeConfig {
            ranks,
            ..RuntimeConfig::default()
        })
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self, MpError> {
        cfg.validate()?;
        Ok(Self {
            ranks: cfg.ranks,
            stack_size: cfg.thread_stack_size,
            name_prefix: cfg.thread_name_prefix.clone(),
            active: Arc::new(Mutex::new(None)),
        })
    }

    /// Handle for cancelling ranks of a run in progress, from any thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            active: Arc::clone(&self.active),
        }
    }

    fn spawn_all<'scope, 'env>(
        &'env self,
        scope: &'scope thread::Scope<'scope, 'env>,
        monitor: &Arc<Monitor>,
        task: &'env dyn Task,
        failures: &'env FailureLog,
    ) -> Vec<(usize, thread::ScopedJoinHandle<'scope, ()>)> {
        let mut handles = Vec::with_capacity(self.ranks);
        for ctx in MtContext::with_monitor(Arc::clone(monitor)) {
            let rank = ctx.rank();
            let mut builder = thread::Builder::new().name(format!("{}-{rank}", self.name_prefix));
            if let Some(bytes) = self.stack_size {
                builder = builder.stack_size(bytes);
            }
            let worker_monitor = Arc::clone(monitor);
            let spawned = builder.spawn_scoped(scope, move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| task.run(&ctx)));
                let result = outcome.unwrap_or_else(|payload| {
                    Err(MpError::Panicked {
                        rank,
                        message: panic_message(payload.as_ref()),
                    })
                });
                match result {
                    Ok(()) => log::trace!("rank {rank} finished"),
                    Err(e) => {
                        worker_monitor.abort(rank, &e.to_string());
                        failures.record(rank, e);
                    }
                }
            });
            match spawned {
                Ok(handle) => handles.push((rank, handle)),
                Err(e) => {
                    // The ranks already running would wait for this one forever.
                    monitor.abort(rank, "worker thread could not be spawned");
                    failures.record(rank, MpError::Io(e));
                }
            }
        }
        handles
    }
}

impl Driver for MtDriver {
    fn size(&self) -> usize {
        self.ranks
    }

    fn run(&self, task: &dyn Task) -> Result<(), MpError> {
        let monitor = Arc::new(Monitor::new(self.ranks));
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(MpError::InvalidConfig(
                    "MtDriver::run called while a run is in progress".into(),
                ));
            }
            *active = Some(Arc::clone(&monitor));
        }
        log::debug!("starting {} ranks", self.ranks);

        let failures = FailureLog::default();
        thread::scope(|scope| {
            for (rank, handle) in self.spawn_all(scope, &monitor, task, &failures) {
                if let Err(payload) = handle.join() {
                    monitor.abort(rank, "worker thread panicked outside its task");
                    failures.record(
                        rank,
                        MpError::Panicked {
                            rank,
                            message: panic_message(payload.as_ref()),
                        },
                    );
                }
            }
        });
        *self.active.lock() = None;
        log::debug!("all {} ranks joined", self.ranks);

        match failures.into_first() {
            None => Ok(()),
            Some((_, err)) if err.is_secondary() => {
                // Only echoes of a poison no task reported as its own failure.
                let info = monitor.poison_info();
                match info {
                    Some(info) if info.cancelled => Err(MpError::RankFailed {
                        rank: info.culprit,
                        source: Box::new(MpError::Cancelled { rank: info.culprit }),
                    }),
                    Some(info) => Err(MpError::RankFailed {
                        rank: info.culprit,
                        source: Box::new(err),
                    }),
                    None => Err(err),
                }
            }
            Some((rank, err)) => Err(MpError::RankFailed {
                rank,
                source: Box::new(err),
            }),
        }
    }
}

/// First failure of a run, preferring root causes over the `Aborted`
/// errors they trigger on siblings.
#[derive(Default)]
struct FailureLog {
    first: Mutex<Option<(usize, MpError)>>,
}

impl FailureLog {
    fn record(&self, rank: usize, err: MpError) {
        let mut first = self.first.lock();
        let replace = match first.as_ref() {
            None => true,
            Some((_, kept)) => kept.is_secondary() && !err.is_secondary(),
        };
        if replace {
            if let Some((old_rank, old)) = first.replace((rank, err)) {
                log::debug!("rank {old_rank}: {old} (superseded by a root cause)");
            }
        } else {
            log::debug!("rank {rank}: {err} (not reported, an earlier failure wins)");
        }
    }

    fn into_first(self) -> Option<(usize, MpError)> {
        self.first.into_inner()
    }
}

/// Cancels ranks of the run currently executing on an [`MtDriver`].
///
/// Outside a run every call is a no-op returning `false`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    active: ActiveRun,
}

impl CancelHandle {
    /// Cancel `rank`: it fails with `Cancelled` at its next blocking point,
    /// its siblings with `Aborted`.
    pub fn cancel_rank(&self, rank: usize) -> bool {
        match self.active.lock().as_ref() {
            Some(monitor) if rank < monitor.size() => {
                monitor.cancel(rank, "cancel handle");
                true
            }
            _ => false,
        }
    }

    /// Cancel every rank of the run.
    pub fn cancel_all(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(monitor) => {
                for rank in 0..monitor.size() {
                    monitor.cancel(rank, "cancel handle");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::task;

    #[test]
    fn zero_ranks_rejected() {
        assert!(matches!(MtDriver::new(0), Err(MpError::InvalidConfig(_))));
    }

    #[test]
    fn root_cause_outranks_echoes() {
        let log = FailureLog::default();
        log.record(
            1,
            MpError::Aborted {
                rank: 1,
                culprit: 2,
                reason: "x".into(),
            },
        );
        log.record(2, MpError::task("real failure"));
        log.record(0, MpError::task("later failure"));
        let (rank, err) = log.into_first().unwrap();
        assert_eq!(rank, 2);
        assert!(err.to_string().contains("real failure"));
    }

    #[test]
    fn cancel_handle_idle_outside_run() {
        let driver = MtDriver::new(2).unwrap();
        let handle = driver.cancel_handle();
        assert!(!handle.is_active());
        assert!(!handle.cancel_all());
        driver.run(&task(|_| Ok(()))).unwrap();
        assert!(!handle.is_active());
    }
}
