#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mp-runtime
//!
//! mp-runtime is a message-passing runtime for cooperating workers: typed
//! point-to-point and collective communication behind one [`Context`]
//! abstraction, with an in-process thread backend, a single-rank backend and
//! an optional MPI backend.
//!
//! ## Features
//! - [`Context`] with blocking and posted point-to-point calls, broadcast,
//!   reduce/all-reduce over [`Opcode`]s, gather/scatter and barriers
//! - [`MtDriver`] running one task per thread, with cancellation and failure
//!   propagation that never leaves a sibling rank blocked
//! - [`InputChannel`]/[`OutputChannel`] stream endpoints bound to one peer
//! - [`BcastReader`]/[`GatherWriter`] collective byte streams
//! - `MpiContext`/`MpiDriver` behind the `mpi-support` feature
//!
//! ## Usage
//!
//! ```
//! use mp_runtime::prelude::*;
//!
//! let driver = MtDriver::new(4).unwrap();
//! driver
//!     .run(&task(|ctx| {
//!         let mut pattern = [0u8; 4];
//!         if ctx.rank() == 0 {
//!             pattern = [1, 2, 3, 4];
//!         }
//!         ctx.bcast_slice(&mut pattern, 0)?;
//!         assert_eq!(pattern, [1, 2, 3, 4]);
//!         assert_eq!(ctx.sum(ctx.rank() as u64)?, 6);
//!         Ok(())
//!     }))
//!     .unwrap();
//! ```
//!
//! ## Configuration
//! [`RuntimeConfig`](config::RuntimeConfig) reads `MP_*` environment
//! variables; see [`config`].
//!
//! ## Logging
//! The crate logs through the `log` facade and installs no logger.

pub mod channel;
pub mod config;
pub mod context;
pub mod data;
pub mod debug_invariants;
pub mod driver;
pub mod mp_error;
pub mod stream;
pub mod wire;

pub use channel::{InputChannel, OutputChannel};
pub use context::{Chunks, Completion, Context, ContextExt, MtContext, Request, UniContext};
pub use data::{Buffer, BufferMut, ElemType, Element, Opcode, OwnedBuffer, Status, opcode_name};
pub use debug_invariants::DebugInvariants;
pub use driver::{CancelHandle, Driver, MtDriver, Task, UniDriver, task};
pub use mp_error::{ErrorClass, MpError};
pub use stream::{BcastReader, GatherWriter};

#[cfg(feature = "mpi-support")]
pub use context::MpiContext;
#[cfg(feature = "mpi-support")]
pub use driver::MpiDriver;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::channel::{InputChannel, OutputChannel};
    pub use crate::config::RuntimeConfig;
    pub use crate::context::{
        Chunks, Completion, Context, ContextExt, MtContext, Request, UniContext,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::context::MpiContext;
    pub use crate::data::{
        Buffer, BufferMut, ElemType, Element, Opcode, OwnedBuffer, Status, opcode_name,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::driver::MpiDriver;
    pub use crate::driver::{CancelHandle, Driver, MtDriver, Task, UniDriver, task};
    pub use crate::mp_error::{ErrorClass, MpError};
    pub use crate::stream::{BcastReader, GatherWriter};
}
