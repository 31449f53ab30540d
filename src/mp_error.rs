//! MpError: Unified error type for mp-runtime public APIs
//!
//! Every fallible operation in the crate returns `Result<_, MpError>`. The
//! variants fall into four classes (see [`ErrorClass`]): programmer errors
//! that fail fast at the call site, communication errors raised by the
//! transport or by a poisoned communicator, cancellation, and failures
//! reported by user tasks.

use crate::data::buffer::ElemType;
use crate::data::opcode::Opcode;
use thiserror::Error;

/// Coarse classification of an [`MpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Misuse of the API: bad ranks, mismatched buffers, unknown opcodes.
    Programmer,
    /// Transport failures, aborted communicators, root-side I/O failures.
    Communication,
    /// A rank was asked to stop.
    Cancellation,
    /// A user task reported failure or panicked.
    Task,
}

/// Unified error type for mp-runtime operations.
#[derive(Debug, Error)]
pub enum MpError {
    /// A rank argument was outside `[0, size)`.
    #[error("rank {rank} is out of range for a context of size {size}")]
    InvalidRank { rank: usize, size: usize },
    /// Two buffers (or two ranks' buffers) disagree in length.
    #[error("{what}: expected {expected} elements, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Element types of a message and its receive buffer differ.
    #[error("element type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: ElemType, actual: ElemType },
    /// A byte slice is not a whole number of elements.
    #[error("{len} bytes is not a multiple of the {elem} element size")]
    MisalignedBytes { len: usize, elem: ElemType },
    /// An incoming message does not fit the receive buffer.
    #[error("message of {sent} elements from rank {from} exceeds receive capacity {capacity}")]
    Truncated {
        from: usize,
        sent: usize,
        capacity: usize,
    },
    /// A raw opcode value does not name a reduction operator.
    #[error("unknown opcode value {0}")]
    UnknownOpcode(u8),
    /// The opcode has no meaning for the element type (e.g. `BOR` on `f64`).
    #[error("opcode {op} is not defined for element type {elem}")]
    OpcodeNotSupported { op: Opcode, elem: ElemType },
    /// Ranks entered a collective with incompatible arguments.
    #[error("collective mismatch: {0}")]
    CollectiveMismatch(String),
    /// Per-rank chunk counts do not describe the buffers passed in.
    #[error("invalid chunk layout: {0}")]
    InvalidChunks(String),
    /// A single-rank context was asked to receive with nothing queued.
    #[error("rank {rank} has no queued message to receive from itself")]
    NoMatchingSend { rank: usize },
    /// A request handle is not (or no longer) tracked by its context.
    #[error("unknown request {id}")]
    UnknownRequest { id: u64 },
    /// A request id was registered twice.
    #[error("request {id} is already registered")]
    DuplicateRequest { id: u64 },
    /// Runtime configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal bookkeeping no longer satisfies its invariants.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The native transport reported a failure.
    #[error("transport error on rank {rank}: {detail}")]
    Transport { rank: usize, detail: String },
    /// The communicator was poisoned by another rank's failure or cancellation.
    #[error("rank {rank}: communicator aborted by rank {culprit}: {reason}")]
    Aborted {
        rank: usize,
        culprit: usize,
        reason: String,
    },
    /// The root of a collective stream failed to open or read its resource.
    #[error("I/O failure on root rank {root}")]
    RemoteIo { root: usize },
    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The rank observed a cancellation request.
    #[error("rank {rank} was cancelled")]
    Cancelled { rank: usize },

    /// A task reported failure.
    #[error("task failed: {0}")]
    Task(String),
    /// A task panicked.
    #[error("rank {rank} panicked: {message}")]
    Panicked { rank: usize, message: String },
    /// Aggregated outcome of a parallel run: which rank failed and why.
    #[error("rank {rank} failed: {source}")]
    RankFailed {
        rank: usize,
        #[source]
        source: Box<MpError>,
    },
}

impl MpError {
    /// Convenience constructor for task-level failures.
    pub fn task(message: impl Into<String>) -> Self {
        MpError::Task(message.into())
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        use MpError::*;
        match self {
            InvalidRank { .. }
            | LengthMismatch { .. }
            | TypeMismatch { .. }
            | MisalignedBytes { .. }
            | Truncated { .. }
            | UnknownOpcode(_)
            | OpcodeNotSupported { .. }
            | CollectiveMismatch(_)
            | InvalidChunks(_)
            | NoMatchingSend { .. }
            | UnknownRequest { .. }
            | DuplicateRequest { .. }
            | InvalidConfig(_)
            | InvariantViolation(_) => ErrorClass::Programmer,
            Transport { .. } | Aborted { .. } | RemoteIo { .. } | Io(_) => {
                ErrorClass::Communication
            }
            Cancelled { .. } => ErrorClass::Cancellation,
            Task(_) | Panicked { .. } => ErrorClass::Task,
            RankFailed { source, .. } => source.class(),
        }
    }

    /// `true` for errors that only echo another rank's failure.
    pub fn is_secondary(&self) -> bool {
        matches!(self, MpError::Aborted { .. })
    }

    /// `true` if this error (or the error it wraps) is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.class() == ErrorClass::Cancellation
    }

    /// The rank named by a [`MpError::RankFailed`], if any.
    pub fn failed_rank(&self) -> Option<usize> {
        match self {
            MpError::RankFailed { rank, .. } => Some(*rank),
            _ => None,
        }
    }
}
