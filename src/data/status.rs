//! Outcome of a communication operation.

/// Which peer an operation talked to, how many elements moved, and whether
/// it has completed.
///
/// Blocking calls always return a complete status. A status with
/// `complete == false` describes a posted request that is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    /// Rank of the peer (the sender for receives, the destination for sends).
    pub source: usize,
    /// Elements actually transferred.
    pub count: usize,
    pub complete: bool,
}

impl Status {
    pub fn complete(source: usize, count: usize) -> Self {
        Self {
            source,
            count,
            complete: true,
        }
    }

    pub fn pending(source: usize) -> Self {
        Self {
            source,
            count: 0,
            complete: false,
        }
    }
}
