#![allow(dead_code)]
use mp_runtime::prelude::*;
use std::thread;

/// Run `f` once per rank of a fresh `MtContext` group on scoped threads and
/// collect each rank's result in rank order.
pub fn on_group<T, F>(size: usize, f: F) -> Vec<Result<T, MpError>>
where
    T: Send,
    F: Fn(&MtContext) -> Result<T, MpError> + Sync,
{
    let group = MtContext::group(size);
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = group.iter().map(|ctx| s.spawn(move || f(ctx))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Like [`on_group`], unwrapping every rank's result.
pub fn on_group_ok<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&MtContext) -> Result<T, MpError> + Sync,
{
    on_group(size, f)
        .into_iter()
        .enumerate()
        .map(|(rank, r)| r.unwrap_or_else(|e| panic!("rank {rank} failed: {e}")))
        .collect()
}

/// Deterministic byte pattern of length `n`.
pub fn pattern(n: usize, seed: u8) -> Vec<u8> {
    (0..n).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
