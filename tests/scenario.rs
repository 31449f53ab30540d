//! End-to-end run on four threaded ranks: broadcast, reduce, gather, then a
//! ring of posted messages, all inside one driver run.
use mp_runtime::prelude::*;
use parking_lot::Mutex;

#[test]
fn four_rank_pipeline() {
    let driver = MtDriver::new(4).unwrap();
    let report = Mutex::new(Vec::new());
    driver
        .run(&task(|ctx| {
            let rank = ctx.rank();
            let size = ctx.size();

            let mut pattern = [0u8; 4];
            if rank == 0 {
                pattern = [1, 2, 3, 4];
            }
            ctx.bcast_slice(&mut pattern, 0)?;
            if pattern != [1, 2, 3, 4] {
                return Err(MpError::task(format!("rank {rank} saw {pattern:?}")));
            }

            let total = ctx.sum(rank as u64)?;
            assert_eq!(total, 6);

            let next = (rank + 1) % size;
            let prev = (rank + size - 1) % size;
            let rx = ctx.post_recv(ElemType::U64, 1, prev)?;
            let tx = ctx.post_send(OwnedBuffer::from_vec(vec![rank as u64 * 100]), next)?;
            let got = ctx.wait(rx)?.data.expect("payload").to_vec::<u64>()?;
            ctx.wait(tx)?;
            assert_eq!(got, vec![prev as u64 * 100]);

            let mine = [rank as u32, got[0] as u32];
            let mut all = vec![0u32; if rank == 3 { 2 * size } else { 0 }];
            ctx.gather(
                Buffer::from_slice(&mine),
                BufferMut::from_slice(&mut all),
                Chunks::Uniform,
                3,
            )?;
            if rank == 3 {
                report.lock().extend(all);
            }
            ctx.barrier()
        }))
        .unwrap();
    assert_eq!(
        report.into_inner(),
        vec![0, 300, 1, 0, 2, 100, 3, 200]
    );
}
