mod util;
use mp_runtime::prelude::*;
use util::*;

#[test]
fn sends_arrive_in_order_per_link() {
    let got = on_group_ok(2, |ctx| {
        let mut seen = Vec::new();
        if ctx.rank() == 0 {
            for i in 0..50u32 {
                ctx.send_slice(&[i], 1)?;
            }
        } else {
            for _ in 0..50 {
                let mut v = [0u32];
                ctx.recv_slice(&mut v, 0)?;
                seen.push(v[0]);
            }
        }
        Ok(seen)
    });
    assert_eq!(got[1], (0..50).collect::<Vec<_>>());
}

#[test]
fn short_message_reports_count() {
    let got = on_group_ok(2, |ctx| {
        if ctx.rank() == 0 {
            ctx.send_slice(&[7i64, 8], 1)?;
            Ok(0)
        } else {
            let mut buf = [0i64; 10];
            let st = ctx.recv_slice(&mut buf, 0)?;
            assert_eq!(st.source, 0);
            assert!(st.complete);
            Ok(st.count)
        }
    });
    assert_eq!(got[1], 2);
}

#[test]
fn oversized_message_is_truncation_error() {
    let got = on_group_ok(2, |ctx| {
        if ctx.rank() == 0 {
            ctx.send_slice(&[1u8, 2, 3, 4], 1)?;
            return Ok(Vec::new());
        }
        let mut short = [0u8; 2];
        assert!(matches!(
            ctx.recv_slice(&mut short, 0),
            Err(MpError::Truncated { from: 0, sent: 4, capacity: 2 })
        ));
        let mut full = [0u8; 4];
        ctx.recv_slice(&mut full, 0)?;
        Ok(full.to_vec())
    });
    assert_eq!(got[1], vec![1, 2, 3, 4]);
}

#[test]
fn element_type_must_match() {
    let got = on_group_ok(2, |ctx| {
        if ctx.rank() == 0 {
            ctx.send_slice(&[1.5f64], 1)?;
            return Ok(0.0);
        }
        let mut wrong = [0i64; 1];
        assert!(matches!(
            ctx.recv_slice(&mut wrong, 0),
            Err(MpError::TypeMismatch { .. })
        ));
        let mut right = [0.0f64; 1];
        ctx.recv_slice(&mut right, 0)?;
        Ok(right[0])
    });
    assert_eq!(got[1], 1.5);
}

#[test]
fn failed_posted_receive_leaves_message_for_the_next() {
    let got = on_group_ok(2, |ctx| {
        if ctx.rank() == 0 {
            let req = ctx.post_send(OwnedBuffer::from_vec(vec![10u32, 20, 30]), 1)?;
            let done = ctx.wait(req)?;
            return Ok(vec![done.status.count as u32]);
        }
        let small = ctx.post_recv(ElemType::U32, 2, 0)?;
        assert!(matches!(ctx.wait(small), Err(MpError::Truncated { sent: 3, .. })));
        let big = ctx.post_recv(ElemType::U32, 8, 0)?;
        let done = ctx.wait(big)?;
        Ok(done.data.expect("payload").to_vec::<u32>()?)
    });
    assert_eq!(got[0], vec![3]);
    assert_eq!(got[1], vec![10, 20, 30]);
}

#[test]
fn bcast_reaches_every_rank() {
    let got = on_group_ok(4, |ctx| {
        let mut data = if ctx.rank() == 2 { vec![5u32, 6, 7] } else { vec![0; 3] };
        ctx.bcast_slice(&mut data, 2)?;
        Ok(data)
    });
    for data in got {
        assert_eq!(data, vec![5, 6, 7]);
    }
}

#[test]
fn reduce_lands_on_root_only() {
    let got = on_group_ok(3, |ctx| {
        let send = [ctx.rank() as i32 + 1, 10];
        let mut recv = [0i32; 2];
        ctx.reduce(
            Buffer::from_slice(&send),
            BufferMut::from_slice(&mut recv),
            Opcode::Prod,
            1,
        )?;
        Ok(recv)
    });
    assert_eq!(got[1], [6, 1000]);
    assert_eq!(got[0], [0, 0]);
    assert_eq!(got[2], [0, 0]);
}

#[test]
fn gather_and_scatter_variable_chunks() {
    let counts = [1usize, 2, 3];
    let got = on_group_ok(3, |ctx| {
        let rank = ctx.rank();
        let mine: Vec<u64> = (0..counts[rank]).map(|i| (rank * 10 + i) as u64).collect();
        let mut all = vec![0u64; if rank == 0 { 6 } else { 0 }];
        ctx.gather(
            Buffer::from_slice(&mine),
            BufferMut::from_slice(&mut all),
            Chunks::PerRank(&counts),
            0,
        )?;
        let mut back = vec![0u64; counts[rank]];
        ctx.scatter(
            Buffer::from_slice(&all),
            BufferMut::from_slice(&mut back),
            Chunks::PerRank(&counts),
            0,
        )?;
        assert_eq!(back, mine);
        Ok(all)
    });
    assert_eq!(got[0], vec![0, 10, 11, 20, 21, 22]);
}

#[test]
fn all_gather_uniform() {
    let got = on_group_ok(3, |ctx| {
        let mine = [ctx.rank() as u8, 0xff];
        let mut all = [0u8; 6];
        ctx.all_gather(Buffer::from_slice(&mine), BufferMut::from_slice(&mut all))?;
        Ok(all)
    });
    for all in got {
        assert_eq!(all, [0, 0xff, 1, 0xff, 2, 0xff]);
    }
}

#[test]
fn disagreeing_collectives_fail_everywhere() {
    let out = on_group(2, |ctx| {
        let send = [1u32];
        let mut recv = [0u32];
        let op = if ctx.rank() == 0 { Opcode::Sum } else { Opcode::Max };
        ctx.all_reduce(Buffer::from_slice(&send), BufferMut::from_slice(&mut recv), op)
    });
    for r in out {
        assert!(matches!(r, Err(MpError::CollectiveMismatch(_))));
    }
}

#[test]
fn posted_exchange_completes_both_ways() {
    let got = on_group_ok(2, |ctx| {
        let peer = 1 - ctx.rank();
        let rx = ctx.post_recv(ElemType::I32, 4, peer)?;
        let tx = ctx.post_send(OwnedBuffer::from_vec(vec![ctx.rank() as i32; 3]), peer)?;
        let sent = ctx.wait(tx)?;
        assert!(sent.is_complete());
        assert_eq!(sent.status.count, 3);
        let done = ctx.wait(rx)?;
        assert_eq!(ctx.outstanding_requests(), 0);
        done.data.expect("payload").to_vec::<i32>()
    });
    assert_eq!(got[0], vec![1, 1, 1]);
    assert_eq!(got[1], vec![0, 0, 0]);
}

#[test]
fn test_polls_until_matched() {
    let got = on_group_ok(2, |ctx| {
        if ctx.rank() == 0 {
            let rx = ctx.post_recv(ElemType::U8, 8, 1)?;
            ctx.barrier()?;
            loop {
                let c = ctx.test(&rx)?;
                if c.is_complete() {
                    assert!(matches!(ctx.test(&rx), Err(MpError::UnknownRequest { .. })));
                    return c.data.expect("payload").to_vec::<u8>();
                }
                std::thread::yield_now();
            }
        } else {
            let tx = ctx.post_send(OwnedBuffer::from_vec(b"ping".to_vec()), 0)?;
            ctx.barrier()?;
            ctx.wait(tx)?;
            Ok(Vec::new())
        }
    });
    assert_eq!(got[0], b"ping");
}

#[test]
fn cancelled_receive_does_not_steal_later_message() {
    let got = on_group_ok(2, |ctx| {
        if ctx.rank() == 1 {
            let rx = ctx.post_recv(ElemType::U32, 1, 0)?;
            assert!(ctx.cancel(rx)?);
            ctx.barrier()?;
            let mut v = [0u32];
            ctx.recv_slice(&mut v, 0)?;
            Ok(v[0])
        } else {
            ctx.barrier()?;
            ctx.send_slice(&[42u32], 1)?;
            Ok(0)
        }
    });
    assert_eq!(got[1], 42);
}

#[test]
fn abort_releases_blocked_receiver() {
    let out = on_group(2, |ctx| {
        if ctx.rank() == 0 {
            ctx.abort("giving up");
            Ok(())
        } else {
            let mut v = [0u8; 1];
            ctx.recv_slice(&mut v, 0).map(|_| ())
        }
    });
    match &out[1] {
        Err(MpError::Aborted { rank: 1, culprit: 0, reason }) => {
            assert!(reason.contains("giving up"))
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn cancel_rank_wakes_collective() {
    let out = on_group(3, |ctx| {
        if ctx.rank() == 2 {
            ctx.cancel_rank(1)?;
            return ctx.checkpoint();
        }
        ctx.barrier()
    });
    assert!(matches!(out[1], Err(MpError::Cancelled { rank: 1 })));
    assert!(matches!(out[0], Err(MpError::Aborted { culprit: 1, .. })));
    assert!(matches!(out[2], Err(MpError::Aborted { culprit: 1, .. })));
}
