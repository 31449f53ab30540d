mod util;
use mp_runtime::prelude::*;
use proptest::prelude::*;
use util::*;

fn all_reduce_i64(values: &[Vec<i64>], op: Opcode) -> Vec<Vec<i64>> {
    on_group_ok(values.len(), |ctx| {
        let send = &values[ctx.rank()];
        let mut recv = vec![0i64; send.len()];
        ctx.all_reduce(Buffer::from_slice(send), BufferMut::from_slice(&mut recv), op)?;
        Ok(recv)
    })
}

/// Elementwise fold computed locally, for comparison.
fn expected(values: &[Vec<i64>], op: Opcode) -> Vec<i64> {
    (0..values[0].len())
        .map(|i| {
            let column: Vec<i64> = values.iter().map(|v| v[i]).collect();
            op.fold(&column).unwrap().unwrap()
        })
        .collect()
}

#[test]
fn logical_ops_normalise_to_zero_or_one() {
    let values = vec![vec![5i64, 0, 0], vec![7, 3, 0]];
    assert_eq!(all_reduce_i64(&values, Opcode::Land)[0], vec![1, 0, 0]);
    assert_eq!(all_reduce_i64(&values, Opcode::Lor)[1], vec![1, 1, 0]);
}

#[test]
fn float_sum_and_max() {
    let got = on_group_ok(4, |ctx| {
        let x = ctx.rank() as f64 * 0.5;
        Ok((ctx.sum(x)?, ctx.max(x)?, ctx.min(-x)?))
    });
    for (sum, max, min) in got {
        assert_eq!(sum, 3.0);
        assert_eq!(max, 1.5);
        assert_eq!(min, -1.5);
    }
}

#[test]
fn every_opcode_has_a_name_and_byte() {
    for op in Opcode::ALL {
        let raw: u8 = op.into();
        assert_eq!(Opcode::try_from(raw).unwrap(), op);
        assert_eq!(op.to_string(), opcode_name(op));
    }
    assert!(matches!(Opcode::try_from(8u8), Err(MpError::UnknownOpcode(8))));
}

#[test]
fn support_matrix() {
    for elem in ElemType::ALL {
        assert!(Opcode::Sum.supports(elem));
        assert!(Opcode::Max.supports(elem));
        assert_eq!(Opcode::Band.supports(elem), elem.is_integer());
        assert_eq!(Opcode::Land.supports(elem), elem.is_integer());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn all_reduce_matches_local_fold(
        op_index in 0usize..8,
        ranks in 1usize..5,
        len in 1usize..6,
        seed in proptest::collection::vec(-1000i64..1000, 30),
    ) {
        let op = Opcode::ALL[op_index];
        let values: Vec<Vec<i64>> = (0..ranks)
            .map(|r| (0..len).map(|i| seed[(r * len + i) % seed.len()]).collect())
            .collect();
        // Products of up to four values in this range stay well inside i64.
        let want = expected(&values, op);
        for got in all_reduce_i64(&values, op) {
            prop_assert_eq!(&got, &want);
        }
    }
}
