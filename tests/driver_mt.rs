use mp_runtime::config::RuntimeConfig;
use mp_runtime::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn every_rank_runs_exactly_once() {
    let hits: Vec<AtomicUsize> = (0..6).map(|_| AtomicUsize::new(0)).collect();
    let driver = MtDriver::new(6).unwrap();
    driver
        .run(&task(|ctx| {
            hits[ctx.rank()].fetch_add(1, Ordering::SeqCst);
            ctx.barrier()
        }))
        .unwrap();
    assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
}

#[test]
fn failing_rank_is_named_and_siblings_released() {
    let driver = MtDriver::new(4).unwrap();
    let err = driver
        .run(&task(|ctx| {
            if ctx.rank() == 3 {
                return Err(MpError::task("disk full"));
            }
            // The other ranks would wait here forever without the abort.
            ctx.barrier()
        }))
        .unwrap_err();
    match err {
        MpError::RankFailed { rank: 3, source } => {
            assert!(matches!(*source, MpError::Task(ref m) if m == "disk full"));
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn panic_becomes_rank_failure() {
    let driver = MtDriver::new(3).unwrap();
    let err = driver
        .run(&task(|ctx| {
            if ctx.rank() == 1 {
                panic!("boom");
            }
            let mut v = [0u8; 1];
            ctx.recv_slice(&mut v, 1).map(|_| ())
        }))
        .unwrap_err();
    assert_eq!(err.failed_rank(), Some(1));
    assert_eq!(err.class(), ErrorClass::Task);
    assert!(err.to_string().contains("boom"));
}

#[test]
fn cancel_handle_stops_a_running_task() {
    let driver = MtDriver::new(2).unwrap();
    let handle = driver.cancel_handle();
    let canceller = std::thread::spawn(move || {
        while !handle.is_active() {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel_rank(0)
    });
    let err = driver
        .run(&task(|ctx| {
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap_err();
    assert!(canceller.join().unwrap());
    assert!(err.is_cancellation());
    assert_eq!(err.failed_rank(), Some(0));
}

#[test]
fn driver_is_reusable_after_failure() {
    let driver = MtDriver::new(2).unwrap();
    assert!(driver.run(&task(|_| Err(MpError::task("first")))).is_err());
    driver
        .run(&task(|ctx| {
            assert_eq!(ctx.sum(1u32)?, 2);
            Ok(())
        }))
        .unwrap();
}

#[test]
fn config_names_and_sizes_threads() {
    let cfg = RuntimeConfig {
        ranks: 2,
        thread_stack_size: Some(256 * 1024),
        thread_name_prefix: "worker".into(),
        ..RuntimeConfig::default()
    };
    let driver = MtDriver::from_config(&cfg).unwrap();
    assert_eq!(driver.size(), 2);
    driver
        .run(&task(|ctx| {
            let name = std::thread::current().name().map(str::to_owned);
            assert_eq!(name, Some(format!("worker-{}", ctx.rank())));
            Ok(())
        }))
        .unwrap();
}
