use mp_runtime::config::RuntimeConfig;
use mp_runtime::prelude::*;
use serial_test::serial;

const VARS: [&str; 5] = [
    "MP_RANKS",
    "MP_THREAD_STACK_SIZE",
    "MP_THREAD_NAME_PREFIX",
    "MP_STREAM_CHUNK_SIZE",
    "MP_MPI_ABORT_ON_ERROR",
];

fn clear_env() {
    for var in VARS {
        unsafe { std::env::remove_var(var) };
    }
}

#[test]
#[serial]
fn defaults_without_environment() {
    clear_env();
    let cfg = RuntimeConfig::from_env().unwrap();
    assert_eq!(cfg, RuntimeConfig::default());
    assert_eq!(cfg.stream_chunk_size, 64 * 1024);
    assert!(cfg.mpi_abort_on_error);
    assert!(cfg.ranks >= 1);
}

#[test]
#[serial]
fn reads_prefixed_variables() {
    clear_env();
    unsafe {
        std::env::set_var("MP_RANKS", "3");
        std::env::set_var("MP_THREAD_STACK_SIZE", "1048576");
        std::env::set_var("MP_THREAD_NAME_PREFIX", "solver");
        std::env::set_var("MP_MPI_ABORT_ON_ERROR", "false");
    }
    let cfg = RuntimeConfig::from_env().unwrap();
    clear_env();
    assert_eq!(cfg.ranks, 3);
    assert_eq!(cfg.thread_stack_size, Some(1 << 20));
    assert_eq!(cfg.thread_name_prefix, "solver");
    assert!(!cfg.mpi_abort_on_error);
    assert_eq!(MtDriver::from_config(&cfg).unwrap().size(), 3);
}

#[test]
#[serial]
fn rejects_bad_values() {
    clear_env();
    unsafe { std::env::set_var("MP_RANKS", "0") };
    assert!(matches!(RuntimeConfig::from_env(), Err(MpError::InvalidConfig(_))));
    unsafe { std::env::set_var("MP_RANKS", "many") };
    assert!(matches!(RuntimeConfig::from_env(), Err(MpError::InvalidConfig(_))));
    clear_env();
}

#[test]
fn deserializes_from_json() {
    let cfg: RuntimeConfig =
        serde_json::from_str(r#"{ "ranks": 2, "stream_chunk_size": 128 }"#).unwrap();
    assert_eq!(cfg.ranks, 2);
    assert_eq!(cfg.stream_chunk_size, 128);
    assert_eq!(cfg.thread_name_prefix, "mp-rank");
    assert_eq!(cfg.thread_stack_size, None);
    cfg.validate().unwrap();
}
