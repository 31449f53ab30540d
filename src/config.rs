//! Runtime configuration, read from `MP_`-prefixed environment variables.
//!
//! | variable                | field                |
//! |-------------------------|----------------------|
//! | `MP_RANKS`              | `ranks`              |
//! | `MP_THREAD_STACK_SIZE`  | `thread_stack_size`  |
//! | `MP_THREAD_NAME_PREFIX` | `thread_name_prefix` |
//! | `MP_STREAM_CHUNK_SIZE`  | `stream_chunk_size`  |
//! | `MP_MPI_ABORT_ON_ERROR` | `mpi_abort_on_error` |

use crate::mp_error::MpError;
use once_cell::sync::OnceCell;
use serde::Deserialize;

fn default_ranks() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.into(),
        Err(_) => 4,
    }
}

fn default_thread_name_prefix() -> String {
    "mp-rank".to_owned()
}

fn default_stream_chunk_size() -> usize {
    64 * 1024
}

fn default_mpi_abort_on_error() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of ranks an `MtDriver` built from this config runs, default:
    /// available parallelism (4 if unknown)
    #[serde(default = "default_ranks")]
    pub ranks: usize,

    /// Stack size of worker threads in bytes; the platform default if unset
    pub thread_stack_size: Option<usize>,

    /// Worker threads are named `{prefix}-{rank}`, default: "mp-rank"
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Bytes per broadcast stream refill, default: 64 KiB
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Call `MPI_Abort` when a task fails under `MpiDriver`, default: true
    #[serde(default = "default_mpi_abort_on_error")]
    pub mpi_abort_on_error: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ranks: default_ranks(),
            thread_stack_size: None,
            thread_name_prefix: default_thread_name_prefix(),
            stream_chunk_size: default_stream_chunk_size(),
            mpi_abort_on_error: default_mpi_abort_on_error(),
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from the environment and validate it.
    pub fn from_env() -> Result<Self, MpError> {
        let cfg = envy::prefixed("MP_")
            .from_env::<RuntimeConfig>()
            .map_err(|e| MpError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), MpError> {
        if self.ranks == 0 {
            return Err(MpError::InvalidConfig("ranks must be at least 1".into()));
        }
        if self.stream_chunk_size == 0 {
            return Err(MpError::InvalidConfig(
                "stream_chunk_size must be at least 1".into(),
            ));
        }
        if self.thread_stack_size == Some(0) {
            return Err(MpError::InvalidConfig(
                "thread_stack_size must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Process-wide configuration, read from the environment on first use.
///
/// An invalid environment is logged and replaced by the defaults.
pub fn config() -> &'static RuntimeConfig {
    static CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();
    CONFIG.get_or_init(|| match RuntimeConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("ignoring MP_* environment: {e}");
            RuntimeConfig::default()
        }
    })
}
