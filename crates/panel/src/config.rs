use std::path::PathBuf;
use std::time::Duration;

use q8s_core::form::{JobFormValues, DEFAULT_JOB_NAME};
use q8s_core::job_spec::HardwareBackend;

use crate::controller::{ChannelConfig, DEFAULT_COMM_TARGET, DEFAULT_PROBE_CODE};
use crate::error::PanelError;

/// Scheme of the in-process loopback kernel URL.
pub const MEMORY_ECHO_URL: &str = "memory://echo";

const DEFAULT_SESSION_NAME: &str = "q8s-kernel";
const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Panel configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Kernel WebSocket endpoint. `None` leaves the panel without a backend.
    pub kernel_ws_url: Option<String>,
    /// Name given to the kernel session in logs.
    pub session_name: String,
    pub channel: ChannelConfig,
    /// JSON descriptor used as the job template instead of the baseline.
    pub job_template_path: Option<PathBuf>,
    /// Values pre-filled into the job form.
    pub form: JobFormValues,
    pub log_format: LogFormat,
}

impl PanelConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var              | Default          |
    /// |----------------------|------------------|
    /// | `KERNEL_WS_URL`      | unset            |
    /// | `SESSION_NAME`       | `q8s-kernel`     |
    /// | `COMM_TARGET`        | `my_comm_target` |
    /// | `READY_TIMEOUT_SECS` | `10`             |
    /// | `OPEN_TIMEOUT_SECS`  | `5`              |
    /// | `PROBE_CODE`         | `1+1`            |
    /// | `JOB_TEMPLATE_PATH`  | unset            |
    /// | `JOB_NAME`           | `Quantum-Job`    |
    /// | `HARDWARE_BACKEND`   | `q8s.com/gpu`    |
    /// | `GPU_MPI_COUNT`      | unset            |
    /// | `LOG_FORMAT`         | `text`           |
    pub fn from_env() -> Result<Self, PanelError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PanelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let ready_timeout = secs(&lookup, "READY_TIMEOUT_SECS", DEFAULT_READY_TIMEOUT_SECS)?;
        let open_timeout = secs(&lookup, "OPEN_TIMEOUT_SECS", DEFAULT_OPEN_TIMEOUT_SECS)?;

        let log_format = match non_empty("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(PanelError::Config(format!(
                    "LOG_FORMAT must be 'text' or 'json', got '{other}'"
                )))
            }
        };

        Ok(Self {
            kernel_ws_url: non_empty("KERNEL_WS_URL"),
            session_name: non_empty("SESSION_NAME")
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.into()),
            channel: ChannelConfig {
                target_name: non_empty("COMM_TARGET")
                    .unwrap_or_else(|| DEFAULT_COMM_TARGET.into()),
                probe_code: non_empty("PROBE_CODE").unwrap_or_else(|| DEFAULT_PROBE_CODE.into()),
                ready_timeout,
                open_timeout,
            },
            job_template_path: non_empty("JOB_TEMPLATE_PATH").map(PathBuf::from),
            form: JobFormValues {
                // An explicitly empty name is kept so validation can reject it.
                job_name: lookup("JOB_NAME").unwrap_or_else(|| DEFAULT_JOB_NAME.into()),
                hardware_backend: non_empty("HARDWARE_BACKEND")
                    .unwrap_or_else(|| HardwareBackend::SingleGpu.resource_key().into()),
                gpu_mpi_count: lookup("GPU_MPI_COUNT"),
            },
            log_format,
        })
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, PanelError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| PanelError::Config(format!("{key} must be a whole number of seconds"))),
    }
}
