use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("attach to process {pid} denied: {detail}")]
    AttachDenied { pid: u32, detail: String },

    #[error("attach to process {pid} failed: {detail}")]
    AttachFailed { pid: u32, detail: String },

    #[error("attach to process {pid} timed out after {waited:?}")]
    AttachTimeout { pid: u32, waited: Duration },

    #[error("session channel broken: {0}")]
    ChannelBroken(String),

    #[error("command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("no session for process {pid} became available within {waited:?}")]
    PoolExhausted { pid: u32, waited: Duration },

    #[error("command '{command}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        last_error: String,
    },

    #[error("pool is shut down")]
    PoolShutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl ProbeError {
    /// Timeout-class failures may be retried against the same session after a
    /// drain; everything else either needs a fresh session or will never
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::CommandTimeout { .. })
    }

    /// True for failures that invalidate the session they occurred on.
    pub fn poisons_session(&self) -> bool {
        matches!(self, ProbeError::ChannelBroken(_) | ProbeError::Io(_))
    }

    /// Human-readable follow-up advice, where one exists for the error kind.
    /// Surfaced by the diagnostic façade alongside the failure itself.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            ProbeError::AttachDenied { .. } => Some(
                "run the probe as the same user as the target JVM, or with elevated privileges",
            ),
            ProbeError::AttachFailed { .. } => {
                Some("verify the target pid belongs to a running JVM and that java is on PATH")
            }
            ProbeError::AttachTimeout { .. } => {
                Some("the target JVM may be wedged or under heavy load; retry or raise the attach timeout")
            }
            ProbeError::PoolExhausted { .. } => {
                Some("all pooled sessions for this pid are busy; retry later or raise pool max_size")
            }
            ProbeError::CommandTimeout { .. } => {
                Some("raise the command timeout in the policy registry if this command is expected to be slow")
            }
            _ => None,
        }
    }
}
