//! Pooled interactive diagnostic sessions against running JVM processes.
//!
//! A [`SessionPool`] keeps attached agent sessions alive per target pid and
//! hands them out one user at a time; [`JvmProbe`] layers the actual
//! diagnostic operations (thread dumps, memory info, decompilation, method
//! watching) on top. Sessions speak a line-oriented, prompt-delimited
//! protocol over a [`channel::CommandChannel`], which may be a local process,
//! an ssh exec, or a container exec.

pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod pool;
pub mod session;

pub use channel::{AgentLauncher, ChannelSettings, CommandChannel, SessionConnector, Transport};
pub use config::{CommandPolicy, ProbeConfig};
pub use diagnostics::{
    DiagnosticReport, JvmProbe, JvmProcess, JvmStatus, StackTraceOptions, WatchOptions,
};
pub use error::ProbeError;
pub use pool::{global, init_global, PoolStats, SessionHandle, SessionPool};
pub use session::{ExecutionResult, SessionClient, SessionState};
