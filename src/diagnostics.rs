use crate::channel::AgentLauncher;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::pool::{self, SessionPool};
use crate::session::ExecutionResult;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use tracing::instrument;

/// Outcome of one diagnostic request, shaped for callers that want a single
/// self-describing record rather than a `Result`.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub success: bool,
    pub output: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Follow-up advice for the error, where one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticReport {
    fn completed(result: ExecutionResult) -> Self {
        Self {
            success: true,
            output: result.output,
            truncated: result.truncated,
            error: None,
            hint: None,
            elapsed_ms: result.elapsed.as_millis(),
            timestamp: result.timestamp,
        }
    }

    fn failed(error: &ProbeError, elapsed_ms: u128) -> Self {
        Self {
            success: false,
            output: String::new(),
            truncated: false,
            error: Some(error.to_string()),
            hint: error.remediation().map(str::to_string),
            elapsed_ms,
            timestamp: Utc::now(),
        }
    }
}

/// One facet per report so a partial failure (say, a timed-out thread dump)
/// still leaves the others usable.
#[derive(Debug, Clone, Serialize)]
pub struct JvmStatus {
    pub thread: DiagnosticReport,
    pub jvm: DiagnosticReport,
    pub memory: DiagnosticReport,
}

impl JvmStatus {
    pub fn success(&self) -> bool {
        self.thread.success && self.jvm.success && self.memory.success
    }
}

/// A running JVM found on this host.
#[derive(Debug, Clone, Serialize)]
pub struct JvmProcess {
    pub pid: u32,
    pub name: String,
    pub command: String,
}

/// Flags for the thread/stack family of commands.
#[derive(Debug, Default, Clone)]
pub struct StackTraceOptions {
    /// Dump one specific thread.
    pub thread_id: Option<u64>,
    /// Show the N busiest threads instead of all of them.
    pub top_busiest: Option<usize>,
    /// Find the thread currently blocking others.
    pub find_blocking: bool,
    /// CPU sampling window in milliseconds.
    pub sample_interval_ms: Option<u64>,
    pub show_all: bool,
}

/// Flags for method data watching.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Watch expression; defaults to parameters plus the return value.
    pub express: Option<String>,
    /// Conditional expression gating which invocations are recorded.
    pub condition: Option<String>,
    /// Stop after this many matched invocations.
    pub max_hits: u32,
    /// Object expansion depth in the recorded data.
    pub expand_depth: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            express: None,
            condition: None,
            max_hits: 5,
            expand_depth: 2,
        }
    }
}

/// High-level diagnostic operations over the session pool. Every call checks
/// out a session for the target pid, runs one agent command under its
/// registered policy, and returns a `DiagnosticReport`.
pub struct JvmProbe {
    pool: Arc<SessionPool>,
}

impl JvmProbe {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    /// Build a probe from environment configuration and install its pool as
    /// the process-wide one. If a pool is already installed, that one is used.
    pub fn from_env() -> Result<Self> {
        let config = ProbeConfig::load()?;
        let launcher = Arc::new(AgentLauncher::new(config.channel.clone()));
        let pool = pool::init_global(SessionPool::new(config, launcher));
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Run one raw agent command against `pid` under its registered policy.
    #[instrument(skip(self), fields(pid = %pid, command = %command))]
    pub async fn run(&self, pid: u32, command: &str) -> DiagnosticReport {
        let started = Instant::now();
        let policy = self.pool.config().policy_for(command);

        let outcome = async {
            let mut handle = self.pool.acquire(pid).await?;
            let result = handle.execute_with_policy(command, &policy).await;
            handle.release().await;
            result
        }
        .await;

        match outcome {
            Ok(result) => DiagnosticReport::completed(result),
            Err(e) => DiagnosticReport::failed(&e, started.elapsed().as_millis()),
        }
    }

    /// Overview of all threads in the target JVM.
    pub async fn thread_info(&self, pid: u32) -> DiagnosticReport {
        self.run(pid, "thread").await
    }

    /// Thread stacks, narrowed by the given options.
    pub async fn stack_trace(&self, pid: u32, options: &StackTraceOptions) -> DiagnosticReport {
        self.run(pid, &thread_command(options)).await
    }

    /// Call stacks currently leading into one method.
    pub async fn stack_trace_by_method(
        &self,
        pid: u32,
        class_pattern: &str,
        method_pattern: &str,
    ) -> DiagnosticReport {
        self.run(pid, &format!("stack {class_pattern} {method_pattern}"))
            .await
    }

    /// Runtime, class-loading, and GC details of the target JVM.
    pub async fn jvm_info(&self, pid: u32) -> DiagnosticReport {
        self.run(pid, "jvm").await
    }

    /// Combined snapshot: threads, runtime info, and memory in one pass.
    pub async fn jvm_status(&self, pid: u32) -> JvmStatus {
        JvmStatus {
            thread: self.thread_info(pid).await,
            jvm: self.jvm_info(pid).await,
            memory: self.memory_info(pid).await,
        }
    }

    /// Heap, non-heap, and buffer pool usage.
    pub async fn memory_info(&self, pid: u32) -> DiagnosticReport {
        self.run(pid, "memory").await
    }

    /// One snapshot of the live dashboard (threads, memory, GC, runtime).
    pub async fn dashboard(&self, pid: u32) -> DiagnosticReport {
        self.run(pid, "dashboard -n 1").await
    }

    pub async fn agent_version(&self, pid: u32) -> DiagnosticReport {
        self.run(pid, "version").await
    }

    /// Metadata for classes matching `pattern`.
    pub async fn class_info(&self, pid: u32, pattern: &str, detailed: bool) -> DiagnosticReport {
        let command = if detailed {
            format!("sc -d {pattern}")
        } else {
            format!("sc {pattern}")
        };
        self.run(pid, &command).await
    }

    /// Method signatures of classes matching `class_pattern`.
    pub async fn search_method(
        &self,
        pid: u32,
        class_pattern: &str,
        method_pattern: Option<&str>,
        detailed: bool,
    ) -> DiagnosticReport {
        let mut command = String::from("sm");
        if detailed {
            command.push_str(" -d");
        }
        command.push(' ');
        command.push_str(class_pattern);
        if let Some(method) = method_pattern {
            command.push(' ');
            command.push_str(method);
        }
        self.run(pid, &command).await
    }

    /// Decompile a loaded class back to source.
    pub async fn decompile_class(
        &self,
        pid: u32,
        class_pattern: &str,
        method_name: Option<&str>,
    ) -> DiagnosticReport {
        let command = match method_name {
            Some(method) => format!("jad {class_pattern} {method}"),
            None => format!("jad {class_pattern}"),
        };
        self.run(pid, &command).await
    }

    /// Record live invocations of a method.
    pub async fn watch_method(
        &self,
        pid: u32,
        class_pattern: &str,
        method_pattern: &str,
        options: &WatchOptions,
    ) -> DiagnosticReport {
        self.run(pid, &watch_command(class_pattern, method_pattern, options))
            .await
    }

    /// Logger tree of the target, or one logger by name.
    pub async fn logger_info(&self, pid: u32, name: Option<&str>) -> DiagnosticReport {
        let command = match name {
            Some(name) => format!("logger --name {name}"),
            None => "logger".to_string(),
        };
        self.run(pid, &command).await
    }

    /// Change a logger's level at runtime.
    pub async fn set_logger_level(&self, pid: u32, name: &str, level: &str) -> DiagnosticReport {
        self.run(pid, &format!("logger --name {name} --level {level}"))
            .await
    }

    /// Scan this host for running JVMs. Does not touch the pool.
    pub fn list_jvm_processes(&self) -> Vec<JvmProcess> {
        let mut sys = System::new_all();
        sys.refresh_processes();

        let mut found: Vec<JvmProcess> = sys
            .processes()
            .iter()
            .filter(|(_, process)| looks_like_jvm(process.name(), process.cmd()))
            .map(|(pid, process)| JvmProcess {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                command: process.cmd().join(" "),
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }
}

fn looks_like_jvm(name: &str, cmd: &[String]) -> bool {
    if name == "java" || name.starts_with("java") {
        return true;
    }
    cmd.first()
        .map(|argv0| argv0 == "java" || argv0.ends_with("/java"))
        .unwrap_or(false)
}

fn thread_command(options: &StackTraceOptions) -> String {
    let mut command = String::from("thread");
    if let Some(id) = options.thread_id {
        command.push_str(&format!(" {id}"));
        return command;
    }
    if options.find_blocking {
        command.push_str(" -b");
    }
    if let Some(n) = options.top_busiest {
        command.push_str(&format!(" -n {n}"));
    }
    if let Some(ms) = options.sample_interval_ms {
        command.push_str(&format!(" -i {ms}"));
    }
    if options.show_all {
        command.push_str(" --all");
    }
    command
}

fn watch_command(class_pattern: &str, method_pattern: &str, options: &WatchOptions) -> String {
    let express = options
        .express
        .as_deref()
        .unwrap_or("{params, returnObj, throwExp}");
    let mut command = format!("watch {class_pattern} {method_pattern} \"{express}\"");
    if let Some(condition) = &options.condition {
        command.push_str(&format!(" \"{condition}\""));
    }
    command.push_str(&format!(
        " -n {} -x {}",
        options.max_hits, options.expand_depth
    ));
    command
}
