use crate::channel::CommandChannel;
use crate::config::CommandPolicy;
use crate::error::ProbeError;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Sentinel the agent prints when it is ready for the next command.
const PROMPT_MARKER: char = '$';
/// Generic failure marker in the attach stream.
const ERROR_MARKER: &str = "ERROR";
const TRUNCATION_MARKER: &str = "\n...[output truncated]";

const POLL_STEP: Duration = Duration::from_millis(100);
const DRAIN_WAIT: Duration = Duration::from_millis(10);
const DRAIN_MAX_ROUNDS: usize = 100;
const QUIT_GRACE: Duration = Duration::from_millis(200);
/// Bytes of trailing output kept for prompt scanning once the cap is hit.
const SCAN_TAIL_BYTES: usize = 256;

static DENY_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn deny_patterns() -> &'static [Regex] {
    DENY_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"Can ?not attach to target process").unwrap(),
            Regex::new(r"Unable to attach").unwrap(),
            Regex::new(r"(?i)permission denied").unwrap(),
        ]
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Attaching,
    Ready,
    Executing,
    /// Terminal. Reached via `disconnect` or a channel failure.
    Broken,
}

/// Outcome of one successfully completed command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub truncated: bool,
    #[serde(skip)]
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Drives the line-oriented, prompt-delimited protocol for one target process
/// over one channel: attach handshake, command send/receive, disconnect.
pub struct SessionClient {
    channel: Box<dyn CommandChannel>,
    pid: u32,
    state: SessionState,
    attach_timeout: Duration,
    output_cap_bytes: usize,
}

impl SessionClient {
    pub fn new(
        channel: Box<dyn CommandChannel>,
        pid: u32,
        attach_timeout: Duration,
        output_cap_bytes: usize,
    ) -> Self {
        Self {
            channel,
            pid,
            state: SessionState::Unattached,
            attach_timeout,
            output_cap_bytes,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Run the attach handshake: issue the target pid, then scan accumulated
    /// output until the deny phrase, an error marker, or the prompt shows up.
    #[instrument(skip(self), fields(pid = %self.pid))]
    pub async fn attach(&mut self) -> Result<(), ProbeError> {
        self.state = SessionState::Attaching;

        // The interactive process selector consumes this line; the direct
        // launcher form ignores a leading numeric line.
        if let Err(e) = self.channel.send_line(&self.pid.to_string()).await {
            self.teardown().await;
            return Err(ProbeError::AttachFailed {
                pid: self.pid,
                detail: e.to_string(),
            });
        }

        let deadline = Instant::now() + self.attach_timeout;
        let mut buffer = String::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(POLL_STEP);

            match self.channel.recv_chunk(wait).await {
                Ok(Some(chunk)) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    if let Some(pattern) = deny_patterns().iter().find(|p| p.is_match(&buffer)) {
                        warn!(pid = %self.pid, pattern = %pattern, "Attach denied by target");
                        self.teardown().await;
                        return Err(ProbeError::AttachDenied {
                            pid: self.pid,
                            detail: tail_of(&buffer, 200),
                        });
                    }
                    if buffer.contains(ERROR_MARKER) {
                        self.teardown().await;
                        return Err(ProbeError::AttachFailed {
                            pid: self.pid,
                            detail: tail_of(&buffer, 200),
                        });
                    }
                    if buffer.contains(PROMPT_MARKER) {
                        info!(pid = %self.pid, "Agent session attached");
                        self.state = SessionState::Ready;
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.teardown().await;
                    return Err(ProbeError::AttachFailed {
                        pid: self.pid,
                        detail: e.to_string(),
                    });
                }
            }
        }

        self.teardown().await;
        Err(ProbeError::AttachTimeout {
            pid: self.pid,
            waited: self.attach_timeout,
        })
    }

    /// Send one command line and accumulate output until the prompt returns
    /// or the deadline passes. Accumulation stops at the byte cap; the result
    /// is then flagged truncated while scanning continues so the prompt is
    /// still recognized.
    #[instrument(skip(self), fields(pid = %self.pid, command = %command))]
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ProbeError> {
        if self.state != SessionState::Ready {
            return Err(ProbeError::ChannelBroken(format!(
                "session for pid {} is not ready (state {:?})",
                self.pid, self.state
            )));
        }
        self.state = SessionState::Executing;
        let started = Instant::now();

        // Clear anything a previously timed-out command left behind, so a
        // policy-level retry does not read stale output.
        self.drain().await?;

        if let Err(e) = self.channel.send_line(command).await {
            self.state = SessionState::Broken;
            return Err(e);
        }

        let deadline = started + timeout;
        let mut raw: Vec<u8> = Vec::new();
        let mut scan_tail: Vec<u8> = Vec::new();
        let mut truncated = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(pid = %self.pid, "Command deadline reached");
                self.state = SessionState::Ready;
                return Err(ProbeError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                });
            }
            let wait = (deadline - now).min(POLL_STEP);

            match self.channel.recv_chunk(wait).await {
                Ok(Some(chunk)) => {
                    if !truncated {
                        let room = self.output_cap_bytes.saturating_sub(raw.len());
                        if chunk.len() > room {
                            raw.extend_from_slice(&chunk[..room]);
                            truncated = true;
                            warn!(pid = %self.pid, cap = self.output_cap_bytes, "Output cap reached, truncating");
                        } else {
                            raw.extend_from_slice(&chunk);
                        }
                    }

                    scan_tail.extend_from_slice(&chunk);
                    if scan_tail.len() > SCAN_TAIL_BYTES {
                        let cut = scan_tail.len() - SCAN_TAIL_BYTES;
                        scan_tail.drain(..cut);
                    }
                    if String::from_utf8_lossy(&scan_tail).contains(PROMPT_MARKER) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.state = SessionState::Broken;
                    return Err(e);
                }
            }
        }

        self.state = SessionState::Ready;
        let text = String::from_utf8_lossy(&raw);
        let mut output = strip_echo_and_prompt(&text, command);
        if truncated {
            output.push_str(TRUNCATION_MARKER);
        }

        Ok(ExecutionResult {
            output,
            truncated,
            elapsed: started.elapsed(),
            timestamp: Utc::now(),
        })
    }

    /// Bounded retry around `execute`: timeout-class failures are retried up
    /// to the policy's attempt count with its backoff; broken channels and
    /// everything else surface immediately.
    pub async fn execute_with_policy(
        &mut self,
        command: &str,
        policy: &CommandPolicy,
    ) -> Result<ExecutionResult, ProbeError> {
        let attempts = policy.max_retries.max(1);
        let mut last_error: Option<ProbeError> = None;

        for attempt in 1..=attempts {
            match self.execute(command, policy.timeout_duration()).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(pid = %self.pid, command = %command, attempt, "Command succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    warn!(pid = %self.pid, command = %command, attempt, error = %e, "Command attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(policy.retry_delay()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        Err(ProbeError::RetriesExhausted {
            command: command.to_string(),
            attempts,
            last_error: detail,
        })
    }

    /// Best-effort graceful shutdown: send the quit directive, wait a short
    /// grace period, then force-close the channel. Idempotent, never fails.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Ready {
            if self.channel.send_line("quit").await.is_ok() {
                let _ = self.channel.recv_chunk(QUIT_GRACE).await;
            }
        }
        self.channel.close().await;
        if self.state != SessionState::Broken {
            debug!(pid = %self.pid, "Session disconnected");
        }
        self.state = SessionState::Broken;
    }

    async fn teardown(&mut self) {
        self.channel.close().await;
        self.state = SessionState::Broken;
    }

    async fn drain(&mut self) -> Result<(), ProbeError> {
        for _ in 0..DRAIN_MAX_ROUNDS {
            match self.channel.recv_chunk(DRAIN_WAIT).await {
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.state = SessionState::Broken;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn tail_of(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed
            .chars()
            .skip(count - max_chars)
            .collect::<String>()
    }
}

/// Remove the echoed command line, prompt-only lines, and blank lines from a
/// raw exchange, leaving just the command's payload.
fn strip_echo_and_prompt(text: &str, command: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut echo_skipped = false;

    for line in text.lines() {
        let trimmed = line.trim_end_matches('\r').trim();
        if trimmed.is_empty() {
            continue;
        }
        if !echo_skipped && trimmed.ends_with(command) {
            echo_skipped = true;
            continue;
        }
        // prompt fragments: a bare "$" or a "$"-prefixed leftover
        let without_prompt = trimmed.trim_end_matches(PROMPT_MARKER).trim();
        if without_prompt.is_empty() {
            continue;
        }
        if trimmed.ends_with(PROMPT_MARKER) {
            kept.push(without_prompt);
            continue;
        }
        kept.push(trimmed);
    }

    kept.join("\n")
}
