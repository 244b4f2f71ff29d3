use crate::error::ProbeError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const READ_CHUNK_BYTES: usize = 4096;
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Anything that can carry a line-oriented interactive exchange with one
/// attached diagnostic agent. The pool and session client depend only on this.
#[async_trait]
pub trait CommandChannel: Send {
    /// Write one line (terminator appended) to the agent.
    async fn send_line(&mut self, line: &str) -> Result<(), ProbeError>;

    /// Wait up to `wait` for the next chunk of agent output. `Ok(None)` means
    /// nothing arrived in time; `Err` means the channel is gone for good.
    async fn recv_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ProbeError>;

    /// Tear the channel down. Must be idempotent and non-failing.
    async fn close(&mut self);
}

/// Builds a fresh channel attached to a target pid. The pool calls this for
/// every session it creates.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, pid: u32) -> Result<Box<dyn CommandChannel>, ProbeError>;
}

/// Which execution path carries the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Spawn `java -jar <agent> <pid>` directly on this host.
    Local,
    /// Interactive `ssh -tt` to a remote host; `target` is `user@host` or `host`.
    Ssh { target: String, port: u16 },
    /// `docker exec -i` (or another runtime) into a container.
    Container { container: String, runtime: String },
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub transport: Transport,
    pub agent_jar: PathBuf,
    /// Where to fetch the agent jar from when it is missing locally.
    pub agent_url: String,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Local,
            agent_jar: PathBuf::from("arthas-boot.jar"),
            agent_url: "https://arthas.aliyun.com/arthas-boot.jar".to_string(),
        }
    }
}

impl ChannelSettings {
    /// Resolve the transport once from the environment. `JVM_PROBE_SSH_HOST`
    /// wins over `JVM_PROBE_CONTAINER`; neither set means local spawn.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(jar) = std::env::var("JVM_PROBE_AGENT_JAR") {
            settings.agent_jar = PathBuf::from(shellexpand::tilde(&jar).into_owned());
        }
        if let Ok(url) = std::env::var("JVM_PROBE_AGENT_URL") {
            settings.agent_url = url;
        }

        if let Ok(target) = std::env::var("JVM_PROBE_SSH_HOST") {
            let port = std::env::var("JVM_PROBE_SSH_PORT")
                .unwrap_or_else(|_| "22".to_string())
                .parse::<u16>()
                .context("Invalid JVM_PROBE_SSH_PORT")?;
            if !target.contains('@') {
                warn!(target = %target, "JVM_PROBE_SSH_HOST has no user component, ssh will use the current user");
            }
            settings.transport = Transport::Ssh { target, port };
        } else if let Ok(container) = std::env::var("JVM_PROBE_CONTAINER") {
            let runtime =
                std::env::var("JVM_PROBE_CONTAINER_RUNTIME").unwrap_or_else(|_| "docker".into());
            settings.transport = Transport::Container { container, runtime };
        }

        Ok(settings)
    }
}

/// A line channel over a spawned child process: stdin carries commands,
/// stdout/stderr are pumped by reader tasks into one chunk queue.
pub struct ProcessChannel {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    reader_tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ProcessChannel {
    pub fn spawn(mut command: TokioCommand) -> Result<Self, ProbeError> {
        command.stdin(StdProcessStdio::piped());
        command.stdout(StdProcessStdio::piped());
        command.stderr(StdProcessStdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn()?;
        debug!(pid = ?child.id(), "Spawned agent channel process");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
        let mut reader_tasks = Vec::new();

        if let Some(mut stdout) = stdout {
            let tx = tx.clone();
            reader_tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; READ_CHUNK_BYTES];
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 || tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(mut stderr) = stderr {
            reader_tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; READ_CHUNK_BYTES];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 || tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(Self {
            child: Some(child),
            stdin,
            output_rx,
            reader_tasks,
            closed: false,
        })
    }
}

#[async_trait]
impl CommandChannel for ProcessChannel {
    async fn send_line(&mut self, line: &str) -> Result<(), ProbeError> {
        if self.closed {
            return Err(ProbeError::ChannelBroken("channel already closed".into()));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ProbeError::ChannelBroken("agent stdin is gone".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProbeError::ChannelBroken(format!("write failed: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| ProbeError::ChannelBroken(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProbeError::ChannelBroken(format!("flush failed: {e}")))?;
        Ok(())
    }

    async fn recv_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ProbeError> {
        if self.closed {
            return Err(ProbeError::ChannelBroken("channel already closed".into()));
        }
        match timeout(wait, self.output_rx.recv()).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => Err(ProbeError::ChannelBroken(
                "agent process closed its output stream".into(),
            )),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            match child.start_kill() {
                Ok(()) => {
                    let _ = timeout(KILL_GRACE, child.wait()).await;
                }
                Err(e) => debug!(error = %e, "Agent process already gone on close"),
            }
        }
        for task in self.reader_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Default `SessionConnector`: builds the agent argv for the configured
/// transport and hands back a `ProcessChannel`.
pub struct AgentLauncher {
    settings: ChannelSettings,
}

impl AgentLauncher {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }

    /// Fetch the agent jar if it is not already on disk. Only meaningful for
    /// the local transport; remote hosts are expected to carry their own copy.
    async fn ensure_agent_jar(&self) -> Result<(), ProbeError> {
        let jar = &self.settings.agent_jar;
        if jar.exists() {
            return Ok(());
        }
        info!(jar = %jar.display(), url = %self.settings.agent_url, "Agent jar missing, downloading");
        let response = reqwest::get(&self.settings.agent_url)
            .await
            .map_err(|e| ProbeError::Config(anyhow!("failed to fetch agent jar: {e}")))?
            .error_for_status()
            .map_err(|e| ProbeError::Config(anyhow!("agent jar download rejected: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProbeError::Config(anyhow!("agent jar download interrupted: {e}")))?;
        if bytes.is_empty() {
            return Err(ProbeError::Config(anyhow!(
                "downloaded agent jar is empty: {}",
                self.settings.agent_url
            )));
        }
        tokio::fs::write(jar, &bytes).await?;
        info!(jar = %jar.display(), bytes = bytes.len(), "Agent jar downloaded");
        Ok(())
    }

    fn build_command(&self, pid: u32, java: &std::path::Path) -> TokioCommand {
        let jar = self.settings.agent_jar.display().to_string();
        match &self.settings.transport {
            Transport::Local => {
                let mut cmd = TokioCommand::new(java);
                cmd.arg("-jar").arg(&jar).arg(pid.to_string());
                cmd
            }
            Transport::Ssh { target, port } => {
                let mut cmd = TokioCommand::new("ssh");
                cmd.arg("-tt")
                    .arg("-p")
                    .arg(port.to_string())
                    .arg(target)
                    .arg(format!("java -jar {jar} {pid}"));
                cmd
            }
            Transport::Container { container, runtime } => {
                let mut cmd = TokioCommand::new(runtime);
                cmd.arg("exec")
                    .arg("-i")
                    .arg(container)
                    .arg("java")
                    .arg("-jar")
                    .arg(&jar)
                    .arg(pid.to_string());
                cmd
            }
        }
    }
}

#[async_trait]
impl SessionConnector for AgentLauncher {
    #[instrument(skip(self), fields(pid = %pid))]
    async fn connect(&self, pid: u32) -> Result<Box<dyn CommandChannel>, ProbeError> {
        let java = if self.settings.transport == Transport::Local {
            self.ensure_agent_jar().await?;
            which::which("java").map_err(|_| ProbeError::AttachFailed {
                pid,
                detail: "java binary not found on PATH".into(),
            })?
        } else {
            PathBuf::from("java")
        };

        let channel = ProcessChannel::spawn(self.build_command(pid, &java))?;
        Ok(Box::new(channel))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Install a compact log subscriber for test runs. Safe to call from
    /// every test; only the first call wins.
    pub fn init_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    /// One scripted event on a mock channel's output stream.
    pub enum Step {
        Chunk(Vec<u8>),
        /// Output stalls for this long before the next step is visible.
        Delay(Duration),
        /// The channel breaks.
        Break,
    }

    pub fn chunk(s: &str) -> Step {
        Step::Chunk(s.as_bytes().to_vec())
    }

    type SendHook = Box<dyn FnMut(&str) -> Vec<Step> + Send>;

    /// Scripted `CommandChannel` double: an initial output script plays out
    /// on `recv_chunk`, and each `send_line` may append more steps.
    pub struct MockChannel {
        pending: VecDeque<Step>,
        on_send: Option<SendHook>,
        pub sent: Arc<StdMutex<Vec<String>>>,
        pub close_calls: Arc<AtomicU32>,
        broken: bool,
    }

    impl MockChannel {
        pub fn new(script: Vec<Step>) -> Self {
            Self {
                pending: script.into(),
                on_send: None,
                sent: Arc::new(StdMutex::new(Vec::new())),
                close_calls: Arc::new(AtomicU32::new(0)),
                broken: false,
            }
        }

        pub fn with_responder(
            script: Vec<Step>,
            responder: impl FnMut(&str) -> Vec<Step> + Send + 'static,
        ) -> Self {
            let mut channel = Self::new(script);
            channel.on_send = Some(Box::new(responder));
            channel
        }

        /// A channel that attaches cleanly and answers every command with an
        /// echo, one line of output, and the prompt.
        pub fn well_behaved() -> Self {
            Self::with_responder(vec![chunk("[INFO] agent attached\n"), chunk("$ ")], |line| {
                vec![chunk(&format!("{line}\nok\n$ "))]
            })
        }
    }

    #[async_trait]
    impl CommandChannel for MockChannel {
        async fn send_line(&mut self, line: &str) -> Result<(), ProbeError> {
            if self.broken {
                return Err(ProbeError::ChannelBroken("mock channel broken".into()));
            }
            self.sent.lock().unwrap().push(line.to_string());
            if let Some(hook) = self.on_send.as_mut() {
                self.pending.extend(hook(line));
            }
            Ok(())
        }

        async fn recv_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ProbeError> {
            if self.broken {
                return Err(ProbeError::ChannelBroken("mock channel broken".into()));
            }
            let mut remaining = wait;
            loop {
                match self.pending.pop_front() {
                    Some(Step::Chunk(data)) => return Ok(Some(data)),
                    Some(Step::Delay(d)) => {
                        if d > remaining {
                            let leftover = d - remaining;
                            tokio::time::sleep(remaining).await;
                            self.pending.push_front(Step::Delay(leftover));
                            return Ok(None);
                        }
                        tokio::time::sleep(d).await;
                        remaining -= d;
                    }
                    Some(Step::Break) => {
                        self.broken = true;
                        return Err(ProbeError::ChannelBroken("mock channel broke".into()));
                    }
                    None => {
                        tokio::time::sleep(remaining).await;
                        return Ok(None);
                    }
                }
            }
        }

        async fn close(&mut self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_is_local() {
        let settings = ChannelSettings::default();
        assert_eq!(settings.transport, Transport::Local);
        assert_eq!(settings.agent_jar, PathBuf::from("arthas-boot.jar"));
    }

    #[test]
    fn ssh_command_shape() {
        let launcher = AgentLauncher::new(ChannelSettings {
            transport: Transport::Ssh {
                target: "app@prod-7".into(),
                port: 2222,
            },
            ..ChannelSettings::default()
        });
        let cmd = launcher.build_command(4242, std::path::Path::new("java"));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program().to_string_lossy(), "ssh");
        assert_eq!(
            args,
            vec![
                "-tt",
                "-p",
                "2222",
                "app@prod-7",
                "java -jar arthas-boot.jar 4242"
            ]
        );
    }

    #[test]
    fn container_command_shape() {
        let launcher = AgentLauncher::new(ChannelSettings {
            transport: Transport::Container {
                container: "svc-api".into(),
                runtime: "docker".into(),
            },
            ..ChannelSettings::default()
        });
        let cmd = launcher.build_command(1, std::path::Path::new("java"));
        assert_eq!(cmd.as_std().get_program().to_string_lossy(), "docker");
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[..3], ["exec", "-i", "svc-api"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_channel_round_trip() {
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c").arg("read line; echo \"got:$line\"");
        let mut channel = ProcessChannel::spawn(cmd).unwrap();

        channel.send_line("ping").await.unwrap();

        let mut collected = Vec::new();
        for _ in 0..50 {
            match channel.recv_chunk(Duration::from_millis(100)).await {
                Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
                Ok(None) => {}
                Err(_) => break,
            }
            if String::from_utf8_lossy(&collected).contains("got:ping") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("got:ping"));
        channel.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_channel_reports_broken_after_exit() {
        let cmd = TokioCommand::new("true");
        let mut channel = ProcessChannel::spawn(cmd).unwrap();

        // Drain until the closed output stream surfaces as a broken channel.
        let mut saw_broken = false;
        for _ in 0..50 {
            match channel.recv_chunk(Duration::from_millis(50)).await {
                Ok(_) => {}
                Err(ProbeError::ChannelBroken(_)) => {
                    saw_broken = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_broken);
        channel.close().await;
        channel.close().await; // idempotent
    }
}
