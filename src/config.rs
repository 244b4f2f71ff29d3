use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::channel::{ChannelSettings, Transport};

/// Per-command-family execution policy. Looked up by the leading token of a
/// command line, with a `"default"` entry as the fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandPolicy {
    /// Per-attempt timeout in seconds.
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between retry attempts, in seconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    #[serde(default)]
    pub description: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    1
}

impl CommandPolicy {
    pub fn new(timeout: u64, max_retries: u32, retry_interval: u64, description: &str) -> Self {
        Self {
            timeout,
            max_retries,
            retry_interval,
            description: description.to_string(),
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub pool_max_size: usize,
    pub pool_min_size: usize,
    /// How long `acquire` waits for a session before failing.
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub health_check_interval: Duration,
    /// Consecutive probe failures before a session is destroyed.
    pub failure_threshold: u32,
    pub attach_timeout: Duration,
    /// Hard cap on bytes accumulated for a single command's output.
    pub output_cap_bytes: usize,
    pub command_policies: HashMap<String, CommandPolicy>,
    pub channel: ChannelSettings,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            pool_max_size: 5,
            pool_min_size: 1,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
            failure_threshold: 3,
            attach_timeout: Duration::from_secs(30),
            output_cap_bytes: 50_000,
            command_policies: builtin_policies(),
            channel: ChannelSettings::default(),
        }
    }
}

fn builtin_policies() -> HashMap<String, CommandPolicy> {
    let mut m = HashMap::new();
    m.insert("version".into(), CommandPolicy::new(10, 3, 1, "agent version"));
    m.insert("help".into(), CommandPolicy::new(10, 3, 1, "agent help"));
    m.insert("thread".into(), CommandPolicy::new(20, 3, 2, "thread dump"));
    m.insert("stack".into(), CommandPolicy::new(25, 3, 2, "method call stacks"));
    m.insert("sc".into(), CommandPolicy::new(25, 3, 2, "class metadata"));
    m.insert("sm".into(), CommandPolicy::new(25, 3, 2, "method metadata"));
    m.insert("jad".into(), CommandPolicy::new(30, 3, 2, "decompile class"));
    m.insert("monitor".into(), CommandPolicy::new(40, 3, 2, "method monitoring"));
    m.insert("watch".into(), CommandPolicy::new(40, 3, 2, "method data watch"));
    m.insert("trace".into(), CommandPolicy::new(40, 3, 2, "call path tracing"));
    m.insert("dashboard".into(), CommandPolicy::new(20, 3, 2, "system dashboard"));
    m.insert("jvm".into(), CommandPolicy::new(20, 3, 2, "JVM runtime info"));
    m.insert("memory".into(), CommandPolicy::new(20, 3, 2, "heap and memory info"));
    m.insert("logger".into(), CommandPolicy::new(15, 3, 2, "logger inspection"));
    m.insert("default".into(), CommandPolicy::new(25, 3, 2, "fallback policy"));
    m
}

/// On-disk shape: every field optional so a partial file overlays defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProbeConfigFile {
    pool_max_size: Option<usize>,
    pool_min_size: Option<usize>,
    pool_connection_timeout: Option<u64>,
    pool_idle_timeout: Option<u64>,
    pool_max_lifetime: Option<u64>,
    pool_health_check_interval: Option<u64>,
    failure_threshold: Option<u32>,
    attach_timeout: Option<u64>,
    output_cap_bytes: Option<usize>,
    #[serde(default)]
    command_policies: HashMap<String, CommandPolicy>,
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).into_owned())
}

impl ProbeConfig {
    /// Load configuration from the environment and, if `JVM_PROBE_CONFIG`
    /// points at a readable JSON file, overlay its contents. Every missing
    /// source falls back to built-in defaults.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let mut config = Self::default();
        config.channel = ChannelSettings::from_env()?;

        if let Ok(path_str) = std::env::var("JVM_PROBE_CONFIG") {
            let path = expand_tilde(&path_str);
            if path.exists() {
                match config.overlay_file(&path) {
                    Ok(()) => info!(path = %path.display(), "Loaded probe configuration file"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to load configuration file, using defaults");
                    }
                }
            } else {
                warn!(path = %path.display(), "JVM_PROBE_CONFIG points at a missing file, using defaults");
            }
        }

        Ok(config)
    }

    fn overlay_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: ProbeConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid JSON in config file {}", path.display()))?;

        if let Some(v) = file.pool_max_size {
            self.pool_max_size = v;
        }
        if let Some(v) = file.pool_min_size {
            self.pool_min_size = v;
        }
        if let Some(v) = file.pool_connection_timeout {
            self.connection_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.pool_idle_timeout {
            self.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.pool_max_lifetime {
            self.max_lifetime = Duration::from_secs(v);
        }
        if let Some(v) = file.pool_health_check_interval {
            self.health_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = file.attach_timeout {
            self.attach_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.output_cap_bytes {
            self.output_cap_bytes = v;
        }
        for (name, policy) in file.command_policies {
            self.command_policies.insert(name.to_lowercase(), policy);
        }
        Ok(())
    }

    /// Persist the tunable subset back to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = ProbeConfigFile {
            pool_max_size: Some(self.pool_max_size),
            pool_min_size: Some(self.pool_min_size),
            pool_connection_timeout: Some(self.connection_timeout.as_secs()),
            pool_idle_timeout: Some(self.idle_timeout.as_secs()),
            pool_max_lifetime: Some(self.max_lifetime.as_secs()),
            pool_health_check_interval: Some(self.health_check_interval.as_secs()),
            failure_threshold: Some(self.failure_threshold),
            attach_timeout: Some(self.attach_timeout.as_secs()),
            output_cap_bytes: Some(self.output_cap_bytes),
            command_policies: self.command_policies.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Resolve the policy for a command line by its leading token, falling
    /// back to the `"default"` entry.
    pub fn policy_for(&self, command: &str) -> CommandPolicy {
        let token = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        self.command_policies
            .get(&token)
            .or_else(|| self.command_policies.get("default"))
            .cloned()
            .unwrap_or_else(|| CommandPolicy::new(25, 3, 2, "fallback policy"))
    }

    pub fn update_policy(&mut self, command: &str, policy: CommandPolicy) {
        self.command_policies.insert(command.to_lowercase(), policy);
    }

    /// Quick probe policy used by the health sweep: one attempt, short timeout.
    pub(crate) fn probe_policy(&self) -> CommandPolicy {
        let mut policy = self.policy_for("version");
        policy.max_retries = 1;
        policy
    }

    pub fn transport(&self) -> &Transport {
        &self.channel.transport
    }
}
