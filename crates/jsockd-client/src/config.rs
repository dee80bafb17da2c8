//! Client configuration.
//!
//! `ClientConfig::default()` is not startable on its own: the worker executable
//! must be set via `ClientConfig::new`, `with_exec` or the `JSOCKD` environment
//! variable (`from_env`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_RECORD_LEN;
use crate::worker_log::{LogSink, TracingLogSink};

/// Environment variable carrying the bytecode module signing key.
pub const PUBLIC_KEY_ENV: &str = "JSOCKD_BYTECODE_MODULE_PUBLIC_KEY";
/// Environment variable carrying the worker's log line prefix.
pub const LOG_PREFIX_ENV: &str = "JSOCKD_LOG_PREFIX";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no jsockd executable configured (set JSOCKD or call with_exec)")]
    NotConfigured,
    #[error("threads must be greater than zero when no socket list is given")]
    NoThreads,
    #[error("socket list is empty")]
    NoSockets,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("queue capacity must be greater than zero")]
    ZeroQueueCapacity,
    #[error("log prefix must not contain line breaks")]
    InvalidLogPrefix,
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

pub struct ClientConfig {
    /// Path of the jsockd executable.
    pub jsockd_exec: Option<PathBuf>,
    /// Worker threads, one socket each. Ignored when `sockets` is set.
    pub threads: usize,
    /// Explicit socket paths. When unset, paths are generated in a fresh
    /// temporary directory for every generation.
    pub sockets: Option<Vec<PathBuf>>,
    pub bytecode_module: Option<PathBuf>,
    /// Hex-encoded key used by the worker to verify the bytecode module.
    pub bytecode_module_public_key: Option<String>,
    pub source_map: Option<PathBuf>,
    /// Idle time after which the worker drops a connection's script context.
    pub max_idle_time: Option<Duration>,
    pub max_command_runtime: Option<Duration>,
    /// Round-trip deadline for every command, and the grace period on close.
    pub timeout: Duration,
    /// Deadline for READY and for dialing. Defaults to `timeout`.
    pub startup_timeout: Option<Duration>,
    /// Accept any worker version. Never set this in production.
    pub skip_version_check: bool,
    /// Restarts allowed in any trailing minute. 0 disables restarting.
    pub max_restarts_per_minute: u32,
    pub log_prefix: Option<String>,
    /// Commands that may queue on one connection before submitters wait.
    pub queue_capacity: usize,
    pub max_record_len: usize,
    /// Extra environment for the worker process.
    pub env: Vec<(OsString, OsString)>,
    /// Receives reassembled worker log messages.
    pub log_sink: Arc<dyn LogSink>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            jsockd_exec: None,
            threads: std::thread::available_parallelism().map_or(1, usize::from),
            sockets: None,
            bytecode_module: None,
            bytecode_module_public_key: None,
            source_map: None,
            max_idle_time: None,
            max_command_runtime: None,
            timeout: DEFAULT_TIMEOUT,
            startup_timeout: None,
            skip_version_check: false,
            max_restarts_per_minute: 1,
            log_prefix: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            env: Vec::new(),
            log_sink: Arc::new(TracingLogSink),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("jsockd_exec", &self.jsockd_exec)
            .field("threads", &self.threads)
            .field("sockets", &self.sockets)
            .field("bytecode_module", &self.bytecode_module)
            .field(
                "bytecode_module_public_key",
                &self.bytecode_module_public_key.as_ref().map(|_| "<set>"),
            )
            .field("source_map", &self.source_map)
            .field("max_idle_time", &self.max_idle_time)
            .field("max_command_runtime", &self.max_command_runtime)
            .field("timeout", &self.timeout)
            .field("startup_timeout", &self.startup_timeout)
            .field("skip_version_check", &self.skip_version_check)
            .field("max_restarts_per_minute", &self.max_restarts_per_minute)
            .field("log_prefix", &self.log_prefix)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_record_len", &self.max_record_len)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

impl ClientConfig {
    pub fn new(jsockd_exec: impl Into<PathBuf>) -> Self {
        Self::default().with_exec(jsockd_exec)
    }

    /// Defaults overridden by `JSOCKD`, `JSOCKD_THREADS`, `JSOCKD_TIMEOUT_US`
    /// and `JSOCKD_MAX_RESTARTS_PER_MINUTE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(exec) = std::env::var_os("JSOCKD").filter(|v| !v.is_empty()) {
            config.jsockd_exec = Some(PathBuf::from(exec));
        }
        if let Some(threads) = env_parse::<usize>("JSOCKD_THREADS")? {
            config.threads = threads;
        }
        if let Some(us) = env_parse::<u64>("JSOCKD_TIMEOUT_US")? {
            config.timeout = Duration::from_micros(us);
        }
        if let Some(n) = env_parse::<u32>("JSOCKD_MAX_RESTARTS_PER_MINUTE")? {
            config.max_restarts_per_minute = n;
        }
        Ok(config)
    }

    pub fn with_exec(mut self, jsockd_exec: impl Into<PathBuf>) -> Self {
        self.jsockd_exec = Some(jsockd_exec.into());
        self
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn with_sockets(mut self, sockets: Vec<PathBuf>) -> Self {
        self.sockets = Some(sockets);
        self
    }

    pub fn with_bytecode_module(mut self, path: impl Into<PathBuf>) -> Self {
        self.bytecode_module = Some(path.into());
        self
    }

    pub fn with_bytecode_module_public_key(mut self, hex_key: impl Into<String>) -> Self {
        self.bytecode_module_public_key = Some(hex_key.into());
        self
    }

    pub fn with_source_map(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_map = Some(path.into());
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = Some(idle);
        self
    }

    pub fn with_max_command_runtime(mut self, runtime: Duration) -> Self {
        self.max_command_runtime = Some(runtime);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn with_skip_version_check(mut self, skip: bool) -> Self {
        self.skip_version_check = skip;
        self
    }

    pub fn with_max_restarts_per_minute(mut self, n: u32) -> Self {
        self.max_restarts_per_minute = n;
        self
    }

    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = Some(prefix.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_record_len(mut self, len: usize) -> Self {
        self.max_record_len = len;
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log_sink = Arc::new(sink);
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout.unwrap_or(self.timeout)
    }

    pub fn exec(&self) -> Result<&Path, ConfigError> {
        self.jsockd_exec.as_deref().ok_or(ConfigError::NotConfigured)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.exec()?;
        match &self.sockets {
            Some(sockets) if sockets.is_empty() => return Err(ConfigError::NoSockets),
            None if self.threads == 0 => return Err(ConfigError::NoThreads),
            _ => {}
        }
        if self.timeout.is_zero() || self.startup_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self
            .log_prefix
            .as_deref()
            .is_some_and(|p| p.contains(['\n', '\r']))
        {
            return Err(ConfigError::InvalidLogPrefix);
        }
        Ok(())
    }

    /// Worker command line for the given socket paths.
    pub fn command_args(&self, sockets: &[PathBuf]) -> Vec<OsString> {
        // `-b 00`: records are separated by NUL bytes.
        let mut args: Vec<OsString> = vec!["-b".into(), "00".into()];
        if let Some(module) = &self.bytecode_module {
            args.extend(["-m".into(), module.into()]);
        }
        if let Some(map) = &self.source_map {
            args.extend(["-sm".into(), map.into()]);
        }
        if let Some(idle) = self.max_idle_time.filter(|d| !d.is_zero()) {
            args.extend(["-i".into(), idle.as_micros().to_string().into()]);
        }
        if let Some(runtime) = self.max_command_runtime.filter(|d| !d.is_zero()) {
            args.extend(["-t".into(), runtime.as_micros().to_string().into()]);
        }
        args.extend(["-s".into(), "--".into()]);
        args.extend(sockets.iter().map(OsString::from));
        args
    }

    /// Environment added on top of the inherited one.
    pub fn worker_env(&self) -> Vec<(OsString, OsString)> {
        let mut env = Vec::new();
        if let Some(key) = self.bytecode_module_public_key.as_ref().filter(|k| !k.is_empty()) {
            env.push((PUBLIC_KEY_ENV.into(), key.into()));
        }
        if let Some(prefix) = self.log_prefix.as_ref().filter(|p| !p.is_empty()) {
            env.push((LOG_PREFIX_ENV.into(), prefix.into()));
        }
        env.extend(self.env.iter().cloned());
        env
    }
}
