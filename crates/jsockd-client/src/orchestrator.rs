//! Orchestrator - builds and tears down generations.
//!
//! Flow:
//! 1. Allocate socket paths (or use the configured ones)
//! 2. Spawn jsockd with stdout/stderr captured
//! 3. Wait for `READY <n> <version>` on stdout, check count and version
//! 4. Dial the first n sockets
//! 5. Start one connection worker per socket
//!
//! Any failure kills and reaps the process; the socket directory goes with
//! the `SocketSet`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{OnceCell, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{MalformedReadyLine, RawResponse, ReadyLine};
use crate::bridge::transport::{DialError, SocketSet, dial_all};
use crate::config::{ClientConfig, ConfigError};
use crate::connection::{ConnectionWorker, MessageHandler};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::error::{ClientError, CloseError};
use crate::health::GenerationState;
use crate::latch::{FatalError, FatalLatch};
use crate::version::{JSOCKD_VERSION, VersionInfo};
use crate::worker_log::forward_diagnostics;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create socket directory: {0}")]
    SocketDir(#[source] io::Error),
    #[error("failed to spawn {}: {source}", exec.display())]
    Spawn { exec: PathBuf, source: io::Error },
    #[error("no READY line within {0:?}")]
    ReadyTimeout(Duration),
    #[error(transparent)]
    MalformedReady(#[from] MalformedReadyLine),
    #[error("jsockd version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("jsockd closed stdout before READY")]
    StdoutClosed,
    #[error("jsockd reported {ready} sockets but only {offered} were offered")]
    ReadyCountExceeded { ready: usize, offered: usize },
    #[error("failed to connect to {}: {source}", path.display())]
    Dial { path: PathBuf, source: io::Error },
    #[error("timed out connecting to {} after {timeout:?}", path.display())]
    DialTimeout { path: PathBuf, timeout: Duration },
}

impl From<DialError> for StartupError {
    fn from(err: DialError) -> Self {
        match err {
            DialError::Connect { path, source } => Self::Dial { path, source },
            DialError::Timeout { path, timeout } => Self::DialTimeout { path, timeout },
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One supervised lifetime of a jsockd process and its connections.
///
/// Immutable after construction apart from the latch, the lifecycle state and
/// the teardown bookkeeping.
pub struct Generation {
    number: u64,
    pid: Option<u32>,
    jsockd_version: String,
    dispatcher: Dispatcher,
    latch: Arc<FatalLatch>,
    state: watch::Sender<GenerationState>,
    /// Incremented before every intentional signal.
    deliberate_kills: AtomicU32,
    cancel: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    socket_paths: Vec<PathBuf>,
    socket_dir: Option<PathBuf>,
    sockets: StdMutex<Option<SocketSet>>,
    /// Exit status description, set once by the exit monitor.
    exit: watch::Sender<Option<String>>,
    teardown: OnceCell<Result<(), CloseError>>,
    grace: Duration,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("connections", &self.connections())
            .field("fatal_error", &self.latch.get())
            .finish_non_exhaustive()
    }
}

impl Generation {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Version from the READY line.
    pub fn jsockd_version(&self) -> &str {
        &self.jsockd_version
    }

    pub fn connections(&self) -> usize {
        self.dispatcher.connections()
    }

    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.latch.get()
    }

    /// Socket paths offered to the process.
    pub fn socket_paths(&self) -> &[PathBuf] {
        &self.socket_paths
    }

    /// Generated socket directory, if any. Removed on teardown.
    pub fn socket_dir(&self) -> Option<&Path> {
        self.socket_dir.as_deref()
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo::new().with_jsockd(self.jsockd_version.clone())
    }

    /// Run one command. Fails fast without I/O once the generation is poisoned.
    pub async fn submit(
        &self,
        query: &str,
        param_json: &str,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<RawResponse, ClientError> {
        if let Some(err) = self.latch.get() {
            return Err(err.into());
        }
        match self.dispatcher.dispatch(query, param_json, handler).await {
            Ok(response) => Ok(response),
            Err(DispatchError::Timeout(id)) => Err(ClientError::Timeout {
                id,
                timeout: self.dispatcher.timeout(),
            }),
            Err(DispatchError::NoConnections) => Err(ClientError::NoConnections),
            Err(DispatchError::Abandoned(_)) => Err(self
                .latch
                .get()
                .map_or(ClientError::ConnectionClosed, ClientError::Fatal)),
        }
    }

    /// Record the process exit. Returns true if it was a crash.
    pub(crate) fn record_exit(&self, status: io::Result<ExitStatus>) -> bool {
        let description = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };
        let deliberate = self.deliberate_kills.load(Ordering::SeqCst) > 0;
        if deliberate {
            tracing::info!(generation = self.number, pid = self.pid, status = %description, "jsockd exited");
        } else {
            tracing::error!(
                generation = self.number,
                pid = self.pid,
                status = %description,
                "jsockd exited unexpectedly"
            );
            self.latch.set(FatalError::UnexpectedExit(description.clone()));
            self.cancel.cancel();
        }
        self.state.send_replace(if deliberate {
            GenerationState::ExitedClean
        } else {
            GenerationState::ExitedCrash
        });
        self.exit.send_replace(Some(description));
        !deliberate
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn signal(&self, sig: Signal) -> Result<(), CloseError> {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return Ok(());
        };
        tracing::debug!(generation = self.number, pid, signal = sig.as_str(), "Signalling jsockd");
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(CloseError::Signal(e.to_string())),
        }
    }

    /// Orderly teardown. Only the first call does the work; every call
    /// returns the same outcome.
    pub async fn shutdown(&self) -> Result<(), CloseError> {
        self.teardown
            .get_or_init(|| self.teardown_once())
            .await
            .clone()
    }

    async fn teardown_once(&self) -> Result<(), CloseError> {
        tracing::info!(generation = self.number, pid = self.pid, "Shutting down jsockd");
        self.deliberate_kills.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();

        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(generation = self.number, error = %e, "Connection worker panicked");
            }
        }

        let terminated = self.terminate().await;
        self.cleanup_sockets();
        terminated?;

        match self.latch.get() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn terminate(&self) -> Result<(), CloseError> {
        if self.has_exited() {
            return Ok(());
        }
        let mut exit = self.exit.subscribe();

        self.signal(Signal::SIGTERM)?;
        match tokio::time::timeout(self.grace, exit.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => return Err(CloseError::Wait(e.to_string())),
            Err(_) => {}
        }

        tracing::warn!(
            generation = self.number,
            pid = self.pid,
            grace = ?self.grace,
            "jsockd ignored SIGTERM, sending SIGKILL"
        );
        self.signal(Signal::SIGKILL)?;
        match tokio::time::timeout(self.grace, exit.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(CloseError::Wait(e.to_string())),
            Err(_) => Err(CloseError::ExitTimeout(self.grace)),
        }
    }

    fn cleanup_sockets(&self) {
        if let Some(mut sockets) = lock(&self.sockets).take()
            && let Err(e) = sockets.cleanup()
        {
            tracing::warn!(generation = self.number, error = %e, "Failed to remove socket directory");
        }
    }

    /// Immediate SIGKILL without waiting. For use from `Drop`.
    pub fn abort(&self) {
        self.deliberate_kills.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        if !self.has_exited()
            && let Err(e) = self.signal(Signal::SIGKILL)
        {
            tracing::warn!(generation = self.number, error = %e, "Failed to kill jsockd");
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drain stdout, handing the first READY line to `ready_tx`. Everything else
/// is logged at debug.
async fn scan_stdout(
    stdout: ChildStdout,
    generation: u64,
    ready_tx: oneshot::Sender<Result<ReadyLine, MalformedReadyLine>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if ready_tx.is_some()
                    && let Some(parsed) = ReadyLine::parse(&line)
                    && let Some(tx) = ready_tx.take()
                {
                    let _ = tx.send(parsed);
                    continue;
                }
                tracing::debug!(target: "jsockd::stdout", generation, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(generation, error = %e, "stdout read failed");
                break;
            }
        }
    }
}

/// Spawn a process and bring a generation up to RUNNING.
///
/// On success the caller owns the `Child` and must wait on it and report the
/// exit through `Generation::record_exit`.
pub(crate) async fn launch(
    config: &ClientConfig,
    number: u64,
) -> Result<(Arc<Generation>, Child), StartupError> {
    let exec = config.exec()?;
    let state = watch::Sender::new(GenerationState::Spawning);

    let sockets = match &config.sockets {
        Some(paths) => SocketSet::configured(paths.clone()),
        None => SocketSet::temporary(config.threads).map_err(StartupError::SocketDir)?,
    };

    let mut child = Command::new(exec)
        .args(config.command_args(sockets.paths()))
        .envs(config.worker_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StartupError::Spawn {
            exec: exec.to_path_buf(),
            source,
        })?;
    let pid = child.id();
    tracing::info!(generation = number, ?pid, sockets = sockets.paths().len(), "Spawned jsockd");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_diagnostics(stderr, Arc::clone(&config.log_sink)));
    }

    match handshake(config, number, &mut child, &state, &sockets).await {
        Ok((ready, streams)) => {
            let latch = Arc::new(FatalLatch::new());
            let cancel = CancellationToken::new();
            let exit: watch::Sender<Option<String>> = watch::Sender::new(None);
            let (queues, workers): (Vec<_>, Vec<_>) = streams
                .into_iter()
                .enumerate()
                .map(|(i, stream)| {
                    ConnectionWorker::new(i, number, stream, config.max_record_len, Arc::clone(&latch))
                        .with_exit_watch(exit.subscribe())
                        .spawn(config.queue_capacity, cancel.clone())
                })
                .unzip();
            state.send_replace(GenerationState::Running);
            tracing::info!(
                generation = number,
                ?pid,
                connections = queues.len(),
                version = %ready.version,
                "jsockd ready"
            );

            let generation = Generation {
                number,
                pid,
                jsockd_version: ready.version,
                dispatcher: Dispatcher::new(queues, config.timeout),
                latch,
                state,
                deliberate_kills: AtomicU32::new(0),
                cancel,
                workers: StdMutex::new(workers),
                socket_paths: sockets.paths().to_vec(),
                socket_dir: sockets.dir().map(Path::to_path_buf),
                sockets: StdMutex::new(Some(sockets)),
                exit,
                teardown: OnceCell::new(),
                grace: config.timeout,
            };
            Ok((Arc::new(generation), child))
        }
        Err(err) => {
            tracing::error!(generation = number, ?pid, error = %err, "jsockd failed to start");
            if let Err(e) = child.kill().await {
                tracing::warn!(generation = number, error = %e, "Failed to kill jsockd");
            }
            Err(err)
        }
    }
}

async fn handshake(
    config: &ClientConfig,
    number: u64,
    child: &mut Child,
    state: &watch::Sender<GenerationState>,
    sockets: &SocketSet,
) -> Result<(ReadyLine, Vec<tokio::net::UnixStream>), StartupError> {
    let startup_timeout = config.startup_timeout();
    let stdout = child.stdout.take().ok_or(StartupError::StdoutClosed)?;

    state.send_replace(GenerationState::AwaitingReady);
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(scan_stdout(stdout, number, ready_tx));

    let ready = match tokio::time::timeout(startup_timeout, ready_rx).await {
        Ok(Ok(parsed)) => parsed?,
        Ok(Err(_)) => return Err(StartupError::StdoutClosed),
        Err(_) => return Err(StartupError::ReadyTimeout(startup_timeout)),
    };
    tracing::debug!(generation = number, connections = ready.connections, version = %ready.version, "READY");

    if !VersionInfo::accepts(&ready.version, config.skip_version_check) {
        return Err(StartupError::VersionMismatch {
            expected: JSOCKD_VERSION,
            actual: ready.version,
        });
    }
    let offered = sockets.paths().len();
    if ready.connections > offered {
        return Err(StartupError::ReadyCountExceeded {
            ready: ready.connections,
            offered,
        });
    }

    state.send_replace(GenerationState::Connecting);
    let streams = dial_all(&sockets.paths()[..ready.connections], startup_timeout).await?;
    Ok((ready, streams))
}
