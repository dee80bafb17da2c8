//! Process supervisor - exit monitoring and bounded restart.
//!
//! Every generation gets a monitor task that owns its `Child`. When the
//! process exits without a deliberate kill the generation is poisoned, and if
//! it is still current and the client is not closing, a replacement is built
//! and published while the restart budget allows.
//!
//! The current generation lives in a `watch` channel: submitters clone the
//! `Arc` out of it and never wait on a restart in progress.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::bridge::protocol::RawResponse;
use crate::config::ClientConfig;
use crate::connection::MessageHandler;
use crate::error::{ClientError, CloseError};
use crate::health::HealthSnapshot;
use crate::orchestrator::{Generation, launch};

const RESTART_WINDOW: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sliding one-minute restart allowance.
#[derive(Debug)]
pub struct RestartBudget {
    max_per_minute: u32,
    history: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            history: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.history.front() {
            if now.saturating_duration_since(oldest) >= RESTART_WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a restart at `now` if the trailing minute has room for it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.history.len() >= self.max_per_minute as usize {
            return false;
        }
        self.history.push_back(now);
        true
    }

    /// Restarts recorded within the trailing minute.
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.history.len()
    }
}

pub(crate) struct Supervisor {
    config: ClientConfig,
    current: watch::Sender<Arc<Generation>>,
    budget: StdMutex<RestartBudget>,
    closing: AtomicBool,
    next_generation: AtomicU64,
    last_restart_error: StdMutex<Option<String>>,
}

impl Supervisor {
    /// Validate `config`, bring up generation 1 and start monitoring it.
    pub(crate) async fn start(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        config.validate()?;
        let (generation, child) = launch(&config, 1).await?;
        let supervisor = Arc::new(Self {
            budget: StdMutex::new(RestartBudget::new(config.max_restarts_per_minute)),
            config,
            current: watch::Sender::new(Arc::clone(&generation)),
            closing: AtomicBool::new(false),
            next_generation: AtomicU64::new(2),
            last_restart_error: StdMutex::new(None),
        });
        supervisor.watch_generation(generation, child);
        Ok(supervisor)
    }

    pub(crate) fn current(&self) -> Arc<Generation> {
        Arc::clone(&self.current.borrow())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Generation>> {
        self.current.subscribe()
    }

    /// Run a command on the current generation. A poisoned generation that
    /// could not be replaced reports the restart failure too.
    pub(crate) async fn submit(
        &self,
        query: &str,
        param_json: &str,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<RawResponse, ClientError> {
        match self.current().submit(query, param_json, handler).await {
            Err(ClientError::Fatal(fatal)) => match lock(&self.last_restart_error).clone() {
                Some(restart_error) => Err(ClientError::RestartFailed {
                    fatal,
                    restart_error,
                }),
                None => Err(ClientError::Fatal(fatal)),
            },
            other => other,
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn watch_generation(self: &Arc<Self>, generation: Arc<Generation>, child: Child) {
        tokio::spawn(Arc::clone(self).monitor(generation, child));
    }

    async fn monitor(self: Arc<Self>, generation: Arc<Generation>, mut child: Child) {
        let status = child.wait().await;
        drop(child);
        if !generation.record_exit(status) {
            return;
        }
        if self.is_closing() {
            tracing::debug!(generation = generation.number(), "Client closing, not restarting");
            return;
        }
        if !Arc::ptr_eq(&self.current.borrow(), &generation) {
            return;
        }

        let allowed = lock(&self.budget).try_acquire(Instant::now());
        if !allowed {
            tracing::error!(
                generation = generation.number(),
                max_restarts_per_minute = self.config.max_restarts_per_minute,
                "Restart limit reached, not restarting jsockd"
            );
            return;
        }

        let number = self.next_generation.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(generation = number, replacing = generation.number(), "Restarting jsockd");
        match launch(&self.config, number).await {
            Ok((next, child)) => {
                self.current.send_replace(Arc::clone(&next));
                self.watch_generation(Arc::clone(&next), child);
                *lock(&self.last_restart_error) = None;
                // close() may have run while the replacement was starting.
                if self.is_closing() {
                    let _ = next.shutdown().await;
                }
            }
            Err(err) => {
                tracing::error!(generation = number, error = %err, "Restart failed");
                *lock(&self.last_restart_error) = Some(err.to_string());
            }
        }
    }

    /// Stop restarting and tear down the current generation.
    pub(crate) async fn close(&self) -> Result<(), CloseError> {
        self.closing.store(true, Ordering::SeqCst);
        self.current().shutdown().await
    }

    /// Kill without waiting. Used when the client is dropped unclosed.
    pub(crate) fn abort(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.current().abort();
    }

    pub(crate) fn health(&self) -> HealthSnapshot {
        let generation = self.current();
        HealthSnapshot {
            generation: generation.number(),
            state: generation.state(),
            pid: generation.pid(),
            connections: generation.connections(),
            jsockd_version: generation.jsockd_version().to_string(),
            fatal_error: generation.fatal_error().map(|e| e.to_string()),
            restarts_in_window: lock(&self.budget).in_window(Instant::now()),
            last_restart_error: lock(&self.last_restart_error).clone(),
            closed: self.is_closing(),
        }
    }
}
