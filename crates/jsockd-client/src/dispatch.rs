//! Command dispatch across a generation's connection queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::protocol::{CommandId, RawResponse};
use crate::connection::{Command, MessageHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no connections available")]
    NoConnections,
    #[error("command {0} timed out")]
    Timeout(CommandId),
    /// The connection worker stopped before answering.
    #[error("command {0} was abandoned by its connection")]
    Abandoned(CommandId),
}

/// Routes commands to connection queues and enforces the round-trip deadline.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    queues: Vec<mpsc::Sender<Command>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(queues: Vec<mpsc::Sender<Command>>, timeout: Duration) -> Self {
        Self { queues, timeout }
    }

    pub fn connections(&self) -> usize {
        self.queues.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First queue with nothing waiting in it, otherwise a random one.
    ///
    /// A queue counts as idle even while its worker is mid-exchange; only
    /// commands still waiting in the channel are visible here.
    fn select(&self) -> Option<(usize, &mpsc::Sender<Command>)> {
        if self.queues.is_empty() {
            return None;
        }
        let idle = self
            .queues
            .iter()
            .position(|q| q.max_capacity() == q.capacity());
        let index = idle.unwrap_or_else(|| fastrand::usize(..self.queues.len()));
        Some((index, &self.queues[index]))
    }

    /// Enqueue a command and wait for its response. Queueing and waiting
    /// share one deadline measured from this call.
    pub async fn dispatch(
        &self,
        query: &str,
        param_json: &str,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<RawResponse, DispatchError> {
        let deadline = Instant::now() + self.timeout;
        let (index, queue) = self.select().ok_or(DispatchError::NoConnections)?;
        let (command, reply) = Command::new(query, param_json, handler);
        let id = command.id;

        match tokio::time::timeout_at(deadline, queue.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(DispatchError::Abandoned(id)),
            Err(_) => return Err(DispatchError::Timeout(id)),
        }
        tracing::trace!(command_id = %id, connection = index, "Command queued");

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DispatchError::Abandoned(id)),
            Err(_) => {
                tracing::debug!(command_id = %id, timeout = ?self.timeout, "Command timed out");
                Err(DispatchError::Timeout(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(n: usize, capacity: usize) -> (Vec<mpsc::Sender<Command>>, Vec<mpsc::Receiver<Command>>) {
        (0..n).map(|_| mpsc::channel(capacity)).unzip()
    }

    fn filler() -> Command {
        Command::new("q", "null", None).0
    }

    #[tokio::test]
    async fn selects_first_idle_queue() {
        let (tx, _rx) = queues(3, 4);
        tx[0].send(filler()).await.unwrap();
        let dispatcher = Dispatcher::new(tx, Duration::from_secs(1));
        assert_eq!(dispatcher.select().map(|(i, _)| i), Some(1));
    }

    #[tokio::test]
    async fn falls_back_to_any_queue_when_all_busy() {
        let (tx, _rx) = queues(3, 4);
        for q in &tx {
            q.send(filler()).await.unwrap();
        }
        let dispatcher = Dispatcher::new(tx, Duration::from_secs(1));
        for _ in 0..32 {
            let (i, _) = dispatcher.select().unwrap();
            assert!(i < 3);
        }
    }

    #[tokio::test]
    async fn no_queues_is_an_error() {
        let dispatcher = Dispatcher::new(Vec::new(), Duration::from_secs(1));
        assert_eq!(
            dispatcher.dispatch("q", "null", None).await,
            Err(DispatchError::NoConnections)
        );
    }

    #[tokio::test]
    async fn delivers_response() {
        let (tx, mut rx) = queues(1, 4);
        let dispatcher = Dispatcher::new(tx, Duration::from_secs(5));
        let mut queue = rx.pop().unwrap();
        tokio::spawn(async move {
            let command = queue.recv().await.unwrap();
            assert_eq!(command.param_json, "41");
            let _ = command.reply.send(RawResponse::ok("42"));
        });
        assert_eq!(
            dispatcher.dispatch("q", "41", None).await,
            Ok(RawResponse::ok("42"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_nobody_answers() {
        let (tx, _rx) = queues(1, 4);
        let dispatcher = Dispatcher::new(tx, Duration::from_millis(200));
        let started = Instant::now();
        let result = dispatcher.dispatch("q", "null", None).await;
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_counts_against_deadline() {
        let (tx, _rx) = queues(1, 1);
        tx[0].send(filler()).await.unwrap();
        let dispatcher = Dispatcher::new(tx, Duration::from_millis(100));
        let result = dispatcher.dispatch("q", "null", None).await;
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn dropped_command_is_abandoned() {
        let (tx, mut rx) = queues(1, 4);
        let dispatcher = Dispatcher::new(tx, Duration::from_secs(5));
        let mut queue = rx.pop().unwrap();
        tokio::spawn(async move {
            drop(queue.recv().await);
        });
        assert!(matches!(
            dispatcher.dispatch("q", "null", None).await,
            Err(DispatchError::Abandoned(_))
        ));
    }

    #[tokio::test]
    async fn closed_queue_is_abandoned() {
        let (tx, rx) = queues(1, 4);
        drop(rx);
        let dispatcher = Dispatcher::new(tx, Duration::from_secs(5));
        assert!(matches!(
            dispatcher.dispatch("q", "null", None).await,
            Err(DispatchError::Abandoned(_))
        ));
    }
}
