//! Connection worker: exclusive owner of one socket.
//!
//! Commands arrive on a bounded queue and are processed strictly in order.
//! Per command:
//!
//! ```text
//! WAITING_RESPONSE ─ok/exception─▶ DONE
//!        │
//!     message ─▶ IN_MESSAGE_LOOP ─ok/exception─▶ DONE
//!        │               │
//!        └───────────────┴─ I/O error, bad record, id mismatch, handler failure ─▶ FAILED
//! ```
//!
//! FAILED latches the generation's fatal error and stops the worker. The
//! socket is closed and queued commands are dropped without a response.
//!
//! A crashing process usually closes its sockets before the exit is reaped.
//! An I/O failure therefore waits briefly for the exit to be recorded, so the
//! latch reports the crash rather than the closed connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, RequestCodec, ResponseCodec};
use crate::bridge::protocol::{
    CommandId, MESSAGE_HANDLER_INTERNAL_ERROR, OutboundRecord, RawResponse, ResponseRecord,
    ResponseStatus,
};
use crate::latch::{FatalError, FatalLatch};

/// How long an I/O failure waits for the process exit to be recorded.
const EXIT_SETTLE: Duration = Duration::from_millis(500);

/// Answers `message` records sent by a query while it runs.
///
/// Invoked on the connection worker's task, so the command cannot complete
/// before the handler returns. A failure poisons the whole generation.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message_json: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync,
{
    async fn handle(&self, message_json: &str) -> anyhow::Result<String> {
        self(message_json)
    }
}

/// Wrap a value-level handler: messages are decoded into `M` and replies
/// encoded from `R` with serde_json. Codec failures are handler failures.
pub fn typed_handler<M, R, F>(f: F) -> impl MessageHandler + 'static
where
    M: DeserializeOwned,
    R: Serialize,
    F: Fn(M) -> anyhow::Result<R> + Send + Sync + 'static,
{
    move |message_json: &str| -> anyhow::Result<String> {
        let message: M = serde_json::from_str(message_json)?;
        let reply = f(message)?;
        Ok(serde_json::to_string(&reply)?)
    }
}

/// One unit of work for a connection.
pub struct Command {
    pub id: CommandId,
    pub query: String,
    pub param_json: String,
    pub handler: Option<Arc<dyn MessageHandler>>,
    /// Written at most once; dropped unused if the exchange fails.
    pub reply: oneshot::Sender<RawResponse>,
}

impl Command {
    pub fn new(
        query: impl Into<String>,
        param_json: impl Into<String>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> (Self, oneshot::Receiver<RawResponse>) {
        let (reply, rx) = oneshot::channel();
        let command = Self {
            id: CommandId::next(),
            query: query.into(),
            param_json: param_json.into(),
            handler,
            reply,
        };
        (command, rx)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("param_json", &self.param_json)
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

fn codec_fatal(err: CodecError) -> FatalError {
    match err {
        CodecError::Io(e) => FatalError::Io(e.to_string()),
        other => FatalError::Protocol(other.to_string()),
    }
}

pub struct ConnectionWorker {
    index: usize,
    generation: u64,
    reader: FramedRead<OwnedReadHalf, ResponseCodec>,
    writer: FramedWrite<OwnedWriteHalf, RequestCodec>,
    latch: Arc<FatalLatch>,
    exit: Option<watch::Receiver<Option<String>>>,
}

impl ConnectionWorker {
    pub fn new(
        index: usize,
        generation: u64,
        stream: UnixStream,
        max_record_len: usize,
        latch: Arc<FatalLatch>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            index,
            generation,
            reader: FramedRead::new(read_half, ResponseCodec::with_max_len(max_record_len)),
            writer: FramedWrite::new(write_half, RequestCodec::new()),
            latch,
            exit: None,
        }
    }

    /// Process exit notifications for the generation. I/O failures defer to
    /// an exit published within a short window.
    pub fn with_exit_watch(mut self, exit: watch::Receiver<Option<String>>) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Start the worker task. It exits when `shutdown` fires, when every
    /// sender is dropped, or on the first fatal error.
    pub fn spawn(
        self,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> (mpsc::Sender<Command>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = tokio::spawn(self.run(rx, shutdown));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        tracing::debug!(
            generation = self.generation,
            connection = self.index,
            "Connection worker started"
        );
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };

            if self.latch.is_set() {
                tracing::debug!(
                    connection = self.index,
                    command_id = %command.id,
                    "Generation poisoned, abandoning queued commands"
                );
                break;
            }

            let Command {
                id,
                query,
                param_json,
                handler,
                reply,
            } = command;

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!(connection = self.index, command_id = %id, "Exchange abandoned on shutdown");
                    break;
                }
                outcome = self.exchange(id, query, param_json, handler.as_deref()) => outcome,
            };

            match outcome {
                Ok(response) => {
                    tracing::trace!(
                        connection = self.index,
                        command_id = %id,
                        exception = response.exception,
                        "Command complete"
                    );
                    // The caller may have timed out already.
                    let _ = reply.send(response);
                }
                Err(err) => {
                    tracing::warn!(
                        generation = self.generation,
                        connection = self.index,
                        command_id = %id,
                        error = %err,
                        "Connection worker failed"
                    );
                    if matches!(err, FatalError::Io(_)) {
                        self.await_exit().await;
                    }
                    // The reply is dropped only after the latch is set.
                    self.latch.set(err);
                    drop(reply);
                    break;
                }
            }
        }
        tracing::debug!(
            generation = self.generation,
            connection = self.index,
            "Connection worker stopped"
        );
    }

    async fn await_exit(&mut self) {
        let Some(exit) = self.exit.as_mut() else {
            return;
        };
        let exited = tokio::time::timeout(EXIT_SETTLE, exit.wait_for(Option::is_some))
            .await
            .is_ok_and(|seen| seen.is_ok());
        if !exited {
            tracing::debug!(connection = self.index, "No process exit after connection failure");
        }
    }

    async fn exchange(
        &mut self,
        id: CommandId,
        query: String,
        param_json: String,
        handler: Option<&dyn MessageHandler>,
    ) -> Result<RawResponse, FatalError> {
        self.writer
            .send(OutboundRecord::Command {
                id,
                query,
                param_json,
            })
            .await
            .map_err(codec_fatal)?;

        loop {
            let record = self.read_record(id).await?;
            match record.status {
                ResponseStatus::Ok => return Ok(RawResponse::ok(record.payload)),
                ResponseStatus::Exception => return Ok(RawResponse::exception(record.payload)),
                ResponseStatus::Message => {
                    tracing::trace!(connection = self.index, command_id = %id, "Message from query");
                    let json = match self.answer(handler, &record.payload).await {
                        Ok(json) => json,
                        Err(err) => {
                            let _ = self
                                .writer
                                .send(OutboundRecord::MessageReply {
                                    id,
                                    json: MESSAGE_HANDLER_INTERNAL_ERROR.to_string(),
                                })
                                .await;
                            return Err(err);
                        }
                    };
                    self.writer
                        .send(OutboundRecord::MessageReply { id, json })
                        .await
                        .map_err(codec_fatal)?;
                }
            }
        }
    }

    async fn answer(
        &self,
        handler: Option<&dyn MessageHandler>,
        message_json: &str,
    ) -> Result<String, FatalError> {
        let Some(handler) = handler else {
            return Err(FatalError::Handler("no message handler supplied".to_string()));
        };
        let json = handler
            .handle(message_json)
            .await
            .map_err(|e| FatalError::Handler(format!("{e:#}")))?;
        if json.contains('\0') {
            return Err(FatalError::Handler(
                "reply contains a NUL byte".to_string(),
            ));
        }
        Ok(json)
    }

    async fn read_record(&mut self, id: CommandId) -> Result<ResponseRecord, FatalError> {
        match self.reader.next().await {
            Some(Ok(record)) if id.matches(&record.id) => Ok(record),
            Some(Ok(record)) => Err(FatalError::Protocol(format!(
                "response id {:?} does not match command id {id}",
                record.id
            ))),
            Some(Err(err)) => Err(codec_fatal(err)),
            None => Err(FatalError::Io("connection closed by jsockd".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::DEFAULT_MAX_RECORD_LEN;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    /// Reads NUL-terminated fields written by the client.
    struct Peer {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Peer {
        async fn field(&mut self) -> String {
            let mut buf = Vec::new();
            self.reader.read_until(0, &mut buf).await.unwrap();
            assert_eq!(buf.pop(), Some(0), "field not NUL-terminated");
            String::from_utf8(buf).unwrap()
        }

        async fn command(&mut self) -> (String, String, String) {
            let id = self.field().await;
            let query = self.field().await;
            let param = self.field().await;
            (id, query, param)
        }

        async fn reply(&mut self) -> (String, String) {
            let id = self.field().await;
            let json = self.field().await;
            (id, json)
        }

        async fn line(&mut self, line: String) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn at_eof(&mut self) -> bool {
            let mut byte = [0u8; 1];
            matches!(self.reader.read(&mut byte).await, Ok(0))
        }
    }

    fn start(latch: &Arc<FatalLatch>) -> (mpsc::Sender<Command>, JoinHandle<()>, Peer, CancellationToken) {
        start_with(latch, None)
    }

    fn start_with(
        latch: &Arc<FatalLatch>,
        exit: Option<watch::Receiver<Option<String>>>,
    ) -> (mpsc::Sender<Command>, JoinHandle<()>, Peer, CancellationToken) {
        let (client, server) = UnixStream::pair().unwrap();
        let shutdown = CancellationToken::new();
        let mut worker = ConnectionWorker::new(0, 1, client, DEFAULT_MAX_RECORD_LEN, Arc::clone(latch));
        if let Some(exit) = exit {
            worker = worker.with_exit_watch(exit);
        }
        let (tx, handle) = worker.spawn(4, shutdown.clone());
        let (r, w) = server.into_split();
        let peer = Peer {
            reader: BufReader::new(r),
            writer: w,
        };
        (tx, handle, peer, shutdown)
    }

    #[tokio::test]
    async fn ok_and_exception_responses_are_delivered() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, _handle, mut peer, _shutdown) = start(&latch);

        let (cmd, rx) = Command::new("(m, p) => p + 1", "99", None);
        tx.send(cmd).await.unwrap();
        let (id, query, param) = peer.command().await;
        assert_eq!(query, "(m, p) => p + 1");
        assert_eq!(param, "99");
        peer.line(format!("{id} ok 100\n")).await;
        assert_eq!(rx.await.unwrap(), RawResponse::ok("100"));

        let (cmd, rx) = Command::new("(m, p) => p.x.y", "null", None);
        tx.send(cmd).await.unwrap();
        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} exception \"TypeError\"\n")).await;
        assert_eq!(rx.await.unwrap(), RawResponse::exception("\"TypeError\""));
        assert!(!latch.is_set());
    }

    #[tokio::test]
    async fn message_loop_invokes_handler_in_order() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, _handle, mut peer, _shutdown) = start(&latch);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        let handler = typed_handler(move |msg: String| -> anyhow::Result<String> {
            seen_in_handler.lock().unwrap().push(msg.clone());
            Ok(format!("{msg}-reply"))
        });
        let (cmd, rx) = Command::new("q", "null", Some(Arc::new(handler)));
        tx.send(cmd).await.unwrap();

        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} message \"foo\"\n")).await;
        assert_eq!(peer.reply().await, (id.clone(), "\"foo-reply\"".to_string()));
        peer.line(format!("{id} message \"bar\"\n")).await;
        assert_eq!(peer.reply().await, (id.clone(), "\"bar-reply\"".to_string()));
        peer.line(format!("{id} ok \"bar-reply\"\n")).await;

        assert_eq!(rx.await.unwrap(), RawResponse::ok("\"bar-reply\""));
        assert_eq!(*seen.lock().unwrap(), ["foo", "bar"]);
    }

    #[tokio::test]
    async fn exception_inside_message_loop_completes_command() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, _handle, mut peer, _shutdown) = start(&latch);

        let handler = |_: &str| -> anyhow::Result<String> { Ok("1".to_string()) };
        let (cmd, rx) = Command::new("q", "null", Some(Arc::new(handler)));
        tx.send(cmd).await.unwrap();
        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} message 0\n")).await;
        peer.reply().await;
        peer.line(format!("{id} exception \"late\"\n")).await;
        assert_eq!(rx.await.unwrap(), RawResponse::exception("\"late\""));

        // Worker keeps serving.
        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} ok 2\n")).await;
        assert_eq!(rx.await.unwrap(), RawResponse::ok("2"));
        assert!(!latch.is_set());
    }

    #[tokio::test]
    async fn handler_failure_sends_sentinel_and_poisons() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, handle, mut peer, _shutdown) = start(&latch);

        let handler = |_: &str| -> anyhow::Result<String> { anyhow::bail!("nope") };
        let (cmd, rx) = Command::new("q", "null", Some(Arc::new(handler)));
        tx.send(cmd).await.unwrap();
        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} message {{}}\n")).await;

        assert_eq!(peer.reply().await, (id, MESSAGE_HANDLER_INTERNAL_ERROR.to_string()));
        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert_eq!(latch.get(), Some(FatalError::Handler("nope".to_string())));
        assert!(peer.at_eof().await);
    }

    #[tokio::test]
    async fn missing_handler_poisons() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, handle, mut peer, _shutdown) = start(&latch);

        let (cmd, rx) = Command::new("q", "null", None);
        tx.send(cmd).await.unwrap();
        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} message \"hi\"\n")).await;
        assert_eq!(peer.reply().await.1, MESSAGE_HANDLER_INTERNAL_ERROR);
        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert!(matches!(latch.get(), Some(FatalError::Handler(_))));
    }

    #[tokio::test]
    async fn id_mismatch_poisons_without_delivering() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, handle, mut peer, _shutdown) = start(&latch);

        let (cmd, rx) = Command::new("q", "1", None);
        let (queued, queued_rx) = Command::new("q", "2", None);
        tx.send(cmd).await.unwrap();
        tx.send(queued).await.unwrap();
        let (id, _, _) = peer.command().await;
        let wrong: u64 = id.parse::<u64>().unwrap() + 1_000_000;
        peer.line(format!("{wrong} ok 2\n")).await;

        assert!(rx.await.is_err());
        assert!(queued_rx.await.is_err());
        handle.await.unwrap();
        assert!(matches!(latch.get(), Some(FatalError::Protocol(_))));
    }

    #[tokio::test]
    async fn malformed_record_poisons() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, handle, mut peer, _shutdown) = start(&latch);

        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        let (id, _, _) = peer.command().await;
        peer.line(format!("{id} done 2\n")).await;
        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert!(matches!(latch.get(), Some(FatalError::Protocol(_))));
    }

    #[tokio::test]
    async fn peer_close_is_an_io_error() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, handle, mut peer, _shutdown) = start(&latch);

        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        peer.command().await;
        drop(peer);
        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert!(matches!(latch.get(), Some(FatalError::Io(_))));
    }

    #[tokio::test]
    async fn peer_close_reports_process_exit() {
        let latch = Arc::new(FatalLatch::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        let (tx, handle, mut peer, _shutdown) = start_with(&latch, Some(exit_rx));

        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        peer.command().await;
        drop(peer);

        // The exit monitor records the crash shortly after the socket closes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        latch.set(FatalError::UnexpectedExit("exit status: 3".to_string()));
        exit_tx.send_replace(Some("exit status: 3".to_string()));

        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert_eq!(
            latch.get(),
            Some(FatalError::UnexpectedExit("exit status: 3".to_string()))
        );
    }

    #[tokio::test]
    async fn peer_close_without_exit_is_an_io_error() {
        let latch = Arc::new(FatalLatch::new());
        let (_exit_tx, exit_rx) = watch::channel(None);
        let (tx, handle, mut peer, _shutdown) = start_with(&latch, Some(exit_rx));

        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        peer.command().await;
        drop(peer);

        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert!(matches!(latch.get(), Some(FatalError::Io(_))));
    }

    #[tokio::test]
    async fn poisoned_generation_stops_before_writing() {
        let latch = Arc::new(FatalLatch::new());
        latch.set(FatalError::UnexpectedExit("signal 9".to_string()));
        let (tx, handle, mut peer, _shutdown) = start(&latch);

        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        assert!(rx.await.is_err());
        handle.await.unwrap();
        assert!(peer.at_eof().await);
    }

    #[tokio::test]
    async fn shutdown_abandons_exchange_and_closes_socket() {
        let latch = Arc::new(FatalLatch::new());
        let (tx, handle, mut peer, shutdown) = start(&latch);

        let (cmd, rx) = Command::new("q", "1", None);
        tx.send(cmd).await.unwrap();
        peer.command().await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.await.is_err());
        assert!(peer.at_eof().await);
        assert!(!latch.is_set());
    }
}
