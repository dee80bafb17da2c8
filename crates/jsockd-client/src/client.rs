//! Client facade.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{OnceCell, watch};

use crate::bridge::protocol::{RawResponse, Response};
use crate::config::ClientConfig;
use crate::connection::{MessageHandler, typed_handler};
use crate::error::{ClientError, CloseError};
use crate::health::HealthSnapshot;
use crate::orchestrator::Generation;
use crate::supervisor::Supervisor;
use crate::version::VersionInfo;

/// Handle to a supervised jsockd process.
///
/// Commands are spread over the process's connections; if the process dies
/// it is restarted within the configured budget. Call [`close`](Self::close)
/// for an orderly shutdown. Dropping an unclosed client kills the process.
pub struct JsockdClient {
    supervisor: Arc<Supervisor>,
    closed: OnceCell<Result<(), CloseError>>,
}

impl std::fmt::Debug for JsockdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsockdClient")
            .field("generation", &self.supervisor.current())
            .field("closed", &self.closed.initialized())
            .finish()
    }
}

fn decode<R: DeserializeOwned>(raw: RawResponse) -> Result<Response<R>, ClientError> {
    if raw.exception {
        return Ok(Response {
            exception: true,
            result: None,
            raw,
        });
    }
    let result = serde_json::from_str(&raw.result_json)?;
    Ok(Response {
        exception: false,
        result: Some(result),
        raw,
    })
}

impl JsockdClient {
    /// Spawn jsockd and wait until it is ready.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let supervisor = Supervisor::start(config).await?;
        Ok(Self {
            supervisor,
            closed: OnceCell::new(),
        })
    }

    async fn submit(
        &self,
        query: &str,
        param_json: &str,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<RawResponse, ClientError> {
        if self.supervisor.is_closing() {
            return Err(ClientError::Closed);
        }
        if query.contains('\0') {
            return Err(ClientError::InvalidCommand("query contains a NUL byte"));
        }
        if param_json.contains('\0') {
            return Err(ClientError::InvalidCommand("parameter contains a NUL byte"));
        }
        self.supervisor.submit(query, param_json, handler).await
    }

    /// Run `query` with a JSON-encoded parameter.
    ///
    /// A query that throws is not an error: the response has `exception` set
    /// and carries the serialized exception.
    pub async fn send_raw(&self, query: &str, param_json: &str) -> Result<RawResponse, ClientError> {
        self.submit(query, param_json, None).await
    }

    /// Like [`send_raw`](Self::send_raw), answering messages from the query
    /// with `handler`. A failing handler poisons the current process.
    pub async fn send_raw_with_handler<H>(
        &self,
        query: &str,
        param_json: &str,
        handler: H,
    ) -> Result<RawResponse, ClientError>
    where
        H: MessageHandler + 'static,
    {
        self.submit(query, param_json, Some(Arc::new(handler))).await
    }

    pub async fn send<P, R>(&self, query: &str, param: &P) -> Result<Response<R>, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let param_json = serde_json::to_string(param)?;
        decode(self.submit(query, &param_json, None).await?)
    }

    /// Typed send with a typed message handler. Messages that do not decode
    /// as `M` count as handler failures.
    pub async fn send_with_handler<P, R, M, MR, F>(
        &self,
        query: &str,
        param: &P,
        handler: F,
    ) -> Result<Response<R>, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
        M: DeserializeOwned + 'static,
        MR: Serialize + 'static,
        F: Fn(M) -> anyhow::Result<MR> + Send + Sync + 'static,
    {
        let param_json = serde_json::to_string(param)?;
        let handler: Arc<dyn MessageHandler> = Arc::new(typed_handler(handler));
        decode(self.submit(query, &param_json, Some(handler)).await?)
    }

    /// Like [`send_raw`](Self::send_raw) but a thrown exception is an error.
    pub async fn run_raw(&self, query: &str, param_json: &str) -> Result<String, ClientError> {
        let raw = self.send_raw(query, param_json).await?;
        if raw.exception {
            return Err(ClientError::Exception(raw.result_json));
        }
        Ok(raw.result_json)
    }

    /// Like [`send`](Self::send) but a thrown exception is an error.
    pub async fn run<P, R>(&self, query: &str, param: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response: Response<R> = self.send(query, param).await?;
        match response.result {
            Some(result) if !response.exception => Ok(result),
            _ => Err(ClientError::Exception(response.raw.result_json)),
        }
    }

    /// Shut down: stop restarting, close every connection, stop the process
    /// (SIGTERM, then SIGKILL after the grace period) and remove generated
    /// sockets.
    ///
    /// Only the first call does the work. Every call returns the same
    /// outcome: the first teardown error, else the latched fatal error.
    pub async fn close(&self) -> Result<(), CloseError> {
        self.closed
            .get_or_init(|| self.supervisor.close())
            .await
            .clone()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.supervisor.health()
    }

    /// Pid of the current jsockd process.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.current().pid()
    }

    pub fn current_generation(&self) -> Arc<Generation> {
        self.supervisor.current()
    }

    /// Notified whenever a restart publishes a new generation.
    pub fn generations(&self) -> watch::Receiver<Arc<Generation>> {
        self.supervisor.subscribe()
    }

    pub fn version_info(&self) -> VersionInfo {
        self.supervisor.current().version_info()
    }
}

impl Drop for JsockdClient {
    fn drop(&mut self) {
        if !self.closed.initialized() {
            tracing::debug!("Client dropped without close, killing jsockd");
            self.supervisor.abort();
        }
    }
}
