//! jsockd-client: supervised client runtime for jsockd worker processes.
//!
//! A [`JsockdClient`] spawns jsockd, waits for its READY handshake, keeps one
//! persistent Unix socket connection per worker thread and spreads commands
//! over them. Queries may call back into the client with messages, answered
//! by a [`MessageHandler`]. If jsockd dies it is restarted, at most
//! `max_restarts_per_minute` times in any trailing minute.
//!
//! ```no_run
//! # async fn demo() -> Result<(), jsockd_client::ClientError> {
//! use jsockd_client::{ClientConfig, JsockdClient};
//!
//! let client = JsockdClient::start(ClientConfig::new("/usr/local/bin/jsockd")).await?;
//! let n: i64 = client.run("(m, p) => p + 1", &99).await?;
//! assert_eq!(n, 100);
//! client.close().await.ok();
//! # Ok(())
//! # }
//! ```

mod client;
mod dispatch;
mod error;
mod health;
mod latch;
mod supervisor;
mod version;

pub mod bridge;
pub mod config;
pub mod connection;
pub mod orchestrator;
pub mod worker_log;

pub use bridge::protocol::{CommandId, RawResponse, Response};
pub use client::JsockdClient;
pub use config::{ClientConfig, ConfigError};
pub use connection::{MessageHandler, typed_handler};
pub use error::{ClientError, CloseError};
pub use health::{GenerationState, HealthSnapshot};
pub use latch::FatalError;
pub use orchestrator::{Generation, StartupError};
pub use supervisor::RestartBudget;
pub use version::{CLIENT_VERSION, JSOCKD_VERSION, VersionInfo};
pub use worker_log::{LogEntry, LogSink, TracingLogSink};
