//! IPC bridge for client-worker communication.
//!
//! This module provides the wire protocol, codecs and socket plumbing for
//! talking to a jsockd worker process.
//!
//! # Architecture
//!
//! - **protocol**: Record types (OutboundRecord, ResponseRecord, RawResponse, ReadyLine)
//! - **codec**: NUL-field encoder and line decoder for AsyncRead/AsyncWrite
//! - **transport**: Socket path allocation and dialing

pub mod codec;
pub mod protocol;
pub mod transport;
