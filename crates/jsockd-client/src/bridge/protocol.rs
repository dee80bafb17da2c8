//! Wire protocol types for client-worker communication.
//!
//! Two channels:
//! - **stdout**: a single `READY <n> <version>` line once the worker is listening
//! - **Connection sockets**: NUL-separated command and message-reply records out,
//!   newline-terminated response records back

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Reply sent in place of a message response when the caller's handler failed.
pub const MESSAGE_HANDLER_INTERNAL_ERROR: &str = "internal_error";

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one command round trip.
///
/// Allocated from a process-wide counter, so ids never repeat within the
/// lifetime of the process and always increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(u64);

impl CommandId {
    pub fn next() -> Self {
        Self(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// True if `wire` is this id as it appears on the wire.
    pub fn matches(&self, wire: &str) -> bool {
        wire == self.0.to_string()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Records written from the client to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRecord {
    /// `<id>\0<query>\0<paramJson>\0`
    Command {
        id: CommandId,
        query: String,
        param_json: String,
    },

    /// `<id>\0<responseJson>\0`, the answer to a `message` record.
    MessageReply { id: CommandId, json: String },
}

impl OutboundRecord {
    pub fn id(&self) -> CommandId {
        match self {
            Self::Command { id, .. } | Self::MessageReply { id, .. } => *id,
        }
    }
}

/// Status token of a response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Exception,
    Message,
}

impl ResponseStatus {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "ok" => Some(Self::Ok),
            "exception" => Some(Self::Exception),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

/// One `<id> <status> <payload>\n` line read from a connection.
///
/// The id is kept verbatim; matching it against the in-flight command is the
/// connection worker's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub id: String,
    pub status: ResponseStatus,
    pub payload: String,
}

/// Terminal outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponse {
    /// The query threw; `result_json` holds the serialized exception.
    pub exception: bool,
    pub result_json: String,
}

impl RawResponse {
    pub fn ok(result_json: impl Into<String>) -> Self {
        Self {
            exception: false,
            result_json: result_json.into(),
        }
    }

    pub fn exception(result_json: impl Into<String>) -> Self {
        Self {
            exception: true,
            result_json: result_json.into(),
        }
    }
}

/// Typed outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub exception: bool,
    /// Decoded result; `None` when the query threw.
    pub result: Option<T>,
    pub raw: RawResponse,
}

/// Parsed `READY <n> <version>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyLine {
    pub connections: usize,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed READY line: {0:?}")]
pub struct MalformedReadyLine(pub String);

impl ReadyLine {
    pub const PREFIX: &'static str = "READY ";

    /// Returns `None` for lines that are not READY lines at all.
    pub fn parse(line: &str) -> Option<Result<Self, MalformedReadyLine>> {
        let line = line.trim();
        if !line.starts_with(Self::PREFIX) {
            return None;
        }
        let malformed = || MalformedReadyLine(line.to_string());

        let mut parts = line.splitn(3, ' ');
        let _ready = parts.next();
        let (Some(count), Some(version)) = (parts.next(), parts.next()) else {
            return Some(Err(malformed()));
        };
        let parsed = match count.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(Self {
                connections: n,
                version: version.to_string(),
            }),
            _ => Err(malformed()),
        };
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_increase() {
        let a = CommandId::next();
        let b = CommandId::next();
        let c = CommandId::next();
        assert!(a < b && b < c);
    }

    #[test]
    fn command_id_matches_wire_form_only() {
        let id = CommandId(42);
        assert!(id.matches("42"));
        assert!(!id.matches("042"));
        assert!(!id.matches("+42"));
        assert!(!id.matches("43"));
        assert!(!id.matches(""));
        assert!(!id.matches("42 "));
    }

    #[test]
    fn status_tokens() {
        assert_eq!(ResponseStatus::parse("ok"), Some(ResponseStatus::Ok));
        assert_eq!(
            ResponseStatus::parse("exception"),
            Some(ResponseStatus::Exception)
        );
        assert_eq!(
            ResponseStatus::parse("message"),
            Some(ResponseStatus::Message)
        );
        assert_eq!(ResponseStatus::parse("OK"), None);
        assert_eq!(ResponseStatus::parse("done"), None);
    }

    #[test]
    fn ready_line_parses() {
        let ready = ReadyLine::parse("READY 4 0.0.139\n").unwrap().unwrap();
        assert_eq!(ready.connections, 4);
        assert_eq!(ready.version, "0.0.139");
    }

    #[test]
    fn ready_line_keeps_rest_as_version() {
        let ready = ReadyLine::parse("READY 1 1.2.3 debug").unwrap().unwrap();
        assert_eq!(ready.version, "1.2.3 debug");
    }

    #[test]
    fn ready_line_rejects_bad_counts() {
        for line in ["READY 0 1.0", "READY -1 1.0", "READY x 1.0", "READY 2"] {
            assert!(
                matches!(ReadyLine::parse(line), Some(Err(_))),
                "accepted {line:?}"
            );
        }
    }

    #[test]
    fn non_ready_lines_are_skipped() {
        assert!(ReadyLine::parse("loading module").is_none());
        assert!(ReadyLine::parse("READY").is_none());
        assert!(ReadyLine::parse("").is_none());
    }

    #[test]
    fn raw_response_serializes() {
        insta::assert_json_snapshot!(RawResponse::exception("\"boom\""), @r#"
        {
          "exception": true,
          "result_json": "\"boom\""
        }
        "#);
    }
}
