//! Framed codecs for connection traffic.
//!
//! Outbound records are NUL-separated fields; inbound records are single lines
//! framed with LinesCodec. Works over any AsyncRead/AsyncWrite (sockets, pipes,
//! in-memory duplex streams).

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{OutboundRecord, ResponseRecord, ResponseStatus};

/// Upper bound on a single response line.
pub const DEFAULT_MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed response record: {0:?}")]
    Malformed(String),
    #[error("response record exceeds {0} bytes")]
    TooLong(usize),
    #[error("connection closed in the middle of a record")]
    Truncated,
    #[error("{0} contains a NUL byte and cannot be framed")]
    EmbeddedNul(&'static str),
}

/// Encodes command and message-reply records.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestCodec;

impl RequestCodec {
    pub fn new() -> Self {
        Self
    }
}

fn put_field(dst: &mut BytesMut, name: &'static str, value: &str) -> Result<(), CodecError> {
    if value.as_bytes().contains(&0) {
        return Err(CodecError::EmbeddedNul(name));
    }
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
    Ok(())
}

impl Encoder<OutboundRecord> for RequestCodec {
    type Error = CodecError;

    fn encode(&mut self, item: OutboundRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        let id = item.id().to_string();
        let result = match &item {
            OutboundRecord::Command {
                query, param_json, ..
            } => {
                dst.reserve(id.len() + query.len() + param_json.len() + 3);
                put_field(dst, "command id", &id)
                    .and_then(|()| put_field(dst, "query", query))
                    .and_then(|()| put_field(dst, "parameter", param_json))
            }
            OutboundRecord::MessageReply { json, .. } => {
                dst.reserve(id.len() + json.len() + 2);
                put_field(dst, "command id", &id).and_then(|()| put_field(dst, "message reply", json))
            }
        };
        if result.is_err() {
            // Never leave half a record in the write buffer.
            dst.truncate(start);
        }
        tracing::trace!(command_id = %id, record_bytes = dst.len() - start, "Encoding record");
        result
    }
}

/// Decodes `<id> <status> <payload>\n` response lines.
#[derive(Debug)]
pub struct ResponseCodec {
    inner: LinesCodec,
    max_len: usize,
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_RECORD_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_len),
            max_len,
        }
    }
}

/// Split a response line (terminator already removed) into its three fields.
pub fn parse_response_line(line: &str) -> Result<ResponseRecord, CodecError> {
    let malformed = || CodecError::Malformed(line.to_string());
    let (id, rest) = line.split_once(' ').ok_or_else(malformed)?;
    let (status, payload) = rest.split_once(' ').ok_or_else(malformed)?;
    let status = ResponseStatus::parse(status).ok_or_else(malformed)?;
    Ok(ResponseRecord {
        id: id.to_string(),
        status,
        payload: payload.to_string(),
    })
}

impl Decoder for ResponseCodec {
    type Item = ResponseRecord;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let line = self.inner.decode(src).map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => CodecError::TooLong(self.max_len),
            LinesCodecError::Io(e) => CodecError::Io(e),
        })?;
        line.map(|l| parse_response_line(&l)).transpose()
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CommandId;

    fn encode(record: OutboundRecord) -> Result<BytesMut, CodecError> {
        let mut buf = BytesMut::new();
        RequestCodec::new().encode(record, &mut buf)?;
        Ok(buf)
    }

    #[test]
    fn encodes_command_record() {
        let id = CommandId::next();
        let buf = encode(OutboundRecord::Command {
            id,
            query: "(m, p) => p+1".to_string(),
            param_json: "99".to_string(),
        })
        .unwrap();
        assert_eq!(&buf[..], format!("{id}\0(m, p) => p+1\099\0").as_bytes());
    }

    #[test]
    fn encodes_message_reply_without_query_field() {
        let id = CommandId::next();
        let buf = encode(OutboundRecord::MessageReply {
            id,
            json: "\"ack\"".to_string(),
        })
        .unwrap();
        assert_eq!(&buf[..], format!("{id}\0\"ack\"\0").as_bytes());
    }

    #[test]
    fn refuses_embedded_nul_and_leaves_buffer_clean() {
        let mut buf = BytesMut::from(&b"prefix"[..]);
        let err = RequestCodec::new()
            .encode(
                OutboundRecord::Command {
                    id: CommandId::next(),
                    query: "ok".to_string(),
                    param_json: "\"a\0b\"".to_string(),
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::EmbeddedNul("parameter")));
        assert_eq!(&buf[..], b"prefix");
    }

    #[test]
    fn decodes_each_status() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&b"7 ok 100\n7 exception \"err\"\n7 message {\"a\": 1}\n"[..]);

        let ok = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ok.id, "7");
        assert_eq!(ok.status, ResponseStatus::Ok);
        assert_eq!(ok.payload, "100");

        let exc = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(exc.status, ResponseStatus::Exception);
        assert_eq!(exc.payload, "\"err\"");

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.status, ResponseStatus::Message);
        assert_eq!(msg.payload, "{\"a\": 1}");

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_complete_line() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&b"3 ok [1,"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"2]\n");
        let record = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(record.payload, "[1,2]");
    }

    #[test]
    fn payload_may_contain_spaces() {
        let record = parse_response_line("12 ok {\"a b\": \"c d\"}").unwrap();
        assert_eq!(record.payload, "{\"a b\": \"c d\"}");
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in ["12", "12 ok", "12 done 1", "", "12  ok 1"] {
            assert!(
                matches!(parse_response_line(line), Err(CodecError::Malformed(_))),
                "accepted {line:?}"
            );
        }
    }

    #[test]
    fn truncated_record_at_eof_is_an_error() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&b"5 ok 12"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn clean_eof_is_end_of_stream() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn overlong_record_is_rejected() {
        let mut codec = ResponseCodec::with_max_len(8);
        let mut buf = BytesMut::from(&b"1 ok 123456789\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::TooLong(8))));
    }
}
