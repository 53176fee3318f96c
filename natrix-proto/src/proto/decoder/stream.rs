use bytes::{BufMut, BytesMut};

use crate::proto::{error::DecoderError, ServerOp};

use super::DecoderStatus;

const INITIAL_READ_BUF_CAPACITY: usize = 64 * 1024;

/// An incremental decoder of server operations
///
/// Bytes are appended to [`StreamDecoder::read_buf`] as they arrive
/// from the transport, in fragments of any size. [`StreamDecoder::decode`]
/// pulls complete operations out of the buffer.
#[derive(Debug)]
pub struct StreamDecoder {
    read_buf: BytesMut,
    status: DecoderStatus,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(INITIAL_READ_BUF_CAPACITY),
            status: DecoderStatus::ControlLine { last_bytes_read: 0 },
        }
    }

    #[must_use]
    pub fn read_buf(&mut self) -> &mut impl BufMut {
        &mut self.read_buf
    }

    /// Decodes the next frame of bytes into a [`ServerOp`].
    ///
    /// A `None` variant is returned in case no progress can be made.
    ///
    /// # Errors
    ///
    /// It returns an error if a decoding error occurs.
    pub fn decode(&mut self) -> Result<Option<ServerOp>, DecoderError> {
        super::decode(&mut self.status, &mut self.read_buf)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, Bytes};
    use claims::{assert_matches, assert_ok_eq};

    use crate::{
        error::ServerError,
        headers::{HeaderMap, HeaderName, HeaderValue},
        message::{MessageBase, ServerMessage},
        proto::server::ServerOp,
        StatusCode, Subject,
    };

    use super::StreamDecoder;

    #[test]
    fn decode_ping() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"PING\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_pong() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"PONG\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Pong));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_verbs_case_insensitively() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"ping\r\nPong\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Pong));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_ok() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"+OK\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Success));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_error() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"-ERR 'Authorization Violation'\r\n"));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Error {
                error: ServerError::AuthorizationViolation
            })
        );
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_msg() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"MSG hello.world 1 12\r\nHello World!\r\n",
        ));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Message {
                message: ServerMessage {
                    status_code: None,
                    subscription_id: 1.into(),
                    base: MessageBase {
                        subject: Subject::from_static("hello.world"),
                        reply_subject: None,
                        headers: HeaderMap::new(),
                        payload: Bytes::from_static(b"Hello World!")
                    }
                }
            })
        );
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_msg_with_reply() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"MSG hello.world 9 _INBOX.abcd.1234 2\r\nhi\r\n",
        ));
        let Ok(Some(ServerOp::Message { message })) = decoder.decode() else {
            panic!("expected message");
        };
        assert_eq!(
            Some(Subject::from_static("_INBOX.abcd.1234")),
            message.base.reply_subject
        );
        assert_eq!(message.subscription_id, 9.into());
    }

    #[test]
    fn decode_msg_fragmented() {
        // Any transport fragmentation must be accepted
        let wire = b"MSG hello.world 1 12\r\nHello World!\r\nPING\r\n";

        for split in 1..wire.len() - 1 {
            let mut decoder = StreamDecoder::new();
            decoder.read_buf().put(&wire[..split]);

            let mut ops = Vec::new();
            while let Some(op) = decoder.decode().unwrap() {
                ops.push(op);
            }
            decoder.read_buf().put(&wire[split..]);
            while let Some(op) = decoder.decode().unwrap() {
                ops.push(op);
            }

            assert_eq!(2, ops.len(), "split at {split}");
            assert_matches!(&ops[0], ServerOp::Message { message } if message.base.payload == Bytes::from_static(b"Hello World!"));
            assert_matches!(&ops[1], ServerOp::Ping);
        }
    }

    #[test]
    fn decode_hmsg() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG hello.world 1 28 40\r\nNATS/1.0\r\nTrace-Id: abcd\r\n\r\nHello World!\r\n",
        ));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Message {
                message: ServerMessage {
                    status_code: None,
                    subscription_id: 1.into(),
                    base: MessageBase {
                        subject: Subject::from_static("hello.world"),
                        reply_subject: None,
                        headers: [(
                            HeaderName::from_static("Trace-Id"),
                            HeaderValue::from_static("abcd"),
                        )]
                        .into_iter()
                        .collect(),
                        payload: Bytes::from_static(b"Hello World!")
                    }
                }
            })
        );
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_hmsg_inline_status() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG _INBOX.abcd.1234 1 30 30\r\nNATS/1.0 503 No Responders\r\n\r\n\r\n",
        ));
        let Ok(Some(ServerOp::Message { message })) = decoder.decode() else {
            panic!("expected message");
        };
        assert_eq!(Some(StatusCode::NO_RESPONDERS), message.status_code);
        assert!(message.base.payload.is_empty());
    }

    #[test]
    fn decode_hmsg_canonicalizes_names() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG hello.world 1 28 28\r\nNATS/1.0\r\ntrace-id: abcd\r\n\r\n\r\n",
        ));
        let Ok(Some(ServerOp::Message { message })) = decoder.decode() else {
            panic!("expected message");
        };
        assert_eq!(
            Some(&HeaderValue::from_static("abcd")),
            message
                .base
                .headers
                .get(&HeaderName::from_static("Trace-Id"))
        );
    }

    #[test]
    fn decode_info() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"INFO {\"server_id\":\"ABCD\",\"server_name\":\"n1\",\"version\":\"2.10.17\",\"go\":\"1.22.5\",\"host\":\"127.0.0.1\",\"port\":4222,\"headers\":true,\"max_payload\":1048576,\"proto\":1}\r\n",
        ));
        let Ok(Some(ServerOp::Info { info })) = decoder.decode() else {
            panic!("expected info");
        };
        assert_eq!("ABCD", info.id);
        assert!(info.supports_headers);
        assert!(!info.lame_duck_mode);
    }

    #[test]
    fn rejects_missing_payload_terminator() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"MSG hello 1 2\r\nhiXX"));
        assert_matches!(
            decoder.decode(),
            Err(crate::proto::error::DecoderError::MissingPayloadTerminator)
        );
    }
}
