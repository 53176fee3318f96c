use crate::{error::ServerError, message::ServerMessage, ServerInfo};

/// An operation received by the client from the server
///
/// Produced by [`StreamDecoder`], one per decoded control line (plus
/// its payload, for deliveries).
///
/// [`StreamDecoder`]: super::StreamDecoder
#[derive(Debug, PartialEq, Eq)]
pub enum ServerOp {
    /// `INFO <json>`, sent once at connection establishment and again
    /// whenever the cluster topology or server state changes
    Info { info: Box<ServerInfo> },
    /// `MSG`/`HMSG`, a message delivered to one of the client's
    /// subscriptions
    Message { message: ServerMessage },
    /// `+OK`, acknowledging the previous client operation
    ///
    /// Only sent when the connection negotiated verbose mode.
    Success,
    /// `-ERR <reason>`, reporting a protocol or authorization problem
    ///
    /// Whether the connection survives depends on
    /// [`ServerError::is_fatal`].
    Error { error: ServerError },
    /// `PING`, a server heartbeat that must be answered promptly
    Ping,
    /// `PONG`, answering a client `PING`
    Pong,
}
