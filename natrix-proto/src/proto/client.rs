use std::num::NonZeroU64;

use crate::{
    connect::Connect, message::MessageBase, queue_group::QueueGroup,
    subscription_id::SubscriptionId, Subject,
};

/// An operation sent by the client to the server
///
/// Each variant corresponds to one verb of the client side of the
/// wire protocol; [`StreamEncoder`] turns it into bytes.
///
/// [`StreamEncoder`]: super::StreamEncoder
#[derive(Debug)]
pub enum ClientOp {
    /// `CONNECT <json>`, the first command of the handshake
    ///
    /// Carries the client options together with whatever credential
    /// fields the authenticator contributed.
    Connect {
        connect: Box<Connect>,
    },
    /// `PUB <subject> [reply] <len>` or, when the message carries
    /// headers, `HPUB <subject> [reply] <hdr-len> <total-len>`
    ///
    /// The verb is picked at encoding time based on whether the
    /// header map is empty.
    Publish {
        message: MessageBase,
    },
    /// `SUB <subject> [queue] <sid>`, registering interest in a
    /// filter subject under a client-allocated id
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    },
    /// `UNSUB <sid> [max]`
    ///
    /// Without `max_messages` the subscription closes immediately;
    /// with it, the server keeps delivering until the limit is hit.
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    /// `PING`, sent as a heartbeat and as a flush marker
    Ping,
    /// `PONG`, answering a server heartbeat
    Pong,
}
