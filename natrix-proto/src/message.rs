use bytes::Bytes;

use crate::{headers::HeaderMap, subscription_id::SubscriptionId, StatusCode, Subject};

/// The parts of a message shared between publishes and deliveries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBase {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// A message delivered by the server through `MSG` or `HMSG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub status_code: Option<StatusCode>,
    pub subscription_id: SubscriptionId,
    pub base: MessageBase,
}
