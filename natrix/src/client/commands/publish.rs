use std::{
    fmt::{self, Debug},
    future::IntoFuture,
};

use bytes::Bytes;
use futures_core::future::BoxFuture;
use natrix_proto::{
    headers::{HeaderMap, HeaderName, HeaderValue},
    MessageBase, Subject,
};

use crate::{
    client::{Client, ClientClosedError, TryCommandError},
    handler::HandlerCommand,
};

use super::Request;

/// A publishable message
#[derive(Debug, Clone)]
pub struct Publish {
    pub(super) subject: Subject,
    pub(super) reply_subject: Option<Subject>,
    pub(super) headers: HeaderMap,
    pub(super) payload: Bytes,
}

/// A constructor for a publishable message
///
/// Obtained from [`Publish::builder`].
#[derive(Debug)]
pub struct PublishBuilder {
    publish: Publish,
}

/// A constructor for a publishable message to be sent using the given client
///
/// Obtained from [`Client::publish`].
pub struct ClientPublish<'a> {
    client: &'a Client,
    publish: Publish,
}

/// A publisheable message ready to be published to the given client
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct DoClientPublish<'a> {
    client: &'a Client,
    publish: Publish,
}

/// A constructor for a publishable message to be sent using the given owned client
///
/// Obtained from [`Client::publish_owned`].
pub struct OwnedClientPublish {
    client: Client,
    publish: Publish,
}

/// A publisheable message ready to be published to the given owned client
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct DoOwnedClientPublish {
    client: Client,
    publish: Publish,
}

/// An error encountered while publishing a message
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The subject contains wildcard tokens
    ///
    /// Wildcards are reserved for subscription filter subjects.
    #[error("subject contains wildcards")]
    WildcardSubject,
    /// The payload exceeds the maximum the server is willing to accept
    #[error("payload of {len} bytes exceeds the server maximum of {max}")]
    MaxPayloadExceeded { len: usize, max: usize },
    /// The client is draining towards shutdown
    #[error("connection is draining")]
    Draining,
    /// The outbound buffer is full
    ///
    /// Only returned by the `try_` variants; awaiting publishes wait
    /// for capacity instead.
    #[error("outbound buffer full")]
    SlowConsumer,
    /// The client has been closed
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

impl From<TryCommandError> for PublishError {
    fn from(err: TryCommandError) -> Self {
        match err {
            TryCommandError::SlowConsumer => Self::SlowConsumer,
            TryCommandError::Draining => Self::Draining,
            TryCommandError::Closed(err) => Self::Closed(err),
        }
    }
}

macro_rules! publish {
    () => {
        #[must_use]
        pub fn reply_subject(mut self, reply_subject: Option<Subject>) -> Self {
            self.publish_mut().reply_subject = reply_subject;
            self
        }

        #[must_use]
        pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
            self.publish_mut().headers.insert(name, value);
            self
        }

        #[must_use]
        pub fn headers(mut self, headers: HeaderMap) -> Self {
            self.publish_mut().headers = headers;
            self
        }
    };
}

impl Publish {
    /// Build a new [`Publish`]
    #[must_use]
    pub fn builder(subject: Subject) -> PublishBuilder {
        PublishBuilder::subject(subject)
    }

    /// Publish this message to `client`
    pub fn client(self, client: &Client) -> DoClientPublish<'_> {
        DoClientPublish {
            client,
            publish: self,
        }
    }

    /// Publish this message to `client`, taking ownership of it
    pub fn client_owned(self, client: Client) -> DoOwnedClientPublish {
        DoOwnedClientPublish {
            client,
            publish: self,
        }
    }

    pub fn into_request(self) -> Request {
        Request {
            publish: self,
            response_timeout: None,
            no_mux: false,
        }
    }

    fn into_message_base(self) -> MessageBase {
        let Self {
            subject,
            reply_subject,
            headers,
            payload,
        } = self;
        MessageBase {
            subject,
            reply_subject,
            headers,
            payload,
        }
    }
}

impl PublishBuilder {
    #[must_use]
    pub fn subject(subject: Subject) -> Self {
        Self {
            publish: Publish {
                subject,
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::new(),
            },
        }
    }

    publish!();

    #[must_use]
    pub fn payload(mut self, payload: Bytes) -> Publish {
        self.publish.payload = payload;
        self.publish
    }

    fn publish_mut(&mut self) -> &mut Publish {
        &mut self.publish
    }
}

impl<'a> ClientPublish<'a> {
    pub(crate) fn build(client: &'a Client, subject: Subject) -> Self {
        Self {
            client,
            publish: PublishBuilder::subject(subject).publish,
        }
    }

    publish!();

    pub fn payload(mut self, payload: Bytes) -> DoClientPublish<'a> {
        self.publish.payload = payload;
        self.publish.client(self.client)
    }

    /// Convert this into [`OwnedClientPublish`]
    #[must_use]
    pub fn to_owned(self) -> OwnedClientPublish {
        OwnedClientPublish {
            client: self.client.clone(),
            publish: self.publish,
        }
    }

    fn publish_mut(&mut self) -> &mut Publish {
        &mut self.publish
    }
}

impl OwnedClientPublish {
    pub(crate) fn build(client: Client, subject: Subject) -> Self {
        Self {
            client,
            publish: PublishBuilder::subject(subject).publish,
        }
    }

    publish!();

    pub fn payload(mut self, payload: Bytes) -> DoOwnedClientPublish {
        self.publish.payload = payload;
        self.publish.client_owned(self.client)
    }

    fn publish_mut(&mut self) -> &mut Publish {
        &mut self.publish
    }
}

impl DoClientPublish<'_> {
    /// Publish this message if there's enough immediately available space in the internal buffers
    ///
    /// This method will publish the given message only if there's enough
    /// immediately available space to enqueue it in the client's
    /// networking stack.
    ///
    /// # Errors
    ///
    /// It returns an error if the message is invalid, if the client's
    /// buffer is full or if the client has been closed.
    pub fn try_publish(self) -> Result<(), PublishError> {
        try_publish(self.client, self.publish)
    }
}

impl<'a> IntoFuture for DoClientPublish<'a> {
    type Output = Result<(), PublishError>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { publish(self.client, self.publish).await })
    }
}

impl DoOwnedClientPublish {
    /// Publish this message if there's enough immediately available space in the internal buffers
    ///
    /// This method will publish the given message only if there's enough
    /// immediately available space to enqueue it in the client's
    /// networking stack.
    ///
    /// # Errors
    ///
    /// It returns an error if the message is invalid, if the client's
    /// buffer is full or if the client has been closed.
    pub fn try_publish(self) -> Result<(), PublishError> {
        try_publish(&self.client, self.publish)
    }
}

impl IntoFuture for DoOwnedClientPublish {
    type Output = Result<(), PublishError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { publish(&self.client, self.publish).await })
    }
}

pub(super) fn validate(client: &Client, publish: &Publish) -> Result<(), PublishError> {
    if !publish.subject.is_literal() {
        return Err(PublishError::WildcardSubject);
    }

    if client.is_draining() {
        return Err(PublishError::Draining);
    }

    let max = client.max_payload();
    let len = publish.payload.len();
    if len > max {
        return Err(PublishError::MaxPayloadExceeded { len, max });
    }

    Ok(())
}

fn try_publish(client: &Client, publish: Publish) -> Result<(), PublishError> {
    validate(client, &publish)?;
    client
        .try_enqueue_command(HandlerCommand::Publish {
            message: publish.into_message_base(),
        })
        .map_err(PublishError::from)
}

async fn publish(client: &Client, publish: Publish) -> Result<(), PublishError> {
    validate(client, &publish)?;
    client
        .enqueue_command(HandlerCommand::Publish {
            message: publish.into_message_base(),
        })
        .await
        .map_err(PublishError::Closed)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::assert_matches;
    use natrix_proto::Subject;

    use crate::client::Client;
    use crate::handler::HandlerCommand;

    use super::PublishError;

    #[tokio::test]
    async fn try_publish_enqueues() {
        let (client, mut handler) = Client::test(1);

        client
            .publish(Subject::from_static("greet"))
            .payload(Bytes::from_static(b"hello"))
            .try_publish()
            .unwrap();

        let HandlerCommand::Publish { message } = handler.receiver.try_recv().unwrap() else {
            unreachable!()
        };
        assert_eq!(Subject::from_static("greet"), message.subject);
        assert_eq!(None, message.reply_subject);
        assert!(message.headers.is_empty());
        assert_eq!(Bytes::from_static(b"hello"), message.payload);
    }

    #[tokio::test]
    async fn rejects_wildcard_subjects() {
        let (client, _handler) = Client::test(1);

        for subject in ["greet.*", "greet.>", "*.greet"] {
            assert_matches!(
                client
                    .publish(Subject::from_static(subject))
                    .payload(Bytes::new())
                    .try_publish(),
                Err(PublishError::WildcardSubject)
            );
        }
    }

    #[tokio::test]
    async fn rejects_oversized_payloads() {
        let (client, _handler) = Client::test(1);

        // The test harness advertises a 1 MiB maximum payload
        let payload = Bytes::from(vec![0; 1024 * 1024 + 1]);
        assert_matches!(
            client
                .publish(Subject::from_static("greet"))
                .payload(payload)
                .try_publish(),
            Err(PublishError::MaxPayloadExceeded { max, .. }) if max == 1024 * 1024
        );
    }

    #[tokio::test]
    async fn slow_consumer_when_the_buffer_is_full() {
        let (client, _handler) = Client::test(1);

        client
            .publish(Subject::from_static("greet"))
            .payload(Bytes::new())
            .try_publish()
            .unwrap();
        assert_matches!(
            client
                .publish(Subject::from_static("greet"))
                .payload(Bytes::new())
                .try_publish(),
            Err(PublishError::SlowConsumer)
        );
    }
}

impl Debug for ClientPublish<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

impl Debug for DoClientPublish<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

impl Debug for OwnedClientPublish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}

impl Debug for DoOwnedClientPublish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoOwnedClientPublish")
            .field("publish", &self.publish)
            .finish_non_exhaustive()
    }
}
