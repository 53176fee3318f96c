use std::{
    future::Future,
    num::NonZeroU64,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{FusedStream, Stream};
use natrix_proto::{error::ServerError, ServerMessage, SubscriptionId};
use tokio::{
    sync::mpsc,
    time::{self, Instant, Sleep},
};

use crate::core::{error::ClientClosedError, Client};

const BATCH_RECEIVE_SIZE: usize = 16;

/// A subscription to a filter subject
///
/// Receives messages coming from the server with At Most Once Delivery.
///
/// Messages are yielded via the [`Stream`] implementation as they are
/// received by the client. Errors can only occur immediately after
/// subscribing, after the client reconnects, or when the configured
/// inactivity deadline elapses.
///
/// The subscription MUST be polled continuously. If the subscription is not polled
/// for a relatively long period of time the internal buffers will fill up and any
/// further messages will be dropped.
///
/// Obtained from [`Client::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    client: Client,
    receiver: mpsc::Receiver<Result<ServerMessage, ServerError>>,
    receiver_queue: Vec<Result<ServerMessage, ServerError>>,
    status: SubscriptionStatus,
    inactivity_timeout: Option<Duration>,
    inactivity: Option<Pin<Box<Sleep>>>,
}

#[derive(Debug, Copy, Clone)]
enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
    TimedOut,
}

/// An error yielded by a [`Subscription`]'s stream
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The server rejected the subscription or kicked it
    #[error("server error")]
    Server(#[source] ServerError),
    /// No message arrived within the configured inactivity deadline
    ///
    /// The subscription is closed after yielding this error.
    #[error("no messages within the inactivity deadline")]
    TimedOut,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        client: Client,
        receiver: mpsc::Receiver<Result<ServerMessage, ServerError>>,
        inactivity_timeout: Option<Duration>,
    ) -> Self {
        let inactivity = inactivity_timeout.map(|timeout| Box::pin(time::sleep(timeout)));
        Self {
            id,
            client,
            receiver,
            receiver_queue: Vec::with_capacity(BATCH_RECEIVE_SIZE),
            status: SubscriptionStatus::Subscribed,
            inactivity_timeout,
            inactivity,
        }
    }

    /// Immediately close the subscription
    ///
    /// The `Stream` implementation will continue to yield any remaining
    /// in-flight or otherwise buffered messages.
    ///
    /// Calling this method multiple times is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close(&mut self) -> Result<(), ClientClosedError> {
        match (self.status, self.receiver.is_closed()) {
            (SubscriptionStatus::Subscribed, true) => {
                self.status = SubscriptionStatus::Unsubscribed;
            }
            (SubscriptionStatus::Subscribed, false) => {
                self.client.unsubscribe(self.id, None).await?;
                self.status = SubscriptionStatus::Unsubscribed;
            }
            (SubscriptionStatus::Unsubscribed | SubscriptionStatus::TimedOut, _) => {}
        }

        Ok(())
    }

    /// Close the subscription after `max_messages` have been delivered
    ///
    /// Ask the server to automatically close the subscription after
    /// `max_messages` have been sent to the client.
    ///
    /// <div class="warning">
    ///    Calling this method does not guarantee that the <code>Stream</code> will
    ///    deliver the exact number of messages specified in <code>max_messages</code>.
    /// </div>
    ///
    /// More or less messages may be delivered to the client due to race conditions
    /// or data loss between it and the server.
    ///
    /// More messages could be delivered if the server receives the `close_after` command
    /// after it has already started buffering messages to send to the client.
    /// The same race condition could occur after a reconnect.
    ///
    /// Fewer messages could be delivered if the connection handler is faster
    /// at producing messages than the [`Stream`] is at reading them, causing the
    /// channel to fill up and starting to drop subsequent messages.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close_after(&mut self, max_messages: NonZeroU64) -> Result<(), ClientClosedError> {
        match (self.status, self.receiver.is_closed()) {
            (SubscriptionStatus::Subscribed, true) => {
                self.status = SubscriptionStatus::Unsubscribed;
            }
            (SubscriptionStatus::Subscribed, false) => {
                self.client.unsubscribe(self.id, Some(max_messages)).await?;
            }
            (SubscriptionStatus::Unsubscribed | SubscriptionStatus::TimedOut, _) => {}
        }

        Ok(())
    }

    fn reset_inactivity_deadline(&mut self) {
        if let (Some(timeout), Some(inactivity)) = (self.inactivity_timeout, &mut self.inactivity) {
            Sleep::reset(inactivity.as_mut(), Instant::now() + timeout);
        }
    }
}

impl Stream for Subscription {
    type Item = Result<ServerMessage, SubscriptionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if matches!(this.status, SubscriptionStatus::TimedOut) {
            return Poll::Ready(None);
        }

        if let Some(msg) = this.receiver_queue.pop() {
            return Poll::Ready(Some(msg.map_err(SubscriptionError::Server)));
        }

        match Pin::new(&mut this.receiver).poll_recv_many(
            cx,
            &mut this.receiver_queue,
            BATCH_RECEIVE_SIZE,
        ) {
            Poll::Pending => {
                if let Some(inactivity) = &mut this.inactivity {
                    if inactivity.as_mut().poll(cx).is_ready() {
                        this.status = SubscriptionStatus::TimedOut;
                        this.receiver.close();
                        this.client.lazy_unsubscribe(this.id, None);
                        return Poll::Ready(Some(Err(SubscriptionError::TimedOut)));
                    }
                }
                Poll::Pending
            }
            Poll::Ready(n @ 1..) => {
                debug_assert_eq!(n, this.receiver_queue.len());
                this.receiver_queue.reverse();
                this.reset_inactivity_deadline();
                Poll::Ready(
                    this.receiver_queue
                        .pop()
                        .map(|msg| msg.map_err(SubscriptionError::Server)),
                )
            }
            Poll::Ready(0) => {
                this.status = SubscriptionStatus::Unsubscribed;
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.receiver_queue.len(), None)
    }
}

impl FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        matches!(self.status, SubscriptionStatus::TimedOut)
            || (self.receiver.is_closed() && self.receiver_queue.is_empty())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if matches!(
            self.status,
            SubscriptionStatus::Unsubscribed | SubscriptionStatus::TimedOut
        ) || self.receiver.is_closed()
        {
            return;
        }

        self.client.lazy_unsubscribe(self.id, None);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::pin,
        task::{Context, Poll},
        time::Duration,
    };

    use bytes::Bytes;
    use claims::assert_matches;
    use futures_util::{task::noop_waker_ref, StreamExt};
    use natrix_proto::{
        headers::HeaderMap, MessageBase, ServerMessage, StatusCode, Subject, SubscriptionId,
    };
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::{
        client::SubscribeOptions, core::Client, handler::HandlerCommand,
        subscription::SubscriptionError,
    };

    #[tokio::test]
    async fn subscribe() {
        let (client, mut handler) = Client::test(1);

        let mut subscription = client
            .subscribe(Subject::from_static("abcd.>"), None)
            .await
            .unwrap();

        let subscribe_command = handler.receiver.try_recv().unwrap();
        let HandlerCommand::Subscribe {
            id,
            subject,
            queue_group,
            max_messages,
            messages,
        } = subscribe_command
        else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(1), id);
        assert_eq!(Subject::from_static("abcd.>"), subject);
        assert_eq!(None, queue_group);
        assert_eq!(None, max_messages);

        // Messages are delivered as expected

        let (flag, waker) = crate::tests::FlagWaker::new();
        let mut cx = Context::from_waker(&waker);

        let mut expected_wakes = 0;
        for num_messages in 0..32 {
            assert!(subscription.poll_next_unpin(&mut cx).is_pending());
            assert_eq!(expected_wakes, flag.wakes());

            let msgs = (0..num_messages)
                .map(|num| ServerMessage {
                    status_code: Some(StatusCode::OK),
                    subscription_id: SubscriptionId::from(1),
                    base: MessageBase {
                        subject: format!("abcd.{num}").try_into().unwrap(),
                        reply_subject: None,
                        headers: HeaderMap::new(),
                        payload: Bytes::from_static(b"test"),
                    },
                })
                .collect::<Vec<_>>();
            for msg in &msgs {
                messages.try_send(Ok(msg.clone())).unwrap();
            }
            if num_messages > 0 {
                expected_wakes += 1;
            }

            assert_eq!(expected_wakes, flag.wakes());
            for msg in msgs {
                assert_matches!(
                    subscription.poll_next_unpin(&mut cx),
                    Poll::Ready(Some(Ok(received))) if received == msg
                );
            }
            assert!(subscription.poll_next_unpin(&mut cx).is_pending());
        }

        drop(messages);
        expected_wakes += 1;

        assert_eq!(expected_wakes, flag.wakes());
        assert_matches!(subscription.poll_next_unpin(&mut cx), Poll::Ready(None));
    }

    #[tokio::test]
    async fn unsubscribe() {
        let (client, mut handler) = Client::test(1);

        let mut subscription = client
            .subscribe(Subject::from_static("abcd.>"), None)
            .await
            .unwrap();

        let subscribe_command = handler.receiver.try_recv().unwrap();
        assert_matches!(subscribe_command, HandlerCommand::Subscribe { .. });

        // Closing the subscription sends `Unsubscribe`

        subscription.close().await.unwrap();
        let HandlerCommand::Unsubscribe {
            id,
            max_messages: None,
        } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(1), id);

        // Unsubscribing again is a NOOP

        subscription.close().await.unwrap();
        assert_eq!(
            TryRecvError::Empty,
            handler.receiver.try_recv().unwrap_err()
        );

        // Same when dropping the subscription

        drop(subscription);
        assert_eq!(
            TryRecvError::Empty,
            handler.receiver.try_recv().unwrap_err()
        );
    }

    #[tokio::test]
    async fn drop_unsubscribe() {
        let (client, mut handler) = Client::test(1);

        let subscription = client
            .subscribe(Subject::from_static("abcd.>"), None)
            .await
            .unwrap();

        let subscribe_command = handler.receiver.try_recv().unwrap();
        let HandlerCommand::Subscribe {
            id,
            subject,
            queue_group,
            max_messages: None,
            messages: _,
        } = subscribe_command
        else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(1), id);
        assert_eq!(Subject::from_static("abcd.>"), subject);
        assert_eq!(None, queue_group);

        // Dropping `Subscription` sends `Unsubscribe`

        drop(subscription);
        let HandlerCommand::Unsubscribe {
            id,
            max_messages: None,
        } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(1), id);
    }

    #[tokio::test]
    async fn subscribe_is_cancel_safe() {
        let (client, mut handler) = Client::test(1);

        let subscription = client
            .subscribe(Subject::from_static("abcd.>"), None)
            .await
            .unwrap();

        {
            let subscribe_future = pin!(client.subscribe(Subject::from_static("dcba.>"), None));

            let mut cx = Context::from_waker(noop_waker_ref());
            assert!(subscribe_future.poll(&mut cx).is_pending());
        }

        let subscribe_command = handler.receiver.try_recv().unwrap();
        let HandlerCommand::Subscribe { id, .. } = subscribe_command else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(1), id);

        let subscription2 = client
            .subscribe(Subject::from_static("abcd.>"), None)
            .await
            .unwrap();

        let subscribe_command = handler.receiver.try_recv().unwrap();
        let HandlerCommand::Subscribe { id, .. } = subscribe_command else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(2), id);

        // Failing to unsubscribe triggers `is_failed_unsubscribe = true`

        assert!(!handler.quick_info.get().is_failed_unsubscribe);
        drop(subscription);
        assert!(!handler.quick_info.get().is_failed_unsubscribe);
        drop(subscription2);
        assert!(handler.quick_info.get().is_failed_unsubscribe);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_deadline_closes_the_stream() {
        let (client, mut handler) = Client::test(2);

        let mut subscription = client
            .subscribe_with(
                Subject::from_static("abcd.>"),
                None,
                SubscribeOptions {
                    inactivity_timeout: Some(Duration::from_millis(50)),
                    ..SubscribeOptions::default()
                },
            )
            .await
            .unwrap();

        let HandlerCommand::Subscribe { messages, .. } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };

        // A message before the deadline is delivered and re-arms it
        messages
            .try_send(Ok(ServerMessage {
                status_code: None,
                subscription_id: SubscriptionId::from(1),
                base: MessageBase {
                    subject: Subject::from_static("abcd.x"),
                    reply_subject: None,
                    headers: HeaderMap::new(),
                    payload: Bytes::from_static(b"test"),
                },
            }))
            .unwrap();
        assert_matches!(subscription.next().await, Some(Ok(_)));

        // With no further traffic the deadline fires
        assert_matches!(
            subscription.next().await,
            Some(Err(SubscriptionError::TimedOut))
        );
        assert_matches!(subscription.next().await, None);

        // The handler is asked to unsubscribe
        let HandlerCommand::Unsubscribe {
            id,
            max_messages: None,
        } = handler.receiver.try_recv().unwrap()
        else {
            unreachable!()
        };
        assert_eq!(SubscriptionId::from(1), id);
    }
}
