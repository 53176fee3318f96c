use std::{
    collections::VecDeque,
    future,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll, Waker},
};

use futures_core::{FusedStream, Stream};
use natrix_proto::{error::ServerError, ServerAddr};
use tracing::warn;

use crate::atomic::{AtomicU32, Ordering};

const CONSUMER_CAPACITY: usize = 32;

/// A connection lifecycle event
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Status {
    /// The connection to the given server was lost
    Disconnect(ServerAddr),
    /// The connection was re-established against the given server
    Reconnect(ServerAddr),
    /// The server pool changed following a gossiped cluster update
    ServersUpdate {
        added: Vec<ServerAddr>,
        removed: Vec<ServerAddr>,
    },
    /// The connected server entered lame duck mode
    LameDuck,
    /// The server reported a non-fatal error
    Error(ServerError),
}

#[derive(Debug)]
struct Shared {
    consumers: Mutex<Vec<Weak<ConsumerQueue>>>,
    // Count of live `StatusSender` clones; the bus closes at zero
    senders: AtomicU32,
}

#[derive(Debug)]
struct ConsumerQueue {
    state: Mutex<ConsumerState>,
}

// The waker lives under the same lock as the buffer, so an emit
// racing a poll can never miss the wakeup
#[derive(Debug)]
struct ConsumerState {
    buffer: VecDeque<Status>,
    waker: Option<Waker>,
}

/// The emitting side of the status bus
///
/// Events fan out to every live [`StatusStream`]; each consumer has
/// its own bounded queue with drop-oldest behavior under backpressure,
/// so a stalled consumer never blocks the connection or its peers.
#[derive(Debug)]
pub(crate) struct StatusSender {
    shared: Arc<Shared>,
}

impl StatusSender {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                consumers: Mutex::new(Vec::new()),
                senders: AtomicU32::new(1),
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> StatusStream {
        let queue = Arc::new(ConsumerQueue {
            state: Mutex::new(ConsumerState {
                buffer: VecDeque::with_capacity(CONSUMER_CAPACITY),
                waker: None,
            }),
        });

        self.shared
            .consumers
            .lock()
            .expect("status consumers lock is never poisoned")
            .push(Arc::downgrade(&queue));

        StatusStream {
            shared: Arc::clone(&self.shared),
            queue,
        }
    }

    pub(crate) fn emit(&self, status: Status) {
        let mut consumers = self
            .shared
            .consumers
            .lock()
            .expect("status consumers lock is never poisoned");

        consumers.retain(|consumer| {
            let Some(queue) = consumer.upgrade() else {
                return false;
            };

            let mut state = queue
                .state
                .lock()
                .expect("status consumer lock is never poisoned");
            if state.buffer.len() == CONSUMER_CAPACITY {
                state.buffer.pop_front();
                warn!("status consumer is lagging, dropping the oldest event");
            }
            state.buffer.push_back(status.clone());
            let waker = state.waker.take();
            drop(state);

            if let Some(waker) = waker {
                waker.wake();
            }
            true
        });
    }
}

impl Clone for StatusSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for StatusSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let consumers = self
            .shared
            .consumers
            .lock()
            .expect("status consumers lock is never poisoned");
        for consumer in consumers.iter() {
            let Some(queue) = consumer.upgrade() else {
                continue;
            };
            let waker = queue
                .state
                .lock()
                .expect("status consumer lock is never poisoned")
                .waker
                .take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// A consumer of connection lifecycle events
///
/// Obtained from [`Client::statuses`]. Events are yielded through the
/// [`Stream`] implementation; only events emitted after the consumer
/// was created are observed. If more than a small number of events
/// queue up without being received, the oldest are dropped.
///
/// The stream terminates once the client has shut down and all
/// buffered events have been consumed.
///
/// [`Client::statuses`]: crate::core::Client::statuses
#[derive(Debug)]
pub struct StatusStream {
    shared: Arc<Shared>,
    queue: Arc<ConsumerQueue>,
}

impl StatusStream {
    /// Receive the next event
    ///
    /// A convenience for polling the [`Stream`] implementation once.
    pub async fn recv(&mut self) -> Option<Status> {
        future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl Stream for StatusStream {
    type Item = Status;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut state = this
            .queue
            .state
            .lock()
            .expect("status consumer lock is never poisoned");

        if let Some(status) = state.buffer.pop_front() {
            return Poll::Ready(Some(status));
        }

        if this.shared.senders.load(Ordering::Acquire) == 0 {
            return Poll::Ready(None);
        }

        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl FusedStream for StatusStream {
    fn is_terminated(&self) -> bool {
        self.shared.senders.load(Ordering::Acquire) == 0
            && self
                .queue
                .state
                .lock()
                .expect("status consumer lock is never poisoned")
                .buffer
                .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_matches;
    use futures_core::FusedStream;
    use futures_util::StreamExt;

    use super::{Status, StatusSender, CONSUMER_CAPACITY};

    #[tokio::test]
    async fn fan_out() {
        let sender = StatusSender::new();
        let mut a = sender.subscribe();
        let mut b = sender.subscribe();

        sender.emit(Status::LameDuck);

        assert_matches!(a.recv().await, Some(Status::LameDuck));
        assert_matches!(b.recv().await, Some(Status::LameDuck));
    }

    #[tokio::test]
    async fn consumers_only_see_future_events() {
        let sender = StatusSender::new();
        sender.emit(Status::LameDuck);

        let mut consumer = sender.subscribe();
        drop(sender);
        assert_matches!(consumer.recv().await, None);
    }

    #[tokio::test]
    async fn drops_oldest_under_backpressure() {
        let sender = StatusSender::new();
        let mut consumer = sender.subscribe();

        sender.emit(Status::LameDuck);
        for _ in 0..CONSUMER_CAPACITY {
            sender.emit(Status::Disconnect("nats://a".parse().unwrap()));
        }
        drop(sender);

        // The initial event was the oldest and has been dropped
        for _ in 0..CONSUMER_CAPACITY {
            assert_matches!(consumer.recv().await, Some(Status::Disconnect(_)));
        }
        assert_matches!(consumer.recv().await, None);
    }

    #[tokio::test]
    async fn closes_when_sender_drops() {
        let sender = StatusSender::new();
        let clone = sender.clone();
        let mut consumer = sender.subscribe();

        sender.emit(Status::LameDuck);
        drop(sender);
        drop(clone);

        assert_matches!(consumer.recv().await, Some(Status::LameDuck));
        assert_matches!(consumer.recv().await, None);
    }

    #[tokio::test]
    async fn consumes_as_a_stream() {
        let sender = StatusSender::new();
        let mut consumer = sender.subscribe();
        assert!(!consumer.is_terminated());

        sender.emit(Status::LameDuck);
        assert_matches!(consumer.next().await, Some(Status::LameDuck));

        // A pending consumer is woken by a late event
        let waiter = tokio::spawn(async move {
            let event = consumer.next().await;
            (consumer, event)
        });
        sender.emit(Status::Reconnect("nats://a".parse().unwrap()));
        let (mut consumer, event) = waiter.await.unwrap();
        assert_matches!(event, Some(Status::Reconnect(_)));

        drop(sender);
        assert_matches!(consumer.next().await, None);
        assert!(consumer.is_terminated());
    }
}
