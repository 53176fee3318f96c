use std::{num::NonZeroU64, process::abort, sync::Arc, time::Duration};
#[cfg(test)]
use std::{
    net::{IpAddr, Ipv4Addr},
    num::{NonZeroU16, NonZeroU32},
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use natrix_proto::{
    error::ServerError, headers::HeaderMap, QueueGroup, ServerInfo, Subject, SubscriptionId,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Permit},
        oneshot, watch,
    },
    task::JoinHandle,
    time,
};
use tracing::warn;

pub use self::builder::{ClientBuilder, Echo};
pub use self::commands::{
    ClientPublish, ClientRequest, DoClientPublish, DoClientRequest, DoOwnedClientPublish,
    DoOwnedClientRequest, OwnedClientPublish, OwnedClientRequest, Publish, PublishBuilder,
    PublishError, Request, RequestBuilder, ResponseError, ResponseFut,
};
pub use self::quick_info::QuickInfo;
pub(crate) use self::quick_info::RawQuickInfo;
#[cfg(test)]
use self::tests::TestHandler;
use crate::{
    atomic::{AtomicU64, Ordering},
    connector::ConnectError,
    core::{MultiplexedSubscription, Subscription},
    handler::{
        Handler, HandlerCommand, HandlerOutput, RecycledHandler, MULTIPLEXED_SUBSCRIPTION_ID,
    },
    pool::ServerPool,
    status::{Status, StatusSender, StatusStream},
};

mod builder;
mod commands;
mod quick_info;
#[cfg(test)]
pub(crate) mod tests;

const CLIENT_OP_CHANNEL_SIZE: usize = 512;
const SUBSCRIPTION_CHANNEL_SIZE: usize = 256;

/// A NATS client
///
/// `Client` is a `Clone`able handle to a NATS connection.
/// If the connection is lost, the client will automatically walk the
/// server pool, reconnect and resume any currently open subscriptions.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sender: mpsc::Sender<HandlerCommand>,
    info: Arc<ArcSwap<ServerInfo>>,
    quick_info: Arc<RawQuickInfo>,
    statuses: StatusSender,
    multiplexed_subscription_prefix: Subject,
    next_subscription_id: AtomicU64,
    inbox_prefix: Subject,
    default_response_timeout: Duration,
    closed: watch::Receiver<Option<CloseOutcome>>,
    handler: JoinHandle<()>,
}

#[derive(Debug, Clone)]
enum CloseOutcome {
    Clean,
    Failed(ClientError),
}

/// An error encountered while trying to publish a command to a closed [`Client`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("client closed")]
pub struct ClientClosedError;

/// The terminal condition reported by [`Client::closed`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server reported a fatal error
    ///
    /// Fatal errors, such as authorization violations, close the
    /// connection without a reconnect attempt.
    #[error("fatal server error")]
    Server(#[source] ServerError),
    /// The connection was lost and automatic reconnects are disabled
    #[error("the connection was lost and reconnecting is disabled")]
    ConnectionLost,
    /// Every server in the pool exhausted its reconnect budget
    #[error("every server in the pool exhausted its reconnect budget")]
    ReconnectExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum TryCommandError {
    /// The client's internal buffer is currently full
    #[error("outbound buffer full")]
    SlowConsumer,
    /// The client is draining towards shutdown
    #[error("connection is draining")]
    Draining,
    /// The client has been closed via [`Client::close`]
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while subscribing
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The client is draining towards shutdown
    #[error("connection is draining")]
    Draining,
    /// The client has been closed
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// Options for [`Client::subscribe_with`]
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Ask the server to close the subscription after this many messages
    ///
    /// The `UNSUB` carrying the limit is sent immediately after the
    /// `SUB`, so the server enforces it even if the client falls behind.
    pub max_messages: Option<NonZeroU64>,
    /// Close the subscription with a timeout error if no message
    /// arrives within this window
    pub inactivity_timeout: Option<Duration>,
}

impl Client {
    /// Construct a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(super) async fn connect(builder: ClientBuilder) -> Result<Self, ConnectError> {
        let (sender, receiver) = mpsc::channel(CLIENT_OP_CHANNEL_SIZE);

        let quick_info = Arc::new(RawQuickInfo::new());
        let statuses = StatusSender::new();

        let mut seeds = builder.servers.clone();
        if seeds.is_empty() {
            seeds.push(
                "nats://127.0.0.1:4222"
                    .parse()
                    .expect("the default server address is valid"),
            );
        }
        let pool = ServerPool::new(
            seeds,
            !builder.no_randomize,
            builder.reconnect_time_wait,
            builder.max_reconnect_attempts,
        );
        let pool_len = pool.len();

        let mut recycle = RecycledHandler::new(
            receiver,
            Arc::clone(&quick_info),
            statuses.clone(),
            pool,
            &builder,
        );

        // Initial connect: one pass over the pool, no backoff
        let mut connected = None;
        let mut last_err = None;
        for _ in 0..pool_len {
            let Some((addr, _delay)) = recycle.next_server() else {
                break;
            };
            match Handler::connect(&addr, &builder, recycle).await {
                Ok(handle) => {
                    connected = Some((handle, addr));
                    break;
                }
                Err((err, prev_recycle)) => {
                    warn!(server = %addr, error = %err, "failed to connect");
                    last_err = Some(err);
                    recycle = prev_recycle;
                }
            }
        }
        let Some((handle, current_addr)) = connected else {
            return Err(last_err.expect("at least one connect attempt is always made"));
        };

        let info = handle.info().clone();
        let multiplexed_subscription_prefix = handle.multiplexed_subscription_prefix().clone();
        let inbox_prefix = builder.inbox_prefix.clone();
        let default_response_timeout = builder.default_response_timeout;

        let (closed_sender, closed) = watch::channel(None);
        let statuses_task = statuses.clone();

        let handler = tokio::spawn(async move {
            let mut handle = handle;
            let mut current_addr = current_addr;

            let outcome = 'supervise: loop {
                match (&mut handle).await {
                    HandlerOutput::Closed => break CloseOutcome::Clean,
                    HandlerOutput::UnexpectedState => {
                        // Retry and hope for the best
                        warn!("connection handler reached an unexpected state");
                    }
                    HandlerOutput::ServerError(error) => {
                        let _ = handle.recycle().await;
                        break CloseOutcome::Failed(ClientError::Server(error));
                    }
                    HandlerOutput::Disconnected => {
                        let mut recycle = handle.recycle().await;
                        statuses_task.emit(Status::Disconnect(current_addr.clone()));

                        if recycle.is_draining() {
                            // The subscriptions are already torn down;
                            // losing the socket completes the drain
                            recycle.resolve_drain();
                            break CloseOutcome::Clean;
                        }
                        if !builder.reconnect {
                            break CloseOutcome::Failed(ClientError::ConnectionLost);
                        }

                        handle = loop {
                            let Some((addr, delay)) = recycle.next_server() else {
                                break 'supervise CloseOutcome::Failed(
                                    ClientError::ReconnectExhausted,
                                );
                            };
                            time::sleep(delay).await;

                            match Handler::connect(&addr, &builder, recycle).await {
                                Ok(new_handle) => {
                                    current_addr = addr;
                                    break new_handle;
                                }
                                Err((err, prev_recycle)) => {
                                    warn!(server = %addr, error = %err, "reconnect attempt failed");
                                    recycle = prev_recycle;
                                }
                            }
                        };
                        statuses_task.emit(Status::Reconnect(current_addr.clone()));
                    }
                }
            };

            let _ = closed_sender.send(Some(outcome));
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                sender,
                info,
                quick_info,
                statuses,
                multiplexed_subscription_prefix,
                next_subscription_id: AtomicU64::new(u64::from(MULTIPLEXED_SUBSCRIPTION_ID) + 1),
                inbox_prefix,
                default_response_timeout,
                closed,
                handler,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn test(client_to_handler_chan_size: usize) -> (Self, TestHandler) {
        let builder = Self::builder();
        let (sender, receiver) = mpsc::channel(client_to_handler_chan_size);
        let info = Arc::new(ArcSwap::new(Arc::new(ServerInfo {
            id: "1234".to_owned(),
            name: "natrix-test".to_owned(),
            version: "2.10.17".to_owned(),
            go_version: "1.22.5".to_owned(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: NonZeroU16::new(4222).unwrap(),
            supports_headers: true,
            max_payload: NonZeroU32::new(1024 * 1024).unwrap(),
            protocol_version: 1,
            client_id: Some(1),
            auth_required: false,
            tls_required: false,
            tls_verify: false,
            tls_available: false,
            connect_urls: Vec::new(),
            lame_duck_mode: false,
            git_commit: None,
            ip: None,
            client_ip: None,
            nonce: None,
            cluster_name: None,
            domain: None,
        })));
        let quick_info = Arc::new(RawQuickInfo::new());
        let statuses = StatusSender::new();
        let multiplexed_subscription_prefix = create_inbox_subject(&builder.inbox_prefix);
        let (closed_sender, closed) = watch::channel(None);

        let this = Self {
            inner: Arc::new(ClientInner {
                sender,
                info: Arc::clone(&info),
                quick_info: Arc::clone(&quick_info),
                statuses: statuses.clone(),
                multiplexed_subscription_prefix,
                next_subscription_id: AtomicU64::new(1),
                inbox_prefix: builder.inbox_prefix,
                default_response_timeout: builder.default_response_timeout,
                closed,
                handler: tokio::spawn(async move {}),
            }),
        };
        let handler = TestHandler {
            receiver,
            _info: info,
            quick_info,
            _statuses: statuses,
            closed_sender,
        };
        (this, handler)
    }

    /// Publish a new message to the server
    ///
    /// Consider calling [`Publish::client`] instead if you already have
    /// a [`Publish`] instance.
    #[must_use]
    pub fn publish(&self, subject: Subject) -> ClientPublish {
        ClientPublish::build(self, subject)
    }

    /// Publish a new request to the server and await a reply
    ///
    /// Consider calling [`Request::client`] instead if you already have
    /// a [`Request`] instance.
    #[must_use]
    pub fn request(&self, subject: Subject) -> ClientRequest {
        ClientRequest::build(self, subject)
    }

    /// Publish a new message to the server, taking ownership of this client
    ///
    /// When possible consider using [`Client::publish`] instead.
    ///
    /// Consider calling [`Publish::client_owned`] instead if you already have
    /// a [`Publish`] instance.
    #[must_use]
    pub fn publish_owned(self, subject: Subject) -> OwnedClientPublish {
        OwnedClientPublish::build(self, subject)
    }

    /// Publish a new request to the server, taking ownership of this client
    ///
    /// When possible consider using [`Client::request`] instead.
    ///
    /// Consider calling [`Request::client_owned`] instead if you already have
    /// a [`Request`] instance.
    #[must_use]
    pub fn request_owned(self, subject: Subject) -> OwnedClientRequest {
        OwnedClientRequest::build(self, subject)
    }

    /// Subscribe to the given filter subject
    ///
    /// Create a new subscription with the server and ask for all
    /// messages matching the given `filter_subject` to be delivered
    /// to the client.
    ///
    /// If `queue_group` is provided and multiple clients subscribe with
    /// the same [`QueueGroup`] value, the server will try to deliver
    /// these messages to only one of the clients.
    ///
    /// If the client was built with [`Echo::Allow`], then messages
    /// published by this same client may be received by this subscription.
    ///
    /// # Errors
    ///
    /// This returns an error if the client is closed or draining.
    pub async fn subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, SubscribeError> {
        self.subscribe_with(filter_subject, queue_group, SubscribeOptions::default())
            .await
    }

    /// Subscribe to the given filter subject with additional options
    ///
    /// See [`Client::subscribe`] and [`SubscribeOptions`].
    ///
    /// # Errors
    ///
    /// This returns an error if the client is closed or draining.
    pub async fn subscribe_with(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        options: SubscribeOptions,
    ) -> Result<Subscription, SubscribeError> {
        if self.is_draining() {
            return Err(SubscribeError::Draining);
        }

        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| SubscribeError::Closed(ClientClosedError))?;

        Ok(self.do_subscribe(permit, filter_subject, queue_group, options))
    }

    pub(crate) fn try_subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, TryCommandError> {
        if self.is_draining() {
            return Err(TryCommandError::Draining);
        }

        let permit = self
            .inner
            .sender
            .try_reserve()
            .map_err(|err| match err {
                TrySendError::Full(()) => TryCommandError::SlowConsumer,
                TrySendError::Closed(()) => TryCommandError::Closed(ClientClosedError),
            })?;

        Ok(self.do_subscribe(
            permit,
            filter_subject,
            queue_group,
            SubscribeOptions::default(),
        ))
    }

    fn do_subscribe(
        &self,
        permit: Permit<'_, HandlerCommand>,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
        options: SubscribeOptions,
    ) -> Subscription {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        if id == SubscriptionId::MAX {
            abort();
        }
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_SIZE);

        permit.send(HandlerCommand::Subscribe {
            id,
            subject: filter_subject,
            queue_group,
            max_messages: options.max_messages,
            messages: sender,
        });
        Subscription::new(id, self.clone(), receiver, options.inactivity_timeout)
    }

    pub(super) async fn multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, ClientClosedError> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        Ok(self.do_multiplexed_request(permit, subject, headers, payload))
    }

    pub(super) fn try_multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, TryCommandError> {
        let permit = self.inner.sender.try_reserve().map_err(|err| match err {
            TrySendError::Full(()) => TryCommandError::SlowConsumer,
            TrySendError::Closed(()) => TryCommandError::Closed(ClientClosedError),
        })?;

        Ok(self.do_multiplexed_request(permit, subject, headers, payload))
    }

    fn do_multiplexed_request(
        &self,
        permit: Permit<'_, HandlerCommand>,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> MultiplexedSubscription {
        let (sender, receiver) = oneshot::channel();

        let reply_subject = create_inbox_subject(&self.inner.multiplexed_subscription_prefix);

        permit.send(HandlerCommand::RequestMultiplexed {
            subject,
            reply_subject: reply_subject.clone(),
            headers,
            payload,
            reply: sender,
        });
        MultiplexedSubscription::new(reply_subject, receiver, self.clone())
    }

    /// Get the last [`ServerInfo`] sent by the server
    ///
    /// Consider calling [`Client::quick_info`] if you only need
    /// information about Lame Duck Mode.
    #[must_use]
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner.info.load_full()
    }

    /// Get information about the client
    #[must_use]
    pub fn quick_info(&self) -> QuickInfo {
        self.inner.quick_info.get()
    }

    /// Subscribe to connection lifecycle events
    ///
    /// The returned consumer observes only events emitted after this
    /// call. Each consumer is independently buffered; the oldest
    /// events are dropped if a consumer falls too far behind.
    #[must_use]
    pub fn statuses(&self) -> StatusStream {
        self.inner.statuses.subscribe()
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.inner.quick_info.get().is_draining
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.inner.info.load().max_payload.get() as usize
    }

    pub(crate) fn create_inbox_subject(&self) -> Subject {
        create_inbox_subject(&self.inner.inbox_prefix)
    }

    pub(crate) fn default_response_timeout(&self) -> Duration {
        self.inner.default_response_timeout
    }

    pub(crate) fn lazy_unsubscribe_multiplexed(&self, reply_subject: Subject) {
        if self
            .try_enqueue_command(HandlerCommand::UnsubscribeMultiplexed { reply_subject })
            .is_ok()
        {
            return;
        }

        self.inner.quick_info.store_is_failed_unsubscribe(true);
    }

    pub(crate) async fn unsubscribe(
        &self,
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    ) -> Result<(), ClientClosedError> {
        self.enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, id: SubscriptionId, max_messages: Option<NonZeroU64>) {
        if self
            .try_enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .is_ok()
        {
            return;
        }

        self.inner.quick_info.store_is_failed_unsubscribe(true);
    }

    pub(super) async fn enqueue_command(
        &self,
        cmd: HandlerCommand,
    ) -> Result<(), ClientClosedError> {
        self.inner
            .sender
            .send(cmd)
            .await
            .map_err(|_| ClientClosedError)
    }

    pub(super) fn try_enqueue_command(&self, cmd: HandlerCommand) -> Result<(), TryCommandError> {
        self.inner
            .sender
            .try_send(cmd)
            .map_err(TryCommandError::from_try_send_error)
    }

    /// Flush the outbound queue
    ///
    /// Sends a `PING` after everything published so far and resolves
    /// once the matching `PONG` is observed, guaranteeing that all
    /// previously enqueued frames have been handed to the transport.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed before the `PONG`
    /// arrives.
    pub async fn flush(&self) -> Result<(), ClientClosedError> {
        let (sender, receiver) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Flush(sender)).await?;
        receiver.await.map_err(|_| ClientClosedError)
    }

    /// Drain the client towards an orderly shutdown
    ///
    /// Stops accepting new publishes and subscribes, unsubscribes
    /// every subscription, flushes, and lets the subscription sinks
    /// deliver their buffered messages before the connection closes.
    ///
    /// Draining is irreversible.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is already closed.
    pub async fn drain(&self) -> Result<(), ClientClosedError> {
        self.inner.quick_info.store_is_draining(true);

        let (sender, receiver) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Drain(sender)).await?;
        receiver.await.map_err(|_| ClientClosedError)
    }

    /// Close this client, waiting for any remaining buffered messages to be processed first
    ///
    /// Attempts to send commands to the server after this method has been called will
    /// result into a [`ClientClosedError`] error.
    ///
    /// Calling this method multiple times, possibly from different
    /// clones of the client, is a NOOP.
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        if self
            .enqueue_command(HandlerCommand::Close(sender))
            .await
            .is_err()
        {
            return;
        }

        let _ = receiver.await;
    }

    /// Wait for the client to terminate
    ///
    /// Resolves exactly once per client, for every caller, when the
    /// connection reaches its terminal state. Returns `None` after an
    /// orderly close or drain, and the fatal error otherwise.
    pub async fn closed(&self) -> Option<ClientError> {
        let mut receiver = self.inner.closed.clone();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => return None,
        };

        match outcome {
            Some(CloseOutcome::Failed(err)) => Some(err),
            Some(CloseOutcome::Clean) | None => None,
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl TryCommandError {
    #[expect(
        clippy::needless_pass_by_value,
        reason = "this is an auxiliary conversion function"
    )]
    pub(crate) fn from_try_send_error<T>(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::SlowConsumer,
            TrySendError::Closed(_) => Self::Closed(ClientClosedError),
        }
    }
}

pub(crate) fn create_inbox_subject(prefix: &Subject) -> Subject {
    let token = crate::nuid::next();

    let mut subject = String::with_capacity(prefix.len() + ".".len() + token.len());
    subject.push_str(prefix);
    subject.push('.');
    subject.push_str(&token);

    Subject::from_dangerous_value(subject.into())
}
