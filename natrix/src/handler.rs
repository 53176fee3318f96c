use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    num::NonZeroU64,
    ops::ControlFlow,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use natrix_proto::{
    error::ServerError,
    headers::HeaderMap,
    proto::{ClientOp, ServerOp},
    MessageBase, QueueGroup, ServerAddr, ServerInfo, ServerMessage, Subject, SubscriptionId,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::{self, Instant, Sleep},
};
use tracing::{debug, warn};

use crate::client::{create_inbox_subject, ClientBuilder, QuickInfo, RawQuickInfo};
use crate::connector::{self, ConnectError, Connection};
use crate::pool::ServerPool;
use crate::status::{Status, StatusSender};

pub(crate) const MULTIPLEXED_SUBSCRIPTION_ID: SubscriptionId = SubscriptionId::MIN;
const RECV_BUF: usize = 16;

/// The owner of one established connection
///
/// `Handler` is a hand-written future driving the reader, the writer
/// and the heartbeat cooperatively. It resolves only when the
/// connection is lost or deliberately shut down; the supervisor task
/// in the client decides what happens next.
#[derive(Debug)]
pub(crate) struct Handler {
    conn: Connection,
    info: Arc<ArcSwap<ServerInfo>>,
    quick_info: Arc<RawQuickInfo>,
    statuses: StatusSender,
    pool: ServerPool,
    delayed_flusher: Option<DelayedFlusher>,
    flushing: bool,
    shutting_down: bool,
    draining: bool,
    verbose: bool,
    retry_on_lame_duck: bool,

    // Incremented on every successful (re)connect; stamped on
    // subscription records when they are (re)registered on the wire
    generation: u64,

    ping_interval: Pin<Box<Sleep>>,
    ping_period: Duration,
    max_pings_out: usize,
    // One slot per outgoing PING awaiting its PONG, in wire order.
    // Flush waiters resolve as their slot pops.
    pings_out: VecDeque<PingSlot>,

    commands: mpsc::Receiver<HandlerCommand>,
    recv_buf: Vec<HandlerCommand>,
    in_flight_commands: VecDeque<InFlightCommand>,

    multiplexed_subscription_prefix: Subject,
    multiplexed_subscriptions: Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionEntry>,

    awaiting_drain: Vec<oneshot::Sender<()>>,
    awaiting_close: Vec<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct DelayedFlusher {
    // INVARIANT: `interval != Duration::ZERO`
    interval: Duration,
    delay: Pin<Box<Option<Sleep>>>,
}

/// The connection-independent state carried across reconnects
#[derive(Debug)]
pub(crate) struct RecycledHandler {
    commands: mpsc::Receiver<HandlerCommand>,
    quick_info: Arc<RawQuickInfo>,
    statuses: StatusSender,
    pool: ServerPool,
    info: Option<Arc<ArcSwap<ServerInfo>>>,
    generation: u64,
    draining: bool,

    multiplexed_subscription_prefix: Subject,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionEntry>,

    pending_flushes: Vec<oneshot::Sender<()>>,
    awaiting_drain: Vec<oneshot::Sender<()>>,
    awaiting_close: Vec<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    subject: Subject,
    queue_group: Option<QueueGroup>,
    messages: mpsc::Sender<Result<ServerMessage, ServerError>>,
    remaining: Option<NonZeroU64>,
    generation: u64,
    failed_subscribe: bool,
}

#[derive(Debug)]
pub(crate) enum HandlerCommand {
    Publish {
        message: MessageBase,
    },
    RequestMultiplexed {
        subject: Subject,
        reply_subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
        reply: oneshot::Sender<ServerMessage>,
    },
    UnsubscribeMultiplexed {
        reply_subject: Subject,
    },
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        max_messages: Option<NonZeroU64>,
        messages: mpsc::Sender<Result<ServerMessage, ServerError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    Flush(oneshot::Sender<()>),
    Drain(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) enum InFlightCommand {
    Unimportant,
    Subscribe { id: SubscriptionId },
}

#[derive(Debug)]
enum PingSlot {
    Heartbeat,
    Flush(oneshot::Sender<()>),
    Drain,
}

#[derive(Debug)]
pub(crate) enum HandlerOutput {
    /// A fatal server error; the supervisor closes without reconnecting
    ServerError(ServerError),
    UnexpectedState,
    /// The transport failed or heartbeats went unanswered
    Disconnected,
    Closed,
}

impl Handler {
    pub(crate) async fn connect(
        addr: &ServerAddr,
        builder: &ClientBuilder,
        mut recycle: RecycledHandler,
    ) -> Result<Self, (ConnectError, RecycledHandler)> {
        let (mut conn, info) = match connector::connect(addr, builder).await {
            Ok(items) => items,
            Err(err) => return Err((err, recycle)),
        };

        recycle.pool.mark_connected(addr);
        let generation = recycle.generation + 1;

        let mut in_flight_commands = VecDeque::new();
        for (&id, subscription) in &mut recycle.subscriptions {
            subscription.generation = generation;
            if builder.verbose {
                in_flight_commands.push_back(InFlightCommand::Subscribe { id });
            }
            conn.enqueue_write_op(&ClientOp::Subscribe {
                id,
                subject: subscription.subject.clone(),
                queue_group: subscription.queue_group.clone(),
            });

            if let Some(remaining) = subscription.remaining {
                if builder.verbose {
                    in_flight_commands.push_back(InFlightCommand::Unimportant);
                }
                conn.enqueue_write_op(&ClientOp::Unsubscribe {
                    id,
                    max_messages: Some(remaining),
                });
            }
        }
        debug!(
            generation,
            subscriptions = recycle.subscriptions.len(),
            "connection established"
        );

        // Flushes that were awaiting a PONG when the previous
        // connection died are re-armed on the new socket
        let mut pings_out = VecDeque::new();
        for sender in recycle.pending_flushes.drain(..) {
            conn.enqueue_write_op(&ClientOp::Ping);
            pings_out.push_back(PingSlot::Flush(sender));
        }

        let lame_duck_mode = info.lame_duck_mode;
        recycle.quick_info.store(|quick_info| QuickInfo {
            is_connected: true,
            is_lameduck: lame_duck_mode,
            ..quick_info
        });

        let info = match recycle.info.take() {
            Some(swap) => {
                swap.store(Arc::from(info));
                swap
            }
            None => Arc::new(ArcSwap::new(Arc::from(info))),
        };

        let delayed_flusher = if builder.flush_interval.is_zero() {
            None
        } else {
            Some(DelayedFlusher {
                interval: builder.flush_interval,
                delay: Box::pin(None),
            })
        };

        Ok(Self {
            conn,
            info,
            quick_info: recycle.quick_info,
            statuses: recycle.statuses,
            pool: recycle.pool,
            delayed_flusher,
            flushing: false,
            shutting_down: false,
            draining: recycle.draining,
            verbose: builder.verbose,
            retry_on_lame_duck: builder.retry_on_lame_duck,
            generation,
            ping_interval: Box::pin(time::sleep(builder.ping_interval)),
            ping_period: builder.ping_interval,
            max_pings_out: builder.max_pings_out,
            pings_out,
            commands: recycle.commands,
            recv_buf: Vec::with_capacity(RECV_BUF),
            in_flight_commands,
            subscriptions: recycle.subscriptions,
            multiplexed_subscription_prefix: recycle.multiplexed_subscription_prefix,
            multiplexed_subscriptions: None,
            awaiting_drain: recycle.awaiting_drain,
            awaiting_close: recycle.awaiting_close,
        })
    }

    pub(crate) async fn recycle(mut self) -> RecycledHandler {
        self.quick_info.store_is_connected(false);
        let _ = self.conn.shutdown().await;

        let mut pending_flushes = Vec::new();
        for slot in self.pings_out {
            if let PingSlot::Flush(sender) = slot {
                pending_flushes.push(sender);
            }
        }

        RecycledHandler {
            commands: self.commands,
            quick_info: self.quick_info,
            statuses: self.statuses,
            pool: self.pool,
            info: Some(self.info),
            generation: self.generation,
            draining: self.draining,
            subscriptions: self.subscriptions,
            multiplexed_subscription_prefix: self.multiplexed_subscription_prefix,
            pending_flushes,
            awaiting_drain: self.awaiting_drain,
            awaiting_close: self.awaiting_close,
        }
    }

    pub(crate) fn info(&self) -> &Arc<ArcSwap<ServerInfo>> {
        &self.info
    }

    pub(crate) fn multiplexed_subscription_prefix(&self) -> &Subject {
        &self.multiplexed_subscription_prefix
    }

    fn handle_server_op(&mut self, server_op: ServerOp) -> ControlFlow<HandlerOutput, ()> {
        match server_op {
            ServerOp::Message { message }
                if message.subscription_id == MULTIPLEXED_SUBSCRIPTION_ID =>
            {
                let Some(multiplexed_subscriptions) = &mut self.multiplexed_subscriptions else {
                    return ControlFlow::Continue(());
                };

                if let Some(sender) = multiplexed_subscriptions.remove(&message.base.subject) {
                    // The request may have been cancelled concurrently
                    let _ = sender.send(message);
                }
            }
            ServerOp::Message { message } => {
                let subscription_id = message.subscription_id;

                if let Some(subscription) = self.subscriptions.get_mut(&subscription_id) {
                    match subscription.messages.try_send(Ok(message)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(
                                sid = u64::from(subscription_id),
                                "subscription buffer full, dropping message"
                            );
                        }
                        Err(TrySendError::Closed(_)) => {
                            if self.verbose {
                                self.in_flight_commands
                                    .push_back(InFlightCommand::Unimportant);
                            }
                            self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                                id: subscription_id,
                                max_messages: None,
                            });
                            self.subscriptions.remove(&subscription_id);
                            return ControlFlow::Continue(());
                        }
                    }

                    if let Some(remaining) = &mut subscription.remaining {
                        match NonZeroU64::new(remaining.get() - 1) {
                            Some(new_remaining) => *remaining = new_remaining,
                            None => {
                                if let Some(entry) = self.subscriptions.remove(&subscription_id) {
                                    debug!(
                                        sid = u64::from(subscription_id),
                                        generation = entry.generation,
                                        "subscription reached its message limit"
                                    );
                                }
                            }
                        }
                    }
                } else {
                    // Racing unsubscribe. Silently discard
                }
            }
            ServerOp::Success => {
                if !self.verbose {
                    return ControlFlow::Continue(());
                }

                let Some(in_flight_command) = self.in_flight_commands.pop_front() else {
                    return ControlFlow::Break(HandlerOutput::UnexpectedState);
                };

                match in_flight_command {
                    InFlightCommand::Unimportant | InFlightCommand::Subscribe { .. } => {
                        // Nothing to do
                    }
                }
            }
            ServerOp::Error { error } if error.is_lame_duck() => {
                self.lame_duck();
                if self.retry_on_lame_duck {
                    return ControlFlow::Break(HandlerOutput::Disconnected);
                }
            }
            ServerOp::Error { error } if error.is_fatal() == Some(false) => {
                self.statuses.emit(Status::Error(error.clone()));

                if !self.verbose {
                    return ControlFlow::Continue(());
                }

                let Some(in_flight_command) = self.in_flight_commands.pop_front() else {
                    return ControlFlow::Break(HandlerOutput::UnexpectedState);
                };

                match in_flight_command {
                    InFlightCommand::Unimportant => {
                        // Nothing to do
                    }
                    InFlightCommand::Subscribe { id } => {
                        if let Some(mut subscription) = self.subscriptions.remove(&id) {
                            match subscription.messages.try_send(Err(error)) {
                                Ok(()) | Err(TrySendError::Closed(_)) => {
                                    // Nothing to do
                                }
                                Err(TrySendError::Full(_)) => {
                                    // The error is going to be lost.
                                    // Put the subscription back so the
                                    // unsubscribe sweep picks it up
                                    subscription.failed_subscribe = true;
                                    self.subscriptions.insert(id, subscription);
                                    self.quick_info.store_is_failed_unsubscribe(true);
                                }
                            }
                        }
                    }
                }
            }
            ServerOp::Error { error } => {
                self.statuses.emit(Status::Error(error.clone()));
                return ControlFlow::Break(HandlerOutput::ServerError(error));
            }
            ServerOp::Ping => {
                self.conn.enqueue_write_op(&ClientOp::Pong);
            }
            ServerOp::Pong => match self.pings_out.pop_front() {
                Some(PingSlot::Heartbeat) | None => {}
                Some(PingSlot::Flush(sender)) => {
                    let _ = sender.send(());
                }
                Some(PingSlot::Drain) => self.finish_drain(),
            },
            ServerOp::Info { info } => return self.handle_info(info),
        }

        ControlFlow::Continue(())
    }

    fn handle_info(&mut self, info: Box<ServerInfo>) -> ControlFlow<HandlerOutput, ()> {
        let update = self.pool.apply_connect_urls(&info.connect_urls);
        if !update.is_empty() {
            self.statuses.emit(Status::ServersUpdate {
                added: update.added,
                removed: update.removed,
            });
        }

        let lame_duck_mode = info.lame_duck_mode;
        self.info.store(Arc::from(info));

        if lame_duck_mode {
            self.lame_duck();
            if self.retry_on_lame_duck {
                return ControlFlow::Break(HandlerOutput::Disconnected);
            }
        }

        ControlFlow::Continue(())
    }

    #[cold]
    fn lame_duck(&mut self) {
        let was_lameduck = self.quick_info.get().is_lameduck;
        self.quick_info.store_is_lameduck(true);
        if !was_lameduck {
            debug!("server entered lame duck mode");
            self.statuses.emit(Status::LameDuck);
        }
    }

    #[cold]
    fn ping(&mut self, cx: &mut Context<'_>) -> Result<(), HandlerOutput> {
        if self.pings_out.len() < self.max_pings_out {
            loop {
                self.reset_ping_interval();
                if Pin::new(&mut self.ping_interval).poll(cx).is_pending() {
                    break;
                }
            }

            self.conn.enqueue_write_op(&ClientOp::Ping);
            self.pings_out.push_back(PingSlot::Heartbeat);
            Ok(())
        } else {
            warn!(
                pings_out = self.pings_out.len(),
                "heartbeats went unanswered, declaring the connection dead"
            );
            Err(HandlerOutput::Disconnected)
        }
    }

    #[cold]
    fn failed_unsubscribe(&mut self) {
        self.quick_info.store_is_failed_unsubscribe(false);

        if let Some(multiplexed_subscriptions) = &mut self.multiplexed_subscriptions {
            multiplexed_subscriptions.retain(|_subject, sender| !sender.is_closed());
        }

        let closed_subscription_ids = self
            .subscriptions
            .iter()
            .filter(|(_id, subscription)| {
                subscription.messages.is_closed() || subscription.failed_subscribe
            })
            .map(|(&id, _subscription)| id)
            .collect::<Vec<_>>();

        for closed_subscription_id in closed_subscription_ids {
            if self.verbose {
                self.in_flight_commands
                    .push_back(InFlightCommand::Unimportant);
            }
            self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                id: closed_subscription_id,
                max_messages: None,
            });
            self.subscriptions.remove(&closed_subscription_id);
        }
    }

    fn finish_drain(&mut self) {
        debug!("drain complete, shutting down");
        // Dropping the senders closes each sink once its buffered
        // messages have been pulled
        self.subscriptions.clear();
        self.multiplexed_subscriptions = None;
        for sender in self.awaiting_drain.drain(..) {
            let _ = sender.send(());
        }
        self.shutting_down = true;
        self.commands.close();
    }

    fn reset_ping_interval(&mut self) {
        Sleep::reset(self.ping_interval.as_mut(), Instant::now() + self.ping_period);
    }
}

impl Future for Handler {
    type Output = HandlerOutput;

    #[expect(clippy::too_many_lines)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        #[derive(Debug, Copy, Clone)]
        enum FlushAction {
            Start,
            Stop,
        }

        let this = self.get_mut();
        if Pin::new(&mut this.ping_interval).poll(cx).is_ready() {
            if let Err(output) = this.ping(cx) {
                return Poll::Ready(output);
            }
        }

        if this.quick_info.get().is_failed_unsubscribe {
            this.failed_unsubscribe();
        }

        let mut handled_server_op = false;
        loop {
            match this.conn.poll_read_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Ok(server_op)) => {
                    match this.handle_server_op(server_op) {
                        ControlFlow::Continue(()) => {}
                        ControlFlow::Break(output) => return Poll::Ready(output),
                    }
                    handled_server_op = true;
                }
                Poll::Ready(Err(_err)) => return Poll::Ready(HandlerOutput::Disconnected),
            }
        }
        if handled_server_op {
            this.reset_ping_interval();
        }

        loop {
            let receive_outcome = this.receive_command(cx);
            let write_waker_registered = if this.conn.may_write() {
                match this.conn.poll_write_next(cx) {
                    Poll::Pending => true,
                    Poll::Ready(Ok(_n)) => false,
                    Poll::Ready(Err(_err)) => {
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            } else {
                true
            };

            let flush_action = match (receive_outcome, this.conn.may_flush()) {
                (ReceiveOutcome::NoMoreCommands, true) => {
                    // We have written everything there was to write,
                    // and some data is buffered
                    FlushAction::Start
                }
                // When out of space the OS write backpressure already
                // forces the data out; flushing would only spin
                (ReceiveOutcome::NoMoreSpace, _) | (_, false) => FlushAction::Stop,
            };

            match flush_action {
                FlushAction::Start => {
                    this.flushing = true;
                    if let Some(delayed_flusher) = &mut this.delayed_flusher {
                        if delayed_flusher.delay.is_none() {
                            delayed_flusher
                                .delay
                                .set(Some(time::sleep(delayed_flusher.interval)));
                        }
                    }
                }
                FlushAction::Stop => {
                    this.flushing = false;
                }
            }

            match (receive_outcome, write_waker_registered) {
                (ReceiveOutcome::NoMoreCommands | ReceiveOutcome::NoMoreSpace, true) => {
                    // Writing is blocked. There's no progress to be made
                    break;
                }
                (_, false) => {
                    // At least the write waker must be registered
                    continue;
                }
            }
        }

        if this.flushing {
            let mut can_flush = true;
            if let Some(delay_flusher) = &mut this.delayed_flusher {
                if let Some(delay) = delay_flusher.delay.as_mut().as_pin_mut() {
                    if delay.poll(cx).is_ready() {
                        delay_flusher.delay.set(None);
                    } else {
                        can_flush = false;
                    }
                }
            }

            if can_flush {
                match this.conn.poll_flush(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => this.flushing = false,
                    Poll::Ready(Err(_err)) => return Poll::Ready(HandlerOutput::Disconnected),
                }
            }
        }

        if this.shutting_down {
            Poll::Ready(HandlerOutput::Closed)
        } else {
            Poll::Pending
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum ReceiveOutcome {
    NoMoreCommands,
    NoMoreSpace,
}

impl Handler {
    #[expect(
        clippy::too_many_lines,
        reason = "one match arm per command keeps the dispatch in one place"
    )]
    fn receive_command(&mut self, cx: &mut Context<'_>) -> ReceiveOutcome {
        while self.conn.may_enqueue_more_ops() {
            debug_assert!(self.recv_buf.is_empty());

            match self
                .commands
                .poll_recv_many(cx, &mut self.recv_buf, RECV_BUF)
            {
                Poll::Pending => return ReceiveOutcome::NoMoreCommands,
                Poll::Ready(1..) => {
                    for cmd in self.recv_buf.drain(..) {
                        match cmd {
                            HandlerCommand::Publish { message } => {
                                if self.verbose {
                                    self.in_flight_commands
                                        .push_back(InFlightCommand::Unimportant);
                                }
                                self.conn.enqueue_write_op(&ClientOp::Publish { message });
                            }
                            HandlerCommand::RequestMultiplexed {
                                subject,
                                reply_subject,
                                headers,
                                payload,
                                reply,
                            } => {
                                debug_assert!(reply_subject
                                    .starts_with(&*self.multiplexed_subscription_prefix));

                                let multiplexed_subscriptions =
                                    if let Some(multiplexed_subscriptions) =
                                        &mut self.multiplexed_subscriptions
                                    {
                                        multiplexed_subscriptions
                                    } else {
                                        init_multiplexed_subscriptions(
                                            self.verbose,
                                            &mut self.in_flight_commands,
                                            &mut self.conn,
                                            &self.multiplexed_subscription_prefix,
                                            &mut self.multiplexed_subscriptions,
                                        )
                                    };

                                if self.verbose {
                                    self.in_flight_commands
                                        .push_back(InFlightCommand::Unimportant);
                                }
                                multiplexed_subscriptions.insert(reply_subject.clone(), reply);

                                let message = MessageBase {
                                    subject,
                                    reply_subject: Some(reply_subject),
                                    headers,
                                    payload,
                                };
                                self.conn.enqueue_write_op(&ClientOp::Publish { message });
                            }
                            HandlerCommand::UnsubscribeMultiplexed { reply_subject } => {
                                debug_assert!(reply_subject
                                    .starts_with(&*self.multiplexed_subscription_prefix));

                                if let Some(multiplexed_subscriptions) =
                                    &mut self.multiplexed_subscriptions
                                {
                                    let _ = multiplexed_subscriptions.remove(&reply_subject);
                                }
                            }
                            HandlerCommand::Subscribe {
                                id,
                                subject,
                                queue_group,
                                max_messages,
                                messages,
                            } => {
                                self.subscriptions.insert(
                                    id,
                                    SubscriptionEntry {
                                        subject: subject.clone(),
                                        queue_group: queue_group.clone(),
                                        messages,
                                        remaining: max_messages,
                                        generation: self.generation,
                                        failed_subscribe: false,
                                    },
                                );
                                if self.verbose {
                                    self.in_flight_commands
                                        .push_back(InFlightCommand::Subscribe { id });
                                }
                                self.conn.enqueue_write_op(&ClientOp::Subscribe {
                                    id,
                                    subject,
                                    queue_group,
                                });
                                if let Some(max_messages) = max_messages {
                                    if self.verbose {
                                        self.in_flight_commands
                                            .push_back(InFlightCommand::Unimportant);
                                    }
                                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                                        id,
                                        max_messages: Some(max_messages),
                                    });
                                }
                            }
                            HandlerCommand::Unsubscribe {
                                id,
                                max_messages: Some(max_messages),
                            } => {
                                if let Some(subscription) = self.subscriptions.get_mut(&id) {
                                    subscription.remaining = Some(max_messages);
                                    if self.verbose {
                                        self.in_flight_commands
                                            .push_back(InFlightCommand::Unimportant);
                                    }
                                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                                        id,
                                        max_messages: Some(max_messages),
                                    });
                                }
                            }
                            HandlerCommand::Unsubscribe {
                                id,
                                max_messages: None,
                            } => {
                                if self.subscriptions.remove(&id).is_some() {
                                    if self.verbose {
                                        self.in_flight_commands
                                            .push_back(InFlightCommand::Unimportant);
                                    }
                                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                                        id,
                                        max_messages: None,
                                    });
                                }
                            }
                            HandlerCommand::Flush(sender) => {
                                self.conn.enqueue_write_op(&ClientOp::Ping);
                                self.pings_out.push_back(PingSlot::Flush(sender));
                            }
                            HandlerCommand::Drain(sender) => {
                                self.awaiting_drain.push(sender);
                                if !self.draining {
                                    self.draining = true;
                                    self.quick_info.store_is_draining(true);

                                    let ids =
                                        self.subscriptions.keys().copied().collect::<Vec<_>>();
                                    for id in ids {
                                        if self.verbose {
                                            self.in_flight_commands
                                                .push_back(InFlightCommand::Unimportant);
                                        }
                                        self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                                            id,
                                            max_messages: None,
                                        });
                                    }
                                    self.conn.enqueue_write_op(&ClientOp::Ping);
                                    self.pings_out.push_back(PingSlot::Drain);
                                }
                            }
                            HandlerCommand::Close(sender) => {
                                self.shutting_down = true;
                                self.awaiting_close.push(sender);
                                self.commands.close();
                            }
                        }
                    }
                }
                Poll::Ready(0) => self.shutting_down = true,
            }
        }

        ReceiveOutcome::NoMoreSpace
    }
}

impl RecycledHandler {
    pub(crate) fn new(
        commands: mpsc::Receiver<HandlerCommand>,
        quick_info: Arc<RawQuickInfo>,
        statuses: StatusSender,
        pool: ServerPool,
        builder: &ClientBuilder,
    ) -> Self {
        Self {
            commands,
            quick_info,
            statuses,
            pool,
            info: None,
            generation: 0,
            draining: false,
            subscriptions: BTreeMap::new(),
            multiplexed_subscription_prefix: create_inbox_subject(&builder.inbox_prefix),
            pending_flushes: Vec::new(),
            awaiting_drain: Vec::new(),
            awaiting_close: Vec::new(),
        }
    }

    pub(crate) fn next_server(&mut self) -> Option<(ServerAddr, Duration)> {
        self.pool.next()
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining
    }

    pub(crate) fn resolve_drain(&mut self) {
        for sender in self.awaiting_drain.drain(..) {
            let _ = sender.send(());
        }
    }
}

#[cold]
fn init_multiplexed_subscriptions<'a>(
    verbose: bool,
    in_flight_commands: &mut VecDeque<InFlightCommand>,
    conn: &mut Connection,
    multiplexed_subscription_prefix: &Subject,
    multiplexed_subscriptions: &'a mut Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,
) -> &'a mut BTreeMap<Subject, oneshot::Sender<ServerMessage>> {
    if verbose {
        in_flight_commands.push_back(InFlightCommand::Subscribe {
            id: MULTIPLEXED_SUBSCRIPTION_ID,
        });
    }
    conn.enqueue_write_op(&ClientOp::Subscribe {
        id: MULTIPLEXED_SUBSCRIPTION_ID,
        subject: Subject::from_dangerous_value(
            format!("{multiplexed_subscription_prefix}.*").into(),
        ),
        queue_group: None,
    });

    multiplexed_subscriptions.insert(BTreeMap::new())
}
