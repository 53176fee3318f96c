use std::sync::Arc;

use arc_swap::ArcSwap;
use natrix_proto::ServerInfo;
use tokio::sync::{mpsc, watch};

use crate::handler::HandlerCommand;

use super::{CloseOutcome, RawQuickInfo, StatusSender};

#[derive(Debug)]
pub(crate) struct TestHandler {
    pub(crate) receiver: mpsc::Receiver<HandlerCommand>,
    pub(crate) _info: Arc<ArcSwap<ServerInfo>>,
    pub(crate) quick_info: Arc<RawQuickInfo>,
    pub(crate) _statuses: StatusSender,
    pub(crate) closed_sender: watch::Sender<Option<CloseOutcome>>,
}

mod api {
    use std::{future::Future, pin::pin, task::Context};

    use bytes::Bytes;
    use claims::assert_matches;
    use futures_util::task::noop_waker_ref;
    use natrix_proto::Subject;

    use crate::client::{
        Client, ClientError, CloseOutcome, PublishError, SubscribeError,
    };
    use crate::handler::HandlerCommand;

    #[tokio::test]
    async fn flush_resolves_after_queued_publishes() {
        let (client, mut handler) = Client::test(2);

        client
            .publish(Subject::from_static("greet"))
            .payload(Bytes::from_static(b"hello"))
            .try_publish()
            .unwrap();

        let mut flush_fut = pin!(client.flush());
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(flush_fut.as_mut().poll(&mut cx).is_pending());

        // The publish is handed over before the flush marker
        let HandlerCommand::Publish { message } = handler.receiver.try_recv().unwrap() else {
            unreachable!()
        };
        assert_eq!(Subject::from_static("greet"), message.subject);

        let HandlerCommand::Flush(sender) = handler.receiver.try_recv().unwrap() else {
            unreachable!()
        };
        sender.send(()).unwrap();

        flush_fut.await.unwrap();
    }

    #[tokio::test]
    async fn drain_refuses_new_work() {
        let (client, mut handler) = Client::test(2);

        let drain_client = client.clone();
        let drain_task = tokio::spawn(async move { drain_client.drain().await });

        let HandlerCommand::Drain(sender) = handler.receiver.recv().await.unwrap() else {
            unreachable!()
        };

        assert_matches!(
            client
                .publish(Subject::from_static("greet"))
                .payload(Bytes::new())
                .try_publish(),
            Err(PublishError::Draining)
        );
        assert_matches!(
            client.subscribe(Subject::from_static("greet"), None).await,
            Err(SubscribeError::Draining)
        );

        sender.send(()).unwrap();
        drain_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_reports_the_failure_to_every_caller() {
        let (client, handler) = Client::test(1);

        handler
            .closed_sender
            .send(Some(CloseOutcome::Failed(ClientError::ConnectionLost)))
            .unwrap();

        assert_matches!(client.closed().await, Some(ClientError::ConnectionLost));
        assert_matches!(client.closed().await, Some(ClientError::ConnectionLost));
    }

    #[tokio::test]
    async fn closed_resolves_cleanly_after_orderly_shutdown() {
        let (client, handler) = Client::test(1);

        handler
            .closed_sender
            .send(Some(CloseOutcome::Clean))
            .unwrap();

        assert_matches!(client.closed().await, None);
    }
}
