use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

use super::message::{Message, Notification};
use super::session::Session;
use super::shutdown::{ShutdownReason, TerminationRecord};
use super::sink::ProtocolSink;
use super::transport::MessageTransport;
use super::{ProtocolError, ProtocolResult, ProtocolRole, ProtocolState};
use crate::ast::{Node, to_wire};
use crate::config::{ConfigResult, ProtocolConfig};
use crate::duplex::DuplexSink;
use crate::eval::{HostBindings, KnownTypeRegistry, LocalEvaluationVisitor};
use crate::value::Value;

/// Client end of a session: sends one plan and yields the server's
/// notifications.
pub struct ClientProtocol {
    transport: Arc<dyn MessageTransport>,
    config: Arc<ProtocolConfig>,
    sinks: Vec<Arc<dyn ProtocolSink>>,
    duplex: Option<Arc<DuplexSink>>,
    bindings: HostBindings,
    known_types: KnownTypeRegistry,
    session: Session,
}

impl ClientProtocol {
    pub fn new(transport: Arc<dyn MessageTransport>, config: ProtocolConfig) -> ConfigResult<Self> {
        config.validate()?;
        let known_types = KnownTypeRegistry::from_config(&config.known_types)?;
        let duplex = config.enable_duplex.then(|| Arc::new(DuplexSink::new()));
        let config = Arc::new(config);
        let mut client = Self {
            session: Session::new(ProtocolRole::Client, transport.clone(), config.clone(), vec![]),
            transport,
            config,
            sinks: vec![],
            duplex,
            bindings: HostBindings::new(),
            known_types,
        };
        client.rebuild_session();
        Ok(client)
    }

    /// Adds a sink ahead of the duplex sink. Sinks run in the order added.
    pub fn with_sink(mut self, sink: Arc<dyn ProtocolSink>) -> Self {
        self.sinks.push(sink);
        self.rebuild_session();
        self
    }

    /// Local values and functions substituted for members the server does
    /// not know.
    pub fn with_bindings(mut self, bindings: HostBindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_known_types(mut self, known_types: KnownTypeRegistry) -> Self {
        self.known_types = known_types;
        self
    }

    fn rebuild_session(&mut self) {
        let mut sinks = self.sinks.clone();
        if let Some(duplex) = &self.duplex {
            sinks.push(duplex.clone());
        }
        self.session = Session::new(
            ProtocolRole::Client,
            self.transport.clone(),
            self.config.clone(),
            sinks,
        );
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The duplex sink, present when duplex callbacks are enabled.
    pub fn duplex(&self) -> Option<&Arc<DuplexSink>> {
        self.duplex.as_ref()
    }

    /// Negotiates, rewrites and sends `plan`, then streams the server's
    /// notifications. The stream ends after the first terminal
    /// notification.
    #[instrument(skip_all, fields(plan = %plan.ty()))]
    pub async fn execute(
        &self,
        plan: &Node,
        argument: Option<Value>,
    ) -> ProtocolResult<NotificationStream> {
        let session = self.session.clone();
        session.expect_state(ProtocolState::Created)?;

        if let Err(e) = self.start(plan, argument).await {
            warn!("Client session failed to start: {}", e);
            if session.shutdown_state().reason().is_empty() {
                session.record(ShutdownReason::CLIENT_TERMINATED);
            }
            session.dispose().await;
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        tokio::spawn(receive_loop(session.clone(), tx, finished.clone()));
        Ok(NotificationStream {
            inner: UnboundedReceiverStream::new(rx),
            session,
            finished,
        })
    }

    async fn start(&self, plan: &Node, argument: Option<Value>) -> ProtocolResult<()> {
        let session = &self.session;
        let id = session.negotiate().await?;
        debug!("Negotiated session {}", id);
        session.initialize_sinks().await?;

        let mut visitor = LocalEvaluationVisitor::new(&self.known_types, &self.bindings);
        if let Some(duplex) = &self.duplex {
            visitor = visitor.with_registrar(duplex.as_ref());
        }
        let plan = visitor.rewrite(plan)?;
        let argument = argument
            .map(|value| visitor.rewrite_value(&value))
            .transpose()?;
        let wire = to_wire(&plan)?;

        session.transition(ProtocolState::Executing);
        if let Some(argument) = argument {
            session.send(Message::Argument(argument)).await?;
        }
        session.send(Message::Subscribe(wire)).await?;
        info!("Subscribed session {}", id);
        Ok(())
    }

    /// Abandons the session. The server is told with a `Shutdown` carrying
    /// `CLIENT_TERMINATED`.
    pub fn cancel(&self) {
        self.session.record(ShutdownReason::CLIENT_TERMINATED);
        self.session.cancel();
    }

    pub fn termination_record(&self) -> TerminationRecord {
        self.session.termination_record()
    }
}

/// Drives the client session until the server shuts it down, the
/// transport closes or the client cancels.
async fn receive_loop(
    session: Session,
    tx: mpsc::UnboundedSender<Notification>,
    finished: Arc<AtomicBool>,
) {
    let cancel = session.cancel_token();
    let deliver = |notification: Notification| {
        if finished.load(Ordering::Acquire) {
            return;
        }
        if notification.is_terminal() {
            finished.store(true, Ordering::Release);
        }
        if tx.send(notification).is_err() {
            debug!("Notification receiver dropped");
        }
    };

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = session.receive() => received,
        };
        match received {
            Ok(Some(Message::OnNext(value))) => deliver(Notification::Next(value)),
            Ok(Some(Message::OnCompleted)) => {
                session.record(ShutdownReason::OBSERVABLE_TERMINATED);
                deliver(Notification::Completed);
            }
            Ok(Some(Message::OnError(error))) => {
                session.record(ShutdownReason::OBSERVABLE_TERMINATED);
                session.exceptions().add(error.clone());
                deliver(Notification::Error(ProtocolError::Stream(error)));
            }
            Ok(Some(Message::Shutdown { reason, error })) => {
                let merged = session.record(reason);
                info!("Server shut down the session: {:?}", merged);
                match error {
                    Some(error) => {
                        session.exceptions().add(error.clone());
                        deliver(Notification::Error(ProtocolError::Remote(error)));
                    }
                    None => deliver(Notification::Error(ProtocolError::Shutdown(merged))),
                }
                break;
            }
            Ok(Some(other)) => debug!("Ignoring {} message", other.kind()),
            Ok(None) => {
                deliver(Notification::Error(ProtocolError::SessionClosed));
                break;
            }
            Err(e) => {
                deliver(Notification::Error(e));
                break;
            }
        }
    }

    if cancel.is_cancelled() {
        let error = match session.exceptions().first() {
            Some(error) => ProtocolError::Remote(error),
            None => ProtocolError::Cancelled,
        };
        deliver(Notification::Error(error));
    }
    if session
        .shutdown_state()
        .reason()
        .contains(ShutdownReason::CLIENT_TERMINATED)
    {
        session
            .shutdown(ShutdownReason::CLIENT_TERMINATED, None)
            .await;
    }
    session.dispose().await;
    debug!("Client session finished: {:?}", session.termination_record().reason);
}

/// Notifications from the server, ending after the first terminal one.
///
/// Dropping the stream before then terminates the session.
pub struct NotificationStream {
    inner: UnboundedReceiverStream<Notification>,
    session: Session,
    finished: Arc<AtomicBool>,
}

impl NotificationStream {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Stream for NotificationStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            debug!("Notification stream dropped early");
            self.session.record(ShutdownReason::CLIENT_TERMINATED);
            self.session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::protocol::handshake;
    use crate::protocol::transport::memory_pair;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    /// A scripted server: handshake, read the request, reply with `replies`.
    async fn scripted_server(
        transport: Arc<dyn MessageTransport>,
        replies: Vec<Message>,
    ) -> Vec<Message> {
        handshake::negotiate_server(transport.as_ref()).await.unwrap();
        let mut received = vec![];
        while let Some(message) = transport.receive().await.unwrap() {
            let subscribed = matches!(message, Message::Subscribe(_));
            received.push(message);
            if subscribed {
                break;
            }
        }
        for reply in replies {
            transport.send(&reply).await.unwrap();
        }
        received
    }

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            client_id: "client-1".to_string(),
            ..ProtocolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_values_then_completion() {
        let (a, b) = memory_pair(1 << 20);
        let server = tokio::spawn(scripted_server(
            Arc::new(b),
            vec![
                Message::OnNext(Value::Int(1)),
                Message::OnNext(Value::Int(2)),
                Message::OnNext(Value::Int(3)),
                Message::OnCompleted,
                Message::Shutdown {
                    reason: ShutdownReason::OBSERVABLE_TERMINATED,
                    error: None,
                },
            ],
        ));
        let client = ClientProtocol::new(Arc::new(a), config()).unwrap();
        let notifications: Vec<_> = client
            .execute(&build::int(0), Some(Value::Int(5)))
            .await
            .unwrap()
            .collect()
            .await;

        let received = server.await.unwrap();
        assert!(matches!(received[0], Message::Argument(Value::Int(5))));
        assert!(matches!(received[1], Message::Subscribe(_)));
        assert_eq!(notifications.len(), 4);
        assert!(matches!(notifications[2], Notification::Next(Value::Int(3))));
        assert!(matches!(notifications[3], Notification::Completed));
    }

    #[tokio::test]
    async fn test_second_execute_is_rejected() {
        let (a, b) = memory_pair(1 << 20);
        tokio::spawn(scripted_server(Arc::new(b), vec![Message::OnCompleted]));
        let client = ClientProtocol::new(Arc::new(a), config()).unwrap();
        let _stream = client.execute(&build::int(0), None).await.unwrap();
        assert!(matches!(
            client.execute(&build::int(0), None).await,
            Err(ProtocolError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_data_surfaces_reason() {
        let (a, b) = memory_pair(1 << 20);
        tokio::spawn(scripted_server(
            Arc::new(b),
            vec![Message::Shutdown {
                reason: ShutdownReason::BAD_CLIENT_REQUEST,
                error: None,
            }],
        ));
        let client = ClientProtocol::new(Arc::new(a), config()).unwrap();
        let mut stream = client.execute(&build::int(0), None).await.unwrap();
        match stream.next().await {
            Some(Notification::Error(ProtocolError::Shutdown(reason))) => {
                assert_eq!(reason, ShutdownReason::BAD_CLIENT_REQUEST)
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }
}
