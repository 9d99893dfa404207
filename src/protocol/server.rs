use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use super::message::Message;
use super::session::Session;
use super::shutdown::{ShutdownReason, TerminationRecord};
use super::sink::ProtocolSink;
use super::transport::MessageTransport;
use super::{ProtocolResult, ProtocolRole, ProtocolState};
use crate::ast::{WirePlan, from_wire_with_limits};
use crate::config::{ConfigResult, ProtocolConfig};
use crate::duplex::DuplexSink;
use crate::error::{InternalResult, RemoteError, RemoteErrorKind};
use crate::eval::{KnownTypeRegistry, SecurityVisitor};
use crate::provider::{PipelineContext, QueryProvider};
use crate::value::{Value, ValueStream};

/// Why a session ended before its pipeline ran.
struct Rejection {
    reason: ShutdownReason,
    error: RemoteError,
    /// Whether the client may see the error as a stream fault.
    relay: bool,
}

impl Rejection {
    fn new(reason: ShutdownReason, error: RemoteError) -> Self {
        Self {
            reason,
            error,
            relay: false,
        }
    }

    fn relayed(mut self) -> Self {
        self.relay = true;
        self
    }
}

/// Server end of a session: accepts one plan and pumps its results.
pub struct ServerProtocol {
    transport: Arc<dyn MessageTransport>,
    config: Arc<ProtocolConfig>,
    sinks: Vec<Arc<dyn ProtocolSink>>,
    duplex: Option<Arc<DuplexSink>>,
    known_types: Arc<KnownTypeRegistry>,
    session: Session,
}

impl ServerProtocol {
    pub fn new(transport: Arc<dyn MessageTransport>, config: ProtocolConfig) -> ConfigResult<Self> {
        config.validate()?;
        let known_types = Arc::new(KnownTypeRegistry::from_config(&config.known_types)?);
        let duplex = config.enable_duplex.then(|| Arc::new(DuplexSink::new()));
        let config = Arc::new(config);
        let mut server = Self {
            session: Session::new(ProtocolRole::Server, transport.clone(), config.clone(), vec![]),
            transport,
            config,
            sinks: vec![],
            duplex,
            known_types,
        };
        server.rebuild_session();
        Ok(server)
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProtocolSink>) -> Self {
        self.sinks.push(sink);
        self.rebuild_session();
        self
    }

    pub fn with_known_types(mut self, known_types: KnownTypeRegistry) -> Self {
        self.known_types = Arc::new(known_types);
        self
    }

    fn rebuild_session(&mut self) {
        let mut sinks = self.sinks.clone();
        if let Some(duplex) = &self.duplex {
            sinks.push(duplex.clone());
        }
        self.session = Session::new(
            ProtocolRole::Server,
            self.transport.clone(),
            self.config.clone(),
            sinks,
        );
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Builds a server for `transport` and runs one session on it.
    pub async fn serve(
        transport: Arc<dyn MessageTransport>,
        config: ProtocolConfig,
        provider: &dyn QueryProvider,
    ) -> InternalResult<TerminationRecord> {
        let server = Self::new(transport, config)?;
        Ok(server.execute(provider).await?)
    }

    pub fn cancel(&self) {
        self.session.record(ShutdownReason::SERVER_ERROR);
        self.session.cancel();
    }

    /// Runs the session to its end and returns how it ended. Failures
    /// caused by the client or the plan are part of the record, not errors;
    /// only misuse of the protocol object itself is an `Err`.
    #[instrument(skip_all, fields(role = "server"))]
    pub async fn execute(&self, provider: &dyn QueryProvider) -> ProtocolResult<TerminationRecord> {
        let session = &self.session;
        session.expect_state(ProtocolState::Created)?;

        if let Err(e) = session.negotiate().await {
            warn!("Negotiation failed: {}", e);
            session.dispose().await;
            return Ok(session.termination_record());
        }
        if let Err(e) = session.initialize_sinks().await {
            let error = RemoteError::from_error(RemoteErrorKind::Server, &e);
            self.reject(Rejection::new(ShutdownReason::SERVER_ERROR, error))
                .await;
            return Ok(session.termination_record());
        }

        let (plan, argument) = match self.accept().await {
            Ok(request) => request,
            Err(rejection) => {
                self.reject(rejection).await;
                return Ok(session.termination_record());
            }
        };

        session.transition(ProtocolState::Executing);
        let completed = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch_client(session.clone(), completed.clone()));

        let duplex = self.duplex.as_ref().and_then(|d| d.client().ok());
        let cancel = session.cancel_token();
        let context = PipelineContext::new(duplex, cancel.clone());
        let created = tokio::select! {
            _ = cancel.cancelled() => None,
            created = provider.create_pipeline(plan, argument, context) => Some(created),
        };
        match created {
            None => debug!("Cancelled while building the pipeline"),
            Some(Err(e)) if cancel.is_cancelled() => {
                debug!("Pipeline creation ended by cancellation: {}", e)
            }
            Some(Ok(pipeline)) => self.pump(pipeline).await,
            Some(Err(e)) => {
                let error = RemoteError::from_error(RemoteErrorKind::Subscription, &e);
                self.reject(
                    Rejection::new(ShutdownReason::EXPRESSION_SUBSCRIPTION_EXCEPTION, error)
                        .relayed(),
                )
                .await;
            }
        }

        completed.store(true, Ordering::Release);
        watcher.abort();
        session
            .shutdown(session.shutdown_state().reason(), None)
            .await;
        session.dispose().await;
        let record = session.termination_record();
        info!(
            "Session {:?} ended: {:?} after {:?}",
            record.session_id, record.reason, record.duration
        );
        Ok(record)
    }

    /// Reads the optional argument and the subscription, then deserializes
    /// and checks the plan.
    async fn accept(&self) -> Result<(crate::ast::Node, Option<Value>), Rejection> {
        let (wire, argument) = self.read_request().await?;
        let plan = from_wire_with_limits(&wire, &self.config.plan_limits()).map_err(|e| {
            warn!("Rejected plan: {}", e);
            Rejection::new(
                ShutdownReason::BAD_CLIENT_REQUEST,
                RemoteError::from_error(RemoteErrorKind::Server, &e),
            )
        })?;
        SecurityVisitor::new(self.config.security.clone(), self.known_types.clone())
            .check(&plan)
            .map_err(|violation| {
                warn!("Rejected plan: {}", violation);
                Rejection::new(
                    ShutdownReason::EXPRESSION_SECURITY_VIOLATION,
                    RemoteError::from_error(RemoteErrorKind::SecurityViolation, &violation),
                )
                .relayed()
            })?;
        Ok((plan, argument))
    }

    async fn read_request(&self) -> Result<(WirePlan, Option<Value>), Rejection> {
        let session = &self.session;
        let cancel = session.cancel_token();
        let mut argument = None;
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Rejection::new(
                        ShutdownReason::SERVER_ERROR,
                        RemoteError::new(RemoteErrorKind::Cancelled, "Session cancelled"),
                    ));
                }
                received = session.receive() => received,
            };
            match received {
                Ok(Some(Message::Argument(value))) if argument.is_none() => {
                    debug!("Received argument");
                    argument = Some(value);
                }
                Ok(Some(Message::Subscribe(plan))) => return Ok((plan, argument)),
                Ok(Some(other)) => {
                    return Err(Rejection::new(
                        ShutdownReason::BAD_CLIENT_REQUEST,
                        RemoteError::new(
                            RemoteErrorKind::Server,
                            format!("Unexpected {} message before subscription", other.kind()),
                        ),
                    ));
                }
                Ok(None) => {
                    return Err(Rejection::new(
                        ShutdownReason::CLIENT_TERMINATED,
                        RemoteError::new(RemoteErrorKind::Transport, "Client closed before subscribing"),
                    ));
                }
                Err(e) => {
                    return Err(Rejection::new(
                        ShutdownReason::SERVER_ERROR,
                        RemoteError::from_error(RemoteErrorKind::Transport, &e),
                    ));
                }
            }
        }
    }

    /// Records the rejection, relays it when allowed, shuts down and
    /// disposes.
    async fn reject(&self, rejection: Rejection) {
        let session = &self.session;
        session.record(rejection.reason);
        session.exceptions().add(rejection.error.clone());
        if rejection.relay && self.config.send_errors_to_client {
            let relayed = Message::OnError(rejection.error.strip_detail());
            if let Err(e) = session.send(relayed).await {
                debug!("Error relay failed: {}", e);
            }
        }
        session.shutdown(rejection.reason, None).await;
        session.dispose().await;
    }

    async fn pump(&self, mut pipeline: ValueStream) {
        let session = &self.session;
        let cancel = session.cancel_token();
        let mut sent = 0usize;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Pipeline cancelled after {} values", sent);
                    break;
                }
                item = pipeline.next() => item,
            };
            match item {
                Some(Ok(value)) => {
                    if let Err(e) = session.send(Message::OnNext(value)).await {
                        debug!("Stopping pipeline: {}", e);
                        break;
                    }
                    sent += 1;
                }
                Some(Err(error)) => {
                    warn!("Pipeline faulted: {}", error);
                    session.record(ShutdownReason::OBSERVABLE_TERMINATED);
                    session.exceptions().add(error.clone());
                    if self.config.send_errors_to_client {
                        if let Err(e) = session.send(Message::OnError(error.strip_detail())).await {
                            debug!("Error relay failed: {}", e);
                        }
                    }
                    break;
                }
                None => {
                    session.record(ShutdownReason::OBSERVABLE_TERMINATED);
                    if let Err(e) = session.send(Message::OnCompleted).await {
                        debug!("Completion not sent: {}", e);
                    }
                    debug!("Pipeline completed after {} values", sent);
                    break;
                }
            }
        }
    }
}

/// Watches for the client going away while the pipeline runs. Also keeps
/// inbound duplex traffic flowing through the sinks.
async fn watch_client(session: Session, completed: Arc<AtomicBool>) {
    loop {
        match session.receive().await {
            Ok(Some(Message::Shutdown { reason, .. })) => {
                info!("Client shut down the session: {:?}", reason);
                session.record(ShutdownReason::CLIENT_TERMINATED);
                session.cancel();
                return;
            }
            Ok(Some(other)) => debug!("Ignoring {} message", other.kind()),
            Ok(None) => {
                if !completed.load(Ordering::Acquire) {
                    session.record(ShutdownReason::CLIENT_TERMINATED);
                    session.cancel();
                }
                return;
            }
            Err(e) => {
                debug!("Client watch ended: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{TypeDesc, build, to_wire};
    use crate::protocol::handshake;
    use crate::protocol::transport::memory_pair;
    use crate::provider::{InterpreterProvider, ProviderError, provider::MockQueryProvider};
    use futures::stream;
    use pretty_assertions::assert_eq;

    async fn scripted_client(
        transport: Arc<dyn MessageTransport>,
        request: Vec<Message>,
    ) -> Vec<Message> {
        handshake::negotiate_client(transport.as_ref(), "client-1")
            .await
            .unwrap();
        for message in request {
            transport.send(&message).await.unwrap();
        }
        let mut received = vec![];
        while let Ok(Some(message)) = transport.receive().await {
            let done = matches!(message, Message::Shutdown { .. });
            received.push(message);
            if done {
                break;
            }
        }
        received
    }

    fn server(transport: Arc<dyn MessageTransport>) -> ServerProtocol {
        ServerProtocol::new(transport, ProtocolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_scalar_plan_runs_to_completion() {
        let (a, b) = memory_pair(1 << 20);
        let wire = to_wire(&build::add(build::int(40), build::int(2))).unwrap();
        let client = tokio::spawn(scripted_client(Arc::new(a), vec![Message::Subscribe(wire)]));

        let record = server(Arc::new(b))
            .execute(&InterpreterProvider::default())
            .await
            .unwrap();
        let received = client.await.unwrap();

        assert_eq!(record.session_id.as_deref(), Some("client-1"));
        assert_eq!(record.reason, ShutdownReason::OBSERVABLE_TERMINATED);
        assert!(matches!(received[0], Message::OnNext(Value::Int(42))));
        assert!(matches!(received[1], Message::OnCompleted));
        assert!(matches!(
            received[2],
            Message::Shutdown { reason, .. } if reason == ShutdownReason::OBSERVABLE_TERMINATED
        ));
    }

    #[tokio::test]
    async fn test_unexpected_first_message_is_bad_request() {
        let (a, b) = memory_pair(1 << 20);
        let client = tokio::spawn(scripted_client(Arc::new(a), vec![Message::OnCompleted]));
        let record = server(Arc::new(b))
            .execute(&MockQueryProvider::new())
            .await
            .unwrap();
        let received = client.await.unwrap();
        assert_eq!(record.reason, ShutdownReason::BAD_CLIENT_REQUEST);
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_fault_is_relayed_and_recorded() {
        let (a, b) = memory_pair(1 << 20);
        let wire = to_wire(&build::null(TypeDesc::object())).unwrap();
        let client = tokio::spawn(scripted_client(Arc::new(a), vec![Message::Subscribe(wire)]));

        let mut provider = MockQueryProvider::new();
        provider.expect_create_pipeline().returning(|_, _, _| {
            Ok(stream::iter(vec![
                Ok(Value::Int(1)),
                Err(RemoteError::new(RemoteErrorKind::Stream, "source failed").with_detail("trace")),
            ])
            .boxed())
        });
        let record = server(Arc::new(b)).execute(&provider).await.unwrap();
        let received = client.await.unwrap();

        assert_eq!(record.reason, ShutdownReason::OBSERVABLE_TERMINATED);
        assert_eq!(record.exceptions.len(), 1);
        match &received[1] {
            Message::OnError(error) => {
                assert_eq!(error.message, "source failed");
                assert_eq!(error.detail, None);
            }
            other => panic!("expected OnError, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_subscription_failure() {
        let (a, b) = memory_pair(1 << 20);
        let wire = to_wire(&build::int(1)).unwrap();
        let client = tokio::spawn(scripted_client(Arc::new(a), vec![Message::Subscribe(wire)]));

        let mut provider = MockQueryProvider::new();
        provider
            .expect_create_pipeline()
            .returning(|_, _, _| Err(ProviderError::UnsupportedPlan("Int".to_string())));
        let record = server(Arc::new(b)).execute(&provider).await.unwrap();
        let received = client.await.unwrap();

        assert_eq!(record.reason, ShutdownReason::EXPRESSION_SUBSCRIPTION_EXCEPTION);
        assert!(matches!(received[0], Message::OnError(_)));
    }

    #[tokio::test]
    async fn test_plan_over_depth_limit_is_bad_request() {
        let (a, b) = memory_pair(1 << 20);
        let mut plan = build::int(0);
        for i in 1..8 {
            plan = build::add(plan, build::int(i));
        }
        let wire = to_wire(&plan).unwrap();
        let client = tokio::spawn(scripted_client(Arc::new(a), vec![Message::Subscribe(wire)]));

        let config = ProtocolConfig {
            max_plan_depth: 4,
            ..ProtocolConfig::default()
        };
        let record = ServerProtocol::new(Arc::new(b), config)
            .unwrap()
            .execute(&MockQueryProvider::new())
            .await
            .unwrap();
        let received = client.await.unwrap();

        assert_eq!(record.reason, ShutdownReason::BAD_CLIENT_REQUEST);
        assert_eq!(record.exceptions.len(), 1);
        assert!(record.exceptions[0].message.contains("depth limit of 4"));
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_client_leaving_stops_endless_evaluation() {
        let (a, b) = memory_pair(1 << 20);
        let client = Arc::new(a);
        handshake_then_subscribe(client.clone(), build::loop_with(build::int(0), None, None));
        let server = tokio::spawn(async move {
            server(Arc::new(b))
                .execute(&InterpreterProvider::default())
                .await
                .unwrap()
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        client.close().await.unwrap();

        let record = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server kept evaluating after the client left")
            .unwrap();
        assert!(record.reason.contains(ShutdownReason::CLIENT_TERMINATED));
    }

    fn handshake_then_subscribe(transport: Arc<dyn MessageTransport>, plan: crate::ast::Node) {
        let wire = to_wire(&plan).unwrap();
        tokio::spawn(async move {
            handshake::negotiate_client(transport.as_ref(), "client-1")
                .await
                .unwrap();
            transport.send(&Message::Subscribe(wire)).await.unwrap();
        });
    }
}
