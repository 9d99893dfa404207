use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handshake::{self, NegotiationError};
use super::message::{Message, ProtocolMessage};
use super::shutdown::{ExceptionCollector, ShutdownReason, ShutdownState, TerminationRecord};
use super::sink::{MessageSender, ProtocolSink, SinkContext};
use super::transport::{MessageTransport, TransportError};
use super::{ProtocolError, ProtocolResult, ProtocolRole, ProtocolState};
use crate::config::ProtocolConfig;
use crate::error::{RemoteError, RemoteErrorKind};

pub(crate) struct SessionInner {
    role: ProtocolRole,
    config: Arc<ProtocolConfig>,
    transport: Arc<dyn MessageTransport>,
    sinks: Vec<Arc<dyn ProtocolSink>>,
    state: Mutex<ProtocolState>,
    session_id: Mutex<Option<String>>,
    cancel: CancellationToken,
    exceptions: Arc<ExceptionCollector>,
    shutdown: ShutdownState,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Mutex<Option<Duration>>,
    disposed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown
    }

    fn state(&self) -> ProtocolState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, to: ProtocolState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != to {
            info!(role = %self.role, "Session state {} -> {}", *state, to);
            *state = to;
        }
    }

    fn transport_failure(&self, error: TransportError) -> ProtocolError {
        warn!(role = %self.role, "Transport failure: {}", error);
        self.exceptions
            .add(RemoteError::from_error(RemoteErrorKind::Transport, &error));
        self.cancel.cancel();
        ProtocolError::Transport(error)
    }

    pub(crate) async fn send(&self, message: Message) -> ProtocolResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        let mut message = ProtocolMessage::new(message);
        for sink in &self.sinks {
            sink.on_send(&mut message).await?;
            if message.is_handled() {
                debug!("{} message claimed by sink {}", message.kind(), sink.name());
                return Ok(());
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled),
            result = self.transport.send(&message.message) => {
                result.map_err(|e| self.transport_failure(e))
            }
        }
    }

    async fn receive(&self) -> ProtocolResult<Option<Message>> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
                received = self.transport.receive() => received,
            };
            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.transport_failure(e)),
            };

            let mut message = ProtocolMessage::new(message);
            for sink in &self.sinks {
                sink.on_receive(&mut message).await?;
                if message.is_handled() {
                    break;
                }
            }
            if !message.is_handled() {
                return Ok(Some(message.message));
            }
        }
    }
}

/// One protocol session, shared by the protocol loop and its sinks.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        role: ProtocolRole,
        transport: Arc<dyn MessageTransport>,
        config: Arc<ProtocolConfig>,
        sinks: Vec<Arc<dyn ProtocolSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                role,
                config,
                transport,
                sinks,
                state: Mutex::new(ProtocolState::Created),
                session_id: Mutex::new(None),
                cancel: CancellationToken::new(),
                exceptions: Arc::new(ExceptionCollector::new()),
                shutdown: ShutdownState::new(),
                started_at: Utc::now(),
                started: Instant::now(),
                finished: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn role(&self) -> ProtocolRole {
        self.inner.role
    }

    pub fn state(&self) -> ProtocolState {
        self.inner.state()
    }

    pub fn config(&self) -> &Arc<ProtocolConfig> {
        &self.inner.config
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn exceptions(&self) -> &Arc<ExceptionCollector> {
        &self.inner.exceptions
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.inner.shutdown
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender::new(Arc::downgrade(&self.inner))
    }

    pub fn transition(&self, to: ProtocolState) {
        self.inner.transition(to);
    }

    pub fn expect_state(&self, expected: ProtocolState) -> ProtocolResult<()> {
        let found = self.state();
        if found != expected {
            return Err(ProtocolError::InvalidState { expected, found });
        }
        Ok(())
    }

    /// Runs the session-id handshake for this session's role.
    ///
    /// Failures are recorded as `PROTOCOL_NEGOTIATION_CANCELED` (timeout or
    /// cancellation) or `PROTOCOL_NEGOTIATION_ERROR`.
    #[instrument(skip(self), fields(role = %self.role()))]
    pub async fn negotiate(&self) -> ProtocolResult<String> {
        self.expect_state(ProtocolState::Created)?;
        self.transition(ProtocolState::Negotiating);

        let inner = &self.inner;
        let transport = inner.transport.as_ref();
        let handshake = async {
            match inner.role {
                ProtocolRole::Client => {
                    let id = if inner.config.client_id.is_empty() {
                        uuid::Uuid::new_v4().to_string()
                    } else {
                        inner.config.client_id.clone()
                    };
                    handshake::negotiate_client(transport, &id).await.map(|_| id)
                }
                ProtocolRole::Server => handshake::negotiate_server(transport).await,
            }
        };

        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => Err(None),
            result = tokio::time::timeout(inner.config.handshake_timeout, handshake) => match result {
                Ok(Ok(id)) => Ok(id),
                Ok(Err(e)) => Err(Some(e)),
                Err(_) => Err(Some(NegotiationError::Timeout)),
            },
        };

        match outcome {
            Ok(id) => {
                *inner.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.clone());
                Ok(id)
            }
            Err(None) => {
                inner
                    .shutdown
                    .record(ShutdownReason::PROTOCOL_NEGOTIATION_CANCELED);
                Err(ProtocolError::Cancelled)
            }
            Err(Some(e)) => {
                let reason = match e {
                    NegotiationError::Timeout => ShutdownReason::PROTOCOL_NEGOTIATION_CANCELED,
                    _ => ShutdownReason::PROTOCOL_NEGOTIATION_ERROR,
                };
                warn!("Negotiation failed: {}", e);
                inner.shutdown.record(reason);
                inner
                    .exceptions
                    .add(RemoteError::from_error(RemoteErrorKind::Transport, &e));
                Err(e.into())
            }
        }
    }

    pub fn context(&self) -> SinkContext {
        SinkContext {
            role: self.role(),
            session_id: self.session_id().unwrap_or_default(),
            config: self.inner.config.clone(),
            sender: self.sender(),
            cancel: self.cancel_token(),
            exceptions: self.inner.exceptions.clone(),
        }
    }

    pub async fn initialize_sinks(&self) -> ProtocolResult<()> {
        let context = self.context();
        for sink in &self.inner.sinks {
            debug!("Initializing sink {}", sink.name());
            sink.initialize(context.clone()).await?;
        }
        Ok(())
    }

    pub async fn send(&self, message: Message) -> ProtocolResult<()> {
        self.inner.send(message).await
    }

    /// Next message not claimed by a sink; `None` when the peer closed.
    pub async fn receive(&self) -> ProtocolResult<Option<Message>> {
        self.inner.receive().await
    }

    pub fn record(&self, reason: ShutdownReason) -> ShutdownReason {
        self.inner.shutdown.record(reason)
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Records `reason` and, the first time only, sends a best-effort
    /// `Shutdown` carrying the merged reason.
    pub async fn shutdown(&self, reason: ShutdownReason, error: Option<RemoteError>) {
        let merged = self.record(reason);
        if !self.inner.shutdown.begin() {
            return;
        }
        self.transition(ProtocolState::ShuttingDown);
        let message = Message::Shutdown {
            reason: merged,
            error,
        };
        // The peer may have stopped reading; bound the wait.
        let limit = self.inner.config.handshake_timeout;
        match tokio::time::timeout(limit, self.inner.transport.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Best-effort shutdown send failed: {}", e),
            Err(_) => debug!("Shutdown send timed out after {:?}", limit),
        }
    }

    /// Tears the session down once: cancels pending work, disposes sinks and
    /// closes the transport.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        for sink in &self.inner.sinks {
            sink.dispose().await;
        }
        if let Err(e) = self.inner.transport.close().await {
            debug!("Transport close failed: {}", e);
        }
        *self.inner.finished.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(self.inner.started.elapsed());
        self.transition(ProtocolState::Disposed);
    }

    pub fn termination_record(&self) -> TerminationRecord {
        let duration = self
            .inner
            .finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(|| self.inner.started.elapsed());
        TerminationRecord {
            session_id: self.session_id(),
            started_at: self.inner.started_at,
            duration,
            reason: self.inner.shutdown.reason(),
            exceptions: self.inner.exceptions.distinct(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sink::MockProtocolSink;
    use crate::protocol::transport::memory_pair;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn passthrough(name: &'static str) -> MockProtocolSink {
        let mut sink = MockProtocolSink::new();
        sink.expect_name().return_const(name.to_string());
        sink.expect_initialize().returning(|_| Ok(()));
        sink.expect_dispose().returning(|| ());
        sink
    }

    #[tokio::test]
    async fn test_handled_message_skips_later_sinks() {
        let (a, b) = memory_pair(1024);

        let mut first = passthrough("first");
        first.expect_on_receive().times(2).returning(|message| {
            if let Message::Argument(_) = message.message {
                message.mark_handled();
            }
            Ok(())
        });
        let mut second = passthrough("second");
        second
            .expect_on_receive()
            .times(1)
            .withf(|message| matches!(message.message, Message::OnCompleted))
            .returning(|_| Ok(()));

        let session = Session::new(
            ProtocolRole::Client,
            Arc::new(b),
            Arc::new(ProtocolConfig::default()),
            vec![Arc::new(first), Arc::new(second)],
        );

        a.send(&Message::Argument(Value::Int(1))).await.unwrap();
        a.send(&Message::OnCompleted).await.unwrap();
        assert_eq!(session.receive().await.unwrap(), Some(Message::OnCompleted));
    }

    #[tokio::test]
    async fn test_claimed_outbound_message_is_not_written() {
        let (a, b) = memory_pair(1024);

        let mut sink = passthrough("claim-next");
        sink.expect_on_send().returning(|message| {
            if let Message::OnNext(_) = message.message {
                message.mark_handled();
            }
            Ok(())
        });
        let session = Session::new(
            ProtocolRole::Server,
            Arc::new(a),
            Arc::new(ProtocolConfig::default()),
            vec![Arc::new(sink)],
        );

        session.send(Message::OnNext(Value::Int(1))).await.unwrap();
        session.send(Message::OnCompleted).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(Message::OnCompleted));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (a, b) = memory_pair(1024);
        let session = Session::new(
            ProtocolRole::Server,
            Arc::new(a),
            Arc::new(ProtocolConfig::default()),
            Vec::new(),
        );

        session
            .shutdown(ShutdownReason::OBSERVABLE_TERMINATED, None)
            .await;
        session
            .shutdown(ShutdownReason::SERVER_ERROR, None)
            .await;
        session.dispose().await;
        session.dispose().await;

        assert_eq!(
            b.receive().await.unwrap(),
            Some(Message::Shutdown {
                reason: ShutdownReason::OBSERVABLE_TERMINATED,
                error: None
            })
        );
        // Second shutdown only updated the recorded reason.
        assert_eq!(b.receive().await.unwrap(), None);
        let record = session.termination_record();
        assert_eq!(record.reason, ShutdownReason::SERVER_ERROR);
        assert_eq!(session.state(), ProtocolState::Disposed);
    }

    #[tokio::test]
    async fn test_negotiation_failure_is_recorded() {
        let (a, b) = memory_pair(1024);
        // The peer answers with a different id.
        let peer = tokio::spawn(async move {
            let header = b.read_raw(4).await.unwrap();
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            b.read_raw(len).await.unwrap();
            let mut reply = 5u32.to_le_bytes().to_vec();
            reply.extend_from_slice(b"other");
            b.write_raw(&reply).await.unwrap();
        });

        let config = ProtocolConfig {
            client_id: "mine".to_string(),
            ..ProtocolConfig::default()
        };
        let session = Session::new(
            ProtocolRole::Client,
            Arc::new(a),
            Arc::new(config),
            Vec::new(),
        );
        let result = session.negotiate().await;
        peer.await.unwrap();

        assert!(matches!(
            result,
            Err(ProtocolError::Negotiation(NegotiationError::Mismatch { .. }))
        ));
        assert_eq!(
            session.shutdown_state().reason(),
            ShutdownReason::PROTOCOL_NEGOTIATION_ERROR
        );
    }

    #[tokio::test]
    async fn test_negotiation_timeout_is_cancellation() {
        let (a, _b) = memory_pair(1024);
        let config = ProtocolConfig {
            handshake_timeout: Duration::from_millis(20),
            ..ProtocolConfig::default()
        };
        let session = Session::new(
            ProtocolRole::Server,
            Arc::new(a),
            Arc::new(config),
            Vec::new(),
        );
        assert!(session.negotiate().await.is_err());
        assert_eq!(
            session.shutdown_state().reason(),
            ShutdownReason::PROTOCOL_NEGOTIATION_CANCELED
        );
    }
}
