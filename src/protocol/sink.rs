use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::message::{Message, ProtocolMessage};
use super::session::SessionInner;
use super::shutdown::{ExceptionCollector, ShutdownReason};
use super::{ProtocolError, ProtocolResult, ProtocolRole};
use crate::config::ProtocolConfig;
use crate::error::RemoteError;

/// Middleware offered every message a session sends or receives.
///
/// Sinks run in registration order. Marking a message handled stops the
/// pipeline for that message.
#[mockall::automock]
#[async_trait]
pub trait ProtocolSink: Send + Sync {
    fn name(&self) -> String;

    /// Called once, after the handshake and before any plan traffic.
    async fn initialize(&self, context: SinkContext) -> ProtocolResult<()>;

    async fn on_send(&self, message: &mut ProtocolMessage) -> ProtocolResult<()>;

    async fn on_receive(&self, message: &mut ProtocolMessage) -> ProtocolResult<()>;

    /// Called once when the session is disposed.
    async fn dispose(&self);
}

/// Session facilities handed to sinks at initialization.
#[derive(Clone)]
pub struct SinkContext {
    pub role: ProtocolRole,
    pub session_id: String,
    pub config: Arc<ProtocolConfig>,
    pub sender: MessageSender,
    pub cancel: CancellationToken,
    pub exceptions: Arc<ExceptionCollector>,
}

impl SinkContext {
    /// Records a failure that escalates to cancelling the whole session.
    pub fn fail_session(&self, error: RemoteError) {
        self.exceptions.add(error);
        self.sender.record(ShutdownReason::SERVER_ERROR);
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkContext")
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Sends through the owning session's pipeline without keeping it alive.
#[derive(Clone)]
pub struct MessageSender {
    session: Weak<SessionInner>,
}

impl MessageSender {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }

    pub async fn send(&self, message: Message) -> ProtocolResult<()> {
        let session = self.session.upgrade().ok_or(ProtocolError::SessionClosed)?;
        session.send(message).await
    }

    pub fn record(&self, reason: ShutdownReason) {
        if let Some(session) = self.session.upgrade() {
            session.shutdown_state().record(reason);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session.upgrade().is_none()
    }
}
