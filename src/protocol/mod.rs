//! # Protocol Core
//!
//! A session moves through a fixed set of states:
//!
//! ```text
//! Created ──▶ Negotiating ──▶ Executing ──▶ ShuttingDown ──▶ Disposed
//!                  │                              ▲
//!                  └──────── (handshake fails) ───┘
//! ```
//!
//! [`Session`] owns what both ends share: the transport, the ordered sink
//! pipeline, the cancellation token, the shutdown reason and the exception
//! collector. [`ClientProtocol`] and [`ServerProtocol`] drive a session
//! through its states.
//!
//! ## Sink pipeline
//!
//! Every outbound and inbound message is wrapped in a [`ProtocolMessage`]
//! and offered to each [`ProtocolSink`] in order. A sink may rewrite the
//! message or claim it by marking it handled; a handled message is not seen
//! by later sinks, is not written to the transport (outbound) and is not
//! returned to the protocol loop (inbound). The duplex subsystem is one such
//! sink.
//!
//! ## Shutdown
//!
//! Shutdown is idempotent. The reason is recorded before a `Shutdown`
//! message is attempted, and that send is best effort: its failure is
//! logged and never replaces the original cause.

use strum::Display;
use thiserror::Error;

use crate::ast::PlanError;
use crate::duplex::DuplexError;
use crate::error::RemoteError;
use crate::eval::EvalError;
use crate::eval::security::SecurityViolation;

pub mod client;
pub mod codec;
pub mod handshake;
pub mod message;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod transport;

pub use client::{ClientProtocol, NotificationStream};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use handshake::NegotiationError;
pub use message::{Message, MessageKind, Notification, ProtocolMessage};
pub use server::ServerProtocol;
pub use session::Session;
pub use shutdown::{ExceptionCollector, ShutdownReason, ShutdownState, TerminationRecord};
pub use sink::{MessageSender, ProtocolSink, SinkContext};
pub use transport::{MessageTransport, StreamTransport, TransportError, memory_pair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ProtocolState {
    Created,
    Negotiating,
    Executing,
    ShuttingDown,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ProtocolRole {
    Client,
    Server,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Security violation: {0}")]
    Security(#[from] SecurityViolation),
    #[error("Subscription failed: {0}")]
    Subscription(RemoteError),
    #[error("Stream faulted: {0}")]
    Stream(RemoteError),
    #[error("Session shut down by peer: {0:?}")]
    Shutdown(ShutdownReason),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Duplex error: {0}")]
    Duplex(#[from] DuplexError),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Local evaluation failed: {0}")]
    Eval(#[from] EvalError),
    #[error("Unexpected {0} message")]
    UnexpectedMessage(MessageKind),
    #[error("Operation requires state {expected}, session is {found}")]
    InvalidState {
        expected: ProtocolState,
        found: ProtocolState,
    },
    #[error("Session closed")]
    SessionClosed,
    #[error("Session cancelled")]
    Cancelled,
    #[error("Remote error: {0}")]
    Remote(RemoteError),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ProtocolError::Internal(message.into())
    }
}
