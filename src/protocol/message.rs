//! Protocol messages.
//!
//! Each [`Message`] variant corresponds to one [`MessageKind`] whose numeric
//! tag is stable on the wire. [`ProtocolMessage`] is the envelope passed
//! through the sink pipeline; a sink that consumes a message marks it
//! handled so no later sink (and not the session itself) sees it.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};

use super::shutdown::ShutdownReason;
use crate::ast::WirePlan;
use crate::duplex::DuplexCallbackId;
use crate::error::RemoteError;
use crate::value::Value;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MessageKind {
    Unknown = 0,
    OnNext = 1,
    OnCompleted = 2,
    OnError = 3,
    Shutdown = 4,
    Argument = 5,
    Subscribe = 6,
    DuplexInvoke = 7,
    DuplexSubscribe = 8,
    DuplexDisposeSubscription = 9,
    DuplexGetEnumerator = 10,
    DuplexGetEnumeratorResponse = 11,
    DuplexGetEnumeratorErrorResponse = 12,
    DuplexMoveNext = 13,
    DuplexResetEnumerator = 14,
    DuplexDisposeEnumerator = 15,
    DuplexEnumeratorResponse = 16,
    DuplexEnumeratorErrorResponse = 17,
    DuplexResponse = 18,
    DuplexErrorResponse = 19,
    DuplexSubscribeResponse = 20,
    DuplexOnNext = 21,
    DuplexOnCompleted = 22,
    DuplexOnError = 23,
}

impl MessageKind {
    pub fn is_duplex(&self) -> bool {
        *self as u8 >= MessageKind::DuplexInvoke as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Message {
    Unknown,
    OnNext(Value),
    OnCompleted,
    OnError(RemoteError),
    Shutdown {
        reason: ShutdownReason,
        error: Option<RemoteError>,
    },
    Argument(Value),
    Subscribe(WirePlan),
    DuplexInvoke {
        id: DuplexCallbackId,
        arguments: Vec<Value>,
    },
    DuplexSubscribe {
        id: DuplexCallbackId,
    },
    DuplexDisposeSubscription {
        id: DuplexCallbackId,
    },
    DuplexGetEnumerator {
        id: DuplexCallbackId,
    },
    DuplexGetEnumeratorResponse {
        id: DuplexCallbackId,
        enumerator_id: u64,
    },
    DuplexGetEnumeratorErrorResponse {
        id: DuplexCallbackId,
        error: RemoteError,
    },
    DuplexMoveNext {
        id: DuplexCallbackId,
    },
    DuplexResetEnumerator {
        id: DuplexCallbackId,
    },
    DuplexDisposeEnumerator {
        id: DuplexCallbackId,
    },
    /// `current` is `None` once the enumeration is exhausted, and for the
    /// acknowledgement of a reset.
    DuplexEnumeratorResponse {
        id: DuplexCallbackId,
        current: Option<Value>,
    },
    DuplexEnumeratorErrorResponse {
        id: DuplexCallbackId,
        error: RemoteError,
    },
    DuplexResponse {
        id: DuplexCallbackId,
        value: Value,
    },
    DuplexErrorResponse {
        id: DuplexCallbackId,
        error: RemoteError,
    },
    DuplexSubscribeResponse {
        id: DuplexCallbackId,
    },
    DuplexOnNext {
        id: DuplexCallbackId,
        value: Value,
    },
    DuplexOnCompleted {
        id: DuplexCallbackId,
    },
    DuplexOnError {
        id: DuplexCallbackId,
        error: RemoteError,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Unknown => MessageKind::Unknown,
            Message::OnNext(_) => MessageKind::OnNext,
            Message::OnCompleted => MessageKind::OnCompleted,
            Message::OnError(_) => MessageKind::OnError,
            Message::Shutdown { .. } => MessageKind::Shutdown,
            Message::Argument(_) => MessageKind::Argument,
            Message::Subscribe(_) => MessageKind::Subscribe,
            Message::DuplexInvoke { .. } => MessageKind::DuplexInvoke,
            Message::DuplexSubscribe { .. } => MessageKind::DuplexSubscribe,
            Message::DuplexDisposeSubscription { .. } => MessageKind::DuplexDisposeSubscription,
            Message::DuplexGetEnumerator { .. } => MessageKind::DuplexGetEnumerator,
            Message::DuplexGetEnumeratorResponse { .. } => MessageKind::DuplexGetEnumeratorResponse,
            Message::DuplexGetEnumeratorErrorResponse { .. } => {
                MessageKind::DuplexGetEnumeratorErrorResponse
            }
            Message::DuplexMoveNext { .. } => MessageKind::DuplexMoveNext,
            Message::DuplexResetEnumerator { .. } => MessageKind::DuplexResetEnumerator,
            Message::DuplexDisposeEnumerator { .. } => MessageKind::DuplexDisposeEnumerator,
            Message::DuplexEnumeratorResponse { .. } => MessageKind::DuplexEnumeratorResponse,
            Message::DuplexEnumeratorErrorResponse { .. } => {
                MessageKind::DuplexEnumeratorErrorResponse
            }
            Message::DuplexResponse { .. } => MessageKind::DuplexResponse,
            Message::DuplexErrorResponse { .. } => MessageKind::DuplexErrorResponse,
            Message::DuplexSubscribeResponse { .. } => MessageKind::DuplexSubscribeResponse,
            Message::DuplexOnNext { .. } => MessageKind::DuplexOnNext,
            Message::DuplexOnCompleted { .. } => MessageKind::DuplexOnCompleted,
            Message::DuplexOnError { .. } => MessageKind::DuplexOnError,
        }
    }

    pub fn duplex_id(&self) -> Option<DuplexCallbackId> {
        match self {
            Message::DuplexInvoke { id, .. }
            | Message::DuplexSubscribe { id }
            | Message::DuplexDisposeSubscription { id }
            | Message::DuplexGetEnumerator { id }
            | Message::DuplexGetEnumeratorResponse { id, .. }
            | Message::DuplexGetEnumeratorErrorResponse { id, .. }
            | Message::DuplexMoveNext { id }
            | Message::DuplexResetEnumerator { id }
            | Message::DuplexDisposeEnumerator { id }
            | Message::DuplexEnumeratorResponse { id, .. }
            | Message::DuplexEnumeratorErrorResponse { id, .. }
            | Message::DuplexResponse { id, .. }
            | Message::DuplexErrorResponse { id, .. }
            | Message::DuplexSubscribeResponse { id }
            | Message::DuplexOnNext { id, .. }
            | Message::DuplexOnCompleted { id }
            | Message::DuplexOnError { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Envelope carried through the sink pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub message: Message,
    handled: bool,
}

impl ProtocolMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            handled: false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn mark_handled(&mut self) {
        self.handled = true;
    }
}

/// What the client observes for one session.
#[derive(Debug)]
pub enum Notification {
    Next(Value),
    Error(super::ProtocolError),
    Completed,
}

impl Notification {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Next(_))
    }
}
