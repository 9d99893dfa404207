//! # Duplex Callbacks
//!
//! Lets the side that owns a value (usually the client) expose it to the
//! other side by reference. Three patterns are supported, each with its own
//! id space:
//!
//! - **Invoke**: one call with arguments, one value or error back. The
//!   registration lives for the whole session and may be called repeatedly.
//! - **Enumerable**: `GetEnumerator` opens an independent handle; `MoveNext`,
//!   `Reset` and `DisposeEnumerator` address that handle. Exhaustion or
//!   disposal removes only that handle.
//! - **Observable**: every `DuplexSubscribe` starts its own subscription, so
//!   one callback can feed several subscribers. Notifications are pushed
//!   tagged with the subscription's id.
//!
//! Every request that expects a reply is registered under its
//! [`DuplexCallbackId`] before it is sent, and the reply removes the entry
//! exactly once. A reply for an id that is no longer registered is dropped.
//!
//! Failures while fulfilling a request travel as dedicated error-response
//! messages. Callers see [`DuplexError::CallFailed`] for a failed call and
//! [`DuplexError::Remote`] for an error pushed by a running stream.

use thiserror::Error;

use crate::error::RemoteError;
use crate::value::HostValue;

pub mod client;
pub mod id;
pub mod registry;
pub mod sink;

pub use client::{DuplexClient, RemoteEnumerator, RemoteSubscription};
pub use id::{DuplexCallbackId, DuplexKind, DuplexRef, IdAllocator};
pub use registry::{CallerRegistry, OwnerRegistry};
pub use sink::DuplexSink;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DuplexError {
    #[error("Duplex call failed: {0}")]
    CallFailed(RemoteError),
    #[error("Remote stream faulted: {0}")]
    Remote(RemoteError),
    #[error("Duplex request cancelled")]
    Cancelled,
    #[error("Duplex request {0} timed out")]
    Timeout(DuplexCallbackId),
    #[error("No {kind} callback registered under id {id}")]
    UnknownCallback { kind: DuplexKind, id: u64 },
    #[error("Value of type {0} has no duplex representation")]
    NotRegistrable(String),
    #[error("Duplex sink is not initialized")]
    NotInitialized,
    #[error("Failed to send duplex message: {0}")]
    Send(String),
}

pub type DuplexResult<T> = Result<T, DuplexError>;

impl DuplexError {
    /// The error as carried by an error-response message.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            DuplexError::CallFailed(e) | DuplexError::Remote(e) => e.clone(),
            other => RemoteError::from_error(crate::error::RemoteErrorKind::CallFailed, other),
        }
    }
}

/// Turns host-only values into references the remote side can call back.
#[mockall::automock]
pub trait CallbackRegistrar: Send + Sync {
    fn register(&self, value: &HostValue) -> DuplexResult<DuplexRef>;
}
