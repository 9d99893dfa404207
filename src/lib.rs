//! # qlink
//!
//! A remote query protocol. A client composes a query plan locally, ships
//! it to a server over a framed byte stream and observes the results as a
//! stream of notifications. Either side can expose callbacks the other side
//! calls back into while the query runs.
//!
//! ```text
//!  ClientProtocol                                   ServerProtocol
//!  ──────────────                                   ──────────────
//!  LocalEvaluationVisitor                           SecurityVisitor
//!        │  to_wire                                        │ from_wire
//!        ▼                                                 ▼
//!  Session ══ handshake ══ Argument ══ Subscribe ══▶ Session ─▶ QueryProvider
//!     ▲                                                    │
//!     └════ OnNext* (OnCompleted | OnError) Shutdown ══════┘
//!            ◀═════════ duplex callbacks ═════════▶
//! ```
//!
//! - [`ast`]: the plan node model, its wire form and structural equality.
//! - [`protocol`]: sessions, framing, the sink pipeline and shutdown.
//! - [`duplex`]: callbacks owned by one side and invoked by the other.
//! - [`eval`]: client rewriting, server security checks and evaluation.
//! - [`provider`]: turns an accepted plan into a result stream.

pub mod ast;
pub mod config;
pub mod duplex;
pub mod error;
pub mod eval;
pub mod logging;
pub mod protocol;
pub mod provider;
pub mod value;

pub use config::ProtocolConfig;
pub use error::{Error, InternalResult, RemoteError, RemoteErrorKind};
pub use protocol::{
    ClientProtocol, Notification, NotificationStream, ServerProtocol, ShutdownReason,
    TerminationRecord,
};
pub use provider::{InterpreterProvider, QueryProvider};
pub use value::{HostValue, PropertyBag, Value};
