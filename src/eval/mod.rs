//! # Plan visitors
//!
//! - [`local::LocalEvaluationVisitor`] runs on the client before a plan is
//!   sent. It swaps host-only values for duplex references and compiler
//!   generated types for the property-bag substitute.
//! - [`security::SecurityVisitor`] runs on the server before a plan is
//!   built and rejects disallowed node kinds, types and members.
//! - [`interpreter::Interpreter`] evaluates an accepted plan into a value,
//!   usually a stream the server then pumps to the client.
//!
//! [`known_types::KnownTypeRegistry`] is shared by all three.

use thiserror::Error;

use crate::ast::PlanError;
use crate::duplex::DuplexError;
use crate::error::{RemoteError, RemoteErrorKind};

pub mod interpreter;
pub mod known_types;
pub mod local;
pub mod security;

pub use interpreter::{Interpreter, OperatorContext};
pub use known_types::KnownTypeRegistry;
pub use local::{HostBindings, HostMember, LocalEvaluationVisitor};
pub use security::{Capability, SecurityOptions, SecurityViolation, SecurityVisitor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unbound parameter: {0}")]
    UnboundParameter(String),
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("Invalid operand for {op}: {value}")]
    InvalidOperand { op: String, value: String },
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Division by zero")]
    DivideByZero,
    #[error("Index {index} out of range for length {length}")]
    IndexOutOfRange { index: i64, length: usize },
    #[error("Missing member: {0}")]
    MissingMember(String),
    #[error("{0}")]
    Thrown(RemoteError),
    #[error("Duplex error: {0}")]
    Duplex(#[from] DuplexError),
    #[error("Failed to register callback: {0}")]
    Registration(String),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Jump to a label outside the current lambda")]
    InvalidJump,
    #[error("Value of type {0} cannot be sent by value")]
    Unrepresentable(String),
    #[error("Evaluation cancelled")]
    Cancelled,
}

pub type EvalResult<T> = Result<T, EvalError>;

impl EvalError {
    pub fn mismatch<E: Into<String>, F: Into<String>>(expected: E, found: F) -> Self {
        EvalError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// The error as seen by the peer. User throws keep their own payload.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            EvalError::Thrown(error) => error.clone(),
            EvalError::Duplex(e) => e.to_remote(),
            EvalError::Cancelled => RemoteError::from_error(RemoteErrorKind::Cancelled, self),
            other => RemoteError::from_error(RemoteErrorKind::Stream, other),
        }
    }
}
