//! Shutdown bookkeeping shared by both ends of a session.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::config::duration_ms;
use crate::error::RemoteError;

bitflags! {
    /// Why a session ended. Flags combine; see [`ShutdownReason::merge`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShutdownReason: u32 {
        const PROTOCOL_NEGOTIATION_CANCELED     = 0b0000_0001;
        const PROTOCOL_NEGOTIATION_ERROR        = 0b0000_0010;
        /// The pipeline ran to an end (completed or faulted while running).
        const OBSERVABLE_TERMINATED             = 0b0000_0100;
        const CLIENT_TERMINATED                 = 0b0000_1000;
        const BAD_CLIENT_REQUEST                = 0b0001_0000;
        const EXPRESSION_SECURITY_VIOLATION     = 0b0010_0000;
        const EXPRESSION_SUBSCRIPTION_EXCEPTION = 0b0100_0000;
        const SERVER_ERROR                      = 0b1000_0000;
    }
}

impl ShutdownReason {
    pub const NONE: ShutdownReason = ShutdownReason::empty();

    /// Everything except the normal end-of-stream classification.
    pub fn is_fatal(&self) -> bool {
        !self.difference(ShutdownReason::OBSERVABLE_TERMINATED).is_empty()
    }

    /// Combines two classifications. A fatal flag supersedes
    /// `OBSERVABLE_TERMINATED`; a non-fatal flag is ignored once a fatal
    /// one has been recorded.
    pub fn merge(self, other: ShutdownReason) -> ShutdownReason {
        if other.is_fatal() {
            (self | other).difference(ShutdownReason::OBSERVABLE_TERMINATED)
        } else if self.is_fatal() {
            self
        } else {
            self | other
        }
    }
}

impl Default for ShutdownReason {
    fn default() -> Self {
        ShutdownReason::NONE
    }
}

impl Serialize for ShutdownReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for ShutdownReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        ShutdownReason::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid shutdown reason: {bits:#x}")))
    }
}

/// Reason accumulator plus the once-only "shutdown started" latch.
#[derive(Debug, Default)]
pub struct ShutdownState {
    reason: Mutex<ShutdownReason>,
    started: AtomicBool,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: ShutdownReason) -> ShutdownReason {
        let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        *current = current.merge(reason);
        debug!("Shutdown reason recorded: {:?} -> {:?}", reason, *current);
        *current
    }

    pub fn reason(&self) -> ShutdownReason {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True exactly once, for the caller that gets to run the shutdown.
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Thread-safe aggregate of failures seen during a session.
#[derive(Debug, Default)]
pub struct ExceptionCollector {
    errors: Mutex<Vec<RemoteError>>,
}

impl ExceptionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, error: RemoteError) {
        debug!("Exception collected: {}", error);
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn first(&self) -> Option<RemoteError> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .cloned()
    }

    /// Collected errors with duplicates (by rendered message) removed,
    /// keeping first occurrence order.
    pub fn distinct(&self) -> Vec<RemoteError> {
        let errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen = std::collections::HashSet::new();
        errors
            .iter()
            .filter(|e| seen.insert(e.to_string()))
            .cloned()
            .collect()
    }
}

/// Per-session summary handed to the hosting application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub reason: ShutdownReason,
    pub exceptions: Vec<RemoteError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fatal_supersedes_observable_terminated() {
        let reason = ShutdownReason::OBSERVABLE_TERMINATED.merge(ShutdownReason::SERVER_ERROR);
        assert_eq!(reason, ShutdownReason::SERVER_ERROR);

        // Completion arriving after a fatal reason does not reintroduce it.
        let reason = reason.merge(ShutdownReason::OBSERVABLE_TERMINATED);
        assert_eq!(reason, ShutdownReason::SERVER_ERROR);

        let reason = reason.merge(ShutdownReason::CLIENT_TERMINATED);
        assert_eq!(
            reason,
            ShutdownReason::SERVER_ERROR | ShutdownReason::CLIENT_TERMINATED
        );
    }

    #[test]
    fn test_state_begins_once() {
        let state = ShutdownState::new();
        assert_eq!(state.reason(), ShutdownReason::NONE);
        assert!(state.begin());
        assert!(!state.begin());
        state.record(ShutdownReason::OBSERVABLE_TERMINATED);
        assert_eq!(state.reason(), ShutdownReason::OBSERVABLE_TERMINATED);
    }

    #[test]
    fn test_reason_serializes_as_bits() {
        let reason = ShutdownReason::EXPRESSION_SECURITY_VIOLATION;
        assert_eq!(serde_json::to_string(&reason).unwrap(), "32");
        let back: ShutdownReason = serde_json::from_str("32").unwrap();
        assert_eq!(back, reason);
        assert!(serde_json::from_str::<ShutdownReason>("256").is_err());
    }

    #[test]
    fn test_collector_deduplicates() {
        let collector = ExceptionCollector::new();
        collector.add(RemoteError::new(RemoteErrorKind::Transport, "closed"));
        collector.add(RemoteError::new(RemoteErrorKind::Transport, "closed"));
        collector.add(RemoteError::new(RemoteErrorKind::Stream, "boom"));
        assert_eq!(collector.distinct().len(), 2);
        assert_eq!(collector.first().unwrap().message, "closed");
    }
}
