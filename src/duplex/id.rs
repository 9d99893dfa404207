use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::ast::well_known;

/// Correlates one duplex request, enumeration or subscription.
///
/// `client_id` names the callback (or enumerator handle) on the owning side;
/// `server_id` is allocated by the calling side per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DuplexCallbackId {
    pub client_id: u64,
    pub server_id: u64,
}

impl DuplexCallbackId {
    pub fn new(client_id: u64, server_id: u64) -> Self {
        Self {
            client_id,
            server_id,
        }
    }
}

impl fmt::Display for DuplexCallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.server_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum DuplexKind {
    Invoke,
    Enumerable,
    Observable,
}

impl DuplexKind {
    /// Type tag a reference of this kind reports as its runtime type.
    pub fn type_name(&self) -> &'static str {
        match self {
            DuplexKind::Invoke => well_known::FUNCTION,
            DuplexKind::Enumerable => well_known::ENUMERABLE,
            DuplexKind::Observable => well_known::OBSERVABLE,
        }
    }
}

/// A value that stayed with its owner, referenced by callback id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DuplexRef {
    pub id: u64,
    pub kind: DuplexKind,
}

/// Monotonic id source starting at 1. Ids are never handed out twice.
#[derive(Debug)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_is_unique() {
        let allocator = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..100 {
                    ids.push(allocator.next());
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            let ids = handle.await.unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        assert_eq!(all.len(), 800);
        assert!(all.contains(&1));
        assert!(!all.contains(&0));
    }
}
