//! Per-session duplex bookkeeping.
//!
//! [`OwnerRegistry`] holds the local values exposed to the peer and the
//! enumerators and subscriptions the peer opened on them.
//! [`CallerRegistry`] holds this side's outstanding requests to the peer.
//! Both are created at sink initialization and cleared once at disposal.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DuplexCallbackId, DuplexError, DuplexKind, DuplexRef, DuplexResult, IdAllocator};
use crate::error::RemoteError;
use crate::value::{HostFunction, HostStreamFactory, HostValue, Value, ValueResult, ValueStream};

/// A live enumeration opened by the peer.
pub struct EnumeratorState {
    factory: HostStreamFactory,
    stream: Option<ValueStream>,
}

impl EnumeratorState {
    fn new(factory: HostStreamFactory) -> Self {
        Self {
            factory,
            stream: None,
        }
    }

    /// Advances the enumeration; `Ok(None)` once exhausted.
    pub async fn move_next(&mut self) -> Result<Option<Value>, RemoteError> {
        let factory = &self.factory;
        let stream = self.stream.get_or_insert_with(|| factory());
        stream.next().await.transpose()
    }

    /// Restarts the enumeration from the beginning.
    pub fn reset(&mut self) {
        self.stream = None;
    }
}

pub struct OwnerRegistry {
    invoke_ids: IdAllocator,
    enumerable_ids: IdAllocator,
    observable_ids: IdAllocator,
    enumerator_ids: IdAllocator,
    functions: DashMap<u64, HostFunction>,
    sequences: DashMap<u64, HostStreamFactory>,
    observables: DashMap<u64, HostStreamFactory>,
    enumerators: DashMap<u64, Arc<Mutex<EnumeratorState>>>,
    subscriptions: DashMap<DuplexCallbackId, CancellationToken>,
}

impl Default for OwnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self {
            invoke_ids: IdAllocator::new(),
            enumerable_ids: IdAllocator::new(),
            observable_ids: IdAllocator::new(),
            enumerator_ids: IdAllocator::new(),
            functions: DashMap::new(),
            sequences: DashMap::new(),
            observables: DashMap::new(),
            enumerators: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Registers a host value under a fresh id of the matching kind.
    pub fn register(&self, value: &HostValue) -> DuplexResult<DuplexRef> {
        let (id, kind) = match value {
            HostValue::Function(f) => {
                let id = self.invoke_ids.next();
                self.functions.insert(id, f.clone());
                (id, DuplexKind::Invoke)
            }
            HostValue::Sequence(f) => {
                let id = self.enumerable_ids.next();
                self.sequences.insert(id, f.clone());
                (id, DuplexKind::Enumerable)
            }
            HostValue::Stream(f) => {
                let id = self.observable_ids.next();
                self.observables.insert(id, f.clone());
                (id, DuplexKind::Observable)
            }
            HostValue::Opaque { type_name, .. } => {
                return Err(DuplexError::NotRegistrable(type_name.clone()));
            }
        };
        debug!("Registered {} callback {}", kind, id);
        Ok(DuplexRef { id, kind })
    }

    pub fn function(&self, id: u64) -> DuplexResult<HostFunction> {
        self.functions
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(DuplexError::UnknownCallback {
                kind: DuplexKind::Invoke,
                id,
            })
    }

    pub fn observable(&self, id: u64) -> DuplexResult<HostStreamFactory> {
        self.observables
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(DuplexError::UnknownCallback {
                kind: DuplexKind::Observable,
                id,
            })
    }

    /// Opens a new enumerator over sequence `id` and returns its handle.
    pub fn open_enumerator(&self, id: u64) -> DuplexResult<u64> {
        let factory = self
            .sequences
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(DuplexError::UnknownCallback {
                kind: DuplexKind::Enumerable,
                id,
            })?;
        let handle = self.enumerator_ids.next();
        self.enumerators
            .insert(handle, Arc::new(Mutex::new(EnumeratorState::new(factory))));
        Ok(handle)
    }

    pub fn enumerator(&self, handle: u64) -> Option<Arc<Mutex<EnumeratorState>>> {
        self.enumerators.get(&handle).map(|e| e.value().clone())
    }

    pub fn remove_enumerator(&self, handle: u64) -> bool {
        self.enumerators.remove(&handle).is_some()
    }

    pub fn enumerator_count(&self) -> usize {
        self.enumerators.len()
    }

    /// Tracks a subscription and returns the token that stops its pump.
    pub fn add_subscription(&self, id: DuplexCallbackId, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.subscriptions.insert(id, token.clone());
        token
    }

    pub fn remove_subscription(&self, id: &DuplexCallbackId) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn clear(&self) {
        for entry in self.subscriptions.iter() {
            entry.value().cancel();
        }
        self.subscriptions.clear();
        self.enumerators.clear();
        self.functions.clear();
        self.sequences.clear();
        self.observables.clear();
    }
}

type Reply<T> = oneshot::Sender<DuplexResult<T>>;

/// Outstanding requests this side made to the peer, keyed by the id the
/// reply will carry.
pub struct CallerRegistry {
    request_ids: IdAllocator,
    invocations: DashMap<DuplexCallbackId, Reply<Value>>,
    enumerator_opens: DashMap<DuplexCallbackId, Reply<u64>>,
    enumerator_steps: DashMap<DuplexCallbackId, Reply<Option<Value>>>,
    subscriptions: DashMap<DuplexCallbackId, mpsc::UnboundedSender<DuplexResult<Value>>>,
}

impl Default for CallerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallerRegistry {
    pub fn new() -> Self {
        Self {
            request_ids: IdAllocator::new(),
            invocations: DashMap::new(),
            enumerator_opens: DashMap::new(),
            enumerator_steps: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    pub fn next_id(&self, target: u64) -> DuplexCallbackId {
        DuplexCallbackId::new(target, self.request_ids.next())
    }

    pub fn await_invocation(&self, id: DuplexCallbackId) -> oneshot::Receiver<DuplexResult<Value>> {
        let (tx, rx) = oneshot::channel();
        self.invocations.insert(id, tx);
        rx
    }

    pub fn await_enumerator(&self, id: DuplexCallbackId) -> oneshot::Receiver<DuplexResult<u64>> {
        let (tx, rx) = oneshot::channel();
        self.enumerator_opens.insert(id, tx);
        rx
    }

    pub fn await_step(&self, id: DuplexCallbackId) -> oneshot::Receiver<DuplexResult<Option<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.enumerator_steps.insert(id, tx);
        rx
    }

    pub fn open_subscription(
        &self,
        id: DuplexCallbackId,
    ) -> mpsc::UnboundedReceiver<DuplexResult<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(id, tx);
        rx
    }

    pub fn close_subscription(&self, id: &DuplexCallbackId) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    /// Drops a request that will never be answered (timeout, cancellation).
    pub fn forget(&self, id: &DuplexCallbackId) {
        self.invocations.remove(id);
        self.enumerator_opens.remove(id);
        self.enumerator_steps.remove(id);
    }

    pub fn complete_invocation(&self, id: &DuplexCallbackId, result: DuplexResult<Value>) -> bool {
        complete(&self.invocations, id, result)
    }

    pub fn complete_enumerator(&self, id: &DuplexCallbackId, result: DuplexResult<u64>) -> bool {
        complete(&self.enumerator_opens, id, result)
    }

    pub fn complete_step(&self, id: &DuplexCallbackId, result: DuplexResult<Option<Value>>) -> bool {
        complete(&self.enumerator_steps, id, result)
    }

    pub fn has_invocation(&self, id: &DuplexCallbackId) -> bool {
        self.invocations.contains_key(id)
    }

    /// Forwards a pushed notification. Terminal notifications close the
    /// subscription.
    pub fn push(&self, id: &DuplexCallbackId, item: Option<ValueResult>) -> bool {
        match item {
            Some(Ok(value)) => match self.subscriptions.get(id) {
                Some(tx) => {
                    let _ = tx.send(Ok(value));
                    true
                }
                None => false,
            },
            Some(Err(error)) => match self.subscriptions.remove(id) {
                Some((_, tx)) => {
                    let _ = tx.send(Err(DuplexError::Remote(error)));
                    true
                }
                None => false,
            },
            None => self.subscriptions.remove(id).is_some(),
        }
    }

    /// Ends a subscription the owner could not set up or keep running.
    pub fn fail_subscription(&self, id: &DuplexCallbackId, error: RemoteError) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(DuplexError::CallFailed(error)));
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.invocations.len() + self.enumerator_opens.len() + self.enumerator_steps.len()
    }

    /// Fails every outstanding request and subscription with `Cancelled`.
    pub fn cancel_all(&self) {
        let ids: Vec<_> = self.invocations.iter().map(|e| *e.key()).collect();
        for id in ids {
            complete(&self.invocations, &id, Err(DuplexError::Cancelled));
        }
        let ids: Vec<_> = self.enumerator_opens.iter().map(|e| *e.key()).collect();
        for id in ids {
            complete(&self.enumerator_opens, &id, Err(DuplexError::Cancelled));
        }
        let ids: Vec<_> = self.enumerator_steps.iter().map(|e| *e.key()).collect();
        for id in ids {
            complete(&self.enumerator_steps, &id, Err(DuplexError::Cancelled));
        }
        let ids: Vec<_> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.subscriptions.remove(&id) {
                let _ = tx.send(Err(DuplexError::Cancelled));
            }
        }
    }
}

fn complete<T>(
    map: &DashMap<DuplexCallbackId, Reply<T>>,
    id: &DuplexCallbackId,
    result: DuplexResult<T>,
) -> bool {
    match map.remove(id) {
        Some((_, tx)) => {
            // The waiter may have given up already.
            let _ = tx.send(result);
            true
        }
        None => false,
    }
}
