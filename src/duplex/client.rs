use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

use super::sink::DuplexState;
use super::{DuplexCallbackId, DuplexError, DuplexKind, DuplexRef, DuplexResult};
use crate::protocol::Message;
use crate::value::Value;

/// Calls into callbacks the peer registered.
#[derive(Clone)]
pub struct DuplexClient {
    state: Arc<DuplexState>,
}

impl DuplexClient {
    pub(crate) fn new(state: Arc<DuplexState>) -> Self {
        Self { state }
    }

    fn expect_kind(reference: &DuplexRef, kind: DuplexKind) -> DuplexResult<()> {
        if reference.kind != kind {
            return Err(DuplexError::UnknownCallback {
                kind,
                id: reference.id,
            });
        }
        Ok(())
    }

    async fn wait<T>(
        &self,
        id: DuplexCallbackId,
        rx: oneshot::Receiver<DuplexResult<T>>,
    ) -> DuplexResult<T> {
        let cancel = self.state.context.cancel.clone();
        let timeout = self.state.context.config.response_timeout();
        let reply = async {
            let received = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.state.caller.forget(&id);
                        return Err(DuplexError::Timeout(id));
                    }
                },
                None => rx.await,
            };
            // A dropped sender means the registries were torn down.
            received.unwrap_or(Err(DuplexError::Cancelled))
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                self.state.caller.forget(&id);
                Err(DuplexError::Cancelled)
            }
            result = reply => result,
        }
    }

    /// Sends a request registered under `id`; unregisters it when the send
    /// fails so no waiter is left behind.
    async fn request(&self, id: DuplexCallbackId, message: Message) -> DuplexResult<()> {
        if let Err(e) = self.state.send(message).await {
            self.state.caller.forget(&id);
            return Err(e);
        }
        Ok(())
    }

    #[instrument(skip(self, arguments), fields(callback = reference.id))]
    pub async fn invoke(&self, reference: &DuplexRef, arguments: Vec<Value>) -> DuplexResult<Value> {
        Self::expect_kind(reference, DuplexKind::Invoke)?;
        let id = self.state.caller.next_id(reference.id);
        let rx = self.state.caller.await_invocation(id);
        self.request(id, Message::DuplexInvoke { id, arguments })
            .await?;
        self.wait(id, rx).await
    }

    /// Opens a new enumerator over the peer's sequence.
    #[instrument(skip(self), fields(callback = reference.id))]
    pub async fn enumerate(&self, reference: &DuplexRef) -> DuplexResult<RemoteEnumerator> {
        Self::expect_kind(reference, DuplexKind::Enumerable)?;
        let id = self.state.caller.next_id(reference.id);
        let rx = self.state.caller.await_enumerator(id);
        self.request(id, Message::DuplexGetEnumerator { id })
            .await?;
        let handle = self.wait(id, rx).await?;
        debug!("Opened remote enumerator {}", handle);
        Ok(RemoteEnumerator {
            client: self.clone(),
            handle,
            done: false,
        })
    }

    /// Starts a new subscription to the peer's stream.
    #[instrument(skip(self), fields(callback = reference.id))]
    pub async fn subscribe(&self, reference: &DuplexRef) -> DuplexResult<RemoteSubscription> {
        Self::expect_kind(reference, DuplexKind::Observable)?;
        let id = self.state.caller.next_id(reference.id);
        let rx = self.state.caller.open_subscription(id);
        if let Err(e) = self.state.send(Message::DuplexSubscribe { id }).await {
            self.state.caller.close_subscription(&id);
            return Err(e);
        }
        Ok(RemoteSubscription {
            client: self.clone(),
            id,
            rx,
            closed: false,
        })
    }

    /// Unified entry point used by the interpreter: a stream over any
    /// sequence-like reference.
    pub fn stream(&self, reference: DuplexRef) -> BoxStream<'static, DuplexResult<Value>> {
        let client = self.clone();
        match reference.kind {
            DuplexKind::Observable => stream::once(async move { client.subscribe(&reference).await })
                .map(|result| match result {
                    Ok(subscription) => subscription.boxed(),
                    Err(e) => stream::once(async move { Err(e) }).boxed(),
                })
                .flatten()
                .boxed(),
            DuplexKind::Enumerable => stream::once(async move { client.enumerate(&reference).await })
                .map(|result| match result {
                    Ok(enumerator) => enumerator.into_stream(),
                    Err(e) => stream::once(async move { Err(e) }).boxed(),
                })
                .flatten()
                .boxed(),
            DuplexKind::Invoke => stream::once(async move {
                Err(DuplexError::UnknownCallback {
                    kind: DuplexKind::Enumerable,
                    id: reference.id,
                })
            })
            .boxed(),
        }
    }
}

/// One enumeration over a peer-owned sequence.
pub struct RemoteEnumerator {
    client: DuplexClient,
    handle: u64,
    done: bool,
}

impl RemoteEnumerator {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Next element, `None` once exhausted.
    pub async fn move_next(&mut self) -> DuplexResult<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let caller = &self.client.state.caller;
        let id = caller.next_id(self.handle);
        let rx = caller.await_step(id);
        self.client
            .request(id, Message::DuplexMoveNext { id })
            .await?;
        let step = self.client.wait(id, rx).await;
        if matches!(step, Ok(None) | Err(_)) {
            self.done = true;
        }
        step
    }

    pub async fn reset(&mut self) -> DuplexResult<()> {
        let caller = &self.client.state.caller;
        let id = caller.next_id(self.handle);
        let rx = caller.await_step(id);
        self.client
            .request(id, Message::DuplexResetEnumerator { id })
            .await?;
        self.client.wait(id, rx).await?;
        self.done = false;
        Ok(())
    }

    /// Releases the handle on the owner. No reply is expected.
    pub async fn dispose(self) -> DuplexResult<()> {
        let id = self.client.state.caller.next_id(self.handle);
        self.client
            .state
            .send(Message::DuplexDisposeEnumerator { id })
            .await
    }

    pub fn into_stream(self) -> BoxStream<'static, DuplexResult<Value>> {
        stream::unfold(Some(self), |enumerator| async move {
            let Some(mut enumerator) = enumerator else {
                return None;
            };
            match enumerator.move_next().await {
                Ok(Some(value)) => Some((Ok(value), Some(enumerator))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

/// A live subscription to a peer-owned stream.
///
/// Dropping it before the stream ended sends `DuplexDisposeSubscription`.
pub struct RemoteSubscription {
    client: DuplexClient,
    id: DuplexCallbackId,
    rx: mpsc::UnboundedReceiver<DuplexResult<Value>>,
    closed: bool,
}

impl RemoteSubscription {
    pub fn id(&self) -> DuplexCallbackId {
        self.id
    }

    /// Stops this subscription. Notifications already in flight for it are
    /// dropped; other subscriptions to the same callback are unaffected.
    pub async fn unsubscribe(mut self) -> DuplexResult<()> {
        self.closed = true;
        self.client.state.caller.close_subscription(&self.id);
        self.client
            .state
            .send(Message::DuplexDisposeSubscription { id: self.id })
            .await
    }
}

impl Stream for RemoteSubscription {
    type Item = DuplexResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.rx.poll_recv(cx);
        if let Poll::Ready(None) = poll {
            self.closed = true;
        }
        poll
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.client.state.caller.close_subscription(&self.id) {
            let state = self.client.state.clone();
            let id = self.id;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = state.send(Message::DuplexDisposeSubscription { id }).await {
                        debug!("Dispose of subscription {} not sent: {}", id, e);
                    }
                });
            }
        }
    }
}
