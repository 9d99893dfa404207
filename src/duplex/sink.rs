use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::client::DuplexClient;
use super::registry::{CallerRegistry, OwnerRegistry};
use super::{CallbackRegistrar, DuplexCallbackId, DuplexError, DuplexRef, DuplexResult};
use crate::error::{RemoteError, RemoteErrorKind};
use crate::protocol::{
    Message, ProtocolError, ProtocolMessage, ProtocolResult, ProtocolSink, SinkContext,
};
use crate::value::{HostValue, Value};

pub(crate) struct DuplexState {
    pub(crate) context: SinkContext,
    pub(crate) owner: OwnerRegistry,
    pub(crate) caller: CallerRegistry,
}

impl DuplexState {
    pub(crate) async fn send(&self, message: Message) -> DuplexResult<()> {
        self.context
            .sender
            .send(message)
            .await
            .map_err(|e| match e {
                ProtocolError::Cancelled | ProtocolError::SessionClosed => DuplexError::Cancelled,
                other => DuplexError::Send(other.to_string()),
            })
    }

    /// Sends the single reply to an owner-side request. A reply that cannot
    /// be delivered takes the session down.
    async fn reply(&self, message: Message) {
        let kind = message.kind();
        match self.send(message).await {
            Ok(()) => {}
            Err(DuplexError::Cancelled) => debug!("Session ended before {} was sent", kind),
            Err(e) => {
                warn!("Failed to send {}: {}", kind, e);
                self.context
                    .fail_session(RemoteError::from_error(RemoteErrorKind::Transport, &e));
            }
        }
    }

    async fn handle_invoke(self: Arc<Self>, id: DuplexCallbackId, arguments: Vec<Value>) {
        let result = match self.owner.function(id.client_id) {
            Ok(function) => function(arguments).await,
            Err(e) => Err(e.to_remote()),
        };
        let response = match result {
            Ok(value) => match self.register_nested(value) {
                Ok(value) => Message::DuplexResponse { id, value },
                Err(e) => Message::DuplexErrorResponse {
                    id,
                    error: e.to_remote(),
                },
            },
            Err(error) => Message::DuplexErrorResponse { id, error },
        };
        self.reply(response).await;
    }

    async fn handle_get_enumerator(self: Arc<Self>, id: DuplexCallbackId) {
        let response = match self.owner.open_enumerator(id.client_id) {
            Ok(enumerator_id) => Message::DuplexGetEnumeratorResponse { id, enumerator_id },
            Err(e) => Message::DuplexGetEnumeratorErrorResponse {
                id,
                error: e.to_remote(),
            },
        };
        self.reply(response).await;
    }

    /// `id.client_id` is the enumerator handle.
    async fn handle_move_next(self: Arc<Self>, id: DuplexCallbackId) {
        let Some(enumerator) = self.owner.enumerator(id.client_id) else {
            let error = missing_enumerator(id.client_id);
            self.reply(Message::DuplexEnumeratorErrorResponse { id, error })
                .await;
            return;
        };
        let step = enumerator.lock().await.move_next().await;
        let response = match step {
            Ok(Some(value)) => match self.register_nested(value) {
                Ok(value) => Message::DuplexEnumeratorResponse {
                    id,
                    current: Some(value),
                },
                Err(e) => Message::DuplexEnumeratorErrorResponse {
                    id,
                    error: e.to_remote(),
                },
            },
            Ok(None) => {
                self.owner.remove_enumerator(id.client_id);
                debug!("Enumerator {} exhausted", id.client_id);
                Message::DuplexEnumeratorResponse { id, current: None }
            }
            Err(error) => Message::DuplexEnumeratorErrorResponse { id, error },
        };
        self.reply(response).await;
    }

    async fn handle_reset(self: Arc<Self>, id: DuplexCallbackId) {
        let response = match self.owner.enumerator(id.client_id) {
            Some(enumerator) => {
                enumerator.lock().await.reset();
                Message::DuplexEnumeratorResponse { id, current: None }
            }
            None => Message::DuplexEnumeratorErrorResponse {
                id,
                error: missing_enumerator(id.client_id),
            },
        };
        self.reply(response).await;
    }

    /// `token` was registered before this task started, so a dispose that
    /// arrives while the subscription is being set up still stops it.
    async fn handle_subscribe(self: Arc<Self>, id: DuplexCallbackId, token: CancellationToken) {
        let factory = match self.owner.observable(id.client_id) {
            Ok(factory) => factory,
            Err(e) => {
                self.owner.remove_subscription(&id);
                self.reply(Message::DuplexErrorResponse {
                    id,
                    error: e.to_remote(),
                })
                .await;
                return;
            }
        };
        self.reply(Message::DuplexSubscribeResponse { id }).await;

        let mut stream = factory();
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Subscription {} disposed", id);
                    return;
                }
                item = stream.next() => item,
            };
            let message = match item {
                Some(Ok(value)) => match self.register_nested(value) {
                    Ok(value) => Message::DuplexOnNext { id, value },
                    Err(e) => Message::DuplexErrorResponse {
                        id,
                        error: e.to_remote(),
                    },
                },
                Some(Err(error)) => Message::DuplexOnError { id, error },
                None => Message::DuplexOnCompleted { id },
            };
            let terminal = !matches!(message, Message::DuplexOnNext { .. });
            if let Err(e) = self.send(message).await {
                // One failed push ends this subscription only.
                if e != DuplexError::Cancelled {
                    self.context
                        .exceptions
                        .add(RemoteError::from_error(RemoteErrorKind::Stream, &e));
                }
                break;
            }
            if terminal {
                break;
            }
        }
        self.owner.remove_subscription(&id);
    }

    /// Values returned to the peer may themselves be host-only.
    fn register_nested(&self, value: Value) -> DuplexResult<Value> {
        if value.is_representable() {
            return Ok(value);
        }
        value.map_host(&mut |host| self.owner.register(host).map(Value::Duplex))
    }

    /// Routes a reply to a caller-side request. Returns false when nothing
    /// was waiting for it.
    fn route_reply(&self, message: &Message) -> bool {
        match message.clone() {
            Message::DuplexResponse { id, value } => self.caller.complete_invocation(&id, Ok(value)),
            Message::DuplexErrorResponse { id, error } => {
                if self.caller.has_invocation(&id) {
                    self.caller
                        .complete_invocation(&id, Err(DuplexError::CallFailed(error)))
                } else {
                    self.caller.fail_subscription(&id, error)
                }
            }
            Message::DuplexGetEnumeratorResponse { id, enumerator_id } => {
                self.caller.complete_enumerator(&id, Ok(enumerator_id))
            }
            Message::DuplexGetEnumeratorErrorResponse { id, error } => self
                .caller
                .complete_enumerator(&id, Err(DuplexError::CallFailed(error))),
            Message::DuplexEnumeratorResponse { id, current } => {
                self.caller.complete_step(&id, Ok(current))
            }
            Message::DuplexEnumeratorErrorResponse { id, error } => self
                .caller
                .complete_step(&id, Err(DuplexError::CallFailed(error))),
            Message::DuplexSubscribeResponse { id } => {
                debug!("Subscription {} acknowledged", id);
                true
            }
            Message::DuplexOnNext { id, value } => self.caller.push(&id, Some(Ok(value))),
            Message::DuplexOnError { id, error } => self.caller.push(&id, Some(Err(error))),
            Message::DuplexOnCompleted { id } => self.caller.push(&id, None),
            _ => false,
        }
    }
}

fn missing_enumerator(handle: u64) -> RemoteError {
    RemoteError::new(
        RemoteErrorKind::CallFailed,
        format!("No enumerator registered under id {}", handle),
    )
}

/// Protocol sink implementing both ends of the duplex patterns.
///
/// Owner-side requests are answered on spawned tasks so a callback that
/// itself waits on the peer never blocks the receive loop.
#[derive(Default)]
pub struct DuplexSink {
    state: OnceLock<Arc<DuplexState>>,
}

impl DuplexSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> DuplexResult<&Arc<DuplexState>> {
        self.state.get().ok_or(DuplexError::NotInitialized)
    }

    /// Caller-side handle for invoking, enumerating and subscribing to the
    /// peer's callbacks.
    pub fn client(&self) -> DuplexResult<DuplexClient> {
        Ok(DuplexClient::new(self.state()?.clone()))
    }

    pub fn register_invoke(&self, function: HostValue) -> DuplexResult<DuplexRef> {
        self.register_as(function, super::DuplexKind::Invoke)
    }

    pub fn register_enumerable(&self, sequence: HostValue) -> DuplexResult<DuplexRef> {
        self.register_as(sequence, super::DuplexKind::Enumerable)
    }

    pub fn register_observable(&self, stream: HostValue) -> DuplexResult<DuplexRef> {
        self.register_as(stream, super::DuplexKind::Observable)
    }

    fn register_as(&self, value: HostValue, kind: super::DuplexKind) -> DuplexResult<DuplexRef> {
        if value.duplex_kind() != Some(kind) {
            return Err(DuplexError::NotRegistrable(value.type_name()));
        }
        self.state()?.owner.register(&value)
    }

    pub fn pending_requests(&self) -> usize {
        self.state.get().map(|s| s.caller.pending()).unwrap_or(0)
    }

    pub fn live_subscriptions(&self) -> usize {
        self.state
            .get()
            .map(|s| s.owner.subscription_count())
            .unwrap_or(0)
    }
}

impl CallbackRegistrar for DuplexSink {
    fn register(&self, value: &HostValue) -> DuplexResult<DuplexRef> {
        self.state()?.owner.register(value)
    }
}

#[async_trait]
impl ProtocolSink for DuplexSink {
    fn name(&self) -> String {
        "duplex".to_string()
    }

    async fn initialize(&self, context: SinkContext) -> ProtocolResult<()> {
        let state = Arc::new(DuplexState {
            context,
            owner: OwnerRegistry::new(),
            caller: CallerRegistry::new(),
        });
        self.state
            .set(state)
            .map_err(|_| ProtocolError::internal("duplex sink initialized twice"))
    }

    async fn on_send(&self, _message: &mut ProtocolMessage) -> ProtocolResult<()> {
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(kind = %message.kind()))]
    async fn on_receive(&self, message: &mut ProtocolMessage) -> ProtocolResult<()> {
        if !message.kind().is_duplex() {
            return Ok(());
        }
        let state = self.state().map_err(ProtocolError::from)?.clone();
        message.mark_handled();

        match message.message.clone() {
            Message::DuplexInvoke { id, arguments } => {
                tokio::spawn(state.handle_invoke(id, arguments));
            }
            Message::DuplexGetEnumerator { id } => {
                tokio::spawn(state.handle_get_enumerator(id));
            }
            Message::DuplexMoveNext { id } => {
                tokio::spawn(state.handle_move_next(id));
            }
            Message::DuplexResetEnumerator { id } => {
                tokio::spawn(state.handle_reset(id));
            }
            Message::DuplexDisposeEnumerator { id } => {
                if !state.owner.remove_enumerator(id.client_id) {
                    debug!("Dispose for unknown enumerator {}", id.client_id);
                }
            }
            Message::DuplexSubscribe { id } => {
                let token = state.owner.add_subscription(id, &state.context.cancel);
                tokio::spawn(state.handle_subscribe(id, token));
            }
            Message::DuplexDisposeSubscription { id } => {
                if !state.owner.remove_subscription(&id) {
                    debug!("Dispose for unknown subscription {}", id);
                }
            }
            reply => {
                if !state.route_reply(&reply) {
                    debug!("Dropping {} for unregistered id {:?}", reply.kind(), reply.duplex_id());
                }
            }
        }
        Ok(())
    }

    async fn dispose(&self) {
        if let Some(state) = self.state.get() {
            state.owner.clear();
            state.caller.cancel_all();
            debug!("Duplex registries cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ProtocolConfig;
    use crate::protocol::transport::memory_pair;
    use crate::protocol::{ProtocolRole, Session};
    use futures::stream;
    use pretty_assertions::assert_eq;

    /// Two negotiated sessions with duplex sinks and running receive loops.
    async fn connected() -> (Session, Arc<DuplexSink>, Session, Arc<DuplexSink>) {
        let (a, b) = memory_pair(1 << 20);
        let config = Arc::new(ProtocolConfig {
            client_id: "duplex".to_string(),
            ..ProtocolConfig::default()
        });
        let owner_sink = Arc::new(DuplexSink::new());
        let caller_sink = Arc::new(DuplexSink::new());
        let owner = Session::new(
            ProtocolRole::Client,
            Arc::new(a),
            config.clone(),
            vec![owner_sink.clone() as Arc<dyn ProtocolSink>],
        );
        let caller = Session::new(
            ProtocolRole::Server,
            Arc::new(b),
            config,
            vec![caller_sink.clone() as Arc<dyn ProtocolSink>],
        );
        let (owned, called) = tokio::join!(owner.negotiate(), caller.negotiate());
        owned.unwrap();
        called.unwrap();
        owner.initialize_sinks().await.unwrap();
        caller.initialize_sinks().await.unwrap();
        for session in [owner.clone(), caller.clone()] {
            tokio::spawn(async move { while let Ok(Some(_)) = session.receive().await {} });
        }
        (owner, owner_sink, caller, caller_sink)
    }

    #[tokio::test]
    async fn test_invoke_ignores_stray_reply() {
        let (owner, owner_sink, _caller, caller_sink) = connected().await;
        let count = HostValue::function(|args: Vec<Value>| async move {
            Ok(Value::Int(args.len() as i64))
        });
        let reference = owner_sink.register_invoke(count).unwrap();

        // Nobody is waiting for this one.
        owner
            .send(Message::DuplexResponse {
                id: DuplexCallbackId::new(99, 99),
                value: Value::Null,
            })
            .await
            .unwrap();

        let client = caller_sink.client().unwrap();
        assert_eq!(
            client
                .invoke(&reference, vec![Value::Int(1), Value::Int(2)])
                .await,
            Ok(Value::Int(2))
        );
        assert_eq!(client.invoke(&reference, vec![]).await, Ok(Value::Int(0)));
        assert_eq!(caller_sink.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_enumerators_run_independently() {
        let (_owner, owner_sink, _caller, caller_sink) = connected().await;
        let letters = HostValue::sequence(|| {
            stream::iter(vec![Ok(Value::from("a")), Ok(Value::from("b"))]).boxed()
        });
        let reference = owner_sink.register_enumerable(letters).unwrap();
        let client = caller_sink.client().unwrap();

        let mut first = client.enumerate(&reference).await.unwrap();
        let mut second = client.enumerate(&reference).await.unwrap();
        assert_ne!(first.handle(), second.handle());

        assert_eq!(first.move_next().await, Ok(Some(Value::from("a"))));
        assert_eq!(first.move_next().await, Ok(Some(Value::from("b"))));
        assert_eq!(first.move_next().await, Ok(None));
        assert_eq!(second.move_next().await, Ok(Some(Value::from("a"))));
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_sibling_running() {
        let (_owner, owner_sink, _caller, caller_sink) = connected().await;
        let ticks = HostValue::stream(|| {
            stream::unfold(0i64, |i| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(Value::Int(i)), i + 1))
            })
            .boxed()
        });
        let reference = owner_sink.register_observable(ticks).unwrap();
        let client = caller_sink.client().unwrap();

        let mut first = client.subscribe(&reference).await.unwrap();
        let mut second = client.subscribe(&reference).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.next().await, Some(Ok(Value::Int(0))));
        assert_eq!(second.next().await, Some(Ok(Value::Int(0))));

        first.unsubscribe().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while owner_sink.live_subscriptions() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for expected in 1..4 {
            assert_eq!(second.next().await, Some(Ok(Value::Int(expected))));
        }
    }

    #[tokio::test]
    async fn test_subscribe_to_unknown_callback_fails_the_call() {
        let (_owner, owner_sink, _caller, caller_sink) = connected().await;
        let client = caller_sink.client().unwrap();
        let missing = DuplexRef {
            id: 77,
            kind: crate::duplex::DuplexKind::Observable,
        };

        let mut subscription = client.subscribe(&missing).await.unwrap();
        match subscription.next().await {
            Some(Err(DuplexError::CallFailed(error))) => {
                assert_eq!(error.kind, RemoteErrorKind::CallFailed)
            }
            other => panic!("expected a failed call, got {:?}", other),
        }
        assert_eq!(subscription.next().await, None);
        assert_eq!(owner_sink.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_immediate_unsubscribe_stops_owner() {
        let (_owner, owner_sink, _caller, caller_sink) = connected().await;
        let endless = HostValue::stream(|| {
            stream::unfold(0i64, |i| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Some((Ok(Value::Int(i)), i + 1))
            })
            .boxed()
        });
        let reference = owner_sink.register_observable(endless).unwrap();
        let client = caller_sink.client().unwrap();

        let subscription = client.subscribe(&reference).await.unwrap();
        subscription.unsubscribe().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while owner_sink.live_subscriptions() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(owner_sink.live_subscriptions(), 0);
    }
}
