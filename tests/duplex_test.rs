mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{client_config, connect, observe, static_method};
use futures::stream::{self, StreamExt};
use qlink::ast::{TypeDesc, build};
use qlink::eval::{EvalError, HostBindings};
use qlink::protocol::ProtocolError;
use qlink::{HostValue, InterpreterProvider, ProtocolConfig, RemoteError, ShutdownReason, Value};

fn doubling() -> HostValue {
    HostValue::function(|args: Vec<Value>| async move {
        match args.as_slice() {
            [Value::Int(i)] => Ok(Value::Int(i * 2)),
            _ => Err(RemoteError::user("expected one int")),
        }
    })
}

#[tokio::test]
async fn test_server_invokes_client_function() {
    let scale = static_method("Pricing", "Scale", vec![TypeDesc::int()], TypeDesc::int());
    let plan = build::call(None, scale, vec![build::int(21)]);

    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let client = client.with_bindings(HostBindings::new().bind_function("Pricing.Scale", doubling()));
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let observed = observe(client.execute(&plan, None).await.unwrap()).await;
    let record = server.await.unwrap();

    assert_eq!(observed.values, vec![Value::Int(42)]);
    assert!(observed.completed);
    assert_eq!(record.reason, ShutdownReason::OBSERVABLE_TERMINATED);
}

#[tokio::test]
async fn test_server_subscribes_to_client_stream() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let counter = subscriptions.clone();
    let source = HostValue::stream(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        stream::iter(vec![Ok(Value::from("a")), Ok(Value::from("b"))]).boxed()
    });
    let plan = build::constant(Value::Host(source), TypeDesc::observable(TypeDesc::string()));

    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let observed = observe(client.execute(&plan, None).await.unwrap()).await;
    server.await.unwrap();

    assert_eq!(observed.values, vec![Value::from("a"), Value::from("b")]);
    assert!(observed.completed);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_enumerates_client_sequence() {
    let sequence = HostValue::sequence(|| {
        stream::iter((1..=4).map(|i| Ok(Value::Int(i)))).boxed()
    });
    let to_list = static_method(
        "Enumerable",
        "ToList",
        vec![TypeDesc::enumerable(TypeDesc::int())],
        TypeDesc::list(TypeDesc::int()),
    );
    let plan = build::call(
        None,
        to_list,
        vec![build::constant(
            Value::Host(sequence),
            TypeDesc::enumerable(TypeDesc::int()),
        )],
    );

    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let observed = observe(client.execute(&plan, None).await.unwrap()).await;
    server.await.unwrap();

    assert_eq!(
        observed.values,
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
    );
}

#[tokio::test]
async fn test_callback_failure_faults_stream() {
    let failing = HostValue::function(|_args: Vec<Value>| async move {
        Err::<Value, _>(RemoteError::user("rate service down"))
    });
    let scale = static_method("Pricing", "Scale", vec![TypeDesc::int()], TypeDesc::int());
    let plan = build::call(None, scale, vec![build::int(1)]);

    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let client = client.with_bindings(HostBindings::new().bind_function("Pricing.Scale", failing));
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let observed = observe(client.execute(&plan, None).await.unwrap()).await;
    let record = server.await.unwrap();

    assert!(observed.values.is_empty());
    assert!(observed.error.is_some());
    assert_eq!(record.reason, ShutdownReason::EXPRESSION_SUBSCRIPTION_EXCEPTION);
}

#[tokio::test]
async fn test_host_values_need_duplex() {
    let config = ProtocolConfig {
        enable_duplex: false,
        ..client_config()
    };
    let (client, server) = connect(config, ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let plan = build::constant(
        Value::Host(HostValue::stream(|| stream::empty().boxed())),
        TypeDesc::observable(TypeDesc::int()),
    );

    let result = client.execute(&plan, None).await;
    assert!(matches!(
        result,
        Err(ProtocolError::Eval(EvalError::Unrepresentable(_)))
    ));
    let record = server.await.unwrap();
    assert_eq!(record.reason, ShutdownReason::CLIENT_TERMINATED);
}
