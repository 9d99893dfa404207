mod common;

use std::time::Duration;

use common::{client_config, connect, observable_range, observe};
use futures::StreamExt;
use qlink::ast::{TypeDesc, UnaryOp, build};
use qlink::{InterpreterProvider, Notification, ProtocolConfig, ShutdownReason, Value};

#[tokio::test]
async fn test_range_plan_end_to_end() {
    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });

    let stream = client
        .execute(&observable_range(1, 3), Some(Value::Int(0)))
        .await
        .unwrap();
    let observed = observe(stream).await;
    let record = server.await.unwrap();

    assert_eq!(observed.values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(observed.completed);
    assert!(observed.error.is_none());

    assert_eq!(record.session_id.as_deref(), Some("it-client"));
    assert_eq!(record.reason, ShutdownReason::OBSERVABLE_TERMINATED);
    assert!(record.exceptions.is_empty());
    assert!(record.duration >= Duration::ZERO);
}

#[tokio::test]
async fn test_function_plan_receives_argument() {
    let n = build::parameter("n", TypeDesc::int());
    let method = common::static_method(
        "Observable",
        "Range",
        vec![TypeDesc::int(), TypeDesc::int()],
        TypeDesc::observable(TypeDesc::int()),
    );
    let plan = build::lambda(
        vec![n.clone()],
        build::call(None, method, vec![build::int(10), n]),
    );

    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let observed = observe(client.execute(&plan, Some(Value::Int(4))).await.unwrap()).await;
    server.await.unwrap();

    assert_eq!(
        observed.values,
        vec![Value::Int(10), Value::Int(11), Value::Int(12), Value::Int(13)]
    );
    assert!(observed.completed);
}

#[tokio::test]
async fn test_user_throw_reaches_client() {
    let plan = build::throw(build::string("no data for region"), TypeDesc::int());
    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });
    let observed = observe(client.execute(&plan, None).await.unwrap()).await;
    let record = server.await.unwrap();

    assert!(observed.values.is_empty());
    assert!(observed.error.is_some());
    assert_eq!(record.reason, ShutdownReason::EXPRESSION_SUBSCRIPTION_EXCEPTION);
    assert_eq!(record.exceptions.len(), 1);
}

#[tokio::test]
async fn test_client_drop_terminates_server() {
    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });

    let mut stream = client
        .execute(&observable_range(0, 1_000_000), None)
        .await
        .unwrap();
    assert!(matches!(stream.next().await, Some(Notification::Next(Value::Int(0)))));
    drop(stream);

    let record = tokio::time::timeout(Duration::from_secs(30), server)
        .await
        .unwrap()
        .unwrap();
    assert!(record.reason.contains(ShutdownReason::CLIENT_TERMINATED));
}

#[tokio::test]
async fn test_handshake_timeout_is_recorded() {
    let (client, server) = connect(
        client_config(),
        ProtocolConfig {
            handshake_timeout: Duration::from_millis(50),
            ..ProtocolConfig::default()
        },
    );
    // The client never starts.
    let record = server.execute(&InterpreterProvider::default()).await.unwrap();
    drop(client);
    assert_eq!(record.reason, ShutdownReason::PROTOCOL_NEGOTIATION_CANCELED);
    assert_eq!(record.session_id, None);
}

#[tokio::test]
async fn test_client_drop_stops_endless_evaluation() {
    let (client, server) = connect(client_config(), ProtocolConfig::default());
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });

    let endless = build::loop_with(build::int(0), None, None);
    let stream = client.execute(&endless, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);

    let record = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server kept evaluating after the client left")
        .unwrap();
    assert!(record.reason.contains(ShutdownReason::CLIENT_TERMINATED));
}

#[tokio::test]
async fn test_plan_deeper_than_limit_is_refused() {
    let server_config = ProtocolConfig {
        max_plan_depth: 32,
        ..ProtocolConfig::default()
    };
    let (client, server) = connect(client_config(), server_config);
    let server = tokio::spawn(async move {
        server.execute(&InterpreterProvider::default()).await.unwrap()
    });

    let mut plan = build::int(1);
    for _ in 0..100 {
        plan = build::unary(UnaryOp::Negate, plan, TypeDesc::int());
    }
    let observed = observe(client.execute(&plan, None).await.unwrap()).await;
    let record = server.await.unwrap();

    assert!(observed.values.is_empty());
    assert!(!observed.completed);
    assert_eq!(record.reason, ShutdownReason::BAD_CLIENT_REQUEST);
}
