#![allow(dead_code)]

use std::sync::Arc;

use futures::StreamExt;
use qlink::ast::{MethodDefinition, MethodDesc, Node, TypeDesc, build};
use qlink::protocol::{ProtocolError, memory_pair};
use qlink::{ClientProtocol, Notification, NotificationStream, ProtocolConfig, ServerProtocol, Value};

#[ctor::ctor]
fn init_tests() {
    qlink::logging::init_tracing("warn");
}

pub const MAX_FRAME: usize = 1 << 20;

pub fn client_config() -> ProtocolConfig {
    ProtocolConfig {
        client_id: "it-client".to_string(),
        ..ProtocolConfig::default()
    }
}

pub fn connect(client: ProtocolConfig, server: ProtocolConfig) -> (ClientProtocol, ServerProtocol) {
    let (a, b) = memory_pair(MAX_FRAME);
    (
        ClientProtocol::new(Arc::new(a), client).unwrap(),
        ServerProtocol::new(Arc::new(b), server).unwrap(),
    )
}

pub fn static_method(declaring: &str, name: &str, params: Vec<TypeDesc>, ret: TypeDesc) -> MethodDesc {
    MethodDesc::simple(
        MethodDefinition::new(TypeDesc::named(declaring), name, params, ret).static_method(),
    )
}

pub fn observable_range(start: i64, count: i64) -> Node {
    build::call(
        None,
        static_method(
            "Observable",
            "Range",
            vec![TypeDesc::int(), TypeDesc::int()],
            TypeDesc::observable(TypeDesc::int()),
        ),
        vec![build::int(start), build::int(count)],
    )
}

/// Values observed before the terminal notification, and that notification.
pub struct Observed {
    pub values: Vec<Value>,
    pub completed: bool,
    pub error: Option<ProtocolError>,
}

pub async fn observe(mut stream: NotificationStream) -> Observed {
    let mut observed = Observed {
        values: vec![],
        completed: false,
        error: None,
    };
    while let Some(notification) = stream.next().await {
        match notification {
            Notification::Next(value) => observed.values.push(value),
            Notification::Completed => observed.completed = true,
            Notification::Error(e) => observed.error = Some(e),
        }
    }
    observed
}
