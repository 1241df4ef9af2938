//! 发布 / 订阅测试
//!
//! 使用进程内总线验证属性约定、编码、状态过滤与批量发布

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use transport_trace::context::CallContext;
use transport_trace::logging::LogKind;
use transport_trace::pubsub::{
    AvroSchemaRegistry, DecodeOption, Decoded, JsonDecoder, MemoryBus, Payload, PublishOption, Publisher,
    ReceivedMessage, SubscriberRegistry, Subscription, ATTR_ORIGIN_PUBLISH_TIME, ATTR_STATE,
    ATTR_TRACEPARENT, STATE_FAILED, STATE_START, STATE_SUCCESS,
};
use transport_trace::sink::{MemoryAuditStore, TransportLogSink, TransportLogger};
use transport_trace::{traceparent, Error, TraceId};

const USER_CREATED: &str = r#"{
    "type": "record",
    "name": "UserCreated",
    "fields": [{"name": "id", "type": "string"}]
}"#;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct UserCreated {
    id: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Order {
    id: u32,
}

fn bus_with(topic: &str, subscription: &str) -> Arc<MemoryBus> {
    let bus = Arc::new(MemoryBus::new());
    bus.create_topic(topic);
    bus.create_subscription(subscription, topic);
    bus
}

fn no_decoders() -> Vec<Arc<dyn DecodeOption>> {
    Vec::new()
}

/// 轮询直到条件成立，超时返回 false
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// 测试 Avro 发布：属性齐全，数据可按模式解码
#[tokio::test]
async fn test_publish_with_avro_and_state() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("UserCreated.avsc"), USER_CREATED).unwrap();
    let registry = Arc::new(AvroSchemaRegistry::load_dir(dir.path()).unwrap());

    let bus = bus_with("users", "users-all");
    let publisher = Publisher::new(bus.clone(), "users")
        .with_registry(registry.clone())
        .with_avro_encoder("UserCreated");

    let ctx = CallContext::new_root();
    let id = publisher
        .publish(
            &ctx,
            Payload::json(&json!({"id": "X"})).unwrap(),
            &[PublishOption::with_state(STATE_START)],
        )
        .await
        .unwrap();

    let published = bus.published("users");
    assert_eq!(published.len(), 1);
    let (published_id, message) = &published[0];
    assert_eq!(published_id, &id);

    let traceparent = &message.attributes[ATTR_TRACEPARENT];
    assert!(traceparent::is_well_formed(traceparent));
    assert!(traceparent.starts_with(&format!("00-{}-", ctx.trace_id())));
    assert!(chrono::DateTime::parse_from_rfc3339(&message.attributes[ATTR_ORIGIN_PUBLISH_TIME]).is_ok());
    assert_eq!(message.attributes[ATTR_STATE], "start");

    let decoded: UserCreated = registry.decode("UserCreated", &message.data).unwrap();
    assert_eq!(decoded, UserCreated { id: "X".to_owned() });
}

/// 测试状态过滤：不匹配的消息被确认但不分发，比较忽略大小写
#[tokio::test]
async fn test_state_filter_acks_without_dispatch() {
    let bus = bus_with("orders", "orders-success");
    let publisher = Publisher::new(bus.clone(), "orders");
    let ctx = CallContext::new_root();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = SubscriberRegistry::new(bus.clone());
    registry.subscribe(
        Subscription::new(
            "orders-success",
            move |_ctx: CallContext, message: ReceivedMessage, _decoded: Option<Decoded>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    message.ack();
                }
            },
        )
        .with_state(STATE_SUCCESS),
    );
    let handle = registry.validate().await.unwrap().start();

    publisher
        .publish(&ctx, "failed", &[PublishOption::with_state(STATE_FAILED)])
        .await
        .unwrap();
    assert!(eventually(|| bus.acked("orders-success").len() == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    publisher
        .publish(&ctx, "ok", &[PublishOption::with_state("SUCCESS")])
        .await
        .unwrap();
    assert!(eventually(|| bus.acked("orders-success").len() == 2).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
}

/// 测试订阅端沿用发布端的 trace，并按解码选项解码
#[tokio::test]
async fn test_subscriber_adopts_trace_and_decodes() {
    let bus = bus_with("orders", "orders-all");
    let publisher = Publisher::new(bus.clone(), "orders").with_json_encoder();

    let seen: Arc<Mutex<Vec<(TraceId, Option<u32>)>>> = Arc::default();
    let sink = seen.clone();
    let mut registry = SubscriberRegistry::new(bus.clone());
    registry.subscribe(
        Subscription::new(
            "orders-all",
            move |ctx: CallContext, message: ReceivedMessage, decoded: Option<Decoded>| {
                let sink = sink.clone();
                async move {
                    let id = decoded.and_then(|d| d.downcast_ref::<Order>().map(|o| o.id));
                    sink.lock().unwrap().push((ctx.trace_id(), id));
                    message.ack();
                }
            },
        )
        .with_decoder(JsonDecoder::<Order>::new()),
    );
    let handle = registry.validate().await.unwrap().start();

    let ctx = CallContext::new_root();
    publisher
        .publish(&ctx, Payload::json(&json!({"id": 5})).unwrap(), &[])
        .await
        .unwrap();
    assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(seen.lock().unwrap()[0], (ctx.trace_id(), Some(5)));

    handle.shutdown().await;
}

/// 测试缺失的订阅在启动阶段即报错
#[tokio::test]
async fn test_missing_subscription_fails_validation() {
    let bus = bus_with("orders", "orders-all");
    let mut registry = SubscriberRegistry::new(bus);
    registry.receive("orders-all", no_decoders(), |_: CallContext, m: ReceivedMessage, _: Option<Decoded>| async move {
        m.ack()
    });
    registry.receive("missing", no_decoders(), |_: CallContext, m: ReceivedMessage, _: Option<Decoded>| async move {
        m.ack()
    });

    match registry.validate().await {
        Err(Error::SubscriptionNotFound(id)) => assert_eq!(id, "missing"),
        other => panic!("unexpected validation result: {:?}", other.map(|_| ())),
    }
}

/// 测试批量发布：单条编码失败不影响其他消息，汇总为 General 错误
#[tokio::test]
async fn test_batch_publish_partial_failure() {
    let store = Arc::new(MemoryAuditStore::new());
    let (sink, _writer) = TransportLogSink::start(store.clone(), 16, "svc");
    let bus = bus_with("orders", "orders-all");
    // 未配置编码器时对象负载无法编码
    let publisher = Publisher::new(bus.clone(), "orders")
        .with_logger(TransportLogger::new(false, Some(sink), 1024));

    let payloads = vec![
        Payload::from("a"),
        Payload::json(&json!({"b": true})).unwrap(),
        Payload::from("c"),
    ];
    let result = publisher.batch_publish(&CallContext::new_root(), payloads, &[]).await;
    assert!(matches!(result, Err(Error::General(_))));

    let published: Vec<_> = bus
        .published("orders")
        .into_iter()
        .map(|(_, m)| String::from_utf8(m.data.to_vec()).unwrap())
        .collect();
    assert_eq!(published.len(), 2);
    assert!(published.contains(&"a".to_owned()));
    assert!(published.contains(&"c".to_owned()));

    assert!(store.wait_for(3, Duration::from_secs(2)).await);
    let records = store.records();
    assert!(records.iter().all(|r| r.kind == LogKind::PubSub));
    assert_eq!(records.iter().filter(|r| r.error_message.is_some()).count(), 1);
}

/// 测试批量发布全部成功时按输入顺序返回消息ID
#[tokio::test]
async fn test_batch_publish_all_succeed() {
    let bus = bus_with("orders", "orders-all");
    let publisher = Publisher::new(bus.clone(), "orders");
    let ids = publisher
        .batch_publish(&CallContext::new_root(), vec!["x", "y", "z"], &[])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let published = bus.published("orders");
    for (id, payload) in ids.iter().zip(["x", "y", "z"]) {
        let (_, message) = published.iter().find(|(pid, _)| pid == id).unwrap();
        assert_eq!(message.data, payload.as_bytes());
    }

    bus.set_failing("orders", true);
    let result = publisher
        .batch_publish(&CallContext::new_root(), vec!["w"], &[])
        .await;
    assert!(result.is_err());
}
