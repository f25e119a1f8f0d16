//! Dumped messages replayed against the in-memory broker.

use std::collections::BTreeMap;
use std::sync::Arc;

use amqp_tools::dump::{self, DumpEnvelope};
use amqp_tools::memory::MemoryBroker;
use amqp_tools::{
    BindingSet, ConsumeEvent, ConsumeMode, ConsumeMultiplexer, Error, MessageProperties,
    PublishResult, ReplayConfig, ReplaySource, Replayer,
};
use tokio::sync::mpsc;

fn order_properties() -> MessageProperties {
    let mut headers = BTreeMap::new();
    headers.insert("tenant".to_string(), "eu-1".to_string());
    MessageProperties {
        content_type: Some("application/json".to_string()),
        content_encoding: Some("UTF-8".to_string()),
        delivery_mode: Some(2),
        priority: Some(4),
        correlation_id: Some("corr-9".to_string()),
        message_id: Some("order-1".to_string()),
        timestamp: Some(1_700_000_000),
        kind: Some("order".to_string()),
        app_id: Some("shop".to_string()),
        headers,
        ..Default::default()
    }
}

async fn replay(broker: &MemoryBroker, sources: Vec<ReplaySource>) -> Vec<PublishResult> {
    let (sender, queue) = mpsc::unbounded_channel();
    for source in sources {
        sender.send(source).unwrap();
    }
    drop(sender);

    let mut results = Replayer::new(
        Arc::new(broker.clone()),
        ReplayConfig::new("amqp://memory"),
    )
    .spawn(queue);
    let mut collected = Vec::new();
    while let Some(result) = results.recv().await {
        collected.push(result);
    }
    collected
}

#[tokio::test]
async fn dumped_message_replays_to_its_origin() {
    let broker = MemoryBroker::new();
    broker.declare("order-q");
    let bindings = BindingSet::parse(["orders/order-q/order.created"]).unwrap();

    // Binding happens during setup, so route once the first session exists.
    let mut session = ConsumeMultiplexer::new(Arc::new(broker.clone()))
        .start("amqp://memory", &bindings, ConsumeMode::Drain)
        .await
        .unwrap();
    while session.next().await.is_some() {}
    session.finish().await.unwrap();

    let routed =
        broker.route_message("orders", "order.created", order_properties(), "{\"id\":1}");
    assert_eq!(routed, 1);

    let dir = tempfile::tempdir().unwrap();
    let mut session = ConsumeMultiplexer::new(Arc::new(broker.clone()))
        .start("amqp://memory", &bindings, ConsumeMode::Drain)
        .await
        .unwrap();
    let mut written = Vec::new();
    while let Some(event) = session.next().await {
        if let ConsumeEvent::Delivery(delivery) = event {
            written.push(dump::write_delivery(dir.path(), &delivery, true).await.unwrap());
            delivery.ack().await.unwrap();
        }
    }
    session.finish().await.unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(broker.queue_len("order-q"), 0);

    let results = replay(&broker, vec![ReplaySource::File(written[0].clone())]).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success(), "{}", results[0]);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "orders");
    assert_eq!(published[0].routing_key, "order.created");
    assert!(published[0].flags.mandatory);
    assert_eq!(published[0].message.properties, order_properties());
    assert_eq!(published[0].message.body, b"{\"id\":1}");
    assert_eq!(broker.queue_len("order-q"), 1);
}

#[tokio::test]
async fn stdin_lines_replay_in_order() {
    let broker = MemoryBroker::new();
    broker.declare("q");
    for body in ["first", "second"] {
        broker.push_message("q", order_properties(), body);
    }

    let bindings = BindingSet::parse(["/q/"]).unwrap();
    let mut session = ConsumeMultiplexer::new(Arc::new(broker.clone()))
        .start("amqp://memory", &bindings, ConsumeMode::Drain)
        .await
        .unwrap();
    let mut lines = Vec::new();
    while let Some(event) = session.next().await {
        if let ConsumeEvent::Delivery(delivery) = event {
            lines.push(DumpEnvelope::from_delivery(&delivery).to_json(false).unwrap());
            delivery.ack().await.unwrap();
        }
    }
    session.finish().await.unwrap();

    let sources = lines
        .into_iter()
        .enumerate()
        .map(|(i, text)| ReplaySource::Line { number: i + 1, text })
        .collect();
    let results = replay(&broker, sources).await;
    assert!(results.iter().all(|r| r.is_success()));

    let published = broker.published();
    let bodies: Vec<&[u8]> = published.iter().map(|p| p.message.body.as_slice()).collect();
    assert_eq!(bodies, vec![b"first".as_slice(), b"second".as_slice()]);
    assert!(published.iter().all(|p| p.exchange.is_empty() && p.routing_key == "q"));
    assert_eq!(broker.queue_len("q"), 2);
}

#[tokio::test]
async fn bad_entries_are_skipped() {
    let broker = MemoryBroker::new();
    let good = DumpEnvelope {
        exchange: "orders",
        routing_key: "order.created",
        delivery_tag: 1,
        redelivered: false,
        properties: &MessageProperties::default(),
        body_as_string: "ok".to_string(),
    }
    .to_json(false)
    .unwrap();

    let sources = vec![
        ReplaySource::Line {
            number: 1,
            text: "not json".to_string(),
        },
        ReplaySource::File("/nonexistent/message.json".into()),
        ReplaySource::Line {
            number: 3,
            text: good,
        },
    ];
    let results = replay(&broker, sources).await;

    assert_eq!(results.len(), 3);
    assert!(matches!(results[0].error, Some(Error::Envelope(_))));
    assert_eq!(results[0].target, "stdin:1");
    assert!(matches!(results[1].error, Some(Error::Io(_))));
    assert!(results[2].is_success());
    assert!(results.iter().all(|r| !r.fatal));
    assert_eq!(broker.published().len(), 1);
}
