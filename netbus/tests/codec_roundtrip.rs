//! Codec round trip: a value encoded through a registered [`MessageCodec`] arrives at the
//! receiving handler already decoded back into its original type, both for local delivery and
//! for a `Body::Object` that actually crossed the wire between two nodes.

use std::sync::Arc;
use std::time::Duration;

use netbus::{BusOptions, EventBus};
use netbus_core::{Body, ClusterManager, JsonCodec, LocalClusterManager, LocalSubscriptionMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Ping {
    seq: u32,
}

async fn start_joined(subs: Arc<LocalSubscriptionMap>) -> EventBus {
    EventBus::start_clustered(BusOptions::default(), move |node| {
        Arc::new(LocalClusterManager::joining(node, subs)) as Arc<dyn ClusterManager>
    })
    .await
    .unwrap()
}

#[compio::test]
async fn local_handler_receives_the_decoded_value() {
    let bus = EventBus::start(BusOptions::default()).await.unwrap();
    bus.register_codec(Arc::new(JsonCodec::<Ping>::new("Ping")));

    bus.register_handler("ping", |msg, reply| {
        let Body::Local(value) = &msg.body else {
            panic!("expected a codec-decoded Local body, got {:?}", msg.body);
        };
        let ping: &Ping = value.downcast_ref().expect("decoded value should be a Ping");
        reply.reply(Body::Bool(ping.seq == 7));
    })
    .await;

    let encoded = bus.encode("Ping", Ping { seq: 7 }).unwrap();
    assert!(
        matches!(encoded, Body::Object { .. }),
        "a registered codec must produce a wire-encodable Object body"
    );

    let (tx, rx) = flume::bounded(1);
    bus.send(
        "ping",
        encoded,
        Some(move |outcome| {
            let _ = tx.send(outcome);
        }),
    )
    .await;

    match rx.recv_async().await.unwrap() {
        Ok(Body::Bool(true)) => {}
        other => panic!("expected Ok(Body::Bool(true)), got {other:?}"),
    }

    bus.close().await;
}

#[compio::test]
async fn codec_encoded_body_decodes_after_crossing_the_wire() {
    let subs = Arc::new(LocalSubscriptionMap::new());
    let node_a = start_joined(subs.clone()).await;
    let node_b = start_joined(subs.clone()).await;

    // Only the receiving node needs the codec registered: encoding just needs to know the body
    // is wire-encodable, decoding is where the registered type actually matters.
    node_a.register_codec(Arc::new(JsonCodec::<Ping>::new("Ping")));
    node_b.register_codec(Arc::new(JsonCodec::<Ping>::new("Ping")));

    let registration = node_a
        .register_handler("a.ping", |msg, reply| {
            let Body::Local(value) = &msg.body else {
                panic!("expected a codec-decoded Local body, got {:?}", msg.body);
            };
            let ping: &Ping = value.downcast_ref().expect("decoded value should be a Ping");
            reply.reply(Body::Bool(ping.seq == 42));
        })
        .await;
    let (ready_tx, ready_rx) = flume::bounded(1);
    registration.readiness(move || {
        let _ = ready_tx.send(());
    });
    ready_rx.recv_async().await.unwrap();

    let encoded = node_b.encode("Ping", Ping { seq: 42 }).unwrap();
    let (tx, rx) = flume::bounded(1);
    node_b
        .send_with_timeout(
            "a.ping",
            encoded,
            Duration::from_millis(1000),
            Some(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .await;

    match rx.recv_async().await.unwrap() {
        Ok(Body::Bool(true)) => {}
        other => panic!("expected Ok(Body::Bool(true)), got {other:?}"),
    }

    node_a.close().await;
    node_b.close().await;
}
