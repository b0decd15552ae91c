//! Two-node send: node A registers a handler, node B sends to it over loopback TCP and gets a
//! reply back. Exercises the full remote-write -> inbound-decode -> local-delivery -> reply path.

use std::sync::Arc;
use std::time::Duration;

use netbus::{BusOptions, EventBus};
use netbus_core::{Body, ClusterManager, LocalClusterManager, LocalSubscriptionMap};

async fn start_joined(subs: Arc<LocalSubscriptionMap>) -> EventBus {
    EventBus::start_clustered(BusOptions::default(), move |node| {
        Arc::new(LocalClusterManager::joining(node, subs)) as Arc<dyn ClusterManager>
    })
    .await
    .unwrap()
}

#[compio::test]
async fn two_node_send_round_trips_a_reply() {
    let subs = Arc::new(LocalSubscriptionMap::new());
    let node_a = start_joined(subs.clone()).await;
    let node_b = start_joined(subs.clone()).await;

    let registration = node_a
        .register_handler("a.greet", |msg, reply| {
            reply.reply(msg.body);
        })
        .await;
    let (ready_tx, ready_rx) = flume::bounded(1);
    registration.readiness(move || {
        let _ = ready_tx.send(());
    });
    ready_rx.recv_async().await.unwrap();

    let (tx, rx) = flume::bounded(1);
    node_b
        .send_with_timeout(
            "a.greet",
            Body::Str(Arc::from("hello")),
            Duration::from_millis(1000),
            Some(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .await;

    match rx.recv_async().await.unwrap() {
        Ok(Body::Str(s)) => assert_eq!(&*s, "hello"),
        other => panic!("expected Ok(Body::Str(\"hello\")), got {other:?}"),
    }

    node_a.close().await;
    node_b.close().await;
}
