//! A peer that disappears mid-connection (crashes, or is simply unplugged) is detected by the
//! ping/pong liveness check and evicted from the subscription map, so a subsequent send surfaces
//! `NoHandlers` instead of hanging.
//!
//! The "peer" here is a bare TCP listener rather than a second `EventBus`, so the test controls
//! exactly when it stops responding without racing a second bus's own shutdown path.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use compio::buf::BufResult;
use compio::io::AsyncReadExt;
use compio::net::TcpListener;

use netbus::{BusOptions, EventBus};
use netbus_core::{
    AsyncMultiMap, Body, BusError, ClusterManager, LocalClusterManager, LocalSubscriptionMap,
    NodeID,
};

async fn read_one_frame(stream: &mut compio::net::TcpStream) -> Bytes {
    let len_buf = vec![0u8; 4];
    let BufResult(res, len_buf) = stream.read_exact(len_buf).await;
    res.unwrap();
    let len = (&len_buf[..]).get_u32() as usize;
    let body_buf = vec![0u8; len];
    let BufResult(res, body_buf) = stream.read_exact(body_buf).await;
    res.unwrap();
    Bytes::from(body_buf)
}

#[compio::test]
async fn dead_peer_is_evicted_and_subsequent_sends_see_no_handlers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_peer = NodeID::from(listener.local_addr().unwrap());

    let subs = Arc::new(LocalSubscriptionMap::new());
    let bus = EventBus::start_clustered(
        BusOptions::default()
            .with_ping_interval(Duration::from_millis(30))
            .with_pong_timeout(Duration::from_millis(30)),
        {
            let subs = subs.clone();
            move |node| Arc::new(LocalClusterManager::joining(node, subs)) as Arc<dyn ClusterManager>
        },
    )
    .await
    .unwrap();

    // Make the bus believe `fake_peer` is the sole subscriber for "peer.echo", without a real
    // `EventBus` on the other end.
    subs.add("peer.echo", fake_peer.clone()).await;

    let accept = compio::runtime::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_one_frame(&mut stream).await;
        // Crash: drop the socket without replying or closing gracefully.
        drop(stream);
    });

    let (tx, rx) = flume::bounded(1);
    bus.send_with_timeout(
        "peer.echo",
        Body::Str(Arc::from("ping")),
        Duration::from_millis(150),
        Some(move |outcome| {
            let _ = tx.send(outcome);
        }),
    )
    .await;
    assert!(matches!(rx.recv_async().await.unwrap(), Err(BusError::Timeout)));
    accept.await;

    // Give the pool's liveness loop time to observe the closed connection and evict the peer.
    compio::time::sleep(Duration::from_millis(300)).await;

    let (tx2, rx2) = flume::bounded(1);
    bus.send_with_timeout(
        "peer.echo",
        Body::Str(Arc::from("ping-again")),
        Duration::from_millis(150),
        Some(move |outcome| {
            let _ = tx2.send(outcome);
        }),
    )
    .await;
    assert!(matches!(rx2.recv_async().await.unwrap(), Err(BusError::NoHandlers)));

    bus.close().await;
}
