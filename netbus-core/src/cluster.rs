//! Cluster membership: who else is out there, and how to reach them.
//!
//! [`ClusterManager`] is the seam a production deployment would fill with a real coordination
//! backend (gossip, a lock service, a managed discovery API); [`LocalClusterManager`] is the
//! reference implementation used for running single-node and for wiring several in-process
//! nodes together over a shared [`LocalSubscriptionMap`] in tests.

use std::fmt;
use std::sync::Arc;

use crate::node::NodeID;
use crate::subs::{AsyncMultiMap, LocalSubscriptionMap};

/// Cluster membership change, delivered to anyone watching via [`ClusterManager::membership`].
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A node joined the cluster.
    NodeAdded(NodeID),
    /// A node left the cluster, gracefully or by failure detection.
    NodeLeft(NodeID),
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeAdded(n) => write!(f, "node added: {n}"),
            Self::NodeLeft(n) => write!(f, "node left: {n}"),
        }
    }
}

/// A channel of cluster membership events, as returned by [`ClusterManager::membership`].
pub type MembershipMonitor = flume::Receiver<MembershipEvent>;

/// Abstracts over how a bus discovers peers and shares the distributed subscription state.
///
/// An implementation is responsible for: knowing this process's own [`NodeID`], exposing the
/// shared [`AsyncMultiMap`] of address subscriptions, and notifying callers when membership
/// changes so the connection pool can evict dead peers.
#[async_trait::async_trait]
pub trait ClusterManager: Send + Sync {
    /// This process's own advertised node identity.
    fn self_node(&self) -> &NodeID;

    /// The distributed address -> subscriber-nodes map backing `send`/`publish` routing.
    ///
    /// Returns an owned `Arc` (rather than `&dyn AsyncMultiMap`) so the connection pool, which
    /// outlives any single call into the cluster manager, can hold onto it directly.
    fn subs(&self) -> Arc<dyn AsyncMultiMap>;

    /// Announce that a handler was registered for `address` on this node, making it visible to
    /// other cluster members' `send`/`publish` calls.
    async fn announce(&self, address: &str) {
        self.subs().add(address, self.self_node().clone()).await;
    }

    /// Withdraw a previously announced address.
    async fn withdraw(&self, address: &str) {
        self.subs().remove(address, self.self_node().clone()).await;
    }

    /// Subscribe to membership events (node join/leave). Returns `None` for implementations
    /// that don't track remote membership (e.g. pure single-node operation).
    fn membership(&self) -> Option<MembershipMonitor> {
        None
    }

    /// Leave the cluster, best-effort. The default implementation does nothing; a production
    /// backend would deregister this node here so peers observe a `NodeLeft` event through
    /// their own membership stream. Called once from `EventBus::close`.
    async fn leave(&self) {}
}

/// Reference [`ClusterManager`]: either a lone node with nobody to discover, or one of several
/// in-process nodes sharing a [`LocalSubscriptionMap`] and notifying each other directly.
///
/// This is not a production coordination backend — there is no gossip, no failure detection,
/// and no network transport involved in membership itself. It exists so the rest of the bus can
/// be exercised, and tested in multi-node configurations, without a real cluster.
pub struct LocalClusterManager {
    self_node: NodeID,
    subs: Arc<LocalSubscriptionMap>,
    membership_tx: flume::Sender<MembershipEvent>,
    membership_rx: MembershipMonitor,
}

impl LocalClusterManager {
    /// A cluster manager for a node running entirely alone (no peers, ever).
    #[must_use]
    pub fn standalone(self_node: NodeID) -> Self {
        Self::joining(self_node, Arc::new(LocalSubscriptionMap::new()))
    }

    /// A cluster manager for `self_node`, sharing subscription state with other
    /// `LocalClusterManager`s constructed from the same `subs` map.
    ///
    /// Callers that want membership notifications across instances should broadcast
    /// [`MembershipEvent::NodeAdded`]/[`MembershipEvent::NodeLeft`] to each other's
    /// `membership_tx` themselves; this constructor only wires up each instance's own channel.
    #[must_use]
    pub fn joining(self_node: NodeID, subs: Arc<LocalSubscriptionMap>) -> Self {
        let (membership_tx, membership_rx) = flume::unbounded();
        Self {
            self_node,
            subs,
            membership_tx,
            membership_rx,
        }
    }

    /// Access the shared subscription map directly, e.g. to hand to another
    /// `LocalClusterManager` joining the same in-process cluster.
    #[must_use]
    pub fn shared_subs(&self) -> Arc<LocalSubscriptionMap> {
        self.subs.clone()
    }

    /// Publish a membership event to anyone watching this instance's monitor.
    pub fn notify_membership(&self, event: MembershipEvent) {
        let _ = self.membership_tx.send(event);
    }
}

#[async_trait::async_trait]
impl ClusterManager for LocalClusterManager {
    fn self_node(&self) -> &NodeID {
        &self.self_node
    }

    fn subs(&self) -> Arc<dyn AsyncMultiMap> {
        self.subs.clone()
    }

    fn membership(&self) -> Option<MembershipMonitor> {
        Some(self.membership_rx.clone())
    }

    async fn leave(&self) {
        self.notify_membership(MembershipEvent::NodeLeft(self.self_node.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::task::{Context as TaskContext, Poll, Wake, Waker};

    struct ParkWaker;
    impl Wake for ParkWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn block_on<F: Future>(fut: F) -> F::Output {
        let mut fut = Box::pin(fut);
        let waker = Waker::from(Arc::new(ParkWaker));
        let mut cx = TaskContext::from_waker(&waker);
        loop {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
        }
    }

    #[test]
    fn standalone_has_no_peers() {
        let mgr = LocalClusterManager::standalone(NodeID::new("127.0.0.1", 9000));
        block_on(async {
            mgr.announce("addr.a").await;
            let subs = mgr.subs().get("addr.a").await.unwrap();
            assert_eq!(subs.all(), vec![NodeID::new("127.0.0.1", 9000)]);
        });
    }

    #[test]
    fn joined_nodes_see_each_others_announcements() {
        let shared = Arc::new(LocalSubscriptionMap::new());
        let a = LocalClusterManager::joining(NodeID::new("127.0.0.1", 9000), shared.clone());
        let b = LocalClusterManager::joining(NodeID::new("127.0.0.1", 9001), shared);

        block_on(async {
            a.announce("addr.a").await;
            b.announce("addr.a").await;

            let subs = a.subs().get("addr.a").await.unwrap();
            assert_eq!(subs.len(), 2);

            a.withdraw("addr.a").await;
            let subs = b.subs().get("addr.a").await.unwrap();
            assert_eq!(subs.all(), vec![NodeID::new("127.0.0.1", 9001)]);
        });
    }

    #[test]
    fn membership_events_are_observable() {
        let mgr = LocalClusterManager::standalone(NodeID::new("127.0.0.1", 9000));
        let monitor = mgr.membership().unwrap();
        mgr.notify_membership(MembershipEvent::NodeAdded(NodeID::new("127.0.0.1", 9001)));
        let event = monitor.recv().unwrap();
        assert!(matches!(event, MembershipEvent::NodeAdded(_)));
    }
}
