//! Distributed subscription map: address -> the set of nodes with a local handler for it.
//!
//! This is the piece a [`crate::cluster::ClusterManager`] backend is really standing in front
//! of: in a real cluster it would be replicated (gossiped, or backed by a coordination
//! service); [`LocalSubscriptionMap`] is the in-memory reference implementation used for
//! single-node operation and for same-process multi-node tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::node::NodeID;

/// A small, fairly-chosen collection of values.
///
/// Mirrors the self-healing round-robin cursor used by [`crate::registry::HandlerRegistry`]:
/// the cursor is taken modulo the current length, so it never needs repairing after a remove.
#[derive(Debug, Default)]
pub struct ChoosableIterable<V> {
    items: Vec<V>,
    cursor: AtomicUsize,
}

impl<V: Clone + PartialEq> ChoosableIterable<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn add(&mut self, value: V) {
        if !self.items.contains(&value) {
            self.items.push(value);
        }
    }

    /// Returns `true` if `value` was present and has been removed.
    pub fn remove(&mut self, value: &V) -> bool {
        match self.items.iter().position(|v| v == value) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn all(&self) -> Vec<V> {
        self.items.clone()
    }

    /// Pick the next value in round-robin order.
    #[must_use]
    pub fn choose(&self) -> Option<V> {
        if self.items.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.items.len();
        Some(self.items[idx].clone())
    }
}

/// A replicated multi-map from address to the nodes subscribed under it.
///
/// Implementations may be backed by anything from a process-local table to a gossiped CRDT; the
/// bus only ever needs the operations below. All methods are async so that a networked
/// implementation can make remote calls without blocking the caller's executor thread.
#[async_trait::async_trait]
pub trait AsyncMultiMap: Send + Sync {
    /// Register `node` as a subscriber of `address`.
    async fn add(&self, address: &str, node: NodeID);

    /// Remove `node` as a subscriber of `address`.
    async fn remove(&self, address: &str, node: NodeID);

    /// Remove `node` from every address it is subscribed to (used on peer disconnect).
    async fn remove_node_everywhere(&self, node: &NodeID);

    /// Fetch the current subscriber set for `address`, or `None` if nobody is subscribed.
    async fn get(&self, address: &str) -> Option<Arc<ChoosableIterable<NodeID>>>;
}

/// In-memory [`AsyncMultiMap`] backed by a [`DashMap`] of [`ChoosableIterable`] buckets.
///
/// Suitable for single-node operation (where it is simply never asked about any node but
/// `self`) and for wiring multiple in-process [`crate::cluster::ClusterManager`] instances
/// together in tests via a shared `Arc<LocalSubscriptionMap>`.
#[derive(Default)]
pub struct LocalSubscriptionMap {
    buckets: DashMap<String, Arc<RwLock<ChoosableIterable<NodeID>>>>,
}

impl LocalSubscriptionMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl AsyncMultiMap for LocalSubscriptionMap {
    async fn add(&self, address: &str, node: NodeID) {
        let bucket = self
            .buckets
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ChoosableIterable::new())));
        bucket.write().add(node);
    }

    async fn remove(&self, address: &str, node: NodeID) {
        let Some(bucket) = self.buckets.get(address) else {
            return;
        };
        let now_empty = {
            let mut guard = bucket.write();
            guard.remove(&node);
            guard.is_empty()
        };
        drop(bucket);
        if now_empty {
            self.buckets.remove_if(address, |_, b| b.read().is_empty());
        }
    }

    async fn remove_node_everywhere(&self, node: &NodeID) {
        let addresses: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            self.remove(&address, node.clone()).await;
        }
    }

    async fn get(&self, address: &str) -> Option<Arc<ChoosableIterable<NodeID>>> {
        let bucket = self.buckets.get(address)?;
        let snapshot = bucket.read();
        if snapshot.is_empty() {
            return None;
        }
        Some(Arc::new(ChoosableIterable {
            items: snapshot.all(),
            cursor: AtomicUsize::new(0),
        }))
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

    /// Polls a future to completion on the current thread with a no-op waker. The futures under
    /// test here never actually yield pending (everything is backed by in-memory locks), so this
    /// never spins more than once.
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

    fn node(port: u16) -> NodeID {
        NodeID::new("127.0.0.1", port)
    }

    #[test]
    fn choosable_iterable_round_robins_and_dedups() {
        let mut list = ChoosableIterable::new();
        list.add(1);
        list.add(2);
        list.add(1); // duplicate, ignored
        assert_eq!(list.len(), 2);

        assert_eq!(list.choose(), Some(1));
        assert_eq!(list.choose(), Some(2));
        assert_eq!(list.choose(), Some(1));
    }

    #[test]
    fn local_map_add_get_remove() {
        block_on(async {
            let map = LocalSubscriptionMap::new();
            map.add("news.sports", node(9001)).await;
            map.add("news.sports", node(9002)).await;

            let subs = map.get("news.sports").await.unwrap();
            assert_eq!(subs.len(), 2);

            map.remove("news.sports", node(9001)).await;
            let subs = map.get("news.sports").await.unwrap();
            assert_eq!(subs.all(), vec![node(9002)]);

            map.remove("news.sports", node(9002)).await;
            assert!(map.get("news.sports").await.is_none());
        });
    }

    #[test]
    fn remove_node_everywhere_clears_all_addresses() {
        block_on(async {
            let map = LocalSubscriptionMap::new();
            map.add("a", node(9001)).await;
            map.add("b", node(9001)).await;
            map.add("b", node(9002)).await;

            map.remove_node_everywhere(&node(9001)).await;

            assert!(map.get("a").await.is_none());
            let b = map.get("b").await.unwrap();
            assert_eq!(b.all(), vec![node(9002)]);
        });
    }

    #[test]
    fn unknown_address_is_none() {
        block_on(async {
            let map = LocalSubscriptionMap::new();
            assert!(map.get("nothing").await.is_none());
        });
    }
}
