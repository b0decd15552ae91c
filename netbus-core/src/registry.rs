//! Handler Registry: address -> the set of handlers locally registered against it.
//!
//! `send` picks one handler per delivery with a self-healing round-robin cursor, the same
//! scheme used for peer selection in load-balanced routing: a cursor advances modulo the
//! current bucket length, so entries removed out from under an in-flight pick are simply
//! skipped rather than requiring a separate repair pass.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::context::Context;

/// A single handler registration.
///
/// `id` is a process-local, monotonically increasing handle used to unregister this exact
/// registration later without requiring the handler closure itself to be comparable.
pub struct HandlerHolder {
    pub id: u64,
    pub address: String,
    pub context: Arc<dyn Context>,
    /// `true` for handlers registered via `register_local_handler`, which only ever receive
    /// deliveries whose body is carried as [`crate::message::Body::Local`] and so must never be
    /// selected as the target of a clustered or wire-crossing delivery.
    pub local_only: bool,
    /// `true` for the one-shot handler a `send` allocates to receive its reply. Reply addresses
    /// are never advertised to the cluster (they're `local_only` too, for that purpose), but
    /// unlike an application's `register_local_handler` they must still accept a delivery that
    /// arrived over the wire, since that's precisely how a remote peer's reply comes back.
    pub is_reply: bool,
}

struct HandlersBucket {
    handlers: RwLock<Vec<Arc<HandlerHolder>>>,
    cursor: AtomicUsize,
}

impl HandlersBucket {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    fn push(&self, handler: Arc<HandlerHolder>) {
        self.handlers.write().push(handler);
    }

    fn remove(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.iter().position(|h| h.id == id) {
            Some(pos) => {
                handlers.remove(pos);
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Pick the next handler in round-robin order, skipping nothing: the cursor is taken
    /// modulo the bucket's current length, so a shrinking bucket can never index out of range.
    fn choose(&self) -> Option<Arc<HandlerHolder>> {
        let handlers = self.handlers.read();
        if handlers.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % handlers.len();
        Some(handlers[idx].clone())
    }

    fn iter(&self) -> Vec<Arc<HandlerHolder>> {
        self.handlers.read().clone()
    }
}

/// Address-indexed table of locally registered handlers.
///
/// One `HandlerRegistry` is shared by every component of a running bus (the dispatch engine,
/// the inbound server, and the public `EventBus` handle) so registration and lookup can happen
/// concurrently from many tasks without a global lock.
pub struct HandlerRegistry {
    buckets: DashMap<String, Arc<HandlersBucket>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new handler for `address`, returning the holder that identifies this
    /// specific registration (needed later to `unregister` it).
    pub fn register(
        &self,
        address: impl Into<String>,
        context: Arc<dyn Context>,
        local_only: bool,
        is_reply: bool,
    ) -> Arc<HandlerHolder> {
        let address = address.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let holder = Arc::new(HandlerHolder {
            id,
            address: address.clone(),
            context,
            local_only,
            is_reply,
        });

        let bucket = self
            .buckets
            .entry(address)
            .or_insert_with(|| Arc::new(HandlersBucket::new()));
        bucket.push(holder.clone());
        holder
    }

    /// Remove a specific handler registration. Returns `true` if it was present.
    ///
    /// An address bucket that becomes empty as a result is pruned from the map so that
    /// `has_handlers` and subscription advertisement both see the address disappear promptly.
    pub fn unregister(&self, address: &str, id: u64) -> bool {
        let Some(bucket) = self.buckets.get(address) else {
            return false;
        };
        let removed = bucket.remove(id);
        let now_empty = bucket.is_empty();
        drop(bucket);
        if now_empty {
            self.buckets.remove_if(address, |_, b| b.is_empty());
        }
        removed
    }

    /// Pick one handler for `address` using round-robin selection, or `None` if nothing is
    /// registered locally for it.
    #[must_use]
    pub fn choose(&self, address: &str) -> Option<Arc<HandlerHolder>> {
        self.buckets.get(address).and_then(|b| b.choose())
    }

    /// Every handler currently registered for `address`, in registration order. Used for
    /// `publish` fan-out, where every local handler must receive a copy.
    #[must_use]
    pub fn iterate(&self, address: &str) -> Vec<Arc<HandlerHolder>> {
        self.buckets
            .get(address)
            .map(|b| b.iter())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_handlers(&self, address: &str) -> bool {
        self.buckets.get(address).is_some_and(|b| !b.is_empty())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LaneContext;

    fn lane() -> Arc<dyn Context> {
        LaneContext::new(|_worker| {
            // Tests never actually deliver through the lane; dropping the worker future is
            // fine since nothing awaits its completion.
        })
    }

    #[test]
    fn register_then_choose_round_robins() {
        let registry = HandlerRegistry::new();
        let a = registry.register("addr.a", lane(), false, false);
        let b = registry.register("addr.a", lane(), false, false);

        let first = registry.choose("addr.a").unwrap();
        let second = registry.choose("addr.a").unwrap();
        let third = registry.choose("addr.a").unwrap();

        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert_eq!(third.id, a.id);
    }

    #[test]
    fn choose_on_unknown_address_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.choose("nothing.here").is_none());
    }

    #[test]
    fn unregister_removes_and_prunes_empty_bucket() {
        let registry = HandlerRegistry::new();
        let holder = registry.register("addr.b", lane(), false, false);
        assert!(registry.has_handlers("addr.b"));

        assert!(registry.unregister("addr.b", holder.id));
        assert!(!registry.has_handlers("addr.b"));
        assert!(registry.choose("addr.b").is_none());
    }

    #[test]
    fn unregister_unknown_id_returns_false() {
        let registry = HandlerRegistry::new();
        registry.register("addr.c", lane(), false, false);
        assert!(!registry.unregister("addr.c", 999_999));
    }

    #[test]
    fn round_robin_survives_mid_sequence_removal() {
        let registry = HandlerRegistry::new();
        let a = registry.register("addr.d", lane(), false, false);
        let b = registry.register("addr.d", lane(), false, false);
        let c = registry.register("addr.d", lane(), false, false);

        assert_eq!(registry.choose("addr.d").unwrap().id, a.id);
        registry.unregister("addr.d", b.id);
        // cursor now points at an index that used to be `c`'s slot before the removal shifted
        // it down; choosing should still only ever yield registered ids, never panic.
        let next = registry.choose("addr.d").unwrap();
        assert!(next.id == a.id || next.id == c.id);
    }

    #[test]
    fn iterate_returns_all_handlers_in_registration_order() {
        let registry = HandlerRegistry::new();
        let a = registry.register("addr.e", lane(), false, false);
        let b = registry.register("addr.e", lane(), false, false);

        let all = registry.iterate("addr.e");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a.id);
        assert_eq!(all[1].id, b.id);
    }
}
