//! Dispatch Engine: turns a `send`/`publish` call into local delivery, a peer write, or a
//! reply-handler resolution, and turns an arriving [`Message`] into a scheduled invocation of
//! whichever local handler it is destined for.
//!
//! This is the one module that ties the protocol-agnostic pieces in `netbus-core` (handler
//! registry, subscription map, cluster manager, wire codec) to the transport (`ConnectionPool`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use netbus_core::{
    encode_frame, AsyncMultiMap, Body, BusError, ChoosableIterable, ClusterManager, CodecRegistry,
    Context, Frame, HandlerHolder, HandlerRegistry, LaneContext, Message, NodeID, Result,
};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tracing::warn;

use crate::pool::ConnectionPool;
use crate::reply::ReplyContext;
use crate::Registration;

/// Reserved codec type name used to carry a `NoHandlers`/`RecipientFailure` outcome back to a
/// reply handler. Never registered in, or looked up from, the application-facing codec registry
/// — `Dispatcher` recognizes it before a codec lookup would ever happen.
const FAILURE_TYPE_NAME: &str = "netbus.failure";

pub(crate) fn failure_body(kind: &str, code: i32, reason: &str) -> Body {
    let payload = serde_json::json!({ "kind": kind, "code": code, "reason": reason });
    Body::Object {
        type_name: Arc::from(FAILURE_TYPE_NAME),
        payload: Bytes::from(serde_json::to_vec(&payload).unwrap_or_default()),
    }
}

fn decode_failure(body: &Body) -> Option<BusError> {
    let Body::Object { type_name, payload } = body else {
        return None;
    };
    if &**type_name != FAILURE_TYPE_NAME {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    match value.get("kind").and_then(serde_json::Value::as_str) {
        Some("no_handlers") => Some(BusError::NoHandlers),
        Some("recipient_failure") => Some(BusError::RecipientFailure {
            code: value.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0) as i32,
            reason: value
                .get("reason")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}

/// One-shot callback for a reply handler: fires exactly once, with the reply body or the reason
/// it never arrived.
pub type ReplyCallback = dyn FnOnce(Result<Body>) + Send;

/// What a given handler-registry entry actually does when chosen for delivery.
enum HandlerEntry {
    /// An application handler registered via `register_handler`/`register_local_handler`.
    App(Arc<dyn Fn(Message, ReplyContext) + Send + Sync>),
    /// A reply handler awaiting exactly one delivery (or a timeout/no-handlers resolution).
    Reply(SyncMutex<Option<Box<ReplyCallback>>>),
}

fn new_lane() -> Arc<dyn Context> {
    LaneContext::new(|worker| {
        compio::runtime::spawn(worker).detach();
    })
}

/// Ties the handler registry, subscription map, cluster manager, and connection pool together.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    codecs: Arc<CodecRegistry>,
    cluster: Option<Arc<dyn ClusterManager>>,
    pool: Option<Arc<ConnectionPool>>,
    self_node: NodeID,
    handler_fns: DashMap<u64, HandlerEntry>,
    reply_counter: AtomicU64,
    default_reply_timeout: RwLock<Duration>,
    closed: AtomicBool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        codecs: Arc<CodecRegistry>,
        cluster: Option<Arc<dyn ClusterManager>>,
        pool: Option<Arc<ConnectionPool>>,
        self_node: NodeID,
        default_reply_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            codecs,
            cluster,
            pool,
            self_node,
            handler_fns: DashMap::new(),
            reply_counter: AtomicU64::new(1),
            default_reply_timeout: RwLock::new(default_reply_timeout),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.cluster.is_some()
    }

    #[must_use]
    pub fn self_node(&self) -> &NodeID {
        &self.self_node
    }

    #[must_use]
    pub fn default_reply_timeout(&self) -> Duration {
        *self.default_reply_timeout.read()
    }

    pub fn set_default_reply_timeout(&self, timeout: Duration) {
        *self.default_reply_timeout.write() = timeout;
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Registers an application handler and, if it is the first (non-local-only) handler on
    /// `address` in a clustered bus, kicks off cluster announcement in the background.
    pub async fn register_handler(
        self: &Arc<Self>,
        address: impl Into<String>,
        local_only: bool,
        handler: Arc<dyn Fn(Message, ReplyContext) + Send + Sync>,
    ) -> Registration {
        let address = address.into();
        let holder = self.registry.register(address.clone(), new_lane(), local_only, false);
        self.handler_fns.insert(holder.id, HandlerEntry::App(handler));

        let is_first = self.registry.iterate(&address).len() == 1;
        let ready_rx = if is_first && !local_only {
            self.cluster.clone().map(|cluster| {
                let (tx, rx) = flume::bounded(1);
                let address = address.clone();
                compio::runtime::spawn(async move {
                    cluster.announce(&address).await;
                    let _ = tx.send(());
                })
                .detach();
                rx
            })
        } else {
            None
        };

        Registration::new(address, holder.id, self.clone(), ready_rx)
    }

    /// Removes a specific handler registration, withdrawing the address from the cluster's
    /// subscription map if that was the last handler for it.
    pub async fn unregister_handler(&self, address: &str, id: u64) {
        self.handler_fns.remove(&id);
        self.registry.unregister(address, id);
        if !self.registry.has_handlers(address) {
            if let Some(cluster) = &self.cluster {
                cluster.withdraw(address).await;
            }
        }
    }

    /// `sendOrPub`: the entry point for every `send`/`publish`/reply.
    pub async fn send_or_pub(
        self: &Arc<Self>,
        reply_dest: Option<NodeID>,
        mut msg: Message,
        reply_handler: Option<Box<ReplyCallback>>,
        timeout: Duration,
    ) {
        if self.closed.load(Ordering::Acquire) {
            if let Some(cb) = reply_handler {
                cb(Err(BusError::Closed));
            }
            return;
        }

        if let Some(cb) = reply_handler {
            let reply_address = if self.is_clustered() {
                uuid::Uuid::new_v4().to_string()
            } else {
                format!("netbus.reply.{}", self.reply_counter.fetch_add(1, Ordering::Relaxed))
            };
            let holder = self.registry.register(reply_address.clone(), new_lane(), true, true);
            self.handler_fns
                .insert(holder.id, HandlerEntry::Reply(SyncMutex::new(Some(cb))));
            msg.reply_address = Some(reply_address.clone());
            msg.sender = Some(self.self_node.clone());

            if !timeout.is_zero() {
                let dispatcher = self.clone();
                compio::runtime::spawn(async move {
                    compio::time::sleep(timeout).await;
                    dispatcher.resolve_reply_locally(&reply_address, Err(BusError::Timeout));
                })
                .detach();
            }
        }

        if let Some(dest) = reply_dest {
            if dest == self.self_node {
                self.receive_message(msg, false).await;
            } else if let Some(pool) = &self.pool {
                self.remote_write(pool, &dest, msg);
            }
            return;
        }

        if let Some(cluster) = &self.cluster {
            match cluster.subs().get(&msg.address).await {
                Some(set) => self.send_to_subs(&set, msg).await,
                None => {
                    if let Some(reply_address) = msg.reply_address.clone() {
                        self.resolve_reply_locally(&reply_address, Err(BusError::NoHandlers));
                    }
                }
            }
            return;
        }

        self.receive_message(msg, false).await;
    }

    async fn send_to_subs(self: &Arc<Self>, set: &ChoosableIterable<NodeID>, msg: Message) {
        let Some(pool) = self.pool.clone() else {
            self.receive_message(msg, false).await;
            return;
        };

        if msg.send {
            let Some(node) = set.choose() else {
                warn!(address = %msg.address, "subscription set emptied before choose()");
                return;
            };
            if node == self.self_node {
                self.receive_message(msg, false).await;
            } else {
                self.remote_write(&pool, &node, msg);
            }
            return;
        }

        for node in set.all() {
            if node == self.self_node {
                self.receive_message(msg.clone(), false).await;
            } else {
                self.remote_write(&pool, &node, msg.clone());
            }
        }
    }

    fn remote_write(&self, pool: &Arc<ConnectionPool>, peer: &NodeID, msg: Message) {
        if !msg.body.is_wire_encodable() {
            warn!(address = %msg.address, peer = %peer, "dropping local-only body addressed to a remote node");
            return;
        }
        match encode_frame(&Frame::Message(msg)) {
            Ok(frame) => pool.write_to(peer, frame),
            Err(e) => warn!(peer = %peer, error = %e, "failed to encode outbound message"),
        }
    }

    /// `receiveMessage`: local delivery of a message that has already reached this node, whether
    /// by direct self-targeting, by `sendToSubs` picking self, or by arriving off the wire.
    pub async fn receive_message(self: &Arc<Self>, msg: Message, from_wire: bool) {
        if msg.send {
            match self.choose_excluding_local_only(&msg.address, from_wire) {
                Some(holder) => self.deliver_one(holder, msg, from_wire),
                None => self.handle_no_handlers(msg, from_wire),
            }
        } else {
            let holders: Vec<Arc<HandlerHolder>> = self
                .registry
                .iterate(&msg.address)
                .into_iter()
                .filter(|h| !(from_wire && h.local_only && !h.is_reply))
                .collect();
            if holders.is_empty() {
                self.handle_no_handlers(msg, from_wire);
            } else {
                for holder in holders {
                    self.deliver_one(holder.clone(), msg.clone(), from_wire);
                }
            }
        }
    }

    /// Picks one holder with `choose`, retrying (bounded by bucket size) when the round-robin
    /// cursor lands on a `local_only` holder for a message that crossed the wire — those must
    /// never be selected as the target of a clustered or wire-crossing delivery. Reply handlers
    /// are `local_only` too (never advertised to the cluster) but are exempt from this skip:
    /// a remote peer's reply is itself a wire-crossing delivery to one.
    fn choose_excluding_local_only(&self, address: &str, from_wire: bool) -> Option<Arc<HandlerHolder>> {
        if !from_wire {
            return self.registry.choose(address);
        }
        let attempts = self.registry.iterate(address).len().max(1);
        for _ in 0..attempts {
            match self.registry.choose(address) {
                Some(h) if h.local_only && !h.is_reply => continue,
                other => return other,
            }
        }
        None
    }

    fn deliver_one(self: &Arc<Self>, holder: Arc<HandlerHolder>, msg: Message, from_wire: bool) {
        let dispatcher = self.clone();
        holder.context.spawn(Box::pin(async move {
            dispatcher.invoke_holder(holder, msg, from_wire).await;
        }));
    }

    async fn invoke_holder(self: Arc<Self>, holder: Arc<HandlerHolder>, msg: Message, _from_wire: bool) {
        // The holder may have been unregistered between `deliver_one` scheduling this task and
        // the context actually running it.
        let Some(entry) = self.handler_fns.get(&holder.id) else {
            return;
        };
        match &*entry {
            HandlerEntry::App(handler) => {
                let handler = handler.clone();
                drop(entry);
                let reply_ctx = ReplyContext::new(
                    self.clone(),
                    msg.reply_address.clone(),
                    msg.sender.clone(),
                );
                let msg = self.decode_object_body(msg, &holder.address);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(msg, reply_ctx)))
                    .is_err()
                {
                    tracing::error!(address = %holder.address, "handler panicked");
                }
            }
            HandlerEntry::Reply(_) => {
                drop(entry);
                let outcome = decode_failure(&msg.body).map_or_else(|| Ok(msg.body.clone()), Err);
                self.resolve_reply_locally(&holder.address, outcome);
            }
        }
    }

    /// If `msg.body` is a [`Body::Object`] with a codec registered for its `type_name`, decode it
    /// and hand the application handler a [`Body::Local`] wrapping the typed value instead of the
    /// raw bytes. A message whose type has no registered codec (or that fails to decode) is
    /// passed through unchanged — the handler still sees `type_name` and `payload` and can act on
    /// them itself.
    fn decode_object_body(&self, mut msg: Message, address: &str) -> Message {
        let Body::Object { type_name, payload } = &msg.body else {
            return msg;
        };
        let Some(codec) = self.codecs.get(type_name) else {
            return msg;
        };
        match codec.decode(payload.clone()) {
            Ok(decoded) => msg.body = Body::Local(Arc::from(decoded)),
            Err(e) => {
                warn!(address, type_name = %type_name, error = %e, "codec decode failed, delivering raw body");
            }
        }
        msg
    }

    fn handle_no_handlers(self: &Arc<Self>, msg: Message, from_wire: bool) {
        let Some(reply_address) = msg.reply_address.clone() else {
            return;
        };
        if from_wire {
            let Some(sender) = msg.sender.clone() else {
                return;
            };
            let dispatcher = self.clone();
            compio::runtime::spawn(async move {
                let reply = Message {
                    send: true,
                    address: reply_address,
                    reply_address: None,
                    sender: Some(dispatcher.self_node.clone()),
                    body: failure_body("no_handlers", 0, ""),
                };
                dispatcher.send_or_pub(Some(sender), reply, None, Duration::ZERO).await;
            })
            .detach();
        } else {
            self.resolve_reply_locally(&reply_address, Err(BusError::NoHandlers));
        }
    }

    /// Atomically resolves the reply handler registered at `reply_address`, if it is still
    /// present: whichever caller wins the race (a real reply, a timeout, or a no-handlers
    /// signal) is the only one whose outcome is delivered, by construction of
    /// `DashMap::remove`.
    fn resolve_reply_locally(&self, reply_address: &str, outcome: Result<Body>) {
        let Some(holder) = self.registry.choose(reply_address) else {
            return;
        };
        let Some((_, entry)) = self.handler_fns.remove(&holder.id) else {
            return;
        };
        self.registry.unregister(reply_address, holder.id);
        if let HandlerEntry::Reply(cell) = entry {
            if let Some(cb) = cell.lock().take() {
                cb(outcome);
            }
        }
    }
}
