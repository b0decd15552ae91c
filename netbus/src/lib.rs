//! netbus
//!
//! The public, runtime-wired half of the netbus distributed event bus: the TCP connection pool,
//! the inbound frame server, and the [`EventBus`] handle applications actually hold. The
//! protocol-agnostic kernel — node identity, the wire codec, the handler registry, the
//! subscription map, and the cluster-manager trait — lives in `netbus-core`; this crate supplies
//! the `compio`-backed transport and glues it all together.
//!
//! ```no_run
//! use netbus::{BusOptions, EventBus};
//! use netbus_core::Body;
//! use std::sync::Arc;
//!
//! # #[compio::main]
//! # async fn main() {
//! let bus = EventBus::start(BusOptions::default()).await.unwrap();
//!
//! bus.register_handler("a.greet", |msg, reply| {
//!     reply.reply(msg.body);
//! })
//! .await;
//!
//! let (tx, rx) = flume::bounded(1);
//! bus.send(
//!     "a.greet",
//!     Body::Str(Arc::from("hello")),
//!     Some(move |outcome| {
//!         let _ = tx.send(outcome);
//!     }),
//! )
//! .await;
//! assert!(rx.recv_async().await.unwrap().is_ok());
//!
//! bus.close().await;
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod dispatch;
mod io_bytes;
pub mod options;
mod pool;
mod reply;
mod server;
mod wire;

/// Development helpers (examples/benches/tests).
pub mod dev_tracing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;

use netbus_core::{
    Body, CodecRegistry, HandlerRegistry, LocalSubscriptionMap, Message, MessageCodec, Result,
};
pub use netbus_core::{AsyncMultiMap, BusError, ClusterManager, MembershipEvent, NodeID};

use dispatch::Dispatcher;
use pool::ConnectionPool;

pub use options::BusOptions;
pub use reply::ReplyContext;

/// A handle to one in-flight handler registration.
///
/// Returned by [`EventBus::register_handler`] and [`EventBus::register_local_handler`]. Dropping
/// it does **not** unregister the handler — call [`Registration::unregister`] explicitly, the
/// same way the teacher's socket handles require an explicit close.
pub struct Registration {
    address: String,
    id: u64,
    dispatcher: Arc<Dispatcher>,
    ready_rx: Option<flume::Receiver<()>>,
}

impl Registration {
    fn new(
        address: String,
        id: u64,
        dispatcher: Arc<Dispatcher>,
        ready_rx: Option<flume::Receiver<()>>,
    ) -> Self {
        Self {
            address,
            id,
            dispatcher,
            ready_rx,
        }
    }

    /// The address this registration was made against.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Invoke `callback` once this registration is visible to the rest of the cluster.
    ///
    /// Fires immediately if the registration never needed to propagate (non-clustered bus, a
    /// reply handler, a local-only handler, or a handler that wasn't first on its address).
    pub fn readiness<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.ready_rx.clone() {
            Some(rx) => {
                compio::runtime::spawn(async move {
                    let _ = rx.recv_async().await;
                    callback();
                })
                .detach();
            }
            None => callback(),
        }
    }

    /// Remove this registration. Withdraws the address from the cluster's subscription map if
    /// this was the last handler registered for it.
    pub async fn unregister(self) {
        self.dispatcher.unregister_handler(&self.address, self.id).await;
    }
}

/// A running event bus node: the local handler registry, the (optional) cluster manager, the
/// outbound connection pool, and the inbound TCP server, tied together by the dispatch engine.
pub struct EventBus {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<HandlerRegistry>,
    codecs: Arc<CodecRegistry>,
    cluster: Option<Arc<dyn ClusterManager>>,
    pool: Arc<ConnectionPool>,
    self_node: NodeID,
    accept_task: SyncMutex<Option<compio::runtime::Task<()>>>,
    closed: AtomicBool,
}

impl EventBus {
    /// Start a non-clustered bus: every `send`/`publish` resolves to local delivery only. The
    /// inbound TCP server still binds and can still exchange frames with a peer that dials it
    /// directly (e.g. to carry a reply back to whoever originated a message this node received),
    /// but no subscription map backs remote address discovery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Io`] if the bind address cannot be bound.
    pub async fn start(options: BusOptions) -> Result<Self> {
        let (listener, self_node) =
            server::bind(options.bind_addr, options.public_host.clone(), options.public_port)
                .await?;
        Self::finish_start(listener, self_node, None, options).await
    }

    /// Start a clustered bus. `build_cluster` receives this node's resolved [`NodeID`] (known
    /// only once the inbound listener has actually bound) and must return the
    /// [`ClusterManager`] this node joins — typically a [`LocalClusterManager`] sharing a
    /// [`LocalSubscriptionMap`] with other in-process nodes in tests, or a real coordination
    /// backend in production.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Io`] if the bind address cannot be bound.
    pub async fn start_clustered<F>(options: BusOptions, build_cluster: F) -> Result<Self>
    where
        F: FnOnce(NodeID) -> Arc<dyn ClusterManager>,
    {
        let (listener, self_node) =
            server::bind(options.bind_addr, options.public_host.clone(), options.public_port)
                .await?;
        let cluster = build_cluster(self_node.clone());
        Self::finish_start(listener, self_node, Some(cluster), options).await
    }

    async fn finish_start(
        listener: compio::net::TcpListener,
        self_node: NodeID,
        cluster: Option<Arc<dyn ClusterManager>>,
        options: BusOptions,
    ) -> Result<Self> {
        let subs: Arc<dyn AsyncMultiMap> = match &cluster {
            Some(c) => c.subs(),
            None => Arc::new(LocalSubscriptionMap::new()),
        };
        let pool = ConnectionPool::new(
            subs,
            self_node.clone(),
            options.ping_interval,
            options.pong_timeout,
            options.read_buffer_size,
            options.write_buffer_size,
        );
        let registry = Arc::new(HandlerRegistry::new());
        let codecs = Arc::new(CodecRegistry::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            codecs.clone(),
            cluster.clone(),
            Some(pool.clone()),
            self_node.clone(),
            options.default_reply_timeout,
        );
        let accept_task =
            compio::runtime::spawn(server::serve(listener, dispatcher.clone()));

        Ok(Self {
            dispatcher,
            registry,
            codecs,
            cluster,
            pool,
            self_node,
            accept_task: SyncMutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// This node's advertised identity.
    #[must_use]
    pub fn self_node(&self) -> &NodeID {
        &self.self_node
    }

    /// Whether this bus was started with a cluster manager (`start_clustered`) rather than
    /// `start`.
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.dispatcher.is_clustered()
    }

    /// Send `body` to one handler registered under `address`, anywhere reachable, and invoke
    /// `reply_handler` (if given) exactly once with the outcome. Uses
    /// [`Self::default_reply_timeout`] as the reply timeout.
    pub async fn send<F>(&self, address: impl Into<String>, body: Body, reply_handler: Option<F>)
    where
        F: FnOnce(Result<Body>) + Send + 'static,
    {
        let timeout = self.dispatcher.default_reply_timeout();
        self.send_with_timeout(address, body, timeout, reply_handler).await;
    }

    /// Like [`Self::send`], with an explicit reply `timeout` (`Duration::ZERO` means "wait
    /// indefinitely").
    pub async fn send_with_timeout<F>(
        &self,
        address: impl Into<String>,
        body: Body,
        timeout: Duration,
        reply_handler: Option<F>,
    ) where
        F: FnOnce(Result<Body>) + Send + 'static,
    {
        let msg = Message::new(true, address.into(), body);
        let callback: Option<Box<dyn FnOnce(Result<Body>) + Send>> =
            reply_handler.map(|f| Box::new(f) as Box<dyn FnOnce(Result<Body>) + Send>);
        self.dispatcher.send_or_pub(None, msg, callback, timeout).await;
    }

    /// Fan out `body` to every handler registered under `address`, locally and across the
    /// cluster. There is no reply path for a publish; replies sent from a publish's handlers are
    /// dropped (no reply address was ever allocated).
    pub async fn publish(&self, address: impl Into<String>, body: Body) {
        let msg = Message::new(false, address.into(), body);
        self.dispatcher.send_or_pub(None, msg, None, Duration::ZERO).await;
    }

    /// Register a handler for `address`. Propagates to the cluster's subscription map (if
    /// clustered) the moment this is the first handler registered for `address`.
    pub async fn register_handler<F>(&self, address: impl Into<String>, handler: F) -> Registration
    where
        F: Fn(Message, ReplyContext) + Send + Sync + 'static,
    {
        self.dispatcher
            .register_handler(address, false, Arc::new(handler))
            .await
    }

    /// Register a handler for `address` that never propagates to the cluster's subscription map
    /// and is never selected as the target of a delivery that crossed the wire — only a `send`
    /// or `publish` issued on this same node can reach it.
    pub async fn register_local_handler<F>(
        &self,
        address: impl Into<String>,
        handler: F,
    ) -> Registration
    where
        F: Fn(Message, ReplyContext) + Send + Sync + 'static,
    {
        self.dispatcher
            .register_handler(address, true, Arc::new(handler))
            .await
    }

    /// Install `codec`, replacing any codec previously registered under the same type name.
    pub fn register_codec(&self, codec: Arc<dyn MessageCodec>) {
        self.codecs.register(codec);
    }

    /// Remove the codec installed for `type_name`, if any.
    pub fn unregister_codec(&self, type_name: &str) {
        self.codecs.unregister(type_name);
    }

    /// Encode `value` as a [`Body::Object`] using the codec registered under `type_name`.
    ///
    /// In clustered mode a missing codec is a hard error — the send could cross the wire and
    /// there would be nothing on the receiving end able to decode it. In non-clustered mode a
    /// body with no registered codec is instead carried in-process by reference
    /// ([`Body::Local`]), since it can never leave this node.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CodecMissing`] in clustered mode when `type_name` has no registered
    /// codec, or whatever error the codec itself raises on encode failure.
    pub fn encode<T: Send + Sync + 'static>(&self, type_name: &str, value: T) -> Result<Body> {
        if !self.is_clustered() && self.codecs.get(type_name).is_none() {
            return Ok(Body::Local(Arc::new(value)));
        }
        let payload = self.codecs.encode(type_name, &value)?;
        Ok(Body::Object {
            type_name: Arc::from(type_name),
            payload,
        })
    }

    /// Decode a [`Body::Object`] back into `T` using the codec registered under its carried
    /// `type_name`.
    ///
    /// Application handlers registered with [`Self::register_handler`] never need to call this
    /// themselves: the dispatcher already runs this decode before invoking the handler, so
    /// `msg.body` arrives as a [`Body::Local`] wrapping the typed value whenever a codec is
    /// registered for it. This is for callers decoding a body obtained some other way — a reply
    /// outcome, or a body read back out of application storage.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Protocol`] if `body` is not a `Body::Object`, or if the decoded value
    /// does not downcast to `T`. Returns [`BusError::CodecMissing`] if no codec is registered for
    /// the body's `type_name`, or whatever error the codec raises on decode failure.
    pub fn try_decode<T: Send + Sync + 'static>(&self, body: &Body) -> Result<T> {
        let Body::Object { type_name, payload } = body else {
            return Err(BusError::protocol("body is not a codec-encoded Object"));
        };
        let decoded = self.codecs.decode(type_name, payload.clone())?;
        decoded
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| BusError::protocol("decoded value type mismatch"))
    }

    /// The reply timeout used by [`Self::send`] when no explicit timeout is given.
    #[must_use]
    pub fn default_reply_timeout(&self) -> Duration {
        self.dispatcher.default_reply_timeout()
    }

    /// Change the reply timeout used by [`Self::send`] when no explicit timeout is given.
    pub fn set_default_reply_timeout(&self, timeout: Duration) {
        self.dispatcher.set_default_reply_timeout(timeout);
    }

    /// Every address with at least one handler registered locally on this node.
    #[must_use]
    pub fn local_handler_count(&self, address: &str) -> usize {
        self.registry.iterate(address).len()
    }

    /// Gracefully shut down: stop accepting new connections, close every outbound connection,
    /// and leave the cluster (best-effort; triggers `NodeLeft` at peers that support it).
    /// Idempotent — calling `close` more than once is a no-op after the first call.
    ///
    /// In-flight deliveries scheduled before `close` was called may still run to completion; the
    /// crate does not provide a way to wait for them, matching the bus's no-delivery-guarantee
    /// stance on in-flight traffic during shutdown.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.mark_closed();
        // Dropping the un-detached accept task cancels the inbound accept loop.
        self.accept_task.lock().take();
        self.pool.close_all();
        if let Some(cluster) = &self.cluster {
            cluster.leave().await;
        }
    }
}
