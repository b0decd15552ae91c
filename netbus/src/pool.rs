//! Connection Pool: one outbound TCP connection per peer, created lazily and kept alive with a
//! ping/pong liveness check.
//!
//! Each [`ConnectionHolder`] owns its socket exclusively from a single dedicated task (spawned
//! the moment the holder is created), which multiplexes outbound writes, inbound liveness bytes,
//! and the ping/pong timers with `futures::select!` — the same runtime-agnostic multiplexing
//! idiom the teacher's `RouterHub` uses, rather than a busy-poll loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use compio::net::TcpStream;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use netbus_core::{encode_frame, AsyncMultiMap, BusError, Frame, NodeID};
use tracing::{debug, trace, warn};

use crate::wire;

/// Tick granularity for the per-connection ping/pong poll loop. Deliberately much finer than the
/// default 20s ping interval so tests can use short intervals without waiting a full tick.
const POLL_TICK: Duration = Duration::from_millis(20);

enum PoolCmd {
    Write(Bytes),
    Close,
}

/// A single outbound connection's state, as seen by the rest of the bus.
///
/// The socket itself lives entirely inside the task spawned by [`ConnectionPool::get_or_create`];
/// this struct is just the handle callers write through.
pub struct ConnectionHolder {
    id: u64,
    peer: NodeID,
    tx: flume::Sender<PoolCmd>,
    connected: AtomicBool,
}

impl ConnectionHolder {
    #[must_use]
    pub fn peer(&self) -> &NodeID {
        &self.peer
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Pool of outbound connections, keyed by peer [`NodeID`].
///
/// Exactly one [`ConnectionHolder`] exists per peer at a time; `connections.remove_if` with an
/// identity check is how a dying connection's own cleanup avoids racing a concurrent reconnect
/// that has already replaced it.
pub struct ConnectionPool {
    connections: DashMap<NodeID, Arc<ConnectionHolder>>,
    next_id: AtomicU64,
    subs: Arc<dyn AsyncMultiMap>,
    self_node: NodeID,
    ping_interval: Duration,
    pong_timeout: Duration,
    read_buffer_size: usize,
    write_buffer_size: usize,
}

impl ConnectionPool {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subs: Arc<dyn AsyncMultiMap>,
        self_node: NodeID,
        ping_interval: Duration,
        pong_timeout: Duration,
        read_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            subs,
            self_node,
            ping_interval,
            pong_timeout,
            read_buffer_size,
            write_buffer_size,
        })
    }

    /// Enqueue `frame` for delivery to `peer`, connecting lazily if there is no live connection
    /// yet. Never blocks the caller; delivery failures are logged and surfaced only as a dead
    /// connection the next send will transparently reconnect to.
    pub fn write_to(self: &Arc<Self>, peer: &NodeID, frame: Bytes) {
        let holder = self.get_or_create(peer);
        if holder.tx.send(PoolCmd::Write(frame.clone())).is_err() {
            // The holder's task already exited (its cleanup may not have run yet). Drop the
            // stale entry if it is still ours and create a fresh connection.
            self.connections
                .remove_if(peer, |_, h| Arc::ptr_eq(h, &holder));
            let holder = self.get_or_create(peer);
            let _ = holder.tx.send(PoolCmd::Write(frame));
        }
    }

    /// Close every outbound connection. Best-effort: queued writes that lose the race with
    /// shutdown are dropped, matching the bus's no-delivery-guarantee policy.
    pub fn close_all(&self) {
        for entry in &self.connections {
            let _ = entry.value().tx.send(PoolCmd::Close);
        }
    }

    fn get_or_create(self: &Arc<Self>, peer: &NodeID) -> Arc<ConnectionHolder> {
        match self.connections.entry(peer.clone()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = flume::unbounded();
                let holder = Arc::new(ConnectionHolder {
                    id,
                    peer: peer.clone(),
                    tx,
                    connected: AtomicBool::new(false),
                });
                e.insert(holder.clone());
                let pool = Arc::downgrade(self);
                let peer = peer.clone();
                let holder_for_task = holder.clone();
                let self_node = self.self_node.clone();
                let ping_interval = self.ping_interval;
                let pong_timeout = self.pong_timeout;
                let read_buffer_size = self.read_buffer_size;
                let write_buffer_size = self.write_buffer_size;
                compio::runtime::spawn(async move {
                    run_connection(
                        peer,
                        rx,
                        holder_for_task,
                        pool,
                        self_node,
                        ping_interval,
                        pong_timeout,
                        read_buffer_size,
                        write_buffer_size,
                    )
                    .await;
                })
                .detach();
                holder
            }
        }
    }

    /// `failure` is `None` for a clean shutdown (explicit `Close`, or the holder's own channel
    /// dropping). When it is `Some`, only a connection-level failure
    /// (`BusError::is_connection_error`) purges `peer` from the subscription map — a non-fatal
    /// classification slipping through here (there isn't one today, but `run_connection` only
    /// ever reports a failure once `is_recoverable` has already said no) would otherwise evict a
    /// peer's subscriptions over something that didn't actually sever the connection.
    async fn cleanup(&self, peer: &NodeID, holder: &Arc<ConnectionHolder>, failure: Option<&BusError>) {
        self.connections
            .remove_if(peer, |_, existing| Arc::ptr_eq(existing, holder));
        if failure.is_some_and(BusError::is_connection_error) {
            self.subs.remove_node_everywhere(peer).await;
        }
    }
}

async fn run_connection(
    peer: NodeID,
    rx: flume::Receiver<PoolCmd>,
    holder: Arc<ConnectionHolder>,
    pool: std::sync::Weak<ConnectionPool>,
    self_node: NodeID,
    ping_interval: Duration,
    pong_timeout: Duration,
    read_buffer_size: usize,
    write_buffer_size: usize,
) {
    let addr = match peer.to_socket_addr() {
        Ok(a) => a,
        Err(e) => {
            warn!(peer = %peer, error = %e, "cannot resolve peer address");
            if let Some(pool) = pool.upgrade() {
                pool.cleanup(&peer, &holder, None).await;
            }
            return;
        }
    };

    debug!(peer = %peer, "connecting");
    let mut stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer, error = %e, "connect failed");
            if let Some(pool) = pool.upgrade() {
                pool.cleanup(&peer, &holder, None).await;
            }
            return;
        }
    };
    holder.connected.store(true, Ordering::Release);
    debug!(peer = %peer, "connected");

    let mut next_ping = Instant::now() + ping_interval;
    let mut pong_deadline: Option<Instant> = None;
    let mut failure: Option<BusError> = None;

    'outer: loop {
        futures::select! {
            cmd = rx.recv_async().fuse() => {
                match cmd {
                    Ok(PoolCmd::Write(frame)) => {
                        if let Err(e) = wire::write_frame(&mut stream, frame, write_buffer_size).await {
                            warn!(peer = %peer, error = %e, "write failed");
                            let err = BusError::Io(e);
                            if !err.is_recoverable() {
                                failure = Some(err);
                                break 'outer;
                            }
                        }
                    }
                    Ok(PoolCmd::Close) | Err(_) => break 'outer,
                }
            }
            res = wire::read_liveness_byte(&mut stream, read_buffer_size).fuse() => {
                match res {
                    Ok(0) => {
                        debug!(peer = %peer, "peer closed connection");
                        failure = Some(BusError::Closed);
                        break 'outer;
                    }
                    Ok(_) => {
                        trace!(peer = %peer, "pong received");
                        pong_deadline = None;
                        next_ping = Instant::now() + ping_interval;
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "read failed");
                        let err = BusError::Io(e);
                        if !err.is_recoverable() {
                            failure = Some(err);
                            break 'outer;
                        }
                    }
                }
            }
            () = compio::time::sleep(POLL_TICK).fuse() => {
                let now = Instant::now();
                if pong_deadline.is_none() && now >= next_ping {
                    let frame = match encode_frame(&Frame::Ping { sender: self_node.clone() }) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "failed to encode ping");
                            continue;
                        }
                    };
                    if let Err(e) = wire::write_frame(&mut stream, frame, write_buffer_size).await {
                        warn!(peer = %peer, error = %e, "ping write failed");
                        let err = BusError::Io(e);
                        if !err.is_recoverable() {
                            failure = Some(err);
                            break 'outer;
                        }
                        continue;
                    }
                    trace!(peer = %peer, "ping sent");
                    pong_deadline = Some(now + pong_timeout);
                }
                if let Some(deadline) = pong_deadline {
                    if now >= deadline {
                        warn!(peer = %peer, "pong timeout, treating connection as dead");
                        failure = Some(BusError::Closed);
                        break 'outer;
                    }
                }
            }
        }
    }

    if let Some(pool) = pool.upgrade() {
        pool.cleanup(&peer, &holder, failure.as_ref()).await;
    }
}
