//! Inbound Server: accepts peer connections and turns framed bytes into dispatched messages.
//!
//! Each accepted connection gets its own task reading length-prefixed frames off the wire.
//! `PING` frames are answered with a single pong byte and never reach the dispatch engine;
//! everything else is handed to [`crate::dispatch::Dispatcher::receive_message`] with no
//! reply-handler plumbing — the sender drives any reply through its own reply handler.

use std::net::SocketAddr;
use std::sync::Arc;

use compio::net::{TcpListener, TcpStream};
use netbus_core::{decode_frame, Frame, NodeID};
use tracing::{debug, error, warn};

use crate::dispatch::Dispatcher;
use crate::wire;

/// Binds `bind_addr` and returns the listener plus the node identity this server will advertise
/// to the rest of the cluster (resolved from the actual bound port, or `public_host`/`public_port`
/// overrides from [`crate::BusOptions`]).
pub async fn bind(
    bind_addr: SocketAddr,
    public_host: Option<String>,
    public_port: Option<u16>,
) -> std::io::Result<(TcpListener, NodeID)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let node = NodeID::new(
        public_host.unwrap_or_else(|| local_addr.ip().to_string()),
        public_port.unwrap_or_else(|| local_addr.port()),
    );
    debug!(bind_addr = %local_addr, advertised = %node, "inbound server bound");
    Ok((listener, node))
}

/// Runs the accept loop until the listener errors out (e.g. because it was dropped by `close()`).
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "accepted connection");
                let dispatcher = dispatcher.clone();
                compio::runtime::spawn(async move {
                    handle_connection(stream, dispatcher).await;
                })
                .detach();
            }
            Err(e) => {
                error!(error = %e, "inbound server accept failed, stopping");
                break;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    loop {
        let payload = match wire::read_frame(&mut stream).await {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "inbound read failed, closing connection");
                return;
            }
        };

        let frame = match decode_frame(&payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed frame, closing connection");
                return;
            }
        };

        match frame {
            Frame::Ping { sender } => {
                if let Err(e) = wire::write_pong(&mut stream).await {
                    warn!(error = %e, peer = %sender, "failed to write pong");
                    return;
                }
            }
            Frame::Message(msg) => {
                dispatcher.receive_message(msg, true).await;
            }
        }
    }
}
