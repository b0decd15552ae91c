//! netbus-core
//!
//! Protocol-agnostic kernel for the netbus distributed event bus: node identity, the wire
//! envelope and its codec, the handler registry, the subscription map, and the cluster-manager
//! seam a real deployment plugs a coordination backend into.
//!
//! This crate deliberately knows nothing about sockets, `compio`, or any particular async
//! runtime: [`context::Context`] is the only place a runtime enters the picture, and it does so
//! as a trait the caller implements. The `netbus` crate builds the actual TCP transport,
//! connection pool, and public API on top of these pieces.

#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod codec;
pub mod context;
pub mod error;
pub mod message;
pub mod node;
pub mod registry;
pub mod subs;

pub use cluster::{ClusterManager, LocalClusterManager, MembershipEvent, MembershipMonitor};
pub use codec::{CodecRegistry, JsonCodec, MessageCodec};
pub use context::{BoxedTask, Context, LaneContext};
pub use error::{BusError, Result};
pub use message::{decode_frame, encode_frame, Body, Frame, Message};
pub use node::NodeID;
pub use registry::{HandlerHolder, HandlerRegistry};
pub use subs::{AsyncMultiMap, ChoosableIterable, LocalSubscriptionMap};
