//! Reply context: the narrow capability a delivered handler gets for replying to (or failing)
//! the address that sent it.
//!
//! A handler never talks to the [`crate::dispatch::Dispatcher`] directly; it only sees a
//! [`ReplyContext`], so it can neither bypass the reply-address lifecycle nor be handed the
//! pool/registry internals. This mirrors the teacher's pattern of handing socket actors a narrow
//! sender handle rather than the actor itself.

use std::sync::Arc;
use std::time::Duration;

use netbus_core::{Body, Message, NodeID};

use crate::dispatch::{failure_body, Dispatcher};

/// Handed to an application handler alongside the [`Message`] it was delivered.
///
/// Calling [`ReplyContext::reply`] or [`ReplyContext::fail`] when the original send expected no
/// reply (`reply_address` is `None`, e.g. a `publish` or a fire-and-forget `send`) is a no-op: a
/// reply with nowhere to go is simply dropped, matching the bus's no-delivery-guarantee policy.
pub struct ReplyContext {
    dispatcher: Arc<Dispatcher>,
    reply_address: Option<String>,
    sender: Option<NodeID>,
}

impl ReplyContext {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        reply_address: Option<String>,
        sender: Option<NodeID>,
    ) -> Self {
        Self {
            dispatcher,
            reply_address,
            sender,
        }
    }

    /// Whether the sender of the delivered message is waiting on a reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.reply_address.is_some()
    }

    /// Reply to the sender with `body`.
    pub fn reply(&self, body: Body) {
        self.send_reply(body);
    }

    /// Signal that handling the message failed (`RECIPIENT_FAILURE`), carrying an
    /// application-defined `code` and human-readable `reason` back to the original sender's
    /// reply handler.
    pub fn fail(&self, code: i32, reason: impl Into<String>) {
        self.send_reply(failure_body("recipient_failure", code, &reason.into()));
    }

    fn send_reply(&self, body: Body) {
        let Some(reply_address) = self.reply_address.clone() else {
            return;
        };
        // A message that carries a reply address always carries the sender alongside it (the
        // dispatcher sets both together in `send_or_pub`); the self-node fallback only matters
        // for a reply context built by hand in a test.
        let dest = self
            .sender
            .clone()
            .unwrap_or_else(|| self.dispatcher.self_node().clone());
        let msg = Message {
            send: true,
            address: reply_address,
            reply_address: None,
            sender: None,
            body,
        };
        let dispatcher = self.dispatcher.clone();
        compio::runtime::spawn(async move {
            dispatcher.send_or_pub(Some(dest), msg, None, Duration::ZERO).await;
        })
        .detach();
    }
}
