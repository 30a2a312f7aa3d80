//! Per-run state handed to the master and to each worker.
//!
//! There is no process-wide broker or watchdog: each endpoint gets its own
//! context, and everything inbound (messages, exits, disconnects) reaches it
//! through its [`Mailbox`].

use std::sync::mpsc::{self, Receiver, Sender};

use crate::broker::{Broker, Event, TransportRef};
use crate::watchdog::Watchdog;

/// An endpoint's single inbound event queue.
///
/// Events are handled one at a time, in arrival order, by whoever owns the
/// mailbox; per sender they arrive in send order.
#[derive(Debug)]
pub struct Mailbox {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl Mailbox {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    /// A handle other parties use to post events here.
    pub fn sender(&self) -> Sender<Event> {
        self.sender.clone()
    }

    /// Block for the next event. The mailbox keeps a sender itself, so this
    /// only returns `None` if the channel is torn down underneath it.
    pub fn recv(&self) -> Option<Event> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Master-side context: router, event queue and worker bookkeeping.
pub struct RunContext<C> {
    pub broker: Broker<C>,
    pub mailbox: Mailbox,
    pub watchdog: Watchdog,
}

impl<C> RunContext<C> {
    pub fn new(watchdog: Watchdog) -> Self {
        let mailbox = Mailbox::new();
        Self {
            broker: Broker::master(mailbox.sender()),
            mailbox,
            watchdog,
        }
    }
}

impl<C> Default for RunContext<C> {
    fn default() -> Self {
        Self::new(Watchdog::new())
    }
}

/// Worker-side context: router and event queue.
pub struct WorkerContext<C> {
    pub broker: Broker<C>,
    pub mailbox: Mailbox,
}

impl<C> WorkerContext<C> {
    /// `upstream` carries everything addressed to the master.
    pub fn new(alias: impl Into<String>, upstream: TransportRef) -> Self {
        Self::with_mailbox(alias, Mailbox::new(), upstream)
    }

    /// Use a mailbox whose sender was already handed out (e.g. to the master).
    pub fn with_mailbox(alias: impl Into<String>, mailbox: Mailbox, upstream: TransportRef) -> Self {
        Self {
            broker: Broker::worker(alias, mailbox.sender(), upstream),
            mailbox,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{LocalTransport, MASTER_ALIAS};
    use serde_json::json;
    use std::sync::Arc;

    struct Endpoint;

    #[test]
    fn test_master_loopback_reaches_own_mailbox() {
        let ctx: RunContext<Endpoint> = RunContext::default();
        ctx.broker.send(Some(MASTER_ALIAS), "ping", &json!(1));
        assert!(matches!(ctx.mailbox.try_recv(), Some(Event::Message { .. })));
        assert!(ctx.mailbox.try_recv().is_none());
        assert!(ctx.watchdog.is_empty());
    }

    #[test]
    fn test_worker_context_sends_upstream() {
        let master = Mailbox::new();
        let upstream = Arc::new(LocalTransport::new("master", master.sender(), None));
        let ctx: WorkerContext<Endpoint> = WorkerContext::new("worker 1", upstream);

        ctx.broker.send(None, "ping", &json!(2));
        ctx.broker.send(Some("worker 1"), "self", &json!(3));

        assert!(matches!(master.try_recv(), Some(Event::Message { message, .. }) if message.data == json!(2)));
        assert!(matches!(ctx.mailbox.try_recv(), Some(Event::Message { message, .. }) if message.service_id == "self"));
    }
}
