//! Addressable message routing between the master and its workers.
//!
//! Every endpoint owns a [`Broker`]. An endpoint is addressed by its unique
//! instance id or by an alias (`"master"`, `"worker 3"`). Workers announce
//! themselves through the reserved `_register` service; the master keeps a
//! proxy per worker keyed by both id and alias and forwards anything not
//! addressed to itself.
//!
//! Routing for an outbound message, in order:
//!
//! 1. receiver is this endpoint: queue it on our own event loop
//! 2. master side with a proxy for the receiver: write to that proxy
//! 3. worker side: write to the upstream channel towards the master
//! 4. otherwise: log and drop
//!
//! Handlers are looked up by [`Broker::route`] and run by the owner of the
//! event loop through [`dispatch`], so a handler gets `&mut` access to the
//! component that registered it.

pub mod ipc;
pub mod message;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
pub use message::{MASTER_ALIAS, Message, Registration, services};
pub use transport::{Event, LocalTransport, Peer, ProcessTransport, Transport, TransportRef};

/// Service handler. Receives the owning component and the request.
pub type Service<C> = Arc<dyn Fn(&mut C, Request) -> Result<()> + Send + Sync>;

/// What a service handler receives.
#[derive(Debug, Clone)]
pub struct Request {
    pub service_id: String,
    pub data: Value,
    pub sender_id: String,
    /// Transport back to the sending worker (master side only).
    pub peer: Option<Peer>,
}

impl Request {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        message::decode_payload(&self.service_id, self.data.clone())
    }
}

/// Which side of the master/worker pairing an endpoint is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Master,
    Worker,
}

/// Outcome of routing one inbound envelope.
pub enum Routed<C> {
    /// A local service should run.
    Deliver(Service<C>, Request),
    /// A `_register` handshake was recorded.
    Registered,
    /// Passed on to another endpoint's proxy.
    Forwarded,
    /// Unknown receiver or service; already logged.
    Dropped,
}

impl<C> std::fmt::Debug for Routed<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deliver(_, request) => f.debug_tuple("Deliver").field(request).finish(),
            Self::Registered => write!(f, "Registered"),
            Self::Forwarded => write!(f, "Forwarded"),
            Self::Dropped => write!(f, "Dropped"),
        }
    }
}

/// Message router for one endpoint.
pub struct Broker<C> {
    id: String,
    role: Role,
    master_id: String,
    alias: Option<String>,
    loopback: Sender<Event>,
    upstream: Option<TransportRef>,
    proxies: HashMap<String, TransportRef>,
    services: HashMap<String, Service<C>>,
}

impl<C> Broker<C> {
    /// Privileged endpoint. `loopback` feeds this endpoint's own event loop.
    pub fn master(loopback: Sender<Event>) -> Self {
        Self::new(Role::Master, Some(MASTER_ALIAS.to_string()), loopback, None)
    }

    /// Worker endpoint talking to the master through `upstream`.
    pub fn worker(alias: impl Into<String>, loopback: Sender<Event>, upstream: TransportRef) -> Self {
        Self::new(Role::Worker, Some(alias.into()), loopback, Some(upstream))
    }

    fn new(
        role: Role,
        alias: Option<String>,
        loopback: Sender<Event>,
        upstream: Option<TransportRef>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            master_id: MASTER_ALIAS.to_string(),
            alias,
            loopback,
            upstream,
            proxies: HashMap::new(),
            services: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Proxy registered under an instance id or alias.
    pub fn proxy(&self, key: &str) -> Option<&TransportRef> {
        self.proxies.get(key)
    }

    /// Register a service handler. A second registration for the same id is
    /// rejected with a warning; returns whether the handler was stored.
    pub fn on<F>(&mut self, service_id: &str, handler: F) -> bool
    where
        F: Fn(&mut C, Request) -> Result<()> + Send + Sync + 'static,
    {
        self.register_service(service_id, Arc::new(handler), false)
    }

    /// Register a service handler, replacing any existing one.
    pub fn on_overwrite<F>(&mut self, service_id: &str, handler: F)
    where
        F: Fn(&mut C, Request) -> Result<()> + Send + Sync + 'static,
    {
        self.register_service(service_id, Arc::new(handler), true);
    }

    fn register_service(&mut self, service_id: &str, handler: Service<C>, overwrite: bool) -> bool {
        if self.services.contains_key(service_id) && !overwrite {
            warn!(service = service_id, "Service already registered");
            return false;
        }
        self.services.insert(service_id.to_string(), handler);
        true
    }

    /// Announce this endpoint to the master under its alias.
    pub fn register_with_master(&self) {
        let registration = Registration {
            alias: self.alias.clone(),
        };
        self.send(Some(self.master_id.as_str()), services::REGISTER, &registration);
    }

    /// Build an envelope from this endpoint and route it. `None` addresses the master.
    pub fn send<T: Serialize + ?Sized>(&self, receiver: Option<&str>, service_id: &str, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                error!(service = service_id, error = %e, "Unable to serialize message payload");
                return;
            }
        };
        let receiver = receiver.unwrap_or(&self.master_id);
        self.send_message(Message::new(&self.id, receiver, service_id, data));
    }

    /// Route an already built envelope. Lost messages are logged, never fatal.
    pub fn send_message(&self, message: Message) {
        if self.is_local(&message.receiver_id) {
            trace!(endpoint = self.name(), service = %message.service_id, "Dispatching message locally");
            if self
                .loopback
                .send(Event::Message {
                    message,
                    peer: None,
                })
                .is_err()
            {
                warn!(endpoint = self.name(), "Local event loop is gone, message dropped");
            }
        } else if let Some(proxy) = self.proxy_for(&message.receiver_id) {
            trace!(receiver = %message.receiver_id, service = %message.service_id, "Sending message through proxy");
            if let Err(e) = proxy.send(&message) {
                warn!(receiver = %message.receiver_id, error = %e, "Message lost");
            }
        } else if let Some(upstream) = &self.upstream {
            trace!(service = %message.service_id, "Sending message upstream");
            if let Err(e) = upstream.send(&message) {
                warn!(receiver = %message.receiver_id, error = %e, "Message lost");
            }
        } else {
            error!(receiver = %message.receiver_id, "Unable to send message, unknown receiver");
        }
    }

    /// Decide what to do with an inbound envelope.
    pub fn route(&mut self, message: Message, peer: Option<Peer>) -> Routed<C> {
        trace!(
            endpoint = self.name(),
            sender = %message.sender_id,
            service = %message.service_id,
            "Received message"
        );

        if self.is_local(&message.receiver_id) {
            return self.call_service(message, peer);
        }

        if let Some(proxy) = self.proxy_for(&message.receiver_id) {
            if let Err(e) = proxy.send(&message) {
                warn!(receiver = %message.receiver_id, error = %e, "Forwarded message lost");
            }
            return Routed::Forwarded;
        }

        warn!(receiver = %message.receiver_id, "Proxy not registered");
        Routed::Dropped
    }

    /// Close the channel towards the master (worker side).
    pub fn disconnect(&self) {
        if let Some(upstream) = &self.upstream
            && let Err(e) = upstream.disconnect()
        {
            debug!(endpoint = self.name(), error = %e, "Disconnect failed");
        }
    }

    fn call_service(&mut self, message: Message, peer: Option<Peer>) -> Routed<C> {
        if self.is_master() && message.service_id == services::REGISTER {
            let registration: Registration = message.payload().unwrap_or_default();
            return self.register_proxy(registration.alias, &message.sender_id, peer);
        }

        match self.services.get(&message.service_id) {
            Some(service) => Routed::Deliver(
                Arc::clone(service),
                Request {
                    service_id: message.service_id,
                    data: message.data,
                    sender_id: message.sender_id,
                    peer,
                },
            ),
            None => {
                warn!(
                    endpoint = self.name(),
                    service = %message.service_id,
                    "Service not registered"
                );
                Routed::Dropped
            }
        }
    }

    fn register_proxy(&mut self, alias: Option<String>, sender_id: &str, peer: Option<Peer>) -> Routed<C> {
        let Some(peer) = peer else {
            warn!(sender = sender_id, "Registration arrived without a transport, ignoring");
            return Routed::Dropped;
        };

        debug!(
            sender = sender_id,
            alias = alias.as_deref().unwrap_or("-"),
            worker_id = peer.worker_id,
            "Registering proxy"
        );
        self.proxies
            .insert(sender_id.to_string(), Arc::clone(&peer.transport));
        if let Some(alias) = alias {
            self.proxies.insert(alias, peer.transport);
        }
        Routed::Registered
    }

    fn proxy_for(&self, receiver: &str) -> Option<&TransportRef> {
        if self.is_master() {
            self.proxies.get(receiver)
        } else {
            None
        }
    }

    fn is_local(&self, receiver: &str) -> bool {
        receiver == self.id
            || self.alias.as_deref() == Some(receiver)
            || (self.is_master() && receiver == self.master_id)
    }

    fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }
}

/// Run a routed delivery against the component owning the broker.
///
/// Handler failures are logged; they never stop the event loop.
pub fn dispatch<C>(component: &mut C, routed: Routed<C>) {
    if let Routed::Deliver(service, request) = routed {
        let service_id = request.service_id.clone();
        let sender = request.sender_id.clone();
        if let Err(e) = service(component, request) {
            error!(service = %service_id, sender = %sender, error = %e, "Service handler failed");
        }
    }
}
