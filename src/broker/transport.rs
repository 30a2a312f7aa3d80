//! Transports carrying envelopes between endpoints.
//!
//! The broker only sees the [`Transport`] trait. [`LocalTransport`] hands the
//! envelope straight to an in-process event queue, [`ProcessTransport`]
//! writes it as a JSON line into a pipe owned by another process.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use super::ipc::{LineWriter, PipeFd};
use super::message::Message;
use crate::error::{GenError, Result};
use crate::watchdog::ExitInfo;

/// Shared handle to a transport.
pub type TransportRef = Arc<dyn Transport>;

/// A one-way channel towards another endpoint.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Deliver an envelope. Fire-and-forget: success means handed off, not processed.
    fn send(&self, message: &Message) -> Result<()>;

    /// Close the channel. The far side observes end-of-stream.
    fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// The raw transport handle a master-side service receives for the worker
/// that sent the message, so it can reply without alias resolution.
#[derive(Debug, Clone)]
pub struct Peer {
    pub worker_id: u32,
    pub transport: TransportRef,
}

impl Peer {
    pub fn new(worker_id: u32, transport: TransportRef) -> Self {
        Self {
            worker_id,
            transport,
        }
    }
}

/// Item on an endpoint's event queue.
#[derive(Debug)]
pub enum Event {
    /// An inbound envelope, with the sending worker when known.
    Message {
        message: Message,
        peer: Option<Peer>,
    },
    /// A worker process (or thread) ended.
    Exit { worker_id: u32, exit: ExitInfo },
    /// The inbound channel was closed by the other side.
    Disconnected,
}

/// Same-process transport: pushes envelopes onto the receiver's event queue.
#[derive(Debug)]
pub struct LocalTransport {
    label: String,
    events: Sender<Event>,
    peer: Option<Peer>,
    connected: AtomicBool,
}

impl LocalTransport {
    /// `peer` is attached to every envelope, letting the receiver reply.
    pub fn new(label: impl Into<String>, events: Sender<Event>, peer: Option<Peer>) -> Self {
        Self {
            label: label.into(),
            events,
            peer,
            connected: AtomicBool::new(true),
        }
    }
}

impl Transport for LocalTransport {
    fn send(&self, message: &Message) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(GenError::Disconnected(self.label.clone()));
        }
        self.events
            .send(Event::Message {
                message: message.clone(),
                peer: self.peer.clone(),
            })
            .map_err(|_| GenError::Disconnected(self.label.clone()))
    }

    fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            // Receiver may already be gone; nothing left to tell it then.
            let _ = self.events.send(Event::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Cross-process transport writing JSON lines into a pipe.
pub struct ProcessTransport {
    label: String,
    writer: Mutex<Option<LineWriter>>,
}

impl ProcessTransport {
    pub fn new(label: impl Into<String>, fd: PipeFd) -> Self {
        Self {
            label: label.into(),
            writer: Mutex::new(Some(LineWriter::new(fd))),
        }
    }

    /// Transport over this process's stdout, used by worker processes.
    ///
    /// Nothing else in the worker may write to fd 1 afterwards.
    pub fn stdout(label: impl Into<String>) -> Self {
        // Safety: fd 1 is open for the lifetime of the process and ownership
        // moves into this transport.
        let fd = unsafe { PipeFd::from_raw(1) };
        Self::new(label, fd)
    }
}

impl fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("label", &self.label)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Transport for ProcessTransport {
    fn send(&self, message: &Message) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(writer) => writer.write_message(message).map_err(|e| {
                GenError::Transport(format!("Failed to send to {}: {}", self.label, e))
            }),
            None => Err(GenError::Disconnected(self.label.clone())),
        }
    }

    fn disconnect(&self) -> Result<()> {
        // Dropping the writer closes the pipe.
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
