//! The client's event surface (C6): observability hooks exposed to
//! embedders, per `spec.md` §4.6. Fired synchronously with the state
//! transition that caused them, after internal bookkeeping, per that
//! section's "Emission ordering" rule.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;

use crate::error::CloseEvent;

/// One observable event in the client's connection lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A socket connection attempt has begun.
    Connecting,
    /// The socket is open and the handshake completed; carries the
    /// `ConnectionAck` payload, if the server sent one.
    Connected {
        /// The payload attached to the server's `ConnectionAck`, if any.
        ack_payload: Option<Json>,
    },
    /// The socket closed, cleanly or otherwise.
    Closed(CloseEvent),
    /// A raw text frame crossed the wire, in either direction. Exposed
    /// primarily for diagnostics.
    Message {
        /// `true` if this client sent the frame; `false` if it was
        /// received from the server.
        outbound: bool,
        /// The raw frame text.
        frame: String,
    },
}

/// Which [`ConnectionEvent`] variant a listener wants to observe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// [`ConnectionEvent::Connecting`]
    Connecting,
    /// [`ConnectionEvent::Connected`]
    Connected,
    /// [`ConnectionEvent::Closed`]
    Closed,
    /// [`ConnectionEvent::Message`]
    Message,
}

impl ConnectionEvent {
    /// The [`EventKind`] this event belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connecting => EventKind::Connecting,
            Self::Connected { .. } => EventKind::Connected,
            Self::Closed(_) => EventKind::Closed,
            Self::Message { .. } => EventKind::Message,
        }
    }
}

type Listener = Box<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct Entry {
    id: u64,
    kind: EventKind,
    listener: Listener,
}

/// A registry of event listeners, shared between the client's public
/// handle and its background connection actor.
#[derive(Clone, Default)]
pub struct EventSource {
    entries: Arc<Mutex<Vec<Entry>>>,
    next_id: Arc<Mutex<u64>>,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource").finish_non_exhaustive()
    }
}

/// A handle returned by [`EventSource::on`]; dropping or calling it
/// unregisters the listener.
pub struct Unregister {
    id: u64,
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Unregister {
    /// Unregisters the listener. Idempotent.
    pub fn off(self) {
        self.entries.lock().unwrap().retain(|e| e.id != self.id);
    }
}

impl EventSource {
    /// Creates an empty event source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` to be called for every event of kind `kind`.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Unregister {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.entries.lock().unwrap().push(Entry {
            id,
            kind,
            listener: Box::new(listener),
        });

        Unregister {
            id,
            entries: self.entries.clone(),
        }
    }

    /// Emits `event` to every listener registered for its kind, in
    /// registration order.
    pub fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let guard = self.entries.lock().unwrap();
        for entry in guard.iter() {
            if entry.kind == kind {
                (entry.listener)(event);
            }
        }
    }
}
