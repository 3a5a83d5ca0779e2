//! The stable event surface.
//!
//! Listeners live on the handle, not on any per-attempt connection, so they
//! survive reconnections without re-registration: the lifecycle engine only
//! ever re-emits through this registry. Alongside the callback registry the
//! same events fan out on a broadcast channel for stream-oriented consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::error::Error;
use crate::types::{Message, TerminationCause};

/// Broadcast channel capacity for the event fan-out.
const BROADCAST_CAPACITY: usize = 1024;

/// A registered callback. Identity (for deduplication and removal) is the
/// `Arc` allocation itself: clone the same `Arc` you registered.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Event categories a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// A connection attempt reached the open state and the buffer flushed
    Open,
    /// A payload arrived
    Message,
    /// A transport-level fault occurred
    Error,
    /// A connection attempt ended
    Close,
    /// The handle permanently terminated; fires at most once per handle
    Terminated,
}

/// An event re-emitted through the handle's stable surface.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    Open(OpenEvent),
    Message(MessageEvent),
    Error(ErrorEvent),
    Close(CloseEvent),
    Terminated(TerminatedEvent),
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open(_) => EventKind::Open,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::Close(_) => EventKind::Close,
            Self::Terminated(_) => EventKind::Terminated,
        }
    }
}

/// Fired once per attempt that opens and flushes successfully.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct OpenEvent {
    /// Negotiated sub-protocol, empty if none
    pub protocol: String,
}

/// One inbound payload.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// The payload
    pub data: Message,
    /// Endpoint the payload arrived from
    pub origin: String,
}

/// A transport fault that did not end the attempt by itself.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Human-readable description
    pub message: String,
}

/// End of one connection attempt. Fired for every attempt, whether or not a
/// retry follows.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CloseEvent {
    /// Close code
    pub code: u16,
    /// Close reason, empty if none
    pub reason: String,
    /// Whether the close completed as a clean handshake
    pub was_clean: bool,
}

/// Permanent termination. Fired exactly once, synchronously with the
/// termination decision; ordinary retried closes never produce this.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct TerminatedEvent {
    /// Why reconnection stopped
    pub cause: TerminationCause,
    /// The underlying fault for [`TerminationCause::UnknownError`]
    pub error: Option<Arc<Error>>,
}

/// Registration options mirroring the conventional listener flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ListenerOptions {
    /// Fire on the next matching event across any number of reconnections,
    /// then self-remove
    pub once: bool,
    /// Part of the registration's identity; two registrations of the same
    /// callback with different capture flags are distinct
    pub capture: bool,
}

impl ListenerOptions {
    #[must_use]
    pub fn once() -> Self {
        Self {
            once: true,
            capture: false,
        }
    }
}

struct Entry {
    callback: Callback,
    once: bool,
    capture: bool,
}

impl Entry {
    fn matches(&self, callback: &Callback, capture: bool) -> bool {
        Arc::ptr_eq(&self.callback, callback) && self.capture == capture
    }
}

/// Multi-listener registry plus single-slot attribute handlers.
pub(crate) struct EventSurface {
    entries: Mutex<HashMap<EventKind, Vec<Entry>>>,
    /// Tracked owned registration per attribute slot; replaced or removed
    /// atomically on reassignment.
    attributes: Mutex<HashMap<EventKind, Callback>>,
    broadcast: broadcast::Sender<Event>,
}

impl EventSurface {
    pub(crate) fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            attributes: Mutex::new(HashMap::new()),
            broadcast,
        }
    }

    /// Register a listener. Registering an identical (kind, callback,
    /// capture) combination again is a no-op; returns whether the
    /// registration was added.
    pub(crate) fn add_listener(
        &self,
        kind: EventKind,
        callback: Callback,
        options: ListenerOptions,
    ) -> bool {
        let mut entries = lock(&self.entries);
        let list = entries.entry(kind).or_default();
        if list.iter().any(|e| e.matches(&callback, options.capture)) {
            return false;
        }
        list.push(Entry {
            callback,
            once: options.once,
            capture: options.capture,
        });
        true
    }

    /// Remove a listener. Idempotent.
    pub(crate) fn remove_listener(&self, kind: EventKind, callback: &Callback, capture: bool) {
        let mut entries = lock(&self.entries);
        if let Some(list) = entries.get_mut(&kind) {
            list.retain(|e| !e.matches(callback, capture));
        }
    }

    /// Replace or clear the single-slot attribute handler for `kind`.
    pub(crate) fn set_attribute(&self, kind: EventKind, callback: Option<Callback>) {
        let mut attributes = lock(&self.attributes);
        if let Some(previous) = attributes.remove(&kind) {
            self.remove_listener(kind, &previous, false);
        }
        if let Some(callback) = callback {
            self.add_listener(kind, Arc::clone(&callback), ListenerOptions::default());
            attributes.insert(kind, callback);
        }
    }

    /// Subscribe to the broadcast fan-out of all events.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Emit one event to every matching listener and the broadcast channel.
    /// `once` listeners are unregistered before their callback runs, so a
    /// re-entrant registration of the same callback behaves as a fresh one.
    pub(crate) fn emit(&self, event: &Event) {
        let kind = event.kind();
        let snapshot: Vec<Callback> = {
            let mut entries = lock(&self.entries);
            match entries.get_mut(&kind) {
                Some(list) => {
                    let callbacks = list.iter().map(|e| Arc::clone(&e.callback)).collect();
                    list.retain(|e| !e.once);
                    callbacks
                }
                None => Vec::new(),
            }
        };
        for callback in snapshot {
            callback(event);
        }
        drop(self.broadcast.send(event.clone()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counter_callback(counter: &Arc<AtomicU32>) -> Callback {
        let counter = Arc::clone(counter);
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn open_event() -> Event {
        Event::Open(OpenEvent {
            protocol: String::new(),
        })
    }

    #[test]
    fn duplicate_registration_is_noop() {
        let surface = EventSurface::new();
        let calls = Arc::new(AtomicU32::new(0));
        let callback = counter_callback(&calls);

        assert!(surface.add_listener(
            EventKind::Open,
            Arc::clone(&callback),
            ListenerOptions::default()
        ));
        assert!(!surface.add_listener(
            EventKind::Open,
            Arc::clone(&callback),
            ListenerOptions::default()
        ));

        surface.emit(&open_event());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_callback_with_different_capture_is_distinct() {
        let surface = EventSurface::new();
        let calls = Arc::new(AtomicU32::new(0));
        let callback = counter_callback(&calls);

        surface.add_listener(
            EventKind::Open,
            Arc::clone(&callback),
            ListenerOptions::default(),
        );
        assert!(surface.add_listener(
            EventKind::Open,
            Arc::clone(&callback),
            ListenerOptions {
                once: false,
                capture: true
            }
        ));

        surface.emit(&open_event());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_is_idempotent() {
        let surface = EventSurface::new();
        let calls = Arc::new(AtomicU32::new(0));
        let callback = counter_callback(&calls);

        surface.add_listener(
            EventKind::Open,
            Arc::clone(&callback),
            ListenerOptions::default(),
        );
        surface.remove_listener(EventKind::Open, &callback, false);
        surface.remove_listener(EventKind::Open, &callback, false);

        surface.emit(&open_event());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let surface = EventSurface::new();
        let calls = Arc::new(AtomicU32::new(0));
        let callback = counter_callback(&calls);

        surface.add_listener(EventKind::Open, callback, ListenerOptions::once());

        surface.emit(&open_event());
        surface.emit(&open_event());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attribute_slot_replacement_removes_previous() {
        let surface = EventSurface::new();
        let first_calls = Arc::new(AtomicU32::new(0));
        let second_calls = Arc::new(AtomicU32::new(0));

        surface.set_attribute(EventKind::Message, Some(counter_callback(&first_calls)));
        surface.set_attribute(EventKind::Message, Some(counter_callback(&second_calls)));

        surface.emit(&Event::Message(MessageEvent {
            data: Message::Text("hi".to_owned()),
            origin: "ws://example".to_owned(),
        }));

        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attribute_slot_clears_to_nothing() {
        let surface = EventSurface::new();
        let calls = Arc::new(AtomicU32::new(0));

        surface.set_attribute(EventKind::Open, Some(counter_callback(&calls)));
        surface.set_attribute(EventKind::Open, None);

        surface.emit(&open_event());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attribute_slot_is_independent_of_general_listeners() {
        let surface = EventSurface::new();
        let listener_calls = Arc::new(AtomicU32::new(0));
        let attribute_calls = Arc::new(AtomicU32::new(0));

        surface.add_listener(
            EventKind::Close,
            counter_callback(&listener_calls),
            ListenerOptions::default(),
        );
        surface.set_attribute(EventKind::Close, Some(counter_callback(&attribute_calls)));
        surface.set_attribute(EventKind::Close, None);

        surface.emit(&Event::Close(CloseEvent {
            code: 1000,
            reason: String::new(),
            was_clean: true,
        }));

        assert_eq!(listener_calls.load(Ordering::SeqCst), 1);
        assert_eq!(attribute_calls.load(Ordering::SeqCst), 0);
    }
}
