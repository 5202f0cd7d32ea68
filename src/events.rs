//! Event queue connecting asset/window producers to renderer consumers
//!
//! Every subscriber gets its own `crossbeam-channel` receiver and sees every
//! event published after it subscribed. Consumers drain without blocking,
//! typically once per frame.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

/// Identifier of an asset known to the asset system
pub type AssetId = u64;

/// Lifecycle notifications for CPU-side assets mirrored on the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    Loaded(AssetId),
    Unloaded(AssetId),
    Replaced(AssetId),
    Removed(AssetId),
}

impl ResourceEvent {
    pub fn asset(&self) -> AssetId {
        match *self {
            ResourceEvent::Loaded(id)
            | ResourceEvent::Unloaded(id)
            | ResourceEvent::Replaced(id)
            | ResourceEvent::Removed(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Resized { window: u64, width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Resource(ResourceEvent),
    Window(WindowEvent),
}

impl From<ResourceEvent> for Event {
    fn from(event: ResourceEvent) -> Self {
        Event::Resource(event)
    }
}

impl From<WindowEvent> for Event {
    fn from(event: WindowEvent) -> Self {
        Event::Window(event)
    }
}

/// Broadcast queue. Clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventQueue {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer.
    pub fn subscribe(&self) -> EventReceiver {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(sender);
        EventReceiver { receiver }
    }

    /// Deliver an event to every live subscriber. Subscribers whose receiver
    /// was dropped are forgotten.
    pub fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        self.subscribers
            .lock()
            .retain(|sender| sender.send(event).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end handed out by [`EventQueue::subscribe`].
pub struct EventReceiver {
    receiver: Receiver<Event>,
}

impl EventReceiver {
    /// Next pending event, if any.
    pub fn try_next(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take every event currently queued.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }
}
