//! Broadcast transport between same-origin browser contexts.
//!
//! Implementations:
//! - `InMemoryChannel` - every context lives in one process (tests, workers sharing a hub)
//! - `JsBroadcastChannel` (in tabsync-wasm) - wraps the browser `BroadcastChannel`
//!
//! Subscriptions are queues: each `subscribe_*` call returns a fresh receiver,
//! and dropping that receiver is the equivalent of `removeEventListener`.

use crate::election::ElectionMessage;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Default objection window for in-process channels.
pub const DEFAULT_RESPONSE_TIME: Duration = Duration::from_millis(50);

/// Cross-context message delivery.
///
/// Messages are never delivered back to the posting channel. Messages from one
/// sender arrive at each peer in send order; there is no order across senders.
pub trait BroadcastChannel {
    /// Post an application message.
    fn post_message(&self, message: Value) -> Result<()>;

    /// Post an election message. Only `subscribe_internal` receivers see it.
    fn post_internal(&self, message: ElectionMessage) -> Result<()>;

    fn subscribe_messages(&self) -> UnboundedReceiver<Value>;

    fn subscribe_internal(&self) -> UnboundedReceiver<ElectionMessage>;

    /// Typical round-trip time; the default election response window.
    fn average_response_time(&self) -> Duration;
}

#[derive(Default)]
struct HubState {
    next_id: usize,
    messages: Vec<(usize, UnboundedSender<Value>)>,
    internal: Vec<(usize, UnboundedSender<ElectionMessage>)>,
}

/// Shared medium for a set of `InMemoryChannel`s (one hub = one channel name).
#[derive(Clone, Default)]
pub struct BroadcastHub {
    state: Rc<RefCell<HubState>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel endpoint on this hub.
    pub fn connect(&self) -> InMemoryChannel {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        InMemoryChannel {
            id,
            hub: self.clone(),
            response_time: DEFAULT_RESPONSE_TIME,
            muted: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    fn deliver<T: Clone>(
        subscribers: &mut Vec<(usize, UnboundedSender<T>)>,
        from: usize,
        message: T,
    ) {
        // Prune receivers that were dropped.
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (id, tx) in subscribers.iter() {
            if *id != from {
                let _ = tx.unbounded_send(message.clone());
            }
        }
    }
}

/// In-process implementation of [`BroadcastChannel`].
pub struct InMemoryChannel {
    id: usize,
    hub: BroadcastHub,
    response_time: Duration,
    muted: Cell<bool>,
    closed: Cell<bool>,
}

impl InMemoryChannel {
    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = response_time;
        self
    }

    /// While muted, everything this endpoint posts is silently lost.
    pub fn set_muted(&self, muted: bool) {
        self.muted.set(muted);
    }

    /// Close the endpoint: posting fails and this endpoint's receivers end.
    pub fn close(&self) {
        self.closed.set(true);
        let mut state = self.hub.state.borrow_mut();
        state.messages.retain(|(id, _)| *id != self.id);
        state.internal.retain(|(id, _)| *id != self.id);
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.get() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl BroadcastChannel for InMemoryChannel {
    fn post_message(&self, message: Value) -> Result<()> {
        self.check_open()?;
        if self.muted.get() {
            trace!(channel = self.id, "Dropping message from muted channel");
            return Ok(());
        }
        BroadcastHub::deliver(&mut self.hub.state.borrow_mut().messages, self.id, message);
        Ok(())
    }

    fn post_internal(&self, message: ElectionMessage) -> Result<()> {
        self.check_open()?;
        if self.muted.get() {
            trace!(channel = self.id, "Dropping election message from muted channel");
            return Ok(());
        }
        BroadcastHub::deliver(&mut self.hub.state.borrow_mut().internal, self.id, message);
        Ok(())
    }

    fn subscribe_messages(&self) -> UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded();
        if !self.closed.get() {
            self.hub.state.borrow_mut().messages.push((self.id, tx));
        }
        rx
    }

    fn subscribe_internal(&self) -> UnboundedReceiver<ElectionMessage> {
        let (tx, rx) = mpsc::unbounded();
        if !self.closed.get() {
            self.hub.state.borrow_mut().internal.push((self.id, tx));
        }
        rx
    }

    fn average_response_time(&self) -> Duration {
        self.response_time
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}
