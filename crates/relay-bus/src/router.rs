use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::frame::{Frame, DEFAULT_MAX_FRAME_BYTES};

/// Subscriber callback invoked once per inbound frame on its topic.
pub type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

type TopicTable = RwLock<HashMap<String, Vec<Registration>>>;

#[derive(Clone)]
struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// Outcome of feeding one inbound text message to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReport {
    /// The frame reached this many subscribers.
    Delivered(usize),
    /// The frame parsed but nobody listens on its target.
    NoSubscribers,
    /// The text was not a valid frame and was dropped.
    Malformed,
}

/// Routes inbound frames to topic subscribers in registration order.
///
/// Cloning is cheap and every clone shares the same subscriber table, so the
/// router can outlive any single connection.
#[derive(Clone)]
pub struct TopicRouter {
    topics: Arc<TopicTable>,
    next_id: Arc<AtomicU64>,
    max_frame_bytes: usize,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.subscribe_callback(topic, Arc::new(callback))
    }

    /// Registers an already shared callback.
    ///
    /// Registering the same callback twice yields two independent
    /// registrations and the callback runs twice per frame.
    pub fn subscribe_callback(&self, topic: &str, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Registration {
                id,
                active: Arc::clone(&active),
                callback,
            });
        debug!(target = "relay.bus", topic, id, "subscribed");
        Subscription {
            topic: topic.to_string(),
            id,
            active,
            table: Arc::downgrade(&self.topics),
        }
    }

    /// Bridges a topic into a broadcast channel for task-based consumers.
    pub fn watch(&self, topic: &str) -> TopicWatch {
        let (tx, rx) = broadcast::channel(64);
        let subscription = self.subscribe(topic, move |frame| {
            let _ = tx.send(frame.clone());
        });
        TopicWatch { rx, subscription }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Delivers a frame to every live subscriber of `frame.target`.
    ///
    /// Iterates a snapshot of the registrations so callbacks may subscribe or
    /// unsubscribe freely; a registration removed before its turn is skipped.
    pub fn dispatch(&self, frame: &Frame) -> DispatchReport {
        let snapshot = match self.topics.read().get(&frame.target) {
            Some(registrations) if !registrations.is_empty() => registrations.clone(),
            _ => {
                debug!(target = "relay.bus", topic = %frame.target, "no subscribers for frame");
                return DispatchReport::NoSubscribers;
            }
        };

        let mut delivered = 0;
        for registration in snapshot {
            if !registration.active.load(Ordering::Acquire) {
                continue;
            }
            let callback = &registration.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                warn!(
                    target = "relay.bus",
                    topic = %frame.target,
                    id = registration.id,
                    "subscriber panicked while handling frame"
                );
            }
            delivered += 1;
        }
        DispatchReport::Delivered(delivered)
    }

    /// Parses socket text and dispatches it. Bad input is logged and dropped.
    pub fn dispatch_text(&self, text: &str) -> DispatchReport {
        match Frame::decode(text, self.max_frame_bytes) {
            Ok(frame) => self.dispatch(&frame),
            Err(err) => {
                warn!(target = "relay.bus", error = %err, "dropping malformed frame");
                DispatchReport::Malformed
            }
        }
    }
}

/// Capability that removes exactly one registration.
///
/// Dropping it leaves the registration in place; call
/// [`Subscription::unsubscribe`] to detach.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    active: Arc<AtomicBool>,
    table: Weak<TopicTable>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes the registration. Safe to call more than once and from inside
    /// a callback that is currently being dispatched.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut guard = table.write();
        if let Some(registrations) = guard.get_mut(&self.topic) {
            registrations.retain(|registration| registration.id != self.id);
            if registrations.is_empty() {
                guard.remove(&self.topic);
            }
        }
        debug!(target = "relay.bus", topic = %self.topic, id = self.id, "unsubscribed");
    }
}

/// Broadcast receiver bound to a topic registration; unsubscribes on drop.
pub struct TopicWatch {
    rx: broadcast::Receiver<Frame>,
    subscription: Subscription,
}

impl TopicWatch {
    /// Waits for the next frame, skipping over any the receiver lagged behind on.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        target = "relay.bus",
                        topic = %self.subscription.topic,
                        skipped,
                        "topic watch lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for TopicWatch {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
