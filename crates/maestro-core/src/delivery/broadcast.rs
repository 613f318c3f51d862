//! Fan-out to multiple observers with a slow-consumer policy.
//!
//! Each subscriber gets a bounded buffer. A publish that finds a full
//! buffer drops the event for that subscriber and records a strike;
//! subscribers that keep falling behind are disconnected so they never
//! block faster consumers.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Per-subscriber state.
struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    strikes: u32,
}

/// A broadcaster with per-consumer backpressure accounting.
pub struct Broadcaster<T> {
    subscribers: Mutex<HashMap<u64, Subscriber<T>>>,
    next_id: Mutex<u64>,
    capacity: usize,
    max_strikes: u32,
}

impl<T: Clone> Broadcaster<T> {
    /// `capacity` bounds each subscriber's buffer; a subscriber whose
    /// buffer is full more than `max_strikes` times is disconnected.
    pub fn new(capacity: usize, max_strikes: u32) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            capacity,
            max_strikes,
        }
    }

    /// Register a new subscriber; returns its id and the receive side.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = {
            let mut next = self.next_id.lock().expect("broadcaster poisoned");
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .expect("broadcaster poisoned")
            .insert(id, Subscriber { tx, strikes: 0 });
        (id, rx)
    }

    /// Remove a subscriber explicitly.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("broadcaster poisoned")
            .remove(&id);
    }

    /// Publish an event to every subscriber without blocking.
    ///
    /// Returns the number of subscribers that received the event. Closed
    /// receivers are removed immediately; full ones accumulate strikes
    /// and are disconnected past the limit.
    pub fn publish(&self, event: &T) -> usize {
        let mut subscribers = self.subscribers.lock().expect("broadcaster poisoned");
        let mut delivered = 0;
        let mut evict = Vec::new();

        for (id, sub) in subscribers.iter_mut() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.strikes = 0;
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.strikes += 1;
                    if sub.strikes > self.max_strikes {
                        tracing::warn!(subscriber = id, "disconnecting slow consumer");
                        evict.push(*id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evict.push(*id);
                }
            }
        }

        for id in evict {
            subscribers.remove(&id);
        }
        delivered
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("broadcaster poisoned").len()
    }
}
