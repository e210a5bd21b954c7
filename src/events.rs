//! Typed publish/subscribe channels
//!
//! One `EventChannel<T>` per event category. Every subscriber gets its own
//! unbounded queue, so a slow consumer never blocks the publisher. A
//! `Subscription` unsubscribes explicitly or when dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Subscribers<T> {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::UnboundedSender<T>)>>,
}

/// Fan-out channel for one event category
pub struct EventChannel<T> {
    inner: Arc<Subscribers<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Subscribers {
                next_id: AtomicU64::new(1),
                senders: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.senders.lock().push((id, tx));

        Subscription {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every live subscriber; closed ones are pruned
    pub fn publish(&self, event: &T) {
        self.inner
            .senders
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut senders = self.inner.senders.lock();
        senders.retain(|(_, tx)| !tx.is_closed());
        senders.len()
    }
}

/// Receiving half handed to one subscriber
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    channel: Weak<Subscribers<T>>,
}

impl<T> Subscription<T> {
    /// Next event; `None` once unsubscribed or the channel is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Events already queued can still be drained.
    pub fn unsubscribe(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.senders.lock().retain(|(id, _)| *id != self.id);
        }
        self.channel = Weak::new();
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
