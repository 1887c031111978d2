//! In-process fan-out of decoded [`Event`]s.
//!
//! Every tracker publishes into one shared [`EventHub`]; exporters subscribe
//! either with a callback or with an unbounded channel. Each subscriber gets
//! its own clone of every event, exactly once, in publish order.
//!
//! Delivery is synchronous and happens under the hub's lock. A subscriber
//! that blocks stalls every publisher, so slow consumers should use
//! [`EventHub::subscribe_channel`] and drain the receiver on their own task.
//! Callbacks must not call back into the hub.

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

use crate::lock;
use crate::types::{Event, EventSink};

/// Opaque handle returned by the subscribe calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Subscriber {
    Callback(Box<dyn FnMut(Event) + Send>),
    Channel(mpsc::UnboundedSender<Event>),
}

impl Subscriber {
    /// Deliver one event. `false` means the subscriber is gone for good.
    fn deliver(&mut self, event: Event) -> bool {
        match self {
            Subscriber::Callback(f) => {
                f(event);
                true
            }
            Subscriber::Channel(tx) => tx.send(event).is_ok(),
        }
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    // Most recently added first.
    list: Vec<(SubscriptionId, Subscriber)>,
}

/// Multi-producer, multi-subscriber event broadcaster.
#[derive(Default)]
pub struct EventHub {
    inner: Mutex<Subscribers>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It runs on the publisher's task.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.add(Subscriber::Callback(Box::new(callback)))
    }

    /// Register an unbounded channel. Dropping the receiver unsubscribes
    /// on the next publish.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.add(Subscriber::Channel(tx)), rx)
    }

    fn add(&self, subscriber: Subscriber) -> SubscriptionId {
        let mut inner = lock(&self.inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.list.insert(0, (id, subscriber));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = lock(&self.inner);
        let before = inner.list.len();
        inner.list.retain(|(sid, _)| *sid != id);
        inner.list.len() != before
    }

    /// Deliver `event` to every subscriber, newest first.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: Event) -> usize {
        let mut inner = lock(&self.inner);
        let mut delivered = 0;
        inner.list.retain_mut(|(id, subscriber)| {
            if subscriber.deliver(event.clone()) {
                delivered += 1;
                true
            } else {
                debug!("subscriber {id:?} closed, removing");
                false
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).list.len()
    }

    /// A publish function to hand to trackers.
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let hub = Arc::clone(self);
        Arc::new(move |event| {
            hub.publish(event);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, Sensor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(bpm: i64) -> Event {
        Event::single(
            Sensor::new("00:22:D0:AA:1F:3B"),
            Metric::new("polar-h7", 0).with_field("beats_per_minute", bpm),
        )
    }

    #[test]
    fn each_subscriber_gets_each_event_once() {
        let hub = EventHub::new();
        let counts: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for c in &counts {
            let c = Arc::clone(c);
            hub.subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hub.publish(event(60)), 3);
        for c in &counts {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn unsubscribed_receives_nothing() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = hub.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.publish(event(60)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn newest_subscriber_is_notified_first() {
        let hub = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hub.subscribe(move |_| order.lock().unwrap().push(name));
        }
        hub.publish(event(60));
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn subscribers_get_independent_copies() {
        let hub = EventHub::new();
        hub.subscribe(|mut e: Event| {
            e.metrics.clear();
        });
        let (_, mut rx) = hub.subscribe_channel();
        hub.publish(event(72));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.metrics.len(), 1);
    }

    #[test]
    fn events_keep_publish_order() {
        let hub = EventHub::new();
        let (_, mut rx) = hub.subscribe_channel();
        for bpm in 60..65 {
            hub.publish(event(bpm));
        }
        let seen: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.metrics[0].field("beats_per_minute").and_then(|v| v.as_i64()).unwrap())
            .collect();
        assert_eq!(seen, vec![60, 61, 62, 63, 64]);
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let hub = EventHub::new();
        let (_, rx) = hub.subscribe_channel();
        drop(rx);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish(event(60)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn concurrent_publishers_deliver_everything() {
        let hub = Arc::new(EventHub::new());
        let (_, mut rx) = hub.subscribe_channel();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let sink = hub.sink();
                std::thread::spawn(move || {
                    for bpm in 0..100 {
                        sink(event(bpm));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(std::iter::from_fn(|| rx.try_recv().ok()).count(), 400);
    }
}
