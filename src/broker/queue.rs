use crate::broker::events::BrokerEvent;
use log::trace;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use tokio::sync::Notify;

/// Inbound queue capacity between the vendor session thread and the
/// dispatcher.
pub const INBOUND_QUEUE_CAPACITY: usize = 4096;

/// Thread-safe bounded queue bridging the blocking vendor session thread
/// (producer) and the cooperative dispatcher (consumer).
///
/// Overflow policy: `Tick` events shed the oldest queued tick; every other
/// event blocks the producer until the dispatcher drains. The producer side
/// is plain blocking (`Condvar`), the consumer side is async (`Notify`).
pub struct EventQueue {
    inner: Mutex<Inner>,
    space: Condvar,
    ready: Notify,
    capacity: usize,
}

struct Inner {
    buf: VecDeque<BrokerEvent>,
    closed: bool,
    dropped_ticks: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                dropped_ticks: 0,
            }),
            space: Condvar::new(),
            ready: Notify::new(),
            capacity,
        }
    }

    /// Publish an event from the vendor session thread.
    ///
    /// Must not be called from async context: non-tick events block the
    /// calling thread while the queue is full.
    pub fn push(&self, event: BrokerEvent) {
        let mut inner = self.inner.lock().expect("event queue poisoned");
        if inner.closed {
            return;
        }
        if inner.buf.len() >= self.capacity {
            if event.is_tick() {
                // Shed the oldest tick; if none is queued the incoming tick
                // is the oldest information and is dropped instead.
                if let Some(idx) = inner.buf.iter().position(|e| e.is_tick()) {
                    let _ = inner.buf.remove(idx);
                    inner.dropped_ticks += 1;
                } else {
                    inner.dropped_ticks += 1;
                    trace!("inbound queue full with no shedable ticks, dropping incoming tick");
                    return;
                }
            } else {
                while inner.buf.len() >= self.capacity && !inner.closed {
                    inner = self.space.wait(inner).expect("event queue poisoned");
                }
                if inner.closed {
                    return;
                }
            }
        }
        inner.buf.push_back(event);
        drop(inner);
        self.ready.notify_one();
    }

    /// Receive the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<BrokerEvent> {
        loop {
            // Arm the notification before checking state so a push between
            // the check and the await cannot be lost.
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock().expect("event queue poisoned");
                if let Some(event) = inner.buf.pop_front() {
                    self.space.notify_one();
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Blocked producers unblock and further pushes are
    /// discarded; the consumer drains what remains, then sees `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("event queue poisoned");
        inner.closed = true;
        drop(inner);
        self.space.notify_all();
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ticks shed by the overflow policy since startup.
    pub fn dropped_ticks(&self) -> u64 {
        self.inner
            .lock()
            .expect("event queue poisoned")
            .dropped_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::events::TickKind;
    use crate::types::Price;
    use std::sync::Arc;

    fn tick(req_id: u64, price: &str) -> BrokerEvent {
        BrokerEvent::Tick {
            req_id,
            kind: TickKind::Price(Price::from_str(price).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new(16);
        queue.push(tick(1, "10.00"));
        queue.push(BrokerEvent::HistoricalBarsEnd { req_id: 2 });

        match queue.pop().await.unwrap() {
            BrokerEvent::Tick { req_id, .. } => assert_eq!(req_id, 1),
            other => panic!("unexpected event: {:?}", other),
        }
        match queue.pop().await.unwrap() {
            BrokerEvent::HistoricalBarsEnd { req_id } => assert_eq!(req_id, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_sheds_oldest_tick() {
        let queue = EventQueue::new(2);
        queue.push(tick(1, "10.00"));
        queue.push(tick(2, "10.01"));
        // Queue is full; the incoming tick displaces the oldest one.
        queue.push(tick(3, "10.02"));

        assert_eq!(queue.dropped_ticks(), 1);
        match queue.pop().await.unwrap() {
            BrokerEvent::Tick { req_id, .. } => assert_eq!(req_id, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        match queue.pop().await.unwrap() {
            BrokerEvent::Tick { req_id, .. } => assert_eq!(req_id, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_never_sheds_non_tick_events() {
        let queue = Arc::new(EventQueue::new(2));
        queue.push(BrokerEvent::HistoricalBarsEnd { req_id: 1 });
        queue.push(BrokerEvent::HistoricalBarsEnd { req_id: 2 });
        // An incoming tick cannot displace non-tick events.
        queue.push(tick(3, "10.00"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_ticks(), 1);
    }

    #[tokio::test]
    async fn test_blocking_producer_unblocks_on_pop() {
        let queue = Arc::new(EventQueue::new(1));
        queue.push(BrokerEvent::HistoricalBarsEnd { req_id: 1 });

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                // Blocks until the consumer makes room.
                queue.push(BrokerEvent::HistoricalBarsEnd { req_id: 2 });
            })
        };

        let first = queue.pop().await.unwrap();
        assert_eq!(first.req_id(), 1);
        producer.join().unwrap();
        let second = queue.pop().await.unwrap();
        assert_eq!(second.req_id(), 2);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = EventQueue::new(8);
        queue.push(tick(1, "10.00"));
        queue.close();
        queue.push(tick(2, "10.01")); // discarded after close

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }
}
