//! Bounded single-consumer queue that displaces its oldest item when full.
//!
//! Used for pose and vision samples, where a stale frame is worse than a lost
//! one. Pushing never waits, so capture callbacks can hand off and return.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl<T> Shared<T> {
    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Create a queue holding at most `capacity` items (minimum 1)
pub fn drop_oldest<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        items: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        capacity,
    });

    (
        QueueSender {
            shared: Arc::clone(&shared),
        },
        QueueReceiver { shared },
    )
}

pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueSender<T> {
    /// Enqueue `item`, returning the displaced oldest item if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        let displaced = {
            let mut items = self.shared.items();
            let displaced = if items.len() >= self.shared.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            displaced
        };
        self.shared.notify.notify_one();
        displaced
    }

    pub fn len(&self) -> usize {
        self.shared.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct QueueReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueReceiver<T> {
    /// Wait for the next item. Returns `None` once the sender is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.shared.items().pop_front() {
                return Some(item);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_displaces_oldest() {
        let (tx, mut rx) = drop_oldest(2);

        assert!(tx.push(1).is_none());
        assert!(tx.push(2).is_none());
        assert_eq!(tx.push(3), Some(1));
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, mut rx) = drop_oldest(4);
        tx.push("a");
        drop(tx);

        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_receiver_wakes_on_push() {
        let (tx, mut rx) = drop_oldest::<u32>(1);

        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.push(7);

        assert_eq!(waiter.await.unwrap(), Some(7));
    }
}
