//! Blocking FIFO between the capture path and the event consumer.
//!
//! Producers are capture tasks running on the proxy runtime; the consumer is
//! usually a synchronous caller waiting for the next decoded event. Both
//! sides are supported: [`ResponseQueue::dequeue_blocking`] parks the calling
//! thread, [`ResponseQueue::dequeue`] awaits inside a runtime.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// Thread-safe FIFO queue with blocking and async dequeue.
#[derive(Debug)]
pub struct ResponseQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    notify: Notify,
}

impl<T> Default for ResponseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Appends an item and wakes one waiting consumer.
    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
        self.notify.notify_one();
    }

    /// Pops the front item without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Blocks the current thread until an item is available, then pops it.
    pub fn dequeue_blocking(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.available.wait(&mut items);
        }
    }

    /// Like [`dequeue_blocking`](Self::dequeue_blocking) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Waits asynchronously until an item is available, then pops it.
    pub async fn dequeue(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return item;
            }
            notified.await;
        }
    }

    /// Drops every pending item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn dequeues_in_fifo_order() {
        let queue = ResponseQueue::new();
        queue.enqueue("e1");
        queue.enqueue("e2");
        queue.enqueue("e3");

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue_blocking(), "e1");
        assert_eq!(queue.dequeue_blocking(), "e2");
        assert_eq!(queue.dequeue_blocking(), "e3");
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_holds_across_blocking_waits() {
        let queue = Arc::new(ResponseQueue::new());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for value in 1..=3 {
                thread::sleep(Duration::from_millis(20));
                producer_queue.enqueue(value);
            }
        });

        let received: Vec<i32> = (0..3).map(|_| queue.dequeue_blocking()).collect();
        producer.join().unwrap();

        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn try_dequeue_on_empty_returns_none() {
        let queue: ResponseQueue<u8> = ResponseQueue::new();
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn dequeue_timeout_expires_when_empty() {
        let queue: ResponseQueue<u8> = ResponseQueue::new();
        let started = Instant::now();
        assert!(queue.dequeue_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn dequeue_timeout_returns_item_enqueued_while_waiting() {
        let queue = Arc::new(ResponseQueue::new());
        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer_queue.enqueue(7u8);
        });

        assert_eq!(queue.dequeue_timeout(Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn clear_drops_pending_items() {
        let queue = ResponseQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.clear();

        assert!(queue.is_empty());
        queue.enqueue(3);
        assert_eq!(queue.dequeue_blocking(), 3);
    }

    #[test]
    fn async_dequeue_is_pending_until_enqueue() {
        let queue = ResponseQueue::new();
        let mut task = tokio_test::task::spawn(queue.dequeue());

        tokio_test::assert_pending!(task.poll());
        queue.enqueue(5);
        assert!(task.is_woken());
        tokio_test::assert_ready_eq!(task.poll(), 5);
    }

    #[tokio::test]
    async fn async_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(ResponseQueue::new());
        let producer_queue = Arc::clone(&queue);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer_queue.enqueue("a");
            producer_queue.enqueue("b");
        });

        assert_eq!(queue.dequeue().await, "a");
        assert_eq!(queue.dequeue().await, "b");
    }
}
