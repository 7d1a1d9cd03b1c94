//! # Work Unit Queue
//!
//! An unbounded FIFO shared by one producer and any number of consumers.
//!
//! Items are kept in a mutex-guarded deque; consumers park on a [`Notify`]
//! while the queue is empty. Closing the queue lets consumers drain the
//! backlog and then observe `None`, which is how dispatcher workers learn
//! that no more work will arrive. One queue exists per instance type.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Cloneable handle to a shared FIFO queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an item. Returns the item back if the queue is already closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Stop accepting items. Consumers still receive everything queued so far.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Take the oldest item without waiting.
    ///
    /// `Ok(None)` means the queue is empty but still open; `Err(())` means it
    /// is closed and fully drained.
    #[allow(clippy::result_unit_err)]
    pub fn try_pop(&self) -> Result<Option<T>, ()> {
        let (item, left) = {
            let mut state = self.inner.state.lock();
            match state.items.pop_front() {
                Some(item) => (item, state.items.len()),
                None if state.closed => return Err(()),
                None => return Ok(None),
            }
        };

        debug!(left, "work units left in queue");
        if left > 0 {
            // pass the wakeup on in case the waiter that got it went away
            self.inner.notify.notify_one();
        }
        Ok(Some(item))
    }

    /// Wait for the oldest item. Returns `None` once the queue is closed and
    /// drained.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a close() in between is not missed
            notified.as_mut().enable();

            match self.try_pop() {
                Ok(Some(item)) => return Some(item),
                Err(()) => return None,
                Ok(None) => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = WorkQueue::new();
        for c in ['A', 'B', 'C'] {
            q.push(c).unwrap();
        }
        q.close();

        assert_eq!(q.pop().await, Some('A'));
        assert_eq!(q.pop().await, Some('B'));
        assert_eq!(q.pop().await, Some('C'));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn test_push_after_close_rejected() {
        let q = WorkQueue::new();
        q.close();
        assert_eq!(q.push(1), Err(1));
        assert!(q.is_closed());
        assert_eq!(q.try_pop(), Err(()));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumers() {
        let q: WorkQueue<u32> = WorkQueue::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.pop().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();

        for w in waiters {
            let res = tokio::time::timeout(Duration::from_secs(5), w)
                .await
                .expect("consumer was not woken")
                .unwrap();
            assert_eq!(res, None);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_with_randomized_delays() {
        let q = WorkQueue::new();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                for i in 0..200u32 {
                    let delay = rand::thread_rng().gen_range(0..200);
                    tokio::time::sleep(Duration::from_micros(delay)).await;
                    q.push(i).unwrap();
                }
                q.close();
            })
        };

        let mut received = Vec::new();
        while let Some(i) = q.pop().await {
            let delay = rand::thread_rng().gen_range(0..200);
            tokio::time::sleep(Duration::from_micros(delay)).await;
            received.push(i);
        }
        producer.await.unwrap();

        assert_eq!(received, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_consumers_take_each_item_once() {
        let q = WorkQueue::new();
        for i in 0..1000u32 {
            q.push(i).unwrap();
        }
        q.close();

        let consumers: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(i) = q.pop().await {
                        got.push(i);
                    }
                    got
                })
            })
            .collect();

        let mut all = Vec::new();
        for c in consumers {
            let got = c.await.unwrap();
            // each consumer sees its share in queue order
            assert!(got.windows(2).all(|w| w[0] < w[1]));
            all.extend(got);
        }
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }
}
