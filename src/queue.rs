//! Mutex-guarded work queue with a counting signal, and the stack-wide
//! shutdown flag observed by every worker.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{watch, Semaphore};

/// Owner side of the shutdown flag. Set once, never cleared.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raise the flag. Returns `false` if it was already raised.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the shutdown flag
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the flag is raised or its owner is gone
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }
}

/// FIFO queue where every push adds one permit and every pop consumes one.
///
/// Consumers block on the semaphore, not on the lock; the lock is only held
/// for the push or pop itself.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Semaphore,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            signal: Semaphore::new(0),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push an item, handing it back if the queue is full
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.signal.add_permits(1);
        Ok(())
    }

    /// Wait for the oldest item. Returns `None` once shutdown is raised;
    /// items still queued at that point are left unprocessed.
    pub async fn pop(&self, shutdown: &mut Shutdown) -> Option<T> {
        if shutdown.is_triggered() {
            return None;
        }
        tokio::select! {
            biased;
            _ = shutdown.triggered() => None,
            permit = self.signal.acquire() => {
                permit.ok()?.forget();
                self.lock().pop_front()
            }
        }
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        let permit = self.signal.try_acquire().ok()?;
        permit.forget();
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let trigger = ShutdownTrigger::new();
        let mut shutdown = trigger.subscribe();
        let queue = WorkQueue::new(8);
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.pop(&mut shutdown).await, Some(0));
        assert_eq!(queue.pop(&mut shutdown).await, Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_bounded_push() {
        let queue = WorkQueue::new(2);
        assert!(queue.push("a").is_ok());
        assert!(queue.push("b").is_ok());
        assert_eq!(queue.push("c"), Err("c"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_push() {
        let trigger = ShutdownTrigger::new();
        let queue = Arc::new(WorkQueue::new(4));

        let consumer = {
            let queue = Arc::clone(&queue);
            let mut shutdown = trigger.subscribe();
            tokio::spawn(async move { queue.pop(&mut shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42u32).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_consumer() {
        let trigger = ShutdownTrigger::new();
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));

        let consumer = {
            let queue = Arc::clone(&queue);
            let mut shutdown = trigger.subscribe();
            tokio::spawn(async move { queue.pop(&mut shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(trigger.trigger());
        assert!(!trigger.trigger());
        assert_eq!(consumer.await.unwrap(), None);

        queue.push(1).unwrap();
        let mut late = trigger.subscribe();
        assert_eq!(queue.pop(&mut late).await, None);
    }
}
