//! Counting semaphore with explicit acquire/release.

/// FIFO counting semaphore.
///
/// `acquire` takes a unit immediately when one is available and otherwise
/// waits behind every earlier waiter. `release` hands the unit to the
/// longest waiter, or returns it to the pool when nobody waits.
///
/// Units are not tied to a guard: callers pair every `acquire` with a
/// `release` themselves.
#[derive(Debug)]
pub struct Semaphore {
    inner: tokio::sync::Semaphore,
}

impl Semaphore {
    /// Creates a semaphore holding `count` units.
    pub fn new(count: usize) -> Self {
        Self {
            inner: tokio::sync::Semaphore::new(count),
        }
    }

    /// Takes one unit, waiting in arrival order if none is free.
    pub async fn acquire(&self) {
        // The inner semaphore is never closed, so acquisition cannot fail.
        if let Ok(permit) = self.inner.acquire().await {
            permit.forget();
        }
    }

    /// Takes one unit only if it is free right now.
    pub fn try_acquire(&self) -> bool {
        match self.inner.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns one unit, waking the longest waiter if there is one.
    pub fn release(&self) {
        self.inner.add_permits(1);
    }

    /// Units currently free.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn third_acquire_waits_for_release() {
        let sem = Arc::new(Semaphore::new(2));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&sem);
                tokio::spawn(async move { s.acquire().await })
            })
            .collect();
        settle().await;

        let finished = handles.iter().filter(|h| h.is_finished()).count();
        assert_eq!(finished, 2);
        assert_eq!(sem.available(), 0);

        sem.release();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn release_without_waiters_increments() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn waiters_are_woken_in_fifo_order() {
        let sem = Arc::new(Semaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let s = Arc::clone(&sem);
            let o = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                s.acquire().await;
                o.lock().unwrap().push(i);
            }));
            // Make sure waiter `i` is queued before `i + 1`.
            settle().await;
        }

        for _ in 0..3 {
            sem.release();
            settle().await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
