use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
};

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Bounded pool of isolation slots shared by concurrent submissions.
pub struct SlotPool {
    capacity: usize,
    free: Mutex<usize>,
    released: Condvar,
}

/// Held for the whole isolated run, given back on drop.
pub struct SlotGuard<'a> {
    pool: &'a SlotPool,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.free.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a slot is free or `cancel` fires.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<SlotGuard<'_>> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if *free > 0 {
                *free -= 1;
                return Ok(SlotGuard { pool: self });
            }
            free = self
                .released
                .wait_timeout(free, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn release(&self) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        *free += 1;
        self.released.notify_one();
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn guard_returns_slot() -> Result<()> {
        let pool = SlotPool::new(2);
        let cancel = CancelToken::new();
        {
            let _a = pool.acquire(&cancel)?;
            let _b = pool.acquire(&cancel)?;
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
        Ok(())
    }

    #[test]
    fn cancelled_waiter_gives_up() -> Result<()> {
        let pool = Arc::new(SlotPool::new(1));
        let cancel = CancelToken::new();
        let _held = pool.acquire(&cancel)?;

        let waiter_pool = pool.clone();
        let waiter_cancel = cancel.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire(&waiter_cancel).is_err());

        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        assert!(waiter.join().unwrap());
        Ok(())
    }

    #[test]
    fn waiter_wakes_on_release() -> Result<()> {
        let pool = Arc::new(SlotPool::new(1));
        let held = pool.acquire(&CancelToken::new())?;

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire(&CancelToken::new()).is_ok());

        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(pool.available(), 1);
        Ok(())
    }
}
