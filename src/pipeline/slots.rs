//! Lock-free admission counter for in-flight captures

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

struct Slots {
    available: CachePadded<AtomicUsize>,
    capacity: usize,
}

/// Counted slots limiting concurrent captures.
///
/// `try_acquire` is a compare-and-decrement that never goes below zero; the
/// returned guard gives the slot back when dropped, whatever path the
/// capture took.
#[derive(Clone)]
pub struct SlotPool {
    slots: Arc<Slots>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Slots {
                available: CachePadded::new(AtomicUsize::new(capacity)),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> Option<SlotGuard> {
        let mut current = self.slots.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.slots.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlotGuard {
                        slots: self.slots.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// One acquired slot
pub struct SlotGuard {
    slots: Arc<Slots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.available.fetch_add(1, Ordering::AcqRel);
    }
}
