//! Admission control
//!
//! Bounds the number of in-flight tasks to the pool capacity so excess
//! submissions are rejected up front instead of queueing on the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct AdmissionController {
    in_flight: AtomicUsize,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Take one slot if the counter is below capacity
    pub fn try_admit(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give one slot back; never goes below zero
    pub fn release_one(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Guarded form of `try_admit`
    pub fn admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.try_admit().then(|| AdmissionPermit {
            controller: self.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One admitted task; releases its slot when dropped
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release_one();
    }
}
