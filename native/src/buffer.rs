//! Bounded history of the most recent samples.
//!
//! The ingestion thread is the only writer. Display pollers read through
//! [`SampleBuffer::snapshot`], which copies the ring under the lock so a
//! reader never holds a reference into storage the writer is mutating.

use crate::sample::Sample;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of samples kept for display.
pub const DEFAULT_CAPACITY: usize = 512;

struct Ring {
    slots: Vec<Sample>,
    // Slot the next record lands in once the ring is full.
    next: usize,
    recorded: u64,
}

/// Fixed-capacity ring buffer with overwrite-oldest semantics.
pub struct SampleBuffer {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl SampleBuffer {
    /// Create a buffer holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                slots: Vec::with_capacity(capacity),
                next: 0,
                recorded: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample, replacing the oldest one when full.
    pub fn record(&self, sample: Sample) {
        let mut ring = self.lock();
        if ring.slots.len() < self.capacity {
            ring.slots.push(sample);
        } else {
            let slot = ring.next;
            ring.slots[slot] = sample;
        }
        ring.next = (ring.next + 1) % self.capacity;
        ring.recorded += 1;
    }

    /// Copy of the retained samples, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        let ring = self.lock();
        if ring.slots.len() < self.capacity {
            return ring.slots.clone();
        }

        let mut ordered = Vec::with_capacity(self.capacity);
        ordered.extend_from_slice(&ring.slots[ring.next..]);
        ordered.extend_from_slice(&ring.slots[..ring.next]);
        ordered
    }

    /// Most recently recorded sample.
    pub fn latest(&self) -> Option<Sample> {
        let ring = self.lock();
        if ring.slots.is_empty() {
            return None;
        }
        let index = (ring.next + self.capacity - 1) % self.capacity;
        ring.slots.get(index).copied()
    }

    pub fn clear(&self) {
        let mut ring = self.lock();
        ring.slots.clear();
        ring.next = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total samples recorded since creation. Survives `clear()`, so pollers
    /// can compare it between frames to skip unchanged redraws.
    pub fn recorded_total(&self) -> u64 {
        self.lock().recorded
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn sample(i: usize) -> Sample {
        Sample::new(i as f64, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_new_buffer() {
        let buffer = SampleBuffer::new(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 4);
        assert!(buffer.latest().is_none());
        assert!(buffer.snapshot().is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = SampleBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.record(sample(1));
        buffer.record(sample(2));
        assert_eq!(buffer.snapshot(), vec![sample(2)]);
    }

    #[test]
    fn test_partial_fill_keeps_order() {
        let buffer = SampleBuffer::new(8);
        for i in 0..5 {
            buffer.record(sample(i));
        }
        let expected: Vec<Sample> = (0..5).map(sample).collect();
        assert_eq!(buffer.snapshot(), expected);
        assert_eq!(buffer.latest(), Some(sample(4)));
    }

    #[test]
    fn test_overwrite_oldest() {
        let buffer = SampleBuffer::new(3);
        for i in 0..7 {
            buffer.record(sample(i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.snapshot(), vec![sample(4), sample(5), sample(6)]);
        assert_eq!(buffer.latest(), Some(sample(6)));
        assert_eq!(buffer.recorded_total(), 7);
    }

    #[test]
    fn test_clear() {
        let buffer = SampleBuffer::new(2);
        buffer.record(sample(1));
        buffer.record(sample(2));
        buffer.record(sample(3));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.latest().is_none());

        buffer.record(sample(9));
        assert_eq!(buffer.snapshot(), vec![sample(9)]);
        assert_eq!(buffer.recorded_total(), 4);
    }

    #[test]
    fn test_concurrent_snapshots_are_consistent() {
        const CAPACITY: usize = 64;
        const WRITES: usize = 20_000;

        let buffer = Arc::new(SampleBuffer::new(CAPACITY));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = buffer.snapshot();
                        assert!(snapshot.len() <= CAPACITY);
                        // Writer records strictly increasing x, so any valid
                        // point-in-time view is a run of consecutive values.
                        for pair in snapshot.windows(2) {
                            assert_eq!(pair[1].x, pair[0].x + 1.0);
                        }
                    }
                })
            })
            .collect();

        for i in 0..WRITES {
            buffer.record(sample(i));
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().expect("reader panicked");
        }

        let expected: Vec<Sample> = (WRITES - CAPACITY..WRITES).map(sample).collect();
        assert_eq!(buffer.snapshot(), expected);
    }

    proptest! {
        #[test]
        fn test_retains_last_capacity_samples(capacity in 1usize..64, count in 0usize..256) {
            let buffer = SampleBuffer::new(capacity);
            for i in 0..count {
                buffer.record(sample(i));
                prop_assert!(buffer.len() <= capacity);
            }

            let start = count.saturating_sub(capacity);
            let expected: Vec<Sample> = (start..count).map(sample).collect();
            prop_assert_eq!(buffer.snapshot(), expected);
        }
    }
}
