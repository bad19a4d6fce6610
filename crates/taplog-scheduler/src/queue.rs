//! Batch queue: ordered, append-only buffer plus the size policy.
//! Knows nothing about time; the engine owns the interval window.

use taplog_core::BatchPolicy;

/// Pending events waiting for the next flush.
#[derive(Debug)]
pub struct BatchQueue<T> {
    pending: Vec<T>,
    threshold: usize,
    enabled: bool,
}

impl<T> BatchQueue<T> {
    pub fn new(policy: &BatchPolicy) -> Self {
        let threshold = if policy.enabled {
            policy.threshold_size.max(1)
        } else {
            1
        };
        Self {
            pending: Vec::with_capacity(threshold),
            threshold,
            enabled: policy.enabled,
        }
    }

    /// Append an event.
    ///
    /// Returns the drained batch when this push reached the threshold.
    /// With batching disabled every push returns a batch of one.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.pending.push(item);
        if self.pending.len() >= self.threshold {
            Some(self.drain())
        } else {
            None
        }
    }

    /// Take every pending event, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.threshold))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_below_threshold_keeps_events() {
        let mut queue = BatchQueue::new(&BatchPolicy::new(5, Duration::from_millis(500)));
        for i in 0..4 {
            assert!(queue.push(i).is_none());
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_threshold_drains_in_order() {
        let mut queue = BatchQueue::new(&BatchPolicy::new(3, Duration::from_millis(500)));
        assert!(queue.push("a").is_none());
        assert!(queue.push("b").is_none());
        assert_eq!(queue.push("c"), Some(vec!["a", "b", "c"]));
        assert!(queue.is_empty());

        // Next window starts from scratch
        assert!(queue.push("d").is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_disabled_is_batch_of_one() {
        let mut queue = BatchQueue::new(&BatchPolicy::disabled());
        assert!(!queue.is_enabled());
        assert_eq!(queue.threshold(), 1);
        assert_eq!(queue.push(7), Some(vec![7]));
        assert_eq!(queue.push(8), Some(vec![8]));
    }

    #[test]
    fn test_drain_empty() {
        let mut queue: BatchQueue<u8> = BatchQueue::new(&BatchPolicy::default());
        assert!(queue.drain().is_empty());
    }
}
