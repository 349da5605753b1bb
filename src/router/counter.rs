//! Response sequence counter

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide response sequence.
///
/// Starts at zero, advances once per produced response, never goes back.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Take the current value and advance
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Value the next response will get
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_take_and_increment() {
        let counter = SequenceCounter::starting_at(5);
        assert_eq!(counter.next(), 5);
        assert_eq!(counter.current(), 6);
    }

    #[test]
    fn test_unique_across_threads() {
        let counter = Arc::new(SequenceCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..1000).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate sequence {}", value);
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(counter.current(), 8000);
    }
}
