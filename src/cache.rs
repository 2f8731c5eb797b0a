//! Latest-value cache: the single-writer-many-reader holder of the most
//! recent frame and focus sample.
//!
//! One lock protects the pair, so a reader never observes a half-updated
//! combination. The lock is held only for the copy/swap, never across
//! capture or fitting work. There is no history and no queue; a consumer
//! reading twice between capture ticks sees the same value twice.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::{FocusSample, Frame};

struct CacheInner {
    frame: Option<Frame>,
    focus: FocusSample,
}

/// Process-wide holder of the most recent `(Frame, FocusSample)` pair.
///
/// Constructed once and shared (via `Arc`) with the bus publisher, the
/// debug stream and the control surface; there is no ambient/static access.
pub struct LatestValueCache {
    inner: RwLock<CacheInner>,
    updates: AtomicU64,
}

impl LatestValueCache {
    /// Empty cache: no frame yet, `NaN` focus placeholder so a focus query
    /// always has an answer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                frame: None,
                focus: FocusSample::invalid(),
            }),
            updates: AtomicU64::new(0),
        }
    }

    /// Atomically replace the pair. The previous frame is dropped here;
    /// nothing older than the latest value is retained.
    pub fn store(&self, frame: Frame, focus: FocusSample) {
        {
            let mut inner = self.inner.write();
            inner.frame = Some(frame);
            inner.focus = focus;
        }
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Defensive copy of the latest frame, `None` before the first capture.
    #[must_use]
    pub fn latest_frame(&self) -> Option<Frame> {
        self.inner.read().frame.clone()
    }

    /// The latest focus sample (the startup placeholder before the first
    /// completed tick).
    #[must_use]
    pub fn latest_focus(&self) -> FocusSample {
        self.inner.read().focus
    }

    /// Both halves of the pair from a single critical section.
    #[must_use]
    pub fn snapshot(&self) -> (Option<Frame>, FocusSample) {
        let inner = self.inner.read();
        (inner.frame.clone(), inner.focus)
    }

    #[must_use]
    pub fn has_frame(&self) -> bool {
        self.inner.read().frame.is_some()
    }

    /// Number of completed `store` calls.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Default for LatestValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 12], 4, 3, 1)
    }

    #[test]
    fn starts_empty_with_nan_placeholder() {
        let cache = LatestValueCache::new();
        assert!(cache.latest_frame().is_none());
        assert!(!cache.has_frame());
        assert!(cache.latest_focus().focus.is_nan());
        assert_eq!(cache.update_count(), 0);
    }

    #[test]
    fn store_replaces_the_pair() {
        let cache = LatestValueCache::new();
        cache.store(test_frame(1), FocusSample::new(1.0));
        cache.store(test_frame(2), FocusSample::new(2.0));

        let (frame, focus) = cache.snapshot();
        assert_eq!(frame.unwrap().pixels[0], 2);
        assert_eq!(focus.focus, 2.0);
        assert_eq!(cache.update_count(), 2);
    }

    #[test]
    fn repeated_reads_observe_the_same_value() {
        let cache = LatestValueCache::new();
        cache.store(test_frame(7), FocusSample::new(0.5));
        let a = cache.latest_focus();
        let b = cache.latest_focus();
        assert_eq!(a, b);
    }

    #[test]
    fn readers_get_copies_not_references() {
        let cache = LatestValueCache::new();
        cache.store(test_frame(3), FocusSample::new(0.1));

        let mut copy = cache.latest_frame().unwrap();
        copy.pixels[0] = 99;
        assert_eq!(cache.latest_frame().unwrap().pixels[0], 3);
    }

    #[test]
    fn sentinel_values_are_stored_verbatim() {
        let cache = LatestValueCache::new();
        cache.store(test_frame(1), FocusSample::new(f64::INFINITY));
        assert!(cache.latest_focus().focus.is_infinite());

        cache.store(test_frame(1), FocusSample::new(f64::NAN));
        assert!(cache.latest_focus().focus.is_nan());
    }
}
