//! Sliding-window key counter for spotting hot keys.
//!
//! The window holds the last `qsize` keys seen. A key whose count within the
//! window exceeds `threshold` fires the trigger on every further sighting.

use std::collections::HashMap;
use std::sync::Arc;

use craftblock_core::Cid;
use parking_lot::Mutex;

/// Called with a key that crossed the threshold.
pub type HotKeyTrigger = Arc<dyn Fn(&Cid) + Send + Sync>;

struct Window {
    events: Vec<Option<Cid>>,
    cursor: usize,
    counts: HashMap<Cid, usize>,
}

pub struct FrequencyFilter {
    window: Mutex<Window>,
    threshold: usize,
    trigger: HotKeyTrigger,
}

impl FrequencyFilter {
    /// A zero `qsize` is treated as a window of one key.
    pub fn new(qsize: usize, threshold: usize, trigger: HotKeyTrigger) -> Self {
        Self {
            window: Mutex::new(Window {
                events: vec![None; qsize.max(1)],
                cursor: 0,
                counts: HashMap::new(),
            }),
            threshold,
            trigger,
        }
    }

    pub fn add_key(&self, key: Cid) {
        let hot = {
            let mut w = self.window.lock();
            let cursor = w.cursor;
            if let Some(old) = w.events[cursor].take() {
                if let Some(count) = w.counts.get_mut(&old) {
                    *count -= 1;
                    if *count == 0 {
                        w.counts.remove(&old);
                    }
                }
            }
            w.events[cursor] = Some(key);
            let count = w.counts.entry(key).or_insert(0);
            *count += 1;
            let hot = *count > self.threshold;
            w.cursor = (cursor + 1) % w.events.len();
            hot
        };
        // Lock released: the trigger may call back into the filter.
        if hot {
            (self.trigger)(&key);
        }
    }

    /// Sightings of `key` in the current window.
    pub fn count(&self, key: &Cid) -> usize {
        self.window.lock().counts.get(key).copied().unwrap_or(0)
    }

    pub fn qsize(&self) -> usize {
        self.window.lock().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftblock_core::Block;

    fn key(n: u32) -> Cid {
        *Block::new(n.to_be_bytes().to_vec()).cid()
    }

    fn recording(threshold: usize, qsize: usize) -> (FrequencyFilter, Arc<Mutex<Vec<Cid>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let filter = FrequencyFilter::new(qsize, threshold, Arc::new(move |k: &Cid| sink.lock().push(*k)));
        (filter, fired)
    }

    #[test]
    fn test_fires_above_threshold() {
        let (filter, fired) = recording(2, 8);
        let hot = key(1);
        filter.add_key(hot);
        filter.add_key(hot);
        assert!(fired.lock().is_empty());
        filter.add_key(hot);
        assert_eq!(*fired.lock(), vec![hot]);
        assert_eq!(filter.count(&hot), 3);
    }

    #[test]
    fn test_old_sightings_leave_the_window() {
        let (filter, fired) = recording(1, 4);
        let k = key(1);
        filter.add_key(k);
        for n in 10..14 {
            filter.add_key(key(n));
        }
        assert_eq!(filter.count(&k), 0);
        filter.add_key(k);
        assert!(fired.lock().is_empty());
    }

    #[test]
    fn test_unique_keys_never_fire() {
        let (filter, fired) = recording(1, 16);
        for n in 0..100 {
            filter.add_key(key(n));
        }
        assert!(fired.lock().is_empty());
        assert_eq!(filter.qsize(), 16);
    }

    #[test]
    fn test_trigger_can_reenter_filter() {
        let filter = Arc::new(Mutex::new(None::<Arc<FrequencyFilter>>));
        let slot = filter.clone();
        let built = Arc::new(FrequencyFilter::new(
            4,
            0,
            Arc::new(move |k: &Cid| {
                if let Some(f) = slot.lock().as_ref() {
                    let _ = f.count(k);
                }
            }),
        ));
        *filter.lock() = Some(built.clone());
        built.add_key(key(7));
        assert_eq!(built.count(&key(7)), 1);
    }
}
