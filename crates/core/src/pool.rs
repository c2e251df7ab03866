//! Power-of-two buffer pool for frame bodies.

use parking_lot::Mutex;

/// Buffers larger than `1 << MAX_CLASS` are not retained.
const MAX_CLASS: usize = 26;

/// Default number of buffers kept per size class.
pub const DEFAULT_PER_CLASS: usize = 16;

/// Pool of byte buffers bucketed by power-of-two capacity.
///
/// `get(n)` hands out a buffer of length `n` whose capacity is the next power
/// of two; `put` files a buffer under the largest power of two not above its
/// capacity, so a bucket never holds a buffer smaller than its class.
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    per_class: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PER_CLASS)
    }

    pub fn with_capacity(per_class: usize) -> Self {
        Self {
            classes: (0..=MAX_CLASS).map(|_| Mutex::new(Vec::new())).collect(),
            per_class,
        }
    }

    /// Zero-filled buffer of length `n`.
    pub fn get(&self, n: usize) -> Vec<u8> {
        if n == 0 {
            return Vec::new();
        }
        let size = n.next_power_of_two();
        let class = size.trailing_zeros() as usize;
        let reused = self.classes.get(class).and_then(|bucket| bucket.lock().pop());
        let mut buf = reused.unwrap_or_else(|| Vec::with_capacity(size));
        buf.clear();
        buf.resize(n, 0);
        buf
    }

    pub fn put(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap == 0 {
            return;
        }
        let class = (usize::BITS - 1 - cap.leading_zeros()) as usize;
        if let Some(bucket) = self.classes.get(class) {
            let mut bucket = bucket.lock();
            if bucket.len() < self.per_class {
                bucket.push(buf);
            }
        }
    }

    /// Buffers currently held for size class `1 << class`.
    pub fn pooled(&self, class: usize) -> usize {
        self.classes.get(class).map(|b| b.lock().len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
