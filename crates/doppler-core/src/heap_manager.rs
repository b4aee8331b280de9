//! Heap Manager: per-model memory budget accounting and eviction hints
//! (spec §4.5).
//!
//! Unlike the buffer pool, the heap manager never frees anything itself —
//! it only tracks resident bytes against an advisory ceiling and reports
//! pressure. Grounded on `kv-cache-tier`'s per-device `utilization()`
//! reporting, generalized to per-category (weights / kv / scratch) rather
//! than per-device.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::buffer_pool::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Weights,
    KvCache,
    Scratch,
}

#[derive(Debug, Default, Clone)]
pub struct CategorySnapshot {
    pub category: &'static str,
    pub bytes: u64,
    pub buffer_count: usize,
}

#[derive(Debug, Default, Clone)]
pub struct HeapSnapshot {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub ceiling_bytes: Option<u64>,
    pub per_category: Vec<CategorySnapshot>,
}

struct Entry {
    category: Category,
    bytes: u64,
}

struct Inner {
    entries: HashMap<u64, Entry>,
    current_bytes: u64,
    peak_bytes: u64,
}

/// Tracks the pipeline's total resident bytes against an advisory ceiling.
/// `register`/`unregister` are called on buffer acquire/release; it never
/// frees buffers itself, only signals pressure via `is_over_ceiling`.
pub struct HeapManager {
    ceiling_bytes: Option<u64>,
    inner: Mutex<Inner>,
}

impl HeapManager {
    pub fn new(ceiling_bytes: Option<u64>) -> Self {
        Self {
            ceiling_bytes,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                current_bytes: 0,
                peak_bytes: 0,
            }),
        }
    }

    pub fn register(&self, buffer: &Buffer, category: Category) {
        let mut inner = self.inner.lock().expect("heap manager mutex poisoned");
        inner.entries.insert(
            buffer.id.raw(),
            Entry {
                category,
                bytes: buffer.bucket_size,
            },
        );
        inner.current_bytes += buffer.bucket_size;
        if inner.current_bytes > inner.peak_bytes {
            inner.peak_bytes = inner.current_bytes;
        }
    }

    pub fn unregister(&self, buffer: &Buffer) {
        let mut inner = self.inner.lock().expect("heap manager mutex poisoned");
        if let Some(entry) = inner.entries.remove(&buffer.id.raw()) {
            inner.current_bytes = inner.current_bytes.saturating_sub(entry.bytes);
        }
    }

    /// Drops all tracking without freeing anything (the buffer pool, not
    /// the heap manager, owns actual deallocation).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("heap manager mutex poisoned");
        inner.entries.clear();
        inner.current_bytes = 0;
    }

    pub fn is_over_ceiling(&self) -> bool {
        let inner = self.inner.lock().expect("heap manager mutex poisoned");
        matches!(self.ceiling_bytes, Some(c) if inner.current_bytes > c)
    }

    pub fn snapshot(&self) -> HeapSnapshot {
        let inner = self.inner.lock().expect("heap manager mutex poisoned");
        let mut totals: HashMap<Category, (u64, usize)> = HashMap::new();
        for entry in inner.entries.values() {
            let slot = totals.entry(entry.category).or_default();
            slot.0 += entry.bytes;
            slot.1 += 1;
        }
        let mut per_category: Vec<CategorySnapshot> = totals
            .into_iter()
            .map(|(cat, (bytes, count))| CategorySnapshot {
                category: match cat {
                    Category::Weights => "weights",
                    Category::KvCache => "kv_cache",
                    Category::Scratch => "scratch",
                },
                bytes,
                buffer_count: count,
            })
            .collect();
        per_category.sort_by_key(|c| c.category);

        HeapSnapshot {
            current_bytes: inner.current_bytes,
            peak_bytes: inner.peak_bytes,
            ceiling_bytes: self.ceiling_bytes,
            per_category,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;

    #[test]
    fn register_unregister_round_trips() {
        let pool = BufferPool::new(u64::MAX, u64::MAX, 0);
        let heap = HeapManager::new(Some(4096));
        let buf = pool.acquire(1000, "weights").unwrap();
        heap.register(&buf, Category::Weights);
        assert!(heap.snapshot().current_bytes > 0);
        heap.unregister(&buf);
        assert_eq!(heap.snapshot().current_bytes, 0);
        pool.release(buf);
    }

    #[test]
    fn reset_drops_all_tracking() {
        let pool = BufferPool::new(u64::MAX, u64::MAX, 0);
        let heap = HeapManager::new(None);
        let buf = pool.acquire(1000, "weights").unwrap();
        heap.register(&buf, Category::Weights);
        heap.reset();
        assert_eq!(heap.snapshot().current_bytes, 0);
        pool.release(buf);
    }

    #[test]
    fn signals_pressure_over_ceiling() {
        let pool = BufferPool::new(u64::MAX, u64::MAX, 0);
        let heap = HeapManager::new(Some(100));
        let buf = pool.acquire(1000, "weights").unwrap();
        heap.register(&buf, Category::Weights);
        assert!(heap.is_over_ceiling());
        pool.release(buf);
    }
}
