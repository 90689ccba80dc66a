//! Two-level grid of mutexes objects are distributed across.
//!
//! Grounded on `t51core/src/alloc.rs`'s `VecPool` (dense storage, reuse
//! before growth) for the overall "fixed footprint, index-addressed"
//! shape, generalized here to a 2-D `rows x cols` grid of `Mutex<()>` per
//! spec §4.1. Trades a fixed memory footprint and good cache locality for
//! not needing one mutex per object, while keeping per-object
//! synchronization genuinely parallel: two objects whose indices fall in
//! different mutex slabs never contend.

use std::sync::{Mutex, MutexGuard};

/// `rows x cols` grid of mutexes; object index `i` is protected by the
/// mutex at `(row, col)` derived from `i >> objs_per_mut_bits`.
pub struct MutexPool {
    rows_bits: u32,
    cols_bits: u32,
    objs_per_mut_bits: u32,
    rows: Vec<Vec<Mutex<()>>>,
}

impl MutexPool {
    /// `objects_per_mutex = 1 << objs_per_mut_bits` object indices share a
    /// mutex slot; the pool has `1 << (rows_bits + cols_bits)` mutexes in
    /// total.
    pub fn new(rows_bits: u32, cols_bits: u32, objs_per_mut_bits: u32) -> MutexPool {
        let row_count = 1usize << rows_bits;
        let col_count = 1usize << cols_bits;
        let rows = (0..row_count)
            .map(|_| (0..col_count).map(|_| Mutex::new(())).collect())
            .collect();
        MutexPool {
            rows_bits,
            cols_bits,
            objs_per_mut_bits,
            rows,
        }
    }

    /// Spec defaults: `mut_rows_bits = 8`, `mut_cols_bits = 8` (65,536
    /// mutexes total), `objs_per_mut_bits = 6` (64 objects per mutex).
    pub fn with_defaults() -> MutexPool {
        MutexPool::new(8, 8, 6)
    }

    #[inline]
    fn row_col(&self, object_index: usize) -> (usize, usize) {
        let mutex_slot = object_index >> self.objs_per_mut_bits;
        let col_mask = (1usize << self.cols_bits) - 1;
        let row_mask = (1usize << self.rows_bits) - 1;
        ((mutex_slot >> self.cols_bits) & row_mask, mutex_slot & col_mask)
    }

    /// The mutex protecting `object_index`. Any two indices whose
    /// `index >> objs_per_mut_bits` coincide share this same mutex.
    #[inline]
    pub fn mutex(&self, object_index: usize) -> &Mutex<()> {
        let (row, col) = self.row_col(object_index);
        &self.rows[row][col]
    }

    #[inline]
    pub fn lock(&self, object_index: usize) -> MutexGuard<'_, ()> {
        self.mutex(object_index).lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total number of distinct mutexes backing the grid.
    pub fn len(&self) -> usize {
        self.rows.len() * self.rows.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive upper bound of the contiguous run of indices starting at
    /// `index` that share its backing mutex, capped at `limit`.
    #[inline]
    pub fn slab_end(&self, index: usize, limit: usize) -> usize {
        let next = ((index >> self.objs_per_mut_bits) + 1) << self.objs_per_mut_bits;
        next.min(limit)
    }

    /// Visit every object index in `[range_start, range_end)` while holding
    /// each backing mutex exactly once, in ascending mutex-slot order. Used
    /// by broadcast paths so that a bulk scan amortizes lock cost instead
    /// of acquiring (and possibly re-acquiring) a mutex per index.
    pub fn visit_range<F: FnMut(usize)>(&self, range_start: usize, range_end: usize, mut f: F) {
        let mut index = range_start;

        while index < range_end {
            let _guard = self.lock(index);
            let local_end = self.slab_end(index, range_end);

            for i in index..local_end {
                f(i);
            }

            index = local_end;
        }
    }
}
