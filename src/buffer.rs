//! Bounded sorted candidate buffer
//!
//! The frontier set for graph traversal: a capacity-bounded array of
//! `(id, distance)` candidates kept sorted by distance ascending. Checked
//! state is overlaid in the top bit of the id, so ids must fit in 31 bits.
//! One extra slot past the capacity absorbs the shift when a full buffer
//! takes an insertion.

use crate::memory::AlignedVec;
use crate::{Candidate, SaqError};

const CHECKED_BIT: u32 = 1 << 31;
const ID_MASK: u32 = CHECKED_BIT - 1;

/// Sorted linear buffer used as the beam set for graph-based search.
#[derive(Debug)]
pub struct SearchBuffer {
    data: AlignedVec<Candidate>,
    size: usize,
    cur: usize,
    capacity: usize,
}

impl SearchBuffer {
    pub fn new(capacity: usize) -> Result<Self, SaqError> {
        Ok(Self {
            data: AlignedVec::zeroed(capacity + 1, 64)?,
            size: 0,
            cur: 0,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Smallest index whose stored distance is not below `dist`.
    fn binary_search(&self, dist: f32) -> usize {
        let mut lo = 0usize;
        let mut len = self.size;
        while len > 1 {
            let half = len >> 1;
            len -= half;
            lo += usize::from(self.data[lo + half - 1].distance < dist) * half;
        }
        if lo < self.size && self.data[lo].distance < dist {
            lo + 1
        } else {
            lo
        }
    }

    fn set_checked(id: &mut u32) {
        *id |= CHECKED_BIT;
    }

    fn is_checked(id: u32) -> bool {
        id >> 31 != 0
    }

    /// Insert a candidate, keeping the buffer sorted. A full buffer rejects
    /// anything beyond its current worst distance.
    pub fn insert(&mut self, id: u32, dist: f32) {
        debug_assert_eq!(id & CHECKED_BIT, 0, "ids must fit in 31 bits");
        if self.is_full_with(dist) {
            return;
        }

        let lo = self.binary_search(dist);
        self.data.copy_within(lo..self.size, lo + 1);
        self.data[lo] = Candidate::new(id, dist);
        self.size += usize::from(self.size < self.capacity);
        if lo < self.cur {
            self.cur = lo;
        }
    }

    /// Mark the closest unchecked candidate as checked and return its id.
    pub fn pop(&mut self) -> u32 {
        debug_assert!(self.has_next());
        let id = self.data[self.cur].id & ID_MASK;
        Self::set_checked(&mut self.data[self.cur].id);
        self.cur += 1;
        while self.cur < self.size && Self::is_checked(self.data[self.cur].id) {
            self.cur += 1;
        }
        id
    }

    /// Id that the next `pop` would return; the checked flag may still be
    /// set on it.
    pub fn next_id(&self) -> u32 {
        self.data[self.cur].id
    }

    pub fn has_next(&self) -> bool {
        self.cur < self.size
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.cur = 0;
    }

    /// Worst retained distance, or infinity while the buffer has room.
    pub fn top_dist(&self) -> f32 {
        if self.is_full() {
            self.data[self.size - 1].distance
        } else {
            f32::INFINITY
        }
    }

    pub fn is_full(&self) -> bool {
        self.size == self.capacity
    }

    /// Whether a candidate at `dist` would be rejected.
    pub fn is_full_with(&self, dist: f32) -> bool {
        dist > self.top_dist()
    }

    /// Copy the retained ids in distance order, stripping the checked bit.
    pub fn copy_results(&self, knn: &mut [u32]) {
        assert!(knn.len() >= self.size);
        for (out, candidate) in knn.iter_mut().zip(self.data[..self.size].iter()) {
            *out = candidate.id & ID_MASK;
        }
    }

    /// Reallocate for a new capacity; prior contents are discarded.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), SaqError> {
        self.data = AlignedVec::zeroed(new_capacity + 1, 64)?;
        self.capacity = new_capacity;
        self.size = 0;
        self.cur = 0;
        Ok(())
    }
}
