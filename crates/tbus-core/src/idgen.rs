//! Minimum-value id allocation.
//!
//! [`MinIdGen`] always hands out the numerically smallest id that is not
//! currently held. Ids are grouped into [`BitBucket`]s of 256 where a set bit
//! means *free*; a bucket that becomes entirely free again is discarded so a
//! burst of allocations does not pin memory forever.
//!
//! The same [`BitBucket`] doubles as the slot bitmap of a
//! [`LocalBus`][crate::bus::LocalBus] (256 one-byte addresses).

/// Bits in one bucket.
pub const BUCKET_BITS: u32 = 256;

/// Shift converting an id into its bucket index.
pub const BUCKET_SHIFT: u32 = 8;

const WORDS: usize = (BUCKET_BITS as usize) / 64;

/// 256-bit set stored as four `u64` words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitBucket {
    words: [u64; WORDS],
}

impl BitBucket {
    /// Every bit set.
    pub const fn full() -> Self {
        Self {
            words: [u64::MAX; WORDS],
        }
    }

    /// Every bit clear.
    pub const fn empty() -> Self {
        Self { words: [0; WORDS] }
    }

    pub fn set(&mut self, bit: u8) {
        let bit = usize::from(bit);
        self.words[bit / 64] |= 1u64 << (bit % 64);
    }

    pub fn clear(&mut self, bit: u8) {
        let bit = usize::from(bit);
        self.words[bit / 64] &= !(1u64 << (bit % 64));
    }

    pub fn test(&self, bit: u8) -> bool {
        let bit = usize::from(bit);
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Lowest set bit, if any.
    pub fn first_set(&self) -> Option<u8> {
        self.words.iter().enumerate().find_map(|(i, &word)| {
            (word != 0).then(|| (i * 64 + word.trailing_zeros() as usize) as u8)
        })
    }

    pub fn all(&self) -> bool {
        self.words.iter().all(|&w| w == u64::MAX)
    }

    pub fn none(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

impl Default for BitBucket {
    fn default() -> Self {
        Self::empty()
    }
}

/// Allocator returning the smallest free `u32`.
///
/// ```
/// use tbus_core::idgen::MinIdGen;
///
/// let mut ids = MinIdGen::new();
/// assert_eq!(ids.alloc(), 0);
/// assert_eq!(ids.alloc(), 1);
/// ids.release(0);
/// assert_eq!(ids.alloc(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MinIdGen {
    /// `None` stands for a bucket that is entirely free.
    buckets: Vec<Option<BitBucket>>,
}

impl MinIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> u32 {
        let index = self
            .buckets
            .iter()
            .position(|bkt| bkt.as_ref().is_none_or(|b| !b.none()))
            .unwrap_or(self.buckets.len());
        if index == self.buckets.len() {
            self.buckets.push(None);
        }
        let bucket = self.buckets[index].get_or_insert_with(BitBucket::full);
        // The scan above only stops at buckets with a free bit.
        let bit = bucket.first_set().unwrap_or_default();
        bucket.clear(bit);
        ((index as u32) << BUCKET_SHIFT) + u32::from(bit)
    }

    /// Return `id` to the pool. Releasing an id that is not held is a no-op.
    pub fn release(&mut self, id: u32) {
        let index = (id >> BUCKET_SHIFT) as usize;
        let Some(slot) = self.buckets.get_mut(index) else {
            return;
        };
        let Some(bucket) = slot else {
            return;
        };
        bucket.set((id & (BUCKET_BITS - 1)) as u8);
        if bucket.all() {
            *slot = None;
            while matches!(self.buckets.last(), Some(None)) {
                self.buckets.pop();
            }
        }
    }

    /// Whether `id` is currently allocated.
    pub fn is_held(&self, id: u32) -> bool {
        match self.buckets.get((id >> BUCKET_SHIFT) as usize) {
            Some(Some(bucket)) => !bucket.test((id & (BUCKET_BITS - 1)) as u8),
            _ => false,
        }
    }

    /// Number of buckets currently materialised.
    pub fn bucket_count(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn bucket_first_set_crosses_words() {
        let mut bucket = BitBucket::empty();
        assert_eq!(bucket.first_set(), None);
        bucket.set(200);
        bucket.set(130);
        assert_eq!(bucket.first_set(), Some(130));
        bucket.clear(130);
        assert_eq!(bucket.first_set(), Some(200));
        assert!(bucket.test(200));
        assert_eq!(bucket.count_ones(), 1);
    }

    #[test]
    fn full_bucket_reports_all() {
        let mut bucket = BitBucket::full();
        assert!(bucket.all());
        bucket.clear(255);
        assert!(!bucket.all());
        assert_eq!(bucket.first_set(), Some(0));
    }

    #[test]
    fn allocates_sequentially_across_buckets() {
        let mut ids = MinIdGen::new();
        for expected in 0..300 {
            assert_eq!(ids.alloc(), expected);
        }
        assert_eq!(ids.bucket_count(), 2);
    }

    #[test]
    fn released_id_is_reused_first() {
        let mut ids = MinIdGen::new();
        for _ in 0..10 {
            ids.alloc();
        }
        ids.release(4);
        ids.release(7);
        assert!(!ids.is_held(4));
        assert_eq!(ids.alloc(), 4);
        assert_eq!(ids.alloc(), 7);
        assert_eq!(ids.alloc(), 10);
    }

    #[test]
    fn entirely_free_bucket_is_discarded() {
        let mut ids = MinIdGen::new();
        let held: Vec<u32> = (0..260).map(|_| ids.alloc()).collect();
        for id in held.iter().filter(|&&id| id >= 256) {
            ids.release(*id);
        }
        assert_eq!(ids.bucket_count(), 1);
        for id in held.iter().filter(|&&id| id < 256) {
            ids.release(*id);
        }
        assert_eq!(ids.bucket_count(), 0);
        assert_eq!(ids.alloc(), 0);
    }

    #[test]
    fn discarded_middle_bucket_is_recreated() {
        let mut ids = MinIdGen::new();
        let held: Vec<u32> = (0..600).map(|_| ids.alloc()).collect();
        for id in held.iter().filter(|&&id| (256..512).contains(&id)) {
            ids.release(*id);
        }
        assert_eq!(ids.bucket_count(), 2);
        assert_eq!(ids.alloc(), 256);
    }

    #[test]
    fn releasing_unknown_id_is_noop() {
        let mut ids = MinIdGen::new();
        ids.release(12345);
        ids.release(0);
        assert_eq!(ids.alloc(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        Release(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![3 => Just(Op::Alloc), 2 => any::<usize>().prop_map(Op::Release)],
            0..800,
        )
    }

    proptest! {
        #[test]
        fn alloc_always_returns_smallest_free(ops in ops()) {
            let mut ids = MinIdGen::new();
            let mut held = BTreeSet::new();
            for op in ops {
                match op {
                    Op::Alloc => {
                        let expected = (0u32..).find(|id| !held.contains(id)).unwrap();
                        let id = ids.alloc();
                        prop_assert_eq!(id, expected);
                        held.insert(id);
                    }
                    Op::Release(pick) => {
                        if held.is_empty() {
                            continue;
                        }
                        let id = *held.iter().nth(pick % held.len()).unwrap();
                        held.remove(&id);
                        ids.release(id);
                    }
                }
            }
        }
    }
}
