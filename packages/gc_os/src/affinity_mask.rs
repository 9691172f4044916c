use std::fmt::{self, Debug};

/// The maximum number of processors an [`AffinityMask`] can describe.
///
/// This matches the size of the processor set used by the Linux `sched_*affinity` family of
/// functions. On Windows, a mask only ever describes a single processor group of at most 64
/// processors.
pub const MAX_AFFINITY_PROCESSORS: usize = 1024;

const BITS_PER_WORD: usize = u64::BITS as usize;
const WORD_COUNT: usize = MAX_AFFINITY_PROCESSORS / BITS_PER_WORD;

/// A fixed-size set of processor indexes, used to describe which processors a process, a thread
/// or a processor group may execute on.
///
/// Processor indexes at or above [`MAX_AFFINITY_PROCESSORS`] cannot be represented. Inserting
/// them is ignored.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct AffinityMask {
    words: [u64; WORD_COUNT],
}

impl AffinityMask {
    /// A mask with no processors in it.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            words: [0; WORD_COUNT],
        }
    }

    /// A mask that contains the processors `0..count`.
    #[must_use]
    pub fn first_n(count: usize) -> Self {
        let mut mask = Self::empty();

        for index in 0..count.min(MAX_AFFINITY_PROCESSORS) {
            mask.insert(index);
        }

        mask
    }

    /// Creates a mask from a 64-bit processor group mask, where bit `n` corresponds to
    /// processor `n`.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        let mut mask = Self::empty();
        mask.words[0] = bits;
        mask
    }

    /// The first 64 processors of the mask as a bit field, where bit `n` corresponds to
    /// processor `n`.
    #[must_use]
    pub const fn low_bits(&self) -> u64 {
        self.words[0]
    }

    /// Adds a processor to the mask.
    pub fn insert(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / BITS_PER_WORD) {
            *word |= 1 << (index % BITS_PER_WORD);
        }
    }

    /// Whether the mask contains the processor.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / BITS_PER_WORD)
            .is_some_and(|word| word & (1 << (index % BITS_PER_WORD)) != 0)
    }

    /// The number of processors in the mask.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }

    /// Whether the mask contains no processors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Whether the mask contains exactly one processor.
    #[must_use]
    pub fn is_single(&self) -> bool {
        self.count() == 1
    }

    /// The lowest processor index in the mask, if any.
    #[must_use]
    pub fn lowest(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(word_index, word)| {
                word_index * BITS_PER_WORD + word.trailing_zeros() as usize
            })
    }

    /// The `n`-th processor of the mask in ascending order, counting from zero.
    #[must_use]
    pub fn nth(&self, n: usize) -> Option<usize> {
        self.iter().nth(n)
    }

    /// The processors present in both masks.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut result = *self;

        for (word, other_word) in result.words.iter_mut().zip(other.words.iter()) {
            *word &= other_word;
        }

        result
    }

    /// Iterates over the processor indexes in the mask, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_AFFINITY_PROCESSORS).filter(|index| self.contains(*index))
    }
}

impl Default for AffinityMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for AffinityMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut mask = Self::empty();

        for index in iter {
            mask.insert(index);
        }

        mask
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(AffinityMask: Send, Sync, Copy);

    #[test]
    fn empty_mask() {
        let mask = AffinityMask::empty();

        assert!(mask.is_empty());
        assert!(!mask.is_single());
        assert_eq!(mask.count(), 0);
        assert_eq!(mask.lowest(), None);
        assert_eq!(mask.iter().count(), 0);
    }

    #[test]
    fn insert_and_query() {
        let mut mask = AffinityMask::empty();
        mask.insert(3);
        mask.insert(64);
        mask.insert(1023);

        assert!(mask.contains(3));
        assert!(mask.contains(64));
        assert!(mask.contains(1023));
        assert!(!mask.contains(4));
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.lowest(), Some(3));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![3, 64, 1023]);
    }

    #[test]
    fn out_of_range_insert_is_ignored() {
        let mut mask = AffinityMask::empty();
        mask.insert(MAX_AFFINITY_PROCESSORS);

        assert!(mask.is_empty());
        assert!(!mask.contains(MAX_AFFINITY_PROCESSORS));
    }

    #[test]
    fn first_n_saturates() {
        assert_eq!(AffinityMask::first_n(5).count(), 5);
        assert_eq!(
            AffinityMask::first_n(MAX_AFFINITY_PROCESSORS + 10).count() as usize,
            MAX_AFFINITY_PROCESSORS
        );
    }

    #[test]
    fn from_bits_maps_to_low_processors() {
        let mask = AffinityMask::from_bits(0b1010);

        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(mask.low_bits(), 0b1010);
    }

    #[test]
    fn nth_skips_holes() {
        let mask = AffinityMask::from_bits(0b1011_0100);

        assert_eq!(mask.nth(0), Some(2));
        assert_eq!(mask.nth(1), Some(4));
        assert_eq!(mask.nth(3), Some(7));
        assert_eq!(mask.nth(4), None);
    }

    #[test]
    fn single_processor_after_intersection() {
        let process = AffinityMask::from_bits(0b0110);
        let system = AffinityMask::from_bits(0b1100);

        let effective = process.intersection(&system);

        assert!(effective.is_single());
        assert_eq!(effective.lowest(), Some(2));
    }

    #[test]
    fn collect_from_indexes() {
        let mask: AffinityMask = [0, 7, 200].into_iter().collect();

        assert_eq!(mask.count(), 3);
        assert_eq!(format!("{mask:?}"), "{0, 7, 200}");
    }
}
