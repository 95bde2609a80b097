//! Byte-array mutation: knob-weighted primitive mutators, crossover, and
//! dictionary-guided overwrites.
//!
//! All mutators expect non-empty input and keep it non-empty; there is only
//! one possible empty input and it is uninteresting. One mutator instance
//! per shard, single-threaded.

use crate::dict::{CmpDictionary, DictEntry};
use crate::{ByteArray, RngType};
use rand::prelude::*;

/// Identifies one tunable choice weight.
pub type KnobId = usize;

pub const KNOB_FLIP_BIT: KnobId = 0;
pub const KNOB_SWAP_BYTES: KnobId = 1;
pub const KNOB_CHANGE_BYTE: KnobId = 2;
pub const KNOB_INSERT_BYTES: KnobId = 3;
pub const KNOB_ERASE_BYTES: KnobId = 4;
pub const KNOB_INSERT_FROM_DICT: KnobId = 5;
pub const KNOB_OVERWRITE_FROM_DICT: KnobId = 6;
pub const KNOB_OVERWRITE_FROM_CMP_DICT: KnobId = 7;
pub const KNOB_CROSSOVER_INSERT: KnobId = 8;
pub const KNOB_CROSSOVER_OVERWRITE: KnobId = 9;
const NUM_KNOBS: usize = 10;

/// Integer weights steering every random choice the mutator makes.
#[derive(Debug, Clone)]
pub struct Knobs {
    values: [u64; NUM_KNOBS],
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            values: [10; NUM_KNOBS],
        }
    }
}

impl Knobs {
    pub fn set(&mut self, knob: KnobId, value: u64) {
        self.values[knob] = value;
    }

    pub fn value(&self, knob: KnobId) -> u64 {
        self.values[knob]
    }

    /// Weighted pick among `candidates`; uniform when all weights are zero.
    fn choose(&self, candidates: &[KnobId], rng: &mut RngType) -> usize {
        let total: u64 = candidates.iter().map(|&k| self.values[k]).sum();
        if total == 0 {
            return rng.gen_range(0..candidates.len());
        }
        let mut n = rng.gen_range(0..total);
        for (i, &k) in candidates.iter().enumerate() {
            let w = self.values[k];
            if n < w {
                return i;
            }
            n -= w;
        }
        candidates.len() - 1
    }
}

type MutateFn = fn(&mut ByteArrayMutator, &mut ByteArray) -> bool;

const MUTATOR_KNOBS: [KnobId; 8] = [
    KNOB_FLIP_BIT,
    KNOB_SWAP_BYTES,
    KNOB_CHANGE_BYTE,
    KNOB_INSERT_BYTES,
    KNOB_ERASE_BYTES,
    KNOB_INSERT_FROM_DICT,
    KNOB_OVERWRITE_FROM_DICT,
    KNOB_OVERWRITE_FROM_CMP_DICT,
];

const MUTATOR_FNS: [MutateFn; 8] = [
    ByteArrayMutator::flip_bit,
    ByteArrayMutator::swap_bytes,
    ByteArrayMutator::change_byte,
    ByteArrayMutator::insert_bytes,
    ByteArrayMutator::erase_bytes,
    ByteArrayMutator::insert_from_dictionary,
    ByteArrayMutator::overwrite_from_dictionary,
    ByteArrayMutator::overwrite_from_cmp_dictionary,
];

const MAX_INSERTED_BYTES: usize = 20;
const COMPOSITE_TRIES: usize = 10;
const MAX_CMP_SUGGESTIONS: usize = 8;

pub struct ByteArrayMutator {
    rng: RngType,
    knobs: Knobs,
    dictionary: Vec<DictEntry>,
    cmp_dictionary: CmpDictionary,
    size_alignment: usize,
    max_len: usize,
}

impl ByteArrayMutator {
    pub fn new(knobs: Knobs, seed: u64) -> Self {
        debug_assert_ne!(seed, 0);
        Self {
            rng: RngType::seed_from_u64(seed),
            knobs,
            dictionary: Vec::new(),
            cmp_dictionary: CmpDictionary::default(),
            size_alignment: 1,
            max_len: usize::MAX,
        }
    }

    /// Accepts the alignment unless it contradicts an already-set max length.
    pub fn set_size_alignment(&mut self, size_alignment: usize) -> bool {
        if size_alignment == 0 {
            return false;
        }
        if self.max_len != usize::MAX && self.max_len % size_alignment != 0 {
            return false;
        }
        self.size_alignment = size_alignment;
        true
    }

    /// Accepts the max length unless it is not a multiple of the alignment.
    pub fn set_max_len(&mut self, max_len: usize) -> bool {
        if max_len == 0 {
            return false;
        }
        if max_len != usize::MAX && max_len % self.size_alignment != 0 {
            return false;
        }
        self.max_len = max_len;
        true
    }

    /// Adds entries to the user dictionary, skipping unusable sizes.
    pub fn add_to_dictionary(&mut self, entries: &[ByteArray]) {
        for e in entries {
            if let Some(entry) = DictEntry::new(e) {
                self.dictionary.push(entry);
            }
        }
    }

    /// Replaces the CMP dictionary from the runtime wire format.
    pub fn set_cmp_dictionary(&mut self, cmp_data: &[u8]) -> bool {
        self.cmp_dictionary.set_from_cmp_data(cmp_data)
    }

    /// Produces exactly `num_mutants` children of `inputs` in `mutants`,
    /// discarding its old contents. `crossover_level` is a percentage in
    /// [0, 100]: the chance that a mutant is bred from two parents instead
    /// of one.
    pub fn mutate_many(
        &mut self,
        inputs: &[ByteArray],
        num_mutants: usize,
        crossover_level: u32,
        mutants: &mut Vec<ByteArray>,
    ) {
        debug_assert!(!inputs.is_empty());
        mutants.clear();
        mutants.reserve(num_mutants);
        for _ in 0..num_mutants {
            let mut data = inputs[self.rng.gen_range(0..inputs.len())].clone();
            if self.rng.gen_range(0..100) < crossover_level {
                let other = self.rng.gen_range(0..inputs.len());
                self.cross_over(&mut data, &inputs[other]);
            } else {
                self.mutate(&mut data);
            }
            self.enforce_size_policy(&mut data);
            if data.is_empty() {
                data.push(self.rng.gen());
            }
            mutants.push(data);
        }
    }

    /// Applies one random primitive mutation. Individual mutators may fail,
    /// so a few are tried; `false` means the input is unchanged and the
    /// caller must tolerate a mutant equal to its parent.
    pub fn mutate(&mut self, data: &mut ByteArray) -> bool {
        for _ in 0..COMPOSITE_TRIES {
            let idx = self.knobs.choose(&MUTATOR_KNOBS, &mut self.rng);
            if MUTATOR_FNS[idx](self, data) {
                return true;
            }
        }
        false
    }

    /// Flips one random bit.
    pub fn flip_bit(&mut self, data: &mut ByteArray) -> bool {
        if data.is_empty() {
            return false;
        }
        let pos = self.rng.gen_range(0..data.len() * 8);
        data[pos / 8] ^= 1 << (pos % 8);
        true
    }

    /// Swaps two random byte positions.
    pub fn swap_bytes(&mut self, data: &mut ByteArray) -> bool {
        if data.len() < 2 {
            return false;
        }
        let a = self.rng.gen_range(0..data.len());
        let b = self.rng.gen_range(0..data.len());
        data.swap(a, b);
        true
    }

    /// Replaces one random byte with a random value.
    pub fn change_byte(&mut self, data: &mut ByteArray) -> bool {
        if data.is_empty() {
            return false;
        }
        let pos = self.rng.gen_range(0..data.len());
        data[pos] = self.rng.gen();
        true
    }

    /// Inserts a run of random bytes at a random position.
    pub fn insert_bytes(&mut self, data: &mut ByteArray) -> bool {
        let want = self.rng.gen_range(1..=MAX_INSERTED_BYTES);
        let n = self.round_up_to_add(data.len(), want);
        if n == 0 {
            return false;
        }
        let pos = self.rng.gen_range(0..=data.len());
        let fresh: Vec<u8> = (0..n).map(|_| self.rng.gen()).collect();
        data.splice(pos..pos, fresh);
        true
    }

    /// Erases a run of bytes at a random position; refuses to empty the input.
    pub fn erase_bytes(&mut self, data: &mut ByteArray) -> bool {
        if data.len() <= 1 {
            return false;
        }
        let want = self.rng.gen_range(1..data.len());
        let n = self.round_down_to_remove(data.len(), want);
        if n == 0 || n >= data.len() {
            return false;
        }
        let pos = self.rng.gen_range(0..=data.len() - n);
        data.drain(pos..pos + n);
        true
    }

    /// Inserts a random user-dictionary entry, keeping the size aligned.
    pub fn insert_from_dictionary(&mut self, data: &mut ByteArray) -> bool {
        if self.dictionary.is_empty() {
            return false;
        }
        let idx = self.rng.gen_range(0..self.dictionary.len());
        let entry = &self.dictionary[idx];
        let new_size = data.len() + entry.len();
        if new_size > self.max_len || new_size % self.size_alignment != 0 {
            return false;
        }
        let pos = self.rng.gen_range(0..=data.len());
        let bytes = entry.bytes().to_vec();
        data.splice(pos..pos, bytes);
        true
    }

    /// Overwrites a random region with a random user-dictionary entry.
    pub fn overwrite_from_dictionary(&mut self, data: &mut ByteArray) -> bool {
        if self.dictionary.is_empty() {
            return false;
        }
        let idx = self.rng.gen_range(0..self.dictionary.len());
        let entry = &self.dictionary[idx];
        if entry.len() > data.len() {
            return false;
        }
        let pos = self.rng.gen_range(0..=data.len() - entry.len());
        let bytes = entry.bytes().to_vec();
        data[pos..pos + bytes.len()].copy_from_slice(&bytes);
        true
    }

    /// Finds a CMP pair (A, B) with A present at some position of the input
    /// and overwrites that region with B. Equal operand lengths keep the
    /// size unchanged.
    pub fn overwrite_from_cmp_dictionary(&mut self, data: &mut ByteArray) -> bool {
        if self.cmp_dictionary.is_empty() || data.is_empty() {
            return false;
        }
        let pos = self.rng.gen_range(0..data.len());
        let suggestions = self
            .cmp_dictionary
            .suggest_replacements(&data[pos..], MAX_CMP_SUGGESTIONS);
        if suggestions.is_empty() {
            return false;
        }
        let pick = self.rng.gen_range(0..suggestions.len());
        let replacement = suggestions[pick].to_vec();
        data[pos..pos + replacement.len()].copy_from_slice(&replacement);
        true
    }

    /// Mutates `data` by inserting a random fragment of `other`.
    pub fn cross_over_insert(&mut self, data: &mut ByteArray, other: &[u8]) -> bool {
        if other.is_empty() {
            return false;
        }
        let want = self.rng.gen_range(1..=other.len());
        let n = self.round_up_to_add(data.len(), want);
        if n == 0 || n > other.len() {
            return false;
        }
        let from = self.rng.gen_range(0..=other.len() - n);
        let to = self.rng.gen_range(0..=data.len());
        let fragment = other[from..from + n].to_vec();
        data.splice(to..to, fragment);
        true
    }

    /// Mutates `data` by overwriting some of it with a fragment of `other`.
    pub fn cross_over_overwrite(&mut self, data: &mut ByteArray, other: &[u8]) -> bool {
        if data.is_empty() || other.is_empty() {
            return false;
        }
        let n = self.rng.gen_range(1..=other.len().min(data.len()));
        let from = self.rng.gen_range(0..=other.len() - n);
        let to = self.rng.gen_range(0..=data.len() - n);
        data[to..to + n].copy_from_slice(&other[from..from + n]);
        true
    }

    /// Applies one crossover flavor chosen by knob weight, falling back to a
    /// plain mutation when both keep failing.
    pub fn cross_over(&mut self, data: &mut ByteArray, other: &[u8]) {
        const CROSSOVER_KNOBS: [KnobId; 2] = [KNOB_CROSSOVER_INSERT, KNOB_CROSSOVER_OVERWRITE];
        for _ in 0..COMPOSITE_TRIES {
            let idx = self.knobs.choose(&CROSSOVER_KNOBS, &mut self.rng);
            let mutated = if idx == 0 {
                self.cross_over_insert(data, other)
            } else {
                self.cross_over_overwrite(data, other)
            };
            if mutated {
                return;
            }
        }
        self.mutate(data);
    }

    /// Number of bytes to actually add so that `curr + result` is aligned,
    /// clipped at `max_len`. Zero when nothing can be added.
    fn round_up_to_add(&self, curr: usize, to_add: usize) -> usize {
        if curr >= self.max_len {
            return 0;
        }
        let mut to_add = to_add;
        let remainder = (curr + to_add) % self.size_alignment;
        if remainder != 0 {
            to_add += self.size_alignment - remainder;
        }
        if curr + to_add > self.max_len {
            // max_len is itself aligned, so this lands on an aligned size.
            self.max_len - curr
        } else {
            to_add
        }
    }

    /// Number of bytes to actually remove so that `curr - result` is aligned
    /// and non-zero. Oversized inputs are first brought back to `max_len`.
    fn round_down_to_remove(&self, curr: usize, to_remove: usize) -> usize {
        if curr > self.max_len {
            return curr - self.max_len;
        }
        if curr <= 1 {
            return 0;
        }
        let mut to_remove = to_remove.min(curr - 1);
        let remainder = (curr - to_remove) % self.size_alignment;
        if remainder != 0 {
            to_remove += remainder;
        }
        if to_remove >= curr {
            let kept = curr.min(self.size_alignment);
            return curr - kept;
        }
        to_remove
    }

    /// Final size constraint: at most `max_len`, and aligned whenever the
    /// input is at least one alignment unit long.
    fn enforce_size_policy(&self, data: &mut ByteArray) {
        if data.len() > self.max_len {
            data.truncate(self.max_len);
        }
        let remainder = data.len() % self.size_alignment;
        if remainder != 0 && data.len() >= self.size_alignment {
            data.truncate(data.len() - remainder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutator(seed: u64) -> ByteArrayMutator {
        ByteArrayMutator::new(Knobs::default(), seed)
    }

    #[test]
    fn erase_bytes_refuses_to_empty_one_byte_input() {
        let mut m = mutator(1);
        let mut data = vec![0xab];
        assert!(!m.erase_bytes(&mut data));
        assert_eq!(data, vec![0xab]);
    }

    #[test]
    fn mutants_stay_within_alignment_and_max_len() {
        let mut m = mutator(7);
        assert!(m.set_size_alignment(4));
        assert!(m.set_max_len(16));
        let parents = vec![vec![1u8, 2, 3, 4, 5]];
        let mut mutants = Vec::new();
        m.mutate_many(&parents, 1000, 50, &mut mutants);
        assert_eq!(mutants.len(), 1000);
        for mutant in &mutants {
            assert!(
                matches!(mutant.len(), 4 | 8 | 12 | 16),
                "bad mutant size {}",
                mutant.len()
            );
        }
    }

    #[test]
    fn mutants_without_alignment_stay_in_bounds() {
        let mut m = mutator(3);
        assert!(m.set_max_len(32));
        let parents = vec![vec![0u8; 8], vec![1u8; 20]];
        let mut mutants = Vec::new();
        m.mutate_many(&parents, 500, 80, &mut mutants);
        for mutant in &mutants {
            assert!(!mutant.is_empty());
            assert!(mutant.len() <= 32);
        }
    }

    #[test]
    fn mutate_changes_input_eventually() {
        let mut m = mutator(11);
        let parent = vec![9u8; 16];
        let mut changed = 0;
        for _ in 0..100 {
            let mut data = parent.clone();
            m.mutate(&mut data);
            if data != parent {
                changed += 1;
            }
        }
        assert!(changed > 50);
    }

    #[test]
    fn inconsistent_alignment_and_max_len_are_rejected() {
        let mut m = mutator(1);
        assert!(m.set_max_len(16));
        assert!(!m.set_size_alignment(3));
        assert!(m.set_size_alignment(4));
        assert!(!m.set_max_len(10));
        assert!(!m.set_max_len(0));
        assert!(!m.set_size_alignment(0));
    }

    #[test]
    fn round_up_to_add_prefers_next_larger_aligned_size() {
        let mut m = mutator(1);
        assert!(m.set_size_alignment(4));
        assert!(m.set_max_len(16));
        assert_eq!(m.round_up_to_add(5, 1), 3); // 5 -> 8
        assert_eq!(m.round_up_to_add(8, 4), 4); // 8 -> 12
        assert_eq!(m.round_up_to_add(5, 20), 11); // clipped at 16
        assert_eq!(m.round_up_to_add(16, 1), 0); // already at max
    }

    #[test]
    fn round_down_to_remove_prefers_next_smaller_aligned_size() {
        let mut m = mutator(1);
        assert!(m.set_size_alignment(4));
        assert!(m.set_max_len(16));
        assert_eq!(m.round_down_to_remove(5, 1), 1); // 5 -> 4
        assert_eq!(m.round_down_to_remove(5, 3), 1); // still 5 -> 4
        assert_eq!(m.round_down_to_remove(12, 5), 8); // 12 -> 4
        assert_eq!(m.round_down_to_remove(4, 3), 0); // would empty
        assert_eq!(m.round_down_to_remove(20, 1), 4); // back under max_len
    }

    #[test]
    fn dictionary_fragments_show_up_in_mutants() {
        let mut m = mutator(5);
        m.add_to_dictionary(&[b"MAGIC".to_vec()]);
        let parent = vec![0u8; 32];
        let mut seen = false;
        for _ in 0..500 {
            let mut data = parent.clone();
            if m.insert_from_dictionary(&mut data) || m.overwrite_from_dictionary(&mut data) {
                if data.windows(5).any(|w| w == b"MAGIC") {
                    seen = true;
                    break;
                }
            }
        }
        assert!(seen);
    }

    #[test]
    fn cmp_dictionary_rewrites_matching_region() {
        let mut m = mutator(9);
        // "HDR!" compared against "TAG?" at runtime.
        assert!(m.set_cmp_dictionary(b"\x04HDR!TAG?"));
        let parent = b"....HDR!....".to_vec();
        let mut rewritten = false;
        for _ in 0..2000 {
            let mut data = parent.clone();
            if m.overwrite_from_cmp_dictionary(&mut data) {
                assert_eq!(data.len(), parent.len());
                if data.windows(4).any(|w| w == b"TAG?") {
                    rewritten = true;
                    break;
                }
            }
        }
        assert!(rewritten);
    }

    #[test]
    fn crossover_borrows_bytes_from_the_other_parent() {
        let mut m = mutator(13);
        let data = vec![0u8; 8];
        let other = vec![0xee; 8];
        let mut saw_other = false;
        for _ in 0..200 {
            let mut child = data.clone();
            m.cross_over(&mut child, &other);
            if child.iter().any(|&b| b == 0xee) {
                saw_other = true;
                break;
            }
        }
        assert!(saw_other);
    }

    #[test]
    fn zero_weight_knobs_disable_a_mutator() {
        let mut knobs = Knobs::default();
        for k in 0..8 {
            knobs.set(k, 0);
        }
        knobs.set(KNOB_CHANGE_BYTE, 1);
        let mut m = ByteArrayMutator::new(knobs, 17);
        // Only change_byte can fire, so the size never changes.
        let parent = vec![1u8, 2, 3];
        for _ in 0..200 {
            let mut data = parent.clone();
            m.mutate(&mut data);
            assert_eq!(data.len(), parent.len());
        }
    }
}
