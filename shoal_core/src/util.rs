//! Hashing, printable byte rendering and weighted-subset sampling.

use crate::RngType;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::fmt::Write;

/// Hashes are always this many bytes.
pub const HASH_LEN: usize = 40;

/// Printable SHA-1 of a byte array, [`HASH_LEN`] lowercase hex chars.
pub fn hash(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Loggable rendering of at most `max_len` bytes of `data`.
pub fn as_printable(data: &[u8], max_len: usize) -> String {
    let mut out = String::new();
    for &b in data.iter().take(max_len) {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{:02X}", b);
        }
    }
    if data.len() > max_len {
        out.push_str("...");
    }
    out
}

/// Returns `seed` unless it is zero, in which case a time/pid based seed is
/// derived. Never returns zero.
pub fn get_random_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let mixed = (now.as_nanos() as u64) ^ ((std::process::id() as u64) << 32);
    if mixed == 0 {
        1
    } else {
        mixed
    }
}

/// Computes a random subset of `weights` to remove so that `target_size`
/// non-zero-weight elements remain. Returns sorted indices.
///
/// Zero-weight elements are always removed. Among the rest, the kept
/// `target_size` elements are drawn with a weighted reservoir (key
/// `u^(1/w)`, largest keys survive), so the probability of removal is
/// monotone non-increasing in weight. The exact distribution is not part of
/// the contract.
pub fn random_weighted_subset(weights: &[u64], target_size: usize, rng: &mut RngType) -> Vec<usize> {
    let mut removed = Vec::new();
    let mut keyed: Vec<(f64, usize)> = Vec::new();
    for (i, &w) in weights.iter().enumerate() {
        if w == 0 {
            removed.push(i);
        } else {
            let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            keyed.push((u.powf(1.0 / w as f64), i));
        }
    }
    if keyed.len() > target_size {
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
        removed.extend(keyed[target_size..].iter().map(|&(_, i)| i));
    }
    removed.sort_unstable();
    removed
}

/// Removes the elements at `sorted_indices` from `set`, preserving the order
/// of the remaining elements.
pub fn remove_subset<T>(sorted_indices: &[usize], set: &mut Vec<T>) {
    let mut pos_to_write = 0;
    let mut next = 0;
    for i in 0..set.len() {
        if next < sorted_indices.len() && sorted_indices[next] == i {
            next += 1;
        } else {
            set.swap(pos_to_write, i);
            pos_to_write += 1;
        }
    }
    set.truncate(pos_to_write);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn hash_is_deterministic_and_hex() {
        let h = hash(b"abc");
        assert_eq!(h.len(), HASH_LEN);
        assert_eq!(h, hash(b"abc"));
        assert_ne!(h, hash(b"abd"));
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
        // Known SHA-1 vector.
        assert_eq!(h, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn printable_rendering() {
        assert_eq!(as_printable(b"ab\x00c", 16), "ab\\x00c");
        assert_eq!(as_printable(b"abcdef", 3), "abc...");
    }

    #[test]
    fn random_seed_is_never_zero() {
        assert_eq!(get_random_seed(42), 42);
        for _ in 0..16 {
            assert_ne!(get_random_seed(0), 0);
        }
    }

    #[test]
    fn zero_weights_are_always_removed() {
        let mut rng = RngType::seed_from_u64(1);
        let weights = [20, 10, 0, 40, 50];
        for target in 0..=5 {
            let removed = random_weighted_subset(&weights, target, &mut rng);
            assert!(removed.contains(&2));
            let remaining_nonzero = weights
                .iter()
                .enumerate()
                .filter(|(i, &w)| w != 0 && !removed.contains(i))
                .count();
            assert_eq!(remaining_nonzero, target.min(4));
        }
    }

    #[test]
    fn lighter_elements_are_removed_more_often() {
        let weights = [1u64, 100];
        let mut light_removed = 0;
        let mut heavy_removed = 0;
        for seed in 0..2000 {
            let mut rng = RngType::seed_from_u64(seed);
            let removed = random_weighted_subset(&weights, 1, &mut rng);
            assert_eq!(removed.len(), 1);
            match removed[0] {
                0 => light_removed += 1,
                _ => heavy_removed += 1,
            }
        }
        assert!(light_removed > heavy_removed * 5);
    }

    #[test]
    fn remove_subset_keeps_order() {
        let mut v = vec![0, 1, 2, 3, 4, 5];
        remove_subset(&[1, 4], &mut v);
        assert_eq!(v, vec![0, 2, 3, 5]);

        let mut v = vec![7];
        remove_subset(&[], &mut v);
        assert_eq!(v, vec![7]);

        let mut v = vec![1, 2];
        remove_subset(&[0, 1], &mut v);
        assert!(v.is_empty());
    }
}
