//! Tolerant readers for per-shard corpus/features file pairs.
//!
//! Each shard owns exactly two append-only files, `corpus.<shard>` and
//! `features.<shard>`. Other shards read them while they are being written,
//! so everything here treats short reads and malformed entries as "the rest
//! hasn't been written yet" rather than as failures.

use crate::blob::BlobStorage;
use crate::feature::{Feature, FeatureVec};
use crate::util::{hash, HASH_LEN};
use crate::{ByteArray, HashMap};
use std::path::Path;

/// Packs `features` and the hash of `input` into one features-file blob.
pub fn pack_features_and_hash(input: &[u8], features: &[Feature]) -> ByteArray {
    let mut out = Vec::with_capacity(features.len() * 8 + HASH_LEN);
    for &f in features {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out.extend_from_slice(hash(input).as_bytes());
    out
}

/// Splits a features-file blob back into (features, input hash).
/// Returns `None` for anything malformed.
pub fn unpack_features_and_hash(blob: &[u8]) -> Option<(FeatureVec, String)> {
    if blob.len() < HASH_LEN {
        return None;
    }
    let (raw, hash_bytes) = blob.split_at(blob.len() - HASH_LEN);
    if raw.len() % 8 != 0 {
        return None;
    }
    let hash_str = std::str::from_utf8(hash_bytes).ok()?.to_string();
    let features = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Some((features, hash_str))
}

/// Streams one shard's corpus file, pairing every input with the features
/// recorded for it. Inputs whose features file entry is missing (or not yet
/// flushed) get an empty vector so the caller can decide to rerun them.
pub fn read_shard(
    storage: &dyn BlobStorage,
    corpus_path: &Path,
    features_path: &Path,
    mut callback: impl FnMut(ByteArray, FeatureVec),
) {
    let mut features_by_hash: HashMap<String, FeatureVec> = HashMap::new();
    if let Ok(mut reader) = storage.reader(features_path) {
        while let Ok(Some(blob)) = reader.next_blob() {
            match unpack_features_and_hash(&blob) {
                Some((features, input_hash)) => {
                    features_by_hash.insert(input_hash, features);
                }
                // A malformed entry ends the stream; earlier entries stand.
                None => {
                    log::warn!(
                        "malformed entry in {}, ignoring the rest of the file",
                        features_path.display()
                    );
                    break;
                }
            }
        }
    }
    if let Ok(mut reader) = storage.reader(corpus_path) {
        while let Ok(Some(input)) = reader.next_blob() {
            let features = features_by_hash
                .get(&hash(&input))
                .cloned()
                .unwrap_or_default();
            callback(input, features);
        }
    }
}
