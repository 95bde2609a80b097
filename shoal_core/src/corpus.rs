//! Weighted corpus of interesting inputs.

use crate::feature::{feature_to_pc_index, Feature, FeatureSet, FeatureVec, EIGHT_BIT_COUNTERS};
use crate::frontier::CoverageFrontier;
use crate::util::{random_weighted_subset, remove_subset};
use crate::{ByteArray, HashMap, RngType};
use rand::Rng;

/// One retained input together with what it exercised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorpusRecord {
    pub data: ByteArray,
    pub features: FeatureVec,
    pub cmp_args: ByteArray,
}

/// Ordered collection of corpus records with weighted selection and a
/// coverage-preserving prune policy.
///
/// Removal is always logical: the on-disk corpus files are append-only and
/// `num_total` never decreases, only the in-memory active set shrinks.
#[derive(Debug, Default)]
pub struct Corpus {
    records: Vec<CorpusRecord>,
    weights: Vec<u64>,
    cumulative: Vec<u64>,
    weights_stale: bool,
    num_total: usize,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_active(&self) -> usize {
        self.records.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_total
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, idx: usize) -> &CorpusRecord {
        &self.records[idx]
    }

    pub fn records(&self) -> &[CorpusRecord] {
        &self.records
    }

    /// Appends a record, computing its selection weight from the current
    /// feature frequencies and frontier.
    pub fn add(&mut self, record: CorpusRecord, fs: &FeatureSet, frontier: &CoverageFrontier) {
        let weight = compute_weight(&record, fs, frontier);
        self.records.push(record);
        self.weights.push(weight);
        self.num_total += 1;
        self.weights_stale = true;
    }

    pub fn uniform_random(&self, rng: &mut RngType) -> &CorpusRecord {
        &self.records[rng.gen_range(0..self.records.len())]
    }

    /// Draws a record with probability proportional to its weight. The
    /// cumulative distribution is rebuilt lazily after additions or prunes.
    pub fn weighted_random(&mut self, rng: &mut RngType) -> &CorpusRecord {
        if self.weights_stale {
            self.rebuild_cumulative();
        }
        if self.cumulative.last().copied().unwrap_or(0) == 0 {
            return self.uniform_random(rng);
        }
        let idx = choose_weighted(rng, &self.cumulative);
        &self.records[idx]
    }

    fn rebuild_cumulative(&mut self) {
        self.cumulative.clear();
        let mut sum = 0u64;
        for &w in &self.weights {
            sum = sum.saturating_add(w);
            self.cumulative.push(sum);
        }
        self.weights_stale = false;
    }

    /// (largest, average) input size over the active records.
    pub fn max_and_avg_size(&self) -> (usize, usize) {
        if self.records.is_empty() {
            return (0, 0);
        }
        let mut max = 0;
        let mut total = 0;
        for r in &self.records {
            max = max.max(r.data.len());
            total += r.data.len();
        }
        (max, total / self.records.len())
    }

    /// Shrinks the active set towards `max_active` while keeping every live
    /// feature carried by at least one active record. Returns the number of
    /// records dropped.
    ///
    /// Two passes: first drop records (lightest first) whose every feature
    /// another active record also carries, then remove a weighted-random
    /// subset of the overflow, sparing records that are the sole carrier of
    /// any feature.
    pub fn prune(
        &mut self,
        fs: &FeatureSet,
        frontier: &CoverageFrontier,
        max_active: usize,
        rng: &mut RngType,
    ) -> usize {
        if self.records.len() < 2 {
            return 0;
        }
        let before = self.records.len();
        let weights: Vec<u64> = self
            .records
            .iter()
            .map(|r| compute_weight(r, fs, frontier))
            .collect();

        let mut carriers: HashMap<Feature, usize> = HashMap::new();
        for r in &self.records {
            for &f in &r.features {
                *carriers.entry(f).or_insert(0) += 1;
            }
        }

        let mut order: Vec<usize> = (0..self.records.len()).collect();
        order.sort_by_key(|&i| weights[i]);
        let mut removed = vec![false; self.records.len()];
        let mut num_remaining = self.records.len();
        for &i in &order {
            if num_remaining == 1 {
                break;
            }
            let r = &self.records[i];
            let redundant = r
                .features
                .iter()
                .all(|f| carriers.get(f).map_or(false, |&c| c >= 2));
            if redundant {
                removed[i] = true;
                num_remaining -= 1;
                for f in &r.features {
                    if let Some(c) = carriers.get_mut(f) {
                        *c -= 1;
                    }
                }
            }
        }

        if num_remaining > max_active {
            let mut candidates = Vec::new();
            let mut candidate_weights = Vec::new();
            for i in 0..self.records.len() {
                if removed[i] {
                    continue;
                }
                let sole = self.records[i]
                    .features
                    .iter()
                    .any(|f| carriers.get(f).map_or(false, |&c| c == 1));
                if sole {
                    continue;
                }
                candidates.push(i);
                candidate_weights.push(weights[i]);
            }
            let excess = num_remaining - max_active;
            if !candidates.is_empty() {
                let target = candidates.len().saturating_sub(excess);
                for j in random_weighted_subset(&candidate_weights, target, rng) {
                    removed[candidates[j]] = true;
                }
            }
        }

        let removal_indices: Vec<usize> = (0..self.records.len()).filter(|&i| removed[i]).collect();
        remove_subset(&removal_indices, &mut self.records);
        self.weights = self
            .records
            .iter()
            .map(|r| compute_weight(r, fs, frontier))
            .collect();
        self.weights_stale = true;
        before - self.records.len()
    }
}

/// Heuristic selection weight: grows with feature rarity, shrinks with input
/// size, boosted for records touching the coverage frontier.
fn compute_weight(record: &CorpusRecord, fs: &FeatureSet, frontier: &CoverageFrontier) -> u64 {
    let mut rarity: u64 = 0;
    for &f in &record.features {
        let freq = fs.frequency(f).max(1) as u64;
        rarity += (fs.threshold() as u64 * 256) / freq;
    }
    let size_bits = 64 - (record.data.len().max(1) as u64).leading_zeros() as u64;
    let mut weight = rarity / (1 + size_bits);
    let in_frontier = record.features.iter().any(|&f| {
        EIGHT_BIT_COUNTERS.contains(f) && frontier.pc_index_is_in_frontier(feature_to_pc_index(f))
    });
    if in_frontier {
        weight = weight.saturating_mul(256);
    }
    weight
}

/// Binary search over a cumulative weight array.
fn choose_weighted(rng: &mut RngType, cumulative: &[u64]) -> usize {
    let max = cumulative.last().copied().unwrap_or(0);
    let n = rng.gen_range(0..max);
    match cumulative.binary_search(&n) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::{BinaryInfo, CoverageFrontier};
    use rand::SeedableRng;

    fn empty_frontier() -> CoverageFrontier {
        CoverageFrontier::new(&BinaryInfo::default())
    }

    fn record(data: &[u8], features: &[Feature]) -> CorpusRecord {
        CorpusRecord {
            data: data.to_vec(),
            features: features.to_vec(),
            cmp_args: Vec::new(),
        }
    }

    #[test]
    fn add_and_select() {
        let fs = FeatureSet::new(100);
        let frontier = empty_frontier();
        let mut corpus = Corpus::new();
        let mut rng = RngType::seed_from_u64(1);

        corpus.add(record(b"a", &[1]), &fs, &frontier);
        corpus.add(record(b"b", &[2]), &fs, &frontier);
        assert_eq!(corpus.num_active(), 2);
        assert_eq!(corpus.num_total(), 2);
        for _ in 0..32 {
            let r = corpus.weighted_random(&mut rng);
            assert!(r.data == b"a" || r.data == b"b");
            let r = corpus.uniform_random(&mut rng);
            assert!(r.data == b"a" || r.data == b"b");
        }
    }

    #[test]
    fn rare_features_are_preferred() {
        let mut fs = FeatureSet::new(100);
        let frontier = empty_frontier();
        // Feature 1 is common, feature 2 rare.
        for _ in 0..50 {
            fs.increment_frequencies(&[1]);
        }
        fs.increment_frequencies(&[2]);

        let mut corpus = Corpus::new();
        corpus.add(record(b"common", &[1]), &fs, &frontier);
        corpus.add(record(b"rare", &[2]), &fs, &frontier);

        let mut rng = RngType::seed_from_u64(3);
        let mut rare_hits = 0;
        for _ in 0..1000 {
            if corpus.weighted_random(&mut rng).data == b"rare" {
                rare_hits += 1;
            }
        }
        assert!(rare_hits > 700, "rare record drawn {} times", rare_hits);
    }

    #[test]
    fn max_and_avg_size() {
        let fs = FeatureSet::new(100);
        let frontier = empty_frontier();
        let mut corpus = Corpus::new();
        assert_eq!(corpus.max_and_avg_size(), (0, 0));
        corpus.add(record(&[0; 10], &[1]), &fs, &frontier);
        corpus.add(record(&[0; 30], &[2]), &fs, &frontier);
        assert_eq!(corpus.max_and_avg_size(), (30, 20));
    }

    #[test]
    fn prune_keeps_every_feature_covered() {
        let mut fs = FeatureSet::new(100);
        let frontier = empty_frontier();
        let mut corpus = Corpus::new();
        let mut rng = RngType::seed_from_u64(5);

        // 10000 records over 500 distinct features; every feature is shared
        // by 20 records.
        for i in 0..10_000u64 {
            let f = i % 500;
            fs.increment_frequencies(&[f]);
            corpus.add(record(&i.to_le_bytes(), &[f]), &fs, &frontier);
        }
        let removed = corpus.prune(&fs, &frontier, 1000, &mut rng);
        assert!(removed >= 9000);
        assert!(corpus.num_active() <= 1000);
        assert_eq!(corpus.num_total(), 10_000);

        let mut covered: crate::HashSet<Feature> = crate::HashSet::new();
        for r in corpus.records() {
            covered.extend(r.features.iter().copied());
        }
        assert_eq!(covered.len(), 500);
    }

    #[test]
    fn prune_drops_the_featureless_seed_once_real_records_exist() {
        let mut fs = FeatureSet::new(100);
        let frontier = empty_frontier();
        let mut corpus = Corpus::new();
        let mut rng = RngType::seed_from_u64(9);

        corpus.add(record(b"seed", &[]), &fs, &frontier);
        fs.increment_frequencies(&[42]);
        corpus.add(record(b"real", &[42]), &fs, &frontier);

        corpus.prune(&fs, &frontier, 10, &mut rng);
        assert_eq!(corpus.num_active(), 1);
        assert_eq!(corpus.records()[0].data, b"real");
    }

    #[test]
    fn prune_never_empties_the_corpus() {
        let fs = FeatureSet::new(100);
        let frontier = empty_frontier();
        let mut corpus = Corpus::new();
        let mut rng = RngType::seed_from_u64(2);

        corpus.add(record(b"a", &[]), &fs, &frontier);
        corpus.add(record(b"b", &[]), &fs, &frontier);
        corpus.prune(&fs, &frontier, 1, &mut rng);
        assert_eq!(corpus.num_active(), 1);
    }
}
