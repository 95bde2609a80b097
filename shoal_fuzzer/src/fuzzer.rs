//! The per-shard fuzzing loop.
//!
//! One shard is one process and owns all of the state below; the only
//! cross-shard communication is through append-only workdir files. Novelty
//! is decided locally: a shard never asks another shard whether a feature
//! was seen, which is safe because the files are append-only and shard
//! loads tolerate partial reads.

use crate::config::Config;
use crate::crash::CrashReporter;
use crate::exec::{BatchResult, Executor};
use crate::filter::{FunctionFilter, InputFilter};
use crate::stats::Stats;
use crate::util::{early_exit_requested, request_early_exit};
use anyhow::Context;
use rand::prelude::*;
use shoal_core::blob::{write_to_hashed_file_in_dir, BlobAppender, BlobStorage};
use shoal_core::corpus::{Corpus, CorpusRecord};
use shoal_core::feature::{
    feature_to_pc_index, pc_pair_to_number, FeatureSet, FeatureVec, BOUNDED_PATH, CMP, DATA_FLOW,
    EIGHT_BIT_COUNTERS, PC_PAIR,
};
use shoal_core::frontier::{BinaryInfo, CoverageFrontier};
use shoal_core::shard::{pack_features_and_hash, read_shard};
use shoal_core::{ByteArray, RngType};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

// serialize_shard_loads bounds peak memory when many shards start at once.
static LOAD_SHARD_LOCK: Mutex<()> = Mutex::new(());

pub struct Fuzzer {
    config: Config,
    rng: RngType,
    fs: FeatureSet,
    corpus: Corpus,
    frontier: CoverageFrontier,
    binary_info: BinaryInfo,
    function_filter: FunctionFilter,
    input_filter: InputFilter,
    executor: Box<dyn Executor>,
    storage: Box<dyn BlobStorage>,
    stats: Arc<Stats>,
    crash: CrashReporter,
    num_runs: usize,
    fuzz_start: Instant,
    pc_pair_scratch: Vec<usize>,
}

impl Fuzzer {
    pub fn new(
        config: Config,
        binary_info: BinaryInfo,
        executor: Box<dyn Executor>,
        storage: Box<dyn BlobStorage>,
        stats: Arc<Stats>,
    ) -> Self {
        let function_filter = FunctionFilter::new(&config.function_filter, &binary_info);
        let input_filter = InputFilter::new(config.input_filter.clone(), &config.scratch_dir);
        let crash = CrashReporter::new(config.crash_reproducer_dir(), config.max_num_crash_reports);
        Self {
            rng: RngType::seed_from_u64(config.seed),
            fs: FeatureSet::new(config.feature_frequency_threshold),
            corpus: Corpus::new(),
            frontier: CoverageFrontier::new(&binary_info),
            binary_info,
            function_filter,
            input_filter,
            executor,
            storage,
            stats,
            crash,
            num_runs: 0,
            fuzz_start: Instant::now(),
            config,
            pc_pair_scratch: Vec::new(),
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.fs
    }

    /// One full pass over this shard: load, seed, fuzz, prune, sync.
    pub fn fuzz_loop(&mut self) -> anyhow::Result<()> {
        log::info!(
            "shard {}/{}, seed {}, workdir {}",
            self.config.my_shard_index,
            self.config.total_shards,
            self.config.seed,
            self.config.workdir.display()
        );

        // Warm the target up with one dummy input.
        {
            let dummy = self.executor.dummy_valid_input();
            let mut warmup = BatchResult::default();
            self.executor
                .execute(&self.config.binary, &[dummy], &mut warmup);
        }

        self.update_and_maybe_log_stats("begin-fuzz", 0);

        let workdir = self.config.workdir.clone();
        if self.config.full_sync {
            let mut shards: Vec<usize> = (0..self.config.total_shards).collect();
            shards.shuffle(&mut self.rng);
            for shard in shards {
                self.load_shard(&workdir, shard, shard == self.config.my_shard_index)?;
            }
        } else {
            self.load_shard(&workdir, self.config.my_shard_index, true)?;
        }

        if let Some(merge_from) = self.config.merge_from.clone() {
            self.merge_from_other_corpus(&merge_from)?;
        }

        let mut corpus_file = self
            .storage
            .appender(&self.config.corpus_path(self.config.my_shard_index))
            .context("failed to open corpus file")?;
        let mut features_file = self
            .storage
            .appender(&self.config.features_path(self.config.my_shard_index))
            .context("failed to open features file")?;

        if self.corpus.num_total() == 0 {
            let dummy = self.executor.dummy_valid_input();
            self.corpus.add(
                CorpusRecord {
                    data: dummy,
                    features: Vec::new(),
                    cmp_args: Vec::new(),
                },
                &self.fs,
                &self.frontier,
            );
        }

        self.update_and_maybe_log_stats("init-done", 0);

        // Pre-init work must not skew the throughput numbers.
        self.fuzz_start = Instant::now();
        self.num_runs = 0;

        self.maybe_generate_telemetry("initial", 0)?;

        let mut number_of_batches = self.config.num_runs / self.config.batch_size;
        if self.config.num_runs % self.config.batch_size != 0 {
            number_of_batches += 1;
        }
        let mut new_runs = 0;
        let mut corpus_size_at_last_prune = self.corpus.num_active();
        let mut parents: Vec<ByteArray> = Vec::new();
        let mut mutants: Vec<ByteArray> = Vec::new();

        for batch_index in 0..number_of_batches {
            if early_exit_requested() {
                break;
            }
            let remaining_runs = self.config.num_runs.saturating_sub(new_runs);
            if remaining_runs == 0 {
                break;
            }
            let batch_size = self.config.batch_size.min(remaining_runs);

            parents.clear();
            for i in 0..self.config.mutate_batch_size {
                let record = if self.config.use_corpus_weights {
                    self.corpus.weighted_random(&mut self.rng)
                } else {
                    self.corpus.uniform_random(&mut self.rng)
                };
                // The cmp args of the first parent become the CMP dictionary
                // for this whole round.
                if i == 0 {
                    self.executor.set_cmp_dictionary(&record.cmp_args);
                }
                parents.push(record.data.clone());
            }

            self.executor.mutate(&parents, batch_size, &mut mutants);
            let gained = self.run_batch(
                &mutants,
                Some(corpus_file.as_mut()),
                Some(features_file.as_mut()),
                None,
            )?;
            new_runs += mutants.len();

            if gained {
                self.update_and_maybe_log_stats("new-feature", 1);
            } else if batch_index.wrapping_sub(1) & batch_index == 0 {
                // Power-of-two batches, so quiet runs still show progress.
                self.update_and_maybe_log_stats("pulse", 1);
            }

            self.maybe_generate_telemetry("latest", batch_index)?;

            if self.config.load_other_shard_frequency != 0
                && batch_index != 0
                && batch_index % self.config.load_other_shard_frequency == 0
                && self.config.total_shards > 1
            {
                let rand = self.rng.gen_range(0..self.config.total_shards - 1);
                let other = (self.config.my_shard_index + 1 + rand) % self.config.total_shards;
                self.load_shard(&workdir, other, false)?;
            }

            if self.config.prune_frequency != 0
                && self.corpus.num_active() > corpus_size_at_last_prune + self.config.prune_frequency
            {
                if self.config.use_coverage_frontier {
                    self.frontier.compute(&self.corpus);
                }
                let removed = self.corpus.prune(
                    &self.fs,
                    &self.frontier,
                    self.config.max_corpus_size,
                    &mut self.rng,
                );
                corpus_size_at_last_prune = self.corpus.num_active();
                if removed > 0 {
                    log::info!("pruned {} corpus records", removed);
                }
            }
        }

        self.generate_telemetry("latest", number_of_batches)?;
        self.update_and_maybe_log_stats("end-fuzz", 0);
        Ok(())
    }

    /// Executes `inputs` and folds the results into the shard state.
    /// Returns true when the batch produced at least one novel input.
    ///
    /// Per input: function-filter probe, novelty on the real features,
    /// optional pc-pair synthesis (which may upgrade a stale input to
    /// novel), then a single frequency commit for accepted inputs. The
    /// unconditional features file records features of rerun inputs even
    /// when they are stale.
    fn run_batch(
        &mut self,
        inputs: &[ByteArray],
        mut corpus_file: Option<&mut dyn BlobAppender>,
        mut features_file: Option<&mut dyn BlobAppender>,
        mut unconditional_features_file: Option<&mut dyn BlobAppender>,
    ) -> anyhow::Result<bool> {
        let binary = self.config.binary.clone();
        let mut batch_result = BatchResult::default();
        let mut success = self.execute_and_report_crash(&binary, inputs, &mut batch_result)?;
        for extra in self.config.extra_binaries.clone() {
            let mut extra_result = BatchResult::default();
            success = self.execute_and_report_crash(&extra, inputs, &mut extra_result)? && success;
        }
        if !success && self.config.exit_on_crash {
            log::info!("exit_on_crash is enabled, exiting soon");
            request_early_exit(1);
            return Ok(false);
        }

        self.num_runs += inputs.len();
        let mut batch_gained = false;
        // On a failed batch only the results read before the abort count.
        let mut num_results = batch_result.results.len().min(inputs.len());
        if !success {
            num_results = num_results.min(batch_result.num_outputs_read);
        }
        for i in 0..num_results {
            if early_exit_requested() {
                break;
            }
            let mut features = std::mem::take(&mut batch_result.results[i].features);
            let function_filter_passed = self.function_filter.passes(&features);
            let mut gained = self.fs.count_unseen_and_prune(&mut features);
            if self.config.use_pcpair_features && self.add_pc_pair_features(&mut features) > 0 {
                gained = true;
            }
            if let Some(f) = unconditional_features_file.as_mut() {
                f.append(&pack_features_and_hash(&inputs[i], &features))
                    .context("failed to append features")?;
            }
            if !gained {
                continue;
            }
            if !self.input_filter.passes(&inputs[i]) {
                continue;
            }
            self.fs.increment_frequencies(&features);
            batch_gained = true;
            if function_filter_passed {
                let cmp_args = std::mem::take(&mut batch_result.results[i].cmp_args);
                self.corpus.add(
                    CorpusRecord {
                        data: inputs[i].clone(),
                        features: features.clone(),
                        cmp_args,
                    },
                    &self.fs,
                    &self.frontier,
                );
            }
            if let Some(f) = corpus_file.as_mut() {
                f.append(&inputs[i]).context("failed to append corpus")?;
            }
            if let Some(dir) = self.config.corpus_dir.first() {
                write_to_hashed_file_in_dir(self.storage.as_ref(), dir, &inputs[i])
                    .context("failed to mirror input into corpus dir")?;
            }
            if let Some(f) = features_file.as_mut() {
                f.append(&pack_features_and_hash(&inputs[i], &features))
                    .context("failed to append features")?;
            }
        }
        Ok(batch_gained)
    }

    fn execute_and_report_crash(
        &mut self,
        binary: &Path,
        inputs: &[ByteArray],
        batch_result: &mut BatchResult,
    ) -> anyhow::Result<bool> {
        let success = self.executor.execute(binary, inputs, batch_result);
        if !success {
            self.crash.report(
                self.executor.as_mut(),
                self.storage.as_ref(),
                binary,
                inputs,
                batch_result,
                &self.stats,
            )?;
        }
        Ok(success)
    }

    /// Synthesizes one feature per unordered pair of covered PCs that the
    /// feature set has not recorded yet. Quadratic in the PCs covered by one
    /// input; off by default. The scratch buffer lives on the instance to
    /// keep this allocation-free in the hot path.
    fn add_pc_pair_features(&mut self, features: &mut FeatureVec) -> usize {
        let num_pcs = self.binary_info.pc_table.len();
        if num_pcs == 0 {
            return 0;
        }
        let pcs = &mut self.pc_pair_scratch;
        pcs.clear();
        for &f in features.iter() {
            if EIGHT_BIT_COUNTERS.contains(f) {
                pcs.push(feature_to_pc_index(f));
            }
        }
        pcs.sort_unstable();
        pcs.dedup();
        let mut num_added = 0;
        for i in 0..pcs.len() {
            for j in i + 1..pcs.len() {
                let f = PC_PAIR.convert_to_me(pc_pair_to_number(pcs[i], pcs[j], num_pcs));
                if self.fs.frequency(f) > 0 {
                    continue;
                }
                features.push(f);
                num_added += 1;
            }
        }
        num_added
    }

    /// Absorbs a shard's on-disk state. With `rerun`, inputs that have no
    /// recorded features are executed again to learn theirs.
    fn load_shard(&mut self, workdir: &Path, shard_index: usize, rerun: bool) -> anyhow::Result<()> {
        let corpus_path = workdir.join(format!("corpus.{}", shard_index));
        let features_path = workdir.join(format!("features.{}", shard_index));
        let mut to_rerun = Vec::new();
        let mut added_to_corpus = 0usize;
        {
            let _guard = if self.config.serialize_shard_loads {
                Some(LOAD_SHARD_LOCK.lock().unwrap())
            } else {
                None
            };
            let fs = &mut self.fs;
            let corpus = &mut self.corpus;
            let frontier = &self.frontier;
            read_shard(
                self.storage.as_ref(),
                &corpus_path,
                &features_path,
                |input, mut features| {
                    if early_exit_requested() {
                        return;
                    }
                    if features.is_empty() {
                        if rerun {
                            to_rerun.push(input);
                        }
                    } else if fs.count_unseen_and_prune(&mut features) {
                        fs.increment_frequencies(&features);
                        // cmp args are not persisted; revived records start
                        // without them.
                        corpus.add(
                            CorpusRecord {
                                data: input,
                                features,
                                cmp_args: Vec::new(),
                            },
                            fs,
                            frontier,
                        );
                        added_to_corpus += 1;
                    }
                },
            );
        }
        if added_to_corpus > 0 {
            self.update_and_maybe_log_stats("load-shard", 1);
        }
        self.rerun(to_rerun)
    }

    /// Re-executes inputs found in a corpus file without a features entry.
    /// Their features land in this shard's features file unconditionally, so
    /// the next load does not rerun them again.
    fn rerun(&mut self, mut to_rerun: Vec<ByteArray>) -> anyhow::Result<()> {
        if to_rerun.is_empty() {
            return Ok(());
        }
        log::info!("{} inputs to rerun", to_rerun.len());
        let mut features_file = self
            .storage
            .appender(&self.config.features_path(self.config.my_shard_index))
            .context("failed to open features file")?;
        while !to_rerun.is_empty() {
            if early_exit_requested() {
                break;
            }
            let batch_size = to_rerun.len().min(self.config.batch_size);
            let batch: Vec<ByteArray> = to_rerun.split_off(to_rerun.len() - batch_size);
            if self.run_batch(&batch, None, None, Some(features_file.as_mut()))? {
                self.update_and_maybe_log_stats("rerun-old", 1);
            }
        }
        Ok(())
    }

    /// Imports the same-indexed shard of a foreign workdir and appends
    /// whatever was new to this shard's own corpus file.
    fn merge_from_other_corpus(&mut self, merge_from: &Path) -> anyhow::Result<()> {
        log::info!("merging from {}", merge_from.display());
        let initial_size = self.corpus.num_active();
        self.load_shard(merge_from, self.config.my_shard_index, true)?;
        let new_size = self.corpus.num_active();
        if new_size > initial_size {
            let mut appender = self
                .storage
                .appender(&self.config.corpus_path(self.config.my_shard_index))
                .context("failed to open corpus file")?;
            for idx in initial_size..new_size {
                appender
                    .append(&self.corpus.get(idx).data)
                    .context("failed to append merged input")?;
            }
            log::info!("merge: {} new inputs added", new_size - initial_size);
        }
        Ok(())
    }

    fn update_and_maybe_log_stats(&mut self, log_type: &str, min_log_level: usize) {
        let covered_pcs = self.fs.to_coverage_pcs().len();
        self.stats.set_corpus_active(self.corpus.num_active() as u64);
        self.stats.set_corpus_total(self.corpus.num_total() as u64);
        self.stats.set_num_features(self.fs.len() as u64);
        self.stats.set_covered_pcs(covered_pcs as u64);
        self.stats.set_num_runs(self.num_runs as u64);

        if self.config.log_level < min_log_level {
            return;
        }
        let fuzz_secs = self.fuzz_start.elapsed().as_secs_f64();
        let execs_per_sec = if fuzz_secs > 0.0 {
            (self.num_runs as f64 / fuzz_secs).round() as u64
        } else {
            0
        };
        let (max_size, avg_size) = self.corpus.max_and_avg_size();
        log::info!(
            "{}[{}] {}: ft: {} cov: {} cnt: {} df: {} cmp: {} path: {} pair: {} corp: {}/{} fr: {} max/avg: {}/{} exec/s: {}",
            self.config.experiment_name,
            self.num_runs,
            log_type,
            self.fs.len(),
            covered_pcs,
            self.fs.count_features(EIGHT_BIT_COUNTERS),
            self.fs.count_features(DATA_FLOW),
            self.fs.count_features(CMP),
            self.fs.count_features(BOUNDED_PATH),
            self.fs.count_features(PC_PAIR),
            self.corpus.num_active(),
            self.corpus.num_total(),
            self.frontier.num_functions_in_frontier(),
            max_size,
            avg_size,
            execs_per_sec
        );
    }

    fn maybe_generate_telemetry(&mut self, annotation: &str, batch_index: usize) -> anyhow::Result<()> {
        let freq = self.config.telemetry_frequency;
        if freq == 0 {
            return Ok(());
        }
        if batch_index == 0 || batch_index % freq == 0 {
            self.generate_telemetry(annotation, batch_index)?;
        }
        Ok(())
    }

    fn generate_telemetry(&mut self, annotation: &str, batch_index: usize) -> anyhow::Result<()> {
        if self.config.telemetry_frequency == 0 {
            return Ok(());
        }
        self.generate_coverage_report(annotation, batch_index)?;
        self.generate_corpus_stats(annotation, batch_index)
    }

    fn generate_coverage_report(&self, annotation: &str, batch_index: usize) -> anyhow::Result<()> {
        if self.binary_info.pc_table.is_empty() {
            return Ok(());
        }
        let mut out = format!("# last batch: {}\n\n", batch_index);
        for pc_index in self.fs.to_coverage_pcs() {
            let _ = writeln!(out, "{} {}", pc_index, self.binary_info.symbols.func(pc_index));
        }
        let path = self.config.coverage_report_path(annotation);
        log::info!("coverage report: {}", path.display());
        self.storage
            .write_file(&path, out.as_bytes())
            .context("failed to write coverage report")
    }

    fn generate_corpus_stats(&self, annotation: &str, batch_index: usize) -> anyhow::Result<()> {
        let mut out = format!("# last batch: {}\n\n", batch_index);
        let _ = writeln!(
            out,
            "active: {} total: {} features: {}",
            self.corpus.num_active(),
            self.corpus.num_total(),
            self.fs.len()
        );
        for record in self.corpus.records() {
            let _ = writeln!(out, "size: {} features: {}", record.data.len(), record.features.len());
        }
        let path = self.config.corpus_stats_path(annotation);
        log::info!("corpus stats: {}", path.display());
        self.storage
            .write_file(&path, out.as_bytes())
            .context("failed to write corpus stats")
    }
}
