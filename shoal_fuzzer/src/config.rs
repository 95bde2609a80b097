//! Engine configuration and workdir layout.

use anyhow::Context;
use shoal_core::util::get_random_seed;
use std::fs::create_dir_all;
use std::path::PathBuf;

/// Everything one shard needs to know. Built from CLI flags by `main`, or
/// directly by tests and embedders.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory shared by all shards of the experiment.
    pub workdir: PathBuf,
    /// Target binary under test.
    pub binary: PathBuf,
    /// Additional binaries every batch is replayed against.
    pub extra_binaries: Vec<PathBuf>,
    /// Total number of target runs for this shard.
    pub num_runs: usize,
    /// Inputs per execution batch.
    pub batch_size: usize,
    /// Parents drawn from the corpus per mutation round.
    pub mutate_batch_size: usize,
    /// Random seed; 0 derives one from time and pid.
    pub seed: u64,
    pub total_shards: usize,
    pub my_shard_index: usize,
    /// Re-read a random other shard every this many batches; 0 disables.
    pub load_other_shard_frequency: usize,
    /// Prune once the active corpus grew by this much; 0 disables.
    pub prune_frequency: usize,
    pub max_corpus_size: usize,
    /// Percentage of mutants bred from two parents.
    pub crossover_level: u32,
    /// Mutant sizes stay multiples of this where achievable.
    pub size_alignment: usize,
    /// Upper bound on mutant size.
    pub max_len: usize,
    pub use_corpus_weights: bool,
    pub use_coverage_frontier: bool,
    pub use_pcpair_features: bool,
    /// Comma-separated function names; empty disables the filter.
    pub function_filter: String,
    /// External command accepting (exit 0) or rejecting candidate inputs.
    pub input_filter: Option<PathBuf>,
    pub fork_server: bool,
    pub feature_frequency_threshold: u32,
    pub exit_on_crash: bool,
    pub max_num_crash_reports: usize,
    /// Foreign workdir whose same-indexed shard is imported at startup.
    pub merge_from: Option<PathBuf>,
    /// Extra corpus directories; accepted inputs are mirrored into the first.
    pub corpus_dir: Vec<PathBuf>,
    /// Load all shards at startup instead of just this one.
    pub full_sync: bool,
    /// Serialize shard loads within the process to bound peak memory.
    pub serialize_shard_loads: bool,
    pub log_level: usize,
    pub experiment_name: String,
    /// Dump telemetry files every this many batches; 0 disables.
    pub telemetry_frequency: usize,
    /// AFL/libFuzzer dictionary files.
    pub dictionary: Vec<PathBuf>,
    /// PC table of the instrumented binary, as produced by the disassembly
    /// pipeline.
    pub pc_table: Option<PathBuf>,
    pub symbols: Option<PathBuf>,
    /// One-shot: copy all shard corpora into this directory and exit.
    pub save_corpus_to_local_dir: Option<PathBuf>,
    /// One-shot: append the files in this directory to the shard corpora and
    /// exit.
    pub export_corpus_from_local_dir: Option<PathBuf>,
    /// Per-shard scratch directory; derived from the temp dir when empty.
    pub scratch_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: PathBuf::new(),
            binary: PathBuf::new(),
            extra_binaries: Vec::new(),
            num_runs: usize::MAX,
            batch_size: 1000,
            mutate_batch_size: 2,
            seed: 0,
            total_shards: 1,
            my_shard_index: 0,
            load_other_shard_frequency: 10,
            prune_frequency: 100,
            max_corpus_size: 100_000,
            crossover_level: 50,
            size_alignment: 1,
            max_len: 4000,
            use_corpus_weights: true,
            use_coverage_frontier: false,
            use_pcpair_features: false,
            function_filter: String::new(),
            input_filter: None,
            fork_server: true,
            feature_frequency_threshold: 100,
            exit_on_crash: false,
            max_num_crash_reports: 5,
            merge_from: None,
            corpus_dir: Vec::new(),
            full_sync: false,
            serialize_shard_loads: false,
            log_level: 1,
            experiment_name: String::new(),
            telemetry_frequency: 0,
            dictionary: Vec::new(),
            pc_table: None,
            symbols: None,
            save_corpus_to_local_dir: None,
            export_corpus_from_local_dir: None,
            scratch_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Validates the configuration; all failures here are fatal at startup.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.workdir.as_os_str().is_empty() {
            anyhow::bail!("workdir not set");
        }
        if self.binary.as_os_str().is_empty() {
            anyhow::bail!("binary not set");
        }
        if self.total_shards == 0 {
            anyhow::bail!("total_shards must be positive");
        }
        if self.my_shard_index >= self.total_shards {
            anyhow::bail!(
                "my_shard_index {} out of range for {} shards",
                self.my_shard_index,
                self.total_shards
            );
        }
        if self.batch_size == 0 || self.mutate_batch_size == 0 {
            anyhow::bail!("batch_size and mutate_batch_size must be positive");
        }
        if self.size_alignment == 0 || self.max_len == 0 {
            anyhow::bail!("size_alignment and max_len must be positive");
        }
        if self.max_len != usize::MAX && self.max_len % self.size_alignment != 0 {
            anyhow::bail!(
                "max_len {} is not a multiple of size_alignment {}",
                self.max_len,
                self.size_alignment
            );
        }
        if self.crossover_level > 100 {
            anyhow::bail!("crossover_level must be in [0, 100]");
        }
        if self.feature_frequency_threshold == 0 {
            anyhow::bail!("feature_frequency_threshold must be positive");
        }
        if self.use_pcpair_features && self.pc_table.is_none() {
            anyhow::bail!("use_pcpair_features requires a pc table");
        }
        for d in &self.dictionary {
            if !d.is_file() {
                anyhow::bail!("bad dictionary file: {}", d.display());
            }
        }
        if let Some(m) = &self.merge_from {
            if !m.is_dir() {
                anyhow::bail!("bad merge_from dir: {}", m.display());
            }
        }
        Ok(())
    }

    /// Derives the effective seed and creates the directory layout.
    pub fn fixup(&mut self) -> anyhow::Result<()> {
        self.seed = get_random_seed(self.seed);
        create_dir_all(&self.workdir)
            .with_context(|| format!("failed to create workdir {}", self.workdir.display()))?;
        if self.scratch_dir.as_os_str().is_empty() {
            self.scratch_dir = std::env::temp_dir().join(format!(
                "shoal-{}-{}",
                std::process::id(),
                self.my_shard_index
            ));
        }
        create_dir_all(&self.scratch_dir).with_context(|| {
            format!("failed to create scratch dir {}", self.scratch_dir.display())
        })?;
        for dir in &self.corpus_dir {
            create_dir_all(dir)
                .with_context(|| format!("failed to create corpus dir {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn corpus_path(&self, shard: usize) -> PathBuf {
        self.workdir.join(format!("corpus.{}", shard))
    }

    pub fn features_path(&self, shard: usize) -> PathBuf {
        self.workdir.join(format!("features.{}", shard))
    }

    pub fn crash_reproducer_dir(&self) -> PathBuf {
        self.workdir.join("crashes")
    }

    pub fn coverage_report_path(&self, annotation: &str) -> PathBuf {
        self.workdir.join(format!(
            "coverage-report-{}.{}.txt",
            self.my_shard_index, annotation
        ))
    }

    pub fn corpus_stats_path(&self, annotation: &str) -> PathBuf {
        self.workdir.join(format!(
            "corpus-stats-{}.{}.txt",
            self.my_shard_index, annotation
        ))
    }
}
