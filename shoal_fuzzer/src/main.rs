use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use shoal_fuzzer::{boot, config::Config, setup_signal_handler, util};
use std::path::PathBuf;

/// Sharded coverage-guided fuzzing engine.
#[derive(Debug, Parser)]
#[command(name = "shoal", version, about)]
struct Settings {
    /// Directory shared by all shards of the experiment.
    #[arg(long)]
    workdir: PathBuf,
    /// Target binary under test.
    #[arg(long)]
    binary: PathBuf,
    /// Additional binaries every batch is replayed against.
    #[arg(long)]
    extra_binaries: Vec<PathBuf>,
    /// Number of target runs for this shard.
    #[arg(long, default_value_t = usize::MAX)]
    num_runs: usize,
    /// Inputs per execution batch.
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,
    /// Parents drawn from the corpus per mutation round.
    #[arg(long, default_value_t = 2)]
    mutate_batch_size: usize,
    /// Random seed; 0 derives one from time and pid.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Number of shards in the experiment.
    #[arg(long, default_value_t = 1)]
    total_shards: usize,
    /// Index of this shard, in [0, total_shards).
    #[arg(long, default_value_t = 0)]
    my_shard_index: usize,
    /// Re-read a random other shard every this many batches; 0 disables.
    #[arg(long, default_value_t = 10)]
    load_other_shard_frequency: usize,
    /// Prune once the active corpus grew by this much; 0 disables.
    #[arg(long, default_value_t = 100)]
    prune_frequency: usize,
    /// Active corpus records to keep after pruning.
    #[arg(long, default_value_t = 100_000)]
    max_corpus_size: usize,
    /// Percentage of mutants bred from two parents.
    #[arg(long, default_value_t = 50)]
    crossover_level: u32,
    /// Mutant sizes stay multiples of this where achievable.
    #[arg(long, default_value_t = 1)]
    size_alignment: usize,
    /// Upper bound on mutant size in bytes.
    #[arg(long, default_value_t = 4000)]
    max_len: usize,
    /// Weighted parent selection instead of uniform.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    use_corpus_weights: bool,
    /// Boost weights of records touching the coverage frontier.
    #[arg(long)]
    use_coverage_frontier: bool,
    /// Synthesize features for unordered PC pairs (quadratic).
    #[arg(long)]
    use_pcpair_features: bool,
    /// Comma-separated function names; only inputs touching them enter the
    /// corpus.
    #[arg(long, default_value = "")]
    function_filter: String,
    /// External command accepting (exit 0) or rejecting candidate inputs.
    #[arg(long)]
    input_filter: Option<PathBuf>,
    /// Ask the execution runtime to keep a fork server.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fork_server: bool,
    /// Feature frequency at which a feature stops rewarding.
    #[arg(long, default_value_t = 100)]
    feature_frequency_threshold: u32,
    /// Stop the shard after the first crash report.
    #[arg(long)]
    exit_on_crash: bool,
    /// Crash reports beyond this count are suppressed.
    #[arg(long, default_value_t = 5)]
    max_num_crash_reports: usize,
    /// Foreign workdir whose same-indexed shard is imported at startup.
    #[arg(long)]
    merge_from: Option<PathBuf>,
    /// Extra corpus directories; accepted inputs are mirrored into the first.
    #[arg(long)]
    corpus_dir: Vec<PathBuf>,
    /// Load all shards at startup instead of just this one.
    #[arg(long)]
    full_sync: bool,
    /// Serialize in-process shard loads to bound peak memory.
    #[arg(long)]
    serialize_shard_loads: bool,
    /// Verbosity of the periodic stats lines.
    #[arg(long, default_value_t = 1)]
    log_level: usize,
    /// Name prefixed to every stats line.
    #[arg(long, default_value = "")]
    experiment_name: String,
    /// Dump telemetry files every this many batches; 0 disables.
    #[arg(long, default_value_t = 0)]
    telemetry_frequency: usize,
    /// AFL/libFuzzer dictionary files.
    #[arg(long)]
    dictionary: Vec<PathBuf>,
    /// PC table of the instrumented binary.
    #[arg(long)]
    pc_table: Option<PathBuf>,
    /// Symbol table matching the PC table.
    #[arg(long)]
    symbols: Option<PathBuf>,
    /// Copy all shard corpora into this directory and exit.
    #[arg(long)]
    save_corpus_to_local_dir: Option<PathBuf>,
    /// Append the files in this directory to the shard corpora and exit.
    #[arg(long)]
    export_corpus_from_local_dir: Option<PathBuf>,
    /// Per-shard scratch directory; derived from the temp dir when empty.
    #[arg(long, default_value = "")]
    scratch_dir: PathBuf,
}

impl From<Settings> for Config {
    fn from(settings: Settings) -> Self {
        Config {
            workdir: settings.workdir,
            binary: settings.binary,
            extra_binaries: settings.extra_binaries,
            num_runs: settings.num_runs,
            batch_size: settings.batch_size,
            mutate_batch_size: settings.mutate_batch_size,
            seed: settings.seed,
            total_shards: settings.total_shards,
            my_shard_index: settings.my_shard_index,
            load_other_shard_frequency: settings.load_other_shard_frequency,
            prune_frequency: settings.prune_frequency,
            max_corpus_size: settings.max_corpus_size,
            crossover_level: settings.crossover_level,
            size_alignment: settings.size_alignment,
            max_len: settings.max_len,
            use_corpus_weights: settings.use_corpus_weights,
            use_coverage_frontier: settings.use_coverage_frontier,
            use_pcpair_features: settings.use_pcpair_features,
            function_filter: settings.function_filter,
            input_filter: settings.input_filter,
            fork_server: settings.fork_server,
            feature_frequency_threshold: settings.feature_frequency_threshold,
            exit_on_crash: settings.exit_on_crash,
            max_num_crash_reports: settings.max_num_crash_reports,
            merge_from: settings.merge_from,
            corpus_dir: settings.corpus_dir,
            full_sync: settings.full_sync,
            serialize_shard_loads: settings.serialize_shard_loads,
            log_level: settings.log_level,
            experiment_name: settings.experiment_name,
            telemetry_frequency: settings.telemetry_frequency,
            dictionary: settings.dictionary,
            pc_table: settings.pc_table,
            symbols: settings.symbols,
            save_corpus_to_local_dir: settings.save_corpus_to_local_dir,
            export_corpus_from_local_dir: settings.export_corpus_from_local_dir,
            scratch_dir: settings.scratch_dir,
        }
    }
}

fn main() {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("SHOAL_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    setup_signal_handler();

    if let Err(e) = boot(Config::from(settings)) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
    std::process::exit(util::exit_code());
}
