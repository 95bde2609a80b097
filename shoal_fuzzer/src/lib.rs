//! Shoal: a sharded, coverage-guided fuzzing engine.
//!
//! Many independent shard processes explore a target's input space, trading
//! discovered inputs and coverage through append-only files in a shared
//! workdir. `shoal_core` holds the algorithms; this crate wires them to a
//! configuration, an executor and storage, and runs the loop.

pub mod config;
pub mod corpus_io;
pub mod crash;
pub mod exec;
pub mod filter;
pub mod fuzzer;
pub mod stats;
pub mod util;

use crate::config::Config;
use crate::exec::CommandExecutor;
use crate::fuzzer::Fuzzer;
use crate::stats::Stats;
use anyhow::Context;
use shoal_core::blob::LocalBlobStorage;
use shoal_core::dict::parse_afl_dictionary;
use shoal_core::frontier::{load_pc_table, BinaryInfo, SymbolTable};
use shoal_core::ByteArray;
use std::sync::Arc;

/// Loads the optional PC table and symbols the config points at.
pub fn load_binary_info(config: &Config) -> anyhow::Result<BinaryInfo> {
    let mut info = BinaryInfo::default();
    if let Some(path) = &config.pc_table {
        info.pc_table = load_pc_table(path)
            .with_context(|| format!("failed to load pc table {}", path.display()))?;
        log::info!("pc table: {} entries", info.pc_table.len());
    }
    if let Some(path) = &config.symbols {
        info.symbols = SymbolTable::load(path)
            .with_context(|| format!("failed to load symbols {}", path.display()))?;
        log::info!("symbols: {} entries", info.symbols.len());
    }
    Ok(info)
}

/// Reads and parses all configured dictionary files.
pub fn load_dictionaries(config: &Config) -> anyhow::Result<Vec<ByteArray>> {
    let mut entries = Vec::new();
    for path in &config.dictionary {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dictionary {}", path.display()))?;
        let parsed = parse_afl_dictionary(&text)
            .with_context(|| format!("bad dictionary {}", path.display()))?;
        log::info!("dictionary {}: {} entries", path.display(), parsed.len());
        entries.extend(parsed);
    }
    Ok(entries)
}

/// Validates the config and runs this shard to completion (or runs the
/// requested corpus import/export one-shot instead).
pub fn boot(mut config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    config.fixup().context("failed to prepare directories")?;

    if let Some(dir) = config.save_corpus_to_local_dir.clone() {
        return corpus_io::save_corpus_to_local_dir(&config, &LocalBlobStorage, &dir);
    }
    if let Some(dir) = config.export_corpus_from_local_dir.clone() {
        return corpus_io::export_corpus_from_local_dir(&config, &LocalBlobStorage, &dir);
    }

    let binary_info = load_binary_info(&config)?;
    let mut executor = CommandExecutor::new(&config);
    executor.add_to_dictionary(&load_dictionaries(&config)?);
    let stats = Arc::new(Stats::new());
    let mut fuzzer = Fuzzer::new(
        config,
        binary_info,
        Box::new(executor),
        Box::new(LocalBlobStorage),
        stats,
    );
    fuzzer.fuzz_loop()
}

/// Translates termination signals into the early-exit flag, so the loop
/// finishes its in-flight batch and flushes before returning.
pub fn setup_signal_handler() {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::Signals;

    std::thread::spawn(move || {
        let mut signals = match Signals::new(TERM_SIGNALS) {
            Ok(signals) => signals,
            Err(e) => {
                log::warn!("failed to install signal handler: {}", e);
                return;
            }
        };
        if let Some(signal) = signals.forever().next() {
            log::info!("signal {} received, finishing the current batch", signal);
            util::request_early_exit(128 + signal);
        }
    });
}
