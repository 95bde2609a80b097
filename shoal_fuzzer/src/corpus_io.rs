//! Moving corpora between shard blob files and plain directories.

use crate::config::Config;
use anyhow::Context;
use shoal_core::blob::{write_to_hashed_file_in_dir, BlobStorage};
use shoal_core::util::hash;
use shoal_core::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Copies every shard's corpus into `dir`, one hash-named file per input.
pub fn save_corpus_to_local_dir(
    config: &Config,
    storage: &dyn BlobStorage,
    dir: &Path,
) -> anyhow::Result<()> {
    storage
        .make_dir(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    for shard in 0..config.total_shards {
        let path = config.corpus_path(shard);
        let mut num_read = 0usize;
        if let Ok(mut reader) = storage.reader(&path) {
            while let Ok(Some(input)) = reader.next_blob() {
                num_read += 1;
                write_to_hashed_file_in_dir(storage, dir, &input)
                    .context("failed to write input")?;
            }
        }
        log::info!("read {} inputs from {}", num_read, path.display());
    }
    Ok(())
}

/// Stable filename -> shard mapping: a given file always lands in the same
/// shard.
fn shard_of_filename(path: &Path, total_shards: usize) -> usize {
    let mut hasher = ahash::AHasher::default();
    path.file_name().unwrap_or_default().hash(&mut hasher);
    (hasher.finish() % total_shards as u64) as usize
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read dir {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Appends the files under `dir` to the shard corpus files, skipping inputs
/// a shard already has.
pub fn export_corpus_from_local_dir(
    config: &Config,
    storage: &dyn BlobStorage,
    dir: &Path,
) -> anyhow::Result<()> {
    let mut paths = Vec::new();
    collect_files(dir, &mut paths)?;
    let mut sharded_paths: Vec<Vec<PathBuf>> = vec![Vec::new(); config.total_shards];
    for path in paths {
        let shard = shard_of_filename(&path, config.total_shards);
        sharded_paths[shard].push(path);
    }

    let mut inputs_added = 0usize;
    let mut inputs_ignored = 0usize;
    for (shard, paths) in sharded_paths.iter().enumerate() {
        let corpus_path = config.corpus_path(shard);
        let mut existing_hashes: HashSet<String> = HashSet::new();
        if let Ok(mut reader) = storage.reader(&corpus_path) {
            while let Ok(Some(input)) = reader.next_blob() {
                existing_hashes.insert(hash(&input));
            }
        }
        let mut appender = storage
            .appender(&corpus_path)
            .with_context(|| format!("failed to open {}", corpus_path.display()))?;
        for path in paths {
            let input = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if input.is_empty() || existing_hashes.contains(&hash(&input)) {
                inputs_ignored += 1;
                continue;
            }
            appender
                .append(&input)
                .with_context(|| format!("failed to append to {}", corpus_path.display()))?;
            inputs_added += 1;
        }
    }
    log::info!(
        "export: {} inputs added, {} ignored",
        inputs_added,
        inputs_ignored
    );
    Ok(())
}
