//! Crash reporting and single-input reproducer search.

use crate::exec::{BatchResult, Executor};
use crate::stats::Stats;
use anyhow::Context;
use shoal_core::blob::BlobStorage;
use shoal_core::util::{as_printable, hash};
use shoal_core::ByteArray;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub struct CrashReporter {
    reproducer_dir: PathBuf,
    max_reports: usize,
    num_reports: usize,
}

impl CrashReporter {
    pub fn new(reproducer_dir: PathBuf, max_reports: usize) -> Self {
        Self {
            reproducer_dir,
            max_reports,
            num_reports: 0,
        }
    }

    pub fn num_reports(&self) -> usize {
        self.num_reports
    }

    /// Logs the failed batch, then replays its inputs one by one looking for
    /// a single-input reproducer, which is saved under the hash of the
    /// offending input. Reports past the configured maximum are suppressed.
    pub fn report(
        &mut self,
        executor: &mut dyn Executor,
        storage: &dyn BlobStorage,
        binary: &Path,
        inputs: &[ByteArray],
        batch_result: &BatchResult,
        stats: &Stats,
    ) -> anyhow::Result<()> {
        stats.inc_crashes();
        if self.num_reports >= self.max_reports {
            return Ok(());
        }
        let report_index = self.num_reports;
        self.num_reports += 1;

        log::info!(
            "crash[{}]: batch failed: binary: {}, exit code: {}, failure: {}, inputs: {}",
            report_index,
            binary.display(),
            batch_result.exit_code,
            batch_result.failure_description,
            inputs.len()
        );
        for line in batch_result.log.trim().lines() {
            log::info!("crash[{}]: target log: {}", report_index, line);
        }
        if self.num_reports == self.max_reports {
            log::info!("reached max_num_crash_reports, further reports will be suppressed");
        }

        // Try the presumed crasher first, but keep it at its original
        // position too: the target may have been primed for the crash by the
        // inputs that preceded it.
        let mut order: VecDeque<usize> = (0..inputs.len()).collect();
        let suspect = batch_result.num_outputs_read;
        if suspect < inputs.len() {
            order.push_front(suspect);
        }

        log::info!(
            "crash[{}]: executing inputs one by one, trying to find the reproducer",
            report_index
        );
        for idx in order {
            let input = &inputs[idx];
            let mut one_result = BatchResult::default();
            if !executor.execute(binary, std::slice::from_ref(input), &mut one_result) {
                let file_path = self.reproducer_dir.join(hash(input));
                log::info!(
                    "crash[{}]: reproducer found: input: {}, exit code: {}, failure: {}, saving to {}",
                    report_index,
                    as_printable(input, 32),
                    one_result.exit_code,
                    one_result.failure_description,
                    file_path.display()
                );
                storage
                    .make_dir(&self.reproducer_dir)
                    .context("failed to create crash reproducer dir")?;
                storage
                    .write_file(&file_path, input)
                    .context("failed to save crash reproducer")?;
                stats.inc_reproducers();
                return Ok(());
            }
        }
        log::info!(
            "crash[{}]: crash was not observed when running inputs one by one",
            report_index
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::blob::LocalBlobStorage;
    use std::fs;

    /// Fails whenever the designated input is present in the batch.
    struct CrashingExecutor {
        crash_on: ByteArray,
        executions: usize,
    }

    impl Executor for CrashingExecutor {
        fn execute(
            &mut self,
            _binary: &Path,
            inputs: &[ByteArray],
            batch_result: &mut BatchResult,
        ) -> bool {
            self.executions += 1;
            batch_result.reset(inputs.len());
            for (i, input) in inputs.iter().enumerate() {
                if *input == self.crash_on {
                    batch_result.exit_code = 134;
                    batch_result.failure_description = "SIGABRT".to_string();
                    batch_result.log = "boom\nstack".to_string();
                    batch_result.num_outputs_read = i;
                    return false;
                }
                batch_result.num_outputs_read = i + 1;
            }
            true
        }

        fn dummy_valid_input(&self) -> ByteArray {
            vec![0]
        }

        fn mutate(&mut self, _: &[ByteArray], _: usize, mutants: &mut Vec<ByteArray>) {
            mutants.clear();
        }

        fn set_cmp_dictionary(&mut self, _: &[u8]) {}
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("shoal-crash-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn single_input_reproducer_is_saved_under_its_hash() {
        let dir = test_dir("repro");
        let inputs: Vec<ByteArray> = (0u8..5).map(|i| vec![i; 4]).collect();
        let mut exec = CrashingExecutor {
            crash_on: inputs[3].clone(),
            executions: 0,
        };
        let mut batch_result = BatchResult::default();
        assert!(!exec.execute(Path::new("t"), &inputs, &mut batch_result));
        assert_eq!(batch_result.num_outputs_read, 3);

        let stats = Stats::new();
        let mut reporter = CrashReporter::new(dir.clone(), 10);
        reporter
            .report(
                &mut exec,
                &LocalBlobStorage,
                Path::new("t"),
                &inputs,
                &batch_result,
                &stats,
            )
            .unwrap();

        let files: Vec<_> = fs::read_dir(&dir).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].file_name().to_string_lossy(),
            hash(&inputs[3]).as_str()
        );
        assert_eq!(fs::read(files[0].path()).unwrap(), inputs[3]);
        assert_eq!(stats.num_reproducers(), 1);
    }

    #[test]
    fn sequence_dependent_crash_saves_nothing() {
        let dir = test_dir("seq");
        let inputs: Vec<ByteArray> = (0u8..3).map(|i| vec![i]).collect();
        // Crashes on an input that is not in the batch: every single-input
        // replay succeeds.
        let mut exec = CrashingExecutor {
            crash_on: vec![99],
            executions: 0,
        };
        let mut batch_result = BatchResult::default();
        batch_result.reset(inputs.len());
        batch_result.num_outputs_read = 1;

        let stats = Stats::new();
        let mut reporter = CrashReporter::new(dir.clone(), 10);
        reporter
            .report(
                &mut exec,
                &LocalBlobStorage,
                Path::new("t"),
                &inputs,
                &batch_result,
                &stats,
            )
            .unwrap();
        // Replays suspect + all inputs in order.
        assert_eq!(exec.executions, 4);
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
    }

    #[test]
    fn reports_past_the_maximum_are_suppressed() {
        let dir = test_dir("cap");
        let inputs: Vec<ByteArray> = vec![vec![1]];
        let mut exec = CrashingExecutor {
            crash_on: vec![1],
            executions: 0,
        };
        let mut batch_result = BatchResult::default();
        batch_result.reset(1);

        let stats = Stats::new();
        let mut reporter = CrashReporter::new(dir, 1);
        for _ in 0..3 {
            reporter
                .report(
                    &mut exec,
                    &LocalBlobStorage,
                    Path::new("t"),
                    &inputs,
                    &batch_result,
                    &stats,
                )
                .unwrap();
        }
        assert_eq!(reporter.num_reports(), 1);
        // Only the first report replays inputs, and it stops at the
        // reproducer.
        assert_eq!(exec.executions, 1);
        assert_eq!(stats.num_crashes(), 3);
    }
}
