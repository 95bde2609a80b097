//! The bridge to the target-execution runtime.
//!
//! The runtime that drives the instrumented binary and harvests coverage is
//! an external collaborator; the engine only depends on the [`Executor`]
//! trait. [`CommandExecutor`] is the degenerate local implementation: one
//! subprocess per input, no coverage. It is enough for smoke runs and fixes
//! the failure semantics real runtimes must follow.

use crate::config::Config;
use shoal_core::feature::FeatureVec;
use shoal_core::mutation::{ByteArrayMutator, Knobs};
use shoal_core::ByteArray;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// What one input did to the target.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub features: FeatureVec,
    pub cmp_args: ByteArray,
}

/// Outcome of one batch handed to the runtime.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub exit_code: i32,
    pub failure_description: String,
    pub log: String,
    pub results: Vec<ExecutionResult>,
    /// Per-input results completed before a batch abort; on failure this
    /// index is the presumed crasher.
    pub num_outputs_read: usize,
}

impl BatchResult {
    /// Resets the result for a batch of `num_inputs` inputs.
    pub fn reset(&mut self, num_inputs: usize) {
        *self = BatchResult {
            results: vec![ExecutionResult::default(); num_inputs],
            ..BatchResult::default()
        };
    }
}

/// The target-execution runtime as seen by the engine.
pub trait Executor {
    /// Runs `inputs` against `binary`, filling `batch_result`. Returns false
    /// on a batch failure; `num_outputs_read` then tells how many per-input
    /// results were complete before the abort.
    fn execute(
        &mut self,
        binary: &Path,
        inputs: &[ByteArray],
        batch_result: &mut BatchResult,
    ) -> bool;

    /// A minimal input the target accepts; used for warmup and seeding.
    fn dummy_valid_input(&self) -> ByteArray;

    /// Produces `num_mutants` children of `inputs`. Default runtimes
    /// delegate to a [`ByteArrayMutator`]; target-side mutators may not.
    fn mutate(&mut self, inputs: &[ByteArray], num_mutants: usize, mutants: &mut Vec<ByteArray>);

    /// Feeds runtime comparison operands to the mutation dictionary.
    fn set_cmp_dictionary(&mut self, cmp_data: &[u8]);
}

/// Runs the target once per input, passing the input via a scratch file.
pub struct CommandExecutor {
    mutator: ByteArrayMutator,
    crossover_level: u32,
    scratch_input: PathBuf,
}

impl CommandExecutor {
    pub fn new(config: &Config) -> Self {
        let mut mutator = ByteArrayMutator::new(Knobs::default(), config.seed);
        mutator.set_size_alignment(config.size_alignment);
        mutator.set_max_len(config.max_len);
        Self {
            mutator,
            crossover_level: config.crossover_level,
            scratch_input: config.scratch_dir.join("input"),
        }
    }

    pub fn add_to_dictionary(&mut self, entries: &[ByteArray]) {
        self.mutator.add_to_dictionary(entries);
    }
}

impl Executor for CommandExecutor {
    fn execute(
        &mut self,
        binary: &Path,
        inputs: &[ByteArray],
        batch_result: &mut BatchResult,
    ) -> bool {
        batch_result.reset(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            if let Err(e) = std::fs::write(&self.scratch_input, input) {
                batch_result.exit_code = -1;
                batch_result.failure_description = format!("failed to write scratch input: {}", e);
                batch_result.num_outputs_read = i;
                return false;
            }
            let output = Command::new(binary)
                .arg(&self.scratch_input)
                .stdin(Stdio::null())
                .output();
            match output {
                Ok(out) if out.status.success() => {
                    batch_result.num_outputs_read = i + 1;
                }
                Ok(out) => {
                    batch_result.exit_code = out.status.code().unwrap_or(-1);
                    batch_result.failure_description =
                        format!("target exited with {}", batch_result.exit_code);
                    batch_result.log = String::from_utf8_lossy(&out.stderr).into_owned();
                    batch_result.num_outputs_read = i;
                    return false;
                }
                Err(e) => {
                    batch_result.exit_code = -1;
                    batch_result.failure_description = format!("failed to spawn target: {}", e);
                    batch_result.num_outputs_read = i;
                    return false;
                }
            }
        }
        true
    }

    fn dummy_valid_input(&self) -> ByteArray {
        vec![0]
    }

    fn mutate(&mut self, inputs: &[ByteArray], num_mutants: usize, mutants: &mut Vec<ByteArray>) {
        self.mutator
            .mutate_many(inputs, num_mutants, self.crossover_level, mutants);
    }

    fn set_cmp_dictionary(&mut self, cmp_data: &[u8]) {
        self.mutator.set_cmp_dictionary(cmp_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> Config {
        let scratch = std::env::temp_dir().join(format!("shoal-exec-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&scratch).unwrap();
        Config {
            seed: 1,
            scratch_dir: scratch,
            ..Config::default()
        }
    }

    #[test]
    fn command_executor_reports_success_per_input() {
        let config = test_config("ok");
        let mut exec = CommandExecutor::new(&config);
        let mut result = BatchResult::default();
        let inputs = vec![vec![1u8], vec![2u8]];
        assert!(exec.execute(Path::new("true"), &inputs, &mut result));
        assert_eq!(result.num_outputs_read, 2);
        assert_eq!(result.results.len(), 2);
    }

    #[test]
    fn command_executor_reports_the_failing_index() {
        let config = test_config("fail");
        let mut exec = CommandExecutor::new(&config);
        let mut result = BatchResult::default();
        let inputs = vec![vec![1u8], vec![2u8], vec![3u8]];
        assert!(!exec.execute(Path::new("false"), &inputs, &mut result));
        assert_eq!(result.num_outputs_read, 0);
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn mutate_produces_the_requested_count() {
        let config = test_config("mutate");
        let mut exec = CommandExecutor::new(&config);
        let mut mutants = Vec::new();
        exec.mutate(&[vec![0u8; 8]], 17, &mut mutants);
        assert_eq!(mutants.len(), 17);
        assert!(mutants.iter().all(|m| !m.is_empty()));
    }
}
