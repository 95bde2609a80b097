//! Optional gates between novelty and corpus admission.

use shoal_core::feature::{feature_to_pc_index, FeatureVec, EIGHT_BIT_COUNTERS};
use shoal_core::frontier::BinaryInfo;
use shoal_core::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Restricts corpus growth to inputs touching the named functions.
/// Inputs failing the filter still feed the feature set.
pub struct FunctionFilter {
    allowed_pcs: HashSet<usize>,
}

impl FunctionFilter {
    /// `filter_list` is a comma-separated list of function names; an empty
    /// list or names matching no symbol leave the filter inactive.
    pub fn new(filter_list: &str, binary_info: &BinaryInfo) -> Self {
        let names: Vec<&str> = filter_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let mut allowed_pcs = HashSet::new();
        if !names.is_empty() {
            for pc_index in 0..binary_info.pc_table.len() {
                let func = binary_info.symbols.func(pc_index);
                if names.iter().any(|n| *n == func) {
                    allowed_pcs.insert(pc_index);
                }
            }
        }
        Self { allowed_pcs }
    }

    /// True when the filter is inactive or `features` mentions an allowed
    /// function.
    pub fn passes(&self, features: &FeatureVec) -> bool {
        if self.allowed_pcs.is_empty() {
            return true;
        }
        features.iter().any(|&f| {
            EIGHT_BIT_COUNTERS.contains(f) && self.allowed_pcs.contains(&feature_to_pc_index(f))
        })
    }
}

/// External accept/reject command fed each candidate via a scratch file.
/// Exit status 0 accepts; anything else, including a failure to run the
/// command, rejects.
pub struct InputFilter {
    cmd: Option<PathBuf>,
    scratch_path: PathBuf,
}

impl InputFilter {
    pub fn new(cmd: Option<PathBuf>, scratch_dir: &Path) -> Self {
        Self {
            cmd,
            scratch_path: scratch_dir.join("filter-input"),
        }
    }

    pub fn passes(&self, input: &[u8]) -> bool {
        let cmd = match &self.cmd {
            Some(cmd) => cmd,
            None => return true,
        };
        if std::fs::write(&self.scratch_path, input).is_err() {
            return false;
        }
        let status = Command::new(cmd)
            .arg(&self.scratch_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let accepted = matches!(status, Ok(s) if s.success());
        let _ = std::fs::remove_file(&self.scratch_path);
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::feature::pc_and_counter_to_feature;
    use shoal_core::frontier::{PcInfo, PC_FLAG_FUNC_ENTRY};

    fn binary_info() -> BinaryInfo {
        let mut info = BinaryInfo::default();
        for (i, func) in ["alpha", "alpha", "beta", "beta"].iter().enumerate() {
            info.pc_table.push(PcInfo {
                pc: 0x1000 + i as u64 * 4,
                flags: if i % 2 == 0 { PC_FLAG_FUNC_ENTRY } else { 0 },
            });
            info.symbols.add_entry(func, "t.cc:1");
        }
        info
    }

    #[test]
    fn empty_filter_passes_everything() {
        let filter = FunctionFilter::new("", &binary_info());
        assert!(filter.passes(&vec![pc_and_counter_to_feature(0, 1)]));
        assert!(filter.passes(&Vec::new()));
    }

    #[test]
    fn filter_matches_functions_by_name() {
        let filter = FunctionFilter::new("beta", &binary_info());
        assert!(filter.passes(&vec![pc_and_counter_to_feature(2, 1)]));
        assert!(filter.passes(&vec![
            pc_and_counter_to_feature(0, 1),
            pc_and_counter_to_feature(3, 1),
        ]));
        assert!(!filter.passes(&vec![pc_and_counter_to_feature(0, 1)]));
        assert!(!filter.passes(&Vec::new()));
    }

    #[test]
    fn unknown_function_names_leave_the_filter_inactive() {
        let filter = FunctionFilter::new("gamma", &binary_info());
        assert!(filter.passes(&vec![pc_and_counter_to_feature(0, 1)]));
    }

    #[test]
    fn input_filter_runs_the_external_command() {
        let scratch = std::env::temp_dir().join(format!("shoal-filter-{}", std::process::id()));
        std::fs::create_dir_all(&scratch).unwrap();
        let accept = InputFilter::new(Some(PathBuf::from("true")), &scratch);
        assert!(accept.passes(b"anything"));
        let reject = InputFilter::new(Some(PathBuf::from("false")), &scratch);
        assert!(!reject.passes(b"anything"));
        let none = InputFilter::new(None, &scratch);
        assert!(none.passes(b"anything"));
    }
}
