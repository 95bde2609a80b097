//! Function-level coverage frontier over the target's PC table.
//!
//! The PC table and symbols come from an external collaborator (the binary
//! disassembly pipeline); here they are only consumed. Functions are the
//! spans between function-entry PCs, and the frontier is the set of
//! functions with both covered and uncovered PCs. It serves solely as a
//! corpus weight booster.

use crate::corpus::Corpus;
use crate::feature::{feature_to_pc_index, EIGHT_BIT_COUNTERS};
use crate::HashSet;
use std::io;
use std::path::Path;

/// First PC of a function.
pub const PC_FLAG_FUNC_ENTRY: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcInfo {
    pub pc: u64,
    pub flags: u64,
}

impl PcInfo {
    pub fn is_func_entry(&self) -> bool {
        self.flags & PC_FLAG_FUNC_ENTRY != 0
    }
}

pub type PcTable = Vec<PcInfo>;

/// Reads a PC table stored as little-endian (pc, flags) u64 pairs.
/// A truncated trailing pair is ignored.
pub fn load_pc_table(path: &Path) -> io::Result<PcTable> {
    let data = std::fs::read(path)?;
    let mut table = Vec::with_capacity(data.len() / 16);
    for chunk in data.chunks_exact(16) {
        table.push(PcInfo {
            pc: u64::from_le_bytes(chunk[..8].try_into().unwrap()),
            flags: u64::from_le_bytes(chunk[8..].try_into().unwrap()),
        });
    }
    Ok(table)
}

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub func: String,
    pub file_line: String,
}

/// One symbol entry per PC-table index.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    /// Parses `function<TAB>file:line` lines; malformed lines become "?".
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut table = Self::default();
        for line in text.lines() {
            match line.split_once('\t') {
                Some((func, file_line)) => table.add_entry(func, file_line),
                None => table.add_entry("?", "?"),
            }
        }
        Ok(table)
    }

    pub fn add_entry(&mut self, func: &str, file_line: &str) {
        self.entries.push(SymbolEntry {
            func: func.to_string(),
            file_line: file_line.to_string(),
        });
    }

    /// Function name at `pc_index`, "?" when unknown.
    pub fn func(&self, pc_index: usize) -> &str {
        self.entries.get(pc_index).map_or("?", |e| e.func.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BinaryInfo {
    pub pc_table: PcTable,
    pub symbols: SymbolTable,
}

/// Set of functions considered not yet exhausted by the corpus.
#[derive(Debug)]
pub struct CoverageFrontier {
    // pc index -> entry pc index of its enclosing function
    func_entry_of_pc: Vec<usize>,
    frontier: HashSet<usize>,
    num_functions: usize,
}

impl CoverageFrontier {
    pub fn new(binary_info: &BinaryInfo) -> Self {
        let mut func_entry_of_pc = Vec::with_capacity(binary_info.pc_table.len());
        let mut current = 0;
        let mut num_functions = 0;
        for (i, pc) in binary_info.pc_table.iter().enumerate() {
            if pc.is_func_entry() {
                current = i;
                num_functions += 1;
            }
            func_entry_of_pc.push(current);
        }
        Self {
            func_entry_of_pc,
            frontier: HashSet::new(),
            num_functions,
        }
    }

    /// Repartitions functions by the corpus' current coverage; returns the
    /// new frontier size.
    pub fn compute(&mut self, corpus: &Corpus) -> usize {
        self.frontier.clear();
        let n = self.func_entry_of_pc.len();
        if n == 0 {
            return 0;
        }
        let mut covered: HashSet<usize> = HashSet::new();
        for r in corpus.records() {
            for &f in &r.features {
                if EIGHT_BIT_COUNTERS.contains(f) {
                    let pc_index = feature_to_pc_index(f);
                    if pc_index < n {
                        covered.insert(pc_index);
                    }
                }
            }
        }
        let mut i = 0;
        while i < n {
            let entry = self.func_entry_of_pc[i];
            let mut j = i;
            let mut covered_count = 0;
            while j < n && self.func_entry_of_pc[j] == entry {
                if covered.contains(&j) {
                    covered_count += 1;
                }
                j += 1;
            }
            if covered_count > 0 && covered_count < j - i {
                self.frontier.insert(entry);
            }
            i = j;
        }
        self.frontier.len()
    }

    pub fn num_functions(&self) -> usize {
        self.num_functions
    }

    pub fn num_functions_in_frontier(&self) -> usize {
        self.frontier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frontier.is_empty()
    }

    pub fn pc_index_is_in_frontier(&self, pc_index: usize) -> bool {
        self.func_entry_of_pc
            .get(pc_index)
            .map_or(false, |entry| self.frontier.contains(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::CorpusRecord;
    use crate::feature::{pc_and_counter_to_feature, FeatureSet};

    fn binary_info_with_functions(sizes: &[usize]) -> BinaryInfo {
        let mut info = BinaryInfo::default();
        let mut pc = 0x1000u64;
        for (func, &size) in sizes.iter().enumerate() {
            for i in 0..size {
                info.pc_table.push(PcInfo {
                    pc,
                    flags: if i == 0 { PC_FLAG_FUNC_ENTRY } else { 0 },
                });
                info.symbols.add_entry(&format!("func{}", func), "t.cc:1");
                pc += 4;
            }
        }
        info
    }

    fn corpus_covering(pcs: &[usize]) -> Corpus {
        let fs = FeatureSet::new(100);
        let frontier = CoverageFrontier::new(&BinaryInfo::default());
        let mut corpus = Corpus::new();
        let features = pcs
            .iter()
            .map(|&pc| pc_and_counter_to_feature(pc, 1))
            .collect();
        corpus.add(
            CorpusRecord {
                data: vec![0],
                features,
                cmp_args: Vec::new(),
            },
            &fs,
            &frontier,
        );
        corpus
    }

    #[test]
    fn partially_covered_functions_form_the_frontier() {
        // Three functions: pcs [0..3), [3..6), [6..9).
        let info = binary_info_with_functions(&[3, 3, 3]);
        let mut frontier = CoverageFrontier::new(&info);
        assert_eq!(frontier.num_functions(), 3);

        // func0 fully covered, func1 partially, func2 untouched.
        let corpus = corpus_covering(&[0, 1, 2, 3]);
        assert_eq!(frontier.compute(&corpus), 1);
        assert!(!frontier.pc_index_is_in_frontier(0));
        assert!(frontier.pc_index_is_in_frontier(3));
        assert!(frontier.pc_index_is_in_frontier(4));
        assert!(!frontier.pc_index_is_in_frontier(6));
    }

    #[test]
    fn empty_pc_table_yields_empty_frontier() {
        let mut frontier = CoverageFrontier::new(&BinaryInfo::default());
        let corpus = corpus_covering(&[1, 2, 3]);
        assert_eq!(frontier.compute(&corpus), 0);
        assert!(frontier.is_empty());
        assert!(!frontier.pc_index_is_in_frontier(0));
    }

    #[test]
    fn symbols_default_to_unknown() {
        let table = SymbolTable::default();
        assert_eq!(table.func(7), "?");
    }

    #[test]
    fn pc_table_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("shoal-frontier-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pc_table");
        let mut bytes = Vec::new();
        for (pc, flags) in [(0x1000u64, 1u64), (0x1004, 0), (0x2000, 1)] {
            bytes.extend_from_slice(&pc.to_le_bytes());
            bytes.extend_from_slice(&flags.to_le_bytes());
        }
        // Truncated trailing pair must be ignored.
        bytes.extend_from_slice(&[0u8; 5]);
        std::fs::write(&path, &bytes).unwrap();

        let table = load_pc_table(&path).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table[0].is_func_entry());
        assert!(!table[1].is_func_entry());
        assert_eq!(table[2].pc, 0x2000);
    }
}
