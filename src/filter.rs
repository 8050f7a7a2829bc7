//! Post-hoc filters over the pairs CSV.
//!
//! Fuzzing runs produce many rows that describe the same underlying
//! channel. These filters thin a result file down: raising the timing
//! threshold, dropping the well-known cache channels, and keeping only
//! the strongest row per property tuple. Stateful filters make two
//! passes over the file: a prefilter pass that finds the best row per
//! key, then the filter pass that keeps only those winners.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::search::PAIRS_HEADER;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("mismatch in csv header line (got {0:?})")]
    BadHeader(String),

    #[error("line {line}: expected 16 fields in result row, got {fields}")]
    BadRow { line: usize, fields: usize },
}

/// One parsed row of the pairs CSV. UID fields are not needed by any
/// filter and are skipped.
#[derive(Clone, Debug)]
pub struct ResultRow {
    pub timing: i64,
    pub measurement_sequence: String,
    pub measurement_category: String,
    pub measurement_extension: String,
    pub measurement_isa_set: String,
    pub trigger_sequence: String,
    pub trigger_category: String,
    pub trigger_extension: String,
    pub trigger_isa_set: String,
    pub reset_sequence: String,
    pub reset_category: String,
    pub reset_extension: String,
    pub reset_isa_set: String,
}

impl ResultRow {
    pub fn parse(line: &str, line_no: usize) -> Result<Self, FilterError> {
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != 16 {
            return Err(FilterError::BadRow { line: line_no, fields: fields.len() });
        }
        let timing = fields[0]
            .parse()
            .map_err(|_| FilterError::BadRow { line: line_no, fields: fields.len() })?;
        Ok(Self {
            timing,
            measurement_sequence: fields[2].to_string(),
            measurement_category: fields[3].to_string(),
            measurement_extension: fields[4].to_string(),
            measurement_isa_set: fields[5].to_string(),
            trigger_sequence: fields[7].to_string(),
            trigger_category: fields[8].to_string(),
            trigger_extension: fields[9].to_string(),
            trigger_isa_set: fields[10].to_string(),
            reset_sequence: fields[12].to_string(),
            reset_category: fields[13].to_string(),
            reset_extension: fields[14].to_string(),
            reset_isa_set: fields[15].to_string(),
        })
    }

    fn property_tuple(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}{}{}",
            self.measurement_category,
            self.measurement_extension,
            self.measurement_isa_set,
            self.trigger_category,
            self.trigger_extension,
            self.trigger_isa_set,
            self.reset_category,
            self.reset_extension,
            self.reset_isa_set
        )
    }

    fn extension_pair(&self) -> String {
        format!("{}{}", self.measurement_extension, self.trigger_extension)
    }
}

/// A cache-channel sequence: CLFLUSH, non-temporal moves, or masked
/// moves.
fn is_cache_sequence(assembly: &str) -> bool {
    assembly.contains("CLFLUSH")
        || (assembly.contains("MOV") && assembly.contains("NT"))
        || assembly.contains("MASKMOV")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    /// Drop rows with |timing| below 300 cycles.
    RaiseThresholdTo300,
    /// Drop rows whose reset is a cache-maintenance sequence.
    DropCacheResets,
    /// Drop rows where any of the three sequences touches the cache.
    DropAllCacheSequences,
    /// Keep only the strongest row per
    /// (category, extension, isa-set)^3 tuple.
    UniquePropertyTuples,
    /// Keep only the strongest row per
    /// (measurement-extension, trigger-extension) pair.
    UniqueExtensionPairs,
}

/// Best-|timing| row bookkeeping shared between the prefilter and filter
/// passes: key -> (line number, timing).
type BestSeen = HashMap<String, (usize, i64)>;

#[derive(Default)]
pub struct ResultFilter {
    active: Vec<FilterKind>,
    best_property_tuples: BestSeen,
    best_extension_pairs: BestSeen,
}

impl ResultFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, kind: FilterKind) {
        if !self.active.contains(&kind) {
            self.active.push(kind);
        }
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.best_property_tuples.clear();
        self.best_extension_pairs.clear();
    }

    fn record_best(seen: &mut BestSeen, key: String, line_no: usize, timing: i64) {
        match seen.get(&key) {
            Some((_, best)) if timing.abs() <= best.abs() => {}
            _ => {
                seen.insert(key, (line_no, timing));
            }
        }
    }

    fn prefilter(&mut self, line_no: usize, row: &ResultRow) {
        for kind in &self.active {
            match kind {
                FilterKind::UniquePropertyTuples => Self::record_best(
                    &mut self.best_property_tuples,
                    row.property_tuple(),
                    line_no,
                    row.timing,
                ),
                FilterKind::UniqueExtensionPairs => Self::record_best(
                    &mut self.best_extension_pairs,
                    row.extension_pair(),
                    line_no,
                    row.timing,
                ),
                _ => {}
            }
        }
    }

    /// True iff the row should be dropped.
    fn filter_out(&self, line_no: usize, row: &ResultRow) -> bool {
        self.active.iter().any(|kind| match kind {
            FilterKind::RaiseThresholdTo300 => -300 < row.timing && row.timing < 300,
            FilterKind::DropCacheResets => is_cache_sequence(&row.reset_sequence),
            FilterKind::DropAllCacheSequences => {
                is_cache_sequence(&row.measurement_sequence)
                    || is_cache_sequence(&row.trigger_sequence)
                    || is_cache_sequence(&row.reset_sequence)
            }
            FilterKind::UniquePropertyTuples => {
                self.best_property_tuples.get(&row.property_tuple())
                    != Some(&(line_no, row.timing))
            }
            FilterKind::UniqueExtensionPairs => {
                self.best_extension_pairs.get(&row.extension_pair())
                    != Some(&(line_no, row.timing))
            }
        })
    }

    /// Run the active filters over one result file.
    pub fn apply_on_file(&mut self, input: &Path, output: &Path) -> Result<(), FilterError> {
        let read_rows = |path: &Path| -> Result<Vec<String>, FilterError> {
            let reader = BufReader::new(File::open(path)?);
            let mut lines = reader.lines();
            match lines.next().transpose()? {
                Some(h) if h == PAIRS_HEADER => {}
                other => return Err(FilterError::BadHeader(other.unwrap_or_default())),
            }
            lines.map(|l| Ok(l?)).collect()
        };

        let rows = read_rows(input)?;
        for (line_no, line) in rows.iter().enumerate() {
            let row = ResultRow::parse(line, line_no + 2)?;
            self.prefilter(line_no, &row);
        }

        let mut out = BufWriter::new(File::create(output)?);
        writeln!(out, "{}", PAIRS_HEADER)?;
        for (line_no, line) in rows.iter().enumerate() {
            let row = ResultRow::parse(line, line_no + 2)?;
            if !self.filter_out(line_no, &row) {
                writeln!(out, "{}", line)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(
        timing: i64,
        measurement: (&str, &str),
        trigger: (&str, &str),
        reset: (&str, &str),
    ) -> ResultRow {
        // (sequence, extension) pairs; categories/isa-sets held constant
        ResultRow {
            timing,
            measurement_sequence: measurement.0.to_string(),
            measurement_category: "CAT".into(),
            measurement_extension: measurement.1.to_string(),
            measurement_isa_set: "ISA".into(),
            trigger_sequence: trigger.0.to_string(),
            trigger_category: "CAT".into(),
            trigger_extension: trigger.1.to_string(),
            trigger_isa_set: "ISA".into(),
            reset_sequence: reset.0.to_string(),
            reset_category: "CAT".into(),
            reset_extension: reset.1.to_string(),
            reset_isa_set: "ISA".into(),
        }
    }

    #[test]
    fn parse_counts_fields() {
        let line = "120;abcd0000;nop;NOP;BASE;I86;abcd0001;inc eax;ALU;BASE;I86;\
                    abcd0002;clflush [rdi];MISC;CLFSH;CLFSH";
        let parsed = ResultRow::parse(line, 2).unwrap();
        assert_eq!(parsed.timing, 120);
        assert_eq!(parsed.reset_sequence, "clflush [rdi]");
        assert!(ResultRow::parse("only;four;fields;here", 2).is_err());
    }

    #[test]
    fn threshold_filter_drops_small_timings() {
        let mut filter = ResultFilter::new();
        filter.enable(FilterKind::RaiseThresholdTo300);
        let weak = row(299, ("a", "X"), ("b", "Y"), ("c", "Z"));
        let strong = row(-301, ("a", "X"), ("b", "Y"), ("c", "Z"));
        assert!(filter.filter_out(0, &weak));
        assert!(!filter.filter_out(1, &strong));
    }

    #[test]
    fn cache_sequences_are_recognized() {
        assert!(is_cache_sequence("CLFLUSH qword ptr [RDI]"));
        assert!(is_cache_sequence("MOVNTDQ xmmword ptr [RDI], XMM0"));
        assert!(is_cache_sequence("MASKMOVDQU XMM0, XMM1"));
        assert!(!is_cache_sequence("MOV RAX, qword ptr [RDI]"));
        assert!(!is_cache_sequence("ADD RAX, RBX"));
    }

    #[test]
    fn cache_reset_filter_only_looks_at_the_reset() {
        let mut filter = ResultFilter::new();
        filter.enable(FilterKind::DropCacheResets);
        let flushing_reset = row(500, ("a", "X"), ("b", "Y"), ("CLFLUSH [RDI]", "Z"));
        let flushing_trigger = row(500, ("a", "X"), ("CLFLUSH [RDI]", "Y"), ("c", "Z"));
        assert!(filter.filter_out(0, &flushing_reset));
        assert!(!filter.filter_out(1, &flushing_trigger));
    }

    #[test]
    fn apply_on_file_round_trips_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        let row_weak = "10;u;a;c;e;i;u;a;c;e;i;u;a;c;e;i";
        let row_strong = "400;u;a;c;e;i;u;a;c;e;i;u;a;c;e;i";
        std::fs::write(
            &input,
            format!("{}\n{}\n{}\n", PAIRS_HEADER, row_weak, row_strong),
        )
        .unwrap();

        let mut filter = ResultFilter::new();
        filter.enable(FilterKind::RaiseThresholdTo300);
        filter.apply_on_file(&input, &output).unwrap();

        let out = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec![PAIRS_HEADER, row_strong]);
    }

    #[test]
    fn unique_property_tuples_keeps_only_the_strongest() {
        let mut filter = ResultFilter::new();
        filter.enable(FilterKind::UniquePropertyTuples);
        let rows = [
            row(100, ("a", "X"), ("b", "Y"), ("c", "Z")),
            row(-400, ("a", "X"), ("b", "Y"), ("c", "Z")),
            row(250, ("a", "X"), ("b", "Y"), ("c", "Z")),
        ];
        for (i, r) in rows.iter().enumerate() {
            filter.prefilter(i, r);
        }
        assert!(filter.filter_out(0, &rows[0]));
        assert!(!filter.filter_out(1, &rows[1]));
        assert!(filter.filter_out(2, &rows[2]));
    }

    #[test]
    fn unique_extension_pairs_are_keyed_on_measurement_and_trigger() {
        let mut filter = ResultFilter::new();
        filter.enable(FilterKind::UniqueExtensionPairs);
        let a = row(100, ("a", "SSE"), ("b", "AVX"), ("c", "Z"));
        let b = row(500, ("a", "SSE"), ("b", "AVX"), ("d", "W"));
        let other = row(50, ("a", "SSE"), ("b", "MMX"), ("c", "Z"));
        filter.prefilter(0, &a);
        filter.prefilter(1, &b);
        filter.prefilter(2, &other);
        assert!(filter.filter_out(0, &a));
        assert!(!filter.filter_out(1, &b));
        // different pair, its own winner
        assert!(!filter.filter_out(2, &other));
    }
}
