//! The search driver: walks the corpus product space, applies the
//! two-phase confirmation, and writes qualifying triples to CSV.
//!
//! `test_trigger` alone fires whenever *either* the trigger or the reset
//! changes the measurement; the follow-up `test_reset` check demands that
//! the reset by itself already produces the same fast path as
//! reset-after-trigger, isolating the trigger as the causal factor.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::seq::SliceRandom;

use crate::corpus::{Corpus, CorpusError, Instruction, CORPUS_HEADER};
use crate::executor::Executor;

/// Header of the pairs CSV every search mode emits.
pub const PAIRS_HEADER: &str = "timing;\
    measurement-uid;measurement-sequence;measurement-category;\
    measurement-extension;measurement-isa-set;\
    trigger-uid;trigger-sequence;trigger-category;trigger-extension;\
    trigger-isa-set;\
    reset-uid;reset-sequence;reset-category;reset-extension;\
    reset-isa-set";

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("mismatch in result file header (got {0:?})")]
    BadHeader(String),

    #[error("line {line}: expected 16 fields in result row, got {fields}")]
    BadRow { line: usize, fields: usize },
}

/// Driver tunables. Defaults match the classic run parameters; the
/// reset-verification bound is configuration, not a constant.
#[derive(Clone, Copy, Debug)]
pub struct SearchConfig {
    /// Test iterations per harness.
    pub iterations: usize,
    /// Reset repetitions in Mode A (trigger != measurement).
    pub reset_reps_no_assumption: usize,
    /// Reset repetitions in Mode B (trigger == measurement).
    pub reset_reps_eq_measure: usize,
    /// A reset "works" iff |test_reset delta| stays under this bound.
    pub reset_bound: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            reset_reps_no_assumption: 1,
            reset_reps_eq_measure: 50,
            reset_bound: 20,
        }
    }
}

/// Sleeps are only meaningful once per harness; everything else repeats
/// as configured.
pub fn reset_reps_for(reset: &Instruction, configured: usize) -> usize {
    if reset.is_sleep() {
        1
    } else {
        configured
    }
}

/// Owns the corpus and the executor for the duration of a fuzzing run.
pub struct Driver {
    corpus: Corpus,
    executor: Executor,
    config: SearchConfig,
}

impl Driver {
    pub fn new(corpus: Corpus, executor: Executor, config: SearchConfig) -> Self {
        Self { corpus, executor, config }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn print_fault_statistics(&self) {
        self.executor.print_fault_counts();
    }

    /// Two-phase confirmation for one (measurement, trigger, reset)
    /// candidate. Returns the trigger delta when both phases pass.
    fn confirm_candidate(
        &mut self,
        measurement: &Instruction,
        trigger: &Instruction,
        reset: &Instruction,
        speculative: bool,
        reset_reps: usize,
        in_threshold: impl Fn(i64) -> bool,
    ) -> Option<i64> {
        let delta = self
            .executor
            .test_trigger(
                &trigger.bytes,
                &measurement.bytes,
                &reset.bytes,
                speculative,
                self.config.iterations,
                reset_reps,
            )
            .ok()?;
        if !in_threshold(delta) {
            return None;
        }

        let verify = self
            .executor
            .test_reset(
                &trigger.bytes,
                &measurement.bytes,
                &reset.bytes,
                self.config.iterations,
                reset_reps,
            )
            .ok()?;
        if verify.abs() < self.config.reset_bound {
            Some(delta)
        } else {
            None
        }
    }

    /// Mode A: full (measurement, trigger, reset) product space. O(N^3);
    /// expected to run for days on corpora of a few thousand entries.
    pub fn search_all(
        &mut self,
        out_csv: &Path,
        speculative: bool,
        threshold: i64,
    ) -> Result<(), SearchError> {
        let mut out = BufWriter::new(File::create(out_csv)?);
        writeln!(out, "{}", PAIRS_HEADER)?;

        let n = self.corpus.len();
        for measurement_idx in 0..n {
            let measurement = self.corpus.by_index(measurement_idx)?.clone();
            log::info!("processing measurement {}/{}", measurement_idx, n.saturating_sub(1));

            for trigger_idx in 0..n {
                let trigger = self.corpus.by_index(trigger_idx)?.clone();
                if trigger.is_sleep() {
                    // sleeps are only valid reset sequences
                    continue;
                }
                for reset_idx in 0..n {
                    let reset = self.corpus.by_index(reset_idx)?.clone();
                    let reps = reset_reps_for(&reset, self.config.reset_reps_no_assumption);
                    if let Some(delta) = self.confirm_candidate(
                        &measurement,
                        &trigger,
                        &reset,
                        speculative,
                        reps,
                        |d| d < -threshold || d > threshold,
                    ) {
                        writeln!(
                            out,
                            "{};{};{};{}",
                            delta,
                            measurement.csv_fields(),
                            trigger.csv_fields(),
                            reset.csv_fields()
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Mode B: trigger doubles as the measurement. Next to the pairs CSV,
    /// every qualifying trigger gets a side file (named by the base64 of
    /// its bytes) with one `<b64 reset>;<delta>` line per working reset.
    pub fn search_trigger_eq_measure(
        &mut self,
        out_dir: &Path,
        out_csv: &Path,
        speculative: bool,
        negative_threshold: i64,
        positive_threshold: i64,
    ) -> Result<(), SearchError> {
        // wipe stale results from an earlier run
        if out_dir.exists() {
            std::fs::remove_dir_all(out_dir)?;
        }
        std::fs::create_dir_all(out_dir)?;

        let mut out = BufWriter::new(File::create(out_csv)?);
        writeln!(out, "{}", PAIRS_HEADER)?;

        let n = self.corpus.len();
        for trigger_idx in 0..n {
            let trigger = self.corpus.by_index(trigger_idx)?.clone();
            log::info!("processing trigger {} ({})", trigger_idx, trigger.assembly);
            if trigger.is_sleep() {
                continue;
            }

            let mut side_lines = Vec::new();
            for reset_idx in 0..n {
                let reset = self.corpus.by_index(reset_idx)?.clone();
                let reps = reset_reps_for(&reset, self.config.reset_reps_eq_measure);
                if let Some(delta) = self.confirm_candidate(
                    &trigger,
                    &trigger,
                    &reset,
                    speculative,
                    reps,
                    |d| d < negative_threshold || d > positive_threshold,
                ) {
                    side_lines.push(format!("{};{}", BASE64.encode(&reset.bytes), delta));
                    writeln!(
                        out,
                        "{};{};{};{}",
                        delta,
                        trigger.csv_fields(),
                        trigger.csv_fields(),
                        reset.csv_fields()
                    )?;
                }
            }

            if !side_lines.is_empty() {
                let side_path = out_dir.join(BASE64.encode(&trigger.bytes));
                let mut side = BufWriter::new(File::create(side_path)?);
                for line in side_lines {
                    writeln!(side, "{}", line)?;
                }
            }
        }
        Ok(())
    }

    /// Emit the corpus subset of instructions that survive
    /// `(self, self, self)` with a single iteration. Used to harden
    /// subsequent runs against fault storms.
    pub fn write_non_faulting(&mut self, out_path: &Path) -> Result<(), SearchError> {
        let mut survivors = Vec::new();
        for idx in 0..self.corpus.len() {
            let inst = self.corpus.by_index(idx)?.clone();
            log::info!("testing instruction {}", inst.assembly);
            if self
                .executor
                .test_trigger(&inst.bytes, &inst.bytes, &inst.bytes, false, 1, 1)
                .is_ok()
            {
                survivors.push(idx);
            }
        }
        log::info!("found {} non-faulting instructions", survivors.len());

        let mut out = BufWriter::new(File::create(out_path)?);
        writeln!(out, "{}", CORPUS_HEADER)?;
        for idx in survivors {
            writeln!(out, "{}", self.corpus.by_index(idx)?.corpus_line())?;
        }
        log::info!("wrote non-faulting instructions to {}", out_path.display());
        Ok(())
    }

    /// Re-test the triples of a previous run's pairs CSV in shuffled
    /// order with heavier settings (200 iterations, 100 reset reps,
    /// transient trigger), writing the re-measured rows plus a
    /// `*_cleaned.csv` restricted to |delta| > 50.
    pub fn confirm_results(&mut self, input: &Path, output: &Path) -> Result<(), SearchError> {
        let reader = BufReader::new(File::open(input)?);
        let mut lines = reader.lines();
        match lines.next().transpose()? {
            Some(h) if h == PAIRS_HEADER => {}
            other => return Err(SearchError::BadHeader(other.unwrap_or_default())),
        }

        let mut inputs = Vec::new();
        for (idx, line) in lines.enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() != 16 {
                return Err(SearchError::BadRow { line: idx + 2, fields: fields.len() });
            }
            let parse_uid = |s: &str| {
                u64::from_str_radix(s, 16)
                    .map_err(|_| SearchError::BadRow { line: idx + 2, fields: fields.len() })
            };
            let measurement_uid = parse_uid(fields[1])?;
            let trigger_uid = parse_uid(fields[6])?;
            let reset_uid = parse_uid(fields[11])?;
            inputs.push((measurement_uid, trigger_uid, reset_uid, line));
        }
        inputs.shuffle(&mut rand::thread_rng());

        let cleaned_path = {
            let stem = output
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "confirmed".to_string());
            output.with_file_name(format!("{}_cleaned.csv", stem))
        };
        let mut out = BufWriter::new(File::create(output)?);
        let mut cleaned = BufWriter::new(File::create(&cleaned_path)?);
        writeln!(out, "{}", PAIRS_HEADER)?;
        writeln!(cleaned, "{}", PAIRS_HEADER)?;

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for (measurement_uid, trigger_uid, reset_uid, line) in inputs {
            let measurement = self.corpus.by_uid(measurement_uid)?.clone();
            let trigger = self.corpus.by_uid(trigger_uid)?.clone();
            let reset = self.corpus.by_uid(reset_uid)?.clone();

            if trigger.is_sleep() || measurement.is_sleep() {
                continue;
            }
            let reps = reset_reps_for(&reset, 100);
            let delta = self
                .executor
                .test_trigger(&trigger.bytes, &measurement.bytes, &reset.bytes, true, 200, reps)
                .unwrap_or(-1);
            log::debug!("{}: {}", measurement.assembly, delta);

            let rest = line.split_once(';').map(|(_, r)| r).unwrap_or("");
            writeln!(out, "{};{}", delta, rest)?;
            if delta.abs() > 50 {
                succeeded += 1;
                writeln!(cleaned, "{};{}", delta, rest)?;
            } else {
                failed += 1;
            }
        }
        log::info!("succeeded: {} failed: {}", succeeded, failed);
        Ok(())
    }
}
