//! End-to-end driver runs over a miniature corpus. A single test
//! function owns the process-wide executor.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::io::Write;
use std::path::Path;

use timesift::corpus::CORPUS_HEADER;
use timesift::search::PAIRS_HEADER;
use timesift::{report, Corpus, Driver, Executor, ExecutorConfig, SearchConfig};

fn write_lines(path: &Path, lines: &[String]) {
    let mut f = std::fs::File::create(path).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
}

#[test]
fn driver_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let corpus_path = dir.path().join("instructions.b64");
    write_lines(
        &corpus_path,
        &[
            CORPUS_HEADER.to_string(),
            // nop
            "kA==;nop;NOP;BASE;I86".to_string(),
            // ud2 (always faults; the cleanup pass must drop it)
            "Dws=;ud2;INTERRUPT;BASE;I86".to_string(),
            // mov rax, [rdi] (touches the data window)
            "SIsH;mov rax, qword ptr [rdi];DATAXFER;BASE;I86".to_string(),
        ],
    );

    // Cleanup pass: only the non-faulting rows survive.
    let corpus = Corpus::load(&corpus_path).unwrap();
    let executor = Executor::new(ExecutorConfig::default());
    let mut driver = Driver::new(corpus, executor, SearchConfig::default());

    let cleaned_path = dir.path().join("instructions_cleaned.b64");
    driver.write_non_faulting(&cleaned_path).unwrap();
    let cleaned = std::fs::read_to_string(&cleaned_path).unwrap();
    let rows: Vec<&str> = cleaned.lines().collect();
    assert_eq!(rows[0], CORPUS_HEADER);
    assert!(rows.contains(&"kA==;nop;NOP;BASE;I86"));
    assert!(!cleaned.contains("ud2"));

    // Mode B over the corpus. An impossible threshold keeps the output
    // empty but drives the whole pipeline, side files included.
    let out_dir = dir.path().join("triggerpairs");
    let out_csv = dir.path().join("triggerpairs.csv");
    driver
        .search_trigger_eq_measure(&out_dir, &out_csv, false, -1_000_000, 1_000_000)
        .unwrap();
    let csv = std::fs::read_to_string(&out_csv).unwrap();
    assert_eq!(csv.lines().next().unwrap(), PAIRS_HEADER);

    let formatted_dir = dir.path().join("triggerpairs-formatted");
    report::format_trigger_pairs(&out_dir, &formatted_dir).unwrap();
    assert!(formatted_dir.is_dir());

    // Confirmation pass over a synthetic result row built from real
    // UIDs.
    let corpus = driver.corpus();
    let nop = corpus.by_index(0).unwrap().clone();
    let load = corpus.by_index(2).unwrap().clone();
    let pairs_path = dir.path().join("pairs.csv");
    write_lines(
        &pairs_path,
        &[
            PAIRS_HEADER.to_string(),
            format!("123;{};{};{}", load.csv_fields(), load.csv_fields(), nop.csv_fields()),
        ],
    );
    let confirmed_path = dir.path().join("confirmed.csv");
    driver.confirm_results(&pairs_path, &confirmed_path).unwrap();

    let confirmed = std::fs::read_to_string(&confirmed_path).unwrap();
    let lines: Vec<&str> = confirmed.lines().collect();
    assert_eq!(lines[0], PAIRS_HEADER);
    assert_eq!(lines.len(), 2);
    // the re-measured row keeps everything but the timing
    assert!(lines[1].ends_with(&format!(
        "{};{};{}",
        load.csv_fields(),
        load.csv_fields(),
        nop.csv_fields()
    )));
    assert!(dir.path().join("confirmed_cleaned.csv").is_file());

    driver.print_fault_statistics();
}
