use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use log::info;

use timesift::filter::{FilterKind, ResultFilter};
use timesift::{report, Corpus, Driver, Executor, ExecutorConfig, SearchConfig};

const OUTPUT_CSV_ALL: &str = "measure_trigger_pairs.csv";
const OUTPUT_CSV_TRIGGER_EQ_MEASURE: &str = "triggerpairs.csv";
const OUTPUT_DIR_TRIGGER_EQ_MEASURE: &str = "triggerpairs";
const OUTPUT_DIR_FORMATTED: &str = "triggerpairs-formatted";

/// Fuzzer for timing side channels in x86-64 instruction sequences.
///
/// Without any option the tool searches with trigger sequence ==
/// measurement sequence.
#[derive(Parser)]
#[command(version, about, verbatim_doc_comment)]
struct Args {
    /// Instruction corpus file.
    #[arg(long, default_value = "x86-instructions/instructions_cleaned.b64")]
    instructions: PathBuf,

    /// Create a new instruction file consisting of only non-faulting
    /// instructions.
    #[arg(long)]
    cleanup: bool,

    /// Search with trigger sequence != measurement sequence (takes a few
    /// days).
    #[arg(long)]
    all: bool,

    /// Execute trigger sequences only transiently.
    #[arg(long)]
    speculation: bool,

    /// Apply the staged filters to the given search output.
    #[arg(long, value_name = "FILE")]
    filter: Option<PathBuf>,

    /// Randomize the order of the triples in a result file and test
    /// them again.
    #[arg(long, num_args = 2, value_names = ["INPUT", "OUTPUT"])]
    confirm: Option<Vec<PathBuf>>,

    /// Absolute cycle difference required to report a candidate.
    #[arg(long, default_value_t = 50)]
    threshold: i64,

    /// Pin the process to this core before measuring.
    #[arg(long)]
    pin_core: Option<usize>,
}

fn build_driver(args: &Args) -> anyhow::Result<Driver> {
    let corpus = Corpus::load(&args.instructions)
        .with_context(|| format!("loading corpus {}", args.instructions.display()))?;
    let executor = Executor::new(ExecutorConfig::default());
    Ok(Driver::new(corpus, executor, SearchConfig::default()))
}

/// Staged filter pipeline over a search result: drop cache channels,
/// then dedup per property tuple, then dedup per extension pair.
fn run_filter_stages(input: &Path) -> anyhow::Result<()> {
    let base = match input.extension() {
        Some(_) => input.with_extension(""),
        None => input.to_path_buf(),
    };
    let base = base.to_string_lossy().into_owned();

    let stage1 = PathBuf::from(format!("{}_nocache.csv", base));
    info!("filtering content of {} to {}", input.display(), stage1.display());
    let mut filter = ResultFilter::new();
    filter.enable(FilterKind::DropAllCacheSequences);
    filter.apply_on_file(input, &stage1)?;

    let stage2 = PathBuf::from(format!("{}_nocache_filtered_by_all.csv", base));
    info!("filtering content of {} to {}", stage1.display(), stage2.display());
    filter.clear();
    filter.enable(FilterKind::UniquePropertyTuples);
    filter.apply_on_file(&stage1, &stage2)?;

    let stage3 = PathBuf::from(format!("{}_nocache_filtered_by_all_mt_extensionpair.csv", base));
    info!("filtering content of {} to {}", stage2.display(), stage3.display());
    filter.clear();
    filter.enable(FilterKind::UniqueExtensionPairs);
    filter.apply_on_file(&stage2, &stage3)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if cfg!(debug_assertions) {
        log::warn!("started in debug mode; fault handlers are reinstalled per call");
    }
    let args = Args::parse();

    if let Some(core) = args.pin_core {
        timesift::util::pin_to_core(core);
    }

    if let Some(paths) = &args.confirm {
        info!(" === starting confirmation stage ===");
        let mut driver = build_driver(&args)?;
        driver.confirm_results(&paths[0], &paths[1])?;
        driver.print_fault_statistics();
        return Ok(());
    }

    if let Some(input) = &args.filter {
        info!(" === starting filter stage ===");
        return run_filter_stages(input);
    }

    if args.cleanup {
        info!(" === starting cleanup stage ===");
        let cleaned = args
            .instructions
            .with_file_name("instructions_cleaned.b64");
        let mut driver = build_driver(&args)?;
        driver.write_non_faulting(&cleaned)?;
        driver.print_fault_statistics();
        return Ok(());
    }

    info!(" === starting main fuzzing stage ===");
    if args.speculation {
        info!("searching with transiently executed trigger sequence");
    } else {
        info!("searching with architecturally executed trigger sequence");
    }

    let mut driver = build_driver(&args)?;
    if args.all {
        info!("searching with trigger sequence != measurement sequence");
        info!("this search is expected to take a few days!");
        driver.search_all(Path::new(OUTPUT_CSV_ALL), args.speculation, args.threshold)?;
    } else {
        info!("searching with trigger sequence == measurement sequence");
        driver.search_trigger_eq_measure(
            Path::new(OUTPUT_DIR_TRIGGER_EQ_MEASURE),
            Path::new(OUTPUT_CSV_TRIGGER_EQ_MEASURE),
            args.speculation,
            -args.threshold,
            args.threshold,
        )?;
        report::format_trigger_pairs(
            Path::new(OUTPUT_DIR_TRIGGER_EQ_MEASURE),
            Path::new(OUTPUT_DIR_FORMATTED),
        )?;
    }
    driver.print_fault_statistics();
    Ok(())
}
