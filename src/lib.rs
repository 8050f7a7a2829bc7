//! timesift: a timing side-channel fuzzer for x86-64 instruction
//! sequences.
//!
//! The tool searches for triples of short instruction sequences (a
//! *trigger*, a *reset*, and a *measurement*) where executing the
//! trigger, architecturally or only transiently, leaves a
//! microarchitectural footprint that the measurement can time-detect and
//! the reset restores. Harnesses are assembled at runtime onto
//! executable pages, timed with `RDTSC`/`RDTSCP` behind serializing
//! barriers, and run under process-wide fault trapping so arbitrary
//! corpus bytes can't take the process down.

pub mod asm;
pub mod corpus;
pub mod executor;
pub mod filter;
pub mod harness;
pub mod report;
pub mod search;
pub mod trap;
pub mod util;

pub use crate::asm::{CodePage, PAGE_SIZE};
pub use crate::corpus::{Corpus, CorpusError, Instruction};
pub use crate::executor::{Executor, ExecutorConfig};
pub use crate::harness::{HarnessFn, DATA_BASE};
pub use crate::search::{Driver, SearchConfig, SearchError};
pub use crate::trap::{Fault, FaultCounts};
