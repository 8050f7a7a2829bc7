//! The executor: owns the code and data pages, builds harnesses, runs
//! them under the fault trap, and turns raw cycle samples into median
//! deltas.
//!
//! All resources here are process-wide (fixed-address data pages, signal
//! handlers, the trap checkpoint), so at most one `Executor` may be alive
//! per process; construction enforces this.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};

use crate::asm::{CodePage, NOP, PAGE_SIZE};
use crate::harness::{
    emit_reset_testrun, emit_speculative_testrun, emit_testrun, DATA_BASE, DATA_PAGES,
};
use crate::trap::{self, Fault, FaultCounts};
use crate::util::median;

static EXECUTOR_LIVE: AtomicBool = AtomicBool::new(false);

/// Executor tunables. The defaults reproduce the classic behavior; both
/// bounds are configurable rather than baked in.
#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    /// Single runs above this many cycles are discarded as preemption
    /// outliers in `test_trigger`.
    pub outlier_threshold: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { outlier_threshold: 5000 }
    }
}

/// Builds and runs harness programs over two code pages and the fixed
/// data window.
///
/// Page `#0` always holds the *effect* harness and page `#1` the
/// *baseline*; both are rebuilt from scratch (NOP fill, trailing RET) for
/// every test, and the data pages are zeroed.
pub struct Executor {
    config: ExecutorConfig,
    pages: [CodePage; 2],
    data_base: *mut u8,
}

impl Executor {
    /// Map the process-wide resources and (in release builds) install the
    /// fault handlers.
    ///
    /// Panics if another `Executor` is alive, if the fixed data window is
    /// already occupied, or if any mapping fails; every downstream result
    /// depends on these resources, so there is no recovery path.
    pub fn new(config: ExecutorConfig) -> Self {
        assert!(
            !EXECUTOR_LIVE.swap(true, Ordering::SeqCst),
            "only one Executor may exist per process"
        );

        let len = DATA_PAGES * PAGE_SIZE;
        unsafe {
            // The window must not be occupied: probing an unmapped range
            // with msync fails with ENOMEM.
            match msync(DATA_BASE as *mut std::ffi::c_void, len, MsFlags::empty()) {
                Err(nix::errno::Errno::ENOMEM) => {}
                _ => panic!("data window {:#x} is already mapped", DATA_BASE),
            }
        }
        let data_base = unsafe {
            mmap(
                std::num::NonZeroUsize::new(DATA_BASE as usize),
                std::num::NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                -1,
                0,
            )
            .expect("couldn't map the fixed data window")
        } as *mut u8;
        assert_eq!(data_base as u64, DATA_BASE);

        #[cfg(not(debug_assertions))]
        trap::install_handlers();

        Self {
            config,
            pages: [CodePage::new(), CodePage::new()],
            data_base,
        }
    }

    /// Zero the data pages so every test starts from the same memory
    /// state.
    fn clear_data_pages(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.data_base, 0, DATA_PAGES * PAGE_SIZE);
        }
    }

    /// Run the harness on the given page once.
    fn run(&mut self, page_no: usize) -> Result<u64, Fault> {
        trap::guarded_call(self.pages[page_no].entry())
    }

    /// Measure the cycle effect of `trigger` on `measurement`.
    ///
    /// Page `#0` gets the trigger harness (speculative or architectural),
    /// page `#1` the same harness with a same-length NOP sled in the
    /// trigger slot. Each runs
    /// `iterations` times; single runs above the outlier threshold are
    /// dropped, and the result is `median(baseline) - median(trigger)`.
    /// Positive deltas mean the trigger sped the measurement up.
    pub fn test_trigger(
        &mut self,
        trigger: &[u8],
        measurement: &[u8],
        reset: &[u8],
        speculative: bool,
        iterations: usize,
        reset_reps: usize,
    ) -> Result<i64, Fault> {
        self.clear_data_pages();
        let nop_sled = vec![NOP; trigger.len()];
        if speculative {
            emit_speculative_testrun(&mut self.pages[0], trigger, measurement, reset, reset_reps);
            emit_speculative_testrun(&mut self.pages[1], &nop_sled, measurement, reset, reset_reps);
        } else {
            emit_testrun(&mut self.pages[0], reset, trigger, measurement, reset_reps);
            emit_testrun(&mut self.pages[1], reset, &nop_sled, measurement, reset_reps);
        }
        self.pages[0].trace_disas();

        let mut with_trigger = Vec::with_capacity(iterations);
        let mut without_trigger = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let cycles = self.run(0)?;
            if cycles <= self.config.outlier_threshold {
                with_trigger.push(cycles as i64);
            }
        }
        for _ in 0..iterations {
            let cycles = self.run(1)?;
            if cycles <= self.config.outlier_threshold {
                without_trigger.push(cycles as i64);
            }
        }
        Ok((median(&without_trigger) - median(&with_trigger)) as i64)
    }

    /// Verify that `reset` alone reproduces the fast path that
    /// reset-after-trigger produces.
    ///
    /// Clean harness: NOP sled (reset-sized), n×reset, timed measurement.
    /// Noisy harness: trigger, n×reset, timed measurement. A working
    /// reset keeps `median(clean) - median(noisy)` near zero.
    pub fn test_reset(
        &mut self,
        trigger: &[u8],
        measurement: &[u8],
        reset: &[u8],
        iterations: usize,
        reset_reps: usize,
    ) -> Result<i64, Fault> {
        self.clear_data_pages();
        let nop_sled = vec![NOP; reset.len()];
        emit_reset_testrun(&mut self.pages[0], &nop_sled, measurement, reset, reset_reps);
        emit_reset_testrun(&mut self.pages[1], trigger, measurement, reset, reset_reps);

        let mut clean = Vec::with_capacity(iterations);
        let mut noisy = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            clean.push(self.run(0)? as i64);
        }
        for _ in 0..iterations {
            noisy.push(self.run(1)? as i64);
        }
        Ok((median(&clean) - median(&noisy)) as i64)
    }

    /// Ordering probe: per-run median of
    /// `t(trigger;reset;measure) - t(reset;trigger;measure)`.
    pub fn test_triple(
        &mut self,
        trigger: &[u8],
        measurement: &[u8],
        reset: &[u8],
        iterations: usize,
    ) -> Result<i64, Fault> {
        self.clear_data_pages();
        emit_testrun(&mut self.pages[0], trigger, reset, measurement, 1);
        emit_testrun(&mut self.pages[1], reset, trigger, measurement, 1);

        let mut diffs = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let trigger_first = self.run(0)? as i64;
            let reset_first = self.run(1)? as i64;
            diffs.push(trigger_first - reset_first);
        }
        Ok(median(&diffs) as i64)
    }

    /// Snapshot of the process-wide fault counters.
    pub fn fault_counts(&self) -> FaultCounts {
        trap::fault_counts()
    }

    /// Dump the fault counters, matching the classic report block.
    pub fn print_fault_counts(&self) {
        let counts = self.fault_counts();
        println!("=== Fault counters of Executor ===");
        println!("\tSIGSEGV: {}", counts.sigsegv);
        println!("\tSIGFPE: {}", counts.sigfpe);
        println!("\tSIGILL: {}", counts.sigill);
        println!("\tSIGTRAP: {}", counts.sigtrap);
        println!("==================================");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                self.data_base as *mut std::ffi::c_void,
                DATA_PAGES * PAGE_SIZE,
            );
        }
        #[cfg(not(debug_assertions))]
        trap::uninstall_handlers();
        EXECUTOR_LIVE.store(false, Ordering::SeqCst);
    }
}
