//! Process-wide fault trapping around harness execution.
//!
//! Generated harnesses run arbitrary corpus bytes, so any call may raise
//! `SIGSEGV`, `SIGILL`, `SIGFPE` or `SIGTRAP`. This module owns the whole
//! recovery mechanism: a static register checkpoint written on entry, a
//! signal handler that redirects the faulting context back to the
//! checkpoint, and the per-signal fault counters.
//!
//! The handler has a fixed C signature and cannot capture per-call data,
//! so the checkpoint and counters are process statics. Everything here
//! assumes a single [`crate::executor::Executor`] per process (enforced at
//! executor construction) and no competing handlers for the four signals.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use crate::harness::HarnessFn;

/// The signals trapped while a harness runs.
pub const TRAPPED_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGTRAP,
];

/// A fault delivered during harness execution. The driver treats any
/// fault as "skip this candidate".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Segv,
    Ill,
    Fpe,
    Trap,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Fault::Segv => "SIGSEGV",
            Fault::Ill => "SIGILL",
            Fault::Fpe => "SIGFPE",
            Fault::Trap => "SIGTRAP",
        };
        f.write_str(name)
    }
}

/// Monotonic per-signal fault counts for the whole process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultCounts {
    pub sigsegv: u64,
    pub sigill: u64,
    pub sigfpe: u64,
    pub sigtrap: u64,
}

static SIGSEGV_COUNT: AtomicU64 = AtomicU64::new(0);
static SIGILL_COUNT: AtomicU64 = AtomicU64::new(0);
static SIGFPE_COUNT: AtomicU64 = AtomicU64::new(0);
static SIGTRAP_COUNT: AtomicU64 = AtomicU64::new(0);

/// Signal number of the most recent fault, read on the recovery path.
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Register checkpoint written by [`guarded_call`] before entering a
/// harness:
/// `[rbx, rbp, r12, r13, r14, r15, rsp, resume-rip]`.
static mut CHECKPOINT: [u64; 8] = [0; 8];

/// Snapshot the fault counters.
pub fn fault_counts() -> FaultCounts {
    FaultCounts {
        sigsegv: SIGSEGV_COUNT.load(Ordering::Relaxed),
        sigill: SIGILL_COUNT.load(Ordering::Relaxed),
        sigfpe: SIGFPE_COUNT.load(Ordering::Relaxed),
        sigtrap: SIGTRAP_COUNT.load(Ordering::Relaxed),
    }
}

/// The handler can only bump a counter and redirect the delivered context
/// at the checkpoint; the kernel's sigreturn then resumes execution on
/// the recovery path of [`guarded_call`] with the pre-signal mask.
extern "C" fn fault_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let counter = match sig {
        libc::SIGSEGV => &SIGSEGV_COUNT,
        libc::SIGILL => &SIGILL_COUNT,
        libc::SIGFPE => &SIGFPE_COUNT,
        libc::SIGTRAP => &SIGTRAP_COUNT,
        _ => std::process::abort(),
    };
    counter.fetch_add(1, Ordering::Relaxed);
    LAST_SIGNAL.store(sig, Ordering::Relaxed);

    unsafe {
        let uctx = ctx as *mut libc::ucontext_t;
        let chk = std::ptr::addr_of!(CHECKPOINT);
        (*uctx).uc_mcontext.gregs[libc::REG_RSP as usize] = (*chk)[6] as libc::greg_t;
        (*uctx).uc_mcontext.gregs[libc::REG_RIP as usize] = (*chk)[7] as libc::greg_t;
    }
}

/// Install the fault handler for all four signals.
pub(crate) fn install_handlers() {
    let action = SigAction::new(
        SigHandler::SigAction(fault_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    for sig in TRAPPED_SIGNALS {
        unsafe { sigaction(sig, &action) }.expect("couldn't install fault handler");
    }
}

/// Restore the default disposition for all four signals.
pub(crate) fn uninstall_handlers() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in TRAPPED_SIGNALS {
        unsafe { sigaction(sig, &action) }.expect("couldn't restore signal disposition");
    }
}

/// The signal is masked while its handler runs; sigreturn restores the
/// pre-delivery mask, but mirror that explicitly on the recovery path so
/// a nested delivery can't leave the mask stale.
fn unblock_trapped_signals() {
    let mut set = SigSet::empty();
    for sig in TRAPPED_SIGNALS {
        set.add(sig);
    }
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
}

/// Call into a committed harness, recovering from any trapped fault.
///
/// The asm block checkpoints the callee-saved state and a resume address
/// into [`CHECKPOINT`]; on a fault the handler rewrites the delivered
/// context so execution lands on the `2:` recovery path, which reloads
/// every checkpointed register and reports the fault sentinel.
///
/// In debug builds the handler is installed and removed around every
/// call; release builds install it once at executor construction.
pub(crate) fn guarded_call(entry: HarnessFn) -> Result<u64, Fault> {
    #[cfg(debug_assertions)]
    install_handlers();

    let ret: i64;
    unsafe {
        core::arch::asm!(
            // Step off the red zone before pushing a return address.
            "sub rsp, 128",
            "lea r10, [rip + {chk}]",
            "mov [r10 + 0x00], rbx",
            "mov [r10 + 0x08], rbp",
            "mov [r10 + 0x10], r12",
            "mov [r10 + 0x18], r13",
            "mov [r10 + 0x20], r14",
            "mov [r10 + 0x28], r15",
            "mov [r10 + 0x30], rsp",
            "lea rax, [rip + 2f]",
            "mov [r10 + 0x38], rax",
            "call r11",
            "jmp 3f",
            // Fault recovery: RIP/RSP were restored by the handler; the
            // other checkpointed registers are reloaded here.
            "2:",
            "lea rax, [rip + {chk}]",
            "mov rbx, [rax + 0x00]",
            "mov rbp, [rax + 0x08]",
            "mov r12, [rax + 0x10]",
            "mov r13, [rax + 0x18]",
            "mov r14, [rax + 0x20]",
            "mov r15, [rax + 0x28]",
            "mov rsp, [rax + 0x30]",
            "mov rax, -1",
            "3:",
            "add rsp, 128",
            chk = sym CHECKPOINT,
            in("r11") entry,
            out("r10") _,
            out("rax") ret,
            clobber_abi("C"),
        );
    }

    let result = if ret < 0 {
        unblock_trapped_signals();
        let fault = match LAST_SIGNAL.load(Ordering::Relaxed) {
            libc::SIGSEGV => Fault::Segv,
            libc::SIGILL => Fault::Ill,
            libc::SIGFPE => Fault::Fpe,
            libc::SIGTRAP => Fault::Trap,
            other => unreachable!("fault recovery without a trapped signal ({other})"),
        };
        Err(fault)
    } else {
        Ok(ret as u64)
    };

    #[cfg(debug_assertions)]
    uninstall_handlers();

    result
}
