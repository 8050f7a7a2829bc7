//! Harness program emission.
//!
//! A harness is a small generated function wrapping caller-supplied
//! instruction sequences between a fixed prologue/epilogue and a
//! serialized RDTSC/RDTSCP timing block. Three architectural shapes plus
//! one speculative shape cover every test the executor runs:
//!
//! * `emit_testrun`: n×first, second, timed measurement
//! * `emit_reset_testrun`: lead-in, n×reset, timed measurement
//! * `emit_speculative_testrun`: n×reset, transient trigger (return-stack
//!   misprediction), timed measurement
//!
//! All shapes return the elapsed cycle count of the measurement sequence
//! in RAX.

use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};

use crate::asm::CodePage;

/// Signature of a generated harness: no arguments, elapsed cycles out.
pub type HarnessFn = extern "C" fn() -> u64;

/// Base address of the fixed data window. The prologue points R8, RAX,
/// RDI, RSI, RDX and XMM0 here so memory-touching test instructions have
/// something legal to reference.
pub const DATA_BASE: u64 = 0x1337_0000;

/// Number of R+W pages mapped at [`DATA_BASE`].
pub const DATA_PAGES: usize = 2;

/// Upper bound on in-harness sequence repetitions; the prologue only
/// carves one page of guard stack below RSP.
pub const MAX_SEQUENCE_REPS: usize = 100;

// Templates kept as raw encodings (x87/MXCSR stack ops and the XMM move
// don't gain anything from mnemonic form). Lengths are load-bearing for
// the stack bookkeeping around them.
const TPL_STMXCSR_RSP: [u8; 4] = [0x0f, 0xae, 0x1c, 0x24];
const TPL_LDMXCSR_RSP: [u8; 4] = [0x0f, 0xae, 0x14, 0x24];
const TPL_FSTCW_RSP: [u8; 4] = [0x9b, 0xd9, 0x3c, 0x24];
const TPL_FLDCW_RSP: [u8; 3] = [0xd9, 0x2c, 0x24];
const TPL_MOVQ_XMM0_R8: [u8; 5] = [0x66, 0x49, 0x0f, 0x6e, 0xc0];

/// Save everything a hostile test sequence could corrupt, then point the
/// memory registers at the data window.
///
/// Mirrored exactly by [`emit_epilogue`]: callee-saved registers per the
/// System V AMD64 ABI, MXCSR and the x87 control word (a test instruction
/// that corrupts either would poison every later test), RSP stashed in
/// RBP, and a page of slack under RSP for stray PUSH/POP.
fn emit_prologue(page: &mut CodePage) {
    dynasm!(page
        ; .arch x64
        ; push rbx
        ; push rsp
        ; push rbp
        ; push r12
        ; push r13
        ; push r14
        ; push r15
        ; sub rsp, 8
        ; .bytes TPL_STMXCSR_RSP
        ; sub rsp, 8
        ; .bytes TPL_FSTCW_RSP
        ; mov rbp, rsp
        ; sub rsp, 4096
        ; mov r8, DATA_BASE as i32
        ; mov rax, DATA_BASE as i32
        ; mov rdi, DATA_BASE as i32
        ; mov rsi, DATA_BASE as i32
        ; mov rdx, DATA_BASE as i32
        ; .bytes TPL_MOVQ_XMM0_R8
    );
}

/// Undo [`emit_prologue`] and return. DF is cleared first; the ABI
/// requires it zero on return and string instructions in a test sequence
/// may have set it.
fn emit_epilogue(page: &mut CodePage) {
    dynasm!(page
        ; .arch x64
        ; cld
        ; mov rsp, rbp
        ; .bytes TPL_FLDCW_RSP
        ; add rsp, 8
        ; .bytes TPL_LDMXCSR_RSP
        ; add rsp, 8
        ; pop r15
        ; pop r14
        ; pop r13
        ; pop r12
        ; pop rbp
        ; pop rsp
        ; pop rbx
        ; ret
    );
}

/// Flush the pipeline between blocks.
fn emit_serialize(page: &mut CodePage) {
    dynasm!(page
        ; .arch x64
        ; xor eax, eax
        ; cpuid
    );
}

/// Start the clock. Clobbers RAX, RBX, RCX, RDX, R10; the low 32 bits of
/// the timestamp land in R10.
fn emit_timer_start(page: &mut CodePage) {
    dynasm!(page
        ; .arch x64
        ; mfence
        ; xor eax, eax
        ; cpuid
        ; rdtsc
        ; mov r10, rax
    );
}

/// Stop the clock; the elapsed count ends up in R11 (caller-saved, safe
/// across the trailing CPUID).
fn emit_timer_end(page: &mut CodePage) {
    dynasm!(page
        ; .arch x64
        ; rdtscp
        ; sub rax, r10
        ; mov r11, rax
        ; cpuid
    );
}

/// Make the elapsed count the harness return value.
fn emit_timer_result(page: &mut CodePage) {
    dynasm!(page
        ; .arch x64
        ; mov rax, r11
    );
}

fn emit_sequence(page: &mut CodePage, bytes: &[u8]) {
    dynasm!(page
        ; .arch x64
        ; .bytes bytes
    );
}

fn emit_repeated(page: &mut CodePage, bytes: &[u8], reps: usize) {
    assert!(
        reps <= MAX_SEQUENCE_REPS,
        "sequence repetition count {} exceeds guard stack headroom",
        reps
    );
    for _ in 0..reps {
        emit_sequence(page, bytes);
    }
}

/// Architectural shape: `n`×`first`, serialize, `second`, serialize,
/// timed `measurement`. Both the trigger-effect harness and the ordering
/// probe are instances of this.
pub fn emit_testrun(
    page: &mut CodePage,
    first: &[u8],
    second: &[u8],
    measurement: &[u8],
    first_reps: usize,
) {
    page.reset();
    emit_prologue(page);
    emit_serialize(page);
    emit_repeated(page, first, first_reps);
    emit_serialize(page);
    emit_sequence(page, second);
    emit_serialize(page);
    emit_timer_start(page);
    emit_sequence(page, measurement);
    emit_timer_end(page);
    emit_timer_result(page);
    emit_epilogue(page);
    page.commit();
}

/// Reset-verification shape: `lead`, serialize, `n`×`reset`, serialize,
/// timed `measurement`. `lead` is the trigger for the noisy harness and a
/// same-length NOP sled for the clean one.
pub fn emit_reset_testrun(
    page: &mut CodePage,
    lead: &[u8],
    measurement: &[u8],
    reset: &[u8],
    reset_reps: usize,
) {
    page.reset();
    emit_prologue(page);
    emit_sequence(page, lead);
    emit_serialize(page);
    emit_repeated(page, reset, reset_reps);
    emit_serialize(page);
    emit_timer_start(page);
    emit_sequence(page, measurement);
    emit_timer_end(page);
    emit_timer_result(page);
    emit_epilogue(page);
    page.commit();
}

/// Return-stack misprediction gadget: the trigger bytes are reachable
/// only under speculation.
///
/// ```text
/// call  architectural     ; pushed return address points at the trigger
/// trigger bytes           ; transient path
/// jmp   join              ; keeps speculation on the rails
/// architectural:
/// lea   rax, [join]       ; real continuation
/// mov   [rsp], rax        ; overwrite the pushed return address
/// ret                     ; architectural -> join, predicted -> trigger
/// join:
/// ```
///
/// The displacement arithmetic the layout depends on is carried by the
/// assembler's label resolution instead of hand-encoded offsets.
fn emit_rsb_gadget(page: &mut CodePage, trigger: &[u8]) {
    dynasm!(page
        ; .arch x64
        ; call >architectural
        ; .bytes trigger
        ; jmp >join
        ; architectural:
        ; lea rax, [>join]
        ; mov [rsp], rax
        ; ret
        ; join:
    );
}

/// Speculative shape: `n`×`reset`, serialize, transient trigger, timed
/// `measurement`. Exposes triggers whose footprint survives squashing.
pub fn emit_speculative_testrun(
    page: &mut CodePage,
    trigger: &[u8],
    measurement: &[u8],
    reset: &[u8],
    reset_reps: usize,
) {
    page.reset();
    emit_prologue(page);
    emit_serialize(page);
    emit_repeated(page, reset, reset_reps);
    emit_serialize(page);
    emit_rsb_gadget(page, trigger);
    emit_timer_start(page);
    emit_sequence(page, measurement);
    emit_timer_end(page);
    emit_timer_result(page);
    emit_epilogue(page);
    page.commit();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::{NOP, PAGE_SIZE, RET};

    const NOP1: [u8; 1] = [0x90];

    #[test]
    fn testrun_shape_builds_and_keeps_page_invariants() {
        let mut page = CodePage::new();
        emit_testrun(&mut page, &NOP1, &NOP1, &NOP1, 1);
        assert!(page.cursor() > 0);
        assert!(page.cursor() < PAGE_SIZE);
        assert_eq!(page.page_bytes()[PAGE_SIZE - 1], RET);
        // Unwritten tail is still the NOP fill.
        assert!(page.page_bytes()[page.cursor()..PAGE_SIZE - 1]
            .iter()
            .all(|b| *b == NOP));
    }

    #[test]
    fn reset_testrun_repeats_the_reset_sequence() {
        // A recognizable reset pattern repeated 10 times must appear
        // 10 times in the emitted code.
        let reset = [0x0f, 0xae, 0x3f]; // clflush [rdi]
        let mut page = CodePage::new();
        emit_reset_testrun(&mut page, &NOP1, &NOP1, &reset, 10);
        let body = &page.page_bytes()[..page.cursor()];
        let hits = body.windows(reset.len()).filter(|w| *w == reset).count();
        assert_eq!(hits, 10);
    }

    #[test]
    #[should_panic(expected = "guard stack headroom")]
    fn excessive_reset_reps_panic() {
        let mut page = CodePage::new();
        emit_reset_testrun(&mut page, &NOP1, &NOP1, &NOP1, MAX_SEQUENCE_REPS + 1);
    }

    #[test]
    #[should_panic(expected = "exceeds page boundary")]
    fn oversized_trigger_panics_before_execution() {
        let big = vec![0x90u8; 4000];
        let mut page = CodePage::new();
        emit_testrun(&mut page, &NOP1, &big, &NOP1, 1);
    }

    #[test]
    fn rsb_gadget_layout_matches_encoded_lengths() {
        let trigger = [0x90u8, 0x90, 0x90];
        let mut page = CodePage::new();
        let start = page.cursor();
        emit_rsb_gadget(&mut page, &trigger);
        dynasm!(page ; .arch x64 ; ret);
        page.commit();

        let code = &page.page_bytes()[start..page.cursor()];

        // call rel32: architectural target skips the trigger and the jmp
        assert_eq!(code[0], 0xe8);
        let call_disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(call_disp as usize, trigger.len() + 5);

        // transient region: trigger bytes, then jmp rel32 to the join point
        assert_eq!(&code[5..5 + trigger.len()], &trigger);
        let jmp_at = 5 + trigger.len();
        assert_eq!(code[jmp_at], 0xe9);
        let jmp_disp = i32::from_le_bytes(code[jmp_at + 1..jmp_at + 5].try_into().unwrap());
        // lea (7) + mov [rsp],rax (4) + ret (1)
        assert_eq!(jmp_disp, 12);

        // architectural continuation: lea rax, [rip+d3]; mov [rsp], rax; ret
        let arch_at = jmp_at + 5;
        assert_eq!(&code[arch_at..arch_at + 3], &[0x48, 0x8d, 0x05]);
        let lea_disp = i32::from_le_bytes(code[arch_at + 3..arch_at + 7].try_into().unwrap());
        assert_eq!(lea_disp, 5);
        assert_eq!(&code[arch_at + 7..arch_at + 11], &[0x48, 0x89, 0x04, 0x24]);
        assert_eq!(code[arch_at + 11], 0xc3);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn architectural_harness_runs_and_times() {
        let mut page = CodePage::new();
        emit_testrun(&mut page, &NOP1, &NOP1, &NOP1, 1);
        // No data pages are mapped here; a NOP body touches no memory.
        let cycles = page.entry()();
        assert!(cycles > 0);
        assert!(cycles < 1_000_000);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn speculative_harness_returns_architecturally() {
        // Trigger bytes that would fault if executed architecturally
        // (ud2); the gadget must still return normally.
        let ud2 = [0x0f, 0x0b];
        let mut page = CodePage::new();
        emit_speculative_testrun(&mut page, &ud2, &NOP1, &NOP1, 1);
        let cycles = page.entry()();
        assert!(cycles < 1_000_000);
    }
}
