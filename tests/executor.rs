//! Live executor properties. Everything runs inside one test function:
//! the executor owns process-wide state (fixed data pages, signal
//! handlers), so scenarios must not run on parallel test threads.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use timesift::{Executor, ExecutorConfig, Fault};

const NOP: [u8; 1] = [0x90];
const UD2: [u8; 2] = [0x0f, 0x0b];
const INT3: [u8; 1] = [0xcc];
// mov rax, [0]
const LOAD_NULL: [u8; 8] = [0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00];
// xor eax, eax; div eax
const DIV_ZERO: [u8; 4] = [0x31, 0xc0, 0xf7, 0xf0];

// Generous bound for timing assertions; medians over 50 runs are stable
// but CI machines are noisy.
const NOISE_BOUND: i64 = 300;

#[test]
fn executor_end_to_end() {
    let mut exec = Executor::new(ExecutorConfig::default());

    // Noise floor: an all-NOP triple must measure close to zero.
    let delta = exec
        .test_trigger(&NOP, &NOP, &NOP, false, 50, 1)
        .expect("nop triple must not fault");
    assert!(delta.abs() < NOISE_BOUND, "noise floor delta was {}", delta);

    // Idempotence: repeating the identical test stays within the noise
    // bound of the first result.
    let again = exec.test_trigger(&NOP, &NOP, &NOP, false, 50, 1).unwrap();
    assert!((delta - again).abs() < NOISE_BOUND);

    // Each trapped signal is recovered, classified, and counted.
    let before = exec.fault_counts();
    assert_eq!(exec.test_trigger(&UD2, &NOP, &NOP, false, 10, 1), Err(Fault::Ill));
    assert_eq!(
        exec.test_trigger(&LOAD_NULL, &NOP, &NOP, false, 10, 1),
        Err(Fault::Segv)
    );
    assert_eq!(
        exec.test_trigger(&DIV_ZERO, &NOP, &NOP, false, 10, 1),
        Err(Fault::Fpe)
    );
    assert_eq!(
        exec.test_trigger(&INT3, &NOP, &NOP, false, 10, 1),
        Err(Fault::Trap)
    );
    let after = exec.fault_counts();
    assert_eq!(after.sigill, before.sigill + 1);
    assert_eq!(after.sigsegv, before.sigsegv + 1);
    assert_eq!(after.sigfpe, before.sigfpe + 1);
    assert_eq!(after.sigtrap, before.sigtrap + 1);

    // The executor keeps working after recovering from faults.
    let delta = exec.test_trigger(&NOP, &NOP, &NOP, false, 50, 1).unwrap();
    assert!(delta.abs() < NOISE_BOUND);

    // Memory-touching sequences may use the fixed data window: a load
    // through RDI hits the mapped page and must not fault.
    let load_rdi = [0x48, 0x8b, 0x07]; // mov rax, [rdi]
    assert!(exec.test_trigger(&load_rdi, &load_rdi, &NOP, false, 10, 1).is_ok());

    // The other test shapes accept the same inputs.
    let reset_delta = exec.test_reset(&NOP, &NOP, &NOP, 50, 1).unwrap();
    assert!(reset_delta.abs() < NOISE_BOUND);
    let triple_delta = exec.test_triple(&NOP, &NOP, &NOP, 50).unwrap();
    assert!(triple_delta.abs() < NOISE_BOUND);

    // Speculative shape: architectural behavior must be unaffected even
    // by trigger bytes that would fault architecturally.
    assert!(exec.test_trigger(&UD2, &NOP, &NOP, true, 10, 1).is_ok());

    // Process-wide resources allow only one live executor.
    let second = std::panic::catch_unwind(|| Executor::new(ExecutorConfig::default()));
    assert!(second.is_err());

    // Teardown releases the fixed pages; a fresh executor can start.
    drop(exec);
    let mut exec = Executor::new(ExecutorConfig::default());
    assert!(exec.test_trigger(&NOP, &NOP, &NOP, false, 10, 1).is_ok());
    exec.print_fault_counts();
}
