//! Small shared helpers.

/// Median of a sample set. Empty input yields 0 (a faulted or fully
/// outlier-filtered run contributes nothing).
pub fn median(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[(n - 1) / 2] + sorted[n / 2]) as f64 / 2.0
    } else {
        sorted[n / 2] as f64
    }
}

/// Pin the current process to one hardware thread. Cycle measurements
/// migrate badly across cores.
pub fn pin_to_core(core: usize) {
    let this_pid = nix::unistd::Pid::from_raw(0);
    let mut cpuset = nix::sched::CpuSet::new();
    cpuset.set(core).expect("invalid core index");
    match nix::sched::sched_setaffinity(this_pid, &cpuset) {
        Ok(_) => log::info!("pinned to core {}", core),
        Err(errno) => {
            panic!("couldn't pin to core {} ({})", core, errno.desc());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn median_of_empty_is_zero() {
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn median_odd() {
        assert_eq!(median(&[5, 1, 3]), 3.0);
    }

    #[test]
    fn median_even_averages_the_middle_pair() {
        assert_eq!(median(&[4, 1, 3, 2]), 2.5);
        assert_eq!(median(&[10, 20]), 15.0);
    }

    #[test]
    fn median_is_order_insensitive() {
        assert_eq!(median(&[9, 7, 8]), median(&[7, 8, 9]));
    }
}
