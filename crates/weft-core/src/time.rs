//! Monotonic clock sampling
//!
//! All runtime deadlines are expressed in milliseconds since an arbitrary
//! boot-relative epoch. `CLOCK_MONOTONIC_RAW` is immune to NTP slewing and
//! wall-clock adjustment, so deadlines keep their meaning across both.

/// Milliseconds since boot, from `CLOCK_MONOTONIC_RAW`
#[inline]
pub fn elapsed_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Microseconds since boot, from `CLOCK_MONOTONIC_RAW`
#[inline]
pub fn elapsed_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = elapsed_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = elapsed_ms();
        assert!(b >= a + 4, "clock went backwards or stalled: {} -> {}", a, b);
    }

    #[test]
    fn test_units_agree() {
        let ms = elapsed_ms();
        let us = elapsed_us();
        // Within a generous scheduling slop of each other
        assert!(us / 1000 >= ms);
        assert!(us / 1000 - ms < 1000);
    }
}
