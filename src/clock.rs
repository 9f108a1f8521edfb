//! Host clock helpers shared by the status block, timers and the simulated device.
use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
fn host_ticks_ns() -> u64 {
    use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

    static RATIO: Lazy<(u128, u128)> = Lazy::new(|| {
        let mut info = mach_timebase_info_data_t::default();
        unsafe { mach_timebase_info(&mut info) };
        (info.numer as u128, (info.denom as u128).max(1))
    });
    let ticks = unsafe { mach_absolute_time() } as u128;
    (ticks * RATIO.0 / RATIO.1) as u64
}

#[cfg(not(target_os = "macos"))]
fn host_ticks_ns() -> u64 {
    static EPOCH: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
    u64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Monotonic timestamp in nanoseconds.
///
/// Never returns zero, which the status block reserves for "no timestamp yet".
pub fn monotonic_timestamp_ns() -> u64 {
    host_ticks_ns().max(1)
}

/// Nanoseconds needed to play `frames` at `sample_rate` Hz.
pub fn frames_to_ns(frames: u64, sample_rate: u32) -> u64 {
    match sample_rate {
        0 => 0,
        rate => (frames as u128 * 1_000_000_000 / rate as u128) as u64,
    }
}
