//! Engine configuration.
use crate::clock::frames_to_ns;
use crate::format::SampleRate;

/// Frames the hardware ring holds when the driver does not say otherwise.
pub const DEFAULT_FRAMES_PER_BUFFER: u32 = 4_096;
/// Smallest ring the engine accepts.
pub const MIN_FRAMES_PER_BUFFER: u32 = 64;

/// Static engine parameters chosen by the concrete driver.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Nominal sample rate.
    pub sample_rate: SampleRate,
    /// Frames in the hardware ring.
    pub num_sample_frames_per_buffer: u32,
    /// Periodic erase/flush passes per ring traversal.
    pub timer_ticks_per_buffer: u32,
    /// Whether the erase head zeroes played-out output frames.
    pub erase_output: bool,
    /// How early, as a percentage of one client buffer, the watchdog fires
    /// before the hardware reaches a client's next expected position.
    pub watchdog_lead_percent: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::hz(48_000),
            num_sample_frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            timer_ticks_per_buffer: 4,
            erase_output: true,
            watchdog_lead_percent: 25,
        }
    }
}

impl EngineConfig {
    /// Config for `sample_rate` Hz and a ring of `frames_per_buffer` frames,
    /// clamped to what the engine supports.
    pub fn new(sample_rate: f64, frames_per_buffer: u32) -> Self {
        let sr = sample_rate.round().clamp(8_000.0, 192_000.0) as u32;
        Self {
            sample_rate: SampleRate::hz(sr),
            num_sample_frames_per_buffer: frames_per_buffer.max(MIN_FRAMES_PER_BUFFER),
            ..Self::default()
        }
    }

    /// Builder-style toggle for the erase head.
    pub fn with_erase_output(mut self, erase: bool) -> Self {
        self.erase_output = erase;
        self
    }

    /// Builder-style periodic timer granularity.
    pub fn with_timer_ticks_per_buffer(mut self, ticks: u32) -> Self {
        self.timer_ticks_per_buffer = ticks.max(1);
        self
    }

    /// Builder-style watchdog lead.
    pub fn with_watchdog_lead_percent(mut self, percent: u32) -> Self {
        self.watchdog_lead_percent = percent.min(100);
        self
    }

    /// Whole-hertz sample rate, never zero.
    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate.whole.max(1)
    }

    /// Duration of one ring traversal.
    pub fn buffer_duration_ns(&self) -> u64 {
        frames_to_ns(self.num_sample_frames_per_buffer as u64, self.sample_rate_hz())
    }

    /// Interval between periodic erase/flush passes.
    pub fn timer_interval_ns(&self) -> u64 {
        (self.buffer_duration_ns() / self.timer_ticks_per_buffer.max(1) as u64).max(1)
    }
}
