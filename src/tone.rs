//! Sine tone source for demo clients and self tests, plus the level and
//! correlation measures used to check what came out of a stream.
use dasp_frame::{Frame, Stereo};
use dasp_signal::{self as signal, ConstHz, Signal, Sine};

/// Endless sine at a fixed frequency and amplitude.
pub struct ToneGenerator {
    sine: Sine<ConstHz>,
    amplitude: f32,
}

impl ToneGenerator {
    /// Tone of `frequency_hz` at `sample_rate`, peaking at `amplitude`.
    pub fn new(sample_rate: u32, frequency_hz: f64, amplitude: f32) -> Self {
        Self {
            sine: signal::rate(sample_rate.max(1) as f64)
                .const_hz(frequency_hz)
                .sine(),
            amplitude,
        }
    }

    /// Next stereo frame.
    pub fn next_stereo(&mut self) -> Stereo<f32> {
        let value = self.next_sample();
        Frame::from_fn(|_| value)
    }

    fn next_sample(&mut self) -> f32 {
        self.sine.next() as f32 * self.amplitude
    }

    /// Fill `out` with interleaved frames of `channels` channels, every
    /// channel carrying the same tone. Returns frames written.
    pub fn fill_interleaved(&mut self, out: &mut [f32], channels: usize) -> usize {
        if channels == 0 {
            return 0;
        }
        if channels == 2 {
            for frame in out.chunks_exact_mut(2) {
                frame.copy_from_slice(&self.next_stereo());
            }
            return out.len() / 2;
        }
        for frame in out.chunks_exact_mut(channels) {
            let value = self.next_sample();
            frame.fill(value);
        }
        out.len() / channels
    }
}

/// Root-mean-square level of `signal`.
pub fn rms(signal: &[f32]) -> f32 {
    match signal.len() {
        0 => 0.0,
        len => (signal.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / len as f64).sqrt() as f32,
    }
}

/// Normalised correlation of two equally long signals, 0.0 when either is silent.
pub fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let (cross, power_a, power_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |acc, (x, y)| {
        let (x, y) = (*x as f64, *y as f64);
        (acc.0 + x * y, acc.1 + x * x, acc.2 + y * y)
    });
    let norm = (power_a * power_b).sqrt();
    if norm == 0.0 { 0.0 } else { (cross / norm) as f32 }
}
