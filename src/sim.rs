//! Software audio device: a DMA position that moves when told to, or in real
//! time from a clock thread, reporting each ring wrap to the status block.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::{AudioDevice, AudioDriver};
use crate::error::DriverError;
use crate::format::{SampleRate, StreamFormat};
use crate::status::EngineStatus;
use crate::stream::StreamInfo;

struct SimInner {
    sample_rate: u32,
    frames_per_buffer: u32,
    position: AtomicU64,
    running: AtomicBool,
    fail_next_start: AtomicBool,
    status: Mutex<Option<Arc<EngineStatus>>>,
    starts: AtomicU32,
    stops: AtomicU32,
    format_changes: AtomicU32,
}

impl SimInner {
    fn advance(&self, frames: u64, timestamp_ns: Option<u64>) -> u64 {
        if !self.running.load(Ordering::Acquire) || frames == 0 {
            return 0;
        }
        let n = self.frames_per_buffer.max(1) as u64;
        let old = self.position.fetch_add(frames, Ordering::AcqRel);
        let new = old + frames;
        let wraps = new / n - old / n;
        if wraps > 0
            && let Some(status) = self.status.lock().as_ref()
        {
            for _ in 0..wraps {
                status.take_time_stamp(true, timestamp_ns);
            }
        }
        wraps
    }
}

struct ClockThread {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Simulated hardware for tests, demos and the developer console.
pub struct SimulatedDriver {
    inner: Arc<SimInner>,
    clock: Mutex<Option<ClockThread>>,
}

impl SimulatedDriver {
    /// Device at `sample_rate` Hz with a ring of `frames_per_buffer` frames.
    pub fn new(sample_rate: u32, frames_per_buffer: u32) -> Self {
        Self {
            inner: Arc::new(SimInner {
                sample_rate,
                frames_per_buffer,
                position: AtomicU64::new(0),
                running: AtomicBool::new(false),
                fail_next_start: AtomicBool::new(false),
                status: Mutex::new(None),
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                format_changes: AtomicU32::new(0),
            }),
            clock: Mutex::new(None),
        }
    }

    /// Move the DMA position forward by `frames`, stamping each ring wrap with
    /// `timestamp_ns` (host time when `None`). Returns wraps taken. Does nothing
    /// while the hardware is stopped.
    pub fn advance(&self, frames: u64, timestamp_ns: Option<u64>) -> u64 {
        self.inner.advance(frames, timestamp_ns)
    }

    /// Frames played since the last start.
    pub fn position(&self) -> u64 {
        self.inner.position.load(Ordering::Acquire)
    }

    /// Whether the hardware is moving.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Make the next start attempt fail.
    pub fn fail_next_start(&self) {
        self.inner.fail_next_start.store(true, Ordering::Release);
    }

    /// Successful start calls.
    pub fn start_count(&self) -> u32 {
        self.inner.starts.load(Ordering::Acquire)
    }

    /// Stop calls.
    pub fn stop_count(&self) -> u32 {
        self.inner.stops.load(Ordering::Acquire)
    }

    /// Format change calls.
    pub fn format_change_count(&self) -> u32 {
        self.inner.format_changes.load(Ordering::Acquire)
    }

    /// Advance the position in real time from a background thread, checking
    /// every `tick`.
    pub fn start_clock(&self, tick: Duration) -> std::io::Result<()> {
        let mut clock = self.clock.lock();
        if clock.is_some() {
            return Ok(());
        }
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("sim-clock".to_string())
            .spawn(move || {
                let rate = inner.sample_rate.max(1) as u128;
                let origin = Instant::now();
                let mut emitted = 0u64;
                while shutdown_rx.recv_timeout(tick).is_err() {
                    let due = (origin.elapsed().as_nanos() * rate / 1_000_000_000) as u64;
                    if inner.running.load(Ordering::Acquire) {
                        inner.advance(due - emitted, None);
                    }
                    emitted = due;
                }
            })?;
        *clock = Some(ClockThread { shutdown, handle });
        Ok(())
    }

    /// Stop the real-time clock thread.
    pub fn stop_clock(&self) {
        if let Some(clock) = self.clock.lock().take() {
            let _ = clock.shutdown.send(());
            let _ = clock.handle.join();
        }
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.stop_clock();
    }
}

impl AudioDriver for SimulatedDriver {
    fn perform_audio_engine_start(&self, status: &Arc<EngineStatus>) -> Result<(), DriverError> {
        if self.inner.fail_next_start.swap(false, Ordering::AcqRel) {
            return Err(DriverError("simulated start failure".to_string()));
        }
        *self.inner.status.lock() = Some(status.clone());
        self.inner.position.store(0, Ordering::Release);
        self.inner.running.store(true, Ordering::Release);
        self.inner.starts.fetch_add(1, Ordering::AcqRel);
        debug!("simulated device started");
        Ok(())
    }

    fn perform_audio_engine_stop(&self) -> Result<(), DriverError> {
        self.inner.running.store(false, Ordering::Release);
        self.inner.stops.fetch_add(1, Ordering::AcqRel);
        debug!("simulated device stopped");
        Ok(())
    }

    fn perform_audio_engine_pause(&self) -> Result<(), DriverError> {
        self.inner.running.store(false, Ordering::Release);
        Ok(())
    }

    fn perform_audio_engine_resume(&self, _status: &Arc<EngineStatus>) -> Result<(), DriverError> {
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    fn current_sample_frame(&self) -> u32 {
        let n = self.inner.frames_per_buffer.max(1) as u64;
        (self.inner.position.load(Ordering::Acquire) % n) as u32
    }

    fn perform_format_change(
        &self,
        stream: &StreamInfo,
        new_format: &StreamFormat,
        _new_sample_rate: Option<SampleRate>,
    ) -> Result<(), DriverError> {
        self.inner.format_changes.fetch_add(1, Ordering::AcqRel);
        debug!(
            stream = stream.id.0,
            channels = new_format.num_channels,
            "simulated format change"
        );
        Ok(())
    }
}

/// Device that counts running engines.
#[derive(Default)]
pub struct CountingDevice {
    running: AtomicU32,
    starting_calls: AtomicU32,
    stopped_calls: AtomicU32,
}

impl CountingDevice {
    /// Engines currently counted as running.
    pub fn running_engines(&self) -> u32 {
        self.running.load(Ordering::Acquire)
    }

    /// `audio_engine_starting` calls seen.
    pub fn starting_calls(&self) -> u32 {
        self.starting_calls.load(Ordering::Acquire)
    }

    /// `audio_engine_stopped` calls seen.
    pub fn stopped_calls(&self) -> u32 {
        self.stopped_calls.load(Ordering::Acquire)
    }
}

impl AudioDevice for CountingDevice {
    fn audio_engine_starting(&self) {
        self.starting_calls.fetch_add(1, Ordering::AcqRel);
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    fn audio_engine_stopped(&self) {
        self.stopped_calls.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }
}
