#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! Real-time core of a user-client audio engine.
//!
//! An [`AudioEngine`] owns output and input [`Stream`]s, each with a hardware
//! sample buffer shaped as a ring of `num_sample_frames_per_buffer` frames.
//! User clients register shared-memory buffers on those streams and call
//! [`UserClient::perform_client_io`] once per cycle; the engine mixes every
//! client into a float mix buffer and commits ("clips") the mix to the
//! hardware buffer as far as the slowest client has delivered. A per-buffer
//! set watchdog keeps a stalled client's stream moving.
//!
//! The concrete hardware is abstracted behind [`AudioDriver`]; the crate ships
//! a [`SimulatedDriver`] used by the developer console and by tests.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

pub mod clock;
pub mod config;
/// Developer-facing control and TUI support.
pub mod control;
pub mod convert;
pub mod driver;
pub mod engine;
pub mod error;
pub mod format;
pub mod gate;
pub mod memory;
pub mod position;
pub mod sim;
pub mod status;
pub mod stream;
pub mod timer;
pub mod tone;
pub mod user_client;

mod client_list;

#[cfg(test)]
mod tests;

pub use client_list::{BufferOwner, ClientKey};
pub use config::EngineConfig;
pub use driver::{AudioDevice, AudioDriver};
pub use engine::{AudioEngine, EngineState, Notification, NotificationKind};
pub use error::{AudioError, ClipError, DriverError};
pub use format::{SampleRate, StreamFormat};
pub use memory::ClientMemory;
pub use position::{Position, RingPosition};
pub use sim::SimulatedDriver;
pub use stream::{Stream, StreamDirection, StreamId, StreamInfo};
pub use timer::{ManualTimer, ThreadTimer, TimerService};
pub use user_client::{SampleInterval, UserClient};

const LOG_CAPACITY: usize = 256;
const SIM_CLOCK_TICK: Duration = Duration::from_millis(2);

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));
static TRACING_INIT: Once = Once::new();

/// Install the fmt subscriber once per process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Take the oldest buffered engine event line.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}

/// A simulated engine with one stereo float output stream, driven in real
/// time. Backs the C boundary and the developer console.
pub struct SimulatedEngine {
    engine: AudioEngine,
    driver: Arc<SimulatedDriver>,
    output: Arc<Stream>,
}

impl SimulatedEngine {
    /// Build the engine and start its device clock.
    pub fn new(sample_rate: f64, frames_per_buffer: u32) -> Result<Self, AudioError> {
        let config = EngineConfig::new(sample_rate, frames_per_buffer);
        let driver = Arc::new(SimulatedDriver::new(
            config.sample_rate_hz(),
            config.num_sample_frames_per_buffer,
        ));
        let timers = Arc::new(ThreadTimer::new("engine-timer").map_err(|_| AudioError::NoMemory)?);
        let engine = AudioEngine::new(config, driver.clone(), timers)?;
        let output = engine.add_output_stream(1, StreamFormat::float32(2))?;
        driver
            .start_clock(SIM_CLOCK_TICK)
            .map_err(|_| AudioError::NoMemory)?;
        Ok(Self {
            engine,
            driver,
            output,
        })
    }

    /// The engine.
    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    /// The simulated device.
    pub fn driver(&self) -> &Arc<SimulatedDriver> {
        &self.driver
    }

    /// The stereo output stream.
    pub fn output_stream(&self) -> &Arc<Stream> {
        &self.output
    }

    /// Status snapshot for control surfaces.
    pub fn snapshot(&self) -> EngineSnapshot {
        let engine = &self.engine;
        let status = engine.status();
        let streams = engine
            .output_streams()
            .into_iter()
            .chain(engine.input_streams())
            .map(|stream| stream.info())
            .collect();
        EngineSnapshot {
            state: engine.state(),
            sample_rate: engine.config().sample_rate_hz(),
            frames_per_buffer: engine.config().num_sample_frames_per_buffer,
            position: engine.current_position(),
            last_loop_time_ns: status.last_loop_time(),
            pause_count: engine.pause_count(),
            active_clients: engine.num_active_clients(),
            stop_position: engine.stop_position(),
            streams,
        }
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.engine.terminate();
        self.driver.stop_clock();
    }
}

/// Engine status snapshot used by control surfaces.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    /// Run state.
    pub state: EngineState,
    /// Nominal sample rate in Hertz.
    pub sample_rate: u32,
    /// Frames in the hardware ring.
    pub frames_per_buffer: u32,
    /// Where the hardware is now.
    pub position: RingPosition,
    /// Timestamp of the most recent ring wrap, zero before the first.
    pub last_loop_time_ns: u64,
    /// Outstanding nested pauses.
    pub pause_count: u32,
    /// Started user clients.
    pub active_clients: u32,
    /// Pending delayed stop.
    pub stop_position: Option<RingPosition>,
    /// Per-stream diagnostics.
    pub streams: Vec<StreamInfo>,
}

static ENGINE_GLOBAL: AtomicPtr<SimulatedEngine> = AtomicPtr::new(ptr::null_mut());

/// Create a simulated engine and publish it as the process-wide handle.
#[unsafe(no_mangle)]
pub extern "C" fn engine_kit_engine_create(sample_rate: f64, frames_per_buffer: u32) -> *mut SimulatedEngine {
    init_tracing();
    let engine = match SimulatedEngine::new(sample_rate, frames_per_buffer) {
        Ok(engine) => engine,
        Err(err) => {
            push_log(format!("engine create failed: {err}"));
            return ptr::null_mut();
        }
    };
    push_log(format!(
        "engine created rate={} frames={}",
        engine.engine.config().sample_rate_hz(),
        engine.engine.config().num_sample_frames_per_buffer
    ));
    let raw = Box::into_raw(Box::new(engine));
    ENGINE_GLOBAL.store(raw, Ordering::SeqCst);
    raw
}

/// Destroy an engine created by [`engine_kit_engine_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_engine_destroy(handle: *mut SimulatedEngine) {
    if handle.is_null() {
        return;
    }
    let _ = ENGINE_GLOBAL.compare_exchange(handle, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst);
    unsafe {
        drop(Box::from_raw(handle));
    }
}

/// Fetch the currently published engine handle, if any.
#[unsafe(no_mangle)]
pub extern "C" fn engine_kit_global_handle() -> *mut SimulatedEngine {
    ENGINE_GLOBAL.load(Ordering::SeqCst)
}

/// Identifier of the engine's stereo output stream, zero for a null handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_output_stream_id(handle: *const SimulatedEngine) -> u32 {
    if handle.is_null() {
        return 0;
    }
    unsafe { (*handle).output.id().0 }
}

/// Map a client buffer for `frames` interleaved float frames of `channels`
/// channels. Release with [`engine_kit_client_memory_release`].
#[unsafe(no_mangle)]
pub extern "C" fn engine_kit_client_memory_new(frames: u32, channels: u32) -> *const ClientMemory {
    match ClientMemory::for_float_frames(frames as usize, channels as usize) {
        Ok(memory) => Arc::into_raw(Arc::new(memory)),
        Err(err) => {
            push_log(format!("client memory map failed: {err}"));
            ptr::null()
        }
    }
}

/// Drop the caller's reference to a client buffer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_client_memory_release(memory: *const ClientMemory) {
    if !memory.is_null() {
        unsafe {
            drop(Arc::from_raw(memory));
        }
    }
}

/// Total mapped length of a client buffer, header included.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_client_memory_len(memory: *const ClientMemory) -> usize {
    if memory.is_null() {
        return 0;
    }
    unsafe { (*memory).len() }
}

/// Copy `count` samples into a client buffer's data region at `sample_offset`.
/// Returns samples written.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_client_memory_write(
    memory: *const ClientMemory,
    sample_offset: usize,
    samples: *const f32,
    count: usize,
) -> usize {
    if memory.is_null() || samples.is_null() {
        return 0;
    }
    unsafe {
        let samples = slice::from_raw_parts(samples, count);
        (*memory).write_f32(sample_offset, samples)
    }
}

/// Open a user client on an engine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_user_client_new(handle: *const SimulatedEngine) -> *mut UserClient {
    if handle.is_null() {
        return ptr::null_mut();
    }
    match unsafe { (*handle).engine.new_user_client() } {
        Ok(client) => Box::into_raw(Box::new(client)),
        Err(err) => {
            push_log(format!("user client open failed: {err}"));
            ptr::null_mut()
        }
    }
}

/// Close and free a user client.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_user_client_free(client: *mut UserClient) {
    if !client.is_null() {
        unsafe {
            drop(Box::from_raw(client));
        }
    }
}

/// Register `size` bytes of `memory` on `stream_id` within `buffer_set_id`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_register_client_buffer(
    client: *const UserClient,
    stream_id: u32,
    memory: *const ClientMemory,
    size: usize,
    buffer_set_id: u32,
) -> i32 {
    if client.is_null() || memory.is_null() {
        return AudioError::BadArgument("null handle").status_code();
    }
    let result = unsafe {
        Arc::increment_strong_count(memory);
        let memory = Arc::from_raw(memory);
        (*client).register_client_buffer(StreamId(stream_id), memory, size, buffer_set_id)
    };
    error::translate_status(result)
}

/// Unregister a client's buffers on `stream_id` within `buffer_set_id`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_unregister_client_buffer(
    client: *const UserClient,
    stream_id: u32,
    buffer_set_id: u32,
) -> i32 {
    if client.is_null() {
        return AudioError::BadArgument("null handle").status_code();
    }
    let result = unsafe { (*client).unregister_client_buffer(StreamId(stream_id), buffer_set_id) };
    error::translate_status(result)
}

/// Start a user client.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_start_client(client: *const UserClient) -> i32 {
    if client.is_null() {
        return AudioError::BadArgument("null handle").status_code();
    }
    error::translate_status(unsafe { (*client).start() })
}

/// Stop a user client.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_stop_client(client: *const UserClient) -> i32 {
    if client.is_null() {
        return AudioError::BadArgument("null handle").status_code();
    }
    error::translate_status(unsafe { (*client).stop() })
}

/// Real-time I/O trap. The sample interval arrives split into high and low
/// 32-bit words.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn engine_kit_perform_client_io(
    client: *const UserClient,
    first_sample_frame: u32,
    loop_count: u32,
    input_io: bool,
    buffer_set_id: u32,
    sample_interval_hi: u32,
    sample_interval_lo: u32,
) -> i32 {
    if client.is_null() {
        return AudioError::BadArgument("null handle").status_code();
    }
    let interval = SampleInterval::from_parts(sample_interval_hi, sample_interval_lo);
    let result = unsafe {
        (*client).perform_client_io(first_sample_frame, loop_count, input_io, buffer_set_id, interval)
    };
    if let Err(err) = &result {
        debug!(first_sample_frame, loop_count, error = %err, "client io failed");
    }
    error::translate_status(result)
}

#[unsafe(no_mangle)]
/// Pop the next engine event line. Returns `NULL` when no lines remain.
pub extern "C" fn engine_kit_pop_log() -> *const c_char {
    if let Some(message) = pop_log() {
        let mut cache = LOG_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}

/// Monotonic host time in nanoseconds.
#[unsafe(no_mangle)]
pub extern "C" fn engine_kit_monotonic_time_ns() -> u64 {
    clock::monotonic_timestamp_ns()
}

fn with_global<R>(f: impl FnOnce(&SimulatedEngine) -> R) -> Option<R> {
    let handle = engine_kit_global_handle();
    if handle.is_null() {
        return None;
    }
    unsafe { Some(f(&*handle)) }
}

/// Status of the published engine, if one exists.
pub fn get_engine_status() -> Option<EngineSnapshot> {
    with_global(SimulatedEngine::snapshot)
}

/// Run `f` against the published engine. Returns `None` when there is none.
pub fn with_engine<R>(f: impl FnOnce(&AudioEngine) -> R) -> Option<R> {
    with_global(|sim| f(&sim.engine))
}
