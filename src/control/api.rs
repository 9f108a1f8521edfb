use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::warn;

use crate::clock::frames_to_ns;
use crate::error::AudioError;
use crate::format::{NumericRepresentation, StreamFormat};
use crate::memory::ClientMemory;
use crate::position::Position;
use crate::stream::StreamId;
use crate::tone::ToneGenerator;
use crate::user_client::SampleInterval;
use crate::{EngineSnapshot, get_engine_status, push_log, with_engine};

const TONE_FRAMES: u32 = 512;
const TONE_BUFFER_SET: u32 = 0;
const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f32 = 0.2;

struct ToneClient {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

static TONE_CLIENT: Lazy<Mutex<Option<ToneClient>>> = Lazy::new(|| Mutex::new(None));

/// Fetch the current engine snapshot if an engine is published.
pub fn get_status() -> Option<EngineSnapshot> {
    get_engine_status()
}

fn run(op: impl FnOnce(&crate::AudioEngine) -> Result<(), AudioError>) -> Result<(), AudioError> {
    with_engine(op).unwrap_or(Err(AudioError::NoDevice))
}

/// Start the engine's hardware.
pub fn start_engine() -> Result<(), AudioError> {
    run(|engine| engine.start())
}

/// Stop the engine's hardware.
pub fn stop_engine() -> Result<(), AudioError> {
    run(|engine| engine.stop())
}

/// Pause the engine.
pub fn pause_engine() -> Result<(), AudioError> {
    run(|engine| engine.pause())
}

/// Undo one pause.
pub fn resume_engine() -> Result<(), AudioError> {
    run(|engine| engine.resume())
}

/// Flip a stream between 32-bit float and 16-bit integer samples, keeping its
/// channel count.
pub fn toggle_stream_format(stream_id: StreamId) -> Result<StreamFormat, AudioError> {
    with_engine(|engine| {
        let stream = engine
            .stream(stream_id)
            .ok_or(AudioError::BadArgument("unknown stream"))?;
        let current = stream.format();
        let next = match current.numeric_representation {
            NumericRepresentation::Float => StreamFormat::pcm16(current.num_channels),
            _ => StreamFormat::float32(current.num_channels),
        };
        engine.set_stream_format(stream_id, next, None)?;
        Ok(next)
    })
    .unwrap_or(Err(AudioError::NoDevice))
}

/// Whether the demo tone client is running.
pub fn tone_running() -> bool {
    TONE_CLIENT.lock().is_some()
}

/// Start a user client that plays a sine tone into the first output stream,
/// or stop it if one is already running. Returns whether it is now running.
pub fn toggle_tone() -> Result<bool, AudioError> {
    let mut slot = TONE_CLIENT.lock();
    if let Some(tone) = slot.take() {
        let _ = tone.shutdown.send(());
        let _ = tone.handle.join();
        push_log("tone client stopped");
        return Ok(false);
    }

    let (client, stream_id, sample_rate, frames_per_buffer) = with_engine(|engine| {
        let stream = engine
            .output_streams()
            .into_iter()
            .next()
            .ok_or(AudioError::Unsupported("engine has no output stream"))?;
        let client = engine.new_user_client()?;
        Ok::<_, AudioError>((
            client,
            stream.id(),
            engine.config().sample_rate_hz(),
            engine.config().num_sample_frames_per_buffer,
        ))
    })
    .unwrap_or(Err(AudioError::NoDevice))?;

    let channels = with_engine(|engine| engine.stream(stream_id).map(|s| s.format().num_channels))
        .flatten()
        .unwrap_or(2);
    let memory = Arc::new(
        ClientMemory::for_float_frames(TONE_FRAMES as usize, channels as usize)
            .map_err(|_| AudioError::NoMemory)?,
    );
    client.register_client_buffer(stream_id, memory.clone(), memory.len(), TONE_BUFFER_SET)?;
    client.start()?;

    let (shutdown, shutdown_rx) = bounded::<()>(1);
    let period = Duration::from_nanos(frames_to_ns(TONE_FRAMES as u64, sample_rate));
    let handle = thread::Builder::new()
        .name("tone-client".to_string())
        .spawn(move || {
            let mut tone = ToneGenerator::new(sample_rate, TONE_HZ, TONE_AMPLITUDE);
            let mut scratch = vec![0.0f32; TONE_FRAMES as usize * channels as usize];
            while shutdown_rx.recv_timeout(period).is_err() {
                let position = match client.next_output_position(TONE_BUFFER_SET) {
                    Some(Position::At(next)) => next,
                    _ => match with_engine(|engine| engine.current_position()) {
                        Some(now) => now.advanced_by(TONE_FRAMES as u64, frames_per_buffer),
                        None => break,
                    },
                };
                tone.fill_interleaved(&mut scratch, channels as usize);
                memory.write_f32(0, &scratch);
                if let Err(err) = client.perform_client_io(
                    position.sample_frame,
                    position.loop_count,
                    false,
                    TONE_BUFFER_SET,
                    SampleInterval::default(),
                ) {
                    if err == AudioError::NoDevice {
                        break;
                    }
                    warn!(error = %err, "tone client io failed");
                }
            }
        })
        .map_err(|_| AudioError::NoMemory)?;
    *slot = Some(ToneClient { shutdown, handle });
    push_log("tone client started");
    Ok(true)
}
