//! Hooks a concrete hardware driver and its owning device provide to the engine.
use std::sync::Arc;

use crate::convert::{self, ClipSource};
use crate::error::{ClipError, DriverError};
use crate::format::{SampleRate, StreamFormat};
use crate::status::EngineStatus;
use crate::stream::StreamInfo;

/// Hardware-specific half of an audio engine.
///
/// The engine calls these from its work loop (start/stop/format change) and
/// from client I/O paths (clip/convert). Implementations must not call back
/// into the engine's locking operations from inside a hook.
pub trait AudioDriver: Send + Sync + 'static {
    /// Start the DMA engine. The driver reports ring wraps through
    /// [`EngineStatus::take_time_stamp`] on `status`.
    fn perform_audio_engine_start(&self, status: &Arc<EngineStatus>) -> Result<(), DriverError>;

    /// Stop the DMA engine.
    fn perform_audio_engine_stop(&self) -> Result<(), DriverError>;

    /// Halt the hardware for a pause without losing its position.
    fn perform_audio_engine_pause(&self) -> Result<(), DriverError> {
        self.perform_audio_engine_stop()
    }

    /// Continue after [`AudioDriver::perform_audio_engine_pause`].
    fn perform_audio_engine_resume(&self, status: &Arc<EngineStatus>) -> Result<(), DriverError> {
        self.perform_audio_engine_start(status)
    }

    /// Frame the hardware is currently playing or recording.
    fn current_sample_frame(&self) -> u32;

    /// Reprogram the hardware for `new_format` on `stream`.
    fn perform_format_change(
        &self,
        _stream: &StreamInfo,
        _new_format: &StreamFormat,
        _new_sample_rate: Option<SampleRate>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// Convert the frames in `source` into native bytes in `dst`.
    fn clip_output_samples(
        &self,
        source: ClipSource<'_>,
        dst: &mut [u8],
        format: &StreamFormat,
    ) -> Result<(), ClipError> {
        convert::clip_to_native(source, dst, format)
    }

    /// Convert native input bytes into interleaved floats.
    fn convert_input_samples(
        &self,
        src: &[u8],
        dst: &mut [f32],
        format: &StreamFormat,
    ) -> Result<(), ClipError> {
        convert::native_to_float(src, dst, format)
    }
}

/// Device that owns one or more engines and tracks how many are running.
pub trait AudioDevice: Send + Sync + 'static {
    /// An engine is about to start its hardware.
    fn audio_engine_starting(&self);

    /// An engine stopped, or failed to start.
    fn audio_engine_stopped(&self);
}
