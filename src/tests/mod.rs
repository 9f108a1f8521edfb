use std::sync::Arc;

use crate::driver::AudioDriver;
use crate::format::StreamFormat;
use crate::memory::ClientMemory;
use crate::sim::SimulatedDriver;
use crate::stream::{Stream, StreamDirection, StreamId};

mod client_order;
mod conversion;
mod ring_position;
mod status_block;
mod tone_selftest;

fn output_stream(format: StreamFormat, frames_per_buffer: u32) -> Stream {
    let driver: Arc<dyn AudioDriver> = Arc::new(SimulatedDriver::new(48_000, frames_per_buffer));
    Stream::new(StreamId(1), StreamDirection::Output, 1, format, frames_per_buffer, driver)
}

fn float_memory(frames: usize, channels: usize, value: f32) -> Arc<ClientMemory> {
    let memory = ClientMemory::for_float_frames(frames, channels).expect("map client memory");
    memory.write_f32(0, &vec![value; frames * channels]);
    Arc::new(memory)
}
