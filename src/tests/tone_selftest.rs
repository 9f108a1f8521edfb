use crate::client_list::BufferOwner;
use crate::format::StreamFormat;
use crate::position::RingPosition;
use crate::tone::{ToneGenerator, correlation, rms};

use super::{float_memory, output_stream};

#[test]
fn selftest_sine_through_stream() {
    let sample_rate = 48_000u32;
    let ring_frames = 4_096u32;
    let block_frames = 256usize;
    let stream = output_stream(StreamFormat::float32(2), ring_frames);
    let memory = float_memory(block_frames, 2, 0.0);
    let key = stream
        .add_client(memory.clone(), memory.data_len(), BufferOwner::default())
        .expect("attach");

    let mut tone = ToneGenerator::new(sample_rate, 1_000.0, 0.5);
    let mut input = Vec::with_capacity(ring_frames as usize * 2);
    let mut block = vec![0.0f32; block_frames * 2];
    let mut position = RingPosition::new(0, 0);
    for _ in 0..(ring_frames as usize / block_frames) {
        let frames = tone.fill_interleaved(&mut block, 2);
        assert_eq!(frames, block_frames);
        memory.write_f32(0, &block);
        input.extend_from_slice(&block);
        stream
            .process_output_samples(key, position.sample_frame, position.loop_count, frames as u32, true)
            .expect("process block");
        position = position.advanced_by(frames as u64, ring_frames);
    }
    assert_eq!(position, RingPosition::new(1, 0));

    let recorded: Vec<f32> = stream
        .sample_buffer_snapshot()
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    assert_eq!(recorded.len(), input.len());

    let expected_rms = rms(&input);
    let actual_rms = rms(&recorded);
    let amplitude_error = (expected_rms - actual_rms).abs();
    assert!(
        amplitude_error < 0.01,
        "RMS mismatch: expected {expected_rms}, got {actual_rms}"
    );

    let corr = correlation(&input, &recorded);
    assert!(corr > 0.99, "phase correlation too low: {corr}");
}
