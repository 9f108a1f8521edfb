use crate::memory::{ClientMemory, DESCRIPTOR_SIZE};
use crate::status::{ENGINE_STATUS_VERSION, EngineStatus, page_round};

#[test]
fn status_block_is_page_rounded_and_stamps_wraps() {
    let status = EngineStatus::new().expect("map status");
    assert_eq!(status.mapped_len(), page_round(1));
    assert_eq!(status.mapped_len() % 4_096, 0);
    assert_eq!(status.version(), ENGINE_STATUS_VERSION);

    status.take_time_stamp(true, Some(42));
    status.take_time_stamp(true, Some(99));
    assert_eq!(status.loop_count_and_time_stamp(), (2, 99));

    status.reset();
    assert_eq!(status.loop_count_and_time_stamp(), (0, 0));
    assert_eq!(status.erase_head_sample_frame(), 0);
}

#[test]
fn client_memory_round_trips_samples_after_header() {
    let memory = ClientMemory::for_float_frames(8, 2).expect("map");
    assert_eq!(memory.len(), DESCRIPTOR_SIZE + 8 * 2 * 4);
    assert_eq!(memory.descriptor().total_data_byte_size, 64);

    assert_eq!(memory.write_f32(4, &[0.5, -0.5]), 2);
    let mut out = [0.0f32; 6];
    memory.read_f32(2, &mut out);
    assert_eq!(out, [0.0, 0.0, 0.5, -0.5, 0.0, 0.0]);
}
