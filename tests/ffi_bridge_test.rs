use std::ffi::CStr;

use engine_kit::error::{STATUS_BAD_ARGUMENT, STATUS_OFFLINE, STATUS_SUCCESS};
use engine_kit::{
    EngineState, engine_kit_client_memory_len, engine_kit_client_memory_new,
    engine_kit_client_memory_release, engine_kit_client_memory_write, engine_kit_engine_create,
    engine_kit_engine_destroy, engine_kit_global_handle, engine_kit_monotonic_time_ns,
    engine_kit_output_stream_id, engine_kit_perform_client_io, engine_kit_pop_log,
    engine_kit_register_client_buffer, engine_kit_start_client, engine_kit_stop_client,
    engine_kit_unregister_client_buffer, engine_kit_user_client_free, engine_kit_user_client_new,
    get_engine_status,
};

const SAMPLE_RATE: f64 = 48_000.0;
const RING_FRAMES: u32 = 4_096;
const BLOCK_FRAMES: u32 = 512;

fn drain_log() -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let line = engine_kit_pop_log();
        if line.is_null() {
            break;
        }
        lines.push(unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned());
    }
    lines
}

#[test]
fn client_drives_engine_through_c_abi() {
    let handle = engine_kit_engine_create(SAMPLE_RATE, RING_FRAMES);
    assert!(!handle.is_null(), "expected engine handle");
    assert_eq!(engine_kit_global_handle(), handle);
    let stream_id = unsafe { engine_kit_output_stream_id(handle) };
    assert_ne!(stream_id, 0);

    let memory = engine_kit_client_memory_new(BLOCK_FRAMES, 2);
    assert!(!memory.is_null());
    let block = vec![0.25f32; BLOCK_FRAMES as usize * 2];
    let written =
        unsafe { engine_kit_client_memory_write(memory, 0, block.as_ptr(), block.len()) };
    assert_eq!(written, block.len());
    let size = unsafe { engine_kit_client_memory_len(memory) };

    let client = unsafe { engine_kit_user_client_new(handle) };
    assert!(!client.is_null());
    let status = unsafe { engine_kit_register_client_buffer(client, stream_id, memory, size, 0) };
    assert_eq!(status, STATUS_SUCCESS);

    let status = unsafe { engine_kit_perform_client_io(client, 0, 0, false, 0, 0, 0) };
    assert_eq!(status, STATUS_OFFLINE);

    assert_eq!(unsafe { engine_kit_start_client(client) }, STATUS_SUCCESS);
    let snapshot = get_engine_status().expect("published engine");
    assert!(snapshot.state.is_running());
    assert_eq!(snapshot.active_clients, 1);

    let status =
        unsafe { engine_kit_perform_client_io(client, RING_FRAMES, 0, false, 0, 0, 0) };
    assert_eq!(status, STATUS_BAD_ARGUMENT);
    let status = unsafe { engine_kit_perform_client_io(client, 0, 0, false, 7, 0, 0) };
    assert_eq!(status, STATUS_BAD_ARGUMENT);

    let ahead = get_engine_status()
        .expect("published engine")
        .position
        .advanced_by(1_024, RING_FRAMES);
    let status = unsafe {
        engine_kit_perform_client_io(client, ahead.sample_frame, ahead.loop_count, false, 0, 0, 0)
    };
    assert_eq!(status, STATUS_SUCCESS);

    assert_eq!(unsafe { engine_kit_stop_client(client) }, STATUS_SUCCESS);
    let snapshot = get_engine_status().expect("published engine");
    assert_eq!(snapshot.active_clients, 0);
    assert!(snapshot.stop_position.is_some() || snapshot.state == EngineState::Stopped);

    assert_eq!(
        unsafe { engine_kit_unregister_client_buffer(client, stream_id, 0) },
        STATUS_SUCCESS
    );
    unsafe {
        engine_kit_user_client_free(client);
        engine_kit_client_memory_release(memory);
        engine_kit_engine_destroy(handle);
    }
    assert!(engine_kit_global_handle().is_null());
    assert!(get_engine_status().is_none());

    let log = drain_log();
    assert!(log.iter().any(|line| line.starts_with("engine created")));
    assert!(log.iter().any(|line| line == "engine started"));
    assert!(log.iter().any(|line| line == "engine terminated"));
}

#[test]
fn null_handles_are_rejected() {
    unsafe {
        assert_eq!(engine_kit_output_stream_id(std::ptr::null()), 0);
        assert!(engine_kit_user_client_new(std::ptr::null()).is_null());
        assert_eq!(engine_kit_start_client(std::ptr::null()), STATUS_BAD_ARGUMENT);
        assert_eq!(
            engine_kit_perform_client_io(std::ptr::null(), 0, 0, false, 0, 0, 0),
            STATUS_BAD_ARGUMENT
        );
        assert_eq!(engine_kit_client_memory_len(std::ptr::null()), 0);
        engine_kit_engine_destroy(std::ptr::null_mut());
    }
    let before = engine_kit_monotonic_time_ns();
    assert!(engine_kit_monotonic_time_ns() >= before);
}
