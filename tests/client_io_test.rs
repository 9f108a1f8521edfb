use std::sync::Arc;

use engine_kit::error::STATUS_OVERRUN;
use engine_kit::memory::DESCRIPTOR_SIZE;
use engine_kit::stream::MIX_BUFFER_MAX_SIZE;
use engine_kit::timer::TimerService;
use engine_kit::{
    AudioEngine, AudioError, ClientMemory, ClipError, EngineConfig, ManualTimer, Position,
    SampleInterval, SimulatedDriver, Stream, StreamFormat, UserClient,
};

const MS: u64 = 1_000_000;

struct Harness {
    engine: AudioEngine,
    driver: Arc<SimulatedDriver>,
    timers: Arc<ManualTimer>,
    output: Arc<Stream>,
}

fn harness(frames_per_buffer: u32, format: StreamFormat) -> Harness {
    let config = EngineConfig::new(48_000.0, frames_per_buffer);
    let driver = Arc::new(SimulatedDriver::new(48_000, frames_per_buffer));
    let timers = Arc::new(ManualTimer::new(MS));
    let engine = AudioEngine::new(config, driver.clone(), timers.clone()).expect("engine");
    let output = engine.add_output_stream(1, format).expect("output stream");
    Harness {
        engine,
        driver,
        timers,
        output,
    }
}

fn float_memory(frames: usize, value: f32) -> Arc<ClientMemory> {
    let memory = ClientMemory::for_float_frames(frames, 2).expect("map");
    memory.write_f32(0, &vec![value; frames * 2]);
    Arc::new(memory)
}

fn started_client(h: &Harness, memory: &Arc<ClientMemory>) -> UserClient {
    let client = h.engine.new_user_client().expect("client");
    client
        .register_client_buffer(h.output.id(), memory.clone(), memory.len(), 0)
        .expect("register");
    client.start().expect("start");
    client
}

fn output_io(client: &UserClient, first_sample_frame: u32, loop_count: u32) -> Result<(), AudioError> {
    client.perform_client_io(first_sample_frame, loop_count, false, 0, SampleInterval::default())
}

#[test]
fn first_cycle_is_mixed_and_committed() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(512, 0.5);
    let client = started_client(&h, &memory);
    assert!(h.engine.is_running());
    assert!(h.driver.is_running());

    output_io(&client, 0, 1).expect("io");

    let key = client.output_keys(0)[0];
    assert_eq!(h.output.mixed_position(key), Some(Position::at(1, 512)));
    assert_eq!(h.output.clipped_position(), Position::at(1, 512));
    let mix = h.output.mix_buffer_snapshot().expect("mix");
    assert!(mix[..1_024].iter().all(|s| *s == 0.5));
    assert!(mix[1_024..].iter().all(|s| *s == 0.0));
    assert_eq!(client.next_output_position(0), Some(Position::at(1, 512)));
}

#[test]
fn slowest_client_gates_commit() {
    let h = harness(4_096, StreamFormat::float32(2));
    let fast_memory = float_memory(512, 0.25);
    let slow_memory = float_memory(512, 0.5);
    slow_memory.set_actual(256, 256 * 8);
    let fast = started_client(&h, &fast_memory);
    let slow = started_client(&h, &slow_memory);

    output_io(&fast, 0, 0).expect("fast io");
    assert_eq!(h.output.clipped_position(), Position::at(0, 0));

    output_io(&slow, 0, 0).expect("slow io");
    assert_eq!(h.output.clipped_position(), Position::at(0, 256));

    output_io(&slow, 256, 0).expect("slow io again");
    assert_eq!(h.output.clipped_position(), Position::at(0, 512));

    let mix = h.output.mix_buffer_snapshot().expect("mix");
    assert!(mix[..1_024].iter().all(|s| (*s - 0.75).abs() < 1e-6));

    let order = h.output.clip_order();
    assert_eq!(order.len(), 2);
    assert!(order.windows(2).all(|pair| pair[0].2 <= pair[1].2));
}

#[test]
fn cycle_crossing_ring_end_lands_in_next_loop() {
    let h = harness(1_000, StreamFormat::float32(2));
    let memory = float_memory(200, 0.3);
    let client = started_client(&h, &memory);

    output_io(&client, 900, 3).expect("io");

    let key = client.output_keys(0)[0];
    assert_eq!(h.output.mixed_position(key), Some(Position::at(4, 100)));
    let mix = h.output.mix_buffer_snapshot().expect("mix");
    assert_eq!(mix[950 * 2], 0.3);
    assert_eq!(mix[50 * 2], 0.3);
    assert_eq!(mix[500 * 2], 0.0);
    assert_eq!(client.next_output_position(0), Some(Position::at(4, 100)));
}

#[test]
fn clip_point_never_moves_backwards() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(256, 0.1);
    let client = started_client(&h, &memory);

    let mut last = Position::Unset;
    for (frame, loop_count) in [(0, 0), (256, 0), (128, 0), (3_968, 0), (100, 1), (0, 0)] {
        let _ = output_io(&client, frame, loop_count);
        let clipped = h.output.clipped_position();
        assert!(clipped >= last, "clip point regressed from {last:?} to {clipped:?}");
        last = clipped;
    }
}

#[test]
fn exclusive_stream_takes_one_client_and_reports_overrun() {
    let h = harness(4_096, StreamFormat::pcm16(2).exclusive());
    let native = Arc::new(ClientMemory::new(DESCRIPTOR_SIZE + 4_096 * 4).expect("map"));
    let owner = started_client(&h, &native);

    let intruder = h.engine.new_user_client().expect("client");
    let other = Arc::new(ClientMemory::new(DESCRIPTOR_SIZE + 1_024).expect("map"));
    assert_eq!(
        intruder.register_client_buffer(h.output.id(), other.clone(), other.len(), 0),
        Err(AudioError::ExclusiveAccess)
    );

    native.set_actual(MIX_BUFFER_MAX_SIZE, MIX_BUFFER_MAX_SIZE * 4);
    output_io(&owner, 0, 0).expect("within limit");
    assert_eq!(h.output.clipped_position(), Position::at(0, MIX_BUFFER_MAX_SIZE));

    native.set_actual(MIX_BUFFER_MAX_SIZE + 1, (MIX_BUFFER_MAX_SIZE + 1) * 4);
    let err = output_io(&owner, MIX_BUFFER_MAX_SIZE, 0).expect_err("overrun");
    assert_eq!(
        err,
        AudioError::Clip(ClipError::Overrun {
            requested: MIX_BUFFER_MAX_SIZE + 1,
            limit: MIX_BUFFER_MAX_SIZE,
        })
    );
    assert_eq!(err.status_code(), STATUS_OVERRUN);
    // Reporting the overrun skips the stream past the lost frames.
    assert_eq!(
        h.output.clipped_position(),
        Position::at(0, 2 * MIX_BUFFER_MAX_SIZE + 1)
    );
}

#[test]
fn io_is_refused_outside_a_running_online_client() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(256, 0.1);

    let idle = h.engine.new_user_client().expect("client");
    idle.register_client_buffer(h.output.id(), memory.clone(), memory.len(), 0)
        .expect("register");
    assert_eq!(output_io(&idle, 0, 0), Err(AudioError::Offline));

    let client = started_client(&h, &memory);
    assert_eq!(
        client.perform_client_io(4_096, 0, false, 0, SampleInterval::default()),
        Err(AudioError::BadArgument("first sample frame out of range"))
    );
    assert_eq!(
        client.perform_client_io(0, 0, false, 9, SampleInterval::default()),
        Err(AudioError::BadArgument("unknown buffer set"))
    );

    h.engine.pause().expect("pause");
    assert_eq!(output_io(&client, 0, 0), Err(AudioError::NotReady));
    h.engine.resume().expect("resume");
    output_io(&client, 0, 0).expect("io after resume");

    h.engine.terminate();
    assert_eq!(output_io(&client, 256, 0), Err(AudioError::NoDevice));
    assert_eq!(
        client.register_client_buffer(h.output.id(), memory.clone(), memory.len(), 1),
        Err(AudioError::NoDevice)
    );
    assert!(matches!(h.engine.new_user_client(), Err(AudioError::NoDevice)));
}

#[test]
fn registration_validates_buffer_and_stream() {
    let h = harness(4_096, StreamFormat::float32(2));
    let client = h.engine.new_user_client().expect("client");
    let memory = float_memory(64, 0.0);

    assert!(matches!(
        client.register_client_buffer(h.output.id(), memory.clone(), DESCRIPTOR_SIZE, 0),
        Err(AudioError::BadArgument(_))
    ));
    assert!(matches!(
        client.register_client_buffer(h.output.id(), memory.clone(), memory.len() + 1, 0),
        Err(AudioError::BadArgument(_))
    ));
    assert!(matches!(
        client.register_client_buffer(engine_kit::StreamId(99), memory.clone(), memory.len(), 0),
        Err(AudioError::BadArgument(_))
    ));
    assert_eq!(client.buffer_set_count(), 0);

    client
        .register_client_buffer(h.output.id(), memory.clone(), memory.len(), 3)
        .expect("register");
    assert_eq!(client.buffer_set_count(), 1);
    client
        .unregister_client_buffer(h.output.id(), 3)
        .expect("unregister");
    assert_eq!(client.buffer_set_count(), 0);
}

#[test]
fn input_cycle_fills_client_buffer() {
    let h = harness(4_096, StreamFormat::float32(2));
    let input = h
        .engine
        .add_input_stream(1, StreamFormat::float32(2))
        .expect("input stream");
    input.with_sample_buffer_mut(|hw| {
        for sample in hw.chunks_exact_mut(4) {
            sample.copy_from_slice(&(-0.5f32).to_ne_bytes());
        }
    });

    let memory = float_memory(128, 0.0);
    let client = h.engine.new_user_client().expect("client");
    client
        .register_client_buffer(input.id(), memory.clone(), memory.len(), 0)
        .expect("register");
    client.start().expect("start");
    assert!(!client.watchdog_armed(0));

    client
        .perform_client_io(10, 0, true, 0, SampleInterval::default())
        .expect("input io");
    let mut out = vec![0.0f32; 128 * 2];
    memory.read_f32(0, &mut out);
    assert!(out.iter().all(|s| *s == -0.5));
    assert_eq!(memory.descriptor().actual_num_sample_frames, 128);
}

#[test]
fn watchdog_cancelled_by_real_cycle_never_fires() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(512, 0.5);
    let client = started_client(&h, &memory);

    output_io(&client, 0, 0).expect("io");
    assert!(client.watchdog_armed(0));
    let first_deadline = h.timers.next_deadline().expect("watchdog armed");

    // The next real cycle lands before the first deadline and re-arms later.
    h.timers.advance_to(6 * MS);
    output_io(&client, 512, 0).expect("io");
    h.timers.advance_to(first_deadline + MS);
    assert_eq!(client.next_output_position(0), Some(Position::at(0, 1_024)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 1_024));

    h.timers.advance_to(18 * MS);
    assert_eq!(client.next_output_position(0), Some(Position::at(0, 1_536)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 1_536));
}

#[test]
fn in_flight_fire_after_real_cycle_is_ignored() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(512, 0.5);
    let client = started_client(&h, &memory);

    output_io(&client, 0, 0).expect("io");
    let generation = client.watchdog_generation(0).expect("generation");

    // The timer thread already took this fire when the next cycle arrived.
    output_io(&client, 512, 0).expect("io");
    client.fire_watchdog(0, generation);
    assert_eq!(client.next_output_position(0), Some(Position::at(0, 1_024)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 1_024));
}

fn advance_until_next_output(h: &Harness, client: &UserClient, target: Position) {
    for _ in 0..200 {
        if client.next_output_position(0) == Some(target) {
            return;
        }
        h.timers.advance_by(MS);
    }
    panic!("watchdog never carried the set to {target:?}");
}

#[test]
fn late_cycle_after_watchdog_passes_is_not_promoted_a_loop() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(512, 0.5);
    let client = started_client(&h, &memory);

    output_io(&client, 0, 0).expect("io");
    advance_until_next_output(&h, &client, Position::at(0, 3_072));
    let key = client.output_keys(0)[0];
    assert_eq!(h.output.mixed_position(key), Some(Position::at(0, 3_072)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 3_072));

    output_io(&client, 512, 0).expect("late io");
    assert_eq!(h.output.mixed_position(key), Some(Position::at(0, 3_072)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 3_072));

    output_io(&client, 3_072, 0).expect("caught up");
    assert_eq!(h.output.mixed_position(key), Some(Position::at(0, 3_584)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 3_584));
    let mix = h.output.mix_buffer_snapshot().expect("mix");
    assert!(mix[3_072 * 2..3_584 * 2].iter().all(|s| *s == 0.5));
}

#[test]
fn failed_buffer_still_advances_set_bookkeeping() {
    let h = harness(4_096, StreamFormat::float32(2));
    let second = h
        .engine
        .add_output_stream(3, StreamFormat::float32(2))
        .expect("second stream");
    let first_memory = float_memory(512, 0.5);
    let second_memory = float_memory(512, 0.25);
    let client = h.engine.new_user_client().expect("client");
    client
        .register_client_buffer(h.output.id(), first_memory.clone(), first_memory.len(), 0)
        .expect("register first");
    client
        .register_client_buffer(second.id(), second_memory.clone(), second_memory.len(), 0)
        .expect("register second");
    client.start().expect("start");

    let keys = client.output_keys(0);
    assert_eq!(keys.len(), 2);
    second.remove_client(keys[1]).expect("detach behind the client's back");

    assert_eq!(
        output_io(&client, 0, 0),
        Err(AudioError::BadArgument("unknown client buffer"))
    );
    assert_eq!(h.output.mixed_position(keys[0]), Some(Position::at(0, 512)));
    assert_eq!(client.next_output_position(0), Some(Position::at(0, 512)));
    assert!(client.watchdog_armed(0));
}

#[test]
fn watchdog_carries_stalled_client_forward() {
    let h = harness(4_096, StreamFormat::float32(2));
    let memory = float_memory(512, 0.5);
    let client = started_client(&h, &memory);

    output_io(&client, 0, 0).expect("io");
    let armed = client.watchdog_generation(0).expect("generation");

    // One 512-frame cycle at 48 kHz is ~10.7 ms; the periodic pass is due at ~21.3 ms.
    h.timers.advance_by(12 * MS);

    assert_eq!(client.next_output_position(0), Some(Position::at(0, 1_024)));
    assert_eq!(h.output.clipped_position(), Position::at(0, 1_024));
    assert!(client.watchdog_generation(0).expect("generation") > armed);
    assert!(client.watchdog_armed(0));

    let mix = h.output.mix_buffer_snapshot().expect("mix");
    assert!(mix[1_024..2_048].iter().all(|s| *s == 0.0));
    assert!(h.timers.now_ns() >= 12 * MS);

    client.stop().expect("stop");
    assert!(!client.watchdog_armed(0));
    assert_eq!(client.next_output_position(0), Some(Position::Unset));
}
