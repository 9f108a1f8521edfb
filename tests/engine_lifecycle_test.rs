use std::sync::Arc;

use engine_kit::format::SampleRate;
use engine_kit::sim::CountingDevice;
use engine_kit::timer::TimerService;
use engine_kit::{
    AudioEngine, AudioError, ClientMemory, EngineConfig, EngineState, ManualTimer,
    NotificationKind, Position, RingPosition, SampleInterval, SimulatedDriver, StreamFormat,
};

const MS: u64 = 1_000_000;

fn engine_with_device() -> (AudioEngine, Arc<SimulatedDriver>, Arc<ManualTimer>, Arc<CountingDevice>) {
    let driver = Arc::new(SimulatedDriver::new(48_000, 4_096));
    let timers = Arc::new(ManualTimer::new(MS));
    let device = Arc::new(CountingDevice::default());
    let engine = AudioEngine::with_device(
        EngineConfig::new(48_000.0, 4_096),
        driver.clone(),
        timers.clone(),
        device.clone(),
    )
    .expect("engine");
    (engine, driver, timers, device)
}

fn kinds(rx: &crossbeam_channel::Receiver<engine_kit::Notification>) -> Vec<NotificationKind> {
    rx.try_iter().map(|notification| notification.kind).collect()
}

#[test]
fn failed_start_reports_device_stopped() {
    let (engine, driver, _timers, device) = engine_with_device();
    driver.fail_next_start();

    let err = engine.start().expect_err("start should fail");
    assert!(matches!(err, AudioError::Driver(_)));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(device.starting_calls(), 1);
    assert_eq!(device.stopped_calls(), 1);
    assert_eq!(device.running_engines(), 0);

    engine.start().expect("second start");
    assert_eq!(engine.state(), EngineState::Running);
    assert_eq!(device.running_engines(), 1);
    engine.stop().expect("stop");
    assert_eq!(device.running_engines(), 0);
    assert_eq!(driver.start_count(), 1);
    assert_eq!(driver.stop_count(), 1);
}

#[test]
fn failed_client_start_rolls_back_active_count() {
    let (engine, driver, _timers, device) = engine_with_device();
    let client = engine.new_user_client().expect("client");
    driver.fail_next_start();

    assert!(matches!(client.start(), Err(AudioError::Driver(_))));
    assert_eq!(engine.num_active_clients(), 0);
    assert!(!client.is_online());
    assert_eq!(device.running_engines(), 0);

    client.start().expect("retry");
    assert_eq!(engine.num_active_clients(), 1);
    assert!(engine.is_running());
}

#[test]
fn last_client_stop_waits_one_ring() {
    let (engine, driver, _timers, _device) = engine_with_device();
    let first = engine.new_user_client().expect("client");
    let second = engine.new_user_client().expect("client");
    first.start().expect("start");
    second.start().expect("start");

    first.stop().expect("stop");
    assert_eq!(engine.stop_position(), None);

    second.stop().expect("stop");
    assert_eq!(engine.stop_position(), Some(RingPosition::new(1, 0)));

    engine.run_periodic_pass().expect("pass");
    assert_eq!(engine.state(), EngineState::Running);

    driver.advance(2_048, None);
    engine.run_periodic_pass().expect("pass");
    assert_eq!(engine.state(), EngineState::Running);

    assert_eq!(driver.advance(2_048, Some(5 * MS)), 1);
    engine.run_periodic_pass().expect("pass");
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.stop_position(), None);
    assert!(!driver.is_running());
}

#[test]
fn client_start_cancels_pending_stop() {
    let (engine, driver, _timers, _device) = engine_with_device();
    let client = engine.new_user_client().expect("client");
    client.start().expect("start");
    client.stop().expect("stop");
    assert!(engine.stop_position().is_some());

    client.start().expect("restart");
    assert_eq!(engine.stop_position(), None);
    driver.advance(4_096, None);
    engine.run_periodic_pass().expect("pass");
    assert!(engine.is_running());
}

#[test]
fn pauses_nest_and_only_outermost_notifies() {
    let (engine, driver, _timers, _device) = engine_with_device();
    let rx = engine.subscribe();
    engine.start().expect("start");

    engine.pause().expect("pause");
    engine.pause().expect("pause");
    assert_eq!(engine.pause_count(), 2);
    assert_eq!(engine.state(), EngineState::Paused);
    assert!(!driver.is_running());

    engine.resume().expect("resume");
    assert_eq!(engine.state(), EngineState::Paused);
    engine.resume().expect("resume");
    assert_eq!(engine.state(), EngineState::Resumed);
    assert!(driver.is_running());

    // Unbalanced resume is ignored.
    engine.resume().expect("extra resume");
    assert_eq!(engine.pause_count(), 0);
    assert_eq!(engine.state(), EngineState::Resumed);

    assert_eq!(
        kinds(&rx),
        vec![
            NotificationKind::Started,
            NotificationKind::Paused,
            NotificationKind::Resumed
        ]
    );
}

#[test]
fn start_while_paused_resumes() {
    let (engine, driver, _timers, _device) = engine_with_device();
    engine.start().expect("start");
    engine.pause().expect("pause");
    engine.pause().expect("pause");

    engine.start().expect("start from paused");
    assert_eq!(engine.state(), EngineState::Resumed);
    assert_eq!(engine.pause_count(), 0);
    assert_eq!(driver.start_count(), 1);
}

#[test]
fn pause_while_stopped_leaves_state_alone() {
    let (engine, driver, _timers, _device) = engine_with_device();
    engine.pause().expect("pause");
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.pause_count(), 1);
    engine.resume().expect("resume");
    assert_eq!(engine.pause_count(), 0);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!driver.is_running());
}

#[test]
fn format_change_notifies_and_resizes_clients() {
    let (engine, driver, _timers, _device) = engine_with_device();
    let stream = engine
        .add_output_stream(1, StreamFormat::float32(2))
        .expect("stream");
    let memory = Arc::new(ClientMemory::for_float_frames(256, 2).expect("map"));
    let client = engine.new_user_client().expect("client");
    client
        .register_client_buffer(stream.id(), memory.clone(), memory.len(), 0)
        .expect("register");
    client.start().expect("start");
    let key = client.output_keys(0)[0];
    assert_eq!(stream.client_capacity(key), Some(256));

    let rx = engine.subscribe();
    engine
        .set_stream_format(stream.id(), StreamFormat::pcm16(2), None)
        .expect("format change");

    assert_eq!(stream.format(), StreamFormat::pcm16(2));
    assert_eq!(stream.client_capacity(key), Some(256));
    assert_eq!(stream.clipped_position(), Position::Unset);
    assert_eq!(driver.format_change_count(), 1);
    assert_eq!(engine.pause_count(), 0);
    assert_eq!(engine.state(), EngineState::Resumed);

    let events: Vec<_> = rx.try_iter().collect();
    let changed = events
        .iter()
        .find(|event| event.kind == NotificationKind::FormatChanged)
        .expect("format notification");
    assert_eq!(changed.sender, Some(stream.id().0));

    client
        .perform_client_io(0, 0, false, 0, SampleInterval::default())
        .expect("io after change");
}

#[test]
fn format_change_is_validated() {
    let (engine, driver, _timers, _device) = engine_with_device();
    let stream = engine
        .add_output_stream(1, StreamFormat::float32(2))
        .expect("stream");
    stream.add_available_format(
        StreamFormat::float32(2),
        SampleRate::hz(44_100),
        SampleRate::hz(48_000),
    );

    assert!(matches!(
        engine.set_stream_format(stream.id(), StreamFormat::pcm16(2), None),
        Err(AudioError::Unsupported(_))
    ));
    assert!(matches!(
        engine.set_stream_format(
            stream.id(),
            StreamFormat::float32(2),
            Some(SampleRate::hz(96_000))
        ),
        Err(AudioError::Unsupported(_))
    ));
    assert!(matches!(
        engine.set_stream_format(engine_kit::StreamId(42), StreamFormat::float32(2), None),
        Err(AudioError::BadArgument(_))
    ));
    engine
        .set_stream_format(stream.id(), StreamFormat::float32(2), Some(SampleRate::hz(44_100)))
        .expect("offered format");
    assert_eq!(driver.format_change_count(), 1);
}

#[test]
fn exclusive_format_needs_a_single_client() {
    let (engine, _driver, _timers, _device) = engine_with_device();
    let stream = engine
        .add_output_stream(1, StreamFormat::float32(2))
        .expect("stream");
    let clients: Vec<_> = (0..2)
        .map(|_| {
            let memory = Arc::new(ClientMemory::for_float_frames(64, 2).expect("map"));
            let client = engine.new_user_client().expect("client");
            client
                .register_client_buffer(stream.id(), memory.clone(), memory.len(), 0)
                .expect("register");
            client.start().expect("start");
            client
        })
        .collect();
    assert_eq!(stream.num_clients(), 2);

    assert_eq!(
        engine.set_stream_format(stream.id(), StreamFormat::pcm16(2).exclusive(), None),
        Err(AudioError::ExclusiveAccess)
    );
    assert_eq!(engine.pause_count(), 0);
    drop(clients);
    assert_eq!(stream.num_clients(), 0);
}

#[test]
fn streams_are_ordered_by_starting_channel() {
    let (engine, _driver, _timers, _device) = engine_with_device();
    let high = engine
        .add_output_stream(3, StreamFormat::float32(2))
        .expect("stream");
    let low = engine
        .add_output_stream(1, StreamFormat::float32(2))
        .expect("stream");
    let input = engine
        .add_input_stream(1, StreamFormat::float32(2))
        .expect("stream");

    let ids: Vec<_> = engine.output_streams().iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![low.id(), high.id()]);
    assert_eq!(engine.input_streams().len(), 1);
    assert_eq!(engine.stream(input.id()).map(|s| s.id()), Some(input.id()));
}

#[test]
fn periodic_timer_erases_played_frames() {
    let (engine, driver, timers, _device) = engine_with_device();
    let stream = engine
        .add_output_stream(1, StreamFormat::float32(2))
        .expect("stream");
    let memory = Arc::new(ClientMemory::for_float_frames(512, 2).expect("map"));
    memory.write_f32(0, &[0.5; 1_024]);
    let client = engine.new_user_client().expect("client");
    client
        .register_client_buffer(stream.id(), memory.clone(), memory.len(), 0)
        .expect("register");
    client.start().expect("start");
    client
        .perform_client_io(0, 0, false, 0, SampleInterval::default())
        .expect("io");

    driver.advance(256, None);
    let interval = engine.config().timer_interval_ns();
    timers.advance_to(MS + interval);

    let mix = stream.mix_buffer_snapshot().expect("mix");
    assert!(mix[..512].iter().all(|s| *s == 0.0));
    assert!(mix[512..1_024].iter().all(|s| *s == 0.5));
    assert_eq!(engine.status().erase_head_sample_frame(), 256);
    assert!(timers.next_deadline().is_some_and(|deadline| deadline > timers.now_ns()));
}

#[test]
fn terminate_stops_hardware_and_refuses_work() {
    let (engine, driver, _timers, device) = engine_with_device();
    let client = engine.new_user_client().expect("client");
    client.start().expect("start");
    assert_eq!(device.running_engines(), 1);

    engine.terminate();
    assert!(!engine.is_active());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!driver.is_running());
    assert_eq!(device.running_engines(), 0);
    assert!(matches!(engine.start(), Err(AudioError::NoDevice)));
    assert!(matches!(client.start(), Ok(()) | Err(AudioError::NoDevice)));
}
