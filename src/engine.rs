//! The engine: streams, the shared status block, the run state machine and
//! the periodic erase/flush pass.
//!
//! Control operations (start, stop, pause, format changes, client start and
//! stop accounting) run on the engine's [`CommandGate`] work loop. Client
//! real-time I/O never enters the gate; it takes the owning user client's
//! buffer lock and then individual stream locks.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::driver::{AudioDevice, AudioDriver};
use crate::error::{AudioError, Result};
use crate::format::{SampleRate, StreamFormat, compare_streams};
use crate::gate::CommandGate;
use crate::position::RingPosition;
use crate::push_log;
use crate::status::EngineStatus;
use crate::stream::{Stream, StreamDirection, StreamId};
use crate::timer::{TimerId, TimerService};
use crate::user_client::{ClientShared, UserClient};

/// Run state of an engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Hardware idle. Initial state.
    #[default]
    Stopped,
    /// Hardware running after a start.
    Running,
    /// Hardware halted by a pause; registrations are kept.
    Paused,
    /// Hardware running again after a pause.
    Resumed,
}

impl EngineState {
    /// Whether the hardware is moving.
    pub fn is_running(self) -> bool {
        matches!(self, EngineState::Running | EngineState::Resumed)
    }
}

/// Kind of state-change event delivered to notification ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// The engine started.
    Started,
    /// The engine stopped.
    Stopped,
    /// The engine paused.
    Paused,
    /// The engine resumed after a pause.
    Resumed,
    /// A stream changed format.
    FormatChanged,
}

/// Event delivered to registered notification ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// Stream id for format changes, user client id for client-driven events.
    pub sender: Option<u32>,
}

struct EngineCore {
    state: EngineState,
    pause_count: u32,
    num_active_clients: u32,
    stop_position: Option<RingPosition>,
    timer: Option<TimerId>,
}

pub(crate) struct EngineShared {
    config: EngineConfig,
    driver: Arc<dyn AudioDriver>,
    device: Option<Arc<dyn AudioDevice>>,
    status: Arc<EngineStatus>,
    timers: Arc<dyn TimerService>,
    gate: CommandGate,
    streams: RwLock<Vec<Arc<Stream>>>,
    core: Mutex<EngineCore>,
    clients: Mutex<Vec<Weak<ClientShared>>>,
    ports: Mutex<Vec<Sender<Notification>>>,
    active: AtomicBool,
    next_stream_id: AtomicU32,
    next_client_id: AtomicU32,
}

/// Handle to an audio engine.
///
/// Dropping the handle terminates the engine: the hardware is stopped and
/// every later client call fails with [`AudioError::NoDevice`].
pub struct AudioEngine {
    shared: Arc<EngineShared>,
}

impl AudioEngine {
    /// Engine driven by `driver` with no owning device.
    pub fn new(
        config: EngineConfig,
        driver: Arc<dyn AudioDriver>,
        timers: Arc<dyn TimerService>,
    ) -> Result<Self> {
        Self::build(config, driver, timers, None)
    }

    /// Engine whose start/stop is reported to `device`.
    pub fn with_device(
        config: EngineConfig,
        driver: Arc<dyn AudioDriver>,
        timers: Arc<dyn TimerService>,
        device: Arc<dyn AudioDevice>,
    ) -> Result<Self> {
        Self::build(config, driver, timers, Some(device))
    }

    fn build(
        config: EngineConfig,
        driver: Arc<dyn AudioDriver>,
        timers: Arc<dyn TimerService>,
        device: Option<Arc<dyn AudioDevice>>,
    ) -> Result<Self> {
        let status = Arc::new(EngineStatus::new().map_err(|_| AudioError::NoMemory)?);
        let gate = CommandGate::new("engine-workloop").map_err(|_| AudioError::NoMemory)?;
        debug!(
            sample_rate = config.sample_rate_hz(),
            frames_per_buffer = config.num_sample_frames_per_buffer,
            "engine created"
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                driver,
                device,
                status,
                timers,
                gate,
                streams: RwLock::new(Vec::new()),
                core: Mutex::new(EngineCore {
                    state: EngineState::Stopped,
                    pause_count: 0,
                    num_active_clients: 0,
                    stop_position: None,
                    timer: None,
                }),
                clients: Mutex::new(Vec::new()),
                ports: Mutex::new(Vec::new()),
                active: AtomicBool::new(true),
                next_stream_id: AtomicU32::new(1),
                next_client_id: AtomicU32::new(1),
            }),
        })
    }

    /// Static configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Shared status block.
    pub fn status(&self) -> &Arc<EngineStatus> {
        &self.shared.status
    }

    /// Current run state.
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Whether the hardware is moving.
    pub fn is_running(&self) -> bool {
        self.shared.state().is_running()
    }

    /// Whether the engine still accepts work.
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Outstanding nested pauses.
    pub fn pause_count(&self) -> u32 {
        self.shared.core.lock().pause_count
    }

    /// Started user clients.
    pub fn num_active_clients(&self) -> u32 {
        self.shared.core.lock().num_active_clients
    }

    /// Pending delayed-stop target, if any.
    pub fn stop_position(&self) -> Option<RingPosition> {
        self.shared.core.lock().stop_position
    }

    /// Position the hardware is currently at.
    pub fn current_position(&self) -> RingPosition {
        self.shared.current_position()
    }

    /// Add an output stream starting at device channel `starting_channel_id`.
    pub fn add_output_stream(&self, starting_channel_id: u32, format: StreamFormat) -> Result<Arc<Stream>> {
        self.shared
            .add_stream(StreamDirection::Output, starting_channel_id, format)
    }

    /// Add an input stream starting at device channel `starting_channel_id`.
    pub fn add_input_stream(&self, starting_channel_id: u32, format: StreamFormat) -> Result<Arc<Stream>> {
        self.shared
            .add_stream(StreamDirection::Input, starting_channel_id, format)
    }

    /// Look up a stream.
    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.shared.stream(id)
    }

    /// Output streams, ordered by starting channel.
    pub fn output_streams(&self) -> Vec<Arc<Stream>> {
        self.shared.streams_in(StreamDirection::Output)
    }

    /// Input streams, ordered by starting channel.
    pub fn input_streams(&self) -> Vec<Arc<Stream>> {
        self.shared.streams_in(StreamDirection::Input)
    }

    /// Start the hardware, or resume it if paused.
    pub fn start(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .gate
            .run_action(move || shared.start_audio_engine())?
    }

    /// Stop the hardware.
    pub fn stop(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .gate
            .run_action(move || shared.stop_audio_engine())?
    }

    /// Pause the hardware. Pauses nest.
    pub fn pause(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .gate
            .run_action(move || shared.pause_audio_engine())?
    }

    /// Undo one [`AudioEngine::pause`].
    pub fn resume(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .gate
            .run_action(move || shared.resume_audio_engine())?
    }

    /// Switch a stream to `format`, optionally at a new sample rate.
    ///
    /// The engine is paused and every attached user client is locked for the
    /// duration, so client I/O waits until the switch completes.
    pub fn set_stream_format(
        &self,
        stream_id: StreamId,
        format: StreamFormat,
        sample_rate: Option<SampleRate>,
    ) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .gate
            .run_action(move || shared.set_stream_format(stream_id, format, sample_rate))?
    }

    /// Run one erase/flush pass immediately.
    pub fn run_periodic_pass(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared.gate.run_action(move || shared.perform_erase_and_flush())
    }

    /// Register a port for state-change notifications.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = unbounded();
        self.shared.add_notification_port(tx);
        rx
    }

    /// Open a new user client connection.
    pub fn new_user_client(&self) -> Result<UserClient> {
        if !self.shared.is_active() {
            return Err(AudioError::NoDevice);
        }
        let id = self.shared.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = UserClient::new(id, self.shared.clone());
        self.shared.clients.lock().push(client.downgrade());
        Ok(client)
    }

    /// Stop the hardware and refuse further work.
    pub fn terminate(&self) {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        let _ = self.shared.gate.run_action(move || {
            if shared.state() != EngineState::Stopped {
                let _ = shared.stop_audio_engine();
            }
        });
        push_log("engine terminated");
        info!("engine terminated");
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl EngineShared {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn status(&self) -> &Arc<EngineStatus> {
        &self.status
    }

    pub(crate) fn timers(&self) -> &Arc<dyn TimerService> {
        &self.timers
    }

    pub(crate) fn gate(&self) -> &CommandGate {
        &self.gate
    }

    pub(crate) fn frames_per_buffer(&self) -> u32 {
        self.config.num_sample_frames_per_buffer
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> EngineState {
        self.core.lock().state
    }

    pub(crate) fn current_position(&self) -> RingPosition {
        let frame = self.driver.current_sample_frame() % self.frames_per_buffer();
        RingPosition::new(self.status.current_loop_count(), frame)
    }

    pub(crate) fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams
            .read()
            .iter()
            .find(|stream| stream.id() == id)
            .cloned()
    }

    fn streams_in(&self, direction: StreamDirection) -> Vec<Arc<Stream>> {
        self.streams
            .read()
            .iter()
            .filter(|stream| stream.direction() == direction)
            .cloned()
            .collect()
    }

    fn add_stream(
        &self,
        direction: StreamDirection,
        starting_channel_id: u32,
        format: StreamFormat,
    ) -> Result<Arc<Stream>> {
        if !format.is_established() {
            return Err(AudioError::BadArgument("format has no channels"));
        }
        let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let stream = Arc::new(Stream::new(
            id,
            direction,
            starting_channel_id,
            format,
            self.frames_per_buffer(),
            self.driver.clone(),
        ));
        let mut streams = self.streams.write();
        streams.push(stream.clone());
        streams.sort_by(|a, b| compare_streams(a.starting_channel_id(), b.starting_channel_id()));
        debug!(
            stream = id.0,
            ?direction,
            starting_channel_id,
            channels = format.num_channels,
            "stream added"
        );
        Ok(stream)
    }

    pub(crate) fn add_notification_port(&self, port: Sender<Notification>) {
        self.ports.lock().push(port);
    }

    pub(crate) fn remove_client(&self, id: u32) {
        self.clients
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|client| client.id() != id));
    }

    fn live_clients(&self) -> Vec<Arc<ClientShared>> {
        let mut clients = self.clients.lock();
        clients.retain(|weak| weak.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify(&self, kind: NotificationKind, sender: Option<u32>) {
        let notification = Notification { kind, sender };
        self.ports
            .lock()
            .retain(|port| port.send(notification).is_ok());
    }

    fn start_audio_engine(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        match state {
            EngineState::Running | EngineState::Resumed => return Ok(()),
            EngineState::Paused => {
                self.core.lock().pause_count = 1;
                return self.resume_audio_engine();
            }
            EngineState::Stopped => {}
        }
        if !self.is_active() {
            return Err(AudioError::NoDevice);
        }

        if let Some(device) = &self.device {
            device.audio_engine_starting();
        }
        self.status.reset();
        for stream in self.streams.read().iter() {
            stream.reset_positions();
        }
        for client in self.live_clients() {
            client.reset_positions();
        }

        if let Err(err) = self.driver.perform_audio_engine_start(&self.status) {
            warn!(error = %err, "engine start failed");
            push_log(format!("engine start failed: {err}"));
            if let Some(device) = &self.device {
                device.audio_engine_stopped();
            }
            return Err(err.into());
        }

        {
            let mut core = self.core.lock();
            core.state = EngineState::Running;
            core.pause_count = 0;
            core.stop_position = None;
        }
        self.arm_timer();
        info!("engine started");
        push_log("engine started");
        self.notify(NotificationKind::Started, None);
        Ok(())
    }

    fn stop_audio_engine(self: &Arc<Self>) -> Result<()> {
        if self.state() == EngineState::Stopped {
            return Ok(());
        }
        let result = self.driver.perform_audio_engine_stop();
        if let Err(err) = &result {
            warn!(error = %err, "driver stop hook failed");
        }
        let timer = {
            let mut core = self.core.lock();
            core.state = EngineState::Stopped;
            core.pause_count = 0;
            core.stop_position = None;
            core.timer.take()
        };
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        self.erase_output();
        if let Some(device) = &self.device {
            device.audio_engine_stopped();
        }
        info!("engine stopped");
        push_log("engine stopped");
        self.notify(NotificationKind::Stopped, None);
        result.map_err(Into::into)
    }

    fn lock_streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().clone()
    }

    pub(crate) fn pause_audio_engine(self: &Arc<Self>) -> Result<()> {
        let outermost = {
            let mut core = self.core.lock();
            core.pause_count += 1;
            core.pause_count == 1 && core.state.is_running()
        };
        if !outermost {
            return Ok(());
        }
        let streams = self.lock_streams();
        let result = {
            let _guards: Vec<_> = streams.iter().map(|stream| stream.lock_for_io()).collect();
            self.driver.perform_audio_engine_pause()
        };
        if let Err(err) = result {
            self.core.lock().pause_count -= 1;
            warn!(error = %err, "pause failed");
            return Err(err.into());
        }
        let timer = {
            let mut core = self.core.lock();
            core.state = EngineState::Paused;
            core.timer.take()
        };
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        debug!("engine paused");
        push_log("engine paused");
        self.notify(NotificationKind::Paused, None);
        Ok(())
    }

    pub(crate) fn resume_audio_engine(self: &Arc<Self>) -> Result<()> {
        let outermost = {
            let mut core = self.core.lock();
            if core.pause_count == 0 {
                return Ok(());
            }
            core.pause_count -= 1;
            core.pause_count == 0 && core.state == EngineState::Paused
        };
        if !outermost {
            return Ok(());
        }
        let streams = self.lock_streams();
        let result = {
            let _guards: Vec<_> = streams.iter().map(|stream| stream.lock_for_io()).collect();
            self.driver.perform_audio_engine_resume(&self.status)
        };
        if let Err(err) = result {
            self.core.lock().pause_count += 1;
            warn!(error = %err, "resume failed");
            return Err(err.into());
        }
        self.core.lock().state = EngineState::Resumed;
        self.arm_timer();
        debug!("engine resumed");
        push_log("engine resumed");
        self.notify(NotificationKind::Resumed, None);
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>) {
        let deadline = self
            .timers
            .now_ns()
            .saturating_add(self.config.timer_interval_ns());
        let weak = Arc::downgrade(self);
        let id = self.timers.schedule(
            deadline,
            Box::new(move || {
                if let Some(engine) = weak.upgrade() {
                    let on_gate = engine.clone();
                    let _ = engine
                        .gate
                        .run_action(move || on_gate.timer_fired());
                }
            }),
        );
        let previous = self.core.lock().timer.replace(id);
        if let Some(previous) = previous {
            self.timers.cancel(previous);
        }
    }

    fn timer_fired(self: &Arc<Self>) {
        self.core.lock().timer = None;
        self.perform_erase_and_flush();
        if self.state().is_running() && self.core.lock().timer.is_none() {
            self.arm_timer();
        }
    }

    /// Erase played-out frames, commit anything clients have completed, and
    /// stop if a delayed stop is due.
    fn perform_erase_and_flush(self: &Arc<Self>) {
        if !self.state().is_running() {
            return;
        }
        self.erase_output();
        for stream in self.streams_in(StreamDirection::Output) {
            let _ = stream.clip_if_necessary();
        }
        self.perform_flush();
    }

    fn erase_output(&self) {
        if !self.config.erase_output {
            return;
        }
        let current = self.driver.current_sample_frame() % self.frames_per_buffer();
        let erase_head = self.status.erase_head_sample_frame();
        for stream in self.streams_in(StreamDirection::Output) {
            stream.erase_output_samples(erase_head, current);
        }
        self.status.set_erase_head_sample_frame(current);
    }

    fn perform_flush(self: &Arc<Self>) {
        let due = {
            let core = self.core.lock();
            match core.stop_position {
                Some(stop) if core.num_active_clients == 0 => self.current_position() >= stop,
                _ => false,
            }
        };
        if due {
            debug!("delayed stop reached");
            let _ = self.stop_audio_engine();
        }
    }

    /// Account for a user client starting; starts the hardware on the first.
    pub(crate) fn client_started(self: &Arc<Self>) -> Result<()> {
        if !self.is_active() {
            return Err(AudioError::NoDevice);
        }
        {
            let mut core = self.core.lock();
            core.num_active_clients += 1;
            core.stop_position = None;
        }
        if self.state() != EngineState::Stopped {
            return Ok(());
        }
        if let Err(err) = self.start_audio_engine() {
            self.core.lock().num_active_clients -= 1;
            return Err(err);
        }
        Ok(())
    }

    /// Account for a user client stopping; the last one schedules a stop one
    /// ring traversal ahead so queued output can drain.
    pub(crate) fn client_stopped(self: &Arc<Self>) {
        let running = self.state().is_running();
        let mut core = self.core.lock();
        core.num_active_clients = core.num_active_clients.saturating_sub(1);
        if core.num_active_clients == 0 && running {
            let stop = self
                .current_position()
                .advanced_by(self.frames_per_buffer() as u64, self.frames_per_buffer());
            core.stop_position = Some(stop);
            debug!(
                loop_count = stop.loop_count,
                sample_frame = stop.sample_frame,
                "delayed stop scheduled"
            );
        }
    }

    fn set_stream_format(
        self: &Arc<Self>,
        stream_id: StreamId,
        format: StreamFormat,
        sample_rate: Option<SampleRate>,
    ) -> Result<()> {
        let stream = self
            .stream(stream_id)
            .ok_or(AudioError::BadArgument("unknown stream"))?;
        {
            let st = stream.lock_for_io();
            stream.validate_format_locked(&st, &format, sample_rate)?;
        }

        self.pause_audio_engine()?;
        let result = self.swap_stream_format(&stream, format, sample_rate);
        let resumed = self.resume_audio_engine();
        result?;
        resumed?;

        push_log(format!("stream {} format changed", stream_id.0));
        self.notify(NotificationKind::FormatChanged, Some(stream_id.0));
        Ok(())
    }

    fn swap_stream_format(
        &self,
        stream: &Arc<Stream>,
        format: StreamFormat,
        sample_rate: Option<SampleRate>,
    ) -> Result<()> {
        let clients: Vec<_> = self
            .live_clients()
            .into_iter()
            .filter(|client| client.uses_stream(stream.id()))
            .collect();
        let _client_guards: Vec<_> = clients.iter().map(|client| client.lock_buffers()).collect();
        let mut st = stream.lock_for_io();
        // Clients may have attached between validation and the lock.
        stream.validate_format_locked(&st, &format, sample_rate)?;
        let info = stream.info_from_state(&st);
        self.driver
            .perform_format_change(&info, &format, sample_rate)?;
        stream.apply_format_locked(&mut st, format)
    }
}
