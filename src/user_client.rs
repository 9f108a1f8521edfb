//! User client connections: buffer registration, the real-time I/O entry
//! point and the per-buffer-set watchdog.
//!
//! Each buffer set carries a generation counter. Every arm of its watchdog
//! bumps the counter and hands the new value to the timer callback; a fire
//! whose generation no longer matches lost a race against real client I/O and
//! does nothing.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::client_list::{BufferOwner, ClientKey};
use crate::engine::{EngineShared, Notification};
use crate::error::{AudioError, Result};
use crate::memory::{ClientMemory, DESCRIPTOR_SIZE};
use crate::position::{Position, RingPosition};
use crate::stream::{Stream, StreamDirection, StreamId, capacity_for};
use crate::timer::TimerId;

/// Time per sample frame as 32.32 fixed-point nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleInterval(u64);

impl SampleInterval {
    /// Interval from the high and low words passed through the I/O trap.
    pub const fn from_parts(hi: u32, lo: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }

    /// Interval of one frame at `sample_rate` Hz.
    pub fn from_sample_rate(sample_rate: u32) -> Self {
        if sample_rate == 0 {
            return Self(0);
        }
        Self(((1_000_000_000u128 << 32) / sample_rate as u128) as u64)
    }

    /// Raw 32.32 value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Whether the client supplied no interval.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Nanoseconds spanned by `frames` frames.
    pub fn frames_to_ns(&self, frames: u64) -> u64 {
        ((frames as u128 * self.0 as u128) >> 32).min(u64::MAX as u128) as u64
    }
}

struct ClientBuffer {
    stream: Arc<Stream>,
    memory: Arc<ClientMemory>,
    data_bytes: usize,
    key: Option<ClientKey>,
}

impl ClientBuffer {
    fn attach(&mut self, owner: BufferOwner) -> Result<()> {
        if self.key.is_none() {
            self.key = Some(
                self.stream
                    .add_client(self.memory.clone(), self.data_bytes, owner)?,
            );
        }
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.stream.remove_client(key);
        }
    }

    fn capacity_frames(&self) -> u32 {
        capacity_for(&self.stream.format(), self.data_bytes)
    }
}

struct ClientBufferSet {
    id: u32,
    outputs: Vec<ClientBuffer>,
    inputs: Vec<ClientBuffer>,
    next_output_position: Position,
    sample_interval: SampleInterval,
    last_output_frames: u32,
    generation: u64,
    watchdog: Option<TimerId>,
    watchdog_enabled: bool,
}

impl ClientBufferSet {
    fn new(id: u32) -> Self {
        Self {
            id,
            outputs: Vec::new(),
            inputs: Vec::new(),
            next_output_position: Position::Unset,
            sample_interval: SampleInterval::default(),
            last_output_frames: 0,
            generation: 0,
            watchdog: None,
            watchdog_enabled: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.inputs.is_empty()
    }

    fn buffers_mut(&mut self) -> impl Iterator<Item = &mut ClientBuffer> {
        self.outputs.iter_mut().chain(self.inputs.iter_mut())
    }
}

pub(crate) struct ClientState {
    online: bool,
    sets: BTreeMap<u32, ClientBufferSet>,
}

/// Engine-side state of one user client, shared with its watchdog timers.
pub(crate) struct ClientShared {
    id: u32,
    engine: Arc<EngineShared>,
    buffers: ReentrantMutex<RefCell<ClientState>>,
}

/// One user-space connection to an engine.
///
/// Dropping the client closes it.
pub struct UserClient {
    shared: Arc<ClientShared>,
}

impl UserClient {
    pub(crate) fn new(id: u32, engine: Arc<EngineShared>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                id,
                engine,
                buffers: ReentrantMutex::new(RefCell::new(ClientState {
                    online: false,
                    sets: BTreeMap::new(),
                })),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientShared> {
        Arc::downgrade(&self.shared)
    }

    /// Connection identifier, unique within the engine.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Whether the client has been started.
    pub fn is_online(&self) -> bool {
        self.shared.lock_buffers().borrow().online
    }

    /// Number of buffer sets with at least one registered buffer.
    pub fn buffer_set_count(&self) -> usize {
        self.shared.lock_buffers().borrow().sets.len()
    }

    /// Next position the watchdog or the client's I/O will cover for `buffer_set_id`.
    pub fn next_output_position(&self, buffer_set_id: u32) -> Option<Position> {
        let guard = self.shared.lock_buffers();
        let state = guard.borrow();
        state
            .sets
            .get(&buffer_set_id)
            .map(|set| set.next_output_position)
    }

    /// Generation counter of a buffer set's watchdog.
    pub fn watchdog_generation(&self, buffer_set_id: u32) -> Option<u64> {
        let guard = self.shared.lock_buffers();
        let state = guard.borrow();
        state.sets.get(&buffer_set_id).map(|set| set.generation)
    }

    /// Whether a buffer set's watchdog is armed.
    pub fn watchdog_armed(&self, buffer_set_id: u32) -> bool {
        let guard = self.shared.lock_buffers();
        let state = guard.borrow();
        state
            .sets
            .get(&buffer_set_id)
            .is_some_and(|set| set.watchdog.is_some())
    }

    /// Stream-side keys of a buffer set's attached output buffers.
    pub fn output_keys(&self, buffer_set_id: u32) -> Vec<ClientKey> {
        let guard = self.shared.lock_buffers();
        let state = guard.borrow();
        state
            .sets
            .get(&buffer_set_id)
            .map(|set| set.outputs.iter().filter_map(|buffer| buffer.key).collect())
            .unwrap_or_default()
    }

    /// Receive engine state-change notifications on `port`.
    pub fn register_notification_port(&self, port: Sender<Notification>) {
        self.shared.engine.add_notification_port(port);
    }

    /// Register `size` bytes of `memory` (header included) as a client buffer
    /// on `stream_id` within buffer set `buffer_set_id`.
    pub fn register_client_buffer(
        &self,
        stream_id: StreamId,
        memory: Arc<ClientMemory>,
        size: usize,
        buffer_set_id: u32,
    ) -> Result<()> {
        let engine = &self.shared.engine;
        if !engine.is_active() {
            return Err(AudioError::NoDevice);
        }
        if memory.is_empty() || size <= DESCRIPTOR_SIZE {
            return Err(AudioError::BadArgument("buffer too small for header"));
        }
        if size > memory.len() {
            return Err(AudioError::BadArgument("buffer size exceeds mapped region"));
        }
        let stream = engine
            .stream(stream_id)
            .ok_or(AudioError::BadArgument("unknown stream"))?;
        let format = stream.format();
        if !format.is_established() {
            return Err(AudioError::BadArgument("stream format not established"));
        }
        let data_bytes = size - DESCRIPTOR_SIZE;
        if capacity_for(&format, data_bytes) == 0 {
            return Err(AudioError::BadArgument("buffer holds no whole frame"));
        }
        let direction = stream.direction();
        if direction == StreamDirection::Output && !format.is_mixable && stream.num_clients() > 0 {
            return Err(AudioError::ExclusiveAccess);
        }

        let guard = self.shared.lock_buffers();
        let mut state = guard.borrow_mut();
        let mut buffer = ClientBuffer {
            stream,
            memory,
            data_bytes,
            key: None,
        };
        if state.online {
            buffer.attach(BufferOwner {
                user_client: self.shared.id,
                buffer_set: buffer_set_id,
            })?;
        }
        let set = state
            .sets
            .entry(buffer_set_id)
            .or_insert_with(|| ClientBufferSet::new(buffer_set_id));
        match direction {
            StreamDirection::Output => {
                set.watchdog_enabled = true;
                set.outputs.push(buffer);
            }
            StreamDirection::Input => set.inputs.push(buffer),
        }
        debug!(
            client = self.shared.id,
            stream = stream_id.0,
            buffer_set = buffer_set_id,
            size,
            "client buffer registered"
        );
        Ok(())
    }

    /// Remove every buffer of `buffer_set_id` registered on `stream_id`.
    pub fn unregister_client_buffer(&self, stream_id: StreamId, buffer_set_id: u32) -> Result<()> {
        let guard = self.shared.lock_buffers();
        let mut state = guard.borrow_mut();
        let set = state
            .sets
            .get_mut(&buffer_set_id)
            .ok_or(AudioError::BadArgument("unknown buffer set"))?;
        let before = set.outputs.len() + set.inputs.len();
        for list in [&mut set.outputs, &mut set.inputs] {
            list.retain_mut(|buffer| {
                if buffer.stream.id() == stream_id {
                    buffer.detach();
                    false
                } else {
                    true
                }
            });
        }
        if set.outputs.len() + set.inputs.len() == before {
            return Err(AudioError::BadArgument("no buffer registered on stream"));
        }
        if set.outputs.is_empty() {
            self.shared.cancel_watchdog(set);
            set.watchdog_enabled = false;
        }
        if set.is_empty() {
            state.sets.remove(&buffer_set_id);
        }
        Ok(())
    }

    /// Go online: count as an active client (starting the engine if needed)
    /// and attach every registered buffer to its stream.
    pub fn start(&self) -> Result<()> {
        let engine = self.shared.engine.clone();
        if !engine.is_active() {
            return Err(AudioError::NoDevice);
        }
        if self.is_online() {
            return Ok(());
        }
        let on_gate = engine.clone();
        engine
            .gate()
            .run_action(move || on_gate.client_started())??;

        let guard = self.shared.lock_buffers();
        let attached = {
            let mut state = guard.borrow_mut();
            let client_id = self.shared.id;
            let mut result = Ok(());
            'sets: for set in state.sets.values_mut() {
                let owner = BufferOwner {
                    user_client: client_id,
                    buffer_set: set.id,
                };
                for buffer in set.buffers_mut() {
                    if let Err(err) = buffer.attach(owner) {
                        result = Err(err);
                        break 'sets;
                    }
                }
            }
            match result {
                Ok(()) => {
                    state.online = true;
                    Ok(())
                }
                Err(err) => {
                    for set in state.sets.values_mut() {
                        set.buffers_mut().for_each(ClientBuffer::detach);
                    }
                    Err(err)
                }
            }
        };
        drop(guard);

        if let Err(err) = attached {
            warn!(client = self.shared.id, error = %err, "client start failed");
            let on_gate = engine.clone();
            let _ = engine.gate().run_action(move || on_gate.client_stopped());
            return Err(err);
        }
        debug!(client = self.shared.id, "client started");
        Ok(())
    }

    /// Go offline: detach every buffer and cancel watchdogs. The engine stops
    /// one ring traversal after its last client goes offline.
    pub fn stop(&self) -> Result<()> {
        {
            let guard = self.shared.lock_buffers();
            let mut state = guard.borrow_mut();
            if !state.online {
                return Ok(());
            }
            state.online = false;
            for set in state.sets.values_mut() {
                self.shared.cancel_watchdog(set);
                set.next_output_position = Position::Unset;
                set.buffers_mut().for_each(ClientBuffer::detach);
            }
        }
        let engine = self.shared.engine.clone();
        let on_gate = engine.clone();
        engine.gate().run_action(move || on_gate.client_stopped())?;
        debug!(client = self.shared.id, "client stopped");
        Ok(())
    }

    /// Stop, drop every buffer set and leave the engine.
    pub fn close(&self) {
        let _ = self.stop();
        {
            let guard = self.shared.lock_buffers();
            let mut state = guard.borrow_mut();
            for set in state.sets.values_mut() {
                self.shared.cancel_watchdog(set);
            }
            state.sets.clear();
        }
        self.shared.engine.remove_client(self.shared.id);
    }

    /// Real-time I/O entry point.
    ///
    /// For output, mixes every output buffer of `buffer_set_id` at
    /// (`loop_count`, `first_sample_frame`) and re-arms the set's watchdog.
    /// For input, fills every input buffer from the hardware ring.
    pub fn perform_client_io(
        &self,
        first_sample_frame: u32,
        loop_count: u32,
        input_io: bool,
        buffer_set_id: u32,
        sample_interval: SampleInterval,
    ) -> Result<()> {
        let engine = &self.shared.engine;
        if !engine.is_active() {
            return Err(AudioError::NoDevice);
        }
        let guard = self.shared.lock_buffers();
        let mut state = guard.borrow_mut();
        if !state.online {
            return Err(AudioError::Offline);
        }
        if !engine.state().is_running() {
            return Err(AudioError::NotReady);
        }
        if first_sample_frame >= engine.frames_per_buffer() {
            return Err(AudioError::BadArgument("first sample frame out of range"));
        }
        let set = state
            .sets
            .get_mut(&buffer_set_id)
            .ok_or(AudioError::BadArgument("unknown buffer set"))?;

        if input_io {
            self.shared
                .perform_client_input(set, first_sample_frame, loop_count)
        } else {
            self.shared.perform_client_output(
                set,
                first_sample_frame,
                loop_count,
                sample_interval,
            )
        }
    }

    /// Run the watchdog pass for `buffer_set_id` as if its timer fired with
    /// `generation`. Lets harnesses replay a fire that raced a real cycle.
    #[doc(hidden)]
    pub fn fire_watchdog(&self, buffer_set_id: u32, generation: u64) {
        self.shared.watchdog_fired(buffer_set_id, generation);
    }
}

impl Drop for UserClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientShared {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Take the recursive buffer lock. Second in the lock order.
    pub(crate) fn lock_buffers(&self) -> ReentrantMutexGuard<'_, RefCell<ClientState>> {
        self.buffers.lock()
    }

    pub(crate) fn uses_stream(&self, stream_id: StreamId) -> bool {
        let guard = self.lock_buffers();
        let state = guard.borrow();
        state.sets.values().any(|set| {
            set.outputs
                .iter()
                .chain(set.inputs.iter())
                .any(|buffer| buffer.stream.id() == stream_id)
        })
    }

    /// Forget where every set expects its next output; the engine is
    /// restarting from loop zero.
    pub(crate) fn reset_positions(&self) {
        let guard = self.lock_buffers();
        let mut state = guard.borrow_mut();
        for set in state.sets.values_mut() {
            self.cancel_watchdog(set);
            set.next_output_position = Position::Unset;
        }
    }

    fn perform_client_output(
        self: &Arc<Self>,
        set: &mut ClientBufferSet,
        first_sample_frame: u32,
        loop_count: u32,
        sample_interval: SampleInterval,
    ) -> Result<()> {
        // Validate every buffer before touching any stream.
        let mut plan = Vec::with_capacity(set.outputs.len());
        for buffer in &set.outputs {
            let Some(key) = buffer.key else {
                continue;
            };
            let capacity = buffer.capacity_frames();
            let descriptor = buffer.memory.descriptor();
            let frames = match descriptor.actual_num_sample_frames {
                0 => capacity,
                frames => frames,
            };
            if frames > capacity {
                return Err(AudioError::BadArgument("frame count exceeds buffer capacity"));
            }
            if descriptor.actual_data_byte_size > descriptor.total_data_byte_size
                || descriptor.total_data_byte_size as usize > buffer.data_bytes
            {
                return Err(AudioError::BadArgument("declared size exceeds buffer"));
            }
            plan.push((key, frames));
        }

        // Every buffer takes the cycle; the first failure is reported once the
        // set's position and watchdog are up to date.
        let mut frames_done = 0;
        let mut first_error = None;
        for (buffer, (key, frames)) in set
            .outputs
            .iter()
            .filter(|buffer| buffer.key.is_some())
            .zip(plan)
        {
            match buffer.stream.process_output_samples(
                key,
                first_sample_frame,
                loop_count,
                frames,
                true,
            ) {
                Ok(()) => frames_done = frames_done.max(frames),
                Err(err) => {
                    warn!(
                        client = self.id,
                        buffer_set = set.id,
                        stream = buffer.stream.id().0,
                        error = %err,
                        "client output failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        let n = self.engine.frames_per_buffer();
        let start = RingPosition::new(loop_count, first_sample_frame);
        set.next_output_position = Position::At(start.advanced_by(frames_done as u64, n));
        set.last_output_frames = frames_done;
        set.sample_interval = if sample_interval.is_zero() {
            SampleInterval::from_sample_rate(self.engine.config().sample_rate_hz())
        } else {
            sample_interval
        };

        if set.watchdog_enabled && frames_done > 0 {
            let deadline = self.calculate_sample_timeout(set);
            self.set_watchdog_timeout(set, deadline);
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        for buffer in &set.outputs {
            if let Some(status) = buffer.stream.take_clip_status() {
                return Err(status.into());
            }
        }
        Ok(())
    }

    fn perform_client_input(
        &self,
        set: &mut ClientBufferSet,
        first_sample_frame: u32,
        loop_count: u32,
    ) -> Result<()> {
        for buffer in &set.inputs {
            let Some(key) = buffer.key else {
                continue;
            };
            let capacity = buffer.capacity_frames();
            let frames = match buffer.memory.descriptor().actual_num_sample_frames {
                0 => capacity,
                frames => frames.min(capacity),
            };
            buffer
                .stream
                .read_input_samples(key, first_sample_frame, loop_count, frames)?;
        }
        Ok(())
    }

    /// When the hardware will be a lead margin short of the set's next
    /// expected position, on the timer service's clock.
    fn calculate_sample_timeout(&self, set: &ClientBufferSet) -> u64 {
        let now = self.engine.timers().now_ns();
        let Position::At(next) = set.next_output_position else {
            return now;
        };
        let n = self.engine.frames_per_buffer();
        let frames = set.last_output_frames as u64;
        let lead = frames * self.engine.config().watchdog_lead_percent as u64 / 100;
        let target = next.absolute(n).saturating_sub(lead);
        let (loop_count, loop_time) = self.engine.status().loop_count_and_time_stamp();
        let deadline = if loop_time == 0 {
            now.saturating_add(set.sample_interval.frames_to_ns(frames))
        } else {
            let loop_start = loop_count as u64 * n as u64;
            loop_time.saturating_add(
                set.sample_interval
                    .frames_to_ns(target.saturating_sub(loop_start)),
            )
        };
        deadline.max(now)
    }

    /// Arm the set's watchdog for `deadline_ns`, invalidating any earlier arm.
    fn set_watchdog_timeout(self: &Arc<Self>, set: &mut ClientBufferSet, deadline_ns: u64) {
        self.cancel_watchdog(set);
        let generation = set.generation;
        let set_id = set.id;
        let weak = Arc::downgrade(self);
        let id = self.engine.timers().schedule(
            deadline_ns,
            Box::new(move || {
                if let Some(client) = weak.upgrade() {
                    client.watchdog_fired(set_id, generation);
                }
            }),
        );
        set.watchdog = Some(id);
        trace!(
            client = self.id,
            buffer_set = set_id,
            generation,
            deadline_ns,
            "watchdog armed"
        );
    }

    /// Cancel the set's watchdog. Safe to repeat; always invalidates a fire
    /// that may already be running.
    fn cancel_watchdog(&self, set: &mut ClientBufferSet) {
        set.generation = set.generation.wrapping_add(1);
        if let Some(id) = set.watchdog.take() {
            self.engine.timers().cancel(id);
        }
    }

    pub(crate) fn watchdog_fired(self: &Arc<Self>, set_id: u32, generation: u64) {
        let guard = self.lock_buffers();
        let mut state = guard.borrow_mut();
        if !state.online {
            return;
        }
        let Some(set) = state.sets.get_mut(&set_id) else {
            return;
        };
        if set.generation != generation {
            trace!(client = self.id, buffer_set = set_id, "stale watchdog fire ignored");
            return;
        }
        set.watchdog = None;
        if !self.engine.state().is_running() {
            return;
        }
        self.perform_watchdog_output(set);
    }

    /// Carry the set's buffers forward one cycle without new data, so the
    /// streams keep clipping while the client is stalled.
    fn perform_watchdog_output(self: &Arc<Self>, set: &mut ClientBufferSet) {
        let n = self.engine.frames_per_buffer();
        let position = match set.next_output_position {
            Position::At(next) => next,
            Position::Unset => self.engine.current_position(),
        };
        let mut frames = set.last_output_frames;
        for buffer in &set.outputs {
            let Some(key) = buffer.key else {
                continue;
            };
            let buffer_frames = match set.last_output_frames {
                0 => buffer.capacity_frames(),
                frames => frames,
            };
            frames = frames.max(buffer_frames);
            if let Err(err) = buffer.stream.process_output_samples(
                key,
                position.sample_frame,
                position.loop_count,
                buffer_frames,
                false,
            ) {
                warn!(client = self.id, buffer_set = set.id, error = %err, "watchdog output failed");
            }
        }
        if frames == 0 {
            return;
        }
        set.last_output_frames = frames;
        set.next_output_position = Position::At(position.advanced_by(frames as u64, n));
        if set.sample_interval.is_zero() {
            set.sample_interval =
                SampleInterval::from_sample_rate(self.engine.config().sample_rate_hz());
        }
        debug!(
            client = self.id,
            buffer_set = set.id,
            loop_count = position.loop_count,
            sample_frame = position.sample_frame,
            frames,
            "watchdog advanced stalled buffer set"
        );
        let deadline = self.calculate_sample_timeout(set);
        self.set_watchdog_timeout(set, deadline);
    }
}
