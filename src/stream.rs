//! Streams: a hardware sample buffer, an optional float mix buffer, and the
//! client buffers feeding or draining them.
//!
//! Output streams mix every attached client into the mix buffer and commit
//! ("clip") the mix into the hardware buffer only as far as the slowest
//! client has delivered. Non-mixable output streams accept a single client
//! whose native-format data is passed straight through.
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::client_list::{BufferOwner, ClientEntry, ClientKey, ClientList};
use crate::convert::{self, ClipSource, mix_output_samples};
use crate::driver::AudioDriver;
use crate::error::{AudioError, ClipError, Result};
use crate::format::{AvailableFormat, SampleRate, StreamFormat};
use crate::memory::ClientMemory;
use crate::position::{Position, RingPosition, ring_spans};

/// Most frames one clip pass may pull from a non-mixable client buffer.
pub const MIX_BUFFER_MAX_SIZE: u32 = 2043;

/// Direction of sample flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Clients write, hardware plays.
    Output,
    /// Hardware records, clients read.
    Input,
}

/// Identifier of a stream within its engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Snapshot of a stream's identity and format.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Stream identifier.
    pub id: StreamId,
    /// Sample flow direction.
    pub direction: StreamDirection,
    /// First device channel carried by this stream.
    pub starting_channel_id: u32,
    /// Current format.
    pub format: StreamFormat,
    /// Attached client buffers.
    pub num_clients: usize,
    /// How far output has been committed to the hardware buffer.
    pub clipped_position: Position,
}

/// Custom clip stage. Registered functions run in order instead of the
/// driver's clip hook; the first failure stops the chain.
pub type AudioIoFunction =
    Arc<dyn Fn(ClipSource<'_>, &mut [u8], &StreamFormat) -> Result<(), ClipError> + Send + Sync>;

struct NativeSource {
    memory: Arc<ClientMemory>,
    start: u64,
    frames: u32,
}

pub(crate) struct StreamState {
    format: StreamFormat,
    available_formats: Vec<AvailableFormat>,
    sample_buffer: Vec<u8>,
    mix_buffer: Option<Vec<f32>>,
    clients: ClientList,
    clipped_position: Position,
    native_source: Option<NativeSource>,
    io_functions: Vec<AudioIoFunction>,
    clip_status: Option<ClipError>,
}

/// One hardware stream of an engine.
pub struct Stream {
    id: StreamId,
    direction: StreamDirection,
    starting_channel_id: u32,
    frames_per_buffer: u32,
    driver: Arc<dyn AudioDriver>,
    state: Mutex<StreamState>,
}

fn silent_buffer(format: &StreamFormat, frames: u32) -> Vec<u8> {
    let mut buffer = vec![0u8; format.bytes_per_frame() * frames as usize];
    convert::write_silence(&mut buffer, format);
    buffer
}

fn zeroed_mix_buffer(channels: u32, frames: u32) -> Result<Vec<f32>> {
    let len = channels as usize * frames as usize;
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| AudioError::NoMemory)?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        direction: StreamDirection,
        starting_channel_id: u32,
        format: StreamFormat,
        frames_per_buffer: u32,
        driver: Arc<dyn AudioDriver>,
    ) -> Self {
        Self {
            id,
            direction,
            starting_channel_id,
            frames_per_buffer,
            driver,
            state: Mutex::new(StreamState {
                format,
                available_formats: Vec::new(),
                sample_buffer: silent_buffer(&format, frames_per_buffer),
                mix_buffer: None,
                clients: ClientList::default(),
                clipped_position: Position::Unset,
                native_source: None,
                io_functions: Vec::new(),
                clip_status: None,
            }),
        }
    }

    /// Stream identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Sample flow direction.
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// First device channel carried by this stream.
    pub fn starting_channel_id(&self) -> u32 {
        self.starting_channel_id
    }

    /// Frames in the hardware ring.
    pub fn frames_per_buffer(&self) -> u32 {
        self.frames_per_buffer
    }

    /// Acquire the stream's I/O lock. Last in the lock order.
    pub(crate) fn lock_for_io(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock()
    }

    /// Current format.
    pub fn format(&self) -> StreamFormat {
        self.state.lock().format
    }

    /// Identity, format and client count.
    pub fn info(&self) -> StreamInfo {
        let st = self.state.lock();
        self.info_locked(&st)
    }

    fn info_locked(&self, st: &StreamState) -> StreamInfo {
        StreamInfo {
            id: self.id,
            direction: self.direction,
            starting_channel_id: self.starting_channel_id,
            format: st.format,
            num_clients: st.clients.len(),
            clipped_position: st.clipped_position,
        }
    }

    /// Attached client buffers.
    pub fn num_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// How far output has been committed to the hardware buffer.
    pub fn clipped_position(&self) -> Position {
        self.state.lock().clipped_position
    }

    /// How far `key`'s data has been folded into the mix.
    pub fn mixed_position(&self, key: ClientKey) -> Option<Position> {
        self.state
            .lock()
            .clients
            .get(key)
            .map(|entry| entry.mixed_position)
    }

    /// Attached buffers ordered by mixed position, slowest first.
    pub fn clip_order(&self) -> Vec<(ClientKey, BufferOwner, Position)> {
        self.state
            .lock()
            .clients
            .iter_sorted()
            .map(|(key, entry)| (key, entry.owner, entry.mixed_position))
            .collect()
    }

    /// Whether a float mix buffer is currently allocated.
    pub fn has_mix_buffer(&self) -> bool {
        self.state.lock().mix_buffer.is_some()
    }

    /// Copy of the mix buffer, if allocated.
    pub fn mix_buffer_snapshot(&self) -> Option<Vec<f32>> {
        self.state.lock().mix_buffer.clone()
    }

    /// Copy of the hardware sample buffer.
    pub fn sample_buffer_snapshot(&self) -> Vec<u8> {
        self.state.lock().sample_buffer.clone()
    }

    /// Run `f` over the hardware sample buffer.
    pub fn with_sample_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.state.lock().sample_buffer)
    }

    /// Run `f` over the mutable hardware sample buffer. Drivers use this to
    /// deposit captured input.
    pub fn with_sample_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.state.lock().sample_buffer)
    }

    /// Advertise a format this stream can switch to.
    pub fn add_available_format(&self, format: StreamFormat, min_rate: SampleRate, max_rate: SampleRate) {
        self.state.lock().available_formats.push(AvailableFormat {
            format,
            min_rate,
            max_rate,
        });
    }

    /// Formats this stream can switch to.
    pub fn available_formats(&self) -> Vec<AvailableFormat> {
        self.state.lock().available_formats.clone()
    }

    /// Replace the custom clip chain. An empty chain restores the driver hook.
    pub fn set_io_functions(&self, functions: Vec<AudioIoFunction>) {
        self.state.lock().io_functions = functions;
    }

    /// Attach a client buffer whose first `data_bytes` bytes of sample data
    /// are in use.
    pub fn add_client(
        &self,
        memory: Arc<ClientMemory>,
        data_bytes: usize,
        owner: BufferOwner,
    ) -> Result<ClientKey> {
        let mut st = self.state.lock();
        self.add_client_locked(&mut st, memory, data_bytes, owner)
    }

    pub(crate) fn add_client_locked(
        &self,
        st: &mut StreamState,
        memory: Arc<ClientMemory>,
        data_bytes: usize,
        owner: BufferOwner,
    ) -> Result<ClientKey> {
        if data_bytes > memory.data_len() {
            return Err(AudioError::BadArgument("buffer size exceeds mapped region"));
        }
        let capacity_frames = capacity_for(&st.format, data_bytes);
        if capacity_frames == 0 {
            return Err(AudioError::BadArgument("buffer holds no whole frame"));
        }
        if self.direction == StreamDirection::Output {
            if !st.format.is_mixable && !st.clients.is_empty() {
                return Err(AudioError::ExclusiveAccess);
            }
            if st.format.is_mixable && st.mix_buffer.is_none() {
                st.mix_buffer = Some(zeroed_mix_buffer(
                    st.format.num_channels,
                    self.frames_per_buffer,
                )?);
            }
        }
        let key = st.clients.insert(ClientEntry {
            memory,
            data_bytes,
            capacity_frames,
            mixed_position: Position::Unset,
            owner,
        });
        debug!(
            stream = self.id.0,
            num_clients = st.clients.len(),
            user_client = owner.user_client,
            buffer_set = owner.buffer_set,
            "client buffer attached"
        );
        Ok(key)
    }

    /// Detach a client buffer.
    pub fn remove_client(&self, key: ClientKey) -> Result<()> {
        let mut st = self.state.lock();
        self.remove_client_locked(&mut st, key)
    }

    pub(crate) fn remove_client_locked(&self, st: &mut StreamState, key: ClientKey) -> Result<()> {
        let was_head = st.clients.head_key() == Some(key);
        let removed = st
            .clients
            .remove(key)
            .ok_or(AudioError::BadArgument("unknown client buffer"))?;
        if st
            .native_source
            .as_ref()
            .is_some_and(|source| Arc::ptr_eq(&source.memory, &removed.memory))
        {
            st.native_source = None;
        }
        debug!(
            stream = self.id.0,
            num_clients = st.clients.len(),
            "client buffer detached"
        );
        if st.clients.is_empty() {
            Self::reset_clip_info_locked(st);
            st.mix_buffer = None;
        } else if was_head {
            // The slowest contributor left; the next one may allow more output.
            let _ = self.clip_if_necessary_locked(st);
        }
        Ok(())
    }

    /// Fold one client's output for the current I/O cycle into the stream.
    ///
    /// With `samples_available` false nothing is mixed; the client's position
    /// is only carried forward so the rest of the stream can keep clipping.
    pub fn process_output_samples(
        &self,
        key: ClientKey,
        first_sample_frame: u32,
        loop_count: u32,
        num_sample_frames: u32,
        samples_available: bool,
    ) -> Result<()> {
        let mut st = self.state.lock();
        self.process_output_samples_locked(
            &mut st,
            key,
            first_sample_frame,
            loop_count,
            num_sample_frames,
            samples_available,
        )
    }

    pub(crate) fn process_output_samples_locked(
        &self,
        st: &mut StreamState,
        key: ClientKey,
        first_sample_frame: u32,
        loop_count: u32,
        num_sample_frames: u32,
        samples_available: bool,
    ) -> Result<()> {
        let n = self.frames_per_buffer;
        if first_sample_frame >= n {
            return Err(AudioError::BadArgument("first sample frame out of range"));
        }
        let (memory, capacity, previous) = match st.clients.get(key) {
            Some(entry) => (
                entry.memory.clone(),
                entry.capacity_frames,
                entry.mixed_position,
            ),
            None => return Err(AudioError::BadArgument("unknown client buffer")),
        };
        let num_frames = num_sample_frames.min(capacity).min(n);
        let requested = RingPosition::new(loop_count, first_sample_frame);

        let start = match previous {
            Position::Unset => requested,
            Position::At(mixed) if samples_available => {
                self.resync_start(st, key, requested, mixed, num_frames)
            }
            Position::At(_) => requested,
        };
        let end = start.advanced_by(num_frames as u64, n);

        if !st.clipped_position.is_set() {
            st.clipped_position = Position::At(start);
        }

        let mut skip = 0u32;
        if let Position::At(clipped) = st.clipped_position
            && start < clipped
        {
            let behind = start.frames_until(&clipped, n);
            skip = behind.min(num_frames as u64) as u32;
            if samples_available {
                warn!(
                    stream = self.id.0,
                    behind,
                    discarded = skip,
                    "client samples arrived after clipping passed them"
                );
            }
        }
        let to_mix = num_frames - skip;

        if samples_available && to_mix > 0 {
            let mix_start = start.advanced_by(skip as u64, n);
            if st.format.is_mixable {
                self.mix_client_samples(st, &memory, skip, mix_start.sample_frame, to_mix)?;
            } else {
                st.native_source = Some(NativeSource {
                    memory,
                    start: start.absolute(n),
                    frames: num_frames,
                });
            }
        }

        let mixed = match previous {
            Position::At(prev) if prev > end => prev,
            _ => end,
        };
        if let Some(entry) = st.clients.get_mut(key) {
            entry.mixed_position = Position::At(mixed);
        }
        st.clients.reposition(key);
        trace!(
            stream = self.id.0,
            loop_count = mixed.loop_count,
            sample_frame = mixed.sample_frame,
            samples_available,
            "client mixed position"
        );

        // Failures stay recorded in clip_status for the client I/O path.
        let _ = self.clip_if_necessary_locked(st);
        Ok(())
    }

    /// Pick where this cycle's data really starts.
    ///
    /// A frame that wrapped without the client bumping its loop count is moved
    /// into the next loop, and a client that has fallen more than a whole ring
    /// behind every other attached client is pulled up to their loop.
    ///
    /// A same-loop request only counts as a missed wrap when its next-loop
    /// position lies within one cycle of where the client left off. Anything
    /// else is a late cycle and stays in its loop.
    fn resync_start(
        &self,
        st: &StreamState,
        key: ClientKey,
        requested: RingPosition,
        mixed: RingPosition,
        num_frames: u32,
    ) -> RingPosition {
        let n = self.frames_per_buffer;
        let mut start = requested;
        let wrapped = RingPosition::new(mixed.loop_count.wrapping_add(1), requested.sample_frame);
        if requested.loop_count == mixed.loop_count
            && requested < mixed
            && mixed.frames_until(&wrapped, n) <= num_frames as u64
        {
            start = wrapped;
            debug!(
                stream = self.id.0,
                loop_count = start.loop_count,
                "client loop count lagged a wrap"
            );
        }

        let others_min = st
            .clients
            .iter_sorted()
            .filter(|(other, _)| *other != key)
            .filter_map(|(_, entry)| entry.mixed_position.get())
            .min();
        if let Some(slowest_other) = others_min
            && start.absolute(n) + (n as u64) < slowest_other.absolute(n)
        {
            let resynced = RingPosition::new(slowest_other.loop_count, start.sample_frame);
            warn!(
                stream = self.id.0,
                from_loop = start.loop_count,
                to_loop = resynced.loop_count,
                "stalled client resynchronised to current loop"
            );
            start = resynced;
        }
        start
    }

    fn mix_client_samples(
        &self,
        st: &mut StreamState,
        memory: &ClientMemory,
        skip: u32,
        first_frame: u32,
        num_frames: u32,
    ) -> Result<()> {
        let channels = st.format.num_channels as usize;
        let single_client = st.clients.len() == 1;
        let source = memory.data_f32();
        let Some(mix) = st.mix_buffer.as_mut() else {
            return Err(AudioError::NoMemory);
        };
        for span in ring_spans(first_frame, num_frames, self.frames_per_buffer) {
            let src_frame = (skip + span.offset) as usize;
            let src = source
                .get(src_frame * channels..(src_frame + span.len as usize) * channels)
                .ok_or(AudioError::BadArgument("client buffer shorter than frame count"))?;
            let dst_start = span.start as usize * channels;
            let dst = &mut mix[dst_start..dst_start + span.len as usize * channels];
            if single_client {
                dst.copy_from_slice(src);
            } else {
                mix_output_samples(src, dst);
            }
        }
        Ok(())
    }

    /// Commit mixed output up to the slowest attached client.
    pub fn clip_if_necessary(&self) -> Result<(), ClipError> {
        let mut st = self.state.lock();
        self.clip_if_necessary_locked(&mut st)
    }

    pub(crate) fn clip_if_necessary_locked(&self, st: &mut StreamState) -> Result<(), ClipError> {
        let n = self.frames_per_buffer;
        let Some(head) = st.clients.head() else {
            return Ok(());
        };
        // A buffer that has never delivered could still fill the gap.
        let Position::At(target) = head.mixed_position else {
            return Ok(());
        };
        let Position::At(from) = st.clipped_position else {
            return Ok(());
        };
        debug_assert!(
            st.clients
                .tail()
                .is_none_or(|tail| tail.mixed_position >= head.mixed_position),
            "client list out of order"
        );
        if target <= from {
            return Ok(());
        }

        let mut delta = from.frames_until(&target, n);
        let mut from_abs = from.absolute(n);
        if !st.format.is_mixable {
            if delta > MIX_BUFFER_MAX_SIZE as u64 {
                let err = ClipError::Overrun {
                    requested: delta.min(u32::MAX as u64) as u32,
                    limit: MIX_BUFFER_MAX_SIZE,
                };
                warn!(stream = self.id.0, frames = delta, "clip overrun");
                st.clip_status = Some(err.clone());
                return Err(err);
            }
        } else if delta > n as u64 {
            debug!(
                stream = self.id.0,
                frames = delta,
                "clip gap exceeds ring; committing the latest loop only"
            );
            from_abs = target.absolute(n) - n as u64;
            delta = n as u64;
        }

        let first = (from_abs % n as u64) as u32;
        if let Err(err) = self.clip_range_locked(st, first, from_abs, delta as u32) {
            warn!(stream = self.id.0, error = %err, "clip failed");
            st.clip_status = Some(err.clone());
            return Err(err);
        }
        st.clipped_position = Position::At(target);
        Ok(())
    }

    /// Commit `num_frames` starting at ring frame `first_sample_frame`.
    pub fn clip_output_samples(&self, first_sample_frame: u32, num_frames: u32) -> Result<(), ClipError> {
        let n = self.frames_per_buffer;
        let mut st = self.state.lock();
        let base = st
            .clipped_position
            .get()
            .map(|pos| pos.absolute(n))
            .unwrap_or(0);
        let mut start = base - base % n as u64 + (first_sample_frame % n) as u64;
        if start < base {
            start += n as u64;
        }
        let result = self.clip_range_locked(&mut st, first_sample_frame % n, start, num_frames.min(n));
        if let Err(err) = &result {
            st.clip_status = Some(err.clone());
        }
        result
    }

    fn clip_range_locked(
        &self,
        st: &mut StreamState,
        first_frame: u32,
        start_abs: u64,
        num_frames: u32,
    ) -> Result<(), ClipError> {
        for span in ring_spans(first_frame, num_frames, self.frames_per_buffer) {
            self.clip_span_locked(st, span.start, span.len, start_abs + span.offset as u64)?;
        }
        Ok(())
    }

    fn clip_span_locked(
        &self,
        st: &mut StreamState,
        first: u32,
        count: u32,
        start_abs: u64,
    ) -> Result<(), ClipError> {
        let format = st.format;
        let bpf = format.bytes_per_frame();
        let channels = format.num_channels as usize;
        let StreamState {
            sample_buffer,
            mix_buffer,
            native_source,
            io_functions,
            ..
        } = st;
        let dst_start = first as usize * bpf;
        let dst = sample_buffer
            .get_mut(dst_start..dst_start + count as usize * bpf)
            .ok_or(ClipError::UnsupportedFormat)?;

        if format.is_mixable {
            let mix_range = first as usize * channels..(first + count) as usize * channels;
            let source = match mix_buffer.as_deref() {
                Some(mix) => ClipSource::Mix(&mix[mix_range]),
                None => ClipSource::Silence,
            };
            return self.run_clip(io_functions, source, dst, &format);
        }

        // Exclusive client: pass through whatever part of the range its
        // latest buffer covers, silence elsewhere.
        let end_abs = start_abs + count as u64;
        let covered = native_source.as_ref().and_then(|source| {
            let lo = start_abs.max(source.start);
            let hi = end_abs.min(source.start + source.frames as u64);
            (lo < hi).then_some((source, lo, hi))
        });
        match covered {
            Some((source, lo, hi)) => {
                let before = (lo - start_abs) as usize * bpf;
                let inside = (hi - lo) as usize * bpf;
                let src_offset = (lo - source.start) as usize * bpf;
                let src = source
                    .memory
                    .data_bytes()
                    .get(src_offset..src_offset + inside)
                    .ok_or(ClipError::UnsupportedFormat)?;
                let (head, rest) = dst.split_at_mut(before);
                let (middle, tail) = rest.split_at_mut(inside);
                if !head.is_empty() {
                    self.run_clip(io_functions, ClipSource::Silence, head, &format)?;
                }
                self.run_clip(io_functions, ClipSource::Native(src), middle, &format)?;
                if !tail.is_empty() {
                    self.run_clip(io_functions, ClipSource::Silence, tail, &format)?;
                }
                Ok(())
            }
            None => self.run_clip(io_functions, ClipSource::Silence, dst, &format),
        }
    }

    fn run_clip(
        &self,
        io_functions: &[AudioIoFunction],
        source: ClipSource<'_>,
        dst: &mut [u8],
        format: &StreamFormat,
    ) -> Result<(), ClipError> {
        if io_functions.is_empty() {
            return self.driver.clip_output_samples(source, dst, format);
        }
        for function in io_functions {
            function(source, dst, format)?;
        }
        Ok(())
    }

    /// Status recorded by the last failed clip, cleared on read.
    ///
    /// Reading an overrun also moves the clip point up to the slowest client
    /// so the stream can make progress again; the skipped frames are lost.
    pub fn take_clip_status(&self) -> Option<ClipError> {
        let mut st = self.state.lock();
        self.take_clip_status_locked(&mut st)
    }

    pub(crate) fn take_clip_status_locked(&self, st: &mut StreamState) -> Option<ClipError> {
        let status = st.clip_status.take()?;
        if let ClipError::Overrun { .. } = status
            && let Some(Position::At(head)) = st.clients.head().map(|entry| entry.mixed_position)
            && Position::At(head) > st.clipped_position
        {
            st.clipped_position = Position::At(head);
            st.native_source = None;
        }
        Some(status)
    }

    /// Copy hardware input for one cycle into a client buffer.
    pub fn read_input_samples(
        &self,
        key: ClientKey,
        first_sample_frame: u32,
        loop_count: u32,
        num_sample_frames: u32,
    ) -> Result<()> {
        let mut st = self.state.lock();
        self.read_input_samples_locked(&mut st, key, first_sample_frame, loop_count, num_sample_frames)
    }

    pub(crate) fn read_input_samples_locked(
        &self,
        st: &mut StreamState,
        key: ClientKey,
        first_sample_frame: u32,
        loop_count: u32,
        num_sample_frames: u32,
    ) -> Result<()> {
        let n = self.frames_per_buffer;
        if first_sample_frame >= n {
            return Err(AudioError::BadArgument("first sample frame out of range"));
        }
        let (memory, capacity) = match st.clients.get(key) {
            Some(entry) => (entry.memory.clone(), entry.capacity_frames),
            None => return Err(AudioError::BadArgument("unknown client buffer")),
        };
        let num_frames = num_sample_frames.min(capacity).min(n);
        let format = st.format;
        let bpf = format.bytes_per_frame();
        let channels = format.num_channels as usize;

        for span in ring_spans(first_sample_frame, num_frames, n) {
            let src_start = span.start as usize * bpf;
            let src = st
                .sample_buffer
                .get(src_start..src_start + span.len as usize * bpf)
                .ok_or(AudioError::BadArgument("frame range outside sample buffer"))?;
            if format.is_mixable {
                let dst_start = span.offset as usize * channels;
                let dst = memory
                    .data_f32_mut()
                    .get_mut(dst_start..dst_start + span.len as usize * channels)
                    .ok_or(AudioError::BadArgument("client buffer shorter than frame count"))?;
                self.driver.convert_input_samples(src, dst, &format)?;
            } else {
                memory.write_bytes(span.offset as usize * bpf, src);
            }
        }

        let client_bpf = format.client_bytes_per_frame();
        memory.set_actual(num_frames, num_frames * client_bpf as u32);
        let end = RingPosition::new(loop_count, first_sample_frame).advanced_by(num_frames as u64, n);
        if let Some(entry) = st.clients.get_mut(key) {
            entry.mixed_position = Position::At(end);
        }
        st.clients.reposition(key);
        Ok(())
    }

    /// Silence ring frames `[from_frame, to_frame)` in both the mix and the
    /// hardware buffer, wrapping if `to_frame` is below `from_frame`.
    pub fn erase_output_samples(&self, from_frame: u32, to_frame: u32) {
        let n = self.frames_per_buffer;
        let count = (to_frame % n + n - from_frame % n) % n;
        if count == 0 {
            return;
        }
        let mut st = self.state.lock();
        let format = st.format;
        let bpf = format.bytes_per_frame();
        let channels = format.num_channels as usize;
        let StreamState {
            sample_buffer,
            mix_buffer,
            ..
        } = &mut *st;
        for span in ring_spans(from_frame, count, n) {
            let start = span.start as usize * bpf;
            if let Some(dst) = sample_buffer.get_mut(start..start + span.len as usize * bpf) {
                convert::write_silence(dst, &format);
            }
            if let Some(mix) = mix_buffer.as_mut() {
                let start = span.start as usize * channels;
                if let Some(dst) = mix.get_mut(start..start + span.len as usize * channels) {
                    dst.fill(0.0);
                }
            }
        }
    }

    /// Forget the clip point and any recorded clip failure.
    pub fn reset_clip_info(&self) {
        let mut st = self.state.lock();
        Self::reset_clip_info_locked(&mut st);
    }

    fn reset_clip_info_locked(st: &mut StreamState) {
        st.clipped_position = Position::Unset;
        st.clip_status = None;
        st.native_source = None;
    }

    /// Forget every client's mixed position and the clip point, and clear the
    /// mix buffer. Used when the engine restarts from loop zero.
    pub(crate) fn reset_positions(&self) {
        let mut st = self.state.lock();
        Self::reset_clip_info_locked(&mut st);
        st.clients
            .for_each_mut(|entry| entry.mixed_position = Position::Unset);
        if let Some(mix) = st.mix_buffer.as_mut() {
            mix.fill(0.0);
        }
    }

    /// Check `format` against the advertised list and the client count.
    pub(crate) fn validate_format_locked(
        &self,
        st: &StreamState,
        format: &StreamFormat,
        rate: Option<SampleRate>,
    ) -> Result<()> {
        if !format.is_established() {
            return Err(AudioError::BadArgument("format has no channels"));
        }
        if !st.available_formats.is_empty()
            && !st
                .available_formats
                .iter()
                .any(|available| available.accepts(format, rate))
        {
            return Err(AudioError::Unsupported("format not offered by stream"));
        }
        if self.direction == StreamDirection::Output && !format.is_mixable && st.clients.len() > 1 {
            return Err(AudioError::ExclusiveAccess);
        }
        Ok(())
    }

    /// Swap in `format`, rebuilding the hardware and mix buffers.
    pub(crate) fn apply_format_locked(&self, st: &mut StreamState, format: StreamFormat) -> Result<()> {
        let mix_buffer = if self.direction == StreamDirection::Output
            && format.is_mixable
            && !st.clients.is_empty()
        {
            Some(zeroed_mix_buffer(format.num_channels, self.frames_per_buffer)?)
        } else {
            None
        };
        st.format = format;
        st.sample_buffer = silent_buffer(&format, self.frames_per_buffer);
        st.mix_buffer = mix_buffer;
        Self::reset_clip_info_locked(st);
        st.clients.for_each_mut(|entry| {
            entry.mixed_position = Position::Unset;
            entry.capacity_frames = capacity_for(&format, entry.data_bytes);
        });
        debug!(
            stream = self.id.0,
            channels = format.num_channels,
            mixable = format.is_mixable,
            "stream format changed"
        );
        Ok(())
    }

    pub(crate) fn info_from_state(&self, st: &StreamState) -> StreamInfo {
        self.info_locked(st)
    }

    /// Frames a client buffer of `key` can carry under the current format.
    pub fn client_capacity(&self, key: ClientKey) -> Option<u32> {
        self.state
            .lock()
            .clients
            .get(key)
            .map(|entry| entry.capacity_frames)
    }
}

/// Whole client frames that fit in `data_bytes` under `format`.
pub fn capacity_for(format: &StreamFormat, data_bytes: usize) -> u32 {
    let frame_bytes = format.client_bytes_per_frame();
    if frame_bytes == 0 {
        return 0;
    }
    (data_bytes / frame_bytes).min(u32::MAX as usize) as u32
}
