//! Engine status block shared read-only with user clients.
//!
//! The block lives at the front of a page-rounded anonymous mapping so that it
//! can be handed to other processes unchanged. It has a single writer (the
//! driver's interrupt path through [`EngineStatus::take_time_stamp`] plus the
//! engine's erase head) and any number of lock-free readers.
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::clock::monotonic_timestamp_ns;

/// Layout version published in [`StatusHeader::version`].
pub const ENGINE_STATUS_VERSION: u32 = 2;

const PAGE_SIZE: usize = 4096;

/// Fixed layout of the shared status block.
#[repr(C)]
pub struct StatusHeader {
    /// Layout version, see [`ENGINE_STATUS_VERSION`].
    pub version: AtomicU32,
    /// Number of times the hardware has wrapped the ring.
    pub current_loop_count: AtomicU32,
    /// Host time in nanoseconds of the most recent wrap, zero before the first.
    pub last_loop_time: AtomicU64,
    /// Frame up to which the output sample buffers have been erased.
    pub erase_head_sample_frame: AtomicU32,
}

/// Shared engine status block.
pub struct EngineStatus {
    mmap: UnsafeCell<MmapMut>,
    header: *const StatusHeader,
}

unsafe impl Send for EngineStatus {}
unsafe impl Sync for EngineStatus {}

/// Round `bytes` up to a whole number of pages.
pub fn page_round(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE
}

impl EngineStatus {
    /// Allocate a zeroed, page-rounded status block.
    pub fn new() -> std::io::Result<Self> {
        let mut mmap = MmapOptions::new()
            .len(page_round(size_of::<StatusHeader>()))
            .map_anon()?;
        let header = mmap.as_mut_ptr() as *mut StatusHeader;
        unsafe {
            header.write(StatusHeader {
                version: AtomicU32::new(ENGINE_STATUS_VERSION),
                current_loop_count: AtomicU32::new(0),
                last_loop_time: AtomicU64::new(0),
                erase_head_sample_frame: AtomicU32::new(0),
            });
        }
        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            header,
        })
    }

    fn header(&self) -> &StatusHeader {
        unsafe { &*self.header }
    }

    /// Size of the mapping in bytes.
    pub fn mapped_len(&self) -> usize {
        unsafe { (&*self.mmap.get()).len() }
    }

    /// Pointer to the start of the shared mapping.
    pub fn raw_header_ptr(&self) -> *const StatusHeader {
        self.header
    }

    /// Layout version.
    pub fn version(&self) -> u32 {
        self.header().version.load(Ordering::Relaxed)
    }

    /// Clear loop count, timestamp and erase head ahead of an engine start.
    pub fn reset(&self) {
        let header = self.header();
        header.current_loop_count.store(0, Ordering::Release);
        header.last_loop_time.store(0, Ordering::Release);
        header.erase_head_sample_frame.store(0, Ordering::Release);
    }

    /// Record a ring wrap. Called by the driver when the DMA engine loops.
    ///
    /// `timestamp_ns` of `None` stamps the current host time.
    pub fn take_time_stamp(&self, increment_loop_count: bool, timestamp_ns: Option<u64>) {
        let header = self.header();
        let timestamp = timestamp_ns.unwrap_or_else(monotonic_timestamp_ns);
        if increment_loop_count {
            header.current_loop_count.fetch_add(1, Ordering::AcqRel);
        }
        header.last_loop_time.store(timestamp, Ordering::Release);
    }

    /// Current loop count without timestamp coherence.
    pub fn current_loop_count(&self) -> u32 {
        self.header().current_loop_count.load(Ordering::Acquire)
    }

    /// Timestamp of the most recent wrap.
    pub fn last_loop_time(&self) -> u64 {
        self.header().last_loop_time.load(Ordering::Acquire)
    }

    /// Coherent (loop count, wrap timestamp) pair.
    ///
    /// The writer updates the two fields separately, so readers retry until two
    /// consecutive snapshots agree.
    pub fn loop_count_and_time_stamp(&self) -> (u32, u64) {
        let header = self.header();
        let mut loop_count = header.current_loop_count.load(Ordering::Acquire);
        let mut time_stamp = header.last_loop_time.load(Ordering::Acquire);
        loop {
            let next_loop_count = header.current_loop_count.load(Ordering::Acquire);
            let next_time_stamp = header.last_loop_time.load(Ordering::Acquire);
            if next_loop_count == loop_count && next_time_stamp == time_stamp {
                return (loop_count, time_stamp);
            }
            loop_count = next_loop_count;
            time_stamp = next_time_stamp;
            std::hint::spin_loop();
        }
    }

    /// Frame up to which output buffers have been erased.
    pub fn erase_head_sample_frame(&self) -> u32 {
        self.header().erase_head_sample_frame.load(Ordering::Acquire)
    }

    pub(crate) fn set_erase_head_sample_frame(&self, frame: u32) {
        self.header()
            .erase_head_sample_frame
            .store(frame, Ordering::Release);
    }
}
