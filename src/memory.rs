//! Client buffer memory shared between a user-space client and the engine.
//!
//! Every region starts with a [`BufferDataDescriptor`] header followed by raw
//! sample data. The header lets variable-size formats report how much of the
//! fixed-size region is populated for each I/O cycle.
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{MmapMut, MmapOptions};

/// Header at the front of every client buffer.
#[repr(C)]
pub struct BufferDataDescriptor {
    actual_data_byte_size: AtomicU32,
    actual_num_sample_frames: AtomicU32,
    total_data_byte_size: AtomicU32,
    nominal_data_byte_size: AtomicU32,
}

/// Size in bytes of [`BufferDataDescriptor`].
pub const DESCRIPTOR_SIZE: usize = size_of::<BufferDataDescriptor>();

/// Plain snapshot of a buffer's descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDescriptor {
    /// Bytes of sample data populated this cycle.
    pub actual_data_byte_size: u32,
    /// Frames populated this cycle; zero means "whole buffer".
    pub actual_num_sample_frames: u32,
    /// Bytes the client declares the data region to hold.
    pub total_data_byte_size: u32,
    /// Bytes a full cycle normally carries.
    pub nominal_data_byte_size: u32,
}

/// A mapped client buffer: descriptor header plus sample data.
pub struct ClientMemory {
    mmap: UnsafeCell<MmapMut>,
    len: usize,
}

unsafe impl Send for ClientMemory {}
unsafe impl Sync for ClientMemory {}

impl ClientMemory {
    /// Map an anonymous region of `len` bytes, header included.
    ///
    /// The descriptor starts out declaring the whole data region.
    pub fn new(len: usize) -> std::io::Result<Self> {
        let mmap = MmapOptions::new().len(len.max(1)).map_anon()?;
        let memory = Self {
            mmap: UnsafeCell::new(mmap),
            len,
        };
        let data_len = memory.data_len() as u32;
        memory.set_descriptor(DataDescriptor {
            actual_data_byte_size: data_len,
            actual_num_sample_frames: 0,
            total_data_byte_size: data_len,
            nominal_data_byte_size: data_len,
        });
        Ok(memory)
    }

    /// Region sized for `frames` interleaved `f32` frames of `channels` channels.
    pub fn for_float_frames(frames: usize, channels: usize) -> std::io::Result<Self> {
        Self::new(DESCRIPTOR_SIZE + frames * channels * size_of::<f32>())
    }

    fn base(&self) -> *mut u8 {
        unsafe { (&mut *self.mmap.get()).as_mut_ptr() }
    }

    fn header(&self) -> Option<&BufferDataDescriptor> {
        if self.len < DESCRIPTOR_SIZE {
            return None;
        }
        Some(unsafe { &*(self.base() as *const BufferDataDescriptor) })
    }

    /// Total mapped length in bytes, header included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is too small to hold a header.
    pub fn is_empty(&self) -> bool {
        self.len < DESCRIPTOR_SIZE
    }

    /// Bytes available for sample data after the header.
    pub fn data_len(&self) -> usize {
        self.len.saturating_sub(DESCRIPTOR_SIZE)
    }

    /// Snapshot of the descriptor header.
    pub fn descriptor(&self) -> DataDescriptor {
        match self.header() {
            Some(header) => DataDescriptor {
                actual_data_byte_size: header.actual_data_byte_size.load(Ordering::Acquire),
                actual_num_sample_frames: header.actual_num_sample_frames.load(Ordering::Acquire),
                total_data_byte_size: header.total_data_byte_size.load(Ordering::Acquire),
                nominal_data_byte_size: header.nominal_data_byte_size.load(Ordering::Acquire),
            },
            None => DataDescriptor::default(),
        }
    }

    /// Overwrite the descriptor header.
    pub fn set_descriptor(&self, descriptor: DataDescriptor) {
        if let Some(header) = self.header() {
            header
                .actual_data_byte_size
                .store(descriptor.actual_data_byte_size, Ordering::Release);
            header
                .actual_num_sample_frames
                .store(descriptor.actual_num_sample_frames, Ordering::Release);
            header
                .total_data_byte_size
                .store(descriptor.total_data_byte_size, Ordering::Release);
            header
                .nominal_data_byte_size
                .store(descriptor.nominal_data_byte_size, Ordering::Release);
        }
    }

    /// Declare how many frames and bytes the next cycle carries.
    pub fn set_actual(&self, frames: u32, bytes: u32) {
        if let Some(header) = self.header() {
            header
                .actual_num_sample_frames
                .store(frames, Ordering::Release);
            header.actual_data_byte_size.store(bytes, Ordering::Release);
        }
    }

    /// Sample data viewed as bytes.
    pub(crate) fn data_bytes(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.base().add(DESCRIPTOR_SIZE), self.data_len()) }
    }

    /// Mutable sample data viewed as bytes.
    ///
    /// The region is shared with the client; callers hold the owning user
    /// client's buffer lock while writing.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn data_bytes_mut(&self) -> &mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        unsafe {
            std::slice::from_raw_parts_mut(self.base().add(DESCRIPTOR_SIZE), self.data_len())
        }
    }

    /// Sample data viewed as interleaved `f32`.
    pub(crate) fn data_f32(&self) -> &[f32] {
        if self.is_empty() {
            return &[];
        }
        let samples = self.data_len() / size_of::<f32>();
        unsafe {
            std::slice::from_raw_parts(self.base().add(DESCRIPTOR_SIZE) as *const f32, samples)
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn data_f32_mut(&self) -> &mut [f32] {
        if self.is_empty() {
            return &mut [];
        }
        let samples = self.data_len() / size_of::<f32>();
        unsafe {
            std::slice::from_raw_parts_mut(self.base().add(DESCRIPTOR_SIZE) as *mut f32, samples)
        }
    }

    /// Copy interleaved samples in at `sample_offset`, returning samples written.
    pub fn write_f32(&self, sample_offset: usize, samples: &[f32]) -> usize {
        let data = self.data_f32_mut();
        if sample_offset >= data.len() {
            return 0;
        }
        let count = samples.len().min(data.len() - sample_offset);
        data[sample_offset..sample_offset + count].copy_from_slice(&samples[..count]);
        count
    }

    /// Copy interleaved samples out from `sample_offset`, returning samples read.
    pub fn read_f32(&self, sample_offset: usize, out: &mut [f32]) -> usize {
        let data = self.data_f32();
        if sample_offset >= data.len() {
            return 0;
        }
        let count = out.len().min(data.len() - sample_offset);
        out[..count].copy_from_slice(&data[sample_offset..sample_offset + count]);
        count
    }

    /// Copy raw bytes in at `byte_offset`, returning bytes written.
    pub fn write_bytes(&self, byte_offset: usize, bytes: &[u8]) -> usize {
        let data = self.data_bytes_mut();
        if byte_offset >= data.len() {
            return 0;
        }
        let count = bytes.len().min(data.len() - byte_offset);
        data[byte_offset..byte_offset + count].copy_from_slice(&bytes[..count]);
        count
    }

    /// Copy raw bytes out from `byte_offset`, returning bytes read.
    pub fn read_bytes(&self, byte_offset: usize, out: &mut [u8]) -> usize {
        let data = self.data_bytes();
        if byte_offset >= data.len() {
            return 0;
        }
        let count = out.len().min(data.len() - byte_offset);
        out[..count].copy_from_slice(&data[byte_offset..byte_offset + count]);
        count
    }
}
