//! Float ↔ native sample conversion used by the default driver clip hooks.
use crate::error::ClipError;
use crate::format::{Alignment, ByteOrder, NumericRepresentation, SampleFormat, StreamFormat};

/// Source of a clip pass: exactly the frames being committed.
#[derive(Clone, Copy, Debug)]
pub enum ClipSource<'a> {
    /// Interleaved float mix data.
    Mix(&'a [f32]),
    /// Native-format bytes from an exclusive client, passed through.
    Native(&'a [u8]),
    /// No data for the range: commit silence.
    Silence,
}

/// Convert `source` into native bytes in `dst`, clipping floats to [-1, 1].
///
/// `dst` covers exactly the frames being committed.
pub fn clip_to_native(
    source: ClipSource<'_>,
    dst: &mut [u8],
    format: &StreamFormat,
) -> Result<(), ClipError> {
    match source {
        ClipSource::Silence => {
            write_silence(dst, format);
            Ok(())
        }
        ClipSource::Native(bytes) => {
            let count = bytes.len().min(dst.len());
            dst[..count].copy_from_slice(&bytes[..count]);
            write_silence(&mut dst[count..], format);
            Ok(())
        }
        ClipSource::Mix(samples) => {
            if format.sample_format != SampleFormat::LinearPcm {
                return Err(ClipError::UnsupportedFormat);
            }
            let width = format.bytes_per_sample();
            if width == 0 {
                return Err(ClipError::UnsupportedFormat);
            }
            for (sample, out) in samples.iter().zip(dst.chunks_exact_mut(width)) {
                encode_sample(*sample, out, format)?;
            }
            Ok(())
        }
    }
}

/// Convert native bytes from the hardware buffer into interleaved floats.
pub fn native_to_float(
    src: &[u8],
    dst: &mut [f32],
    format: &StreamFormat,
) -> Result<(), ClipError> {
    if format.sample_format != SampleFormat::LinearPcm {
        return Err(ClipError::UnsupportedFormat);
    }
    let width = format.bytes_per_sample();
    if width == 0 {
        return Err(ClipError::UnsupportedFormat);
    }
    for (bytes, out) in src.chunks_exact(width).zip(dst.iter_mut()) {
        *out = decode_sample(bytes, format)?;
    }
    Ok(())
}

/// Fill `dst` with the format's silence value.
pub fn write_silence(dst: &mut [u8], format: &StreamFormat) {
    if format.numeric_representation == NumericRepresentation::UnsignedInt
        && format.bit_width == 8
    {
        dst.fill(0x80);
    } else {
        dst.fill(0);
    }
}

/// Element-wise add of `src` into `dst`.
pub fn mix_output_samples(src: &[f32], dst: &mut [f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

fn full_scale(bit_depth: u8) -> f64 {
    ((1u64 << (bit_depth.clamp(1, 32) - 1)) - 1) as f64
}

fn encode_sample(value: f32, out: &mut [u8], format: &StreamFormat) -> Result<(), ClipError> {
    let clipped = if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    };
    let width = out.len();
    let raw: u32 = match format.numeric_representation {
        NumericRepresentation::Float => {
            if width != 4 {
                return Err(ClipError::UnsupportedFormat);
            }
            clipped.to_bits()
        }
        NumericRepresentation::SignedInt => {
            let scaled = (clipped as f64 * full_scale(format.bit_depth)).round() as i64;
            let mut bits = (scaled as i32) as u32;
            if format.alignment == Alignment::HighByte {
                bits <<= shift(format);
            } else if format.bit_depth < 32 {
                bits &= (1u32 << format.bit_depth) - 1;
            }
            bits
        }
        NumericRepresentation::UnsignedInt => {
            let half = full_scale(format.bit_depth) + 1.0;
            let scaled = (clipped as f64 * (half - 1.0) + half).round() as u32;
            if format.alignment == Alignment::HighByte {
                scaled << shift(format)
            } else {
                scaled
            }
        }
    };
    store(raw, out, format.byte_order)
}

fn decode_sample(bytes: &[u8], format: &StreamFormat) -> Result<f32, ClipError> {
    let raw = load(bytes, format.byte_order)?;
    let width_bits = (bytes.len() * 8) as u32;
    Ok(match format.numeric_representation {
        NumericRepresentation::Float => {
            if bytes.len() != 4 {
                return Err(ClipError::UnsupportedFormat);
            }
            f32::from_bits(raw)
        }
        NumericRepresentation::SignedInt => {
            let value = if format.alignment == Alignment::HighByte {
                ((raw << (32 - width_bits)) as i32) >> (32 - width_bits + shift(format))
            } else {
                let depth = format.bit_depth.clamp(1, 32) as u32;
                ((raw << (32 - depth)) as i32) >> (32 - depth)
            };
            (value as f64 / full_scale(format.bit_depth)) as f32
        }
        NumericRepresentation::UnsignedInt => {
            let value = if format.alignment == Alignment::HighByte {
                raw >> shift(format)
            } else {
                raw
            };
            let half = full_scale(format.bit_depth) + 1.0;
            ((value as f64 - half) / (half - 1.0)) as f32
        }
    })
}

fn shift(format: &StreamFormat) -> u32 {
    (format.bit_width.saturating_sub(format.bit_depth)) as u32
}

fn store(raw: u32, out: &mut [u8], order: ByteOrder) -> Result<(), ClipError> {
    let width = out.len();
    if width == 0 || width > 4 {
        return Err(ClipError::UnsupportedFormat);
    }
    let le = raw.to_le_bytes();
    match order {
        ByteOrder::LittleEndian => out.copy_from_slice(&le[..width]),
        ByteOrder::BigEndian => {
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = le[width - 1 - i];
            }
        }
    }
    Ok(())
}

fn load(bytes: &[u8], order: ByteOrder) -> Result<u32, ClipError> {
    let width = bytes.len();
    if width == 0 || width > 4 {
        return Err(ClipError::UnsupportedFormat);
    }
    let mut le = [0u8; 4];
    match order {
        ByteOrder::LittleEndian => le[..width].copy_from_slice(bytes),
        ByteOrder::BigEndian => {
            for i in 0..width {
                le[i] = bytes[width - 1 - i];
            }
        }
    }
    Ok(u32::from_le_bytes(le))
}
