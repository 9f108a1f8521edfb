use crate::convert::{ClipSource, clip_to_native, mix_output_samples, native_to_float};
use crate::error::ClipError;
use crate::format::{FormatExtension, SampleFormat, StreamFormat};

#[test]
fn float_mix_is_clamped_to_full_scale() {
    let format = StreamFormat::float32(1);
    let mut out = [0u8; 12];
    clip_to_native(ClipSource::Mix(&[1.5, -2.0, 0.25]), &mut out, &format).expect("clip");
    let decoded: Vec<f32> = out
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    assert_eq!(decoded, vec![1.0, -1.0, 0.25]);
}

#[test]
fn pcm16_encodes_and_reads_back() {
    let format = StreamFormat::pcm16(1);
    let mut out = [0u8; 6];
    clip_to_native(ClipSource::Mix(&[1.0, -1.0, 0.0]), &mut out, &format).expect("clip");
    assert_eq!(&out[..2], &32_767i16.to_le_bytes());
    assert_eq!(&out[2..4], &(-32_767i16).to_le_bytes());
    assert_eq!(&out[4..], &[0, 0]);

    let mut back = [0.0f32; 3];
    native_to_float(&out, &mut back, &format).expect("convert");
    assert!((back[0] - 1.0).abs() < 1e-6);
    assert!((back[1] + 1.0).abs() < 1e-6);
    assert_eq!(back[2], 0.0);
}

#[test]
fn native_source_is_copied_and_padded_with_silence() {
    let format = StreamFormat::pcm16(1).exclusive();
    let mut out = [0xffu8; 6];
    clip_to_native(ClipSource::Native(&[1, 2]), &mut out, &format).expect("clip");
    assert_eq!(out, [1, 2, 0, 0, 0, 0]);
}

#[test]
fn packetized_mix_is_rejected() {
    let mut format = StreamFormat::pcm16(2);
    format.sample_format = SampleFormat::Packetized;
    format.extension = FormatExtension {
        flags: 0,
        frames_per_packet: 1_536,
        bytes_per_packet: 6_144,
    };
    let mut out = [0u8; 8];
    assert_eq!(
        clip_to_native(ClipSource::Mix(&[0.0; 4]), &mut out, &format),
        Err(ClipError::UnsupportedFormat)
    );
}

#[test]
fn mixing_adds_in_place() {
    let mut dst = [0.25f32, 0.5];
    mix_output_samples(&[0.25, -0.5], &mut dst);
    assert_eq!(dst, [0.5, 0.0]);
}
