//! Stream format records and the standard sample-rate table.
use std::cmp::Ordering;

/// Broad encoding family of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Linear PCM frames.
    LinearPcm,
    /// Packetized, non-PCM payload (passed through untouched).
    Packetized,
}

/// How individual PCM samples encode amplitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NumericRepresentation {
    /// Two's-complement signed integers.
    SignedInt,
    /// Offset-binary unsigned integers.
    UnsignedInt,
    /// IEEE-754 floats.
    Float,
}

/// Placement of `bit_depth` significant bits inside a `bit_width` container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Alignment {
    /// Significant bits occupy the low end of the container.
    LowByte,
    /// Significant bits occupy the high end of the container.
    HighByte,
}

/// Byte order of multi-byte samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Most significant byte first.
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Extension fields for packetized formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FormatExtension {
    /// Driver-defined flags.
    pub flags: u32,
    /// Frames carried by one packet.
    pub frames_per_packet: u32,
    /// Bytes in one packet.
    pub bytes_per_packet: u32,
}

/// Negotiated format of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    /// Interleaved channel count.
    pub num_channels: u32,
    /// Encoding family.
    pub sample_format: SampleFormat,
    /// Numeric encoding of PCM samples.
    pub numeric_representation: NumericRepresentation,
    /// Significant bits per sample.
    pub bit_depth: u8,
    /// Container bits per sample.
    pub bit_width: u8,
    /// Placement of significant bits in the container.
    pub alignment: Alignment,
    /// Byte order of the container.
    pub byte_order: ByteOrder,
    /// Whether several clients may be mixed into this stream.
    pub is_mixable: bool,
    /// Opaque value for the driver's own bookkeeping.
    pub driver_tag: u32,
    /// Packet description for non-PCM formats.
    pub extension: FormatExtension,
}

impl StreamFormat {
    /// Mixable 32-bit float PCM in native byte order.
    pub fn float32(num_channels: u32) -> Self {
        Self {
            num_channels,
            sample_format: SampleFormat::LinearPcm,
            numeric_representation: NumericRepresentation::Float,
            bit_depth: 32,
            bit_width: 32,
            alignment: Alignment::LowByte,
            byte_order: native_byte_order(),
            is_mixable: true,
            driver_tag: 0,
            extension: FormatExtension::default(),
        }
    }

    /// Mixable signed 16-bit little-endian PCM.
    pub fn pcm16(num_channels: u32) -> Self {
        Self {
            num_channels,
            sample_format: SampleFormat::LinearPcm,
            numeric_representation: NumericRepresentation::SignedInt,
            bit_depth: 16,
            bit_width: 16,
            alignment: Alignment::LowByte,
            byte_order: ByteOrder::LittleEndian,
            is_mixable: true,
            driver_tag: 0,
            extension: FormatExtension::default(),
        }
    }

    /// Same format, marked exclusive (non-mixable).
    pub fn exclusive(mut self) -> Self {
        self.is_mixable = false;
        self
    }

    /// Bytes per sample container.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bit_width as usize).div_ceil(8)
    }

    /// Bytes per interleaved frame in the hardware buffer.
    pub fn bytes_per_frame(&self) -> usize {
        if self.sample_format == SampleFormat::Packetized && self.extension.frames_per_packet > 0
        {
            return (self.extension.bytes_per_packet / self.extension.frames_per_packet).max(1)
                as usize;
        }
        self.bytes_per_sample() * self.num_channels as usize
    }

    /// Bytes per frame in a client buffer: float for mixable streams, native otherwise.
    pub fn client_bytes_per_frame(&self) -> usize {
        if self.is_mixable {
            self.num_channels as usize * std::mem::size_of::<f32>()
        } else {
            self.bytes_per_frame()
        }
    }

    /// A format is usable once it names at least one channel and a container.
    pub fn is_established(&self) -> bool {
        self.num_channels > 0 && self.bit_width > 0 && self.bit_depth <= self.bit_width
    }
}

/// Byte order of the running target.
pub fn native_byte_order() -> ByteOrder {
    if cfg!(target_endian = "big") {
        ByteOrder::BigEndian
    } else {
        ByteOrder::LittleEndian
    }
}

/// Sample rate as a whole part plus a 1/2^32 fraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleRate {
    /// Whole hertz.
    pub whole: u32,
    /// Fractional hertz in units of 1/2^32.
    pub fraction: u32,
}

impl SampleRate {
    /// Whole-number rate.
    pub const fn hz(whole: u32) -> Self {
        Self { whole, fraction: 0 }
    }

    /// Rate as a float.
    pub fn as_f64(&self) -> f64 {
        self.whole as f64 + self.fraction as f64 / 4_294_967_296.0
    }

    /// Whether this rate is in [`STANDARD_SAMPLE_RATES`].
    pub fn is_standard(&self) -> bool {
        self.fraction == 0 && STANDARD_SAMPLE_RATES.contains(&self.whole)
    }
}

/// Rates every engine advertises unless the driver narrows them.
pub const STANDARD_SAMPLE_RATES: [u32; 9] = [
    8_000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 96_000, 192_000,
];

/// Format a stream may be switched to, with its supported rate range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AvailableFormat {
    /// The format.
    pub format: StreamFormat,
    /// Lowest supported rate.
    pub min_rate: SampleRate,
    /// Highest supported rate.
    pub max_rate: SampleRate,
}

impl AvailableFormat {
    /// Whether `format` at `rate` (if given) falls inside this entry.
    pub fn accepts(&self, format: &StreamFormat, rate: Option<SampleRate>) -> bool {
        let same = self.format.num_channels == format.num_channels
            && self.format.sample_format == format.sample_format
            && self.format.numeric_representation == format.numeric_representation
            && self.format.bit_depth == format.bit_depth
            && self.format.bit_width == format.bit_width
            && self.format.alignment == format.alignment
            && self.format.byte_order == format.byte_order
            && self.format.is_mixable == format.is_mixable;
        match rate {
            Some(rate) => same && rate >= self.min_rate && rate <= self.max_rate,
            None => same,
        }
    }
}

/// Ordering of streams inside an engine: ascending starting channel.
///
/// Streams that start on the same channel compare equal, so a stable sort
/// keeps them in the order they were added.
pub fn compare_streams(starting_channel_a: u32, starting_channel_b: u32) -> Ordering {
    starting_channel_a.cmp(&starting_channel_b)
}
