//! Positions on the engine's circular sample buffer.

use std::cmp::Ordering;

/// Absolute position on an endlessly repeating ring of `frames_per_buffer` frames.
///
/// Ordering is loop-major: the loop count is compared first, then the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingPosition {
    /// Number of completed traversals of the ring.
    pub loop_count: u32,
    /// Frame offset within the current traversal.
    pub sample_frame: u32,
}

impl RingPosition {
    /// Build a position from its parts.
    pub const fn new(loop_count: u32, sample_frame: u32) -> Self {
        Self {
            loop_count,
            sample_frame,
        }
    }

    /// Three-way comparison returning `-1`, `0` or `1`.
    pub fn compare(a: &RingPosition, b: &RingPosition) -> i32 {
        match a.cmp(b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// True only for loop 0, frame 0.
    pub fn is_zero(&self) -> bool {
        self.loop_count == 0 && self.sample_frame == 0
    }

    /// Frames elapsed since loop 0, frame 0.
    pub fn absolute(&self, frames_per_buffer: u32) -> u64 {
        self.loop_count as u64 * frames_per_buffer as u64 + self.sample_frame as u64
    }

    /// Inverse of [`RingPosition::absolute`].
    pub fn from_absolute(frames: u64, frames_per_buffer: u32) -> Self {
        let n = frames_per_buffer.max(1) as u64;
        Self {
            loop_count: (frames / n) as u32,
            sample_frame: (frames % n) as u32,
        }
    }

    /// Position `frames` further along the ring.
    pub fn advanced_by(&self, frames: u64, frames_per_buffer: u32) -> Self {
        Self::from_absolute(self.absolute(frames_per_buffer) + frames, frames_per_buffer)
    }

    /// Frames from `self` forward to `later`, or zero if `later` is not ahead.
    pub fn frames_until(&self, later: &RingPosition, frames_per_buffer: u32) -> u64 {
        later
            .absolute(frames_per_buffer)
            .saturating_sub(self.absolute(frames_per_buffer))
    }
}

/// A ring position that may not have been established yet.
///
/// `Unset` sorts before every concrete position, so an entry that has never
/// been positioned always heads an ascending list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Position {
    /// Never positioned.
    #[default]
    Unset,
    /// A concrete ring position.
    At(RingPosition),
}

impl Position {
    /// Concrete position at `loop_count`, `sample_frame`.
    pub const fn at(loop_count: u32, sample_frame: u32) -> Self {
        Position::At(RingPosition::new(loop_count, sample_frame))
    }

    /// The concrete position, if any.
    pub fn get(&self) -> Option<RingPosition> {
        match self {
            Position::Unset => None,
            Position::At(pos) => Some(*pos),
        }
    }

    /// Whether a concrete position has been recorded.
    pub fn is_set(&self) -> bool {
        matches!(self, Position::At(_))
    }
}

impl From<RingPosition> for Position {
    fn from(pos: RingPosition) -> Self {
        Position::At(pos)
    }
}

/// A contiguous piece of a ring range that does not cross the wrap point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RingSpan {
    /// First frame of the piece within the ring.
    pub start: u32,
    /// Frames in the piece.
    pub len: u32,
    /// Offset of the piece from the start of the whole range.
    pub offset: u32,
}

/// Split `count` frames starting at `start` into at most two non-wrapping pieces.
pub(crate) fn ring_spans(start: u32, count: u32, frames_per_buffer: u32) -> Vec<RingSpan> {
    let n = frames_per_buffer;
    let count = count.min(n);
    if count == 0 || n == 0 {
        return Vec::new();
    }
    let start = start % n;
    let first = (n - start).min(count);
    let mut spans = vec![RingSpan {
        start,
        len: first,
        offset: 0,
    }];
    if count > first {
        spans.push(RingSpan {
            start: 0,
            len: count - first,
            offset: first,
        });
    }
    spans
}
