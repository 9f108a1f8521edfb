use crate::position::{Position, RingPosition, ring_spans};

#[test]
fn loop_count_dominates_sample_frame() {
    let early = RingPosition::new(0, 4_095);
    let late = RingPosition::new(1, 0);
    assert!(early < late);
    assert_eq!(RingPosition::compare(&early, &late), -1);
    assert_eq!(RingPosition::compare(&late, &early), 1);
    assert_eq!(RingPosition::compare(&late, &RingPosition::new(1, 0)), 0);
}

#[test]
fn zero_is_only_origin() {
    assert!(RingPosition::new(0, 0).is_zero());
    assert!(!RingPosition::new(0, 1).is_zero());
    assert!(!RingPosition::new(1, 0).is_zero());
}

#[test]
fn unset_sorts_before_every_position() {
    assert!(Position::Unset < Position::at(0, 0));
    assert!(Position::at(0, 5) < Position::at(0, 6));
    assert_eq!(Position::Unset.get(), None);
    assert!(!Position::Unset.is_set());
    assert_eq!(Position::from(RingPosition::new(2, 3)), Position::at(2, 3));
}

#[test]
fn advancing_wraps_into_next_loop() {
    let start = RingPosition::new(7, 900);
    let end = start.advanced_by(200, 1_000);
    assert_eq!(end, RingPosition::new(8, 100));
    assert_eq!(start.frames_until(&end, 1_000), 200);
    assert_eq!(end.frames_until(&start, 1_000), 0);
    assert_eq!(RingPosition::from_absolute(end.absolute(1_000), 1_000), end);
}

#[test]
fn spans_split_at_ring_end() {
    let spans = ring_spans(900, 200, 1_000);
    assert_eq!(spans.len(), 2);
    assert_eq!((spans[0].start, spans[0].len, spans[0].offset), (900, 100, 0));
    assert_eq!((spans[1].start, spans[1].len, spans[1].offset), (0, 100, 100));

    let whole = ring_spans(0, 5_000, 1_000);
    assert_eq!(whole.len(), 1);
    assert_eq!(whole[0].len, 1_000);

    assert!(ring_spans(10, 0, 1_000).is_empty());
}
