use std::sync::Arc;

use crate::client_list::{BufferOwner, ClientEntry, ClientList};
use crate::memory::ClientMemory;
use crate::position::Position;

fn entry(buffer_set: u32) -> ClientEntry {
    ClientEntry {
        memory: Arc::new(ClientMemory::new(256).expect("map")),
        data_bytes: 128,
        capacity_frames: 16,
        mixed_position: Position::Unset,
        owner: BufferOwner {
            user_client: 1,
            buffer_set,
        },
    }
}

fn move_to(list: &mut ClientList, key: crate::ClientKey, position: Position) {
    list.get_mut(key).expect("entry").mixed_position = position;
    list.reposition(key);
}

fn sorted_sets(list: &ClientList) -> Vec<u32> {
    list.iter_sorted()
        .map(|(_, entry)| entry.owner.buffer_set)
        .collect()
}

#[test]
fn unpositioned_entries_lead_the_list() {
    let mut list = ClientList::default();
    let a = list.insert(entry(1));
    let b = list.insert(entry(2));
    move_to(&mut list, a, Position::at(0, 512));

    assert_eq!(list.head_key(), Some(b));
    assert_eq!(sorted_sets(&list), vec![2, 1]);
    assert_eq!(list.tail().map(|e| e.owner.buffer_set), Some(1));
}

#[test]
fn reposition_keeps_ascending_order() {
    let mut list = ClientList::default();
    let a = list.insert(entry(1));
    let b = list.insert(entry(2));
    let c = list.insert(entry(3));
    move_to(&mut list, a, Position::at(1, 0));
    move_to(&mut list, b, Position::at(0, 100));
    move_to(&mut list, c, Position::at(0, 4_000));
    assert_eq!(sorted_sets(&list), vec![2, 3, 1]);

    move_to(&mut list, b, Position::at(2, 0));
    assert_eq!(sorted_sets(&list), vec![3, 1, 2]);
    assert_eq!(list.head_key(), Some(c));
}

#[test]
fn equal_positions_keep_arrival_order() {
    let mut list = ClientList::default();
    let a = list.insert(entry(1));
    let b = list.insert(entry(2));
    move_to(&mut list, b, Position::at(0, 64));
    move_to(&mut list, a, Position::at(0, 64));
    assert_eq!(sorted_sets(&list), vec![2, 1]);
}

#[test]
fn removed_keys_go_stale() {
    let mut list = ClientList::default();
    let a = list.insert(entry(1));
    let b = list.insert(entry(2));
    assert!(list.remove(a).is_some());
    assert!(!list.contains(a));
    assert!(list.get(a).is_none());
    assert!(list.remove(a).is_none());

    // The freed slot is reused under a new generation.
    let c = list.insert(entry(3));
    assert!(list.get(a).is_none());
    assert_eq!(list.get(c).map(|e| e.owner.buffer_set), Some(3));
    assert!(list.contains(b));
    assert_eq!(list.len(), 2);
}
