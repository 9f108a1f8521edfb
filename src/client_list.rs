//! Arena-backed, position-sorted list of the client buffers attached to a stream.
//!
//! Nodes live in a slot vector and link to each other by index, so splicing
//! is O(1) and keys stay valid until their entry is removed. A generation
//! counter per slot rejects keys to entries that have since been replaced.
use std::sync::Arc;

use crate::memory::ClientMemory;
use crate::position::Position;

/// Key of an attached client buffer inside one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientKey {
    index: u32,
    generation: u32,
}

/// Which user client and buffer set an attached buffer belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferOwner {
    /// Owning user client.
    pub user_client: u32,
    /// Buffer set within that client.
    pub buffer_set: u32,
}

/// Stream-side view of one client buffer.
pub(crate) struct ClientEntry {
    pub memory: Arc<ClientMemory>,
    /// Registered sample-data bytes, at most `memory.data_len()`.
    pub data_bytes: usize,
    pub capacity_frames: u32,
    pub mixed_position: Position,
    pub owner: BufferOwner,
}

struct Node {
    entry: ClientEntry,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Default)]
pub(crate) struct ClientList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    count: usize,
}

impl ClientList {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Attach `entry`, placing it after every entry at or below its position.
    pub fn insert(&mut self, entry: ClientEntry) -> ClientKey {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.node = Some(Node {
            entry,
            prev: None,
            next: None,
        });
        let key = ClientKey {
            index,
            generation: slot.generation,
        };
        self.link_sorted(index, None);
        self.count += 1;
        key
    }

    /// Detach and return the entry for `key`.
    pub fn remove(&mut self, key: ClientKey) -> Option<ClientEntry> {
        if !self.contains(key) {
            return None;
        }
        self.unlink(key.index);
        let slot = &mut self.slots[key.index as usize];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.count -= 1;
        Some(node.entry)
    }

    pub fn contains(&self, key: ClientKey) -> bool {
        self.slots
            .get(key.index as usize)
            .is_some_and(|slot| slot.generation == key.generation && slot.node.is_some())
    }

    pub fn get(&self, key: ClientKey) -> Option<&ClientEntry> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.node.as_ref().map(|node| &node.entry)
    }

    pub fn get_mut(&mut self, key: ClientKey) -> Option<&mut ClientEntry> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.node.as_mut().map(|node| &mut node.entry)
    }

    /// Restore sorted order after `key`'s position changed.
    ///
    /// Positions normally only move forward, so the search resumes from the
    /// entry's old predecessor.
    pub fn reposition(&mut self, key: ClientKey) {
        if !self.contains(key) {
            return;
        }
        let old_prev = self.node(key.index).and_then(|node| node.prev);
        self.unlink(key.index);
        let position = self.position(key.index);
        let start = match old_prev {
            Some(prev) if self.position(prev) <= position => Some(prev),
            _ => None,
        };
        self.link_sorted(key.index, start);
    }

    /// Key of the entry with the lowest position.
    pub fn head_key(&self) -> Option<ClientKey> {
        self.head.map(|index| self.key_of(index))
    }

    pub fn head(&self) -> Option<&ClientEntry> {
        self.head
            .and_then(|index| self.node(index))
            .map(|node| &node.entry)
    }

    pub fn tail(&self) -> Option<&ClientEntry> {
        self.tail
            .and_then(|index| self.node(index))
            .map(|node| &node.entry)
    }

    /// Entries in ascending position order.
    pub fn iter_sorted(&self) -> SortedIter<'_> {
        SortedIter {
            list: self,
            cursor: self.head,
        }
    }

    /// Apply `f` to every entry. Callers must keep relative order intact.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut ClientEntry)) {
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                f(&mut node.entry);
            }
        }
    }

    fn key_of(&self, index: u32) -> ClientKey {
        ClientKey {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn node(&self, index: u32) -> Option<&Node> {
        self.slots.get(index as usize)?.node.as_ref()
    }

    fn node_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.slots.get_mut(index as usize)?.node.as_mut()
    }

    fn position(&self, index: u32) -> Position {
        self.node(index)
            .map(|node| node.entry.mixed_position)
            .unwrap_or_default()
    }

    fn unlink(&mut self, index: u32) {
        let Some((prev, next)) = self.node(index).map(|node| (node.prev, node.next)) else {
            return;
        };
        match prev {
            Some(prev) => {
                if let Some(node) = self.node_mut(prev) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(node) = self.node_mut(next) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(index) {
            node.prev = None;
            node.next = None;
        }
    }

    /// Link `index` after the last entry whose position is not above its own,
    /// searching forward from `after` (or the head).
    fn link_sorted(&mut self, index: u32, after: Option<u32>) {
        let position = self.position(index);
        let mut prev = after;
        let mut next = match after {
            Some(after) => self.node(after).and_then(|node| node.next),
            None => self.head,
        };
        while let Some(candidate) = next {
            if self.position(candidate) > position {
                break;
            }
            prev = Some(candidate);
            next = self.node(candidate).and_then(|node| node.next);
        }
        if let Some(node) = self.node_mut(index) {
            node.prev = prev;
            node.next = next;
        }
        match prev {
            Some(prev) => {
                if let Some(node) = self.node_mut(prev) {
                    node.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        match next {
            Some(next) => {
                if let Some(node) = self.node_mut(next) {
                    node.prev = Some(index);
                }
            }
            None => self.tail = Some(index),
        }
    }
}

pub(crate) struct SortedIter<'a> {
    list: &'a ClientList,
    cursor: Option<u32>,
}

impl<'a> Iterator for SortedIter<'a> {
    type Item = (ClientKey, &'a ClientEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.node(index)?;
        self.cursor = node.next;
        Some((self.list.key_of(index), &node.entry))
    }
}
