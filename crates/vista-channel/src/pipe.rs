//! The outgoing queue ("pipe") of a channel client.
//!
//! A doubly linked list over a slab. The head is the next item to send.
//! Positions are (slot, generation) pairs: a position outliving its item
//! is detected instead of silently pointing at whatever reused the slot.
//!
//! Items are shared (`Arc`) so a broadcast enqueues one allocation on many
//! pipes, and removal from one pipe never invalidates an outside handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a channel client can send. Control kinds are built by the
/// engine itself; `Channel` carries the per-channel-type payload.
#[derive(Debug)]
pub enum PipeItem<I> {
    SetAck,
    Migrate,
    /// A message with the given type and an empty body.
    EmptyMsg(u16),
    Ping,
    /// Sends nothing. Flipped when the send loop reaches it.
    Marker(AtomicBool),
    Channel(I),
}

impl<I> PipeItem<I> {
    pub fn marker() -> Arc<Self> {
        Arc::new(PipeItem::Marker(AtomicBool::new(false)))
    }

    pub fn marker_reached(&self) -> bool {
        match self {
            PipeItem::Marker(flag) => flag.load(Ordering::Acquire),
            _ => false,
        }
    }

    pub(crate) fn mark_reached(&self) {
        if let PipeItem::Marker(flag) = self {
            flag.store(true, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    prev: Option<u32>,
    next: Option<u32>,
    generation: u32,
}

#[derive(Debug)]
pub struct Pipe<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pipe<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i as usize];
                slot.value = Some(value);
                slot.prev = None;
                slot.next = None;
                i
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    prev: None,
                    next: None,
                    generation: 0,
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn position(&self, index: u32) -> Position {
        Position {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn resolve(&self, pos: Position) -> Option<u32> {
        let slot = self.slots.get(pos.index as usize)?;
        (slot.generation == pos.generation && slot.value.is_some()).then_some(pos.index)
    }

    fn link_between(&mut self, index: u32, prev: Option<u32>, next: Option<u32>) {
        self.slots[index as usize].prev = prev;
        self.slots[index as usize].next = next;
        match prev {
            Some(p) => self.slots[p as usize].next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(n) => self.slots[n as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
    }

    /// Make `value` the next item to send.
    pub fn push_front(&mut self, value: T) -> Position {
        let index = self.alloc(value);
        let next = self.head;
        self.link_between(index, None, next);
        self.position(index)
    }

    /// Queue `value` behind everything already pending.
    pub fn push_back(&mut self, value: T) -> Position {
        let index = self.alloc(value);
        let prev = self.tail;
        self.link_between(index, prev, None);
        self.position(index)
    }

    /// Insert so that `value` is sent just before the item at `pos`.
    pub fn insert_before(&mut self, pos: Position, value: T) -> Option<Position> {
        let at = self.resolve(pos)?;
        let prev = self.slots[at as usize].prev;
        let index = self.alloc(value);
        self.link_between(index, prev, Some(at));
        Some(self.position(index))
    }

    /// Insert so that `value` is sent just after the item at `pos`.
    pub fn insert_after(&mut self, pos: Position, value: T) -> Option<Position> {
        let at = self.resolve(pos)?;
        let next = self.slots[at as usize].next;
        let index = self.alloc(value);
        self.link_between(index, Some(at), next);
        Some(self.position(index))
    }

    pub fn remove(&mut self, pos: Position) -> Option<T> {
        let index = self.resolve(pos)?;
        self.unlink(index)
    }

    fn unlink(&mut self, index: u32) -> Option<T> {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = None;
        slot.next = None;
        self.free.push(index);
        self.len -= 1;
        slot.value.take()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        self.unlink(head)
    }

    pub fn front(&self) -> Option<&T> {
        self.head.and_then(|i| self.slots[i as usize].value.as_ref())
    }

    pub fn get(&self, pos: Position) -> Option<&T> {
        let index = self.resolve(pos)?;
        self.slots[index as usize].value.as_ref()
    }

    pub fn contains_position(&self, pos: Position) -> bool {
        self.resolve(pos).is_some()
    }

    /// First position, in send order, whose value matches.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Position> {
        let mut cursor = self.head;
        while let Some(i) = cursor {
            let slot = &self.slots[i as usize];
            if slot.value.as_ref().map(&mut pred).unwrap_or(false) {
                return Some(self.position(i));
            }
            cursor = slot.next;
        }
        None
    }

    /// Values in send order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let i = cursor?;
            let slot = &self.slots[i as usize];
            cursor = slot.next;
            slot.value.as_ref()
        })
    }

    /// Remove everything, returning the values in send order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(v) = self.pop_front() {
            out.push(v);
        }
        out
    }
}

impl<I> Pipe<Arc<PipeItem<I>>> {
    /// Position of this exact item, by identity.
    pub fn position_of(&self, item: &Arc<PipeItem<I>>) -> Option<Position> {
        self.find(|queued| Arc::ptr_eq(queued, item))
    }

    pub fn contains(&self, item: &Arc<PipeItem<I>>) -> bool {
        self.position_of(item).is_some()
    }

    /// Remove this exact item. Returns false if it was not queued.
    pub fn remove_item(&mut self, item: &Arc<PipeItem<I>>) -> bool {
        match self.position_of(item) {
            Some(pos) => self.remove(pos).is_some(),
            None => false,
        }
    }
}
