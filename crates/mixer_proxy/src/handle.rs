//! Generational handles into the live document
//!
//! A handle goes stale when its node is removed or when an undo step
//! rebuilds the document; stale handles never alias a newer node.

use serde::{Deserialize, Serialize};

/// Handle to a node of a [`crate::Document`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LiveHandle {
    index: u32,
    generation: u32,
}

impl LiveHandle {
    /// Create a handle from index and generation
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Slot storage with generation tracking
#[derive(Debug, Clone)]
pub(crate) struct Slots<T> {
    generations: Vec<u32>,
    values: Vec<Option<T>>,
    free_list: Vec<u32>,
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self {
            generations: Vec::new(),
            values: Vec::new(),
            free_list: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> LiveHandle {
        if let Some(index) = self.free_list.pop() {
            let slot = index as usize;
            self.values[slot] = Some(value);
            LiveHandle::new(index, self.generations[slot])
        } else {
            let index = self.values.len() as u32;
            self.generations.push(0);
            self.values.push(Some(value));
            LiveHandle::new(index, 0)
        }
    }

    pub fn is_valid(&self, handle: LiveHandle) -> bool {
        let slot = handle.index() as usize;
        slot < self.values.len()
            && self.generations[slot] == handle.generation()
            && self.values[slot].is_some()
    }

    pub fn get(&self, handle: LiveHandle) -> Option<&T> {
        if !self.is_valid(handle) {
            return None;
        }
        self.values[handle.index() as usize].as_ref()
    }

    pub fn get_mut(&mut self, handle: LiveHandle) -> Option<&mut T> {
        if !self.is_valid(handle) {
            return None;
        }
        self.values[handle.index() as usize].as_mut()
    }

    pub fn remove(&mut self, handle: LiveHandle) -> Option<T> {
        if !self.is_valid(handle) {
            return None;
        }
        let slot = handle.index() as usize;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free_list.push(handle.index());
        self.values[slot].take()
    }

    /// Remove everything; every outstanding handle goes stale
    pub fn clear(&mut self) {
        self.free_list.clear();
        for slot in 0..self.values.len() {
            if self.values[slot].take().is_some() {
                self.generations[slot] = self.generations[slot].wrapping_add(1);
            }
        }
        // Reuse low indices first
        self.free_list.extend((0..self.values.len() as u32).rev());
    }

    pub fn len(&self) -> usize {
        self.values.len() - self.free_list.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LiveHandle, &T)> {
        self.values.iter().enumerate().filter_map(move |(slot, value)| {
            value
                .as_ref()
                .map(|v| (LiveHandle::new(slot as u32, self.generations[slot]), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LiveHandle, &mut T)> {
        let generations = &self.generations;
        self.values.iter_mut().enumerate().filter_map(move |(slot, value)| {
            value
                .as_mut()
                .map(|v| (LiveHandle::new(slot as u32, generations[slot]), v))
        })
    }
}
