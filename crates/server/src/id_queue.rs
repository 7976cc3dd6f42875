//! Context ID allocation for one session

use std::collections::{HashMap, VecDeque};

pub const MIN_ID: u8 = 1;
pub const MAX_ID: u8 = 254;

/// Hands out context IDs in least-recently-used order and remembers which
/// name last held which ID, so a user rejoining gets their old ID back.
#[derive(Debug, Clone)]
pub struct IdQueue {
    queue: VecDeque<u8>,
    names: HashMap<String, u8>,
}

impl IdQueue {
    pub fn new() -> Self {
        Self {
            queue: (MIN_ID..=MAX_ID).collect(),
            names: HashMap::new(),
        }
    }

    /// Remember that `name` was using `id`
    pub fn set_id_for_name(&mut self, id: u8, name: &str) {
        if !(MIN_ID..=MAX_ID).contains(&id) {
            return;
        }
        self.names.insert(name.to_string(), id);
        self.reserve(id);
    }

    /// The ID last used by `name`, if any
    pub fn id_for_name(&self, name: &str) -> Option<u8> {
        self.names.get(name).copied()
    }

    /// Move `id` to the back of the queue
    pub fn reserve(&mut self, id: u8) {
        if let Some(pos) = self.queue.iter().position(|&i| i == id) {
            self.queue.remove(pos);
            self.queue.push_back(id);
        }
    }

    /// Pick an ID for `name`: its previous ID when free, otherwise the
    /// least recently used free ID.
    pub fn next_id_for(&mut self, name: &str, in_use: impl Fn(u8) -> bool) -> Option<u8> {
        let id = match self.id_for_name(name) {
            Some(id) if !in_use(id) => Some(id),
            _ => self.queue.iter().copied().find(|&id| !in_use(id)),
        }?;
        self.set_id_for_name(id, name);
        Some(id)
    }
}

impl Default for IdQueue {
    fn default() -> Self {
        Self::new()
    }
}
