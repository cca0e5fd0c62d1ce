//! Insertion-ordered map from player ID to player info.

use std::collections::{BTreeMap, HashMap};

use crate::{PlayerId, PlayerInfo};

/// FIFO queue of players with O(log n) removal by ID.
///
/// Each insertion gets a monotonically increasing sequence number; the
/// `order` map keeps players sorted by it, `index` maps IDs back to it.
#[derive(Debug, Clone, Default)]
pub struct PlayerQueue {
    order: BTreeMap<u64, PlayerInfo>,
    index: HashMap<PlayerId, u64>,
    next_seq: u64,
}

impl PlayerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.index.contains_key(player_id)
    }

    /// Append at the tail. A player already queued is handed back unchanged.
    pub fn push_back(&mut self, player: PlayerInfo) -> Result<(), PlayerInfo> {
        if self.index.contains_key(player.player_id()) {
            return Err(player);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(player.identification.player_id.clone(), seq);
        self.order.insert(seq, player);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<PlayerInfo> {
        let (_, player) = self.order.pop_first()?;
        self.index.remove(player.player_id());
        Some(player)
    }

    pub fn remove(&mut self, player_id: &str) -> Option<PlayerInfo> {
        let seq = self.index.remove(player_id)?;
        self.order.remove(&seq)
    }

    pub fn get(&self, player_id: &str) -> Option<&PlayerInfo> {
        let seq = self.index.get(player_id)?;
        self.order.get(seq)
    }

    pub fn get_mut(&mut self, player_id: &str) -> Option<&mut PlayerInfo> {
        let seq = self.index.get(player_id)?;
        self.order.get_mut(seq)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }

    /// Players from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &PlayerInfo> {
        self.order.values()
    }
}
