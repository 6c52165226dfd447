//! AN-040: The card board: groups of cards over the store.

use crate::core::error::{AncileError, Result};
use crate::core::store::Store;
use crate::core::types::{BoardGroup, Card, Group};

/// Group/card browser state. All mutations go straight to the store and
/// `groups()` re-reads it, so the board never holds stale copies.
pub struct Board {
    store: Store,
}

impl Board {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn groups(&self) -> Result<Vec<BoardGroup>> {
        self.store.load_board()
    }

    pub fn add_group(&self, name: &str) -> Result<Group> {
        self.store.create_group(name)
    }

    pub fn rename_group(&self, id: i64, name: &str) -> Result<Group> {
        self.store.rename_group(id, name)
    }

    /// Returns how many cards went with the group.
    pub fn delete_group(&mut self, id: i64) -> Result<usize> {
        self.store.delete_group(id)
    }

    pub fn add_card(&self, group_id: i64, title: &str, description: &str) -> Result<Card> {
        self.store.add_card(group_id, title, description)
    }

    /// Returns the renamed card.
    pub fn rename_card(&mut self, id: i64, title: &str) -> Result<Card> {
        self.store.rename_card(id, title)?;
        self.store.get_card(id)
    }

    pub fn delete_card(&self, id: i64) -> Result<()> {
        self.store.delete_card(id)
    }

    /// Resolve a group by id or, failing that, by exact name.
    pub fn resolve_group(&self, key: &str) -> Result<Group> {
        if let Ok(id) = key.parse::<i64>() {
            if let Ok(g) = self.store.get_group(id) {
                return Ok(g);
            }
        }
        self.store
            .find_group(key.trim())?
            .ok_or_else(|| AncileError::UnknownName {
                kind: "group",
                name: key.to_string(),
            })
    }

    /// Resolve a card by id or, failing that, by title.
    pub fn resolve_card(&self, key: &str) -> Result<Card> {
        if let Ok(id) = key.parse::<i64>() {
            if let Ok(c) = self.store.get_card(id) {
                return Ok(c);
            }
        }
        self.store
            .find_card(key.trim())?
            .ok_or_else(|| AncileError::UnknownName {
                kind: "card",
                name: key.to_string(),
            })
    }
}
