//! AN-005: SQLite persistence for groups, cards and documents.
//!
//! The schema is created on open if absent. Databases written by older
//! builds (nullable `description`/`content`, no cascade clause) are read
//! as-is, so cascading deletes are also performed explicitly.

use super::error::{AncileError, Result};
use super::naming::clean_name;
use super::types::{BoardGroup, Card, Group};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS cards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_cards_group ON cards(group_id);
CREATE TABLE IF NOT EXISTS documents (
    title TEXT PRIMARY KEY,
    content TEXT NOT NULL
);
";

/// An open store. One connection per instance.
pub struct Store {
    conn: Connection,
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn map_card_row(row: &rusqlite::Row) -> rusqlite::Result<Card> {
    Ok(Card {
        id: row.get(0)?,
        group_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
    })
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AncileError::io(format!("cannot create dir {}", parent.display()), e)
                })?;
            }
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened store");
        Self::init(conn)
    }

    /// A private, throwaway store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a group. A taken name fails with `UniquenessViolation`.
    pub fn create_group(&self, name: &str) -> Result<Group> {
        let name = clean_name(name, "group name")?;
        match self
            .conn
            .execute("INSERT INTO groups (name) VALUES (?1)", params![name])
        {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(AncileError::UniquenessViolation { name });
            }
            Err(e) => return Err(e.into()),
        }
        let id = self.conn.last_insert_rowid();
        info!(group_id = id, name = %name, "created group");
        Ok(Group { id, name })
    }

    pub fn rename_group(&self, id: i64, name: &str) -> Result<Group> {
        let name = clean_name(name, "group name")?;
        let affected = match self.conn.execute(
            "UPDATE groups SET name = ?1 WHERE id = ?2",
            params![name, id],
        ) {
            Ok(n) => n,
            Err(e) if is_unique_violation(&e) => {
                return Err(AncileError::UniquenessViolation { name });
            }
            Err(e) => return Err(e.into()),
        };
        if affected == 0 {
            return Err(AncileError::NotFound { kind: "group", id });
        }
        info!(group_id = id, name = %name, "renamed group");
        Ok(Group { id, name })
    }

    /// Delete a group and every card in it. Returns the number of cards removed.
    pub fn delete_group(&mut self, id: i64) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let cards = tx.execute("DELETE FROM cards WHERE group_id = ?1", params![id])?;
        let groups = tx.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
        if groups == 0 {
            // Dropping the transaction rolls back
            return Err(AncileError::NotFound { kind: "group", id });
        }
        tx.commit()?;
        info!(group_id = id, cards_removed = cards, "deleted group");
        Ok(cards)
    }

    pub fn get_group(&self, id: i64) -> Result<Group> {
        self.conn
            .query_row(
                "SELECT id, name FROM groups WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Group {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(AncileError::NotFound { kind: "group", id })
    }

    pub fn find_group(&self, name: &str) -> Result<Option<Group>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name FROM groups WHERE name = ?1",
                params![name.trim()],
                |row| {
                    Ok(Group {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// All groups in creation order.
    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM groups ORDER BY id")?;
        let groups = stmt
            .query_map([], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    // ------------------------------------------------------------------
    // Cards
    // ------------------------------------------------------------------

    pub fn add_card(&self, group_id: i64, title: &str, description: &str) -> Result<Card> {
        let title = clean_name(title, "card title")?;
        let description = description.trim().to_string();
        // Explicit check: legacy tables carry no foreign key
        self.get_group(group_id)?;
        self.conn.execute(
            "INSERT INTO cards (group_id, title, description) VALUES (?1, ?2, ?3)",
            params![group_id, title, description],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(card_id = id, group_id, title = %title, "added card");
        Ok(Card {
            id,
            group_id,
            title,
            description,
        })
    }

    /// Rename a card. Its document follows the new title when no other card
    /// still uses the old title and nothing is saved under the new one;
    /// otherwise the document stays put. Returns whether it moved.
    pub fn rename_card(&mut self, id: i64, title: &str) -> Result<bool> {
        let title = clean_name(title, "card title")?;
        let tx = self.conn.transaction()?;
        let old: String = tx
            .query_row(
                "SELECT title FROM cards WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(AncileError::NotFound { kind: "card", id })?;
        tx.execute(
            "UPDATE cards SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;

        let mut moved = false;
        if old != title {
            let still_used: i64 = tx.query_row(
                "SELECT COUNT(*) FROM cards WHERE title = ?1",
                params![old],
                |row| row.get(0),
            )?;
            let target_taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE title = ?1)",
                params![title],
                |row| row.get(0),
            )?;
            if still_used == 0 && !target_taken {
                moved = tx.execute(
                    "UPDATE documents SET title = ?1 WHERE title = ?2",
                    params![title, old],
                )? > 0;
            }
        }
        tx.commit()?;
        info!(card_id = id, from = %old, to = %title, document_moved = moved, "renamed card");
        Ok(moved)
    }

    /// Delete a card. Its document is kept.
    pub fn delete_card(&self, id: i64) -> Result<()> {
        let affected = self
            .conn
            .execute("DELETE FROM cards WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(AncileError::NotFound { kind: "card", id });
        }
        info!(card_id = id, "deleted card");
        Ok(())
    }

    pub fn get_card(&self, id: i64) -> Result<Card> {
        self.conn
            .query_row(
                "SELECT id, group_id, title, description FROM cards WHERE id = ?1",
                params![id],
                map_card_row,
            )
            .optional()?
            .ok_or(AncileError::NotFound { kind: "card", id })
    }

    /// First card carrying `title`, if any.
    pub fn find_card(&self, title: &str) -> Result<Option<Card>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, group_id, title, description FROM cards WHERE title = ?1 ORDER BY id LIMIT 1",
                params![title],
                map_card_row,
            )
            .optional()?)
    }

    pub fn list_cards(&self, group_id: i64) -> Result<Vec<Card>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, title, description FROM cards WHERE group_id = ?1 ORDER BY id",
        )?;
        let cards = stmt
            .query_map(params![group_id], map_card_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cards)
    }

    /// Every group with its cards, both in creation order.
    pub fn load_board(&self) -> Result<Vec<BoardGroup>> {
        self.list_groups()?
            .into_iter()
            .map(|group| {
                let cards = self.list_cards(group.id)?;
                Ok(BoardGroup { group, cards })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Insert or replace the content stored under `title`.
    pub fn save_document(&self, title: &str, content: &str) -> Result<()> {
        let title = clean_name(title, "document title")?;
        self.conn.execute(
            "INSERT INTO documents (title, content) VALUES (?1, ?2)
             ON CONFLICT(title) DO UPDATE SET content = excluded.content",
            params![title, content],
        )?;
        info!(title = %title, bytes = content.len(), "saved document");
        Ok(())
    }

    pub fn load_document(&self, title: &str) -> Result<Option<String>> {
        let content: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT content FROM documents WHERE title = ?1",
                params![title],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content.map(Option::unwrap_or_default))
    }

    #[cfg(test)]
    pub fn count_orphan_cards(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM cards WHERE group_id NOT IN (SELECT id FROM groups)",
            [],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_an005_create_group() {
        let s = store();
        let g = s.create_group("  Tools ").unwrap();
        assert_eq!(g.name, "Tools");
        assert_eq!(s.list_groups().unwrap(), vec![g]);
    }

    #[test]
    fn test_an005_duplicate_group_rejected() {
        let s = store();
        s.create_group("tools").unwrap();
        let err = s.create_group("tools").unwrap_err();
        assert!(matches!(err, AncileError::UniquenessViolation { ref name } if name == "tools"));
        assert_eq!(s.list_groups().unwrap().len(), 1);
    }

    #[test]
    fn test_an005_blank_group_rejected() {
        let s = store();
        assert!(matches!(s.create_group("   "), Err(AncileError::InvalidName(_))));
        assert!(s.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_an005_rename_group_conflict_keeps_state() {
        let s = store();
        let a = s.create_group("a").unwrap();
        s.create_group("b").unwrap();
        let err = s.rename_group(a.id, "b").unwrap_err();
        assert!(matches!(err, AncileError::UniquenessViolation { .. }));
        assert_eq!(s.get_group(a.id).unwrap().name, "a");
    }

    #[test]
    fn test_an005_rename_group_missing() {
        let s = store();
        assert!(matches!(
            s.rename_group(99, "x"),
            Err(AncileError::NotFound { kind: "group", id: 99 })
        ));
    }

    #[test]
    fn test_an005_delete_group_cascades() {
        let mut s = store();
        let g = s.create_group("g").unwrap();
        let other = s.create_group("other").unwrap();
        s.add_card(g.id, "one", "").unwrap();
        s.add_card(g.id, "two", "").unwrap();
        let keep = s.add_card(other.id, "three", "").unwrap();

        assert_eq!(s.delete_group(g.id).unwrap(), 2);
        assert!(s.get_group(g.id).is_err());
        assert!(s.list_cards(g.id).unwrap().is_empty());
        assert_eq!(s.list_cards(other.id).unwrap(), vec![keep]);
        assert_eq!(s.count_orphan_cards().unwrap(), 0);
    }

    #[test]
    fn test_an005_delete_missing_group() {
        let mut s = store();
        assert!(matches!(s.delete_group(7), Err(AncileError::NotFound { .. })));
    }

    #[test]
    fn test_an005_card_requires_group() {
        let s = store();
        assert!(matches!(
            s.add_card(42, "t", "d"),
            Err(AncileError::NotFound { kind: "group", .. })
        ));
    }

    #[test]
    fn test_an005_cards_in_order() {
        let s = store();
        let g = s.create_group("g").unwrap();
        let a = s.add_card(g.id, "a", "first").unwrap();
        let b = s.add_card(g.id, "b", "").unwrap();
        let cards = s.list_cards(g.id).unwrap();
        assert_eq!(cards, vec![a, b]);
        assert_eq!(cards[0].description, "first");
    }

    #[test]
    fn test_an005_delete_card() {
        let s = store();
        let g = s.create_group("g").unwrap();
        let c = s.add_card(g.id, "a", "").unwrap();
        s.delete_card(c.id).unwrap();
        assert!(s.get_card(c.id).is_err());
        assert!(s.delete_card(c.id).is_err());
    }

    #[test]
    fn test_an005_document_roundtrip() {
        let s = store();
        assert_eq!(s.load_document("t").unwrap(), None);
        s.save_document("t", "print('a')").unwrap();
        s.save_document("t", "print('b')").unwrap();
        assert_eq!(s.load_document("t").unwrap().as_deref(), Some("print('b')"));
    }

    #[test]
    fn test_an005_rename_card_moves_document() {
        let mut s = store();
        let g = s.create_group("g").unwrap();
        let c = s.add_card(g.id, "old", "").unwrap();
        s.save_document("old", "x = 1").unwrap();

        assert!(s.rename_card(c.id, "new").unwrap());
        assert_eq!(s.get_card(c.id).unwrap().title, "new");
        assert_eq!(s.load_document("new").unwrap().as_deref(), Some("x = 1"));
        assert_eq!(s.load_document("old").unwrap(), None);
    }

    #[test]
    fn test_an005_rename_card_shared_title_keeps_document() {
        let mut s = store();
        let g = s.create_group("g").unwrap();
        let c = s.add_card(g.id, "shared", "").unwrap();
        s.add_card(g.id, "shared", "").unwrap();
        s.save_document("shared", "x = 1").unwrap();

        assert!(!s.rename_card(c.id, "mine").unwrap());
        assert_eq!(s.load_document("shared").unwrap().as_deref(), Some("x = 1"));
        assert_eq!(s.load_document("mine").unwrap(), None);
    }

    #[test]
    fn test_an005_rename_card_never_overwrites() {
        let mut s = store();
        let g = s.create_group("g").unwrap();
        let c = s.add_card(g.id, "a", "").unwrap();
        s.save_document("a", "from a").unwrap();
        s.save_document("b", "from b").unwrap();

        assert!(!s.rename_card(c.id, "b").unwrap());
        assert_eq!(s.load_document("b").unwrap().as_deref(), Some("from b"));
        assert_eq!(s.load_document("a").unwrap().as_deref(), Some("from a"));
    }

    #[test]
    fn test_an005_load_board() {
        let s = store();
        let g1 = s.create_group("first").unwrap();
        let g2 = s.create_group("second").unwrap();
        s.add_card(g2.id, "c", "").unwrap();
        let board = s.load_board().unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].group, g1);
        assert!(board[0].cards.is_empty());
        assert_eq!(board[1].cards.len(), 1);
    }

    #[test]
    fn test_an005_find_helpers() {
        let s = store();
        let g = s.create_group("g").unwrap();
        let c = s.add_card(g.id, "t", "").unwrap();
        assert_eq!(s.find_group(" g ").unwrap(), Some(g));
        assert_eq!(s.find_card("t").unwrap(), Some(c));
        assert_eq!(s.find_card("nope").unwrap(), None);
    }

    #[test]
    fn test_an005_reopen_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        {
            let s = Store::open(&path).unwrap();
            s.create_group("kept").unwrap();
            s.save_document("doc", "body").unwrap();
        }
        let s = Store::open(&path).unwrap();
        assert_eq!(s.list_groups().unwrap()[0].name, "kept");
        assert_eq!(s.load_document("doc").unwrap().as_deref(), Some("body"));
    }

    #[test]
    fn test_an005_legacy_nullable_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE groups (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE);
             CREATE TABLE cards (id INTEGER PRIMARY KEY AUTOINCREMENT, group_id INTEGER,
                                 title TEXT, description TEXT);
             CREATE TABLE documents (title TEXT PRIMARY KEY, content TEXT);
             INSERT INTO groups (name) VALUES ('g');
             INSERT INTO cards (group_id, title, description) VALUES (1, 't', NULL);
             INSERT INTO documents (title, content) VALUES ('t', NULL);",
        )
        .unwrap();
        let s = Store::init(conn).unwrap();
        assert_eq!(s.list_cards(1).unwrap()[0].description, "");
        assert_eq!(s.load_document("t").unwrap().as_deref(), Some(""));
    }

    proptest! {
        #[test]
        fn prop_an005_group_names_unique(names in proptest::collection::vec("[a-c]{1,2}", 1..12)) {
            let s = store();
            let mut accepted = std::collections::HashSet::new();
            for n in &names {
                match s.create_group(n) {
                    Ok(_) => prop_assert!(accepted.insert(n.clone())),
                    Err(AncileError::UniquenessViolation { .. }) => prop_assert!(accepted.contains(n)),
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            }
            prop_assert_eq!(s.list_groups().unwrap().len(), accepted.len());
        }
    }
}
