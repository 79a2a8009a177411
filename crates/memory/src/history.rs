//! Append-only mutation journal backed by [`redb`].
//!
//! Every ADD / UPDATE / DELETE applied to the vector store appends one
//! [`HistoryEntry`].  Entries are never rewritten; the only destructive
//! operation is [`HistoryJournal::reset`].
//!
//! # Tables
//!
//! | Name                | Key                   | Value                           |
//! |---------------------|-----------------------|---------------------------------|
//! | `history_entries`   | entry id (&str)       | JSON-encoded [`HistoryEntry`]   |
//! | `history_by_memory` | memory id (&str)      | newline-separated entry ids     |
//! | `meta`              | `"schema_version"`    | u64                             |
//!
//! # Schema versions
//!
//! Version 1 journals kept everything in a single `history` table with
//! `prev_value` / `timestamp` columns and no secondary index.  They are
//! migrated in place on open: every entry is carried over, the index is
//! rebuilt and the legacy table is dropped.

use std::path::{Path, PathBuf};

use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableHandle,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::schema::{HistoryEvent, parse_stamp};

const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("history_entries");
const MEMORY_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("history_by_memory");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const LEGACY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const SCHEMA_VERSION: u64 = 2;

fn journal_err(err: impl std::fmt::Display) -> MemoryError {
    MemoryError::History(err.to_string())
}

/// One journal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub memory_id: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub event: HistoryEvent,
    pub created_at: String,
    pub updated_at: String,
    pub is_deleted: bool,
}

impl HistoryEntry {
    /// A fresh entry with a new journal id.  `is_deleted` follows the event.
    pub fn new(
        memory_id: impl Into<String>,
        event: HistoryEvent,
        old_value: Option<String>,
        new_value: Option<String>,
        created_at: impl Into<String>,
        updated_at: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            memory_id: memory_id.into(),
            old_value,
            new_value,
            event,
            created_at: created_at.into(),
            updated_at: updated_at.into(),
            is_deleted: event == HistoryEvent::Delete,
        }
    }
}

/// Row shape of a version 1 journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LegacyEntry {
    pub id: String,
    pub memory_id: String,
    #[serde(default)]
    pub prev_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    #[serde(default)]
    pub event: String,
    pub timestamp: String,
    #[serde(default)]
    pub is_deleted: LegacyFlag,
}

/// Version 1 wrote the deleted flag as either a bool or a 0/1 integer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum LegacyFlag {
    Bool(bool),
    Int(i64),
}

impl Default for LegacyFlag {
    fn default() -> Self {
        Self::Bool(false)
    }
}

impl LegacyFlag {
    fn is_set(self) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
        }
    }
}

impl LegacyEntry {
    fn upgrade(self) -> HistoryEntry {
        let is_deleted = self.is_deleted.is_set();
        let event = match self.event.trim().to_ascii_uppercase().as_str() {
            "ADD" => HistoryEvent::Add,
            "UPDATE" => HistoryEvent::Update,
            "DELETE" => HistoryEvent::Delete,
            // Unlabelled rows: infer from what the row carries.
            _ if is_deleted => HistoryEvent::Delete,
            _ if self.prev_value.is_some() => HistoryEvent::Update,
            _ => HistoryEvent::Add,
        };
        HistoryEntry {
            id: self.id,
            memory_id: self.memory_id,
            old_value: self.prev_value,
            new_value: self.new_value,
            event,
            created_at: self.timestamp.clone(),
            updated_at: self.timestamp,
            is_deleted,
        }
    }
}

/// Where the mutation executor records applied changes.
pub trait HistoryLog: Send + Sync {
    fn append(&self, entry: &HistoryEntry) -> Result<()>;
}

impl HistoryLog for HistoryJournal {
    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        HistoryJournal::append(self, entry)
    }
}

pub struct HistoryJournal {
    db: Database,
    path: Option<PathBuf>,
}

impl HistoryJournal {
    /// Open or create the journal file at `path`, migrating older layouts.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(journal_err)?;
        }
        let db = Database::create(&path)
            .map_err(|e| journal_err(format!("opening {}: {e}", path.display())))?;
        let mut journal = Self::from_database(db)?;
        journal.path = Some(path);
        Ok(journal)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(journal_err)?;
        Self::from_database(db)
    }

    /// Wrap an already-open database, migrating it to the current layout.
    pub fn from_database(db: Database) -> Result<Self> {
        let journal = Self { db, path: None };
        journal.migrate()?;
        Ok(journal)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&self) -> Result<()> {
        let tx = self.db.begin_write().map_err(journal_err)?;
        let version = {
            let meta = tx.open_table(META_TABLE).map_err(journal_err)?;
            meta.get(SCHEMA_VERSION_KEY)
                .map_err(journal_err)?
                .map(|v| v.value())
        };
        match version {
            Some(SCHEMA_VERSION) => {}
            Some(other) => {
                return Err(MemoryError::History(format!(
                    "journal schema version {other} is newer than supported version {SCHEMA_VERSION}"
                )));
            }
            None => {
                let has_legacy = tx
                    .list_tables()
                    .map_err(journal_err)?
                    .any(|t| t.name() == LEGACY_TABLE.name());
                if has_legacy {
                    let migrated = migrate_legacy(&tx)?;
                    info!(entries = migrated, "migrated history journal from schema v1");
                }
                tx.open_table(ENTRIES_TABLE).map_err(journal_err)?;
                tx.open_table(MEMORY_INDEX_TABLE).map_err(journal_err)?;
                let mut meta = tx.open_table(META_TABLE).map_err(journal_err)?;
                meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)
                    .map_err(journal_err)?;
            }
        }
        tx.commit().map_err(journal_err)
    }

    /// Append one entry.
    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let tx = self.db.begin_write().map_err(journal_err)?;
        write_entry(&tx, entry)?;
        tx.commit().map_err(journal_err)?;
        debug!(memory_id = %entry.memory_id, event = %entry.event, "history entry appended");
        Ok(())
    }

    /// Every entry for `memory_id`, oldest `updated_at` first.  Entries with
    /// identical stamps keep their append order.
    pub fn get_history(&self, memory_id: &str) -> Result<Vec<HistoryEntry>> {
        let tx = self.db.begin_read().map_err(journal_err)?;
        let index = tx.open_table(MEMORY_INDEX_TABLE).map_err(journal_err)?;
        let entries = tx.open_table(ENTRIES_TABLE).map_err(journal_err)?;
        let ids = index
            .get(memory_id)
            .map_err(journal_err)?
            .map(|v| v.value().to_string())
            .unwrap_or_default();

        let mut out = Vec::new();
        for id in ids.lines().filter(|s| !s.is_empty()) {
            if let Some(raw) = entries.get(id).map_err(journal_err)? {
                out.push(serde_json::from_slice::<HistoryEntry>(raw.value()).map_err(journal_err)?);
            }
        }
        out.sort_by_key(|e| parse_stamp(&e.updated_at));
        Ok(out)
    }

    /// Total number of entries across all memories.
    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read().map_err(journal_err)?;
        let tbl = tx.open_table(ENTRIES_TABLE).map_err(journal_err)?;
        Ok(tbl.len().map_err(journal_err)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every entry.  The schema version is kept.
    pub fn reset(&self) -> Result<()> {
        let tx = self.db.begin_write().map_err(journal_err)?;
        tx.delete_table(ENTRIES_TABLE).map_err(journal_err)?;
        tx.delete_table(MEMORY_INDEX_TABLE).map_err(journal_err)?;
        tx.open_table(ENTRIES_TABLE).map_err(journal_err)?;
        tx.open_table(MEMORY_INDEX_TABLE).map_err(journal_err)?;
        tx.commit().map_err(journal_err)?;
        info!("history journal reset");
        Ok(())
    }
}

fn write_entry(tx: &WriteTransaction, entry: &HistoryEntry) -> Result<()> {
    let bytes = serde_json::to_vec(entry).map_err(journal_err)?;
    let mut entries = tx.open_table(ENTRIES_TABLE).map_err(journal_err)?;
    entries
        .insert(entry.id.as_str(), bytes.as_slice())
        .map_err(journal_err)?;

    let mut index = tx.open_table(MEMORY_INDEX_TABLE).map_err(journal_err)?;
    let existing = index
        .get(entry.memory_id.as_str())
        .map_err(journal_err)?
        .map(|v| v.value().to_string())
        .unwrap_or_default();
    let updated = if existing.is_empty() {
        entry.id.clone()
    } else {
        format!("{existing}\n{}", entry.id)
    };
    index
        .insert(entry.memory_id.as_str(), updated.as_str())
        .map_err(journal_err)?;
    Ok(())
}

fn migrate_legacy(tx: &WriteTransaction) -> Result<usize> {
    let mut legacy: Vec<LegacyEntry> = Vec::new();
    {
        let tbl = tx.open_table(LEGACY_TABLE).map_err(journal_err)?;
        for row in tbl.iter().map_err(journal_err)? {
            let (_, v) = row.map_err(journal_err)?;
            legacy.push(serde_json::from_slice(v.value()).map_err(journal_err)?);
        }
    }
    // Version 1 had no index; append order is recovered from timestamps.
    legacy.sort_by_key(|e| parse_stamp(&e.timestamp));
    let count = legacy.len();
    for entry in legacy {
        write_entry(tx, &entry.upgrade())?;
    }
    tx.delete_table(LEGACY_TABLE).map_err(journal_err)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Clock;

    fn entry(memory_id: &str, event: HistoryEvent, stamp: &str) -> HistoryEntry {
        HistoryEntry::new(
            memory_id,
            event,
            None,
            Some(format!("{event} value")),
            stamp,
            stamp,
        )
    }

    #[test]
    fn appended_entries_come_back_in_updated_at_order() {
        let journal = HistoryJournal::in_memory().unwrap();
        journal
            .append(&entry("m1", HistoryEvent::Update, "2024-01-02T00:00:00.000000+00:00"))
            .unwrap();
        journal
            .append(&entry("m1", HistoryEvent::Add, "2024-01-01T00:00:00.000000+00:00"))
            .unwrap();
        journal
            .append(&entry("m2", HistoryEvent::Add, "2024-01-01T00:00:00.000000+00:00"))
            .unwrap();

        let history = journal.get_history("m1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, HistoryEvent::Add);
        assert_eq!(history[1].event, HistoryEvent::Update);
        assert_eq!(journal.len().unwrap(), 3);
        assert!(journal.get_history("unknown").unwrap().is_empty());
    }

    #[test]
    fn ordering_compares_instants_across_offsets() {
        let journal = HistoryJournal::in_memory().unwrap();
        // 01:00+02:00 is 23:00Z the previous day, so it sorts first.
        journal
            .append(&entry("m1", HistoryEvent::Update, "2024-01-01T00:30:00.000000+00:00"))
            .unwrap();
        journal
            .append(&entry("m1", HistoryEvent::Add, "2024-01-01T01:00:00.000000+02:00"))
            .unwrap();
        let history = journal.get_history("m1").unwrap();
        assert_eq!(history[0].event, HistoryEvent::Add);
    }

    #[test]
    fn delete_entries_carry_the_deleted_flag() {
        let e = HistoryEntry::new("m1", HistoryEvent::Delete, Some("old".into()), None, "t", "t");
        assert!(e.is_deleted);
        let e = HistoryEntry::new("m1", HistoryEvent::Add, None, Some("new".into()), "t", "t");
        assert!(!e.is_deleted);
    }

    #[test]
    fn reset_drops_all_entries() {
        let journal = HistoryJournal::in_memory().unwrap();
        let now = Clock::utc().stamp();
        journal.append(&entry("m1", HistoryEvent::Add, &now)).unwrap();
        journal.reset().unwrap();
        assert!(journal.is_empty().unwrap());
        assert!(journal.get_history("m1").unwrap().is_empty());
        journal.append(&entry("m1", HistoryEvent::Add, &now)).unwrap();
        assert_eq!(journal.len().unwrap(), 1);
    }

    #[test]
    fn legacy_layout_is_migrated_on_open() {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .unwrap();
        {
            let tx = db.begin_write().unwrap();
            {
                let mut tbl = tx.open_table(LEGACY_TABLE).unwrap();
                let rows = [
                    serde_json::json!({
                        "id": "h1", "memory_id": "m1", "prev_value": null,
                        "new_value": "Loves cheese pizza", "event": "ADD",
                        "timestamp": "2024-03-01T10:00:00+00:00", "is_deleted": 0
                    }),
                    serde_json::json!({
                        "id": "h2", "memory_id": "m1", "prev_value": "Loves cheese pizza",
                        "new_value": null, "event": "DELETE",
                        "timestamp": "2024-03-02T10:00:00+00:00", "is_deleted": 1
                    }),
                ];
                for row in rows {
                    let id = row["id"].as_str().unwrap().to_string();
                    let bytes = serde_json::to_vec(&row).unwrap();
                    tbl.insert(id.as_str(), bytes.as_slice()).unwrap();
                }
            }
            tx.commit().unwrap();
        }

        let journal = HistoryJournal::from_database(db).unwrap();
        let history = journal.get_history("m1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "h1");
        assert_eq!(history[0].event, HistoryEvent::Add);
        assert_eq!(history[0].created_at, "2024-03-01T10:00:00+00:00");
        assert_eq!(history[1].old_value.as_deref(), Some("Loves cheese pizza"));
        assert!(history[1].is_deleted);

        let tx = journal.db.begin_read().unwrap();
        let names: Vec<String> = tx
            .list_tables()
            .unwrap()
            .map(|t| t.name().to_string())
            .collect();
        assert!(!names.contains(&"history".to_string()));
    }

    #[test]
    fn legacy_rows_without_event_labels_are_inferred() {
        let row: LegacyEntry = serde_json::from_value(serde_json::json!({
            "id": "h", "memory_id": "m", "prev_value": "a", "new_value": "b",
            "timestamp": "2024-01-01T00:00:00+00:00", "is_deleted": false
        }))
        .unwrap();
        assert_eq!(row.upgrade().event, HistoryEvent::Update);
    }

    #[test]
    fn file_backed_journal_reopens_without_remigrating() {
        let path = std::env::temp_dir().join(format!("recollect-history-{}.redb", Uuid::new_v4()));
        {
            let journal = HistoryJournal::open(&path).unwrap();
            journal
                .append(&entry("m1", HistoryEvent::Add, &Clock::utc().stamp()))
                .unwrap();
        }
        let journal = HistoryJournal::open(&path).unwrap();
        assert_eq!(journal.get_history("m1").unwrap().len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
