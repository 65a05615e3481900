//! Terminal-resident persistent cache.
//!
//! Four record families live in one redb database. Each logical write runs
//! in a single write transaction, so a reader never observes a torn state
//! within one call; there is deliberately no cross-call atomicity, the next
//! sync cycle repairs anything a crash left behind.
//!
//! Reads degrade: a storage error yields an empty result and a warning, so
//! the rendering side falls back to "no cached data" instead of crashing.
//! Writes propagate their errors; the sync orchestrator counts them as
//! partial failures.

use std::collections::HashSet;
use std::path::Path;

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use marquee_proto::{CacheMetadata, Display, Screen, ScreenState};

const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");
const DISPLAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("displays");
const SCREENS: TableDefinition<&str, &[u8]> = TableDefinition::new("screens");
const STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("states");
const SCREENS_BY_DISPLAY: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("screens_by_display");

const METADATA_KEY: &str = "meta";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("open database: {0}")]
    Open(#[from] redb::DatabaseError),
    #[error("transaction: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(METADATA)?;
            txn.open_table(DISPLAYS)?;
            txn.open_table(SCREENS)?;
            txn.open_table(STATES)?;
            txn.open_multimap_table(SCREENS_BY_DISPLAY)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Replace the display family wholesale: upsert everything incoming,
    /// prune ids that are no longer present.
    pub fn replace_displays(&self, displays: &[Display]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DISPLAYS)?;
            let keep: HashSet<&str> = displays.iter().map(|d| d.id.as_str()).collect();
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                if !keep.contains(key.value()) {
                    stale.push(key.value().to_string());
                }
            }
            for id in &stale {
                table.remove(id.as_str())?;
            }
            for display in displays {
                let encoded = serde_json::to_vec(display)?;
                table.insert(display.id.as_str(), encoded.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Replace one display's screens. Screens that dropped out of the
    /// authoritative set lose their cached record, their index entry, and
    /// their screen state in the same transaction, so a deleted screen can
    /// never leave an orphan state behind.
    pub fn replace_screens(&self, display_id: &str, screens: &[Screen]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut screens_table = txn.open_table(SCREENS)?;
            let mut index = txn.open_multimap_table(SCREENS_BY_DISPLAY)?;
            let mut states_table = txn.open_table(STATES)?;

            let keep: HashSet<&str> = screens.iter().map(|s| s.id.as_str()).collect();
            let mut stale = Vec::new();
            for value in index.get(display_id)? {
                let value = value?;
                if !keep.contains(value.value()) {
                    stale.push(value.value().to_string());
                }
            }
            for id in &stale {
                screens_table.remove(id.as_str())?;
                index.remove(display_id, id.as_str())?;
                states_table.remove(id.as_str())?;
            }
            for screen in screens {
                let encoded = serde_json::to_vec(screen)?;
                screens_table.insert(screen.id.as_str(), encoded.as_slice())?;
                index.insert(screen.display_id.as_str(), screen.id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Replace the state family wholesale, pruning states for screens that
    /// are no longer in the incoming set.
    pub fn replace_states(&self, states: &[ScreenState]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATES)?;
            let keep: HashSet<&str> = states.iter().map(|s| s.screen_id.as_str()).collect();
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                if !keep.contains(key.value()) {
                    stale.push(key.value().to_string());
                }
            }
            for id in &stale {
                table.remove(id.as_str())?;
            }
            for state in states {
                let encoded = serde_json::to_vec(state)?;
                table.insert(state.screen_id.as_str(), encoded.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete displays by key set.
    pub fn delete_displays(&self, display_ids: &[String]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DISPLAYS)?;
            for id in display_ids {
                table.remove(id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete screens by id set, dropping index entries and screen states
    /// with them.
    pub fn delete_screens(&self, screen_ids: &[String]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut screens_table = txn.open_table(SCREENS)?;
            let mut index = txn.open_multimap_table(SCREENS_BY_DISPLAY)?;
            let mut states_table = txn.open_table(STATES)?;
            for id in screen_ids {
                let display_id = screens_table
                    .remove(id.as_str())?
                    .and_then(|guard| decode::<Screen>(guard.value()))
                    .map(|screen| screen.display_id);
                if let Some(display_id) = display_id {
                    index.remove(display_id.as_str(), id.as_str())?;
                }
                states_table.remove(id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete screen states by key set.
    pub fn delete_states(&self, screen_ids: &[String]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATES)?;
            for id in screen_ids {
                table.remove(id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METADATA)?;
            let encoded = serde_json::to_vec(metadata)?;
            table.insert(METADATA_KEY, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn metadata(&self) -> Option<CacheMetadata> {
        match self.try_metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %err, "metadata read failed; treating cache as cold");
                None
            }
        }
    }

    fn try_metadata(&self) -> Result<Option<CacheMetadata>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METADATA)?;
        Ok(table
            .get(METADATA_KEY)?
            .and_then(|guard| decode(guard.value())))
    }

    pub fn displays(&self) -> Vec<Display> {
        self.read_family(DISPLAYS, "displays")
    }

    pub fn states(&self) -> Vec<ScreenState> {
        self.read_family(STATES, "states")
    }

    pub fn screens_for_display(&self, display_id: &str) -> Vec<Screen> {
        match self.try_screens_for_display(display_id) {
            Ok(screens) => screens,
            Err(err) => {
                warn!(error = %err, display = %display_id, "screen cache read failed");
                Vec::new()
            }
        }
    }

    fn try_screens_for_display(&self, display_id: &str) -> Result<Vec<Screen>, StoreError> {
        let txn = self.db.begin_read()?;
        let index = txn.open_multimap_table(SCREENS_BY_DISPLAY)?;
        let table = txn.open_table(SCREENS)?;
        let mut screens = Vec::new();
        for value in index.get(display_id)? {
            let value = value?;
            if let Some(guard) = table.get(value.value())? {
                if let Some(screen) = decode::<Screen>(guard.value()) {
                    screens.push(screen);
                }
            }
        }
        screens.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(screens)
    }

    fn read_family<T: DeserializeOwned + Ordered>(
        &self,
        table: TableDefinition<&'static str, &'static [u8]>,
        family: &str,
    ) -> Vec<T> {
        match self.try_read_family(table) {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, %family, "cache read failed; returning empty set");
                Vec::new()
            }
        }
    }

    fn try_read_family<T: DeserializeOwned + Ordered>(
        &self,
        table: TableDefinition<&'static str, &'static [u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            if let Some(record) = decode(value.value()) {
                records.push(record);
            }
        }
        records.sort_by(|a: &T, b: &T| a.order_key().cmp(b.order_key()));
        Ok(records)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(error = %err, "skipping undecodable cached record");
            None
        }
    }
}

/// Stable ordering for read results, so callers see deterministic lists.
trait Ordered {
    fn order_key(&self) -> &str;
}

impl Ordered for Display {
    fn order_key(&self) -> &str {
        &self.id
    }
}

impl Ordered for ScreenState {
    fn order_key(&self) -> &str {
        &self.screen_id
    }
}
