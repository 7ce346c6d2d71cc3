//! Flat per-container persistent records.
//!
//! One JSON object per container id under the kvs directory. Records are a
//! flat `key → string` map; `id`, `name` and `state` are reserved keys, every
//! other key is a property tag. Loaders tolerate unknown keys so records
//! survive daemon downgrades.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use arbor_common::{Error, ErrorKind, Result};

/// Reserved key: numeric container id.
pub const KEY_ID: &str = "id";
/// Reserved key: full container name.
pub const KEY_NAME: &str = "name";
/// Reserved key: lifecycle state.
pub const KEY_STATE: &str = "state";

/// One persisted record.
pub type Record = BTreeMap<String, String>;

/// Store of per-container records in one directory.
#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    /// Opens (and creates) the store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::system("mkdir", &e).context(dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Writes a record, replacing any previous content atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub fn save(&self, id: u32, record: &Record) -> Result<()> {
        let path = self.record_path(id);
        let tmp = self.dir.join(format!(".{id}.tmp"));
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, json).map_err(|e| Error::system("write", &e).context(tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::system("rename", &e).context(path.display()))?;
        tracing::trace!(id, keys = record.len(), "kv record saved");
        Ok(())
    }

    /// Reads one record.
    ///
    /// # Errors
    ///
    /// Returns `NoValue` if the record does not exist, or an error if it
    /// cannot be read or parsed.
    pub fn load(&self, id: u32) -> Result<Record> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(Error::new(ErrorKind::NoValue, format!("no record for id {id}")));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::system("read", &e).context(path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Removes a record; a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlink fails.
    pub fn remove(&self, id: u32) -> Result<()> {
        let path = self.record_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::system("unlink", &e).context(path.display())),
        }
    }

    /// All records ordered by numeric id, the order recovery relies on.
    ///
    /// Unparsable entries are logged and skipped so one corrupt record does
    /// not block daemon boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<(u32, Record)>> {
        let mut records = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::system("readdir", &e).context(self.dir.display()))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::system("readdir", &e))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            match self.load(id) {
                Ok(record) => records.push((id, record)),
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable kv record"),
            }
        }
        records.sort_by_key(|(id, _)| *id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KvStore::open(dir.path()).expect("open");
        (dir, store)
    }

    #[test]
    fn save_load_round_trip() {
        let (_dir, store) = store();
        let mut record = Record::new();
        record.insert(KEY_ID.into(), "7".into());
        record.insert(KEY_NAME.into(), "a/b".into());
        record.insert(KEY_STATE.into(), "stopped".into());
        record.insert("memory_limit".into(), "67108864".into());

        store.save(7, &record).expect("save");
        let loaded = store.load(7).expect("load");
        assert_eq!(loaded, record);
    }

    #[test]
    fn missing_record_is_no_value() {
        let (_dir, store) = store();
        let err = store.load(99).expect_err("missing");
        assert_eq!(err.kind, arbor_common::ErrorKind::NoValue);
    }

    #[test]
    fn list_orders_by_numeric_id() {
        let (_dir, store) = store();
        for id in [30, 2, 11] {
            let mut record = Record::new();
            record.insert(KEY_ID.into(), id.to_string());
            store.save(id, &record).expect("save");
        }
        let ids: Vec<u32> = store.list().expect("list").into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 11, 30]);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();
        store.save(3, &Record::new()).expect("save");
        store.remove(3).expect("remove");
        store.remove(3).expect("remove again");
        assert!(store.load(3).is_err());
    }

    #[test]
    fn corrupt_record_is_skipped_by_list() {
        let (dir, store) = store();
        store.save(1, &Record::new()).expect("save");
        std::fs::write(dir.path().join("2"), "not json").expect("write corrupt");
        let ids: Vec<u32> = store.list().expect("list").into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1]);
    }
}
