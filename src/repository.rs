//! Durable `uuid -> Pair` mapping, JSON-file-backed with atomic rewrite.
//!
//! The on-disk file is the authoritative checkpoint: every mutation
//! rewrites it via write-temp-then-rename, so a crash mid-write never
//! leaves a half-written file in place.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pair::{Pair, PairQuery};

pub struct Repository {
    path: PathBuf,
    entries: Mutex<HashMap<Uuid, Pair>>,
}

impl Repository {
    /// Opens (creating if absent) the repository file at `path` and loads
    /// its current contents eagerly.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, "{}")?;
        }
        let text = fs::read_to_string(&path)?;
        let entries: HashMap<Uuid, Pair> = serde_json::from_str(&text)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<Uuid, Pair>) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn find(&self, query: &PairQuery) -> Vec<Pair> {
        let Ok(entries) = self.entries.lock() else {
            warn!("repository entries lock poisoned, returning no results");
            return Vec::new();
        };
        entries
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect()
    }

    pub fn create(&self, pair: Pair) -> Result<Pair> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("repository entries lock poisoned"))?;
        if entries.contains_key(&pair.uuid) {
            return Err(Error::EntityAlreadyExists);
        }
        entries.insert(pair.uuid, pair.clone());
        self.persist(&entries)?;
        Ok(pair)
    }

    pub fn read(&self, uuid: Uuid) -> Result<Pair> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("repository entries lock poisoned"))?;
        entries.get(&uuid).cloned().ok_or(Error::EntityNotFound)
    }

    pub fn update(&self, uuid: Uuid, mut pair: Pair) -> Result<Pair> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("repository entries lock poisoned"))?;
        if !entries.contains_key(&uuid) {
            return Err(Error::EntityNotFound);
        }
        pair.updated_at = time::OffsetDateTime::now_utc();
        entries.insert(uuid, pair.clone());
        self.persist(&entries)?;
        Ok(pair)
    }

    pub fn delete(&self, uuid: Uuid) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned("repository entries lock poisoned"))?;
        entries.remove(&uuid);
        self.persist(&entries)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::PairStatus;

    fn repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path().join("currency_pairs.json")).unwrap();
        (dir, repo)
    }

    #[test]
    fn create_then_read_round_trips_modulo_updated_at() {
        let (_dir, repo) = repo();
        let pair = Pair::new("btc", "usdt");
        let created = repo.create(pair.clone()).unwrap();
        let read = repo.read(created.uuid).unwrap();
        assert_eq!(read.uuid, pair.uuid);
        assert_eq!(read.base, "BTC");
        assert_eq!(read.quote, "USDT");
        assert_eq!(read.created_at, pair.created_at);
    }

    #[test]
    fn create_rejects_duplicate_uuid() {
        let (_dir, repo) = repo();
        let pair = Pair::new("btc", "usdt");
        repo.create(pair.clone()).unwrap();
        assert!(matches!(repo.create(pair), Err(Error::EntityAlreadyExists)));
    }

    #[test]
    fn read_unknown_uuid_fails() {
        let (_dir, repo) = repo();
        assert!(matches!(repo.read(Uuid::new_v4()), Err(Error::EntityNotFound)));
    }

    #[test]
    fn update_sets_updated_at_and_persists_across_reopen() {
        let (dir, repo) = repo();
        let mut pair = repo.create(Pair::new("eth", "usdt")).unwrap();
        pair.status = PairStatus::Active;
        let before = pair.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = repo.update(pair.uuid, pair.clone()).unwrap();
        assert!(updated.updated_at > before);

        let reopened = Repository::open(dir.path().join("currency_pairs.json")).unwrap();
        let reloaded = reopened.read(pair.uuid).unwrap();
        assert_eq!(reloaded.status, PairStatus::Active);
    }

    #[test]
    fn update_unknown_uuid_fails() {
        let (_dir, repo) = repo();
        assert!(matches!(
            repo.update(Uuid::new_v4(), Pair::new("btc", "usdt")),
            Err(Error::EntityNotFound)
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, repo) = repo();
        let pair = repo.create(Pair::new("btc", "usdt")).unwrap();
        repo.delete(pair.uuid).unwrap();
        repo.delete(pair.uuid).unwrap();
        assert!(repo.find(&PairQuery::default()).is_empty());
    }

    #[test]
    fn find_filters_by_query() {
        let (_dir, repo) = repo();
        repo.create(Pair::new("btc", "usdt")).unwrap();
        repo.create(Pair::new("eth", "usdt")).unwrap();
        let query = PairQuery {
            base: Some("BTC".to_string()),
            ..Default::default()
        };
        let found = repo.find(&query);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].base, "BTC");
    }
}
