//! Level and account persistence for the server.
//!
//! Levels are stored one JSON document per level under the storage
//! directory; accounts (player name to password hash) live beside them.
//! Players are never part of a persisted level.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use blockfall_core::LevelRecord;

const ACCOUNTS_FILE: &str = "accounts.json";

/// Disk-backed storage rooted at the server's storage directory.
#[derive(Debug)]
pub(crate) struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Opens (and creates if needed) the storage directory.
    pub(crate) fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_owned(),
        })
    }

    /// Loads a persisted level, or `None` when it has never been saved.
    pub(crate) fn load_level(&self, name: &str) -> anyhow::Result<Option<LevelRecord>> {
        let path = self.level_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading level file {}", path.display()))?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing level file {}", path.display()))?;
        Ok(Some(record))
    }

    /// Persists the level, replacing any previous save.
    pub(crate) fn save_level(&self, record: &LevelRecord) -> anyhow::Result<()> {
        let path = self.level_path(&record.name);
        let bytes = serde_json::to_vec_pretty(record).context("encoding level")?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing level file {}", path.display()))?;
        log::info!(
            "saved level '{}' with {} entities",
            record.name,
            record.entities.len()
        );
        Ok(())
    }

    /// Verifies a returning player's password hash, or registers a new
    /// player under the presented hash. Returns whether the credential is
    /// accepted.
    pub(crate) fn verify_or_register(
        &self,
        name: &str,
        password_hash: &str,
    ) -> anyhow::Result<bool> {
        let mut accounts = self.load_accounts()?;
        match accounts.get(name) {
            Some(stored) => Ok(stored == password_hash),
            None => {
                let _ = accounts.insert(name.to_owned(), password_hash.to_owned());
                self.save_accounts(&accounts)?;
                Ok(true)
            }
        }
    }

    fn load_accounts(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let path = self.root.join(ACCOUNTS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading accounts file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing accounts file {}", path.display()))
    }

    fn save_accounts(&self, accounts: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let path = self.root.join(ACCOUNTS_FILE);
        let bytes = serde_json::to_vec_pretty(accounts).context("encoding accounts")?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing accounts file {}", path.display()))?;
        Ok(())
    }

    fn level_path(&self, name: &str) -> PathBuf {
        // Level names become file names; anything path-like is flattened.
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfall_core::EntityId;

    fn temp_root(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("blockfall-storage-{tag}-{}", std::process::id()));
        path
    }

    #[test]
    fn levels_round_trip_through_disk() {
        let root = temp_root("level");
        let storage = Storage::open(&root).expect("open");
        let record = LevelRecord {
            name: "plains".to_owned(),
            id: 4,
            width: 48,
            height: 32,
            highest_id: EntityId::new(17),
            entities: Vec::new(),
        };

        storage.save_level(&record).expect("save");
        let loaded = storage.load_level("plains").expect("load").expect("present");
        assert_eq!(loaded, record);

        assert!(storage.load_level("absent").expect("load").is_none());
        fs::remove_dir_all(&root).expect("cleanup");
    }

    #[test]
    fn first_login_registers_and_later_logins_must_match() {
        let root = temp_root("accounts");
        let storage = Storage::open(&root).expect("open");

        assert!(storage.verify_or_register("alice", "aGFzaA").expect("register"));
        assert!(storage.verify_or_register("alice", "aGFzaA").expect("verify"));
        assert!(!storage.verify_or_register("alice", "d3Jvbmc").expect("reject"));
        fs::remove_dir_all(&root).expect("cleanup");
    }
}
