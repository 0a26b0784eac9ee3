//! Client-side store of service identities and their pre-shared secrets.
//!
//! ```text
//! <base>/psk/management.json   [{"id", "description", "uri", "last_connect"}]
//! <base>/psk/<ID>.secret       ID:secret
//! ```
//!
//! The secret files are authoritative: records whose secret file is missing
//! are dropped on load, and secret files without a record get an empty one.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

pub const PSK_DIR_NAME: &str = "psk";
pub const MANAGEMENT_FILE: &str = "management.json";
const SECRET_EXTENSION: &str = "secret";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskRecord {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub uri: String,
    /// Unix seconds of the last successful `GetPLCID`.
    #[serde(default)]
    pub last_connect: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PskStore {
    dir: PathBuf,
}

impl PskStore {
    /// Store rooted at `<base>/psk`.
    #[must_use]
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            dir: base.as_ref().join(PSK_DIR_NAME),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self) -> Result<IndexMap<String, PskRecord>, ConnectorError> {
        let secrets = self.secret_ids()?;
        let mut records: IndexMap<String, PskRecord> = match fs::read_to_string(self.management_path()) {
            Ok(text) => serde_json::from_str::<Vec<PskRecord>>(&text)
                .map_err(|err| psk_error(format!("{MANAGEMENT_FILE}: {err}")))?
                .into_iter()
                .filter(|record| secrets.contains(&record.id))
                .map(|record| (record.id.clone(), record))
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => IndexMap::new(),
            Err(err) => return Err(psk_error(err)),
        };
        for id in secrets {
            records.entry(id.clone()).or_insert_with(|| PskRecord {
                id,
                ..PskRecord::default()
            });
        }
        Ok(records)
    }

    pub fn save(&self, records: &IndexMap<String, PskRecord>) -> Result<(), ConnectorError> {
        fs::create_dir_all(&self.dir).map_err(psk_error)?;
        let list: Vec<&PskRecord> = records.values().collect();
        let text = serde_json::to_string_pretty(&list).map_err(psk_error)?;
        fs::write(self.management_path(), text).map_err(psk_error)
    }

    /// Record the secret of `id` and stamp its last known endpoint.
    pub fn update_id(&self, id: &str, secret: &str, uri: &str) -> Result<(), ConnectorError> {
        validate_id(id)?;
        fs::create_dir_all(&self.dir).map_err(psk_error)?;
        fs::write(self.secret_path(id), format!("{id}:{secret}")).map_err(psk_error)?;
        let mut records = self.load()?;
        let record = records.entry(id.to_string()).or_insert_with(|| PskRecord {
            id: id.to_string(),
            ..PskRecord::default()
        });
        record.uri = uri.to_string();
        record.last_connect = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|elapsed| elapsed.as_secs());
        self.save(&records)
    }

    pub fn delete_id(&self, id: &str) -> Result<(), ConnectorError> {
        validate_id(id)?;
        match fs::remove_file(self.secret_path(id)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(psk_error(err)),
        }
        let mut records = self.load()?;
        records.shift_remove(id);
        self.save(&records)
    }

    /// Secret stored for `id`, if any.
    pub fn secret(&self, id: &str) -> Result<Option<String>, ConnectorError> {
        validate_id(id)?;
        match fs::read_to_string(self.secret_path(id)) {
            Ok(text) => Ok(text
                .trim()
                .split_once(':')
                .filter(|(stored, _)| *stored == id)
                .map(|(_, secret)| secret.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(psk_error(err)),
        }
    }

    fn management_path(&self) -> PathBuf {
        self.dir.join(MANAGEMENT_FILE)
    }

    fn secret_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{SECRET_EXTENSION}"))
    }

    fn secret_ids(&self) -> Result<Vec<String>, ConnectorError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(psk_error(err)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == SECRET_EXTENSION))
            .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(String::from))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn validate_id(id: &str) -> Result<(), ConnectorError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(psk_error(format!("invalid identity '{id}'")))
    }
}

fn psk_error(err: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Psk(err.to_string().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_base(name: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "plc-connector-psk-{name}-{}-{stamp}",
            std::process::id()
        ))
    }

    #[test]
    fn update_then_load() {
        let base = temp_base("update");
        let store = PskStore::new(&base);
        store.update_id("plc-1", "s3cret", "BIN://10.0.0.2:3000").unwrap();
        let records = store.load().unwrap();
        let record = &records["plc-1"];
        assert_eq!(record.uri, "BIN://10.0.0.2:3000");
        assert!(record.last_connect.is_some());
        assert_eq!(store.secret("plc-1").unwrap().as_deref(), Some("s3cret"));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn load_follows_secret_files() {
        let base = temp_base("filter");
        let store = PskStore::new(&base);
        store.update_id("kept", "a", "BIN://a").unwrap();
        store.update_id("gone", "b", "BIN://b").unwrap();
        fs::remove_file(store.dir().join("gone.secret")).unwrap();
        fs::write(store.dir().join("orphan.secret"), "orphan:c").unwrap();

        let records = store.load().unwrap();
        assert!(records.contains_key("kept"));
        assert!(!records.contains_key("gone"));
        assert_eq!(records["orphan"].uri, "");
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn delete_removes_secret_and_record() {
        let base = temp_base("delete");
        let store = PskStore::new(&base);
        store.update_id("plc-2", "x", "BIN://x").unwrap();
        store.delete_id("plc-2").unwrap();
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.secret("plc-2").unwrap(), None);
        assert!(store.update_id("../evil", "x", "BIN://x").is_err());
        let _ = fs::remove_dir_all(base);
    }
}
