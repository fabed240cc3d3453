//! Fingerprint store: persisted per-path processing state.
//!
//! The store is a single JSON document of the shape
//! `{ "files": { "<absolute path>": { "sig", "qfp", "done_at" } } }`. It is loaded once per
//! run, mutated only through [`FingerprintStore`] (one mutex around every read-modify-write),
//! and saved as a whole document via write-to-temp-then-rename after every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// State kept for one processed (or confirmed unchanged) file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// `<size>-<mtime ns>` at the time the record was written.
    #[serde(rename = "sig")]
    pub signature: String,
    /// Quick fingerprint of the file content.
    #[serde(rename = "qfp")]
    pub quick_fingerprint: String,
    /// When the file was last confirmed normalised.
    #[serde(rename = "done_at")]
    pub completed_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn new(signature: String, quick_fingerprint: String) -> Self {
        Self {
            signature,
            quick_fingerprint,
            completed_at: Utc::now(),
        }
    }
}

/// On-disk document. `files` is required: a document without it is malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub files: BTreeMap<String, ProcessingRecord>,
}

/// Normalises a path into the key used by the document.
pub fn store_key(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Reads the state document, treating a missing, unreadable or malformed file as empty.
pub fn load_document(path: &Path) -> StateDocument {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no state file yet, starting empty");
            return StateDocument::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read state file, resetting state");
            return StateDocument::default();
        }
    };

    match serde_json::from_str::<StateDocument>(&content) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid state file format, resetting state");
            StateDocument::default()
        }
    }
}

/// Writes the document next to `path` and renames it into place.
///
/// The temporary file is removed if anything fails before the rename.
pub fn save_document(path: &Path, doc: &StateDocument) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let result = fs::write(&tmp, json).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// The shared, mutex-guarded store handle.
#[derive(Debug)]
pub struct FingerprintStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

/// Store handle passed to every worker.
pub type SharedStore = Arc<FingerprintStore>;

impl FingerprintStore {
    /// Loads the store from `path` (empty if missing or corrupt).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = load_document(&path);
        debug!(path = %path.display(), records = doc.files.len(), "state loaded");
        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StateDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the record for `path`, if any.
    pub fn get(&self, path: &Path) -> Option<ProcessingRecord> {
        self.lock().files.get(&store_key(path)).cloned()
    }

    /// Number of tracked files.
    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or overwrites the record for `path` and saves the document.
    ///
    /// The in-memory record is kept even when the save fails.
    pub fn upsert(&self, path: &Path, record: ProcessingRecord) -> io::Result<()> {
        let mut doc = self.lock();
        doc.files.insert(store_key(path), record);
        save_document(&self.path, &doc)
    }

    /// Replaces only the signature of an existing record and refreshes its timestamp.
    ///
    /// Returns `Ok(false)` if there is no record for `path`.
    pub fn refresh_signature(&self, path: &Path, signature: String) -> io::Result<bool> {
        let mut doc = self.lock();
        let Some(record) = doc.files.get_mut(&store_key(path)) else {
            return Ok(false);
        };
        record.signature = signature;
        record.completed_at = Utc::now();
        save_document(&self.path, &doc)?;
        Ok(true)
    }

    /// Re-reads the document from disk, picking up writes by other processes.
    pub fn reload(&self) {
        let fresh = load_document(&self.path);
        *self.lock() = fresh;
    }
}
