//! Persisted event document + HTTP fetch utilities for the roulette sync.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use roulette_core::{Event, EventProfile};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, redact_url, with_retries, Attempt, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, ManualClock, PacerClock, PacerTurn, RequestPacer,
    RetryDisposition, TokioClock, MIN_REQUEST_INTERVAL,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document {} is locked by another run", .path.display())]
    Locked { path: PathBuf },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing document: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }
}

/// How the in-memory document came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum LoadOrigin {
    Existing,
    Missing,
    /// The file existed but could not be read or parsed; the reason is kept
    /// so the run can report it.
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub event: Event,
    pub origin: LoadOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedDocument {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

/// Held for the duration of a run; dropping it releases the advisory lock.
#[derive(Debug)]
pub struct DocumentLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl DocumentLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    path: PathBuf,
    profile: EventProfile,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>, profile: EventProfile) -> Self {
        Self {
            path: path.into(),
            profile,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn profile(&self) -> &EventProfile {
        &self.profile
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Pretty-printed JSON with a trailing newline. Key order is the field
    /// order of the core types, so equal documents render to equal bytes.
    pub fn render(event: &Event) -> Result<Vec<u8>, StorageError> {
        let mut bytes = serde_json::to_vec_pretty(event)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Reads the document, falling back to the profile skeleton when the file
    /// is missing or unusable. Never fails.
    pub async fn load(&self) -> LoadedDocument {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted document; using skeleton");
                return LoadedDocument {
                    event: self.profile.skeleton(),
                    origin: LoadOrigin::Missing,
                };
            }
            Err(err) => return self.corrupt(format!("reading: {err}")),
        };

        match serde_json::from_slice::<Event>(&bytes) {
            Ok(mut event) => {
                event.normalize_weeks();
                LoadedDocument {
                    event,
                    origin: LoadOrigin::Existing,
                }
            }
            Err(err) => self.corrupt(format!("parsing: {err}")),
        }
    }

    fn corrupt(&self, reason: String) -> LoadedDocument {
        warn!(
            path = %self.path.display(),
            reason = %reason,
            "persisted document unusable; previous weeks are dropped for this run"
        );
        LoadedDocument {
            event: self.profile.skeleton(),
            origin: LoadOrigin::Corrupt(reason),
        }
    }

    /// Writes the document through a temp file in the same directory and an
    /// atomic rename. Identical content is not rewritten.
    pub async fn save(&self, event: &Event) -> Result<SavedDocument, StorageError> {
        let bytes = Self::render(event)?;
        let content_hash = Self::sha256_hex(&bytes);

        if let Ok(existing) = fs::read(&self.path).await {
            if existing == bytes {
                return Ok(SavedDocument {
                    content_hash,
                    path: self.path.clone(),
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let parent = self.path.parent().unwrap_or_else(|| Path::new(""));
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::io(format!("creating document directory {}", parent.display()), e)
            })?;
        }

        let temp_path = parent.join(format!(
            ".{}.{}.tmp",
            file_name_or(&self.path, "document"),
            Uuid::new_v4()
        ));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StorageError::io(format!("opening temp document {}", temp_path.display()), e))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(
                format!("writing temp document {}", temp_path.display()),
                err,
            ));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                ),
                err,
            ));
        }

        Ok(SavedDocument {
            content_hash,
            path: self.path.clone(),
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    /// Takes the run lock next to the document without blocking.
    pub fn lock(&self) -> Result<DocumentLock, StorageError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StorageError::io(format!("opening lock file {}", lock_path.display()), e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(DocumentLock {
                _file: file,
                path: lock_path,
            }),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Err(StorageError::Locked {
                    path: self.path.clone(),
                })
            }
            Err(err) => Err(StorageError::io(
                format!("locking {}", lock_path.display()),
                err,
            )),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(file_name_or(&self.path, "document"));
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

fn file_name_or(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use roulette_core::Achievement;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> DocumentStore {
        DocumentStore::new(dir.join("roulette2026.json"), EventProfile::roulette_2026())
    }

    fn sample_event() -> Event {
        let profile = EventProfile::roulette_2026();
        let schedule = profile.schedule();
        let mut event = profile.skeleton();
        let mut week = schedule.week_of(1);
        week.achievements.push(Achievement::placeholder(501, "First"));
        event.upsert_week(week);
        event
    }

    #[test]
    fn document_hashing_is_stable() {
        let hash = DocumentStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn missing_document_loads_skeleton() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let loaded = store.load().await;
        assert_eq!(loaded.origin, LoadOrigin::Missing);
        assert_eq!(loaded.event, EventProfile::roulette_2026().skeleton());
    }

    #[tokio::test]
    async fn corrupt_document_falls_back_to_skeleton() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        std::fs::write(store.path(), b"{ \"eventName\": ").expect("write garbage");

        let loaded = store.load().await;
        assert!(matches!(loaded.origin, LoadOrigin::Corrupt(_)));
        assert!(loaded.event.weeks.is_empty());
    }

    #[tokio::test]
    async fn save_round_trips_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let event = sample_event();

        let saved = store.save(&event).await.expect("save");
        assert!(!saved.unchanged);

        let on_disk = std::fs::read(store.path()).expect("read back");
        assert_eq!(on_disk.last(), Some(&b'\n'));
        assert_eq!(saved.content_hash, DocumentStore::sha256_hex(&on_disk));

        let loaded = store.load().await;
        assert_eq!(loaded.origin, LoadOrigin::Existing);
        assert_eq!(loaded.event, event);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn identical_content_is_not_rewritten() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let event = sample_event();

        let first = store.save(&event).await.expect("first save");
        let second = store.save(&event).await.expect("second save");
        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);

        let mut changed = event.clone();
        changed.weeks[0].end_date += Duration::milliseconds(1);
        let third = store.save(&changed).await.expect("third save");
        assert!(!third.unchanged);
        assert_ne!(third.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn save_creates_missing_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let store = DocumentStore::new(
            dir.path().join("public").join("data").join("roulette2026.json"),
            EventProfile::roulette_2026(),
        );
        store.save(&sample_event()).await.expect("save");
        assert!(store.path().exists());
    }

    #[test]
    fn second_lock_fails_until_first_is_dropped() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());

        let first = store.lock().expect("first lock");
        assert!(first.path().ends_with("roulette2026.json.lock"));
        match store.lock() {
            Err(StorageError::Locked { path }) => assert_eq!(path, store.path()),
            other => panic!("expected Locked, got {other:?}"),
        }

        drop(first);
        store.lock().expect("lock after release");
    }
}
