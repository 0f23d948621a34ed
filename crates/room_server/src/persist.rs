//! Snapshot persistence for rooms.
//!
//! The server treats persistence as an opaque blob store addressed by
//! room id: the serialized root envelope plus the document clock. No
//! schema is enforced here; cross-version compatibility is the
//! implementor's responsibility.

use chrono::{DateTime, Utc};
use room_storage::SerializedCrdt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// A persisted room: snapshot, clock, and when it was saved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomBlob {
    pub snapshot: SerializedCrdt,
    pub clock: u64,
    pub saved_at: DateTime<Utc>,
}

impl RoomBlob {
    pub fn new(snapshot: SerializedCrdt, clock: u64) -> Self {
        Self {
            snapshot,
            clock,
            saved_at: Utc::now(),
        }
    }
}

/// Errors from a snapshot store backend.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Backend-agnostic snapshot storage.
///
/// Methods take `&self`; implementations use interior mutability where
/// they need it.
pub trait SnapshotStore: Send + Sync {
    /// Stores or replaces the blob for a room.
    fn save(&self, room_id: &str, blob: &RoomBlob) -> PersistResult<()>;

    /// Loads the blob for a room, if one was ever saved.
    fn load(&self, room_id: &str) -> PersistResult<Option<RoomBlob>>;

    /// Removes a room's blob. Removing an unknown room is a no-op.
    fn delete(&self, room_id: &str) -> PersistResult<()>;

    /// Ids of all persisted rooms.
    fn rooms(&self) -> PersistResult<Vec<String>>;
}

/// In-memory store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, RoomBlob>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RoomBlob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, room_id: &str, blob: &RoomBlob) -> PersistResult<()> {
        self.lock().insert(room_id.to_string(), blob.clone());
        Ok(())
    }

    fn load(&self, room_id: &str) -> PersistResult<Option<RoomBlob>> {
        Ok(self.lock().get(room_id).cloned())
    }

    fn delete(&self, room_id: &str) -> PersistResult<()> {
        self.lock().remove(room_id);
        Ok(())
    }

    fn rooms(&self) -> PersistResult<Vec<String>> {
        let mut rooms: Vec<String> = self.lock().keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}

/// File-backed store: one JSON file per room under a directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Creates the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> PersistResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, room_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(room_id)))
    }
}

/// Room ids come from URLs; anything outside a conservative character
/// set maps to '_' so a room id can never escape the storage directory.
fn sanitize(room_id: &str) -> String {
    room_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, room_id: &str, blob: &RoomBlob) -> PersistResult<()> {
        let json = serde_json::to_string_pretty(blob)?;
        // Write-then-rename so a crash mid-write never truncates the
        // previous good blob.
        let path = self.path_for(room_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, room_id: &str) -> PersistResult<Option<RoomBlob>> {
        let path = self.path_for(room_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn delete(&self, room_id: &str) -> PersistResult<()> {
        let path = self.path_for(room_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rooms(&self) -> PersistResult<Vec<String>> {
        let mut rooms = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    rooms.push(stem.to_string());
                }
            }
        }
        rooms.sort();
        Ok(rooms)
    }
}
