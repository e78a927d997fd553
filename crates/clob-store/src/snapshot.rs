//! Durable store snapshots.
//!
//! The durable keyspaces are written to a single file after every committed
//! block and read back on restart. Writes go to a sibling temp file first and
//! are renamed into place, so an interrupted write leaves the previous
//! snapshot intact.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::codec;
use crate::error::{StoreError, StoreResult};
use crate::kv::MemStore;

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot: durable store plus the last committed height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub height: u32,
    pub store: MemStore,
}

impl Snapshot {
    pub fn new(height: u32, store: MemStore) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            height,
            store,
        }
    }
}

/// Write a snapshot atomically (temp file + rename).
pub fn save_snapshot(path: &Path, height: u32, store: &MemStore) -> StoreResult<()> {
    let bytes = codec::encode(&Snapshot::new(height, store.clone()))?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    debug!(
        path = %path.display(),
        height,
        entries = store.len(),
        bytes = bytes.len(),
        "Snapshot written"
    );
    Ok(())
}

/// Read a snapshot. Returns `None` when no snapshot exists yet.
pub fn load_snapshot(path: &Path) -> StoreResult<Option<Snapshot>> {
    if !path.exists() {
        info!(path = %path.display(), "No snapshot found, starting from empty state");
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = codec::decode(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StoreError::Snapshot(format!(
            "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
            snapshot.version
        )));
    }
    info!(
        path = %path.display(),
        height = snapshot.height,
        entries = snapshot.store.len(),
        "Snapshot loaded"
    );
    Ok(Some(snapshot))
}
