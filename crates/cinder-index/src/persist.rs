//! Node table persistence.
//!
//! The index writes its directory to `nodes.json` on every membership or
//! state change, so a restarted index remembers the cluster instead of
//! rediscovering it. Writes go through a temp file plus rename so a
//! crash mid-write never leaves a truncated table.

use std::fs;
use std::path::Path;

use cinder_cluster::Node;

/// Errors reading or writing the persisted node table.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed node table: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes the node table atomically.
pub fn save(path: &Path, nodes: &[Node]) -> Result<(), PersistError> {
    let json = serde_json::to_vec_pretty(nodes)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads the node table. A missing file is an empty table, not an
/// error; the first run has nothing to restore.
pub fn load(path: &Path) -> Result<Vec<Node>, PersistError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}
