//! Reputation store file
//!
//! The local reputation state is persisted as a single JSON document that is
//! always replaced whole: it is written to a temporary file in the target
//! directory, flushed to disk and renamed over the previous file. A crash
//! therefore leaves either the old or the new file, never a torn one.
//!
//! The header carries a SHA-256 checksum over the ordered `key || value`
//! bytes so that a hand-edited or truncated file is rejected on load.

use crate::codec::{
    decode_key, decode_value, encode_key, encode_value, from_hex, hex_serde, to_hex, Hash,
    ReputationEntry, ReputationKey,
};
use crate::error::{MinerError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Store file format version
pub const STORE_VERSION: u32 = 1;

/// Store file header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub version: u32,
    /// Creation timestamp (Unix millis)
    pub created_at: i64,
    /// Cycle whose confirmation produced this state
    pub cycle: u64,
    #[serde(with = "hex_serde")]
    pub root_hash: Hash,
    pub n_nodes: u64,
    /// SHA-256 over the ordered `key || value` bytes
    #[serde(with = "hex_serde")]
    pub checksum: Hash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoreFile {
    header: StoreHeader,
    /// hex(encoded key) -> hex(encoded value)
    entries: BTreeMap<String, String>,
}

/// Decoded contents of a store file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub cycle: u64,
    pub root_hash: Hash,
    pub n_nodes: u64,
    pub entries: BTreeMap<ReputationKey, ReputationEntry>,
}

fn checksum<'a>(entries: impl Iterator<Item = (&'a ReputationKey, &'a ReputationEntry)>) -> Hash {
    let mut hasher = Sha256::new();
    for (key, entry) in entries {
        hasher.update(encode_key(key));
        hasher.update(encode_value(entry));
    }
    hasher.finalize().into()
}

/// Atomically replace the store file at `path` with `snapshot`
pub fn write_store(path: &Path, snapshot: &StoreSnapshot) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .map_err(|e| MinerError::Storage(format!("Failed to create store dir: {}", e)))?;

    let file = StoreFile {
        header: StoreHeader {
            version: STORE_VERSION,
            created_at: chrono::Utc::now().timestamp_millis(),
            cycle: snapshot.cycle,
            root_hash: snapshot.root_hash,
            n_nodes: snapshot.n_nodes,
            checksum: checksum(snapshot.entries.iter()),
        },
        entries: snapshot
            .entries
            .iter()
            .map(|(k, v)| (to_hex(&encode_key(k)), to_hex(&encode_value(v))))
            .collect(),
    };

    let temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| MinerError::Storage(format!("Failed to create temp store file: {}", e)))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, &file)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| MinerError::Storage(format!("Failed to finalize store file: {}", e)))?;

    info!(
        path = %path.display(),
        cycle = snapshot.cycle,
        n_nodes = snapshot.n_nodes,
        root = %to_hex(&snapshot.root_hash),
        "Reputation store flushed"
    );
    Ok(())
}

/// Read and verify the store file at `path`; `None` if it does not exist
pub fn read_store(path: &Path) -> Result<Option<StoreSnapshot>> {
    if !path.exists() {
        debug!(path = %path.display(), "No reputation store file");
        return Ok(None);
    }

    let bytes = fs::read(path)
        .map_err(|e| MinerError::Storage(format!("Failed to read store file: {}", e)))?;
    let file: StoreFile = serde_json::from_slice(&bytes)?;

    if file.header.version > STORE_VERSION {
        return Err(MinerError::Storage(format!(
            "Store version {} is newer than supported version {}",
            file.header.version, STORE_VERSION
        )));
    }

    let mut entries = BTreeMap::new();
    for (key_hex, value_hex) in &file.entries {
        let key = decode_key(&from_hex(key_hex)?)?;
        let value = decode_value(&from_hex(value_hex)?)?;
        entries.insert(key, value);
    }

    if checksum(entries.iter()) != file.header.checksum {
        return Err(MinerError::Storage("Store file checksum mismatch".into()));
    }

    Ok(Some(StoreSnapshot {
        cycle: file.header.cycle,
        root_hash: file.header.root_hash,
        n_nodes: file.header.n_nodes,
        entries,
    }))
}
