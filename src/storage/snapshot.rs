//! On-disk snapshot format for the block store.
//!
//! Layout: `[MAGIC u32][VERSION u32][CRC32 u32][LEN u64][JSON payload]`, all little-endian.
//! Writes go to a temporary sibling file which is synced and renamed over the target,
//! so a power loss leaves either the previous snapshot or the new one.
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::Path,
};

use crc32fast::Hasher;

use crate::storage::{Block, StorageError};

const MAGIC: u32 = 0x4343_4253; // CCBS
const SCHEMA_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// Writes the given blocks to `path` atomically.
pub(crate) fn write(path: &Path, blocks: &BTreeMap<&str, &Block>) -> Result<(), StorageError> {
    let payload = serde_json::to_vec(blocks).map_err(|source| StorageError::Encode {
        block: "*".to_string(),
        field: "*".to_string(),
        source,
    })?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&MAGIC.to_le_bytes())?;
        file.write_all(&SCHEMA_VERSION.to_le_bytes())?;
        file.write_all(&checksum.to_le_bytes())?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads and verifies a snapshot previously produced by [`write`].
pub(crate) fn read(path: &Path) -> Result<BTreeMap<String, Block>, StorageError> {
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_LEN {
        return Err(StorageError::Corrupted(format!(
            "snapshot {} is truncated ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }

    let magic = u32::from_le_bytes(word(&bytes[0..4]));
    if magic != MAGIC {
        return Err(StorageError::Corrupted("missing snapshot magic".to_string()));
    }
    let version = u32::from_le_bytes(word(&bytes[4..8]));
    if version != SCHEMA_VERSION {
        return Err(StorageError::Corrupted(format!(
            "snapshot schema mismatch (file={version}, expected={SCHEMA_VERSION})"
        )));
    }
    let checksum = u32::from_le_bytes(word(&bytes[8..12]));
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[12..20]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(StorageError::Corrupted(format!(
            "snapshot payload is {} bytes, header says {len}",
            payload.len()
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != checksum {
        return Err(StorageError::Corrupted("snapshot checksum mismatch".to_string()));
    }

    serde_json::from_slice(payload).map_err(|err| StorageError::Corrupted(err.to_string()))
}

fn word(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PersistenceLevel;

    fn sample() -> Block {
        let mut block = Block::new(PersistenceLevel::Critical, 2);
        block.elements[1].insert("value".to_string(), serde_json::json!(42));
        block
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let block = sample();
        let mut blocks = BTreeMap::new();
        blocks.insert("Bank", &block);

        write(&path, &blocks).unwrap();
        let loaded = read(&path).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["Bank"].elements[1]["value"], serde_json::json!(42));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let block = sample();
        let mut blocks = BTreeMap::new();
        blocks.insert("Bank", &block);
        write(&path, &blocks).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(read(&path), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(matches!(read(&path), Err(StorageError::Corrupted(_))));
    }
}
