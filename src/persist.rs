//! Atomic snapshot persistence with CRC32 integrity footers.
//!
//! Every snapshot is written to a temp file and atomically renamed into
//! place, with a 4-byte magic and CRC32 footer appended for corruption
//! detection on load.

use crate::error::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Magic bytes preceding the CRC32 footer on every snapshot.
const SNAPSHOT_CRC_MAGIC: &[u8; 4] = b"SDB1";

/// Serialize `value` with bincode and write it atomically to `path`:
/// `[bincode payload][magic "SDB1" 4B][CRC32 4B BE]`.
pub fn save_snapshot<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    let crc = crc32fast::hash(&bytes);

    let mut out = Vec::with_capacity(bytes.len() + 8);
    out.extend_from_slice(&bytes);
    out.extend_from_slice(SNAPSHOT_CRC_MAGIC);
    out.extend_from_slice(&crc.to_be_bytes());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_sibling(path);
    fs::write(&tmp_path, &out)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a snapshot written by [`save_snapshot`], verifying the CRC32 footer.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path)?;
    if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != SNAPSHOT_CRC_MAGIC {
        return Err(EngineError::Persist(format!(
            "snapshot {path:?} is missing its integrity footer"
        )));
    }
    let payload = &raw[..raw.len() - 8];
    let stored_crc = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(EngineError::Persist(format!(
            "snapshot CRC32 mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x} in {path:?}"
        )));
    }
    Ok(bincode::deserialize(payload)?)
}

/// Temp-file path next to `path` so the rename stays on one filesystem.
fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<f32>,
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        let payload = Payload {
            name: "alpha".into(),
            values: vec![1.0, 2.5, -3.0],
        };
        save_snapshot(&payload, &path).unwrap();
        let loaded: Payload = load_snapshot(&path).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        let payload = Payload {
            name: "alpha".into(),
            values: vec![1.0; 64],
        };
        save_snapshot(&payload, &path).unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[10] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let result: Result<Payload> = load_snapshot(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_footer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        fs::write(&path, b"abc").unwrap();
        let result: Result<Payload> = load_snapshot(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        save_snapshot(&vec![1u32, 2, 3], &path).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["snap.bin".to_string()]);
    }
}
