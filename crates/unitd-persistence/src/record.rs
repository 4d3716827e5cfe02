//! ---
//! unitd_section: "03-persistence-logging"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Durable hook and charm records with atomic replace."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Versioned, digest-protected JSON envelope shared by every agent record.
//!
//! Records are replaced atomically: the envelope is written to a temporary
//! file in the target directory, synced, then renamed over the old record.
//! A reader therefore sees either the previous record or the new one.
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::trace;

use crate::{PersistenceError, Result};

/// Current record envelope version.
pub const RECORD_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u16,
    written_at: DateTime<Utc>,
    digest: String,
    payload: serde_json::Value,
}

/// Atomically replace the record at `path` with `payload`.
pub fn write_record<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let payload = serde_json::to_value(payload)?;
    let envelope = RecordEnvelope {
        version: RECORD_VERSION,
        written_at: Utc::now(),
        digest: compute_digest(&payload)?,
        payload,
    };

    let tmp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, &envelope)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| PersistenceError::Io(err.error))?;
    File::open(parent)?.sync_all()?;
    trace!(path = %path.display(), "record replaced");
    Ok(())
}

/// Read the record at `path`. A missing file is `Ok(None)`; anything present
/// but unreadable as a valid envelope is [`PersistenceError::Corrupt`].
pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let envelope: RecordEnvelope = serde_json::from_slice(&bytes)
        .map_err(|err| PersistenceError::corrupt(path, format!("malformed envelope: {err}")))?;
    if envelope.version != RECORD_VERSION {
        return Err(PersistenceError::corrupt(
            path,
            format!("unsupported record version {}", envelope.version),
        ));
    }
    let expected = compute_digest(&envelope.payload)?;
    if envelope.digest != expected {
        return Err(PersistenceError::corrupt(path, "digest mismatch"));
    }
    let payload = serde_json::from_value(envelope.payload)
        .map_err(|err| PersistenceError::corrupt(path, format!("malformed payload: {err}")))?;
    Ok(Some(payload))
}

fn compute_digest(payload: &serde_json::Value) -> Result<String> {
    let serialized = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn missing_record_reads_as_empty() {
        let dir = tempdir().unwrap();
        let loaded: Option<Sample> = read_record(&dir.path().join("absent")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn replace_leaves_no_temporary_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("record");
        for count in 0..3 {
            write_record(&path, &Sample { name: "a".into(), count }).unwrap();
        }
        let loaded: Sample = read_record(&path).unwrap().unwrap();
        assert_eq!(loaded.count, 2);
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn tampered_payload_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record");
        write_record(&path, &Sample { name: "a".into(), count: 1 }).unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        envelope["payload"]["count"] = serde_json::json!(7);
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = read_record::<Sample>(&path).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record");
        fs::write(&path, b"{\"version\": 1, \"dig").unwrap();
        assert!(read_record::<Sample>(&path).unwrap_err().is_corrupt());
    }
}
