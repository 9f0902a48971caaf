//! Per-segment write journal.
//!
//! One JSON line per acknowledged write, fsync'd before the write is
//! acknowledged.  On restart the journal is the authority for which records
//! reached the segment: entries past the index snapshot's watermark are
//! replayed into the indexes, keyed idempotently on record id.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::codec::RecordKind;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub record_id: Uuid,
    pub kind: RecordKind,
    pub segment_id: u64,
    pub offset: u64,
    pub len: u32,
    pub index_version_pre: u64,
    pub index_version_post: u64,
}

impl ManifestEntry {
    /// First byte past this record's frame.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.len as u64
    }
}

pub fn manifest_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id:010}.manifest"))
}

#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    file: File,
}

impl ManifestWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one journal line and fsync it.  The caller must not
    /// acknowledge the write before this returns.
    pub fn append(&mut self, entry: &ManifestEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|err| crate::error::MemoryError::Internal(format!(
                "manifest entry encode failed: {err}"
            )))?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Load every parseable entry from a manifest.  Corrupt lines (torn tail
/// writes) are skipped with a warning; everything before them is intact
/// because each line was fsync'd before acknowledgement.
pub fn load(path: &Path) -> Result<Vec<ManifestEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_idx, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ManifestEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                warn!(
                    line = line_idx + 1,
                    %err,
                    path = %path.display(),
                    "skipping corrupt manifest line"
                );
            }
        }
    }
    Ok(entries)
}

/// All manifest files in a segment directory, ordered by segment id.
pub fn list(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut manifests = Vec::new();
    if !dir.exists() {
        return Ok(manifests);
    }
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(segment_id) = name
            .strip_suffix(".manifest")
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            manifests.push((segment_id, path));
        }
    }
    manifests.sort_unstable_by_key(|(segment_id, _)| *segment_id);
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use uuid::Uuid;

    use super::{ManifestEntry, ManifestWriter, load, manifest_path};
    use crate::codec::RecordKind;

    fn entry(segment_id: u64, offset: u64) -> ManifestEntry {
        ManifestEntry {
            record_id: Uuid::now_v7(),
            kind: RecordKind::Put,
            segment_id,
            offset,
            len: 64,
            index_version_pre: 1,
            index_version_post: 2,
        }
    }

    #[test]
    fn appends_and_reloads_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = manifest_path(dir.path(), 1);
        let mut writer = ManifestWriter::open(&path).expect("open");

        let first = entry(1, 48);
        let second = entry(1, first.end_offset());
        writer.append(&first).expect("append");
        writer.append(&second).expect("append");

        let loaded = load(&path).expect("load");
        assert_eq!(loaded, vec![first, second]);
    }

    #[test]
    fn torn_tail_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = manifest_path(dir.path(), 2);
        let mut writer = ManifestWriter::open(&path).expect("open");
        let good = entry(2, 48);
        writer.append(&good).expect("append");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("reopen");
        file.write_all(b"{\"record_id\":\"trunc").expect("torn write");

        let loaded = load(&path).expect("load");
        assert_eq!(loaded, vec![good]);
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load(&manifest_path(dir.path(), 9)).expect("load");
        assert!(loaded.is_empty());
    }
}
