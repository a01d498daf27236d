//! Durable routing table: `doc_id → {tier, file_id, created_at}`.
//!
//! The routing table is the source of truth for "does this doc_id exist
//! and where": a doc_id exists iff it has a routing record; ANN presence
//! is an optimisation. Backed by an append-only log of fixed-framed
//! records with periodic compaction, so a crash leaves at most one
//! partial trailing record to discard.
//!
//! Record frame, little-endian:
//! `u32 key_len | key | u8 tier | u64 created_at_ms | u32 file_id_len | file_id`
//! where `tier` 0 = hot, 1 = cold, 2 = deletion tombstone.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Compact once the log holds this many times more records than live docs.
const COMPACT_WASTE_FACTOR: usize = 4;

/// Never compact below this many log records.
const COMPACT_MIN_RECORDS: usize = 1_024;

/// Which generation of the index a document lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Hot,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Cold => "cold",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Cold => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Tier> {
        match b {
            0 => Some(Tier::Hot),
            1 => Some(Tier::Cold),
            _ => None,
        }
    }
}

/// Tombstone tag in the log; not a live tier.
const TIER_DELETED: u8 = 2;

/// One routing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRecord {
    pub tier: Tier,
    pub file_id: String,
    pub created_at_ms: u64,
}

/// Aggregate counts over the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingStats {
    pub total: usize,
    pub hot: usize,
    pub cold: usize,
    pub files: usize,
}

struct Inner {
    records: HashMap<Uuid, RoutingRecord>,
    by_file: HashMap<String, BTreeSet<Uuid>>,
    writer: BufWriter<File>,
    /// Records appended to the log since the last compaction, live or not.
    log_records: usize,
}

/// Thread-safe durable routing table.
///
/// Individual writes are atomic; the batch APIs group their frames into a
/// single buffered write + fsync so a batch is observable as one
/// transition.
pub struct RoutingTable {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl RoutingTable {
    /// Open or create the log at `path` and replay it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut records: HashMap<Uuid, RoutingRecord> = HashMap::new();
        let mut log_records = 0usize;
        if path.exists() {
            let mut raw = Vec::new();
            File::open(path)?.read_to_end(&mut raw)?;
            let mut cursor = 0usize;
            loop {
                match decode_record(&raw, cursor) {
                    DecodeOutcome::Record {
                        next,
                        doc_id,
                        tier_byte,
                        created_at_ms,
                        file_id,
                    } => {
                        cursor = next;
                        log_records += 1;
                        if tier_byte == TIER_DELETED {
                            records.remove(&doc_id);
                        } else if let Some(tier) = Tier::from_byte(tier_byte) {
                            records.insert(
                                doc_id,
                                RoutingRecord {
                                    tier,
                                    file_id,
                                    created_at_ms,
                                },
                            );
                        } else {
                            tracing::warn!(tier_byte, "unknown tier tag in routing log, skipping");
                        }
                    }
                    DecodeOutcome::End => break,
                    DecodeOutcome::Partial => {
                        tracing::warn!(
                            offset = cursor,
                            "routing log ends in a partial record, discarding tail"
                        );
                        break;
                    }
                    DecodeOutcome::Corrupt(reason) => {
                        return Err(EngineError::Persist(format!(
                            "routing log corrupt at offset {cursor}: {reason}"
                        )));
                    }
                }
            }
        }

        let mut by_file: HashMap<String, BTreeSet<Uuid>> = HashMap::new();
        for (doc_id, record) in &records {
            by_file
                .entry(record.file_id.clone())
                .or_default()
                .insert(*doc_id);
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!(
            live = records.len(),
            log_records,
            "routing table opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                records,
                by_file,
                writer: BufWriter::new(file),
                log_records,
            }),
        })
    }

    /// Insert or replace one record.
    pub fn put(&self, doc_id: Uuid, record: RoutingRecord) -> Result<()> {
        self.put_many(&[(doc_id, record)])
    }

    /// Insert or replace a batch of records as one durable write.
    pub fn put_many(&self, entries: &[(Uuid, RoutingRecord)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let mut buf = Vec::new();
        for (doc_id, record) in entries {
            encode_record(
                &mut buf,
                doc_id,
                record.tier.to_byte(),
                record.created_at_ms,
                &record.file_id,
            );
        }
        inner.writer.write_all(&buf)?;
        inner.writer.flush()?;
        inner.writer.get_mut().sync_all()?;
        inner.log_records += entries.len();

        for (doc_id, record) in entries {
            if let Some(old) = inner.records.insert(*doc_id, record.clone()) {
                if old.file_id != record.file_id {
                    if let Some(set) = inner.by_file.get_mut(&old.file_id) {
                        set.remove(doc_id);
                        if set.is_empty() {
                            inner.by_file.remove(&old.file_id);
                        }
                    }
                }
            }
            inner
                .by_file
                .entry(record.file_id.clone())
                .or_default()
                .insert(*doc_id);
        }
        self.maybe_compact(&mut inner)
    }

    /// Look up one record.
    pub fn get(&self, doc_id: &Uuid) -> Option<RoutingRecord> {
        self.inner.lock().records.get(doc_id).cloned()
    }

    /// Delete records. Unknown ids are tolerated. Returns the number of
    /// records actually removed.
    pub fn delete_many(&self, doc_ids: &[Uuid]) -> Result<usize> {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let mut buf = Vec::new();
        let mut removed = 0usize;
        for doc_id in doc_ids {
            if let Some(old) = inner.records.remove(doc_id) {
                encode_record(&mut buf, doc_id, TIER_DELETED, old.created_at_ms, "");
                if let Some(set) = inner.by_file.get_mut(&old.file_id) {
                    set.remove(doc_id);
                    if set.is_empty() {
                        inner.by_file.remove(&old.file_id);
                    }
                }
                removed += 1;
            }
        }
        if removed > 0 {
            inner.writer.write_all(&buf)?;
            inner.writer.flush()?;
            inner.writer.get_mut().sync_all()?;
            inner.log_records += removed;
            self.maybe_compact(&mut inner)?;
        }
        Ok(removed)
    }

    /// Move a batch of docs to `tier` as one durable write. Unknown ids
    /// are skipped. Returns the number updated.
    pub fn set_tier_many(&self, doc_ids: &[Uuid], tier: Tier) -> Result<usize> {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let mut buf = Vec::new();
        let mut updated = Vec::new();
        for doc_id in doc_ids {
            if let Some(record) = inner.records.get(doc_id) {
                encode_record(
                    &mut buf,
                    doc_id,
                    tier.to_byte(),
                    record.created_at_ms,
                    &record.file_id,
                );
                updated.push(*doc_id);
            }
        }
        if updated.is_empty() {
            return Ok(0);
        }
        inner.writer.write_all(&buf)?;
        inner.writer.flush()?;
        inner.writer.get_mut().sync_all()?;
        inner.log_records += updated.len();
        for doc_id in &updated {
            if let Some(record) = inner.records.get_mut(doc_id) {
                record.tier = tier;
            }
        }
        let count = updated.len();
        self.maybe_compact(&mut inner)?;
        Ok(count)
    }

    /// All docs belonging to `file_id`, in stable (sorted) order.
    pub fn by_file_id(&self, file_id: &str) -> Vec<(Uuid, RoutingRecord)> {
        let inner = self.inner.lock();
        inner
            .by_file
            .get(file_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| inner.records.get(id).map(|r| (*id, r.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All docs in `tier`.
    pub fn iter_by_tier(&self, tier: Tier) -> Vec<(Uuid, RoutingRecord)> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .filter(|(_, r)| r.tier == tier)
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    pub fn stats(&self) -> RoutingStats {
        let inner = self.inner.lock();
        let hot = inner
            .records
            .values()
            .filter(|r| r.tier == Tier::Hot)
            .count();
        RoutingStats {
            total: inner.records.len(),
            hot,
            cold: inner.records.len() - hot,
            files: inner.by_file.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log with only live records when waste crosses the
    /// threshold. Temp-file + rename keeps the swap atomic.
    fn maybe_compact(&self, inner: &mut Inner) -> Result<()> {
        if inner.log_records < COMPACT_MIN_RECORDS
            || inner.log_records < inner.records.len().saturating_mul(COMPACT_WASTE_FACTOR)
        {
            return Ok(());
        }
        let mut buf = Vec::new();
        for (doc_id, record) in &inner.records {
            encode_record(
                &mut buf,
                doc_id,
                record.tier.to_byte(),
                record.created_at_ms,
                &record.file_id,
            );
        }
        let tmp = self.path.with_extension("db.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.writer = BufWriter::new(file);
        tracing::info!(
            live = inner.records.len(),
            was = inner.log_records,
            "routing log compacted"
        );
        inner.log_records = inner.records.len();
        Ok(())
    }
}

fn encode_record(buf: &mut Vec<u8>, doc_id: &Uuid, tier: u8, created_at_ms: u64, file_id: &str) {
    let key = doc_id.to_string();
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.push(tier);
    buf.extend_from_slice(&created_at_ms.to_le_bytes());
    buf.extend_from_slice(&(file_id.len() as u32).to_le_bytes());
    buf.extend_from_slice(file_id.as_bytes());
}

enum DecodeOutcome {
    Record {
        next: usize,
        doc_id: Uuid,
        tier_byte: u8,
        created_at_ms: u64,
        file_id: String,
    },
    /// Clean end of log.
    End,
    /// A record started but the log ends before it completes.
    Partial,
    /// Structurally invalid data before the tail.
    Corrupt(String),
}

fn decode_record(raw: &[u8], at: usize) -> DecodeOutcome {
    if at == raw.len() {
        return DecodeOutcome::End;
    }
    let mut cursor = at;
    if raw.len() - cursor < 4 {
        return DecodeOutcome::Partial;
    }
    let key_len = u32::from_le_bytes(raw[cursor..cursor + 4].try_into().expect("4 bytes")) as usize;
    cursor += 4;
    if key_len > 128 {
        return DecodeOutcome::Corrupt(format!("implausible key length {key_len}"));
    }
    if raw.len() - cursor < key_len + 1 + 8 + 4 {
        return DecodeOutcome::Partial;
    }
    let key = match std::str::from_utf8(&raw[cursor..cursor + key_len]) {
        Ok(s) => s,
        Err(_) => return DecodeOutcome::Corrupt("key is not UTF-8".into()),
    };
    let doc_id = match Uuid::parse_str(key) {
        Ok(id) => id,
        Err(_) => return DecodeOutcome::Corrupt(format!("key {key:?} is not a UUID")),
    };
    cursor += key_len;
    let tier_byte = raw[cursor];
    cursor += 1;
    let created_at_ms = u64::from_le_bytes(raw[cursor..cursor + 8].try_into().expect("8 bytes"));
    cursor += 8;
    let file_id_len =
        u32::from_le_bytes(raw[cursor..cursor + 4].try_into().expect("4 bytes")) as usize;
    cursor += 4;
    if raw.len() - cursor < file_id_len {
        return DecodeOutcome::Partial;
    }
    let file_id = match std::str::from_utf8(&raw[cursor..cursor + file_id_len]) {
        Ok(s) => s.to_string(),
        Err(_) => return DecodeOutcome::Corrupt("file_id is not UTF-8".into()),
    };
    cursor += file_id_len;
    DecodeOutcome::Record {
        next: cursor,
        doc_id,
        tier_byte,
        created_at_ms,
        file_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tier: Tier, file_id: &str, ts: u64) -> RoutingRecord {
        RoutingRecord {
            tier,
            file_id: file_id.to_string(),
            created_at_ms: ts,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::open(&dir.path().join("routing.db")).unwrap();
        let id = Uuid::new_v4();
        table.put(id, record(Tier::Hot, "f1", 100)).unwrap();
        assert_eq!(table.get(&id).unwrap().tier, Tier::Hot);
        assert_eq!(table.delete_many(&[id]).unwrap(), 1);
        assert!(table.get(&id).is_none());
        assert_eq!(table.delete_many(&[id]).unwrap(), 0);
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.db");
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        {
            let table = RoutingTable::open(&path).unwrap();
            table.put(id1, record(Tier::Hot, "f1", 10)).unwrap();
            table.put(id2, record(Tier::Cold, "f2", 20)).unwrap();
            table.delete_many(&[id1]).unwrap();
        }
        let table = RoutingTable::open(&path).unwrap();
        assert!(table.get(&id1).is_none());
        let r2 = table.get(&id2).unwrap();
        assert_eq!(r2.tier, Tier::Cold);
        assert_eq!(r2.file_id, "f2");
        assert_eq!(r2.created_at_ms, 20);
    }

    #[test]
    fn test_partial_tail_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.db");
        let id = Uuid::new_v4();
        {
            let table = RoutingTable::open(&path).unwrap();
            table.put(id, record(Tier::Hot, "f1", 10)).unwrap();
        }
        // Append a torn record: the start of a frame with no body
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&36u32.to_le_bytes()).unwrap();
            f.write_all(b"0123").unwrap();
        }
        let table = RoutingTable::open(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get(&id).is_some());
    }

    #[test]
    fn test_by_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::open(&dir.path().join("routing.db")).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        table
            .put_many(&[
                (a, record(Tier::Hot, "f1", 1)),
                (b, record(Tier::Cold, "f1", 2)),
                (c, record(Tier::Hot, "f2", 3)),
            ])
            .unwrap();
        let f1 = table.by_file_id("f1");
        assert_eq!(f1.len(), 2);
        assert!(table.by_file_id("missing").is_empty());
    }

    #[test]
    fn test_set_tier_many() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::open(&dir.path().join("routing.db")).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table
            .put_many(&[
                (a, record(Tier::Hot, "f1", 1)),
                (b, record(Tier::Hot, "f1", 2)),
            ])
            .unwrap();
        let updated = table.set_tier_many(&[a, b, Uuid::new_v4()], Tier::Cold).unwrap();
        assert_eq!(updated, 2);
        assert_eq!(table.get(&a).unwrap().tier, Tier::Cold);
        let stats = table.stats();
        assert_eq!(stats.hot, 0);
        assert_eq!(stats.cold, 2);
    }

    #[test]
    fn test_iter_by_tier() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::open(&dir.path().join("routing.db")).unwrap();
        let hot_id = Uuid::new_v4();
        let cold_id = Uuid::new_v4();
        table
            .put_many(&[
                (hot_id, record(Tier::Hot, "f", 100)),
                (cold_id, record(Tier::Cold, "f", 200)),
            ])
            .unwrap();
        let hot = table.iter_by_tier(Tier::Hot);
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].0, hot_id);
        let cold = table.iter_by_tier(Tier::Cold);
        assert_eq!(cold.len(), 1);
        assert_eq!(cold[0].0, cold_id);
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::open(&dir.path().join("routing.db")).unwrap();
        table
            .put_many(&[
                (Uuid::new_v4(), record(Tier::Hot, "f1", 1)),
                (Uuid::new_v4(), record(Tier::Hot, "f2", 2)),
                (Uuid::new_v4(), record(Tier::Cold, "f2", 3)),
            ])
            .unwrap();
        let stats = table.stats();
        assert_eq!(
            stats,
            RoutingStats {
                total: 3,
                hot: 2,
                cold: 1,
                files: 2
            }
        );
    }

    #[test]
    fn test_compaction_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.db");
        let table = RoutingTable::open(&path).unwrap();
        let keeper = Uuid::new_v4();
        table.put(keeper, record(Tier::Hot, "keep", 1)).unwrap();
        // Churn enough records to trip the waste threshold
        for _ in 0..COMPACT_MIN_RECORDS {
            let id = Uuid::new_v4();
            table.put(id, record(Tier::Hot, "churn", 2)).unwrap();
            table.delete_many(&[id]).unwrap();
        }
        assert_eq!(table.len(), 1);
        drop(table);
        let reopened = RoutingTable::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(&keeper).is_some());
    }

    #[test]
    fn test_file_id_reassignment_updates_secondary_index() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::open(&dir.path().join("routing.db")).unwrap();
        let id = Uuid::new_v4();
        table.put(id, record(Tier::Hot, "f1", 1)).unwrap();
        table.put(id, record(Tier::Hot, "f2", 1)).unwrap();
        assert!(table.by_file_id("f1").is_empty());
        assert_eq!(table.by_file_id("f2").len(), 1);
        assert_eq!(table.stats().files, 1);
    }
}
