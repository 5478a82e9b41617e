//! The crate `journal` implements the durable, hash-chained key/value journal
//! backing each node's persistent state.
//!
//! A journal directory holds two alternating generation files, a pointer file
//! and a lock file. Every mutation batch appends one record to the in-memory
//! history and rewrites the non-authoritative generation with the full
//! history, then atomically replaces the pointer. A crash at any point leaves
//! the previously pointed generation untouched and still authoritative, so a
//! partially written batch can never become visible state.

// Copyright 2021 The sdcons Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constant::*;
use crate::error::Error;

/// One mutation against the journal's key/value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalMutation {
    SetString(String, String),
    SetLong(String, i64),
    SetObject(String, serde_json::Value),
    Remove(String),
}

/// A value stored in the journal tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalValue {
    String(String),
    Long(i64),
    Object(serde_json::Value),
}

/// One chain record: the literal timestamp and payload text plus the chain
/// hash over both. The timestamp is kept as written so re-hashing is exact.
#[derive(Debug, Clone)]
struct Record {
    timestamp: String,
    payload: String,
    hash: String,
}

/// Chain hash of a record. The first record hashes only its own content;
/// every later record folds in the previous record's hash, which makes
/// truncation and tampering detectable from the trailing hash alone.
fn chain_hash(prev: Option<&str>, timestamp: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev {
        hasher.update(prev.as_bytes());
        hasher.update(b"\n\n");
    }
    hasher.update(timestamp.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Groups an input stream into blank-line-delimited paragraphs. Returns the
/// complete paragraphs and any trailing, non-terminated remnant, which the
/// caller discards as an incomplete write.
fn parse_paragraphs(content: &str) -> (Vec<&str>, Option<&str>) {
    let mut paragraphs = Vec::new();
    let mut rest = content;
    while let Some(pos) = rest.find("\n\n") {
        paragraphs.push(&rest[..pos]);
        rest = &rest[pos + 2..];
    }
    if rest.is_empty() {
        (paragraphs, None)
    } else {
        (paragraphs, Some(rest))
    }
}

fn corrupt(detail: String) -> Error {
    Error::Corrupt { detail }
}

/// Parses one generation file's complete paragraphs into records, without
/// verifying the chain.
fn parse_records(path: &Path) -> Result<Vec<Record>, Error> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let (paragraphs, trailing) = parse_paragraphs(&content);
    if let Some(trailing) = trailing {
        warn!(
            "journal file {} ends with a non-terminated paragraph of {} bytes, discarding it",
            path.display(),
            trailing.len()
        );
    }
    let mut records = Vec::with_capacity(paragraphs.len());
    for paragraph in paragraphs {
        let mut lines = paragraph.splitn(3, '\n');
        let timestamp = lines.next().unwrap_or_default();
        let payload = lines.next();
        let hash = lines.next();
        match (payload, hash) {
            (Some(payload), Some(hash)) if !hash.contains('\n') => records.push(Record {
                timestamp: timestamp.to_string(),
                payload: payload.to_string(),
                hash: hash.to_string(),
            }),
            _ => {
                return Err(corrupt(format!(
                    "malformed record in {}: expected 3 lines per paragraph",
                    path.display()
                )))
            }
        }
    }
    Ok(records)
}

/// Verifies a record chain from its start and returns the trailing hash.
fn verify_chain(path: &Path, records: &[Record]) -> Result<Option<String>, Error> {
    let mut prev: Option<String> = None;
    for (idx, record) in records.iter().enumerate() {
        let expected = chain_hash(prev.as_deref(), &record.timestamp, &record.payload);
        if expected != record.hash {
            return Err(corrupt(format!(
                "hash chain mismatch at record {} of {}",
                idx,
                path.display()
            )));
        }
        prev = Some(record.hash.clone());
    }
    Ok(prev)
}

#[derive(Debug, Clone, PartialEq)]
struct Pointer {
    generation: usize,
    /// Trailing chain hash of the authoritative generation.
    last_hash: String,
    /// Trailing chain hash of the other generation, absent until the second
    /// batch has been written.
    prev_hash: Option<String>,
}

impl Pointer {
    fn parse(content: &str) -> Option<Pointer> {
        let mut lines = content.lines();
        let generation = match lines.next()? {
            "0" => 0,
            "1" => 1,
            _ => return None,
        };
        let last_hash = lines.next()?.to_string();
        let prev_hash = match lines.next()? {
            "-" => None,
            h => Some(h.to_string()),
        };
        if lines.next().is_some() || last_hash.len() != 64 {
            return None;
        }
        Some(Pointer {
            generation,
            last_hash,
            prev_hash,
        })
    }

    fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.generation,
            self.last_hash,
            self.prev_hash.as_deref().unwrap_or("-")
        )
    }
}

/// An exclusively locked, crash-safe key/value journal.
///
/// `open` acquires the directory lock and reconciles on-disk state; `mutate`
/// applies a batch durably; `get` reads the in-memory tree. Dropping the
/// journal (or calling [`Journal::close`]) releases the lock.
pub struct Journal {
    dir: PathBuf,
    // Held for the lifetime of the journal; the OS drops the lock with it.
    _lock: File,
    generation: usize,
    records: Vec<Record>,
    trailing_hash: Option<String>,
    tree: BTreeMap<String, JournalValue>,
}

impl Journal {
    /// Opens the journal in `dir`, creating the directory if needed.
    ///
    /// Fails with [`Error::LockHeld`] when another process has the journal
    /// open, and with [`Error::Corrupt`] when the on-disk history is
    /// ambiguous or fails hash verification.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Journal, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = acquire_lock(&dir)?;

        // A leftover staged pointer means a pointer replacement never
        // completed; the old pointer is still authoritative.
        let staged = dir.join(POINTER_TMP_FILE);
        if staged.exists() {
            warn!("journal {} has a stale staged pointer, removing it", dir.display());
            fs::remove_file(&staged)?;
        }

        let pointer_path = dir.join(POINTER_FILE);
        if !pointer_path.exists() {
            return Journal::open_unpointed(dir, lock);
        }

        let pointer = Pointer::parse(&fs::read_to_string(&pointer_path)?)
            .ok_or_else(|| corrupt(format!("malformed pointer file in {}", dir.display())))?;

        let gen_path = dir.join(GENERATION_FILES[pointer.generation]);
        let records = parse_records(&gen_path)?;
        let trailing = verify_chain(&gen_path, &records)?;
        match &trailing {
            Some(hash) if *hash == pointer.last_hash => {}
            Some(_) => {
                return Err(corrupt(format!(
                    "trailing hash of {} does not match the pointer",
                    gen_path.display()
                )))
            }
            None => {
                return Err(corrupt(format!(
                    "pointer names {} but it holds no complete record",
                    gen_path.display()
                )))
            }
        }

        // The other generation is allowed to hold anything: it is routinely
        // mid-rewrite at crash time and gets rewritten wholesale on the next
        // batch. Report when it disagrees with its recorded candidate.
        let other_path = dir.join(GENERATION_FILES[1 - pointer.generation]);
        match parse_records(&other_path).and_then(|r| verify_chain(&other_path, &r)) {
            Ok(other_trailing) if other_trailing == pointer.prev_hash => {}
            _ => debug!(
                "journal {}: non-authoritative generation is stale or incomplete",
                dir.display()
            ),
        }

        let mut tree = BTreeMap::new();
        for record in &records {
            let batch: Vec<JournalMutation> = serde_json::from_str(&record.payload)
                .map_err(|e| corrupt(format!("unreadable batch payload: {}", e)))?;
            apply_batch(&mut tree, &batch);
        }
        debug!(
            "journal {} loaded {} records from generation {}",
            dir.display(),
            records.len(),
            pointer.generation
        );

        Ok(Journal {
            dir,
            _lock: lock,
            generation: pointer.generation,
            records,
            trailing_hash: trailing,
            tree,
        })
    }

    /// Open path for a directory with no pointer file. A single complete
    /// record in one generation is the residue of a first batch that crashed
    /// before its pointer write and was never acknowledged; it is discarded.
    /// Anything more means a pointer has been lost.
    fn open_unpointed(dir: PathBuf, lock: File) -> Result<Journal, Error> {
        let mut total = 0;
        for name in &GENERATION_FILES {
            total += parse_records(&dir.join(name))?.len();
        }
        if total > 1 {
            return Err(corrupt(format!(
                "{} holds generation data but no pointer file",
                dir.display()
            )));
        }
        if total == 1 {
            warn!(
                "journal {} holds one unacknowledged record and no pointer, discarding it",
                dir.display()
            );
        }
        for name in &GENERATION_FILES {
            let path = dir.join(name);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        debug!("journal {} opened fresh", dir.display());
        Ok(Journal {
            dir,
            _lock: lock,
            generation: 1,
            records: Vec::new(),
            trailing_hash: None,
            tree: BTreeMap::new(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&JournalValue> {
        self.tree.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.tree.get(key) {
            Some(JournalValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.tree.get(key) {
            Some(JournalValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_object(&self, key: &str) -> Option<&serde_json::Value> {
        match self.tree.get(key) {
            Some(JournalValue::Object(v)) => Some(v),
            _ => None,
        }
    }

    /// Applies one mutation batch durably: the full record history plus the
    /// new record is written to the non-authoritative generation, synced,
    /// and only then does the pointer move. On any error the previous
    /// generation remains authoritative and memory is untouched.
    pub fn mutate(&mut self, batch: Vec<JournalMutation>) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }

        let timestamp = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&batch)?;
        let hash = chain_hash(self.trailing_hash.as_deref(), &timestamp, &payload);
        let record = Record {
            timestamp,
            payload,
            hash: hash.clone(),
        };

        let target = 1 - self.generation;
        let target_path = self.dir.join(GENERATION_FILES[target]);
        let mut file = File::create(&target_path)?;
        for r in self.records.iter().chain(std::iter::once(&record)) {
            write!(file, "{}\n{}\n{}\n\n", r.timestamp, r.payload, r.hash)?;
        }
        file.sync_all()?;

        let pointer = Pointer {
            generation: target,
            last_hash: hash.clone(),
            prev_hash: self.trailing_hash.clone(),
        };
        self.replace_pointer(&pointer)?;

        debug!(
            "journal {} wrote record {} to generation {}",
            self.dir.display(),
            self.records.len(),
            target
        );
        self.generation = target;
        self.records.push(record);
        self.trailing_hash = Some(hash);
        apply_batch(&mut self.tree, &batch);
        Ok(())
    }

    fn replace_pointer(&self, pointer: &Pointer) -> Result<(), Error> {
        let staged = self.dir.join(POINTER_TMP_FILE);
        let mut file = File::create(&staged)?;
        file.write_all(pointer.render().as_bytes())?;
        file.sync_all()?;
        fs::rename(&staged, self.dir.join(POINTER_FILE))?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Releases the directory lock.
    pub fn close(self) {
        debug!("journal {} closed", self.dir.display());
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("dir", &self.dir)
            .field("generation", &self.generation)
            .field("records", &self.records.len())
            .field("keys", &self.tree.len())
            .finish()
    }
}

fn acquire_lock(dir: &Path) -> Result<File, Error> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(Error::LockHeld),
        Err(TryLockError::Error(e)) => Err(Error::from(e)),
    }
}

fn apply_batch(tree: &mut BTreeMap<String, JournalValue>, batch: &[JournalMutation]) {
    for mutation in batch {
        match mutation {
            JournalMutation::SetString(k, v) => {
                tree.insert(k.clone(), JournalValue::String(v.clone()));
            }
            JournalMutation::SetLong(k, v) => {
                tree.insert(k.clone(), JournalValue::Long(*v));
            }
            JournalMutation::SetObject(k, v) => {
                tree.insert(k.clone(), JournalValue::Object(v.clone()));
            }
            JournalMutation::Remove(k) => {
                tree.remove(k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;

    fn set(key: &str, value: &str) -> JournalMutation {
        JournalMutation::SetString(key.to_string(), value.to_string())
    }

    fn pointed_generation(dir: &Path) -> usize {
        let content = fs::read_to_string(dir.join(POINTER_FILE)).unwrap();
        Pointer::parse(&content).unwrap().generation
    }

    #[test]
    fn paragraph_parser_discards_trailing_remnant() {
        let (paragraphs, trailing) = parse_paragraphs("a\nb\nc\n\nd\ne\nf\n\npartial\nrecord");
        assert_eq!(paragraphs, vec!["a\nb\nc", "d\ne\nf"]);
        assert_eq!(trailing, Some("partial\nrecord"));

        let (paragraphs, trailing) = parse_paragraphs("a\nb\nc\n\n");
        assert_eq!(paragraphs, vec!["a\nb\nc"]);
        assert_eq!(trailing, None);

        let (paragraphs, trailing) = parse_paragraphs("");
        assert!(paragraphs.is_empty());
        assert_eq!(trailing, None);
    }

    #[test]
    fn chain_hash_incorporates_previous() {
        let first = chain_hash(None, "t0", "p0");
        let second = chain_hash(Some(&first), "t1", "p1");
        assert_ne!(first, second);
        assert_ne!(second, chain_hash(Some(&second), "t1", "p1"));
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn open_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        assert!(journal.get("anything").is_none());
        journal.close();

        let journal = Journal::open(dir.path()).unwrap();
        assert!(journal.get("anything").is_none());
    }

    #[test]
    fn mutate_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal
            .mutate(vec![
                set("mode", "ACCEPTING"),
                JournalMutation::SetLong("count".to_string(), 7),
            ])
            .unwrap();
        journal.close();

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.get_string("mode"), Some("ACCEPTING"));
        assert_eq!(journal.get_long("count"), Some(7));
        assert!(journal.get_string("count").is_none());
    }

    #[test]
    fn generations_alternate() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v1")]).unwrap();
        let first = pointed_generation(dir.path());
        journal.mutate(vec![set("k", "v2")]).unwrap();
        let second = pointed_generation(dir.path());
        assert_ne!(first, second);
        assert_eq!(journal.get_string("k"), Some("v2"));
    }

    #[test]
    fn round_trip_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let mut journal = Journal::open(dir.path()).unwrap();
            journal
                .mutate(vec![
                    set(&format!("key-{}", i), "present"),
                    JournalMutation::SetLong("batches".to_string(), i as i64 + 1),
                ])
                .unwrap();
            journal.close();
        }

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.get_long("batches"), Some(5));
        for i in 0..5 {
            assert_eq!(journal.get_string(&format!("key-{}", i)), Some("present"));
        }
    }

    #[test]
    fn remove_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v")]).unwrap();
        journal
            .mutate(vec![JournalMutation::Remove("k".to_string())])
            .unwrap();
        journal.close();

        let journal = Journal::open(dir.path()).unwrap();
        assert!(journal.get("k").is_none());
    }

    #[test]
    fn set_object_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let value = serde_json::json!({ "state": "PREPARED", "version": 3 });
        journal
            .mutate(vec![JournalMutation::SetObject("change".to_string(), value.clone())])
            .unwrap();
        journal.close();

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.get_object("change"), Some(&value));
    }

    #[test]
    fn second_open_fails_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let _journal = Journal::open(dir.path()).unwrap();
        match Journal::open(dir.path()) {
            Err(Error::LockHeld) => {}
            other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn lock_released_on_close() {
        let dir = tempfile::tempdir().unwrap();
        Journal::open(dir.path()).unwrap().close();
        assert!(Journal::open(dir.path()).is_ok());
    }

    #[test]
    fn byte_flip_in_pointed_generation_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v1")]).unwrap();
        journal.mutate(vec![set("k", "v2")]).unwrap();
        journal.close();

        let gen = pointed_generation(dir.path());
        let path = dir.path().join(GENERATION_FILES[gen]);
        let tampered = fs::read_to_string(&path).unwrap().replace("v1", "vX");
        fs::write(&path, tampered).unwrap();

        match Journal::open(dir.path()) {
            Err(Error::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_pointed_generation_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v1")]).unwrap();
        journal.mutate(vec![set("k", "v2")]).unwrap();
        journal.close();

        let gen = pointed_generation(dir.path());
        let path = dir.path().join(GENERATION_FILES[gen]);
        let content = fs::read_to_string(&path).unwrap();
        // Drop the final record, leaving a shorter but well-formed chain.
        let cut = content[..content.len() - 2].rfind("\n\n").unwrap();
        fs::write(&path, &content[..cut + 2]).unwrap();

        match Journal::open(dir.path()) {
            Err(Error::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn trailing_partial_write_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v")]).unwrap();
        journal.close();

        let gen = pointed_generation(dir.path());
        let path = dir.path().join(GENERATION_FILES[gen]);
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("2021-01-01T00:00:00Z\nhalf a record with no separat");
        fs::write(&path, content).unwrap();

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.get_string("k"), Some("v"));
    }

    #[test]
    fn garbage_in_other_generation_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v")]).unwrap();
        journal.close();

        let gen = pointed_generation(dir.path());
        let other = dir.path().join(GENERATION_FILES[1 - gen]);
        fs::write(&other, "not\na\nrecord at all").unwrap();

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.get_string("k"), Some("v"));
    }

    #[test]
    fn single_unpointed_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v")]).unwrap();
        journal.close();

        // Simulate the first batch crashing before its pointer write.
        fs::remove_file(dir.path().join(POINTER_FILE)).unwrap();

        let journal = Journal::open(dir.path()).unwrap();
        assert!(journal.get("k").is_none());
        journal.close();

        // The discarded generation must not resurface on the next open.
        let journal = Journal::open(dir.path()).unwrap();
        assert!(journal.get("k").is_none());
    }

    #[test]
    fn unpointed_history_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v1")]).unwrap();
        journal.mutate(vec![set("k", "v2")]).unwrap();
        journal.close();

        fs::remove_file(dir.path().join(POINTER_FILE)).unwrap();

        match Journal::open(dir.path()) {
            Err(Error::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn pointer_without_generation_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v")]).unwrap();
        journal.close();

        let gen = pointed_generation(dir.path());
        fs::remove_file(dir.path().join(GENERATION_FILES[gen])).unwrap();

        match Journal::open(dir.path()) {
            Err(Error::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn stale_staged_pointer_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.mutate(vec![set("k", "v")]).unwrap();
        journal.close();

        fs::write(dir.path().join(POINTER_TMP_FILE), "0\ngarbage\n-\n").unwrap();

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.get_string("k"), Some("v"));
        assert!(!dir.path().join(POINTER_TMP_FILE).exists());
    }
}
