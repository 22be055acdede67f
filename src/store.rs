//! Unit of work over a sled database.
//!
//! Every engine operation runs inside a [`Tx`]. Reads go to the committed
//! database, overlaid with the writes the unit of work has staged so far.
//! Point reads are remembered together with the bytes they observed; on
//! commit a single sled transaction re-checks each of those keys and applies
//! the staged writes only if nothing changed underneath. A mismatch is a
//! conflict and [`Store::atomically`] re-runs the whole unit of work.
//!
//! Since every mutating operation reads and rewrites its assignment record,
//! two operations on the same assignment always serialize, while operations on
//! different applications never touch each other's keys. Seat writes do the
//! same with their group record.
//!
//! [`Store::read`] checks the same read set after the work has run, so a read
//! operation never returns a view torn by a commit that landed halfway.
use std::collections::BTreeMap;
use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};

/// A CBOR encoded record stored under a key derived from its own fields.
pub trait Record: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    fn key(&self) -> String;
}

/// Key layout. Ids never contain `/`, so prefixes cannot collide.
pub mod keys {
    pub fn application(application_id: &str) -> String {
        format!("application/{application_id}")
    }
    pub fn group(group_id: &str) -> String {
        format!("group/{group_id}")
    }
    pub fn member(group_id: &str, member_id: &str) -> String {
        format!("member/{group_id}/{member_id}")
    }
    pub fn members_of(group_id: &str) -> String {
        format!("member/{group_id}/")
    }
    pub fn assignment(assignment_id: &str) -> String {
        format!("assignment/{assignment_id}")
    }
    // index: application id -> assignment id
    pub fn application_assignment(application_id: &str) -> String {
        format!("application-assignment/{application_id}")
    }
    pub fn decision(assignment_id: &str, member_id: &str) -> String {
        format!("decision/{assignment_id}/{member_id}")
    }
    pub fn decisions_of(assignment_id: &str) -> String {
        format!("decision/{assignment_id}/")
    }
    pub fn issue(assignment_id: &str, issue_id: &str) -> String {
        format!("issue/{assignment_id}/{issue_id}")
    }
    pub fn issues_of(assignment_id: &str) -> String {
        format!("issue/{assignment_id}/")
    }
    // index: issue id -> assignment id
    pub fn issue_assignment(issue_id: &str) -> String {
        format!("issue-assignment/{issue_id}")
    }
    pub fn final_approval(application_id: &str) -> String {
        format!("final-approval/{application_id}")
    }
    pub fn revocation(assignment_id: &str, revocation_id: &str) -> String {
        format!("revocation/{assignment_id}/{revocation_id}")
    }
    pub fn revocations_of(assignment_id: &str) -> String {
        format!("revocation/{assignment_id}/")
    }
}

pub struct Store {
    instance: Arc<sled::Db>,
    max_conflict_retries: u32,
    flush_on_commit: bool,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>, config: &EngineConfig) -> Self {
        Self {
            instance,
            max_conflict_retries: config.max_conflict_retries,
            flush_on_commit: config.flush_on_commit,
        }
    }

    /// Run `work` as one atomic unit. Any error discards everything staged;
    /// only conflicts are retried.
    pub fn atomically<T, F>(&self, mut work: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T, EngineError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = Tx::begin(&self.instance);
            let value = work(&mut tx)?;

            match tx.commit() {
                Ok(written) => {
                    debug!(attempt, written, "unit of work committed");
                    if self.flush_on_commit {
                        self.instance.flush().map_err(StoreError::from)?;
                    }
                    return Ok(value);
                }
                Err(CommitError::Conflict) if attempt <= self.max_conflict_retries => {
                    warn!(attempt, "unit of work conflicted with a concurrent update, retrying");
                }
                Err(CommitError::Conflict) => return Err(StoreError::Conflict(attempt).into()),
                Err(CommitError::Sled(err)) => return Err(StoreError::Sled(err).into()),
            }
        }
    }

    /// Run read-only `work` against one consistent view. Anything it stages is
    /// dropped.
    ///
    /// Once `work` returns, the point reads it made are checked against the
    /// database in one sled transaction. If a concurrent commit changed any of
    /// them the result is thrown away and `work` runs again. Scans are not
    /// checked themselves; they are consistent because every write under a
    /// scanned prefix also rewrites the guard record (assignment or group) the
    /// reader loads first.
    pub fn read<T, F>(&self, mut work: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T, EngineError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = Tx::begin(&self.instance);
            let value = work(&mut tx);

            match tx.validate() {
                Ok(()) => return value,
                Err(CommitError::Conflict) if attempt <= self.max_conflict_retries => {
                    debug!(attempt, "read overlapped a concurrent update, reading again");
                }
                Err(CommitError::Conflict) => return Err(StoreError::Conflict(attempt).into()),
                Err(CommitError::Sled(err)) => return Err(StoreError::Sled(err).into()),
            }
        }
    }
}

enum CommitError {
    Conflict,
    Sled(sled::Error),
}

pub struct Tx<'a> {
    db: &'a sled::Db,
    // bytes observed by point reads, checked again at commit
    reads: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    // None stages a removal
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Tx<'a> {
    fn begin(db: &'a sled::Db) -> Self {
        Self {
            db,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    fn raw_get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.as_bytes();
        if let Some(staged) = self.writes.get(key) {
            return Ok(staged.clone());
        }
        if let Some(seen) = self.reads.get(key) {
            return Ok(seen.clone());
        }

        let value = self.db.get(key)?.map(|v| v.to_vec());
        self.reads.insert(key.to_vec(), value.clone());
        Ok(value)
    }

    pub fn get<T: Record>(&mut self, key: &str) -> Result<Option<T>, StoreError> {
        self.raw_get(key)?
            .map(|bytes| decode(key, &bytes))
            .transpose()
    }

    pub fn put<T: Record>(&mut self, record: &T) -> Result<(), StoreError> {
        let key = record.key();
        let bytes = minicbor::to_vec(record).map_err(|e| StoreError::Encode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.writes.insert(key.into_bytes(), Some(bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.writes.insert(key.as_bytes().to_vec(), None);
    }

    pub fn get_index(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.raw_get(key)?
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| StoreError::Decode {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn put_index(&mut self, key: &str, target: &str) {
        self.writes
            .insert(key.as_bytes().to_vec(), Some(target.as_bytes().to_vec()));
    }

    /// All records under `prefix`, in key order, including staged changes.
    pub fn scan<T: Record>(&mut self, prefix: &str) -> Result<Vec<T>, StoreError> {
        let prefix = prefix.as_bytes();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for entry in self.db.scan_prefix(prefix) {
            let (key, value) = entry?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, staged) in self.writes.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged
            .iter()
            .map(|(key, value)| decode(&String::from_utf8_lossy(key), value))
            .collect()
    }

    fn reads_unchanged(
        &self,
        tree: &TransactionalTree,
    ) -> Result<(), ConflictableTransactionError<()>> {
        for (key, expected) in &self.reads {
            let current = tree.get(key)?;
            if current.as_deref() != expected.as_deref() {
                return Err(ConflictableTransactionError::Abort(()));
            }
        }
        Ok(())
    }

    /// Check that every point read still holds, without writing anything.
    fn validate(&self) -> Result<(), CommitError> {
        if self.reads.is_empty() {
            return Ok(());
        }
        let result: Result<(), TransactionError<()>> =
            self.db.transaction(|tree| self.reads_unchanged(tree));

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(())) => Err(CommitError::Conflict),
            Err(TransactionError::Storage(err)) => Err(CommitError::Sled(err)),
        }
    }

    fn commit(self) -> Result<usize, CommitError> {
        if self.writes.is_empty() {
            return Ok(0);
        }

        let result: Result<(), TransactionError<()>> = self.db.transaction(|tree| {
            self.reads_unchanged(tree)?;
            for (key, staged) in &self.writes {
                match staged {
                    Some(value) => {
                        tree.insert(key.as_slice(), value.as_slice())?;
                    }
                    None => {
                        tree.remove(key.as_slice())?;
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(self.writes.len()),
            Err(TransactionError::Abort(())) => Err(CommitError::Conflict),
            Err(TransactionError::Storage(err)) => Err(CommitError::Sled(err)),
        }
    }
}

fn decode<T: Record>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    minicbor::decode(bytes).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
