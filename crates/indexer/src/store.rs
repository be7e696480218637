//! The indexer's persistent store.
//!
//! A single redb database with prefix-encoded secondary index keys. The
//! unique `updateHash` index is the correctness backstop for intake
//! deduplication: the check and the insert share one write transaction, so
//! concurrent deliveries of the same hash cannot both land.

use loom_types::error::StoreError;
use loom_types::snapshot::{
    IndexedTransition, RejectedTransaction, SnapshotRecord, SnapshotStatus, StoredRejection,
};
use loom_types::fiber::Fiber;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

/// ---- Table definitions (single DB, prefix-encoded keys) ----
const REJECTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("REJECTIONS");
/// updateHash -> id. Uniqueness backstop for intake dedup.
const REJECTION_BY_HASH: TableDefinition<&str, u64> = TableDefinition::new("REJECTION_BY_HASH");
/// [ordinal_be(8)][id_be(8)] -> id. Reverse scans give (ordinal desc, id desc).
const REJECTION_BY_ORDINAL: TableDefinition<&[u8], u64> =
    TableDefinition::new("REJECTION_BY_ORDINAL");
/// [fiber_id][0x00][id_be(8)] -> id.
const REJECTION_BY_FIBER: TableDefinition<&[u8], u64> = TableDefinition::new("REJECTION_BY_FIBER");
const SNAPSHOTS: TableDefinition<u64, &[u8]> = TableDefinition::new("SNAPSHOTS");
const FIBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("FIBERS");
/// [fiber_id][0x00][seq_be(8)] -> IndexedTransition.
const TRANSITIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("TRANSITIONS");
const META: TableDefinition<&str, u64> = TableDefinition::new("META");

const NEXT_REJECTION_ID: &str = "next_rejection_id";

fn be64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn k_ordinal(ordinal: u64, id: u64) -> Vec<u8> {
    [be64(ordinal).as_slice(), be64(id).as_slice()].concat()
}

fn k_fiber(fiber_id: &str, id: u64) -> Vec<u8> {
    [fiber_id.as_bytes(), &[0u8], be64(id).as_slice()].concat()
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

/// Outcome of a rejection upsert.
#[derive(Clone, Copy, Debug)]
pub struct UpsertOutcome {
    /// False when the `updateHash` was already indexed (no new row).
    pub inserted: bool,
    /// Row id of the stored record (new or pre-existing).
    pub id: u64,
}

/// Outcome of a confirmation sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepOutcome {
    /// Older PENDING snapshots marked ORPHANED by this confirmation.
    pub orphaned: u64,
}

/// Filters for the rejection query surface.
#[derive(Clone, Debug, Default)]
pub struct RejectionFilter {
    pub fiber_id: Option<String>,
    pub update_type: Option<String>,
    /// Matches rejections whose `signers` array contains this address.
    pub signer: Option<String>,
    /// Matches rejections carrying an error with this code.
    pub error_code: Option<String>,
    pub from_ordinal: Option<u64>,
    pub to_ordinal: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of rejections plus paging metadata.
#[derive(Clone, Debug)]
pub struct RejectionPage {
    pub rejections: Vec<StoredRejection>,
    pub total: usize,
    pub has_more: bool,
}

/// The redb-backed indexer store.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens (or creates) the database and ensures all tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;
        {
            let w = db.begin_write().map_err(backend)?;
            {
                w.open_table(REJECTIONS).map_err(backend)?;
                w.open_table(REJECTION_BY_HASH).map_err(backend)?;
                w.open_table(REJECTION_BY_ORDINAL).map_err(backend)?;
                w.open_table(REJECTION_BY_FIBER).map_err(backend)?;
                w.open_table(SNAPSHOTS).map_err(backend)?;
                w.open_table(FIBERS).map_err(backend)?;
                w.open_table(TRANSITIONS).map_err(backend)?;
                w.open_table(META).map_err(backend)?;
            }
            w.commit().map_err(backend)?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    // --- Rejections -----------------------------------------------------

    /// Inserts a rejection keyed by its globally unique `updateHash`.
    /// Duplicate intake is a no-op reporting the existing row id.
    pub fn upsert_rejection(
        &self,
        rejection: &RejectedTransaction,
    ) -> Result<UpsertOutcome, StoreError> {
        let w = self.db.begin_write().map_err(backend)?;
        let outcome = {
            let mut by_hash = w.open_table(REJECTION_BY_HASH).map_err(backend)?;
            let existing_id = by_hash
                .get(rejection.update_hash.as_str())
                .map_err(backend)?
                .map(|existing| existing.value());
            if let Some(id) = existing_id {
                UpsertOutcome {
                    inserted: false,
                    id,
                }
            } else {
                let mut meta = w.open_table(META).map_err(backend)?;
                let id = meta
                    .get(NEXT_REJECTION_ID)
                    .map_err(backend)?
                    .map(|v| v.value())
                    .unwrap_or(1);
                meta.insert(NEXT_REJECTION_ID, id + 1).map_err(backend)?;

                let stored = StoredRejection {
                    id,
                    rejection: rejection.clone(),
                };
                let bytes = serde_json::to_vec(&stored).map_err(corrupt)?;

                let mut rejections = w.open_table(REJECTIONS).map_err(backend)?;
                rejections.insert(id, bytes.as_slice()).map_err(backend)?;
                by_hash
                    .insert(rejection.update_hash.as_str(), id)
                    .map_err(backend)?;
                let mut by_ordinal = w.open_table(REJECTION_BY_ORDINAL).map_err(backend)?;
                by_ordinal
                    .insert(k_ordinal(rejection.ordinal, id).as_slice(), id)
                    .map_err(backend)?;
                let mut by_fiber = w.open_table(REJECTION_BY_FIBER).map_err(backend)?;
                by_fiber
                    .insert(k_fiber(&rejection.fiber_id, id).as_slice(), id)
                    .map_err(backend)?;

                UpsertOutcome { inserted: true, id }
            }
        };
        w.commit().map_err(backend)?;
        Ok(outcome)
    }

    /// Fetches a rejection by its `updateHash`.
    pub fn rejection_by_hash(&self, hash: &str) -> Result<Option<StoredRejection>, StoreError> {
        let r = self.db.begin_read().map_err(backend)?;
        let by_hash = r.open_table(REJECTION_BY_HASH).map_err(backend)?;
        let Some(id) = by_hash.get(hash).map_err(backend)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let rejections = r.open_table(REJECTIONS).map_err(backend)?;
        let Some(bytes) = rejections.get(id).map_err(backend)? else {
            return Ok(None);
        };
        serde_json::from_slice(bytes.value()).map(Some).map_err(corrupt)
    }

    /// Runs a filtered, paged query. Ordering is `(ordinal desc, id desc)`;
    /// `has_more` is true iff `offset + len < total`.
    pub fn query_rejections(&self, filter: &RejectionFilter) -> Result<RejectionPage, StoreError> {
        let r = self.db.begin_read().map_err(backend)?;
        let by_ordinal = r.open_table(REJECTION_BY_ORDINAL).map_err(backend)?;
        let rejections = r.open_table(REJECTIONS).map_err(backend)?;

        let lower = k_ordinal(filter.from_ordinal.unwrap_or(0), 0);
        let upper = k_ordinal(
            filter.to_ordinal.map(|o| o.saturating_add(1)).unwrap_or(u64::MAX),
            0,
        );

        let mut matches: Vec<StoredRejection> = Vec::new();
        // Reverse index scan yields (ordinal desc, id desc) directly.
        for entry in by_ordinal
            .range(lower.as_slice()..upper.as_slice())
            .map_err(backend)?
            .rev()
        {
            let (_, id) = entry.map_err(backend)?;
            let Some(bytes) = rejections.get(id.value()).map_err(backend)? else {
                continue;
            };
            let stored: StoredRejection =
                serde_json::from_slice(bytes.value()).map_err(corrupt)?;
            if filter_matches(filter, &stored) {
                matches.push(stored);
            }
        }

        let total = matches.len();
        let page: Vec<StoredRejection> = matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        let has_more = filter.offset + page.len() < total;
        Ok(RejectionPage {
            rejections: page,
            total,
            has_more,
        })
    }

    // --- Snapshots ------------------------------------------------------

    /// Records a snapshot as PENDING if it is not yet indexed.
    pub fn mark_pending(&self, ordinal: u64, hash: &str) -> Result<(), StoreError> {
        let w = self.db.begin_write().map_err(backend)?;
        {
            let mut snapshots = w.open_table(SNAPSHOTS).map_err(backend)?;
            if snapshots.get(ordinal).map_err(backend)?.is_none() {
                let record = SnapshotRecord {
                    ordinal,
                    hash: hash.to_string(),
                    status: SnapshotStatus::Pending,
                    gl0_ordinal: None,
                    confirmed_at: None,
                };
                let bytes = serde_json::to_vec(&record).map_err(corrupt)?;
                snapshots.insert(ordinal, bytes.as_slice()).map_err(backend)?;
            }
        }
        w.commit().map_err(backend)?;
        Ok(())
    }

    /// Confirms a snapshot and sweeps older PENDING rows to ORPHANED in the
    /// same transaction. Confirmed rows are never touched by the sweep.
    pub fn confirm_snapshot(
        &self,
        ordinal: u64,
        hash: &str,
        gl0_ordinal: Option<u64>,
        confirmed_at: u64,
    ) -> Result<SweepOutcome, StoreError> {
        let w = self.db.begin_write().map_err(backend)?;
        let mut outcome = SweepOutcome::default();
        {
            let mut snapshots = w.open_table(SNAPSHOTS).map_err(backend)?;

            let record = SnapshotRecord {
                ordinal,
                hash: hash.to_string(),
                status: SnapshotStatus::Confirmed,
                gl0_ordinal,
                confirmed_at: Some(confirmed_at),
            };
            let bytes = serde_json::to_vec(&record).map_err(corrupt)?;
            snapshots.insert(ordinal, bytes.as_slice()).map_err(backend)?;

            // Single sweep over everything older than the confirmation.
            let mut orphaned: Vec<(u64, Vec<u8>)> = Vec::new();
            for entry in snapshots.range(0..ordinal).map_err(backend)? {
                let (key, value) = entry.map_err(backend)?;
                let mut record: SnapshotRecord =
                    serde_json::from_slice(value.value()).map_err(corrupt)?;
                if record.status == SnapshotStatus::Pending {
                    record.status = SnapshotStatus::Orphaned;
                    orphaned.push((key.value(), serde_json::to_vec(&record).map_err(corrupt)?));
                }
            }
            outcome.orphaned = orphaned.len() as u64;
            for (key, bytes) in orphaned {
                snapshots.insert(key, bytes.as_slice()).map_err(backend)?;
            }
        }
        w.commit().map_err(backend)?;
        Ok(outcome)
    }

    /// Fetches a snapshot row by ordinal.
    pub fn snapshot(&self, ordinal: u64) -> Result<Option<SnapshotRecord>, StoreError> {
        let r = self.db.begin_read().map_err(backend)?;
        let snapshots = r.open_table(SNAPSHOTS).map_err(backend)?;
        let Some(bytes) = snapshots.get(ordinal).map_err(backend)? else {
            return Ok(None);
        };
        serde_json::from_slice(bytes.value()).map(Some).map_err(corrupt)
    }

    // --- Fibers & transitions ------------------------------------------

    /// Stores the last-indexed state of a fiber.
    pub fn put_fiber(&self, fiber: &Fiber) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(fiber).map_err(corrupt)?;
        let w = self.db.begin_write().map_err(backend)?;
        {
            let mut fibers = w.open_table(FIBERS).map_err(backend)?;
            fibers
                .insert(fiber.fiber_id.as_str(), bytes.as_slice())
                .map_err(backend)?;
        }
        w.commit().map_err(backend)?;
        Ok(())
    }

    /// Fetches the last-indexed state of a fiber.
    pub fn fiber(&self, fiber_id: &str) -> Result<Option<Fiber>, StoreError> {
        let r = self.db.begin_read().map_err(backend)?;
        let fibers = r.open_table(FIBERS).map_err(backend)?;
        let Some(bytes) = fibers.get(fiber_id).map_err(backend)? else {
            return Ok(None);
        };
        serde_json::from_slice(bytes.value()).map(Some).map_err(corrupt)
    }

    /// Appends a successful transition to the fiber's log.
    pub fn record_transition(&self, transition: &IndexedTransition) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(transition).map_err(corrupt)?;
        let key = k_fiber(&transition.fiber_id, transition.sequence_number);
        let w = self.db.begin_write().map_err(backend)?;
        {
            let mut transitions = w.open_table(TRANSITIONS).map_err(backend)?;
            transitions
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(backend)?;
        }
        w.commit().map_err(backend)?;
        Ok(())
    }

    /// Recent transitions for a fiber, newest first.
    pub fn transitions_for(
        &self,
        fiber_id: &str,
        limit: usize,
    ) -> Result<Vec<IndexedTransition>, StoreError> {
        let r = self.db.begin_read().map_err(backend)?;
        let transitions = r.open_table(TRANSITIONS).map_err(backend)?;
        let lower = k_fiber(fiber_id, 0);
        let upper = k_fiber(fiber_id, u64::MAX);
        let mut out = Vec::new();
        for entry in transitions
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(backend)?
            .rev()
            .take(limit)
        {
            let (_, bytes) = entry.map_err(backend)?;
            out.push(serde_json::from_slice(bytes.value()).map_err(corrupt)?);
        }
        Ok(out)
    }
}

fn filter_matches(filter: &RejectionFilter, stored: &StoredRejection) -> bool {
    let r = &stored.rejection;
    if let Some(fiber_id) = &filter.fiber_id {
        if &r.fiber_id != fiber_id {
            return false;
        }
    }
    if let Some(update_type) = &filter.update_type {
        if &r.update_type.to_string() != update_type {
            return false;
        }
    }
    if let Some(signer) = &filter.signer {
        if !r.signers.iter().any(|s| s == signer) {
            return false;
        }
    }
    if let Some(code) = &filter.error_code {
        if !r.errors.iter().any(|e| &e.code == code) {
            return false;
        }
    }
    true
}
