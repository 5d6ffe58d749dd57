//! Persistent work queue, one record per photo under `scan:item:{photo}`.
//!
//! Pending items are also indexed under `scan:pending:{ready_ms}:{photo}`,
//! ordered by when they may run next, and totals by state live in the
//! `scan:counts` record. Every item write keeps both in step, so picking a
//! batch reads only the head of the pending index.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use facegroup_cluster::Txn;
use facegroup_kv::{Batch, KvStore};

use crate::catalog::PhotoRef;
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};

pub const ITEM_PREFIX: &str = "scan:item:";
pub const PENDING_PREFIX: &str = "scan:pending:";
pub const COUNTS_KEY: &str = "scan:counts";

/// Width of the zero-padded ready time in pending keys.
const READY_DIGITS: usize = 20;

pub fn item_key(photo_id: &str) -> String {
    format!("{ITEM_PREFIX}{photo_id}")
}

fn pending_key(ready: Option<DateTime<Utc>>, photo_id: &str) -> String {
    let ms = ready.map_or(0, |t| t.timestamp_millis().max(0));
    format!("{PENDING_PREFIX}{ms:020}:{photo_id}")
}

/// Ready time (ms) and photo id of a pending index key.
fn parse_pending_key(key: &str) -> Option<(i64, &str)> {
    let rest = key.strip_prefix(PENDING_PREFIX)?;
    let ms = rest.get(..READY_DIGITS)?.parse().ok()?;
    let photo = rest.get(READY_DIGITS + 1..)?;
    Some((ms, photo))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| ScanError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| ScanError::Serialization(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Done,
    /// Exhausted its attempts; excluded until a forced rescan.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub photo_id: String,
    pub modified: DateTime<Utc>,
    pub state: ItemState,
    pub attempts: u32,
    /// Earliest retry time after a failure.
    pub next_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Faces staged when the photo was done.
    pub faces: usize,
}

impl WorkItem {
    fn new(photo: &PhotoRef) -> Self {
        Self {
            photo_id: photo.id.clone(),
            modified: photo.modified,
            state: ItemState::Pending,
            attempts: 0,
            next_attempt: None,
            last_error: None,
            faces: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == ItemState::Pending && self.next_attempt.is_none_or(|t| t <= now)
    }

    fn pending_key(&self) -> Option<String> {
        (self.state == ItemState::Pending).then(|| pending_key(self.next_attempt, &self.photo_id))
    }
}

/// What an enqueue pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Enqueued {
    /// New, changed or forced photos now pending.
    pub queued: usize,
    /// Already done and unchanged.
    pub skipped: usize,
}

/// Queue totals by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCounts {
    pub pending: usize,
    pub done: usize,
    pub failed: usize,
    /// Faces staged by done photos.
    pub faces: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.done + self.failed
    }

    fn replace(&mut self, old: Option<&WorkItem>, new: &WorkItem) {
        if let Some(old) = old {
            self.shift(old, false);
        }
        self.shift(new, true);
    }

    fn shift(&mut self, item: &WorkItem, add: bool) {
        let step = |n: &mut usize, by: usize| {
            if add {
                *n += by;
            } else {
                *n = n.saturating_sub(by);
            }
        };
        match item.state {
            ItemState::Pending => step(&mut self.pending, 1),
            ItemState::Done => {
                step(&mut self.done, 1);
                step(&mut self.faces, item.faces);
            }
            ItemState::Failed => step(&mut self.failed, 1),
        }
    }
}

/// Outcome of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Will be retried at the given time.
    Retry(DateTime<Utc>),
    Permanent,
}

/// Destination of item writes: a raw batch or an engine transaction.
trait Sink {
    fn set(&mut self, key: String, value: Vec<u8>);
    fn unset(&mut self, key: String);
}

impl Sink for Batch {
    fn set(&mut self, key: String, value: Vec<u8>) {
        self.put(key, value);
    }

    fn unset(&mut self, key: String) {
        self.delete(key);
    }
}

impl Sink for Txn<'_> {
    fn set(&mut self, key: String, value: Vec<u8>) {
        self.put_raw(key, value);
    }

    fn unset(&mut self, key: String) {
        self.delete_raw(key);
    }
}

/// Write `new` over `old`, moving its pending index entry and counts.
fn write(sink: &mut impl Sink, counts: &mut QueueCounts, old: Option<&WorkItem>, new: &WorkItem) -> Result<()> {
    let old_key = old.and_then(WorkItem::pending_key);
    let new_key = new.pending_key();
    if old_key != new_key {
        if let Some(key) = old_key {
            sink.unset(key);
        }
        if let Some(key) = new_key {
            sink.set(key, Vec::new());
        }
    }
    sink.set(item_key(&new.photo_id), encode(new)?);
    counts.replace(old, new);
    Ok(())
}

pub struct WorkQueue {
    kv: std::sync::Arc<dyn KvStore>,
}

impl WorkQueue {
    pub fn new(kv: std::sync::Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get(&self, photo_id: &str) -> Result<Option<WorkItem>> {
        match self.kv.get(&item_key(photo_id))? {
            Some(data) => decode(&data).map(Some),
            None => Ok(None),
        }
    }

    /// Every item, in photo id order.
    pub fn items(&self) -> Result<Vec<WorkItem>> {
        self.kv.scan(ITEM_PREFIX)?.iter().map(|(_, v)| decode(v)).collect()
    }

    /// Record catalog photos as pending. Done and failed photos are
    /// requeued only when their modification time changed or `force` is set.
    pub fn enqueue(&self, photos: &[PhotoRef], force: bool) -> Result<Enqueued> {
        let mut batch = Batch::new();
        let mut counts = self.counts()?;
        let mut out = Enqueued::default();
        for photo in photos {
            let old = self.get(&photo.id)?;
            let requeue = match &old {
                None => true,
                Some(item) if force => item.state != ItemState::Pending || item.attempts > 0,
                Some(item) => item.modified != photo.modified && item.state != ItemState::Pending,
            };
            if !requeue {
                if old.as_ref().is_some_and(|i| i.state == ItemState::Done) {
                    out.skipped += 1;
                }
                continue;
            }
            write(&mut batch, &mut counts, old.as_ref(), &WorkItem::new(photo))?;
            out.queued += 1;
        }
        if !batch.is_empty() {
            batch.put(COUNTS_KEY, encode(&counts)?);
            self.kv.commit(batch)?;
        }
        Ok(out)
    }

    /// Up to `limit` due items, soonest ready first; fresh items come in
    /// photo id order.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>> {
        let now_ms = now.timestamp_millis();
        let mut out = Vec::new();
        for key in self.kv.scan_keys_limit(PENDING_PREFIX, limit)? {
            let Some((ready, photo)) = parse_pending_key(&key) else {
                continue;
            };
            if ready > now_ms {
                break;
            }
            if let Some(item) = self.get(photo)?.filter(|i| i.is_due(now)) {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Earliest retry time among pending items waiting on a backoff.
    pub fn next_retry(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let now_ms = now.timestamp_millis();
        for key in self.kv.scan_keys(PENDING_PREFIX)? {
            let Some((ready, photo)) = parse_pending_key(&key) else {
                continue;
            };
            if ready < now_ms {
                continue;
            }
            let at = self
                .get(photo)?
                .filter(|i| i.state == ItemState::Pending)
                .and_then(|i| i.next_attempt)
                .filter(|t| *t > now);
            if at.is_some() {
                return Ok(at);
            }
        }
        Ok(None)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        match self.kv.get(COUNTS_KEY)? {
            Some(data) => decode(&data),
            None => Ok(QueueCounts::default()),
        }
    }

    /// Mark `item` done in `txn`, next to the faces it staged.
    pub fn complete(&self, txn: &mut Txn<'_>, mut item: WorkItem, faces: usize) -> Result<()> {
        item.state = ItemState::Done;
        item.faces = faces;
        item.next_attempt = None;
        item.last_error = None;
        self.write_txn(txn, &item)
    }

    /// Count a failed attempt in `txn`: schedule a retry with exponential
    /// backoff, or give up after `max_attempts`.
    pub fn fail(
        &self,
        txn: &mut Txn<'_>,
        mut item: WorkItem,
        error: &str,
        cfg: &ScanConfig,
        now: DateTime<Utc>,
    ) -> Result<Failure> {
        item.attempts += 1;
        item.last_error = Some(error.to_string());
        let outcome = if item.attempts >= cfg.max_attempts {
            item.state = ItemState::Failed;
            item.next_attempt = None;
            Failure::Permanent
        } else {
            let delay = chrono::Duration::from_std(cfg.backoff(item.attempts)).unwrap_or(chrono::Duration::zero());
            let at = now + delay;
            item.next_attempt = Some(at);
            Failure::Retry(at)
        };
        self.write_txn(txn, &item)?;
        Ok(outcome)
    }

    /// Write `item` in `txn` against the version the txn currently sees.
    fn write_txn(&self, txn: &mut Txn<'_>, item: &WorkItem) -> Result<()> {
        let old: Option<WorkItem> = txn.raw(&item_key(&item.photo_id))?.map(|d| decode(&d)).transpose()?;
        let mut counts: QueueCounts = txn.raw(COUNTS_KEY)?.map(|d| decode(&d)).transpose()?.unwrap_or_default();
        write(&mut *txn, &mut counts, old.as_ref(), item)?;
        txn.put_raw(COUNTS_KEY, encode(&counts)?);
        Ok(())
    }

    /// Photos that exhausted their attempts, with the last error.
    pub fn failures(&self) -> Result<Vec<(String, Option<String>)>> {
        Ok(self
            .items()?
            .into_iter()
            .filter(|i| i.state == ItemState::Failed)
            .map(|i| (i.photo_id, i.last_error))
            .collect())
    }
}
