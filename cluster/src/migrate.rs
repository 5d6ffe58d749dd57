//! Forward-only schema migrations.
//!
//! `meta:schema_version` records the last applied migration. Each migration
//! returns a batch that is committed together with its version bump, so a
//! crash between migrations leaves a consistent, resumable state.

use facegroup_kv::{Batch, KvStore};
use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::keys::*;
use crate::store::decode;
use crate::types::FaceObservation;

pub const SCHEMA_VERSION: u32 = 2;

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&dyn KvStore) -> Result<Batch>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        apply: v1_init,
    },
    Migration {
        version: 2,
        name: "member_index",
        apply: v2_member_index,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<u32>,
    pub wiped: bool,
}

/// v1: id sequences.
pub fn v1_init(kv: &dyn KvStore) -> Result<Batch> {
    let mut b = Batch::new();
    for key in [META_CLUSTER_SEQ, META_HISTORY_SEQ] {
        if kv.get(key)?.is_none() {
            b.put(key, b"0".to_vec());
        }
    }
    Ok(b)
}

/// v2: `member:{cluster}:{face}` secondary index, backfilled from faces.
pub fn v2_member_index(kv: &dyn KvStore) -> Result<Batch> {
    let mut b = Batch::new();
    for (_, data) in kv.scan(FACE_PREFIX)? {
        let face: FaceObservation = decode(&data)?;
        if let (true, Some(c)) = (face.is_active(), &face.cluster_id) {
            b.put(member_key(c, &face.id), Vec::new());
        }
    }
    Ok(b)
}

pub fn schema_version(kv: &dyn KvStore) -> Result<u32> {
    match kv.get(META_SCHEMA_VERSION)? {
        None => Ok(0),
        Some(data) => serde_json::from_slice(&data).map_err(|e| ClusterError::Serialization(e.to_string())),
    }
}

fn version_bytes(v: u32) -> Vec<u8> {
    v.to_string().into_bytes()
}

/// Bring the store up to [`SCHEMA_VERSION`].
pub fn migrate(kv: &dyn KvStore, allow_destructive: bool) -> Result<MigrationReport> {
    let from = schema_version(kv)?;
    if from > SCHEMA_VERSION {
        if !allow_destructive {
            return Err(ClusterError::SchemaTooNew {
                found: from,
                supported: SCHEMA_VERSION,
            });
        }
        warn!(found = from, supported = SCHEMA_VERSION, "cluster: store schema is newer, wiping");
        wipe_and_stamp(kv)?;
        return Ok(MigrationReport {
            from,
            to: SCHEMA_VERSION,
            applied: Vec::new(),
            wiped: true,
        });
    }

    let mut applied = Vec::new();
    for m in MIGRATIONS.iter().filter(|m| m.version > from) {
        let outcome = (m.apply)(kv).and_then(|mut batch| {
            batch.put(META_SCHEMA_VERSION, version_bytes(m.version));
            kv.commit(batch).map_err(ClusterError::from)
        });
        match outcome {
            Ok(()) => {
                info!(version = m.version, name = m.name, "cluster: migration applied");
                applied.push(m.version);
            }
            Err(e) if allow_destructive => {
                warn!(version = m.version, error = %e, "cluster: migration failed, wiping");
                wipe_and_stamp(kv)?;
                return Ok(MigrationReport {
                    from,
                    to: SCHEMA_VERSION,
                    applied,
                    wiped: true,
                });
            }
            Err(e) => {
                return Err(ClusterError::Migration {
                    version: m.version,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(MigrationReport {
        from,
        to: SCHEMA_VERSION,
        applied,
        wiped: false,
    })
}

/// Delete every key and stamp a fresh latest-version store.
fn wipe_and_stamp(kv: &dyn KvStore) -> Result<()> {
    let mut b = Batch::new();
    for key in kv.scan_keys("")? {
        b.delete(key);
    }
    b.put(META_CLUSTER_SEQ, b"0".to_vec());
    b.put(META_HISTORY_SEQ, b"0".to_vec());
    b.put(META_SCHEMA_VERSION, version_bytes(SCHEMA_VERSION));
    kv.commit(b)?;
    Ok(())
}
