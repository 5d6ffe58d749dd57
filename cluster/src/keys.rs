//! KV key layout for the clustering store.
//!
//! ```text
//! face:{face_id}                 → msgpack FaceObservation
//! member:{cluster_id}:{face_id}  → empty (active faces per cluster)
//! cluster:{cluster_id}           → msgpack Cluster
//! anchor:{cluster_id}:{face_id}  → msgpack Anchor
//! stats:{cluster_id}             → msgpack ClusterStatistics
//! staged:{face_id}               → msgpack StagedFace
//! constraint:{a}:{b}             → msgpack Constraint
//! history:{history_id}           → msgpack HistoryEntry
//! identity:{identity_id}         → msgpack Identity
//! meta:{name}                    → JSON
//! ```
//!
//! Cluster and history ids are fixed-width so prefix scans return them in
//! creation order. The `scan:` namespace belongs to the scan orchestrator.

pub const FACE_PREFIX: &str = "face:";
pub const MEMBER_PREFIX: &str = "member:";
pub const CLUSTER_PREFIX: &str = "cluster:";
pub const ANCHOR_PREFIX: &str = "anchor:";
pub const STATS_PREFIX: &str = "stats:";
pub const STAGED_PREFIX: &str = "staged:";
pub const CONSTRAINT_PREFIX: &str = "constraint:";
pub const HISTORY_PREFIX: &str = "history:";
pub const IDENTITY_PREFIX: &str = "identity:";
pub const META_PREFIX: &str = "meta:";

pub const META_SCHEMA_VERSION: &str = "meta:schema_version";
pub const META_EMBED: &str = "meta:embed";
pub const META_CLUSTER_SEQ: &str = "meta:cluster_seq";
pub const META_HISTORY_SEQ: &str = "meta:history_seq";

pub fn face_key(face_id: &str) -> String {
    format!("{FACE_PREFIX}{face_id}")
}

pub fn member_key(cluster_id: &str, face_id: &str) -> String {
    format!("{MEMBER_PREFIX}{cluster_id}:{face_id}")
}

pub fn member_prefix(cluster_id: &str) -> String {
    format!("{MEMBER_PREFIX}{cluster_id}:")
}

pub fn cluster_key(cluster_id: &str) -> String {
    format!("{CLUSTER_PREFIX}{cluster_id}")
}

pub fn anchor_key(cluster_id: &str, anchor_id: &str) -> String {
    format!("{ANCHOR_PREFIX}{cluster_id}:{anchor_id}")
}

pub fn anchor_prefix(cluster_id: &str) -> String {
    format!("{ANCHOR_PREFIX}{cluster_id}:")
}

pub fn stats_key(cluster_id: &str) -> String {
    format!("{STATS_PREFIX}{cluster_id}")
}

pub fn staged_key(face_id: &str) -> String {
    format!("{STAGED_PREFIX}{face_id}")
}

pub fn constraint_key(a: &str, b: &str) -> String {
    format!("{CONSTRAINT_PREFIX}{a}:{b}")
}

pub fn history_key(history_id: &str) -> String {
    format!("{HISTORY_PREFIX}{history_id}")
}

pub fn identity_key(identity_id: &str) -> String {
    format!("{IDENTITY_PREFIX}{identity_id}")
}

/// Cluster id for sequence number `seq`. Format: "c000042"
pub fn cluster_id(seq: u64) -> String {
    format!("c{seq:06}")
}

/// History id for sequence number `seq`. Format: "h0000000042"
pub fn history_id(seq: u64) -> String {
    format!("h{seq:010}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(face_key("img/a.jpg#0"), "face:img/a.jpg#0");
        assert_eq!(member_key("c000001", "a#1"), "member:c000001:a#1");
        assert!(member_key("c000001", "a#1").starts_with(&member_prefix("c000001")));
        assert_eq!(anchor_key("c000007", "b#0"), "anchor:c000007:b#0");
        assert_eq!(history_id(42), "h0000000042");
    }

    #[test]
    fn test_ids_sort_in_creation_order() {
        assert!(cluster_id(9) < cluster_id(10));
        assert!(history_id(999) < history_id(1000));
    }

    #[test]
    fn test_member_prefix_does_not_overlap() {
        // c000001 must not match c0000010's members.
        assert!(!member_key("c0000010", "x").starts_with(&member_prefix("c000001")));
    }
}
