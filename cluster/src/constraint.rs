use std::collections::{BTreeSet, HashMap};

use crate::error::Result;
use crate::store::Txn;
use crate::types::{Constraint, ConstraintKind};

/// In-memory view of every user constraint, indexed by face.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    must: HashMap<String, BTreeSet<String>>,
    cannot: HashMap<String, BTreeSet<String>>,
    all: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        let mut set = Self::default();
        for c in constraints {
            let map = match c.kind {
                ConstraintKind::MustLink => &mut set.must,
                ConstraintKind::CannotLink => &mut set.cannot,
            };
            map.entry(c.a.clone()).or_default().insert(c.b.clone());
            map.entry(c.b.clone()).or_default().insert(c.a.clone());
            set.all.push(c);
        }
        set
    }

    pub fn all(&self) -> &[Constraint] {
        &self.all
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn must_partners(&self, face: &str) -> impl Iterator<Item = &str> {
        self.must.get(face).into_iter().flatten().map(String::as_str)
    }

    pub fn cannot_partners(&self, face: &str) -> impl Iterator<Item = &str> {
        self.cannot.get(face).into_iter().flatten().map(String::as_str)
    }

    pub fn get(&self, x: &str, y: &str) -> Option<ConstraintKind> {
        if self.must.get(x).is_some_and(|s| s.contains(y)) {
            Some(ConstraintKind::MustLink)
        } else if self.cannot.get(x).is_some_and(|s| s.contains(y)) {
            Some(ConstraintKind::CannotLink)
        } else {
            None
        }
    }

    /// True when `cluster_id` holds a CANNOT_LINK partner of `face`.
    pub fn cluster_forbids(&self, txn: &Txn<'_>, face: &str, cluster_id: &str) -> Result<bool> {
        for p in self.cannot_partners(face) {
            if p == face {
                continue;
            }
            if let Some(pf) = txn.face(p)? {
                if pf.is_active() && pf.cluster_id.as_deref() == Some(cluster_id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// True when putting all faces of `x` and `y` together would violate a
    /// CANNOT_LINK pair.
    pub fn clusters_conflict(&self, txn: &Txn<'_>, x: &str, y: &str) -> Result<bool> {
        for c in self.all.iter().filter(|c| c.kind == ConstraintKind::CannotLink) {
            let ca = txn.face(&c.a)?.filter(|f| f.is_active()).and_then(|f| f.cluster_id);
            let cb = txn.face(&c.b)?.filter(|f| f.is_active()).and_then(|f| f.cluster_id);
            if let (Some(ca), Some(cb)) = (ca, cb) {
                if (ca == x && cb == y) || (ca == y && cb == x) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
