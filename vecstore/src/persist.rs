//! On-disk format for [`HnswIndex`].
//!
//! ```text
//! [4B magic "FGHN"] [4B version]
//! [4B dim] [4B m] [4B ef_construction] [4B ef_search]
//! [1B has_seed] [8B seed]
//! [4B num_slots]
//! per slot:
//!   [1B active]
//!   if active:
//!     [4B id_len] [id bytes] [4B level]
//!     [dim x 4B f32 vector]
//!     per layer 0..=level: [4B n] [n x 4B neighbor slot]
//! [32B blake3 of everything above]
//! ```
//!
//! Little-endian throughout. The file is a cache of the authoritative
//! store: any failure to read or validate it means "rebuild", never
//! "partially load".

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::VecError;
use crate::hnsw::{Graph, HnswConfig, HnswIndex, MAX_LEVEL, Node};

const MAGIC: [u8; 4] = *b"FGHN";
const VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;

/// Serialize the index to a writer.
pub fn save(index: &HnswIndex, w: &mut dyn Write) -> Result<(), VecError> {
    let body = encode(&index.graph());
    let sum = blake3::hash(&body);
    w.write_all(&body)?;
    w.write_all(sum.as_bytes())?;
    w.flush()?;
    Ok(())
}

/// Deserialize an index from a reader, verifying the checksum first.
pub fn load(r: &mut dyn Read) -> Result<HnswIndex, VecError> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    if buf.len() < CHECKSUM_LEN {
        return Err(VecError::InvalidFormat("truncated file".into()));
    }
    let (body, sum) = buf.split_at(buf.len() - CHECKSUM_LEN);
    if blake3::hash(body).as_bytes() != sum {
        return Err(VecError::Checksum);
    }
    let graph = decode(body)?;
    Ok(HnswIndex::from_graph(graph))
}

/// Write the index to `path` atomically (temporary file then rename).
pub fn save_file(index: &HnswIndex, path: &Path) -> Result<(), VecError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = tmp_path(path);
    {
        let mut f = fs::File::create(&tmp)?;
        save(index, &mut f)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), vectors = index.graph().by_id.len(), "vecstore: index saved");
    Ok(())
}

pub fn load_file(path: &Path) -> Result<HnswIndex, VecError> {
    let mut f = fs::File::open(path)?;
    load(&mut f)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// What [`open_or_empty`] found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Missing,
    /// Unreadable, truncated or checksum failure.
    Corrupt(String),
    /// Readable but built for another dimension.
    Incompatible { found: usize, want: usize },
}

impl LoadOutcome {
    /// True when the caller must rebuild the index from its store.
    pub fn needs_rebuild(&self) -> bool {
        !matches!(self, LoadOutcome::Loaded)
    }
}

/// Load the index at `path`, or return an empty one built from `cfg`.
pub fn open_or_empty(path: &Path, cfg: HnswConfig) -> (HnswIndex, LoadOutcome) {
    if !path.exists() {
        return (HnswIndex::new(cfg), LoadOutcome::Missing);
    }
    match load_file(path) {
        Ok(idx) => {
            let found = idx.graph().cfg.dim;
            if found != cfg.dim {
                warn!(path = %path.display(), found, want = cfg.dim, "vecstore: index dimension mismatch, starting empty");
                let want = cfg.dim;
                return (HnswIndex::new(cfg), LoadOutcome::Incompatible { found, want });
            }
            idx.set_ef_search(cfg.ef_search);
            (idx, LoadOutcome::Loaded)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "vecstore: index unreadable, starting empty");
            (HnswIndex::new(cfg), LoadOutcome::Corrupt(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_u32(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&(v as u32).to_le_bytes());
}

fn encode(g: &Graph) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());

    put_u32(&mut out, g.cfg.dim);
    put_u32(&mut out, g.cfg.m);
    put_u32(&mut out, g.cfg.ef_construction);
    put_u32(&mut out, g.cfg.ef_search);
    out.push(g.cfg.seed.is_some() as u8);
    out.extend_from_slice(&g.cfg.seed.unwrap_or(0).to_le_bytes());

    put_u32(&mut out, g.slots.len());
    for slot in &g.slots {
        let Some(nd) = slot else {
            out.push(0);
            continue;
        };
        out.push(1);
        put_u32(&mut out, nd.id.len());
        out.extend_from_slice(nd.id.as_bytes());
        put_u32(&mut out, nd.level());
        for &x in &nd.vector {
            out.extend_from_slice(&x.to_le_bytes());
        }
        for links in &nd.links {
            put_u32(&mut out, links.len());
            for &l in links {
                out.extend_from_slice(&l.to_le_bytes());
            }
        }
    }
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], VecError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let s = &self.buf[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(VecError::InvalidFormat(format!("unexpected end at byte {}", self.pos))),
        }
    }

    fn u8(&mut self) -> Result<u8, VecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, VecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, VecError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn f32(&mut self) -> Result<f32, VecError> {
        Ok(f32::from_bits(self.u32()?))
    }
}

fn decode(body: &[u8]) -> Result<Graph, VecError> {
    let mut c = Cursor { buf: body, pos: 0 };

    if c.take(4)? != MAGIC {
        return Err(VecError::InvalidFormat("bad magic".into()));
    }
    let version = c.u32()?;
    if version != VERSION {
        return Err(VecError::InvalidFormat(format!(
            "unsupported version {version} (want {VERSION})"
        )));
    }

    let dim = c.u32()? as usize;
    if dim == 0 {
        return Err(VecError::InvalidFormat("dimension 0".into()));
    }
    let m = c.u32()? as usize;
    let ef_construction = c.u32()? as usize;
    let ef_search = c.u32()? as usize;
    let has_seed = c.u8()? != 0;
    let seed = c.u64()?;
    let mut cfg = HnswConfig {
        dim,
        m,
        ef_construction,
        ef_search,
        seed: has_seed.then_some(seed),
    };
    cfg.set_defaults();

    let num_slots = c.u32()? as usize;
    let mut slots: Vec<Option<Node>> = Vec::with_capacity(num_slots.min(1 << 20));
    for _ in 0..num_slots {
        if c.u8()? == 0 {
            slots.push(None);
            continue;
        }
        let id_len = c.u32()? as usize;
        let id = String::from_utf8(c.take(id_len)?.to_vec())
            .map_err(|_| VecError::InvalidFormat("id is not utf-8".into()))?;
        let level = c.u32()? as usize;
        if level > MAX_LEVEL {
            return Err(VecError::InvalidFormat(format!("level {level} out of range")));
        }
        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            vector.push(c.f32()?);
        }
        let mut links = Vec::with_capacity(level + 1);
        for _ in 0..=level {
            let n = c.u32()? as usize;
            let mut layer = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                layer.push(c.u32()?);
            }
            links.push(layer);
        }
        slots.push(Some(Node { id, vector, links }));
    }

    if c.pos != body.len() {
        return Err(VecError::InvalidFormat("trailing bytes".into()));
    }

    // Every link must point at a live node present on that layer.
    for (i, slot) in slots.iter().enumerate() {
        let Some(nd) = slot else { continue };
        for (layer, links) in nd.links.iter().enumerate() {
            for &l in links {
                let ok = slots
                    .get(l as usize)
                    .and_then(|s| s.as_ref())
                    .is_some_and(|t| layer < t.links.len());
                if !ok {
                    return Err(VecError::InvalidFormat(format!(
                        "slot {i} layer {layer} links to invalid slot {l}"
                    )));
                }
            }
        }
    }

    Ok(Graph::from_slots(cfg, slots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AnnIndex;
    use tempfile::tempdir;

    fn sample_index() -> HnswIndex {
        let h = HnswIndex::new(HnswConfig {
            dim: 4,
            m: 4,
            ef_construction: 32,
            ef_search: 16,
            seed: Some(1),
        });
        for i in 0..50 {
            let a = i as f32 * 0.37;
            h.insert(&format!("n{i}"), &[a.cos(), a.sin(), 0.2, (i % 3) as f32 * 0.1]).unwrap();
        }
        h.remove("n7").unwrap();
        h
    }

    #[test]
    fn test_save_load_preserves_results() {
        let h = sample_index();
        let mut buf = Vec::new();
        save(&h, &mut buf).unwrap();

        let loaded = load(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.len(), h.len());
        assert!(!loaded.contains("n7"));

        let q = [1.0, 0.3, 0.2, 0.0];
        assert_eq!(h.search(&q, 5).unwrap(), loaded.search(&q, 5).unwrap());
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let h = sample_index();
        let mut buf = Vec::new();
        save(&h, &mut buf).unwrap();
        buf[40] ^= 0xff;
        assert!(matches!(load(&mut buf.as_slice()), Err(VecError::Checksum)));
    }

    #[test]
    fn test_truncated_is_error() {
        let h = sample_index();
        let mut buf = Vec::new();
        save(&h, &mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(load(&mut buf.as_slice()).is_err());
        assert!(load(&mut [0u8; 4].as_slice()).is_err());
    }

    #[test]
    fn test_open_or_empty_outcomes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx").join("anchors.hnsw");
        let cfg = HnswConfig {
            dim: 4,
            seed: Some(1),
            ..HnswConfig::default()
        };

        let (empty, outcome) = open_or_empty(&path, cfg.clone());
        assert_eq!(outcome, LoadOutcome::Missing);
        assert!(empty.is_empty());

        save_file(&sample_index(), &path).unwrap();
        let (idx, outcome) = open_or_empty(&path, cfg.clone());
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(idx.len(), 49);

        let (_, outcome) = open_or_empty(&path, HnswConfig::with_dim(8));
        assert!(matches!(outcome, LoadOutcome::Incompatible { found: 4, want: 8 }));

        fs::write(&path, b"garbage").unwrap();
        let (idx, outcome) = open_or_empty(&path, cfg);
        assert!(matches!(outcome, LoadOutcome::Corrupt(_)));
        assert!(outcome.needs_rebuild());
        assert!(idx.is_empty());
    }
}
