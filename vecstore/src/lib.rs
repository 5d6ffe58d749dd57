//! Approximate nearest-neighbor search over unit-length embeddings.
//!
//! [`HnswIndex`] is the production index; [`FlatIndex`] is an exact
//! brute-force implementation of the same [`AnnIndex`] trait. Indexes are
//! persisted with [`save_file`] and reopened with [`open_or_empty`], which
//! never serves a partially loaded graph.

pub mod distance;
pub mod error;
pub mod flat;
pub mod hnsw;
pub mod index;
pub mod persist;

pub use distance::{cosine_distance, cosine_similarity, dot, is_unit, l2_normalize, normalized};
pub use error::VecError;
pub use flat::FlatIndex;
pub use hnsw::{HnswConfig, HnswIndex};
pub use index::{AnnIndex, Neighbor};
pub use persist::{LoadOutcome, load, load_file, open_or_empty, save, save_file};
