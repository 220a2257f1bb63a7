//! Nearest neighbor conditioning sets used by the NNGP approximation.
//!
//! [NeighborGraph] holds, for every observation in a fixed order, its nearest
//! previously-indexed observations (the Vecchia conditioning sets) as a sparse
//! directed acyclic graph. [QueryNeighbors] holds the nearest training observations
//! of new prediction locations.
mod graph;
mod kdtree;

pub use graph::*;
pub use kdtree::KdTree;
