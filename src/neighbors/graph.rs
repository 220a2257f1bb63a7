//! Nearest neighbor graph among the previous observations in ordering.

use super::kdtree::{KdTree, brute_force_nearest};
use crate::errors::{NnglsError, Result};
use linfa::Float;
use log::{debug, warn};
use ndarray::{ArrayBase, Data, Ix2};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Above this number of points the brute force search is reported as non scalable
pub const BRUTE_FORCE_WARN_SIZE: usize = 5000;

/// Nearest neighbor search strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum NeighborSearch {
    /// Static k-d tree with index-prefix pruning, O(n log n) for well spread points
    #[default]
    KdTree,
    /// Exhaustive O(n^2) scan, only meant for small datasets
    BruteForce,
}

impl fmt::Display for NeighborSearch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NeighborSearch::KdTree => write!(f, "KdTree"),
            NeighborSearch::BruteForce => write!(f, "BruteForce"),
        }
    }
}

fn check_inputs<F: Float>(coords: &ArrayBase<impl Data<Elem = F>, Ix2>, k: usize) -> Result<()> {
    if k == 0 {
        return Err(NnglsError::InvalidConfigError(
            "neighbor size should be a positive integer".to_string(),
        ));
    }
    if coords.ncols() == 0 {
        return Err(NnglsError::InvalidConfigError(
            "coordinates should have at least one component".to_string(),
        ));
    }
    if let Some((i, _)) = coords
        .rows()
        .into_iter()
        .enumerate()
        .find(|(_, row)| row.iter().any(|v| !v.is_finite()))
    {
        return Err(NnglsError::DataError {
            index: i,
            message: "non finite coordinate".to_string(),
        });
    }
    Ok(())
}

/// Vecchia conditioning sets as a sparse directed acyclic graph.
///
/// Nodes are observations in their given order. The in-edges of node `i` are its
/// neighbor set: up to `k` indices `j < i`, sorted by increasing distance (ties by
/// lowest index), each annotated with the euclidean distance to node `i`.
/// Storage is a compressed adjacency arena (offsets, indices, distances).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct NeighborGraph<F: Float> {
    /// Maximum number of neighbors per node
    k: usize,
    /// Neighbors of node i are `indices[offsets[i]..offsets[i + 1]]`
    offsets: Vec<usize>,
    indices: Vec<usize>,
    distances: Vec<F>,
}

impl<F: Float> NeighborGraph<F> {
    /// Number of leading nodes allowed to have no neighbor
    pub const N_ROOTS: usize = 1;

    /// Build the ordered nearest neighbor graph of `coords` (n, dim) with `k` neighbors
    /// using the k-d tree search
    pub fn build(coords: &ArrayBase<impl Data<Elem = F>, Ix2>, k: usize) -> Result<Self> {
        Self::build_with(coords, k, NeighborSearch::KdTree)
    }

    /// Build the ordered nearest neighbor graph with the given search strategy
    pub fn build_with(
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
        k: usize,
        search: NeighborSearch,
    ) -> Result<Self> {
        check_inputs(coords, k)?;
        let n = coords.nrows();
        let dim = coords.ncols();
        let now = Instant::now();
        let flat: Vec<F> = coords.iter().cloned().collect();
        let sets: Vec<Vec<(usize, F)>> = match search {
            NeighborSearch::KdTree => {
                let tree = KdTree::new(coords);
                (0..n)
                    .into_par_iter()
                    .map(|i| tree.nearest(&flat[i * dim..(i + 1) * dim], k, i))
                    .collect()
            }
            NeighborSearch::BruteForce => {
                if n > BRUTE_FORCE_WARN_SIZE {
                    warn!(
                        "Brute force neighbor search on {n} points is O(n^2) and does not scale, use KdTree"
                    );
                }
                (0..n)
                    .into_par_iter()
                    .map(|i| brute_force_nearest(&flat, dim, &flat[i * dim..(i + 1) * dim], k, i))
                    .collect()
            }
        };
        debug!(
            "Neighbor graph ({search}, n={n}, k={k}) built in {:?}ms",
            now.elapsed().as_millis()
        );
        Ok(Self::from_sets(k, sets))
    }

    fn from_sets(k: usize, sets: Vec<Vec<(usize, F)>>) -> Self {
        let mut offsets = Vec::with_capacity(sets.len() + 1);
        let total = sets.iter().map(|s| s.len()).sum();
        let mut indices = Vec::with_capacity(total);
        let mut distances = Vec::with_capacity(total);
        offsets.push(0);
        for set in sets {
            for (j, d) in set {
                indices.push(j);
                distances.push(d);
            }
            offsets.push(indices.len());
        }
        NeighborGraph {
            k,
            offsets,
            indices,
            distances,
        }
    }

    /// Build a graph from caller supplied neighbor lists and their coordinates.
    /// Distances are recomputed from `coords` and the result is validated.
    pub fn from_lists(
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
        k: usize,
        lists: &[Vec<usize>],
    ) -> Result<Self> {
        check_inputs(coords, k)?;
        if lists.len() != coords.nrows() {
            return Err(NnglsError::InvalidConfigError(format!(
                "neighbor lists count ({}) should match coordinates count ({})",
                lists.len(),
                coords.nrows()
            )));
        }
        let mut sets = Vec::with_capacity(lists.len());
        for (i, list) in lists.iter().enumerate() {
            let mut set = Vec::with_capacity(list.len());
            for &j in list {
                if j >= coords.nrows() {
                    return Err(NnglsError::DataError {
                        index: i,
                        message: format!("neighbor index {j} out of bounds"),
                    });
                }
                let d = crate::covariance_models::euclidean(&coords.row(i), &coords.row(j));
                set.push((j, d));
            }
            sets.push(set);
        }
        let graph = Self::from_sets(k, sets);
        graph.validate()?;
        Ok(graph)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Whether the graph has no node
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of neighbors per node
    pub fn max_neighbors(&self) -> usize {
        self.k
    }

    /// Total number of edges
    pub fn n_edges(&self) -> usize {
        self.indices.len()
    }

    /// Ordered neighbor indices of node `i`
    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.indices[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Distances from node `i` to its neighbors
    pub fn distances(&self, i: usize) -> &[F] {
        &self.distances[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Edge offsets: edges of node `i` are in `offsets()[i]..offsets()[i + 1]`
    pub(crate) fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Iterate over edges as (target node, neighbor node, distance)
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, F)> + '_ {
        (0..self.len()).flat_map(move |i| {
            self.neighbors(i)
                .iter()
                .zip(self.distances(i))
                .map(move |(&j, &d)| (i, j, d))
        })
    }

    /// Check graph invariants:
    /// * every neighbor index is strictly lower than its node index (acyclicity),
    /// * at most `k` neighbors per node,
    /// * distances are finite and sorted in non decreasing order,
    /// * every node out of the root set has at least one neighbor.
    pub fn validate(&self) -> Result<()> {
        for i in 0..self.len() {
            let nbrs = self.neighbors(i);
            let dists = self.distances(i);
            if nbrs.len() > self.k {
                return Err(NnglsError::DataError {
                    index: i,
                    message: format!("{} neighbors exceed k={}", nbrs.len(), self.k),
                });
            }
            if nbrs.is_empty() && i >= Self::N_ROOTS {
                return Err(NnglsError::DataError {
                    index: i,
                    message: "missing neighbors".to_string(),
                });
            }
            if let Some(&j) = nbrs.iter().find(|&&j| j >= i) {
                return Err(NnglsError::DataError {
                    index: i,
                    message: format!("neighbor {j} breaks ordering (cycle)"),
                });
            }
            if dists.iter().any(|d| !d.is_finite())
                || dists.windows(2).any(|w| w[1] < w[0])
            {
                return Err(NnglsError::DataError {
                    index: i,
                    message: "neighbor distances are not sorted".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Neighbor sets of prediction points drawn from training points only
#[derive(Clone, Debug, PartialEq)]
pub struct QueryNeighbors<F: Float> {
    k: usize,
    offsets: Vec<usize>,
    indices: Vec<usize>,
    distances: Vec<F>,
}

impl<F: Float> QueryNeighbors<F> {
    /// For each row of `queries`, the `k` nearest rows of `reference` (training coordinates)
    pub fn build(
        reference: &ArrayBase<impl Data<Elem = F>, Ix2>,
        queries: &ArrayBase<impl Data<Elem = F>, Ix2>,
        k: usize,
        search: NeighborSearch,
    ) -> Result<Self> {
        check_inputs(reference, k)?;
        check_inputs(queries, k)?;
        if reference.ncols() != queries.ncols() {
            return Err(NnglsError::InvalidConfigError(format!(
                "query coordinates dimension ({}) should match reference dimension ({})",
                queries.ncols(),
                reference.ncols()
            )));
        }
        let n_ref = reference.nrows();
        let dim = reference.ncols();
        let qflat: Vec<F> = queries.iter().cloned().collect();
        let sets: Vec<Vec<(usize, F)>> = match search {
            NeighborSearch::KdTree => {
                let tree = KdTree::new(reference);
                (0..queries.nrows())
                    .into_par_iter()
                    .map(|i| tree.nearest(&qflat[i * dim..(i + 1) * dim], k, n_ref))
                    .collect()
            }
            NeighborSearch::BruteForce => {
                let rflat: Vec<F> = reference.iter().cloned().collect();
                (0..queries.nrows())
                    .into_par_iter()
                    .map(|i| {
                        brute_force_nearest(&rflat, dim, &qflat[i * dim..(i + 1) * dim], k, n_ref)
                    })
                    .collect()
            }
        };
        let graph = NeighborGraph::from_sets(k, sets);
        Ok(QueryNeighbors {
            k,
            offsets: graph.offsets,
            indices: graph.indices,
            distances: graph.distances,
        })
    }

    /// Number of query points
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Whether there is no query point
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of neighbors per query
    pub fn max_neighbors(&self) -> usize {
        self.k
    }

    /// Training neighbor indices of query `i`
    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.indices[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Distances from query `i` to its training neighbors
    pub fn distances(&self, i: usize) -> &[F] {
        &self.distances[self.offsets[i]..self.offsets[i + 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;

    fn random_coords(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        Array2::random_using((n, 2), Uniform::new(0., 10.), &mut rng)
    }

    #[test]
    fn test_graph_shape_and_ordering() {
        let coords = random_coords(300, 42);
        for k in [1, 5, 20] {
            let graph = NeighborGraph::build(&coords, k).unwrap();
            assert_eq!(graph.len(), 300);
            assert_eq!(graph.max_neighbors(), k);
            for i in 0..graph.len() {
                let nbrs = graph.neighbors(i);
                assert_eq!(nbrs.len(), i.min(k));
                assert!(nbrs.iter().all(|&j| j < i));
                assert!(graph.distances(i).windows(2).all(|w| w[0] <= w[1]));
            }
            graph.validate().unwrap();
        }
    }

    #[test]
    fn test_graph_is_deterministic_and_search_independent() {
        let coords = random_coords(400, 7);
        let g1 = NeighborGraph::build(&coords, 10).unwrap();
        let g2 = NeighborGraph::build(&coords, 10).unwrap();
        let g3 = NeighborGraph::build_with(&coords, 10, NeighborSearch::BruteForce).unwrap();
        assert_eq!(g1, g2);
        assert_eq!(g1, g3);
        let bits1: Vec<u64> = g1.edges().map(|(_, _, d)| d.to_bits()).collect();
        let bits2: Vec<u64> = g2.edges().map(|(_, _, d)| d.to_bits()).collect();
        assert_eq!(bits1, bits2);
    }

    #[test]
    fn test_graph_neighbors_are_nearest_prior_points() {
        let coords = random_coords(100, 3);
        let k = 4;
        let graph = NeighborGraph::build(&coords, k).unwrap();
        let i = 80;
        let mut all: Vec<(f64, usize)> = (0..i)
            .map(|j| {
                let d = crate::covariance_models::euclidean(&coords.row(i), &coords.row(j));
                (d, j)
            })
            .collect();
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let expected: Vec<usize> = all.iter().take(k).map(|(_, j)| *j).collect();
        assert_eq!(graph.neighbors(i), expected.as_slice());
    }

    #[test]
    fn test_graph_ties_on_grid() {
        let mut coords = Array2::zeros((25, 2));
        for i in 0..5 {
            for j in 0..5 {
                coords[[i * 5 + j, 0]] = i as f64;
                coords[[i * 5 + j, 1]] = j as f64;
            }
        }
        let g = NeighborGraph::build(&coords, 6).unwrap();
        let gb = NeighborGraph::build_with(&coords, 6, NeighborSearch::BruteForce).unwrap();
        assert_eq!(g, gb);
        // node 12 = (2, 2): distance 1 neighbors among prior ones are 7 (1,2) and 11 (2,1)
        assert_eq!(&g.neighbors(12)[..2], &[7, 11]);
    }

    #[test]
    fn test_invalid_inputs() {
        let coords = array![[0., 0.], [1., 1.]];
        assert!(matches!(
            NeighborGraph::build(&coords, 0),
            Err(NnglsError::InvalidConfigError(_))
        ));
        let coords = array![[0., 0.], [f64::NAN, 1.]];
        assert!(matches!(
            NeighborGraph::build(&coords, 2),
            Err(NnglsError::DataError { index: 1, .. })
        ));
    }

    #[test]
    fn test_from_lists_validation() {
        let coords = array![[0., 0.], [1., 0.], [3., 0.]];
        let g = NeighborGraph::from_lists(&coords, 2, &[vec![], vec![0], vec![1, 0]]).unwrap();
        assert_eq!(g.distances(2), &[2., 3.]);
        assert_eq!(g.n_edges(), 3);

        // cycle
        assert!(NeighborGraph::from_lists(&coords, 2, &[vec![], vec![2], vec![1]]).is_err());
        // missing neighbors out of the root set
        assert!(matches!(
            NeighborGraph::from_lists(&coords, 2, &[vec![], vec![], vec![1]]),
            Err(NnglsError::DataError { index: 1, .. })
        ));
        // unsorted distances
        assert!(NeighborGraph::from_lists(&coords, 2, &[vec![], vec![0], vec![0, 1]]).is_err());
        // too many neighbors
        assert!(NeighborGraph::from_lists(&coords, 1, &[vec![], vec![0], vec![1, 0]]).is_err());
    }

    #[test]
    fn test_query_neighbors_use_reference_only() {
        let reference = random_coords(200, 11);
        let queries = random_coords(50, 12);
        let q = QueryNeighbors::build(&reference, &queries, 8, NeighborSearch::KdTree).unwrap();
        let qb =
            QueryNeighbors::build(&reference, &queries, 8, NeighborSearch::BruteForce).unwrap();
        assert_eq!(q, qb);
        assert_eq!(q.len(), 50);
        for i in 0..q.len() {
            assert_eq!(q.neighbors(i).len(), 8);
            assert!(q.neighbors(i).iter().all(|&j| j < 200));
        }
        // a query located on a reference point gets it first at distance zero
        let q = QueryNeighbors::build(
            &reference,
            &reference.slice(ndarray::s![5..6, ..]),
            3,
            NeighborSearch::KdTree,
        )
        .unwrap();
        assert_eq!(q.neighbors(0)[0], 5);
        assert_eq!(q.distances(0)[0], 0.);
    }
}
