//! Static k-d tree for exact k-nearest neighbor search restricted to an index prefix.
//!
//! Nodes are stored in a left-complete binary tree (Eytzinger) layout: children of
//! node `i` are `2i + 1` and `2i + 2`. Each node also records the smallest original
//! index found in its subtree so that a query looking for neighbors among indices
//! `< limit` skips whole subtrees made of later points. This is what makes ordered
//! (Vecchia) neighbor search scale: the tree is built once over all points and
//! node `i` queries it with `limit = i`.
//!
//! Results are exact and ordered by `(distance, index)`, ties being broken by the
//! lowest index.

use linfa::Float;
use ndarray::{ArrayBase, Data, Ix2};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Candidate neighbor in the search heap, ordered by (squared distance, index)
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate<F> {
    pub dist2: F,
    pub index: usize,
}

impl<F: Float> PartialEq for Candidate<F> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<F: Float> Eq for Candidate<F> {}

impl<F: Float> PartialOrd for Candidate<F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<F: Float> Ord for Candidate<F> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .partial_cmp(&other.dist2)
            .unwrap_or(Ordering::Equal)
            .then(self.index.cmp(&other.index))
    }
}

/// Bounded max-heap keeping the `k` best candidates seen so far
#[derive(Debug)]
pub(crate) struct KBest<F: Float> {
    k: usize,
    heap: BinaryHeap<Candidate<F>>,
}

impl<F: Float> KBest<F> {
    pub fn new(k: usize) -> Self {
        KBest {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Worst retained squared distance, infinite while not full
    pub fn worst(&self) -> F {
        if self.is_full() {
            self.heap.peek().map(|c| c.dist2).unwrap_or(F::infinity())
        } else {
            F::infinity()
        }
    }

    pub fn offer(&mut self, cand: Candidate<F>) {
        if self.k == 0 {
            return;
        }
        if !self.is_full() {
            self.heap.push(cand);
        } else if let Some(mut top) = self.heap.peek_mut() {
            if cand < *top {
                *top = cand;
            }
        }
    }

    /// Candidates sorted by increasing (distance, index)
    pub fn into_sorted(self) -> Vec<Candidate<F>> {
        self.heap.into_sorted_vec()
    }
}

/// K-d tree over the rows of a (n, dim) coordinates array
#[derive(Debug, Clone)]
pub struct KdTree<F: Float> {
    /// Original point index stored at each node
    nodes: Vec<usize>,
    /// Smallest original index within each node subtree
    min_index: Vec<usize>,
    /// Node points, permuted to follow the node layout (n * dim)
    points: Vec<F>,
    dim: usize,
}

impl<F: Float> KdTree<F> {
    /// Build the tree from the rows of `coords`
    pub fn new(coords: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Self {
        let n = coords.nrows();
        let dim = coords.ncols();
        let flat: Vec<F> = coords.iter().cloned().collect();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut nodes = vec![0; n];
        let mut points = vec![F::zero(); n * dim];
        if n > 0 && dim > 0 {
            Self::build_recursive(&flat, dim, &mut indices, 0, &mut nodes, &mut points, 0);
        }

        let mut min_index = nodes.clone();
        for i in (0..n).rev() {
            for child in [2 * i + 1, 2 * i + 2] {
                if child < n {
                    min_index[i] = min_index[i].min(min_index[child]);
                }
            }
        }

        KdTree {
            nodes,
            min_index,
            points,
            dim,
        }
    }

    /// Number of indexed points
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dimension of indexed points
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Size of the left subtree of a left-complete tree holding `n` nodes
    fn left_subtree_size(n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        // height of the full part of the tree
        let h = usize::BITS - 1 - n.leading_zeros();
        let full = (1usize << h) - 1;
        let last_level = n - full;
        let half_last = 1usize << (h - 1);
        (full - 1) / 2 + last_level.min(half_last)
    }

    fn build_recursive(
        flat: &[F],
        dim: usize,
        indices: &mut [usize],
        depth: usize,
        nodes: &mut [usize],
        points: &mut [F],
        curr: usize,
    ) {
        if indices.is_empty() {
            return;
        }
        let axis = depth % dim;
        let median = Self::left_subtree_size(indices.len());
        indices.select_nth_unstable_by(median, |&a, &b| {
            flat[a * dim + axis]
                .partial_cmp(&flat[b * dim + axis])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        let idx = indices[median];
        nodes[curr] = idx;
        points[curr * dim..(curr + 1) * dim].copy_from_slice(&flat[idx * dim..(idx + 1) * dim]);

        let (left, right) = indices.split_at_mut(median);
        Self::build_recursive(flat, dim, left, depth + 1, nodes, points, 2 * curr + 1);
        Self::build_recursive(flat, dim, &mut right[1..], depth + 1, nodes, points, 2 * curr + 2);
    }

    /// The `k` nearest points among original indices `< limit`, sorted by increasing
    /// (distance, index). Returned distances are euclidean (not squared).
    pub fn nearest(&self, query: &[F], k: usize, limit: usize) -> Vec<(usize, F)> {
        let mut best = KBest::new(k);
        if k > 0 && !self.nodes.is_empty() {
            self.search(0, 0, query, limit, &mut best);
        }
        best.into_sorted()
            .into_iter()
            .map(|c| (c.index, c.dist2.sqrt()))
            .collect()
    }

    fn search(&self, node: usize, axis: usize, query: &[F], limit: usize, best: &mut KBest<F>) {
        if node >= self.nodes.len() || self.min_index[node] >= limit {
            return;
        }
        let point = &self.points[node * self.dim..(node + 1) * self.dim];
        let index = self.nodes[node];
        if index < limit {
            let dist2 = query
                .iter()
                .zip(point)
                .fold(F::zero(), |acc, (&q, &p)| acc + (q - p) * (q - p));
            best.offer(Candidate { dist2, index });
        }

        let diff = query[axis] - point[axis];
        let next_axis = if axis + 1 == self.dim { 0 } else { axis + 1 };
        let (near, far) = if diff < F::zero() {
            (2 * node + 1, 2 * node + 2)
        } else {
            (2 * node + 2, 2 * node + 1)
        };
        self.search(near, next_axis, query, limit, best);
        // equal plane distance may still hide a tie with a lower index
        if diff * diff <= best.worst() {
            self.search(far, next_axis, query, limit, best);
        }
    }
}

/// Exhaustive scan returning the same result as [KdTree::nearest]
pub(crate) fn brute_force_nearest<F: Float>(
    flat: &[F],
    dim: usize,
    query: &[F],
    k: usize,
    limit: usize,
) -> Vec<(usize, F)> {
    let mut best = KBest::new(k);
    for index in 0..limit {
        let p = &flat[index * dim..(index + 1) * dim];
        let dist2 = query
            .iter()
            .zip(p)
            .fold(F::zero(), |acc, (&q, &v)| acc + (q - v) * (q - v));
        best.offer(Candidate { dist2, index });
    }
    best.into_sorted()
        .into_iter()
        .map(|c| (c.index, c.dist2.sqrt()))
        .collect()
}
