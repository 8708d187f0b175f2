//! Recursive random partitioning of point index sets.
//!
//! The clusterers drive a [`LeafPartitioner`]: it splits an active index set
//! until the pieces are small enough and hands every terminal piece (a leaf)
//! to a completion callback. Leaves may be delivered concurrently from
//! several worker threads.

use crate::error::Result;
use crate::point::{Coordinate, PointId, PointRange};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Recursive splitting strategy used to seed clusters.
pub trait LeafPartitioner: Sync {
    /// Split `indices` into leaves of at most `cluster_size` points and call
    /// `on_leaf` once per leaf.
    ///
    /// An error returned by `on_leaf` aborts the partitioning and is returned
    /// to the caller.
    fn partition<T, F>(
        &self,
        points: &PointRange<T>,
        indices: Vec<PointId>,
        cluster_size: usize,
        on_leaf: &F,
    ) -> Result<()>
    where
        T: Coordinate,
        F: Fn(&[PointId]) -> Result<()> + Sync;
}

/// HCNNG-style random two-pivot splitting.
///
/// Each step picks two distinct random pivots from the active set and sends
/// every point to the side of the nearer pivot (ties go to the first). Both
/// halves recurse in parallel. Every recursion node seeds its own RNG from
/// its position in the tree, so the leaves do not depend on scheduling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RandomSplit {
    pub seed: u64,
}

impl Default for RandomSplit {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

impl RandomSplit {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn split<T, F>(
        &self,
        points: &PointRange<T>,
        mut indices: Vec<PointId>,
        cluster_size: usize,
        node_seed: u64,
        on_leaf: &F,
    ) -> Result<()>
    where
        T: Coordinate,
        F: Fn(&[PointId]) -> Result<()> + Sync,
    {
        if indices.len() <= cluster_size {
            return on_leaf(&indices);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(node_seed);
        let first = rng.gen_range(0..indices.len());
        let mut second = rng.gen_range(0..indices.len() - 1);
        if second >= first {
            second += 1;
        }

        let pivot_a = points.get(indices[first] as usize);
        let pivot_b = points.get(indices[second] as usize);

        let (mut left, mut right): (Vec<PointId>, Vec<PointId>) =
            indices.par_iter().copied().partition(|&i| {
                let p = points.get(i as usize);
                p.distance(&pivot_a) <= p.distance(&pivot_b)
            });

        // Duplicate points (or MIPS pivots) can put everything on one side.
        if left.is_empty() || right.is_empty() {
            let mid = indices.len() / 2;
            right = indices.split_off(mid);
            left = indices;
        }

        let (l, r) = rayon::join(
            || self.split(points, left, cluster_size, child_seed(node_seed, 1), on_leaf),
            || self.split(points, right, cluster_size, child_seed(node_seed, 2), on_leaf),
        );
        l?;
        r
    }
}

impl LeafPartitioner for RandomSplit {
    fn partition<T, F>(
        &self,
        points: &PointRange<T>,
        indices: Vec<PointId>,
        cluster_size: usize,
        on_leaf: &F,
    ) -> Result<()>
    where
        T: Coordinate,
        F: Fn(&[PointId]) -> Result<()> + Sync,
    {
        self.split(points, indices, cluster_size.max(1), self.seed, on_leaf)
    }
}

/// splitmix64 step over the parent seed and the child side.
fn child_seed(parent: u64, side: u64) -> u64 {
    let mut z = parent
        .wrapping_add(side.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
