//! Lloyd-style k-means seeded by partition clustering.
//!
//! The clusterer runs in three phases:
//! 1. Seeding: [`HcnngClusterer`] splits the input into groups of about
//!    `|indices| / n_clusters` points. The groups are sorted by ascending
//!    size and the first `n_clusters` become the initial centroids.
//! 2. Refinement: centroids are recomputed as the coordinate-wise mean of
//!    their current members and every point moves to a strictly closer
//!    centroid if there is one, until a pass moves nothing.
//! 3. Output: points are grouped by their final centroid into exactly
//!    `n_clusters` buckets (some may be empty).
//!
//! Means are accumulated in `f64` and stored in the point's own coordinate
//! type, so integer point types get integer centroids.

use crate::error::{Error, Result};
use crate::hcnng::{ClusterCollection, HcnngClusterer, HcnngConfig};
use crate::point::{Coordinate, Metric, PointId, PointRange};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Configuration for [`KMeansClusterer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansConfig {
    /// Number of output buckets (default: 1000).
    pub n_clusters: usize,
    /// Upper bound on refinement passes (default: 100).
    pub max_iterations: usize,
    /// Seed of the partition clustering used for seeding (default: 42).
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 1000,
            max_iterations: 100,
            seed: 42,
        }
    }
}

impl KMeansConfig {
    /// Create a configuration with a custom number of clusters.
    pub fn with_n_clusters(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            ..Default::default()
        }
    }

    /// Set the maximum number of refinement passes.
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the seeding seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Diagnostics of one [`KMeansClusterer::cluster_with_report`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KMeansReport {
    /// Number of groups the seeding phase produced.
    pub seed_clusters: usize,
    /// Refinement passes run.
    pub iterations: usize,
    /// Whether the last pass moved no point.
    pub converged: bool,
    /// Total point-to-centroid distance after seeding and after every
    /// accepted pass. Non-increasing.
    pub cost_history: Vec<f64>,
}

/// Refines partition-clustering seeds into `n_clusters` k-means buckets.
#[derive(Debug, Clone, Default)]
pub struct KMeansClusterer {
    config: KMeansConfig,
}

impl KMeansClusterer {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    /// Cluster `indices` into exactly `n_clusters` buckets of original indices.
    pub fn cluster<T: Coordinate>(
        &self,
        points: &PointRange<T>,
        indices: &[PointId],
    ) -> Result<ClusterCollection> {
        self.cluster_with_report(points, indices)
            .map(|(buckets, _)| buckets)
    }

    /// Like [`cluster`](Self::cluster), also returning convergence diagnostics.
    pub fn cluster_with_report<T: Coordinate>(
        &self,
        points: &PointRange<T>,
        indices: &[PointId],
    ) -> Result<(ClusterCollection, KMeansReport)> {
        let k = self.config.n_clusters;
        if k == 0 {
            return Err(Error::InvalidParameter("n_clusters must be > 0".into()));
        }
        if indices.is_empty() {
            return Ok((vec![Vec::new(); k], KMeansReport::default()));
        }

        let start = Instant::now();
        let metric = points.metric();
        let mut report = KMeansReport::default();

        // Phase 1: seeding.
        let cluster_size = (indices.len() / k).max(1);
        let seeding = HcnngClusterer::new(
            HcnngConfig::with_cluster_size(cluster_size).seed(self.config.seed),
        );
        let mut seeds = seeding.cluster(points, indices)?;
        seeds.sort_by_key(Vec::len);
        report.seed_clusters = seeds.len();

        let mut centroids = Centroids::<T>::new(k, points.dimension(), points.aligned_dimension());
        let used = seeds.len().min(k);
        centroids.recompute(points, &seeds[..used]);

        if seeds.len() > k {
            tracing::warn!(
                produced = seeds.len(),
                n_clusters = k,
                dropped = seeds.len() - k,
                "seeding produced more groups than n_clusters; largest groups are not used as seeds"
            );
        } else if seeds.len() < k {
            let missing = k - used;
            tracing::warn!(
                produced = seeds.len(),
                n_clusters = k,
                "seeding produced fewer groups than n_clusters; seeding {missing} centroids from sampled points"
            );
            for j in 0..missing {
                let id = indices[j * indices.len() / missing];
                centroids.set_row(used + j, points.row(id as usize));
            }
        }
        drop(seeds);

        let mut assignments: Vec<usize> = indices
            .par_iter()
            .map(|&i| centroids.nearest(metric, points.row(i as usize)).0)
            .collect();
        self.refine(points, indices, &mut centroids, &mut assignments, &mut report);

        // Phase 3: output.
        let buckets = group_by_assignment(indices, &assignments, k);

        tracing::info!(
            points = indices.len(),
            n_clusters = k,
            seed_clusters = report.seed_clusters,
            iterations = report.iterations,
            converged = report.converged,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "k-means clustering done"
        );

        Ok((buckets, report))
    }

    /// Phase 2: Lloyd passes over `assignments` until nothing moves, a pass
    /// fails to lower the cost, or `max_iterations` is reached. A pass that
    /// does not lower the cost is undone.
    fn refine<T: Coordinate>(
        &self,
        points: &PointRange<T>,
        indices: &[PointId],
        centroids: &mut Centroids<T>,
        assignments: &mut Vec<usize>,
        report: &mut KMeansReport,
    ) {
        let metric = points.metric();
        let k = centroids.len();
        let mut cost = total_cost(centroids, metric, points, indices, assignments);
        report.cost_history.push(cost);

        // Each `par_*` call returns only once every worker is done, which
        // separates the update and reassignment steps.
        while report.iterations < self.config.max_iterations {
            let members = group_by_assignment(indices, assignments, k);
            centroids.recompute(points, &members);

            let previous = assignments.clone();
            let outcomes: Vec<(bool, f32)> = assignments
                .par_iter_mut()
                .zip(indices.par_iter())
                .map(|(current, &i)| {
                    let row = points.row(i as usize);
                    let mut best = *current;
                    let mut best_dist = metric.distance(row, centroids.row(best));
                    for c in 0..k {
                        let dist = metric.distance(row, centroids.row(c));
                        if dist < best_dist {
                            best = c;
                            best_dist = dist;
                        }
                    }
                    let moved = best != *current;
                    *current = best;
                    (moved, best_dist)
                })
                .collect();
            report.iterations += 1;

            let changed = outcomes.iter().filter(|(moved, _)| *moved).count();
            let new_cost: f64 = outcomes.iter().map(|&(_, d)| d as f64).sum();
            tracing::debug!(
                iteration = report.iterations,
                changed,
                cost = new_cost,
                "k-means pass"
            );

            if changed == 0 {
                report.converged = true;
                break;
            }
            if new_cost >= cost {
                // Quantized centroids or the MIPS metric can make a pass
                // worse; keep the last improving assignment.
                tracing::warn!(
                    iteration = report.iterations,
                    previous_cost = cost,
                    cost = new_cost,
                    "k-means stalled without converging"
                );
                *assignments = previous;
                break;
            }

            cost = new_cost;
            report.cost_history.push(cost);
        }

        if !report.converged && report.iterations == self.config.max_iterations {
            tracing::warn!(
                max_iterations = self.config.max_iterations,
                "k-means stopped at the iteration limit"
            );
        }
    }
}

/// Centroid coordinates, one aligned row per cluster.
struct Centroids<T> {
    data: Vec<T>,
    dim: usize,
    stride: usize,
}

impl<T: Coordinate> Centroids<T> {
    fn new(n: usize, dim: usize, stride: usize) -> Self {
        Self {
            data: vec![T::default(); n * stride],
            dim,
            stride,
        }
    }

    fn len(&self) -> usize {
        self.data.len() / self.stride
    }

    #[inline]
    fn row(&self, c: usize) -> &[T] {
        let start = c * self.stride;
        &self.data[start..start + self.dim]
    }

    fn set_row(&mut self, c: usize, coordinates: &[T]) {
        let start = c * self.stride;
        self.data[start..start + self.dim].copy_from_slice(coordinates);
    }

    /// Nearest centroid by linear scan; ties keep the lower id.
    fn nearest(&self, metric: Metric, point: &[T]) -> (usize, f32) {
        let clusters = self.len();
        let mut best = 0;
        let mut best_dist = metric.distance(point, self.row(0));
        for c in 1..clusters {
            let dist = metric.distance(point, self.row(c));
            if dist < best_dist {
                best = c;
                best_dist = dist;
            }
        }
        (best, best_dist)
    }

    /// Overwrite centroid `c` with the mean of `members[c]`, for every
    /// `c < members.len()`. Centroids without members keep their coordinates.
    fn recompute(&mut self, points: &PointRange<T>, members: &[Vec<PointId>]) {
        let dim = self.dim;
        self.data
            .par_chunks_mut(self.stride)
            .zip(members.par_iter())
            .for_each(|(slot, ids)| {
                if ids.is_empty() {
                    return;
                }
                let mut sum = vec![0.0f64; dim];
                for &id in ids {
                    for (acc, &x) in sum.iter_mut().zip(points.row(id as usize)) {
                        *acc += x.to_f32() as f64;
                    }
                }
                let count = ids.len() as f64;
                for (out, acc) in slot[..dim].iter_mut().zip(sum) {
                    *out = T::from_mean(acc / count);
                }
            });
    }
}

/// Group `indices` by cluster id, keeping input order inside each bucket.
fn group_by_assignment(indices: &[PointId], assignments: &[usize], k: usize) -> ClusterCollection {
    let mut buckets = vec![Vec::new(); k];
    for (&id, &cluster) in indices.iter().zip(assignments) {
        buckets[cluster].push(id);
    }
    buckets
}

fn total_cost<T: Coordinate>(
    centroids: &Centroids<T>,
    metric: Metric,
    points: &PointRange<T>,
    indices: &[PointId],
    assignments: &[usize],
) -> f64 {
    let dists: Vec<f32> = indices
        .par_iter()
        .zip(assignments.par_iter())
        .map(|(&i, &c)| metric.distance(points.row(i as usize), centroids.row(c)))
        .collect();
    dists.iter().map(|&d| d as f64).sum()
}
