//! Exact k-nearest-neighbor groundtruth by brute force.
//!
//! Every query scans the whole base range and keeps at most `k` candidates
//! together with the position of the current worst one. A candidate that
//! beats the worst replaces it, after which the list is rescanned to find the
//! new worst. Cost is `O(|base| * k)` per query, which is fine for producing
//! reference answers.
//!
//! Rows come back in scan order, not sorted by score. [`sort_row`] (also
//! applied by the `.ibin` writer) orders them.

use crate::error::{Error, Result};
use crate::point::{Coordinate, PointId, PointRange};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

/// One candidate: a base point and its score against the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: PointId,
    pub score: f32,
}

/// Up to `k` neighbors of one query.
pub type GroundtruthRow = Vec<Neighbor>;

/// One row per query, in query order.
pub type Groundtruth = Vec<GroundtruthRow>;

/// Bounded candidate list with a cached worst entry.
#[derive(Debug)]
struct TopK {
    entries: Vec<Neighbor>,
    k: usize,
    floor: f32,
    worst_score: f32,
    worst_pos: usize,
}

impl TopK {
    /// `floor` must not exceed any real score (see `Metric::worst_possible_score`).
    fn new(k: usize, floor: f32) -> Self {
        Self {
            entries: Vec::with_capacity(k),
            k,
            floor,
            worst_score: floor,
            worst_pos: 0,
        }
    }

    #[inline]
    fn offer(&mut self, id: PointId, score: f32) {
        if self.entries.len() < self.k {
            if score > self.worst_score {
                self.worst_score = score;
                self.worst_pos = self.entries.len();
            }
            self.entries.push(Neighbor { id, score });
        } else if self.k > 0 && score < self.worst_score {
            self.entries[self.worst_pos] = Neighbor { id, score };

            let mut worst_score = self.floor;
            let mut worst_pos = 0;
            for (pos, entry) in self.entries.iter().enumerate() {
                if entry.score > worst_score {
                    worst_score = entry.score;
                    worst_pos = pos;
                }
            }
            self.worst_score = worst_score;
            self.worst_pos = worst_pos;
        }
    }

    fn into_row(self) -> GroundtruthRow {
        self.entries
    }
}

fn check_compatible<T: Coordinate>(base: &PointRange<T>, queries: &PointRange<T>) -> Result<()> {
    if base.dimension() != queries.dimension() {
        return Err(Error::DimensionMismatch {
            expected: base.dimension(),
            got: queries.dimension(),
        });
    }
    if base.metric() != queries.metric() {
        return Err(Error::MetricMismatch {
            base: base.metric(),
            query: queries.metric(),
        });
    }
    Ok(())
}

fn scan<T: Coordinate>(base: &PointRange<T>, queries: &PointRange<T>, k: usize) -> Groundtruth {
    let k = k.min(base.len());
    let floor = base.metric().worst_possible_score();

    (0..queries.len())
        .into_par_iter()
        .map(|q| {
            let query = queries.get(q);
            let mut top = TopK::new(k, floor);
            for (j, point) in base.iter().enumerate() {
                top.offer(j as PointId, query.distance(&point));
            }
            top.into_row()
        })
        .collect()
}

/// Exact `k` nearest base points of every query.
///
/// Rows hold `min(k, base.len())` neighbors in arbitrary order.
pub fn compute_groundtruth<T: Coordinate>(
    base: &PointRange<T>,
    queries: &PointRange<T>,
    k: usize,
) -> Result<Groundtruth> {
    check_compatible(base, queries)?;

    let start = Instant::now();
    let groundtruth = scan(base, queries, k);

    tracing::info!(
        base = base.len(),
        queries = queries.len(),
        k,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "computed groundtruth"
    );

    Ok(groundtruth)
}

/// Groundtruth for progressively shrinking base sets.
///
/// Produces `base.len() / interval` rounds. Round `i` runs the full query set
/// against `base.get_slice(i * interval)`; its ids are relative to that view,
/// so the base id is `id + i * interval`.
pub fn compute_groundtruth_with_removal<T: Coordinate>(
    base: &PointRange<T>,
    queries: &PointRange<T>,
    interval: usize,
    k: usize,
) -> Result<Vec<Groundtruth>> {
    if interval == 0 {
        return Err(Error::InvalidParameter("interval must be > 0".into()));
    }
    check_compatible(base, queries)?;

    let start = Instant::now();
    let rounds = base.len() / interval;
    let answers: Vec<Groundtruth> = (0..rounds)
        .into_par_iter()
        .map(|i| scan(&base.get_slice(i * interval), queries, k))
        .collect();

    tracing::info!(
        base = base.len(),
        queries = queries.len(),
        k,
        interval,
        rounds,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "computed groundtruth with removal"
    );

    Ok(answers)
}

/// Sort a row by ascending score (best first). Equal scores keep their order.
pub fn sort_row(row: &mut [Neighbor]) {
    row.sort_by_key(|n| OrderedFloat(n.score));
}

/// Mean fraction of each query's true top-`k` ids found in the first `k`
/// entries of the matching result row. Queries with an empty groundtruth
/// row are skipped.
pub fn recall_at_k(groundtruth: &[GroundtruthRow], results: &[Vec<PointId>], k: usize) -> f32 {
    let mut total = 0.0f32;
    let mut counted = 0usize;

    for (row, found) in groundtruth.iter().zip(results) {
        let mut truth = row.clone();
        sort_row(&mut truth);
        let truth: HashSet<PointId> = truth.iter().take(k).map(|n| n.id).collect();
        if truth.is_empty() {
            continue;
        }

        let hits = found
            .iter()
            .take(k)
            .filter(|&id| truth.contains(id))
            .count();
        total += hits as f32 / truth.len() as f32;
        counted += 1;
    }

    if counted == 0 {
        0.0
    } else {
        total / counted as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Metric;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn random_points(n: usize, dim: usize, metric: Metric, seed: u64) -> PointRange<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let values = (0..n * dim).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        PointRange::from_flat(values, dim, metric).unwrap()
    }

    /// Ids of the `k` best base points by full sort.
    fn naive_ids(base: &PointRange<f32>, query: &[f32], k: usize) -> Vec<PointId> {
        let mut scored: Vec<(f32, PointId)> = base
            .iter()
            .enumerate()
            .map(|(j, p)| (p.distance_to(query), j as PointId))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        let mut ids: Vec<PointId> = scored.into_iter().take(k).map(|(_, id)| id).collect();
        ids.sort_unstable();
        ids
    }

    fn row_ids(row: &GroundtruthRow) -> Vec<PointId> {
        let mut ids: Vec<PointId> = row.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_topk_tracks_worst() {
        let mut top = TopK::new(3, 0.0);
        for (id, score) in [(0, 5.0), (1, 1.0), (2, 3.0), (3, 4.0), (4, 0.5), (5, 9.0)] {
            top.offer(id, score);
        }
        let mut row = top.into_row();
        sort_row(&mut row);
        let ids: Vec<PointId> = row.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![4, 1, 2]);
    }

    #[test]
    fn test_topk_with_zero_scores() {
        let mut top = TopK::new(2, 0.0);
        for id in 0..4 {
            top.offer(id, 0.0);
        }
        top.offer(9, 1.0);
        assert_eq!(row_ids(&top.into_row()), vec![0, 1]);
    }

    #[test]
    fn test_topk_zero_k() {
        let mut top = TopK::new(0, f32::MIN);
        top.offer(0, -1.0);
        assert!(top.into_row().is_empty());
    }

    #[test]
    fn test_matches_naive_sort_euclidean() {
        let base = random_points(400, 16, Metric::Euclidean, 1);
        let queries = random_points(20, 16, Metric::Euclidean, 2);
        let gt = compute_groundtruth(&base, &queries, 10).unwrap();

        assert_eq!(gt.len(), 20);
        for (q, row) in gt.iter().enumerate() {
            assert_eq!(row.len(), 10);
            assert_eq!(row_ids(row), naive_ids(&base, queries.row(q), 10));
        }
    }

    #[test]
    fn test_matches_naive_sort_mips() {
        let base = random_points(300, 8, Metric::Mips, 3);
        let queries = random_points(10, 8, Metric::Mips, 4);
        let gt = compute_groundtruth(&base, &queries, 5).unwrap();

        for (q, row) in gt.iter().enumerate() {
            assert_eq!(row_ids(row), naive_ids(&base, queries.row(q), 5));
            for n in row {
                let expected = queries.get(q).distance(&base.get(n.id as usize));
                assert_eq!(n.score, expected);
            }
        }
    }

    #[test]
    fn test_k_larger_than_base() {
        let base = random_points(7, 4, Metric::Euclidean, 5);
        let queries = random_points(3, 4, Metric::Euclidean, 6);
        let gt = compute_groundtruth(&base, &queries, 100).unwrap();
        for row in &gt {
            assert_eq!(row_ids(row), (0..7).collect::<Vec<PointId>>());
        }
    }

    #[test]
    fn test_incompatible_ranges() {
        let base = random_points(10, 4, Metric::Euclidean, 1);
        let wrong_dim = random_points(2, 3, Metric::Euclidean, 2);
        let wrong_metric = random_points(2, 4, Metric::Mips, 2);

        assert!(matches!(
            compute_groundtruth(&base, &wrong_dim, 3),
            Err(Error::DimensionMismatch { expected: 4, got: 3 })
        ));
        assert!(matches!(
            compute_groundtruth(&base, &wrong_metric, 3),
            Err(Error::MetricMismatch { .. })
        ));
    }

    #[test]
    fn test_removal_rounds() {
        let base = random_points(30, 4, Metric::Euclidean, 7);
        let queries = random_points(4, 4, Metric::Euclidean, 8);
        let rounds = compute_groundtruth_with_removal(&base, &queries, 1, 5).unwrap();

        assert_eq!(rounds.len(), 30);
        for (i, gt) in rounds.iter().enumerate() {
            let view = base.get_slice(i);
            assert_eq!(view.len(), 30 - i);
            for (q, row) in gt.iter().enumerate() {
                assert_eq!(row.len(), 5.min(30 - i));
                assert_eq!(row_ids(row), naive_ids(&view, queries.row(q), 5));
            }
        }
    }

    #[test]
    fn test_removal_interval() {
        let base = random_points(25, 2, Metric::Euclidean, 9);
        let queries = random_points(2, 2, Metric::Euclidean, 10);
        let rounds = compute_groundtruth_with_removal(&base, &queries, 10, 3).unwrap();
        assert_eq!(rounds.len(), 2);

        assert!(matches!(
            compute_groundtruth_with_removal(&base, &queries, 0, 3),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_recall_at_k() {
        let gt = vec![
            vec![
                Neighbor { id: 3, score: 0.3 },
                Neighbor { id: 1, score: 0.1 },
            ],
            vec![
                Neighbor { id: 5, score: 0.2 },
                Neighbor { id: 6, score: 0.4 },
            ],
        ];
        let results = vec![vec![1, 3], vec![5, 9]];
        assert_eq!(recall_at_k(&gt, &results, 2), 0.75);
        assert_eq!(recall_at_k(&gt, &results, 1), 1.0);
        assert_eq!(recall_at_k(&[], &[], 10), 0.0);
    }
}
