//! Partition clustering driven by recursive random splits.
//!
//! Leaves produced by the [`LeafPartitioner`] are written into a table of
//! write-once slots sized to the full point range and addressed by each
//! leaf's first index. Once the partitioner returns, the occupied slots are
//! compacted (in slot order) into the output collection.

use crate::error::{Error, Result};
use crate::partition::{LeafPartitioner, RandomSplit};
use crate::point::{Coordinate, PointId, PointRange};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// A set-partition of an index set: every input index appears in exactly one cluster.
pub type ClusterCollection = Vec<Vec<PointId>>;

/// Configuration for [`HcnngClusterer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HcnngConfig {
    /// Leaves stop splitting once they hold at most this many points (default: 1000).
    pub cluster_size: usize,
    /// Seed of the random splits (default: 42).
    pub seed: u64,
}

impl Default for HcnngConfig {
    fn default() -> Self {
        Self {
            cluster_size: 1000,
            seed: 42,
        }
    }
}

impl HcnngConfig {
    /// Create a configuration with a custom target cluster size.
    pub fn with_cluster_size(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            ..Default::default()
        }
    }

    /// Set the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Splits point index sets into groups near a target size.
#[derive(Debug, Clone)]
pub struct HcnngClusterer<P = RandomSplit> {
    config: HcnngConfig,
    partitioner: P,
}

impl HcnngClusterer<RandomSplit> {
    pub fn new(config: HcnngConfig) -> Self {
        let partitioner = RandomSplit::new(config.seed);
        Self {
            config,
            partitioner,
        }
    }
}

impl Default for HcnngClusterer<RandomSplit> {
    fn default() -> Self {
        Self::new(HcnngConfig::default())
    }
}

impl<P: LeafPartitioner> HcnngClusterer<P> {
    /// Use a custom splitting strategy. `config.seed` is not passed to it.
    pub fn with_partitioner(config: HcnngConfig, partitioner: P) -> Self {
        Self {
            config,
            partitioner,
        }
    }

    pub fn config(&self) -> &HcnngConfig {
        &self.config
    }

    /// Partition `indices` into clusters of at most `cluster_size` points.
    ///
    /// Returns an error, and no partial result, if an index is out of range
    /// or the partitioner delivers an empty, out-of-range or colliding leaf.
    pub fn cluster<T: Coordinate>(
        &self,
        points: &PointRange<T>,
        indices: &[PointId],
    ) -> Result<ClusterCollection> {
        if self.config.cluster_size == 0 {
            return Err(Error::InvalidParameter("cluster_size must be > 0".into()));
        }
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        points.check_indices(indices)?;

        let start = Instant::now();
        let slots = SlotTable::new(points.len());
        self.partitioner.partition(
            points,
            indices.to_vec(),
            self.config.cluster_size,
            &|leaf: &[PointId]| slots.fill(leaf),
        )?;
        let clusters = slots.compact();

        tracing::debug!(
            points = indices.len(),
            clusters = clusters.len(),
            cluster_size = self.config.cluster_size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "partition clustering done"
        );

        Ok(clusters)
    }

    /// Partition every point of the range.
    pub fn cluster_all<T: Coordinate>(&self, points: &PointRange<T>) -> Result<ClusterCollection> {
        self.cluster(points, &points.all_ids())
    }
}

/// One write-once slot per point of the full range.
struct SlotTable {
    slots: Vec<OnceLock<Vec<PointId>>>,
}

impl SlotTable {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Store a leaf under its first index.
    fn fill(&self, leaf: &[PointId]) -> Result<()> {
        let len = self.slots.len();
        let Some(&first) = leaf.first() else {
            return Err(Error::EmptyLeaf);
        };
        if let Some(&index) = leaf.iter().find(|&&i| i as usize >= len) {
            return Err(Error::IndexOutOfRange {
                index: index as usize,
                len,
            });
        }

        let slot = first as usize;
        self.slots[slot]
            .set(leaf.to_vec())
            .map_err(|_| Error::DuplicateLeafSlot { slot })
    }

    fn compact(self) -> ClusterCollection {
        self.slots
            .into_par_iter()
            .filter_map(OnceLock::into_inner)
            .collect()
    }
}
