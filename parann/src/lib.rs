//! parann: parallel clustering and exact groundtruth for ANN indexes
//!
//! This crate provides the data-parallel building blocks around graph-based
//! approximate nearest neighbor indexes:
//! - Partition clustering by recursive random splits (HCNNG-style)
//! - K-means refinement seeded by that partition clustering
//! - Brute-force k-nearest-neighbor groundtruth, including a streaming
//!   variant that recomputes answers as a prefix of the base is removed
//! - `.ibin` groundtruth files and point range files (`.fbin`, `.u8bin`, `.i8bin`)
//!
//! All heavy loops run on the rayon thread pool.
//!
//! # Example
//!
//! ```rust
//! use parann::{compute_groundtruth, KMeansClusterer, KMeansConfig, Metric, PointRange};
//!
//! let base = PointRange::from_flat(
//!     (0..1000).map(|i| (i as f32).sin()).collect(),
//!     4,
//!     Metric::Euclidean,
//! )
//! .unwrap();
//! let queries = base.get_slice(240);
//!
//! // Exact 10 nearest neighbors of every query
//! let groundtruth = compute_groundtruth(&base, &queries, 10).unwrap();
//! assert_eq!(groundtruth.len(), 10);
//!
//! // Eight k-means buckets over the whole base
//! let buckets = KMeansClusterer::new(KMeansConfig::with_n_clusters(8))
//!     .cluster(&base, &base.all_ids())
//!     .unwrap();
//! assert_eq!(buckets.len(), 8);
//! ```

pub mod error;
pub mod groundtruth;
pub mod hcnng;
pub mod ibin;
pub mod kmeans;
pub mod partition;
pub mod point;

pub use error::{Error, Result};
pub use groundtruth::{
    compute_groundtruth, compute_groundtruth_with_removal, recall_at_k, sort_row, Groundtruth,
    GroundtruthRow, Neighbor,
};
pub use hcnng::{ClusterCollection, HcnngClusterer, HcnngConfig};
pub use ibin::{read_ibin, read_ibin_from, write_ibin, write_ibin_to, write_removal_rounds};
pub use kmeans::{KMeansClusterer, KMeansConfig, KMeansReport};
pub use partition::{LeafPartitioner, RandomSplit};
pub use point::{Coordinate, Metric, Point, PointId, PointRange};
