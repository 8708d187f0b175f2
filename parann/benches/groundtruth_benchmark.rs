//! Criterion benchmarks for groundtruth and clustering.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use parann::{
    compute_groundtruth, compute_groundtruth_with_removal, HcnngClusterer, HcnngConfig,
    KMeansClusterer, KMeansConfig, Metric, PointRange,
};
use std::hint::black_box;

/// Generate random vectors in `[-1, 1)`.
fn generate_random_vectors(num_vectors: usize, dim: usize, seed: u64) -> Array2<f32> {
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::from_shape_fn((num_vectors, dim), |_| rng.gen::<f32>() * 2.0 - 1.0)
}

fn benchmark_groundtruth(c: &mut Criterion) {
    let dim = 128;
    let num_queries = 100;
    let queries = PointRange::from_array(&generate_random_vectors(num_queries, dim, 123), Metric::Euclidean)
        .unwrap();

    let mut group = c.benchmark_group("groundtruth");
    group.sample_size(10);

    for num_vectors in [1_000, 10_000] {
        let base = PointRange::from_array(&generate_random_vectors(num_vectors, dim, 42), Metric::Euclidean)
            .unwrap();
        group.throughput(Throughput::Elements((num_vectors * num_queries) as u64));

        for k in [10, 100] {
            group.bench_with_input(
                BenchmarkId::new(format!("k{k}"), num_vectors),
                &base,
                |b, base| b.iter(|| compute_groundtruth(black_box(base), &queries, k).unwrap()),
            );
        }
    }

    let base = PointRange::from_array(&generate_random_vectors(2_000, dim, 7), Metric::Euclidean).unwrap();
    group.bench_function("with_removal_2000_interval_500", |b| {
        b.iter(|| compute_groundtruth_with_removal(black_box(&base), &queries, 500, 10).unwrap())
    });

    group.finish();
}

fn benchmark_clustering(c: &mut Criterion) {
    let points = PointRange::from_array(&generate_random_vectors(20_000, 64, 42), Metric::Euclidean)
        .unwrap();
    let indices = points.all_ids();

    let mut group = c.benchmark_group("clustering");
    group.sample_size(10);

    group.bench_function("hcnng_20000x64_size_1000", |b| {
        let clusterer = HcnngClusterer::new(HcnngConfig::default());
        b.iter(|| clusterer.cluster(black_box(&points), &indices).unwrap())
    });

    group.bench_function("kmeans_20000x64_k64", |b| {
        let clusterer = KMeansClusterer::new(KMeansConfig::with_n_clusters(64).max_iterations(10));
        b.iter(|| clusterer.cluster(black_box(&points), &indices).unwrap())
    });

    group.finish();
}

criterion_group!(benches, benchmark_groundtruth, benchmark_clustering);
criterion_main!(benches);
