//! K-means over document vectors, seeded with k-means++.
//!
//! Distances are Euclidean. The loop stops when an iteration leaves every centroid
//! exactly where it was, or after `max_iter` iterations.
//!
//! A cluster that loses all its members is reseeded with the point lying farthest
//! from its own centroid; when there is no such point the old centroid is kept.

use crate::error::ClusterError;
use crate::similarity::squared_euclidean;

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// rows summed by one worker before partial sums are merged
const CHUNK_ROWS: usize = 1024;

/// A cluster id and its mean vector; the persisted routing table is a list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub cluster: usize,
    pub vector: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster id of each input row, in [0, k).
    pub assignments: Vec<usize>,
    pub centroids: Vec<Centroid>,
    pub iterations: usize,
    pub converged: bool,
    /// How many times a cluster came out empty and had to be repaired.
    pub degenerate: usize,
}

/// Index of the centroid nearest to `point`.
pub fn nearest_centroid(point: ArrayView1<f64>, centroids: ArrayView2<f64>) -> usize {
    let distances: Array1<f64> = centroids.outer_iter().map(|c| squared_euclidean(point, c)).collect();
    distances.argmin_skipnan().unwrap_or(0)
}

pub struct KMeans {
    k: usize,
    max_iter: usize,
    rng: StdRng,
}

impl KMeans {

    pub fn new(k: usize, max_iter: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { k, max_iter: max_iter.max(1), rng }
    }

    /// k-means++: the first seed is uniform, every next one is drawn with probability
    /// proportional to its squared distance to the closest seed chosen so far.
    ///
    /// Returns row indices. Rows already chosen have distance 0 and are never drawn twice.
    pub fn seed(&mut self, data: ArrayView2<f64>) -> Vec<usize> {
        let n = data.nrows();
        if n == 0 || self.k == 0 {
            return Vec::new();
        }
        let mut chosen = vec![self.rng.gen_range(0..n)];
        let mut nearest: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|r| squared_euclidean(data.row(r), data.row(chosen[0])))
            .collect();

        while chosen.len() < self.k {
            let total: f64 = nearest.iter().sum();

            let next = if total > 0.0 {
                let target = self.rng.gen::<f64>() * total;
                let mut cumulative = 0.0;
                let mut pick = None;
                for (r, &d) in nearest.iter().enumerate() {
                    if d <= 0.0 { continue }
                    cumulative += d;
                    pick = Some(r);
                    if cumulative >= target { break }
                }
                pick
            } else {
                // fewer distinct points than k, fall back to any unused row
                (0..n).find(|r| !chosen.contains(r))
            };

            let next = match next {
                Some(next) => next,
                None => break,
            };
            chosen.push(next);

            let seed_row = data.row(next);
            nearest.par_iter_mut().enumerate().for_each(|(r, d)| {
                *d = d.min(squared_euclidean(data.row(r), seed_row));
            });
        }
        chosen
    }

    fn assign(data: ArrayView2<f64>, centroids: ArrayView2<f64>) -> Vec<usize> {
        (0..data.nrows()).into_par_iter().map(|r| nearest_centroid(data.row(r), centroids)).collect()
    }

    // per-chunk partial sums computed in parallel, merged in chunk order so the
    // result does not depend on scheduling
    fn sums(data: ArrayView2<f64>, assignments: &[usize], k: usize) -> (Array2<f64>, Vec<usize>) {
        let dim = data.ncols();
        let partials: Vec<(Array2<f64>, Vec<usize>)> = assignments
            .par_chunks(CHUNK_ROWS)
            .enumerate()
            .map(|(c, chunk)| {
                let mut sums = Array2::<f64>::zeros((k, dim));
                let mut counts = vec![0usize; k];
                for (offset, &cluster) in chunk.iter().enumerate() {
                    let mut row = sums.row_mut(cluster);
                    row += &data.row(c * CHUNK_ROWS + offset);
                    counts[cluster] += 1;
                }
                (sums, counts)
            })
            .collect();

        let mut sums = Array2::<f64>::zeros((k, dim));
        let mut counts = vec![0usize; k];
        for (partial, partial_counts) in partials {
            sums += &partial;
            counts.iter_mut().zip(partial_counts).for_each(|(a, b)| *a += b);
        }
        (sums, counts)
    }

    // new centroids as member means; empty clusters are reseeded or kept, see module docs
    fn update(data: ArrayView2<f64>, assignments: &[usize], centroids: &Array2<f64>, degenerate: &mut usize) -> Array2<f64> {
        let k = centroids.nrows();
        let (mut next, counts) = KMeans::sums(data, assignments, k);

        let mut reseeded: Vec<usize> = Vec::new();
        for cluster in 0..k {
            let count = counts[cluster];
            if count > 0 {
                let mut row = next.row_mut(cluster);
                row /= count as f64;
                continue;
            }

            *degenerate += 1;
            let farthest = (0..data.nrows())
                .filter(|r| !reseeded.contains(r))
                .map(|r| (r, squared_euclidean(data.row(r), centroids.row(assignments[r]))))
                .filter(|(_, d)| *d > 0.0)
                .max_by(|(_, a), (_, b)| a.total_cmp(b));

            match farthest {
                Some((r, _)) => {
                    warn!(cluster, point = r, "empty cluster, reseeding with the farthest point");
                    next.row_mut(cluster).assign(&data.row(r));
                    reseeded.push(r);
                }
                None => {
                    warn!(cluster, "empty cluster, keeping its previous centroid");
                    next.row_mut(cluster).assign(&centroids.row(cluster));
                }
            }
        }
        next
    }

    /// Partitions the rows of `data` into `k` clusters.
    pub fn cluster(&mut self, data: ArrayView2<f64>) -> Result<KMeansResult, ClusterError> {
        let n = data.nrows();
        if n == 0 {
            return Err(ClusterError::EmptyInput);
        }
        if self.k == 0 || self.k > n {
            return Err(ClusterError::InvalidClusterCount { k: self.k, n });
        }

        let seeds = self.seed(data);
        let mut centroids: Array2<f64> = data.select(Axis(0), &seeds);
        debug!(k = self.k, ?seeds, "k-means++ seeding done");

        let mut degenerate = 0;
        let mut iterations = 0;
        let mut converged = false;
        let mut assignments = KMeans::assign(data, centroids.view());

        while iterations < self.max_iter {
            iterations += 1;
            let next = KMeans::update(data, &assignments, &centroids, &mut degenerate);
            if next == centroids {
                converged = true;
                break;
            }
            centroids = next;
            assignments = KMeans::assign(data, centroids.view());
            debug!(iteration = iterations, "recomputed centroids");
        }

        if converged {
            info!(k = self.k, points = n, iterations, degenerate, "k-means converged");
        } else {
            warn!(k = self.k, points = n, iterations, "k-means stopped before converging");
        }

        let centroids = centroids
            .outer_iter()
            .enumerate()
            .map(|(cluster, row)| Centroid { cluster, vector: row.to_vec() })
            .collect();

        Ok(KMeansResult { assignments, centroids, iterations, converged, degenerate })
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use ndarray::array;
    use std::collections::HashSet;

    fn points() -> Array2<f64> {
        array![[2., 2.], [3., 2.], [2., 3.], [1., 1.], [9., 9.], [8., 7.], [10., 11.]]
    }

    #[test]
    fn two_obvious_groups() {
        let data = points();
        let result = KMeans::new(2, 100, Some(7)).cluster(data.view()).unwrap();

        assert!(result.converged);
        assert_eq!(result.centroids.len(), 2);
        let low = result.assignments[0];
        assert!(result.assignments[..4].iter().all(|&c| c == low));
        assert!(result.assignments[4..].iter().all(|&c| c != low));

        let mut means: Vec<&Vec<f64>> = result.centroids.iter().map(|c| &c.vector).collect();
        means.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert!((means[0][0] - 2.0).abs() < 1e-9 && (means[0][1] - 2.0).abs() < 1e-9);
        assert!((means[1][0] - 9.0).abs() < 1e-9 && (means[1][1] - 9.0).abs() < 1e-9);
    }

    #[test]
    fn one_cluster_is_the_mean() {
        let data = points();
        let result = KMeans::new(1, 100, Some(1)).cluster(data.view()).unwrap();
        let mean = data.mean_axis(Axis(0)).unwrap();
        assert!(result.assignments.iter().all(|&c| c == 0));
        for (a, b) in result.centroids[0].vector.iter().zip(mean.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn k_equal_to_distinct_points_gives_singletons() {
        let data = points();
        let result = KMeans::new(7, 100, Some(3)).cluster(data.view()).unwrap();
        assert!(result.converged);
        let clusters: HashSet<usize> = result.assignments.iter().copied().collect();
        assert_eq!(clusters.len(), 7);
        for (r, &c) in result.assignments.iter().enumerate() {
            assert_eq!(result.centroids[c].vector, data.row(r).to_vec());
        }
    }

    #[test]
    fn seeding_never_repeats_a_point() {
        let data = points();
        for seed in 0..20 {
            let seeds = KMeans::new(7, 10, Some(seed)).seed(data.view());
            let unique: HashSet<usize> = seeds.iter().copied().collect();
            assert_eq!(unique.len(), 7);
        }
    }

    #[test]
    fn duplicates_fill_seeds_when_distinct_points_run_out() {
        let data = array![[1., 1.], [1., 1.], [5., 5.]];
        let result = KMeans::new(3, 50, Some(5)).cluster(data.view()).unwrap();
        assert_eq!(result.centroids.len(), 3);
        assert!(result.assignments.iter().all(|&c| c < 3));
    }

    #[test]
    fn empty_cluster_is_repaired() {
        let data = array![[0., 0.], [0., 1.], [10., 10.]];
        let centroids = array![[0., 0.5], [100., 100.], [10., 10.]];
        let assignments = KMeans::assign(data.view(), centroids.view());
        assert_eq!(assignments, vec![0, 0, 2]);

        let mut degenerate = 0;
        let next = KMeans::update(data.view(), &assignments, &centroids, &mut degenerate);
        assert_eq!(degenerate, 1);
        assert_eq!(next.row(0), array![0., 0.5]);
        // rows 0 and 1 are equally far from their centroid, either may be taken
        assert!(next.row(1) == data.row(0) || next.row(1) == data.row(1));
        assert!(next.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn empty_cluster_without_spread_keeps_its_centroid() {
        let data = array![[1., 1.], [1., 1.]];
        let centroids = array![[1., 1.], [4., 4.]];
        let mut degenerate = 0;
        let next = KMeans::update(data.view(), &[0, 0], &centroids, &mut degenerate);
        assert_eq!(degenerate, 1);
        assert_eq!(next, centroids);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(KMeans::new(1, 10, None).cluster(empty.view()), Err(ClusterError::EmptyInput)));
        let data = points();
        assert!(matches!(KMeans::new(0, 10, None).cluster(data.view()), Err(ClusterError::InvalidClusterCount { .. })));
        assert!(matches!(KMeans::new(8, 10, None).cluster(data.view()), Err(ClusterError::InvalidClusterCount { .. })));
    }

    #[test]
    fn parallel_sums_match_a_serial_mean() {
        let n = 3 * CHUNK_ROWS + 17;
        let data = Array2::from_shape_fn((n, 3), |(r, c)| ((r * 31 + c * 7) % 97) as f64 / 7.0);
        let assignments: Vec<usize> = (0..n).map(|r| r % 4).collect();
        let (sums, counts) = KMeans::sums(data.view(), &assignments, 4);
        for cluster in 0..4 {
            let rows: Vec<usize> = (0..n).filter(|r| r % 4 == cluster).collect();
            assert_eq!(counts[cluster], rows.len());
            let serial = data.select(Axis(0), &rows).sum_axis(Axis(0));
            for (a, b) in sums.row(cluster).iter().zip(serial.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }
}
