//! Regression trees for the boosted ensemble.
//!
//! Feature columns are bucketed once per fit into quantile bins. Every node then chooses its
//! split from per-bin gradient histograms instead of re-sorting its rows, and the threshold
//! it stores is the upper edge of the last bin sent left, which is always an observed value.
//! Trees are stored flat: node 0 is the root and split nodes refer to their children by
//! index.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Default number of bins per feature.
pub const MAX_BINS: usize = 256;

/// One node of a flattened tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Internal node: rows with `x[feature] <= threshold` go left.
    Split {
        /// Feature column.
        feature: usize,
        /// Split point.
        threshold: f32,
        /// Left child index.
        left: usize,
        /// Right child index.
        right: usize,
    },
    /// Terminal node carrying one Newton step.
    Leaf(f32),
}

/// Fitted regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Leaf value reached by `row`.
    #[must_use]
    pub fn value(&self, row: ArrayView1<'_, f32>) -> f32 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf(value) => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true for a built tree.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Length of the longest root-to-leaf path, counted in splits.
    #[must_use]
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf(_) => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Feature matrix bucketed into per-column quantile bins.
///
/// A row sits in bin `b` of a feature exactly when its value is above the edge of bin
/// `b - 1` and at most the edge of bin `b`.
#[derive(Debug, Clone)]
pub struct BinnedFeatures {
    edges: Vec<Vec<f32>>,
    bins: Array2<u16>,
}

impl BinnedFeatures {
    /// Buckets every column of `x` into at most `max_bins` bins.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn new(x: ArrayView2<'_, f32>, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, usize::from(u16::MAX));
        let mut bins = Array2::<u16>::zeros(x.dim());
        let edges = x
            .axis_iter(Axis(1))
            .zip(bins.axis_iter_mut(Axis(1)))
            .map(|(column, mut out)| {
                let edges = bin_edges(column, max_bins);
                for (value, bin) in column.iter().zip(out.iter_mut()) {
                    let idx = edges.partition_point(|&edge| edge < *value);
                    *bin = idx.min(edges.len().saturating_sub(1)) as u16;
                }
                edges
            })
            .collect();
        Self { edges, bins }
    }

    /// Upper edges of the bins of `feature`.
    #[must_use]
    pub fn edges(&self, feature: usize) -> &[f32] {
        &self.edges[feature]
    }

    /// Bin of `row` in `feature`.
    #[must_use]
    pub fn bin(&self, row: usize, feature: usize) -> usize {
        usize::from(self.bins[[row, feature]])
    }
}

fn bin_edges(column: ArrayView1<'_, f32>, max_bins: usize) -> Vec<f32> {
    let mut values = column.to_vec();
    values.sort_by(f32::total_cmp);
    values.dedup();
    if values.len() <= max_bins {
        return values;
    }
    (1..=max_bins)
        .map(|b| values[b * values.len() / max_bins - 1])
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct GradientStats {
    gradient: f64,
    hessian: f64,
    count: usize,
}

impl GradientStats {
    fn merge(&mut self, other: &Self) {
        self.gradient += other.gradient;
        self.hessian += other.hessian;
        self.count += other.count;
    }

    fn without(&self, part: &Self) -> Self {
        Self {
            gradient: self.gradient - part.gradient,
            hessian: self.hessian - part.hessian,
            count: self.count - part.count,
        }
    }
}

/// Second-order statistics of the multiclass log-loss for one class.
#[derive(Debug)]
pub struct Newton<'a> {
    /// First derivatives per row.
    pub gradients: &'a [f64],
    /// Second derivatives per row.
    pub hessians: &'a [f64],
    /// L2 penalty on leaf weights.
    pub lambda: f64,
    /// Minimum hessian mass per child.
    pub min_child_weight: f64,
}

impl Newton<'_> {
    fn add(&self, stats: &mut GradientStats, sample: usize) {
        stats.gradient += self.gradients[sample];
        stats.hessian += self.hessians[sample];
        stats.count += 1;
    }

    fn score(&self, stats: &GradientStats) -> f64 {
        stats.gradient * stats.gradient / (stats.hessian + self.lambda)
    }

    fn admissible(&self, stats: &GradientStats) -> bool {
        stats.count > 0 && stats.hessian >= self.min_child_weight
    }

    #[allow(clippy::cast_possible_truncation)]
    fn leaf(&self, stats: &GradientStats) -> f32 {
        (-stats.gradient / (stats.hessian + self.lambda)) as f32
    }
}

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy)]
pub struct GrowthLimits {
    /// Maximum number of splits on any path.
    pub max_depth: usize,
    /// Nodes with fewer rows become leaves.
    pub min_samples_split: usize,
}

/// Grows a tree over `samples`, considering only the columns listed in `features`.
#[must_use]
pub fn grow(
    binned: &BinnedFeatures,
    criterion: &Newton<'_>,
    samples: Vec<usize>,
    features: &[usize],
    limits: GrowthLimits,
) -> Tree {
    let mut builder = Builder {
        binned,
        criterion,
        features,
        limits,
        nodes: Vec::new(),
    };
    builder.grow(samples, 0);
    Tree {
        nodes: builder.nodes,
    }
}

struct Builder<'b, 'c, 'g, 'f> {
    binned: &'b BinnedFeatures,
    criterion: &'c Newton<'g>,
    features: &'f [usize],
    limits: GrowthLimits,
    nodes: Vec<Node>,
}

struct Candidate {
    gain: f64,
    feature: usize,
    bin: usize,
    threshold: f32,
}

impl Builder<'_, '_, '_, '_> {
    fn grow(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let idx = self.nodes.len();
        let mut stats = GradientStats::default();
        for &sample in &samples {
            self.criterion.add(&mut stats, sample);
        }
        self.nodes.push(Node::Leaf(self.criterion.leaf(&stats)));

        if depth >= self.limits.max_depth || samples.len() < self.limits.min_samples_split.max(2) {
            return idx;
        }
        let Some(best) = self.best_split(&samples, &stats) else {
            return idx;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&row| self.binned.bin(row, best.feature) <= best.bin);
        let left_idx = self.grow(left, depth + 1);
        let right_idx = self.grow(right, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: left_idx,
            right: right_idx,
        };
        idx
    }

    fn best_split(&self, samples: &[usize], parent: &GradientStats) -> Option<Candidate> {
        let parent_score = self.criterion.score(parent);
        let mut best: Option<Candidate> = None;
        for &feature in self.features {
            let edges = self.binned.edges(feature);
            if edges.len() < 2 {
                continue;
            }
            let mut histogram = vec![GradientStats::default(); edges.len()];
            for &sample in samples {
                self.criterion
                    .add(&mut histogram[self.binned.bin(sample, feature)], sample);
            }
            let mut left = GradientStats::default();
            for (bin, stats) in histogram[..edges.len() - 1].iter().enumerate() {
                if stats.count == 0 {
                    continue;
                }
                left.merge(stats);
                let right = parent.without(&left);
                if !self.criterion.admissible(&left) || !self.criterion.admissible(&right) {
                    continue;
                }
                let gain =
                    self.criterion.score(&left) + self.criterion.score(&right) - parent_score;
                if gain > 1e-9 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(Candidate {
                        gain,
                        feature,
                        bin,
                        threshold: edges[bin],
                    });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn limits(max_depth: usize) -> GrowthLimits {
        GrowthLimits {
            max_depth,
            min_samples_split: 2,
        }
    }

    fn unit_hessians(n: usize) -> Vec<f64> {
        vec![1.0; n]
    }

    #[test]
    fn newton_leaves_step_against_the_gradient() {
        let x = array![[0.0_f32], [0.0], [1.0], [1.0]];
        let gradients = [-1.0, -1.0, 1.0, 1.0];
        let hessians = unit_hessians(4);
        let criterion = Newton {
            gradients: &gradients,
            hessians: &hessians,
            lambda: 0.0,
            min_child_weight: 1.0,
        };
        let binned = BinnedFeatures::new(x.view(), MAX_BINS);
        let tree = grow(&binned, &criterion, (0..4).collect(), &[0], limits(3));
        assert_eq!(tree.depth(), 1);
        assert!((tree.value(array![0.0_f32].view()) - 1.0).abs() < 1e-6);
        assert!((tree.value(array![1.0_f32].view()) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn split_ignores_columns_outside_the_subsample() {
        let x = array![[0.0_f32, 5.0], [0.0, 5.0], [1.0, 9.0], [1.0, 9.0]];
        let gradients = [-1.0, -1.0, 1.0, 1.0];
        let hessians = unit_hessians(4);
        let criterion = Newton {
            gradients: &gradients,
            hessians: &hessians,
            lambda: 0.0,
            min_child_weight: 1.0,
        };
        let binned = BinnedFeatures::new(x.view(), MAX_BINS);
        let tree = grow(&binned, &criterion, (0..4).collect(), &[1], limits(2));
        assert!(matches!(tree.nodes[0], Node::Split { feature: 1, threshold, .. } if threshold == 5.0));
    }

    #[test]
    fn min_child_weight_blocks_thin_splits() {
        let x = array![[0.0_f32], [1.0]];
        let gradients = [-1.0, 1.0];
        let hessians = [0.25, 0.25];
        let criterion = Newton {
            gradients: &gradients,
            hessians: &hessians,
            lambda: 1.0,
            min_child_weight: 1.0,
        };
        let binned = BinnedFeatures::new(x.view(), MAX_BINS);
        let tree = grow(&binned, &criterion, vec![0, 1], &[0], limits(3));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn adjacent_floats_still_split_into_two_children() {
        let low = 1.0_f32;
        let high = f32::from_bits(low.to_bits() + 1);
        let x = array![[low], [low], [high], [high]];
        let gradients = [-1.0, -1.0, 1.0, 1.0];
        let hessians = unit_hessians(4);
        let criterion = Newton {
            gradients: &gradients,
            hessians: &hessians,
            lambda: 0.0,
            min_child_weight: 1.0,
        };
        let binned = BinnedFeatures::new(x.view(), MAX_BINS);
        let tree = grow(&binned, &criterion, (0..4).collect(), &[0], limits(1));
        let Node::Split { threshold, .. } = tree.nodes[0] else {
            panic!("expected a split");
        };
        assert!(threshold >= low && threshold < high);
        assert!((tree.value(array![low].view()) - 1.0).abs() < 1e-6);
        assert!((tree.value(array![high].view()) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn wide_columns_are_capped_at_the_bin_budget() {
        let x = Array2::from_shape_fn((1000, 1), |(row, _)| row as f32);
        let binned = BinnedFeatures::new(x.view(), 16);
        let edges = binned.edges(0);
        assert_eq!(edges.len(), 16);
        assert_eq!(edges.last().copied(), Some(999.0));
        assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
        for row in [0, 37, 500, 999] {
            let bin = binned.bin(row, 0);
            assert!(x[[row, 0]] <= edges[bin]);
            assert!(bin == 0 || x[[row, 0]] > edges[bin - 1]);
        }
    }

    #[test]
    fn likert_answers_keep_one_bin_per_value() {
        let x = array![[-3.0_f32], [0.0], [3.0], [0.0], [-3.0]];
        let binned = BinnedFeatures::new(x.view(), MAX_BINS);
        assert_eq!(binned.edges(0), &[-3.0, 0.0, 3.0]);
        assert_eq!(binned.bin(3, 0), 1);
    }
}
