//! Density clustering of requirement embeddings.
//!
//! [`hdbscan`] labels each point with a cluster id or `-1` for noise. It runs
//! the classic pipeline over Euclidean distance:
//!
//! 1. Core distances (`min_samples`, counting the point itself).
//! 2. Minimum spanning tree over mutual reachability distance (dense Prim).
//! 3. Single-linkage hierarchy from the sorted MST edges.
//! 4. Condensed tree: splits smaller than `min_cluster_size` are points
//!    falling out of their parent, not new clusters.
//! 5. Excess-of-mass selection. The root is never selected, so a batch that
//!    is one homogeneous blob comes back as all noise.
//!
//! [`cluster`] adds the outlier policy on top: when noise is above the
//! configured ratio, outliers are reassigned to the cluster of their most
//! similar clustered neighbor if that similarity strictly exceeds the
//! reassignment floor. [`prune_near_duplicates`] runs per cluster before
//! conflict checks.

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::embedding::cosine_similarity;

/// Cap for `1 / distance` when points coincide.
const MAX_LAMBDA: f64 = 1e12;

/// Tunables for [`cluster`].
#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    /// Fraction of noise above which outliers are reassigned.
    pub noise_ratio: f32,
    /// Cosine similarity an outlier must strictly exceed to be reassigned.
    pub reassign_threshold: f32,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 2,
            min_samples: 1,
            noise_ratio: 0.30,
            reassign_threshold: 0.65,
        }
    }
}

/// Labels plus the counters reported for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    pub labels: Vec<i32>,
    pub clusters_found: usize,
    /// Noise count straight out of HDBSCAN, before reassignment.
    pub noise_before: usize,
    pub reassigned: usize,
}

impl ClusterOutcome {
    pub fn noise_points(&self) -> usize {
        self.labels.iter().filter(|&&l| l < 0).count()
    }

    /// Member indices per cluster id, ascending, in original order.
    pub fn members(&self) -> Vec<(i32, Vec<usize>)> {
        let mut ids: Vec<i32> = self.labels.iter().copied().filter(|&l| l >= 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .map(|id| {
                let members = self
                    .labels
                    .iter()
                    .enumerate()
                    .filter(|(_, &l)| l == id)
                    .map(|(i, _)| i)
                    .collect();
                (id, members)
            })
            .collect()
    }
}

/// HDBSCAN followed by the noise-reassignment policy.
pub fn cluster(points: &[Vec<f32>], params: &ClusterParams) -> ClusterOutcome {
    let mut labels = hdbscan(points, params.min_cluster_size, params.min_samples);
    let clusters_found = count_clusters(&labels);
    let noise_before = labels.iter().filter(|&&l| l < 0).count();

    let mut reassigned = 0;
    if !points.is_empty() && clusters_found > 0 {
        let ratio = noise_before as f32 / points.len() as f32;
        if ratio > params.noise_ratio {
            reassigned = reassign_noise(points, &mut labels, params.reassign_threshold);
            tracing::debug!(
                noise_before,
                reassigned,
                kept = noise_before - reassigned,
                "reassigned outliers to nearest clusters"
            );
        }
    }

    ClusterOutcome {
        labels,
        clusters_found,
        noise_before,
        reassigned,
    }
}

fn count_clusters(labels: &[i32]) -> usize {
    let mut ids: Vec<i32> = labels.iter().copied().filter(|&l| l >= 0).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}

/// Move each outlier to the cluster of its most similar clustered point when
/// that similarity is strictly above `threshold`. Targets come from the
/// labels as they were before this call. Returns the number moved.
pub fn reassign_noise(points: &[Vec<f32>], labels: &mut [i32], threshold: f32) -> usize {
    let clustered: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] >= 0).collect();
    let noise: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] < 0).collect();
    if clustered.is_empty() || noise.is_empty() {
        return 0;
    }

    let original = labels.to_vec();
    let mut moved = 0;
    for i in noise {
        let mut best: Option<(usize, f32)> = None;
        for &j in &clustered {
            let sim = cosine_similarity(&points[i], &points[j]);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((j, sim));
            }
        }
        if let Some((j, sim)) = best {
            if sim > threshold {
                labels[i] = original[j];
                moved += 1;
            }
        }
    }
    moved
}

/// Indices (into `members`) that survive near-duplicate pruning: for every
/// pair above `threshold`, the later one is dropped.
pub fn prune_near_duplicates(points: &[Vec<f32>], members: &[usize], threshold: f32) -> Vec<usize> {
    if members.len() <= 1 {
        return members.to_vec();
    }
    let mut keep = vec![true; members.len()];
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            if cosine_similarity(&points[members[i]], &points[members[j]]) > threshold {
                keep[j] = false;
            }
        }
    }
    members
        .iter()
        .zip(keep)
        .filter_map(|(&m, k)| k.then_some(m))
        .collect()
}

// ============ HDBSCAN ============

/// Cluster labels for `points`, `-1` for noise. Cluster ids are dense and
/// start at 0.
pub fn hdbscan(points: &[Vec<f32>], min_cluster_size: usize, min_samples: usize) -> Vec<i32> {
    let n = points.len();
    let min_cluster_size = min_cluster_size.max(2);
    if n < min_cluster_size {
        return vec![-1; n];
    }

    let core = core_distances(points, min_samples);
    let edges = minimum_spanning_tree(points, &core);
    let merges = single_linkage(&edges, n);
    let condensed = condense_tree(&merges, n, min_cluster_size);
    let selected = select_clusters_eom(&condensed, n);
    label_points(&condensed, &selected, n)
}

fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn core_distances(points: &[Vec<f32>], min_samples: usize) -> Vec<f64> {
    let n = points.len();
    if min_samples <= 1 {
        return vec![0.0; n];
    }
    let k = (min_samples - 1).min(n - 1);
    (0..n)
        .map(|i| {
            let mut d: Vec<f64> = (0..n).map(|j| euclidean(&points[i], &points[j])).collect();
            d.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            d[k]
        })
        .collect()
}

/// Prim's algorithm over the complete mutual-reachability graph, edges
/// returned sorted by weight.
fn minimum_spanning_tree(points: &[Vec<f32>], core: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let d = euclidean(&points[current], &points[j])
                .max(core[current])
                .max(core[j]);
            if d < best[j] {
                best[j] = d;
                from[j] = current;
            }
        }
        let mut next = None;
        for j in 0..n {
            if !in_tree[j] && next.map_or(true, |k: usize| best[j] < best[k]) {
                next = Some(j);
            }
        }
        let Some(j) = next else { break };
        edges.push((from[j], j, best[j]));
        in_tree[j] = true;
        current = j;
    }

    edges.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal));
    edges
}

/// One internal node of the single-linkage dendrogram. Node ids below `n` are
/// points; merge `k` creates node `n + k`.
#[derive(Debug, Clone, Copy)]
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

fn single_linkage(edges: &[(usize, usize, f64)], n: usize) -> Vec<Merge> {
    let total = 2 * n - 1;
    let mut parent: Vec<usize> = (0..total).collect();
    let mut size = vec![1usize; total];
    let mut merges = Vec::with_capacity(n - 1);

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for (k, &(a, b, d)) in edges.iter().enumerate() {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        let node = n + k;
        let merged = size[ra] + size[rb];
        merges.push(Merge {
            left: ra,
            right: rb,
            distance: d,
            size: merged,
        });
        parent[ra] = node;
        parent[rb] = node;
        size[node] = merged;
    }
    merges
}

/// Edge of the condensed tree. `child` is a point id (`< n`) or a cluster
/// label (`>= n`, root is `n`).
#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

fn lambda_of(distance: f64) -> f64 {
    if distance > 0.0 {
        (1.0 / distance).min(MAX_LAMBDA)
    } else {
        MAX_LAMBDA
    }
}

fn node_size(merges: &[Merge], n: usize, node: usize) -> usize {
    if node < n {
        1
    } else {
        merges[node - n].size
    }
}

fn subtree(merges: &[Merge], n: usize, root: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        out.push(node);
        if node >= n {
            let m = merges[node - n];
            queue.push_back(m.left);
            queue.push_back(m.right);
        }
    }
    out
}

fn condense_tree(merges: &[Merge], n: usize, min_cluster_size: usize) -> Vec<CondensedEdge> {
    let root = 2 * n - 2;
    let order = subtree(merges, n, root);
    let mut relabel = vec![0usize; 2 * n - 1];
    let mut ignore = vec![false; 2 * n - 1];
    let mut next_label = n + 1;
    relabel[root] = n;
    let mut out = Vec::new();

    for node in order {
        if ignore[node] || node < n {
            continue;
        }
        let m = merges[node - n];
        let lambda = lambda_of(m.distance);
        let parent = relabel[node];
        let left_big = node_size(merges, n, m.left) >= min_cluster_size;
        let right_big = node_size(merges, n, m.right) >= min_cluster_size;

        let fall_out = |side: usize, ignore: &mut Vec<bool>, out: &mut Vec<CondensedEdge>| {
            for sub in subtree(merges, n, side) {
                if sub < n {
                    out.push(CondensedEdge {
                        parent,
                        child: sub,
                        lambda,
                        size: 1,
                    });
                }
                ignore[sub] = true;
            }
        };

        match (left_big, right_big) {
            (true, true) => {
                for side in [m.left, m.right] {
                    relabel[side] = next_label;
                    out.push(CondensedEdge {
                        parent,
                        child: next_label,
                        lambda,
                        size: node_size(merges, n, side),
                    });
                    next_label += 1;
                }
            }
            (false, false) => {
                fall_out(m.left, &mut ignore, &mut out);
                fall_out(m.right, &mut ignore, &mut out);
            }
            (false, true) => {
                relabel[m.right] = parent;
                fall_out(m.left, &mut ignore, &mut out);
            }
            (true, false) => {
                relabel[m.left] = parent;
                fall_out(m.right, &mut ignore, &mut out);
            }
        }
    }
    out
}

/// Excess-of-mass selection over the condensed tree, root excluded.
/// Returns a flag per cluster label, indexed by `label - n`.
fn select_clusters_eom(condensed: &[CondensedEdge], n: usize) -> Vec<bool> {
    let max_label = condensed
        .iter()
        .map(|e| e.parent.max(if e.child >= n { e.child } else { n }))
        .max()
        .unwrap_or(n);
    let count = max_label - n + 1;

    let mut birth = vec![0.0f64; count];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    for e in condensed.iter().filter(|e| e.child >= n) {
        birth[e.child - n] = e.lambda;
        children[e.parent - n].push(e.child - n);
    }

    let mut stability = vec![0.0f64; count];
    for e in condensed {
        let p = e.parent - n;
        stability[p] += (e.lambda - birth[p]) * e.size as f64;
    }

    let mut selected = vec![false; count];
    for c in (1..count).rev() {
        let child_sum: f64 = children[c].iter().map(|&k| stability[k]).sum();
        if child_sum > stability[c] {
            stability[c] = child_sum;
        } else {
            selected[c] = true;
            let mut stack = children[c].clone();
            while let Some(d) = stack.pop() {
                selected[d] = false;
                stack.extend(children[d].iter().copied());
            }
        }
    }
    selected
}

fn label_points(condensed: &[CondensedEdge], selected: &[bool], n: usize) -> Vec<i32> {
    let mut cluster_parent = vec![usize::MAX; selected.len()];
    let mut point_parent = vec![usize::MAX; n];
    for e in condensed {
        if e.child >= n {
            cluster_parent[e.child - n] = e.parent - n;
        } else {
            point_parent[e.child] = e.parent - n;
        }
    }

    let mut dense = vec![-1i32; selected.len()];
    let mut next = 0;
    for (c, &sel) in selected.iter().enumerate() {
        if sel {
            dense[c] = next;
            next += 1;
        }
    }

    point_parent
        .into_iter()
        .map(|mut c| {
            while c != usize::MAX {
                if selected[c] {
                    return dense[c];
                }
                c = cluster_parent[c];
            }
            -1
        })
        .collect()
}
