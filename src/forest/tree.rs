//! Single isolation tree stored as a node arena

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::defaults::EULER_GAMMA;
use crate::features::FEATURE_COUNT;

/// Standardized training row.
pub type Row = [f64; FEATURE_COUNT];

/// Arena node. Children always sit at higher indices than their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Node {
    Split {
        feature: usize,
        value: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        /// Points that reached this leaf during construction
        size: usize,
    },
}

/// Average path length of an unsuccessful BST search over `n` points.
///
/// `c(n) = 2·H(n−1) − 2(n−1)/n`, with `H(i) ≈ ln(i) + γ` and exact values
/// for the trivial cases.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Randomized binary partition tree. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    /// Build a tree over `rows[indices]`, growing at most `max_depth` levels.
    pub fn build(rows: &[Row], indices: &[usize], max_depth: usize, rng: &mut StdRng) -> Self {
        let mut nodes = Vec::with_capacity(2 * indices.len());
        grow(&mut nodes, rows, indices, 0, max_depth, rng);
        Self { nodes }
    }

    /// Depth at which `x` is isolated, plus the `c(size)` adjustment at the leaf.
    pub fn path_length(&self, x: &Row) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        while let Some(node) = self.nodes.get(idx) {
            match *node {
                Node::Split {
                    feature,
                    value,
                    left,
                    right,
                } => {
                    idx = if x[feature] <= value { left } else { right };
                    depth += 1.0;
                }
                Node::Leaf { size } => return depth + average_path_length(size),
            }
        }
        depth
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }

    /// Structural check for trees read from disk.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                value,
                left,
                right,
            } = *node
            {
                if feature >= FEATURE_COUNT {
                    return Err(format!("node {idx}: feature index {feature} out of range"));
                }
                if !value.is_finite() {
                    return Err(format!("node {idx}: non-finite split value"));
                }
                for child in [left, right] {
                    if child <= idx || child >= self.nodes.len() {
                        return Err(format!("node {idx}: child index {child} out of range"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn grow(
    nodes: &mut Vec<Node>,
    rows: &[Row],
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> usize {
    let id = nodes.len();
    nodes.push(Node::Leaf { size: indices.len() });
    if indices.len() <= 1 || depth >= max_depth {
        return id;
    }

    // (feature, min, max) for every feature with spread inside this node
    let varying: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
        .filter_map(|f| {
            let (lo, hi) = indices
                .iter()
                .map(|&i| rows[i][f])
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if varying.is_empty() {
        return id;
    }

    let (feature, lo, hi) = varying[rng.gen_range(0..varying.len())];
    let value = rng.gen_range(lo..hi);
    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
        indices.iter().partition(|&&i| rows[i][feature] <= value);
    if left_idx.is_empty() || right_idx.is_empty() {
        return id;
    }

    let left = grow(nodes, rows, &left_idx, depth + 1, max_depth, rng);
    let right = grow(nodes, rows, &right_idx, depth + 1, max_depth, rng);
    nodes[id] = Node::Split {
        feature,
        value,
        left,
        right,
    };
    id
}
