//! Conversion from [`SourceModel`] to the canonical [`Forest`] representation.
//!
//! Conversion runs once per loaded model and happens in three steps:
//!
//! 1. **Validation**: every source tree must be a proper binary tree rooted at
//!    node 0 whose splits reference existing features. Violations are reported
//!    as [`StructuralError`]; nothing is repaired.
//! 2. **Normalization**: every split becomes a strict `value < threshold` test,
//!    tree weights and averaging are folded into the leaves, width-1 vector
//!    leaves become scalars and the base score is moved to margin space.
//! 3. **Layout**: the narrowest [`IndexWidth`] is selected
//!    ([`width::select_index_width`]) and each tree is laid out with the
//!    configured [`TreeLayout`].
//!
//! # Example
//!
//! ```
//! use canopy::convert::{convert, ConvertConfig, convert_with};
//! use canopy::repr::{IndexWidth, TreeLayout};
//! use canopy::source::{SourceModel, SourceNode, SourceTree};
//!
//! let tree = SourceTree::new(vec![
//!     SourceNode::split(0, 0.5, true, 1, 2),
//!     SourceNode::leaf(-1.0),
//!     SourceNode::leaf(1.0),
//! ]);
//! let model = SourceModel::regression(1, vec![tree]);
//!
//! let forest = convert(&model).unwrap();
//! assert_eq!(forest.index_width(), IndexWidth::U8);
//!
//! let config = ConvertConfig::builder()
//!     .layout(TreeLayout::BreadthFirst)
//!     .index_width(IndexWidth::U32)
//!     .build();
//! let wide = convert_with(&model, &config).unwrap();
//! assert_eq!(wide.index_width(), IndexWidth::U32);
//! ```

pub mod width;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::StructuralError;
use crate::postprocess::{PostprocessorConfig, Transform};
use crate::repr::{
    Accumulation, AnyForest, Forest, ForestBuilder, IndexWidth, LeafKind, LeafOutput, NodeIndex,
    ShapeNode, Tree, TreeLayout, TreeShape, check_structure,
};
use crate::source::{Aggregation, Comparison, Link, ScoreSpace, SourceModel, SourceNode, SourceTree};

use width::{ForestStats, resolve_index_width};

/// Conversion options.
#[derive(Debug, Clone, Default, PartialEq, Builder, Serialize, Deserialize)]
#[builder(derive(Clone, Debug))]
pub struct ConvertConfig {
    /// Node placement policy. Default: depth-first.
    #[builder(default)]
    #[serde(default)]
    pub layout: TreeLayout,

    /// Force a wider index width than the narrowest that fits.
    #[serde(default)]
    pub index_width: Option<IndexWidth>,
}

/// Convert with default options (depth-first layout, narrowest width).
pub fn convert(model: &SourceModel) -> Result<AnyForest, StructuralError> {
    convert_with(model, &ConvertConfig::default())
}

/// Convert `model` into an immutable forest.
pub fn convert_with(model: &SourceModel, config: &ConvertConfig) -> Result<AnyForest, StructuralError> {
    if model.n_outputs == 0 {
        return Err(StructuralError::NoOutputs);
    }

    let leaf_kind = resolve_leaf_kind(model)?;
    let accumulation = match model.aggregation {
        Aggregation::Vote => Accumulation::Vote,
        Aggregation::Sum | Aggregation::Average => Accumulation::Sum,
    };
    let base_score = margin_base_score(model)?;
    let scales = average_scales(model, leaf_kind);

    let mut stats = ForestStats {
        n_features: model.n_features,
        ..ForestStats::default()
    };
    let mut shapes = Vec::with_capacity(model.trees.len());
    let mut groups = Vec::with_capacity(model.trees.len());

    for (idx, tree) in model.trees.iter().enumerate() {
        let depth = check_source_tree(idx, tree, model)?;
        stats.max_depth = stats.max_depth.max(depth);
        stats.max_node_count = stats.max_node_count.max(tree.nodes.len());

        let group = match leaf_kind {
            LeafKind::Scalar => tree.group,
            LeafKind::Vector { .. } => 0,
        };
        let factor = tree.weight * scales[group as usize];
        shapes.push(normalize_tree(tree, leaf_kind, factor));
        groups.push(group);
    }

    let width = resolve_index_width(&stats, config.index_width)?;
    tracing::debug!(
        n_trees = shapes.len(),
        max_depth = stats.max_depth,
        max_node_count = stats.max_node_count,
        n_features = stats.n_features,
        ?width,
        layout = ?config.layout,
        ?leaf_kind,
        ?accumulation,
        "converted source model"
    );

    let meta = ForestMeta {
        n_features: model.n_features,
        n_outputs: model.n_outputs,
        leaf_kind,
        accumulation,
        layout: config.layout,
    };
    Ok(match width {
        IndexWidth::U8 => build_forest::<u8>(&meta, &shapes, &groups, base_score)?.into(),
        IndexWidth::U16 => build_forest::<u16>(&meta, &shapes, &groups, base_score)?.into(),
        IndexWidth::U32 => build_forest::<u32>(&meta, &shapes, &groups, base_score)?.into(),
    })
}

/// Postprocessing implied by the source model's aggregation and link.
pub fn postprocessor_for(model: &SourceModel) -> PostprocessorConfig {
    let transform = match (model.aggregation, model.link) {
        (Aggregation::Vote, _) => Transform::ClassVotes,
        (_, Link::Logit) if model.n_outputs > 1 => Transform::Softmax,
        (_, Link::Logit) => Transform::Sigmoid,
        (_, Link::Log) => Transform::Exp,
        (_, Link::Identity) => Transform::Identity,
    };
    PostprocessorConfig {
        transform,
        n_outputs: model.n_outputs.max(1),
    }
}

// =============================================================================
// Validation
// =============================================================================

fn check_source_tree(idx: usize, tree: &SourceTree, model: &SourceModel) -> Result<usize, StructuralError> {
    if tree.group as usize >= model.n_outputs {
        return Err(StructuralError::GroupOutOfRange {
            tree: idx,
            group: tree.group as usize,
            n_outputs: model.n_outputs,
        });
    }
    if model.aggregation == Aggregation::Vote && tree.weight != 1.0 {
        return Err(StructuralError::WeightedVote {
            tree: idx,
            weight: tree.weight,
        });
    }

    let depth = check_structure(idx, tree.nodes.len(), |i| tree.nodes[i].children())?;

    for (node, n) in tree.nodes.iter().enumerate() {
        if let SourceNode::Split {
            feature,
            threshold,
            comparison,
            ..
        } = *n
        {
            if feature >= model.n_features {
                return Err(StructuralError::FeatureOutOfRange {
                    tree: idx,
                    node,
                    feature,
                    n_features: model.n_features,
                });
            }
            if threshold.is_nan() {
                return Err(StructuralError::NanThreshold { tree: idx, node });
            }
            // `x <= inf` and `x > inf` have no strict-`<` threshold above +inf.
            if threshold == f32::INFINITY && matches!(comparison, Comparison::Le | Comparison::Gt) {
                return Err(StructuralError::UnboundedThreshold { tree: idx, node });
            }
        }
    }
    Ok(depth)
}

/// Decide the forest's leaf kind from every leaf in the model.
///
/// Width-1 vectors count as scalars. Once any leaf is a wider vector, every
/// leaf must be a vector of exactly `n_outputs` values.
fn resolve_leaf_kind(model: &SourceModel) -> Result<LeafKind, StructuralError> {
    let leaves = || {
        model.trees.iter().enumerate().flat_map(|(t, tree)| {
            tree.nodes.iter().enumerate().filter_map(move |(n, node)| match node {
                SourceNode::Leaf(out) => Some((t, n, out)),
                SourceNode::Split { .. } => None,
            })
        })
    };

    let vector_mode = leaves().any(|(_, _, out)| matches!(out, LeafOutput::Vector(v) if v.len() != 1));
    if !vector_mode {
        return Ok(LeafKind::Scalar);
    }

    for (tree, node, out) in leaves() {
        match out {
            LeafOutput::Scalar(_) => return Err(StructuralError::MixedLeafKinds { tree, node }),
            LeafOutput::Vector(v) if v.len() != model.n_outputs => {
                return Err(StructuralError::LeafWidthMismatch {
                    tree,
                    node,
                    width: v.len(),
                    expected: model.n_outputs,
                });
            }
            LeafOutput::Vector(_) => {}
        }
    }
    Ok(LeafKind::Vector {
        width: model.n_outputs,
    })
}

// =============================================================================
// Normalization
// =============================================================================

/// Smallest `f32` strictly greater than `x`, so `v <= x` iff `v < next_up(x)`.
fn next_up(x: f32) -> f32 {
    if x.is_nan() || x == f32::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f32::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits - 1)
    }
}

/// Rewrite a source tree into strict-`<` canonical form with `factor` folded
/// into every leaf.
fn normalize_tree(tree: &SourceTree, leaf_kind: LeafKind, factor: f32) -> TreeShape {
    let nodes = tree
        .nodes
        .iter()
        .map(|node| match node {
            &SourceNode::Split {
                feature,
                threshold,
                comparison,
                default_left,
                left,
                right,
            } => {
                let (threshold, left, right, default_left) = match comparison {
                    Comparison::Lt => (threshold, left, right, default_left),
                    Comparison::Le => (next_up(threshold), left, right, default_left),
                    Comparison::Gt => (next_up(threshold), right, left, !default_left),
                    Comparison::Ge => (threshold, right, left, !default_left),
                };
                ShapeNode::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                }
            }
            SourceNode::Leaf(out) => ShapeNode::Leaf(scale_leaf(out, leaf_kind, factor)),
        })
        .collect();
    TreeShape { nodes }
}

fn scale_leaf(out: &LeafOutput, leaf_kind: LeafKind, factor: f32) -> LeafOutput {
    match (out, leaf_kind) {
        (LeafOutput::Scalar(v), _) => LeafOutput::Scalar(v * factor),
        (LeafOutput::Vector(v), LeafKind::Scalar) => LeafOutput::Scalar(v[0] * factor),
        (LeafOutput::Vector(v), LeafKind::Vector { .. }) => {
            LeafOutput::Vector(v.iter().map(|x| x * factor).collect())
        }
    }
}

/// Per-group leaf multiplier implementing `Average` aggregation.
fn average_scales(model: &SourceModel, leaf_kind: LeafKind) -> Vec<f32> {
    let mut scales = vec![1.0f32; model.n_outputs];
    if model.aggregation != Aggregation::Average {
        return scales;
    }
    match leaf_kind {
        LeafKind::Vector { .. } => {
            if !model.trees.is_empty() {
                scales[0] = 1.0 / model.trees.len() as f32;
            }
        }
        LeafKind::Scalar => {
            let mut counts = vec![0usize; model.n_outputs];
            for tree in &model.trees {
                if let Some(c) = counts.get_mut(tree.group as usize) {
                    *c += 1;
                }
            }
            for (scale, count) in scales.iter_mut().zip(counts) {
                if count > 0 {
                    *scale = 1.0 / count as f32;
                }
            }
        }
    }
    scales
}

/// Broadcast the base score to every output and map it to margin space.
fn margin_base_score(model: &SourceModel) -> Result<Vec<f32>, StructuralError> {
    let n_outputs = model.n_outputs;
    let scores = match model.base_score.len() {
        0 => return Ok(vec![0.0; n_outputs]),
        1 => vec![model.base_score[0]; n_outputs],
        len if len == n_outputs => model.base_score.clone(),
        len => return Err(StructuralError::BaseScoreLength { len, n_outputs }),
    };
    if model.base_score_space == ScoreSpace::Margin {
        return Ok(scores);
    }
    Ok(scores
        .into_iter()
        .map(|s| output_to_margin(s, model.link, n_outputs))
        .collect())
}

/// Inverse link, clamped away from the singularities.
fn output_to_margin(score: f32, link: Link, n_outputs: usize) -> f32 {
    match link {
        Link::Identity => score,
        // logit(p) = ln(p / (1 - p))
        Link::Logit if n_outputs == 1 => {
            let p = score.clamp(1e-7, 1.0 - 1e-7);
            (p / (1.0 - p)).ln()
        }
        // Softmax is shift-invariant, so ln(p) is an exact inverse up to a constant.
        Link::Logit => score.max(1e-7).ln(),
        Link::Log => score.max(1e-7).ln(),
    }
}

// =============================================================================
// Layout
// =============================================================================

struct ForestMeta {
    n_features: usize,
    n_outputs: usize,
    leaf_kind: LeafKind,
    accumulation: Accumulation,
    layout: TreeLayout,
}

fn build_forest<I: NodeIndex>(
    meta: &ForestMeta,
    shapes: &[TreeShape],
    groups: &[u32],
    base_score: Vec<f32>,
) -> Result<Forest<I>, StructuralError> {
    let mut builder = ForestBuilder::<I>::new(
        meta.n_features,
        meta.n_outputs,
        meta.leaf_kind,
        meta.accumulation,
        meta.layout,
    )
    .base_score(base_score);
    for (idx, (shape, &group)) in shapes.iter().zip(groups).enumerate() {
        let tree = Tree::from_shape(shape, meta.layout).map_err(|e| e.in_tree(idx))?;
        builder.push_tree(tree, group);
    }
    builder.finish()
}
