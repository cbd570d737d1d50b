//! Immutable tree ensemble.

use std::ops::IndexMut;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StructuralError;

use super::{IndexWidth, NodeIndex, Tree, TreeLayout};

/// Shape of leaf outputs, uniform across a forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafKind {
    /// One value per leaf, routed to the tree's output group.
    Scalar,
    /// `width` values per leaf, one per output.
    Vector { width: usize },
}

/// How leaf outputs combine across trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accumulation {
    /// Add leaf outputs.
    #[default]
    Sum,
    /// Each tree adds one vote to the class its leaf selects.
    Vote,
}

#[derive(Debug)]
struct ForestData<I: NodeIndex> {
    trees: Vec<Tree<I>>,
    tree_groups: Vec<u32>,
    n_features: usize,
    n_outputs: usize,
    leaf_kind: LeafKind,
    accumulation: Accumulation,
    base_score: Vec<f32>,
    layout: TreeLayout,
}

/// A frozen ensemble of laid-out trees.
///
/// Cloning is cheap: the trees are shared behind an [`Arc`], so one forest can
/// serve any number of concurrent inference calls and asynchronous launches.
#[derive(Debug)]
pub struct Forest<I: NodeIndex = u32> {
    data: Arc<ForestData<I>>,
}

impl<I: NodeIndex> Clone for Forest<I> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<I: NodeIndex> Forest<I> {
    #[inline]
    pub fn n_trees(&self) -> usize {
        self.data.trees.len()
    }

    /// Node count of tree `tree`.
    #[inline]
    pub fn n_nodes(&self, tree: usize) -> usize {
        self.data.trees[tree].n_nodes()
    }

    pub fn total_nodes(&self) -> usize {
        self.data.trees.iter().map(Tree::n_nodes).sum()
    }

    /// Number of input columns the forest expects.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.data.n_features
    }

    /// Number of raw outputs per row.
    #[inline]
    pub fn n_outputs(&self) -> usize {
        self.data.n_outputs
    }

    #[inline]
    pub fn leaf_kind(&self) -> LeafKind {
        self.data.leaf_kind
    }

    #[inline]
    pub fn accumulation(&self) -> Accumulation {
        self.data.accumulation
    }

    /// Initial accumulator value per output, in margin space.
    #[inline]
    pub fn base_score(&self) -> &[f32] {
        &self.data.base_score
    }

    #[inline]
    pub fn layout(&self) -> TreeLayout {
        self.data.layout
    }

    #[inline]
    pub fn index_width(&self) -> IndexWidth {
        I::WIDTH
    }

    pub fn max_depth(&self) -> usize {
        self.data.trees.iter().map(Tree::max_depth).max().unwrap_or(0)
    }

    #[inline]
    pub fn tree(&self, idx: usize) -> &Tree<I> {
        &self.data.trees[idx]
    }

    #[inline]
    pub fn tree_groups(&self) -> &[u32] {
        &self.data.tree_groups
    }

    pub fn trees(&self) -> impl Iterator<Item = &Tree<I>> {
        self.data.trees.iter()
    }

    /// Iterate over trees with their output group.
    pub fn trees_with_groups(&self) -> impl Iterator<Item = (&Tree<I>, usize)> {
        self.data
            .trees
            .iter()
            .zip(self.data.tree_groups.iter())
            .map(|(t, &g)| (t, g as usize))
    }

    /// Add the contribution of `leaf` in `tree` to a row accumulator.
    #[inline(always)]
    pub(crate) fn accumulate<A>(&self, tree: &Tree<I>, group: usize, leaf: usize, acc: &mut A)
    where
        A: IndexMut<usize, Output = f32> + ?Sized,
    {
        match (self.data.accumulation, self.data.leaf_kind) {
            (Accumulation::Sum, LeafKind::Scalar) => acc[group] += tree.leaf_value(leaf),
            (Accumulation::Sum, LeafKind::Vector { width }) => {
                for (k, &v) in tree.leaf_vector(leaf, width).iter().enumerate() {
                    acc[k] += v;
                }
            }
            (Accumulation::Vote, LeafKind::Scalar) => acc[tree.leaf_value(leaf) as usize] += 1.0,
            (Accumulation::Vote, LeafKind::Vector { width }) => {
                acc[argmax(tree.leaf_vector(leaf, width))] += 1.0;
            }
        }
    }
}

/// Index of the first maximum; NaN never wins.
#[inline]
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    best
}

// =============================================================================
// ForestBuilder
// =============================================================================

/// Single-use construction phase of a [`Forest`].
#[derive(Debug)]
pub(crate) struct ForestBuilder<I: NodeIndex> {
    data: ForestData<I>,
}

impl<I: NodeIndex> ForestBuilder<I> {
    pub(crate) fn new(
        n_features: usize,
        n_outputs: usize,
        leaf_kind: LeafKind,
        accumulation: Accumulation,
        layout: TreeLayout,
    ) -> Self {
        Self {
            data: ForestData {
                trees: Vec::new(),
                tree_groups: Vec::new(),
                n_features,
                n_outputs,
                leaf_kind,
                accumulation,
                base_score: vec![0.0; n_outputs],
                layout,
            },
        }
    }

    pub(crate) fn base_score(mut self, base_score: Vec<f32>) -> Self {
        self.data.base_score = base_score;
        self
    }

    pub(crate) fn push_tree(&mut self, tree: Tree<I>, group: u32) {
        self.data.trees.push(tree);
        self.data.tree_groups.push(group);
    }

    /// Validate every invariant and freeze the forest.
    pub(crate) fn finish(self) -> Result<Forest<I>, StructuralError> {
        let data = &self.data;
        if data.n_outputs == 0 {
            return Err(StructuralError::NoOutputs);
        }
        if data.base_score.len() != data.n_outputs {
            return Err(StructuralError::BaseScoreLength {
                len: data.base_score.len(),
                n_outputs: data.n_outputs,
            });
        }
        if let LeafKind::Vector { width } = data.leaf_kind {
            if width != data.n_outputs {
                return Err(StructuralError::LeafWidthMismatch {
                    tree: 0,
                    node: 0,
                    width,
                    expected: data.n_outputs,
                });
            }
        }
        for (idx, (tree, &group)) in data.trees.iter().zip(&data.tree_groups).enumerate() {
            if group as usize >= data.n_outputs {
                return Err(StructuralError::GroupOutOfRange {
                    tree: idx,
                    group: group as usize,
                    n_outputs: data.n_outputs,
                });
            }
            if tree.layout() != data.layout {
                return Err(StructuralError::LayoutMismatch { tree: idx });
            }
            tree.validate(idx, data.n_features, data.leaf_kind)?;
            if data.accumulation == Accumulation::Vote && data.leaf_kind == LeafKind::Scalar {
                check_votes(idx, tree, data.n_outputs)?;
            }
        }
        Ok(Forest {
            data: Arc::new(self.data),
        })
    }
}

fn check_votes<I: NodeIndex>(
    tree_idx: usize,
    tree: &Tree<I>,
    n_outputs: usize,
) -> Result<(), StructuralError> {
    for (node, n) in tree.nodes().iter().enumerate() {
        if !n.is_leaf() {
            continue;
        }
        let value = n.leaf_value();
        if !(value >= 0.0 && value.fract() == 0.0 && (value as usize) < n_outputs) {
            return Err(StructuralError::InvalidVote {
                tree: tree_idx,
                node,
                value,
                n_outputs,
            });
        }
    }
    Ok(())
}

// =============================================================================
// AnyForest
// =============================================================================

/// A forest at whichever index width the converter selected.
#[derive(Debug, Clone)]
pub enum AnyForest {
    U8(Forest<u8>),
    U16(Forest<u16>),
    U32(Forest<u32>),
}

/// Evaluate `$body` with `$f` bound to the typed forest inside an [`AnyForest`].
macro_rules! with_forest {
    ($any:expr, $f:ident => $body:expr) => {
        match $any {
            $crate::repr::AnyForest::U8($f) => $body,
            $crate::repr::AnyForest::U16($f) => $body,
            $crate::repr::AnyForest::U32($f) => $body,
        }
    };
}
pub(crate) use with_forest;

impl AnyForest {
    pub fn index_width(&self) -> IndexWidth {
        with_forest!(self, f => f.index_width())
    }

    pub fn n_trees(&self) -> usize {
        with_forest!(self, f => f.n_trees())
    }

    pub fn n_nodes(&self, tree: usize) -> usize {
        with_forest!(self, f => f.n_nodes(tree))
    }

    pub fn total_nodes(&self) -> usize {
        with_forest!(self, f => f.total_nodes())
    }

    pub fn n_features(&self) -> usize {
        with_forest!(self, f => f.n_features())
    }

    pub fn n_outputs(&self) -> usize {
        with_forest!(self, f => f.n_outputs())
    }

    pub fn leaf_kind(&self) -> LeafKind {
        with_forest!(self, f => f.leaf_kind())
    }

    pub fn accumulation(&self) -> Accumulation {
        with_forest!(self, f => f.accumulation())
    }

    pub fn base_score(&self) -> &[f32] {
        with_forest!(self, f => f.base_score())
    }

    pub fn layout(&self) -> TreeLayout {
        with_forest!(self, f => f.layout())
    }

    pub fn max_depth(&self) -> usize {
        with_forest!(self, f => f.max_depth())
    }
}

impl From<Forest<u8>> for AnyForest {
    fn from(f: Forest<u8>) -> Self {
        AnyForest::U8(f)
    }
}

impl From<Forest<u16>> for AnyForest {
    fn from(f: Forest<u16>) -> Self {
        AnyForest::U16(f)
    }
}

impl From<Forest<u32>> for AnyForest {
    fn from(f: Forest<u32>) -> Self {
        AnyForest::U32(f)
    }
}
