//! Root-to-leaf traversal shared by every kernel.
//!
//! Both instantiations call the same routines here, in the same order, so a
//! row produces bit-identical sums on either device.

use ndarray::ArrayView1;

use crate::repr::{Forest, NodeIndex, Tree};

// =============================================================================
// Feature access
// =============================================================================

/// One row of feature values.
///
/// Columns past the end of the row read as missing.
pub trait FeatureRow {
    fn feature(&self, index: usize) -> f32;
}

impl FeatureRow for [f32] {
    #[inline(always)]
    fn feature(&self, index: usize) -> f32 {
        self.get(index).copied().unwrap_or(f32::NAN)
    }
}

impl FeatureRow for ArrayView1<'_, f32> {
    #[inline(always)]
    fn feature(&self, index: usize) -> f32 {
        self.get(index).copied().unwrap_or(f32::NAN)
    }
}

// =============================================================================
// Missing values
// =============================================================================

/// Which feature values count as missing.
///
/// NaN is always missing. An optional sentinel marks one more value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MissingValue {
    sentinel: Option<f32>,
}

impl MissingValue {
    /// Only NaN is missing.
    pub const NAN: MissingValue = MissingValue { sentinel: None };

    pub fn with_sentinel(sentinel: Option<f32>) -> Self {
        Self { sentinel }
    }

    #[inline]
    pub fn sentinel(self) -> Option<f32> {
        self.sentinel
    }

    #[inline(always)]
    pub fn is_missing(self, value: f32) -> bool {
        value.is_nan() || self.sentinel == Some(value)
    }
}

// =============================================================================
// Traversal
// =============================================================================

/// Walk `tree` for `row` and return the index of the leaf reached.
///
/// Missing values take the node's default direction; otherwise the row goes
/// left iff `value < threshold`.
#[inline]
pub fn traverse<I, R>(tree: &Tree<I>, row: &R, missing: MissingValue) -> usize
where
    I: NodeIndex,
    R: FeatureRow + ?Sized,
{
    let layout = tree.layout();
    let mut index = 0;
    loop {
        let node = tree.node(index);
        if node.is_leaf() {
            return index;
        }
        let value = row.feature(node.feature().index());
        let go_left = if missing.is_missing(value) {
            node.default_left()
        } else {
            value < node.threshold()
        };
        index = layout.child(index, node.distant_offset().index(), go_left);
    }
}

/// Raw prediction of one row: base score plus every tree, in tree order.
#[inline]
pub(crate) fn predict_row_into<I, R>(forest: &Forest<I>, row: &R, missing: MissingValue, out: &mut [f32])
where
    I: NodeIndex,
    R: FeatureRow + ?Sized,
{
    out.copy_from_slice(forest.base_score());
    for (tree, group) in forest.trees_with_groups() {
        let leaf = traverse(tree, row, missing);
        forest.accumulate(tree, group, leaf, out);
    }
}

impl<I: NodeIndex> Forest<I> {
    /// Raw prediction for a single row, treating only NaN as missing.
    ///
    /// ```
    /// use canopy::convert::convert;
    /// use canopy::source::{SourceModel, SourceNode, SourceTree};
    ///
    /// let tree = SourceTree::new(vec![
    ///     SourceNode::split(0, 0.5, true, 1, 2),
    ///     SourceNode::leaf(-1.0),
    ///     SourceNode::leaf(1.0),
    /// ]);
    /// let forest = convert(&SourceModel::regression(1, vec![tree])).unwrap();
    /// let canopy::repr::AnyForest::U8(forest) = forest else { unreachable!() };
    /// assert_eq!(forest.predict_row(&[0.0]), vec![-1.0]);
    /// assert_eq!(forest.predict_row(&[f32::NAN]), vec![-1.0]);
    /// ```
    pub fn predict_row(&self, row: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.n_outputs()];
        predict_row_into(self, row, MissingValue::NAN, &mut out);
        out
    }
}
