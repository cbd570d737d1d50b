//! Testing utilities shared by unit and integration tests.
//!
//! - [`source_tree!`](crate::source_tree): compact literal syntax for
//!   [`SourceTree`]s
//! - slice assertions with tolerances or exact bit equality
//!
//! ```
//! use canopy::source_tree;
//!
//! let tree = source_tree! {
//!     0 => num(0, 0.5, L) -> 1, 2,
//!     1 => leaf(-1.0),
//!     2 => leaves([0.25, 0.75]),
//! };
//! assert_eq!(tree.nodes.len(), 3);
//! ```

use approx::AbsDiffEq;

use crate::source::{SourceNode, SourceTree};

// =============================================================================
// Constants
// =============================================================================

/// Default tolerance for floating point comparisons of O(1) predictions.
pub const DEFAULT_TOLERANCE: f32 = 1e-5;

// =============================================================================
// Tree literals
// =============================================================================

/// Build a [`SourceTree`] from numbered node entries.
///
/// Entries may appear in any order but ids must cover `0..n` exactly.
///
/// - `id => num(feature, threshold, L|R) -> left, right`: a `<` split whose
///   missing values go left (`L`) or right (`R`)
/// - `id => leaf(value)`: scalar leaf
/// - `id => leaves([v0, v1, ..])`: vector leaf
#[macro_export]
macro_rules! source_tree {
    (@node num ($feature:expr, $threshold:expr, L), $left:expr, $right:expr) => {
        $crate::source::SourceNode::split($feature, $threshold, true, $left, $right)
    };
    (@node num ($feature:expr, $threshold:expr, R), $left:expr, $right:expr) => {
        $crate::source::SourceNode::split($feature, $threshold, false, $left, $right)
    };
    (@node leaf ($value:expr)) => {
        $crate::source::SourceNode::leaf($value)
    };
    (@node leaves ([$($value:expr),* $(,)?])) => {
        $crate::source::SourceNode::leaf_vector(vec![$($value),*])
    };
    ($($id:literal => $kind:ident $args:tt $(-> $left:expr, $right:expr)?),+ $(,)?) => {
        $crate::testing::tree_from_indexed(vec![
            $(($id, $crate::source_tree!(@node $kind $args $(, $left, $right)?)),)+
        ])
    };
}

/// Order `(id, node)` pairs by id into a tree.
///
/// # Panics
///
/// Panics if the ids are not exactly `0..nodes.len()`.
pub fn tree_from_indexed(mut nodes: Vec<(usize, SourceNode)>) -> SourceTree {
    nodes.sort_by_key(|(id, _)| *id);
    for (expected, (id, _)) in nodes.iter().enumerate() {
        assert_eq!(*id, expected, "node ids must be 0..{}", nodes.len());
    }
    SourceTree::new(nodes.into_iter().map(|(_, node)| node).collect())
}

// =============================================================================
// Slice assertions
// =============================================================================

/// Assert element-wise `|actual - expected| <= tolerance`.
///
/// # Panics
///
/// Panics if lengths differ or any element is out of tolerance.
pub fn assert_slice_approx_eq(actual: &[f32], expected: &[f32], tolerance: f32, context: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{context}: length mismatch - got {}, expected {}",
        actual.len(),
        expected.len()
    );

    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            a.abs_diff_eq(e, tolerance),
            "{context}[{i}]: {a} ≠ {e} (diff={}, tolerance={tolerance})",
            (a - e).abs()
        );
    }
}

/// Assert that two slices hold exactly the same bit patterns.
///
/// Unlike `==`, NaNs compare equal to identical NaNs and `0.0 != -0.0`.
pub fn assert_slice_bits_eq(actual: &[f32], expected: &[f32], context: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{context}: length mismatch - got {}, expected {}",
        actual.len(),
        expected.len()
    );

    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            a.to_bits() == e.to_bits(),
            "{context}[{i}]: {a:?} ({:#010x}) is not bit-identical to {e:?} ({:#010x})",
            a.to_bits(),
            e.to_bits()
        );
    }
}
