//! Flat, device-portable forest representation.
//!
//! Trees are stored as contiguous arrays of fixed-size [`Node`] records.
//! Children are located by relative offsets, never by addresses, so a forest
//! can be copied to any memory space unchanged.
//!
//! - [`Node`]: the fixed-size node record
//! - [`TreeLayout`]: depth-first or breadth-first node placement
//! - [`Tree`]: one laid-out tree
//! - [`Forest`] / [`AnyForest`]: the immutable ensemble consumed by inference
//!
//! The integer type used for offsets and feature indices is a type parameter
//! ([`NodeIndex`]); the converter picks the narrowest one that fits.

mod forest;
mod layout;
mod node;
mod tree;

pub use forest::{Accumulation, AnyForest, Forest, LeafKind};
pub(crate) use forest::{ForestBuilder, with_forest};
pub use layout::{LeafOutput, ShapeNode, TreeLayout, TreeShape};
pub use node::Node;
pub use tree::Tree;
pub(crate) use tree::check_structure;

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

// =============================================================================
// Index width
// =============================================================================

/// Integer width used for node offsets and feature indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexWidth {
    U8,
    U16,
    U32,
}

impl IndexWidth {
    /// All widths, narrowest first.
    pub const ALL: [IndexWidth; 3] = [IndexWidth::U8, IndexWidth::U16, IndexWidth::U32];

    /// Largest index representable at this width.
    #[inline]
    pub const fn max_index(self) -> usize {
        match self {
            IndexWidth::U8 => u8::MAX as usize,
            IndexWidth::U16 => u16::MAX as usize,
            IndexWidth::U32 => u32::MAX as usize,
        }
    }

    /// Size of one index in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            IndexWidth::U8 => 1,
            IndexWidth::U16 => 2,
            IndexWidth::U32 => 4,
        }
    }

    /// Narrowest width able to hold `index`, if any.
    pub fn narrowest_for(index: usize) -> Option<IndexWidth> {
        Self::ALL.into_iter().find(|w| index <= w.max_index())
    }
}

/// Unsigned integer usable as a node offset / feature index.
pub trait NodeIndex: Copy + Default + Debug + PartialEq + Send + Sync + 'static {
    /// The width tag of this type.
    const WIDTH: IndexWidth;

    /// Narrow a `usize`, or `None` if it does not fit.
    fn try_from_usize(value: usize) -> Option<Self>;

    /// Widen to `usize`.
    fn index(self) -> usize;
}

macro_rules! impl_node_index {
    ($ty:ty, $width:expr) => {
        impl NodeIndex for $ty {
            const WIDTH: IndexWidth = $width;

            #[inline]
            fn try_from_usize(value: usize) -> Option<Self> {
                <$ty>::try_from(value).ok()
            }

            #[inline(always)]
            fn index(self) -> usize {
                self as usize
            }
        }
    };
}

impl_node_index!(u8, IndexWidth::U8);
impl_node_index!(u16, IndexWidth::U16);
impl_node_index!(u32, IndexWidth::U32);
