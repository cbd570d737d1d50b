//! Fixed-size node record.

use super::NodeIndex;

const LEAF: u8 = 0b01;
const DEFAULT_LEFT: u8 = 0b10;

/// One tree node.
///
/// The 32-bit value slot is interpreted by node kind:
///
/// | Kind         | Value slot                          |
/// |--------------|-------------------------------------|
/// | split        | threshold (`f32`)                   |
/// | scalar leaf  | output (`f32`)                      |
/// | vector leaf  | index into the tree's vector table  |
///
/// `distant_offset` is relative to the node's own position and is 0 for
/// leaves. Which child it points at depends on the [`TreeLayout`].
///
/// [`TreeLayout`]: super::TreeLayout
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct Node<I: NodeIndex> {
    value: u32,
    distant_offset: I,
    feature: I,
    flags: u8,
}

impl<I: NodeIndex> Node<I> {
    /// Internal node: go left iff `value < threshold`.
    #[inline]
    pub fn split(feature: I, threshold: f32, distant_offset: I, default_left: bool) -> Self {
        Self {
            value: threshold.to_bits(),
            distant_offset,
            feature,
            flags: if default_left { DEFAULT_LEFT } else { 0 },
        }
    }

    /// Leaf with a scalar output.
    #[inline]
    pub fn scalar_leaf(value: f32) -> Self {
        Self {
            value: value.to_bits(),
            distant_offset: I::default(),
            feature: I::default(),
            flags: LEAF,
        }
    }

    /// Leaf whose outputs live at `index` in the tree's vector table.
    #[inline]
    pub fn vector_leaf(index: u32) -> Self {
        Self {
            value: index,
            distant_offset: I::default(),
            feature: I::default(),
            flags: LEAF,
        }
    }

    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.flags & LEAF != 0
    }

    /// Direction taken when the split feature is missing.
    #[inline(always)]
    pub fn default_left(&self) -> bool {
        self.flags & DEFAULT_LEFT != 0
    }

    #[inline(always)]
    pub fn feature(&self) -> I {
        self.feature
    }

    #[inline(always)]
    pub fn distant_offset(&self) -> I {
        self.distant_offset
    }

    #[inline(always)]
    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.value)
    }

    #[inline(always)]
    pub fn leaf_value(&self) -> f32 {
        f32::from_bits(self.value)
    }

    #[inline(always)]
    pub fn leaf_vector_index(&self) -> usize {
        self.value as usize
    }
}
