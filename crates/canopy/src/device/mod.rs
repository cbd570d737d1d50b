//! Compute targets, device-resident buffers and execution streams.
//!
//! Two targets exist: the [`Host`](Device::Host) and a data-parallel
//! [`Accelerator`](Device::Accelerator). Accelerator support is a compile-time
//! capability (cargo feature `accelerator`, on by default). In builds without
//! it, every accelerator operation fails with the same
//! [`UnsupportedDeviceError`] through [`require_accelerator`].
//!
//! - [`Buffer`]: caller-owned memory with an explicit [`Residency`]
//! - [`Stream`]: ordering context for asynchronous accelerator work

mod buffer;
#[cfg(feature = "accelerator")]
mod memory;
mod stream;

pub use buffer::{Buffer, Element};
#[cfg(feature = "accelerator")]
pub(crate) use memory::DeviceMemory;
pub use stream::Stream;

use serde::{Deserialize, Serialize};

use crate::error::UnsupportedDeviceError;

/// Whether this build carries the accelerator instantiation.
pub const ACCELERATOR_ENABLED: bool = cfg!(feature = "accelerator");

/// Fail with the uniform [`UnsupportedDeviceError`] when the accelerator is
/// compiled out.
#[inline]
pub fn require_accelerator(operation: &'static str) -> Result<(), UnsupportedDeviceError> {
    if ACCELERATOR_ENABLED {
        Ok(())
    } else {
        Err(UnsupportedDeviceError::new(operation))
    }
}

/// Compute target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Host,
    Accelerator,
}

impl Device {
    /// Memory space kernels on this device read and write.
    #[inline]
    pub fn residency(self) -> Residency {
        match self {
            Device::Host => Residency::Host,
            Device::Accelerator => Residency::Accelerator,
        }
    }

    #[inline]
    pub fn is_accelerator(self) -> bool {
        self == Device::Accelerator
    }
}

/// Memory space a [`Buffer`] lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    Host,
    Accelerator,
}

impl Residency {
    /// Device whose kernels operate on this memory.
    #[inline]
    pub fn device(self) -> Device {
        match self {
            Residency::Host => Device::Host,
            Residency::Accelerator => Device::Accelerator,
        }
    }
}
