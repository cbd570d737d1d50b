//! Caller-owned buffers with explicit residency.

use std::fmt;
#[cfg(feature = "accelerator")]
use std::sync::Arc;

use ndarray::Array2;

use super::{Device, Residency};
use crate::error::{Error, ShapeError, UnsupportedDeviceError};

#[cfg(feature = "accelerator")]
use super::DeviceMemory;

/// Element type storable in a [`Buffer`].
pub trait Element: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> Element for T {}

enum Storage<T> {
    Host(Vec<T>),
    #[cfg(feature = "accelerator")]
    Accelerator(Arc<DeviceMemory<T>>),
}

/// A flat, typed buffer resident on the host or the accelerator.
///
/// Host buffers expose their contents directly. Accelerator buffers are only
/// reachable through copies ([`Buffer::copy_from`], [`Buffer::to_vec`],
/// [`Buffer::to_device`]); those wait for any kernel already launched against
/// the buffer, so results are never observed half-written.
///
/// ```
/// use canopy::device::{Buffer, Device, Residency};
///
/// let host = Buffer::from_vec(vec![1.0f32, 2.0, 3.0]);
/// assert_eq!(host.residency(), Residency::Host);
/// assert_eq!(host.as_host_slice(), Some(&[1.0, 2.0, 3.0][..]));
///
/// let mut copy = Buffer::<f32>::zeroed(3, Device::Host).unwrap();
/// copy.copy_from(&host).unwrap();
/// assert_eq!(copy.to_vec(), vec![1.0, 2.0, 3.0]);
/// ```
pub struct Buffer<T: Element> {
    storage: Storage<T>,
    len: usize,
}

const ALLOCATE: &str = "allocate accelerator memory";

impl<T: Element> Buffer<T> {
    /// Wrap host data without copying.
    pub fn from_vec(data: Vec<T>) -> Self {
        let len = data.len();
        Self {
            storage: Storage::Host(data),
            len,
        }
    }

    /// Host buffer holding `array` in row-major order.
    pub fn from_array(array: &Array2<T>) -> Self {
        Self::from_vec(array.iter().copied().collect())
    }

    /// Allocate `len` default-initialized elements on `device`.
    pub fn zeroed(len: usize, device: Device) -> Result<Self, UnsupportedDeviceError> {
        match device {
            Device::Host => Ok(Self::from_vec(vec![T::default(); len])),
            Device::Accelerator => Self::on_accelerator(vec![T::default(); len].into_boxed_slice()),
        }
    }

    /// Allocate on `device` and copy `data` into it.
    pub fn from_slice(data: &[T], device: Device) -> Result<Self, UnsupportedDeviceError> {
        match device {
            Device::Host => Ok(Self::from_vec(data.to_vec())),
            Device::Accelerator => Self::on_accelerator(data.into()),
        }
    }

    #[cfg(feature = "accelerator")]
    fn on_accelerator(data: Box<[T]>) -> Result<Self, UnsupportedDeviceError> {
        super::require_accelerator(ALLOCATE)?;
        let len = data.len();
        Ok(Self {
            storage: Storage::Accelerator(Arc::new(DeviceMemory::new(data))),
            len,
        })
    }

    #[cfg(not(feature = "accelerator"))]
    fn on_accelerator(_data: Box<[T]>) -> Result<Self, UnsupportedDeviceError> {
        super::require_accelerator(ALLOCATE)?;
        Err(UnsupportedDeviceError::new(ALLOCATE))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn residency(&self) -> Residency {
        match &self.storage {
            Storage::Host(_) => Residency::Host,
            #[cfg(feature = "accelerator")]
            Storage::Accelerator(_) => Residency::Accelerator,
        }
    }

    /// Device whose kernels operate on this buffer.
    #[inline]
    pub fn device(&self) -> Device {
        self.residency().device()
    }

    /// Contents of a host buffer; `None` for accelerator buffers.
    #[inline]
    pub fn as_host_slice(&self) -> Option<&[T]> {
        match &self.storage {
            Storage::Host(data) => Some(data),
            #[cfg(feature = "accelerator")]
            Storage::Accelerator(_) => None,
        }
    }

    #[inline]
    pub fn as_host_slice_mut(&mut self) -> Option<&mut [T]> {
        match &mut self.storage {
            Storage::Host(data) => Some(data),
            #[cfg(feature = "accelerator")]
            Storage::Accelerator(_) => None,
        }
    }

    /// Copy the contents to a new host vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.read(<[T]>::to_vec)
    }

    /// Copy the contents to a host array of shape `(rows, cols)`.
    pub fn to_array2(&self, rows: usize, cols: usize) -> Result<Array2<T>, ShapeError> {
        let expected = rows * cols;
        if expected != self.len {
            return Err(ShapeError::OutputLength {
                expected,
                actual: self.len,
            });
        }
        Array2::from_shape_vec((rows, cols), self.to_vec()).map_err(|_| ShapeError::OutputLength {
            expected,
            actual: self.len,
        })
    }

    /// Copy into a new buffer on `device`.
    pub fn to_device(&self, device: Device) -> Result<Buffer<T>, UnsupportedDeviceError> {
        self.read(|data| Buffer::from_slice(data, device))
    }

    /// Overwrite this buffer with the contents of `src`, across residencies.
    pub fn copy_from(&mut self, src: &Buffer<T>) -> Result<(), Error> {
        if src.len != self.len {
            return Err(ShapeError::CopyLength {
                src: src.len,
                dst: self.len,
            }
            .into());
        }
        src.read(|data| self.write(|dst| dst.copy_from_slice(data)));
        Ok(())
    }

    /// Run `f` on the buffer's contents, waiting for in-flight kernels first.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        match &self.storage {
            Storage::Host(data) => f(data),
            #[cfg(feature = "accelerator")]
            Storage::Accelerator(memory) => f(&memory.read()),
        }
    }

    pub(crate) fn write<R>(&mut self, f: impl FnOnce(&mut [T]) -> R) -> R {
        match &mut self.storage {
            Storage::Host(data) => f(data),
            #[cfg(feature = "accelerator")]
            Storage::Accelerator(memory) => f(&mut memory.write()),
        }
    }

    /// Shared handle to accelerator storage, for queued kernels.
    #[cfg(feature = "accelerator")]
    pub(crate) fn device_memory(&self) -> Option<&Arc<DeviceMemory<T>>> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Accelerator(memory) => Some(memory),
        }
    }
}

impl<T: Element> From<Vec<T>> for Buffer<T> {
    fn from(data: Vec<T>) -> Self {
        Self::from_vec(data)
    }
}

impl<T: Element> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("residency", &self.residency())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn host_buffer_basics() {
        let mut buf = Buffer::from_vec(vec![1u32, 2, 3]);
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_empty());
        assert_eq!(buf.device(), Device::Host);
        buf.as_host_slice_mut().unwrap()[0] = 9;
        assert_eq!(buf.to_vec(), vec![9, 2, 3]);
    }

    #[test]
    fn array_round_trip_is_row_major() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let buf = Buffer::from_array(&a);
        assert_eq!(buf.as_host_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(buf.to_array2(3, 2).unwrap(), a);
        assert!(buf.to_array2(2, 2).is_err());
    }

    #[test]
    fn copy_requires_equal_lengths() {
        let src = Buffer::from_vec(vec![1.0f32; 4]);
        let mut dst = Buffer::<f32>::zeroed(3, Device::Host).unwrap();
        assert_eq!(
            dst.copy_from(&src).unwrap_err(),
            Error::Shape(ShapeError::CopyLength { src: 4, dst: 3 })
        );
    }

    #[cfg(feature = "accelerator")]
    #[test]
    fn copies_between_residencies() {
        let host = Buffer::from_vec(vec![1.0f32, 2.0, 3.0]);
        let device = host.to_device(Device::Accelerator).unwrap();
        assert_eq!(device.residency(), Residency::Accelerator);
        assert!(device.as_host_slice().is_none());

        let mut other = Buffer::<f32>::zeroed(3, Device::Accelerator).unwrap();
        other.copy_from(&device).unwrap();

        let mut back = Buffer::<f32>::zeroed(3, Device::Host).unwrap();
        back.copy_from(&other).unwrap();
        assert_eq!(back.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[cfg(not(feature = "accelerator"))]
    #[test]
    fn accelerator_allocation_unsupported() {
        let err = Buffer::<f32>::zeroed(3, Device::Accelerator).unwrap_err();
        assert_eq!(err.operation(), "allocate accelerator memory");
        let host = Buffer::from_vec(vec![1.0f32]);
        assert!(host.to_device(Device::Accelerator).is_err());
    }
}
