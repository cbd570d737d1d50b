//! Accelerator instantiation: data-parallel over rows.
//!
//! Launches hold shared handles to the forest and both buffers, so a queued
//! launch stays valid after the caller's borrows end. Host access to either
//! buffer waits until the launch completes.

use super::{Kernel, Launch};
use crate::device::Device;
use crate::error::Error;
use crate::repr::{Forest, NodeIndex};

pub(crate) struct AcceleratorKernel;

#[cfg(feature = "accelerator")]
impl Kernel for AcceleratorKernel {
    const DEVICE: Device = Device::Accelerator;

    fn launch<I: NodeIndex>(forest: &Forest<I>, launch: Launch<'_>) -> Result<(), Error> {
        use crate::error::ShapeError;

        crate::device::require_accelerator("run inference on the accelerator")?;

        let Launch {
            input,
            output,
            n_cols,
            chunk_size,
            missing,
            stream,
            ..
        } = launch;
        let residency = |buffer| ShapeError::ResidencyMismatch {
            buffer,
            expected: Self::DEVICE.residency(),
            actual: Device::Host.residency(),
        };

        let Some(stream) = stream.filter(|s| s.is_asynchronous()) else {
            tracing::trace!(device = ?Self::DEVICE, "synchronous launch");
            input.device_memory().ok_or_else(|| residency("input"))?;
            output.device_memory().ok_or_else(|| residency("output"))?;
            input.read(|input| {
                output.write(|output| parallel::predict(forest, input, output, n_cols, chunk_size, missing))
            });
            return Ok(());
        };

        let input = input.device_memory().ok_or_else(|| residency("input"))?.lease();
        let output = output.device_memory().ok_or_else(|| residency("output"))?.lease();
        let forest = forest.clone();
        tracing::trace!(device = ?Self::DEVICE, "queued launch");
        stream.submit(move || {
            let input = input.read();
            let mut output = output.write();
            parallel::predict(&forest, &input, &mut output, n_cols, chunk_size, missing);
            Ok(())
        })
    }
}

#[cfg(not(feature = "accelerator"))]
impl Kernel for AcceleratorKernel {
    const DEVICE: Device = Device::Accelerator;

    fn launch<I: NodeIndex>(_forest: &Forest<I>, _launch: Launch<'_>) -> Result<(), Error> {
        const OPERATION: &str = "run inference on the accelerator";
        crate::device::require_accelerator(OPERATION)?;
        Err(crate::error::UnsupportedDeviceError::new(OPERATION).into())
    }
}

#[cfg(feature = "accelerator")]
mod parallel {
    use rayon::prelude::*;

    use crate::infer::{MissingValue, predict_row_into};
    use crate::repr::{Forest, NodeIndex};

    /// Predict every row independently; `chunk_size` bounds the rows per task.
    pub(super) fn predict<I: NodeIndex>(
        forest: &Forest<I>,
        input: &[f32],
        output: &mut [f32],
        n_cols: usize,
        chunk_size: usize,
        missing: MissingValue,
    ) {
        let n_outputs = forest.n_outputs();
        let rows = output.par_chunks_exact_mut(n_outputs).with_min_len(chunk_size);
        if n_cols == 0 {
            rows.for_each(|acc| predict_row_into(forest, &[] as &[f32], missing, acc));
            return;
        }
        input
            .par_chunks_exact(n_cols)
            .with_min_len(chunk_size)
            .zip(rows)
            .for_each(|(row, acc)| predict_row_into(forest, row, missing, acc));
    }
}
