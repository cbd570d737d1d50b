//! Host instantiation: chunked, sequential.

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2, Axis};

use super::{Kernel, Launch, MissingValue, traverse};
use crate::device::Device;
use crate::error::{Error, ShapeError};
use crate::repr::{Forest, NodeIndex};

pub(crate) struct HostKernel;

impl Kernel for HostKernel {
    const DEVICE: Device = Device::Host;

    fn launch<I: NodeIndex>(forest: &Forest<I>, launch: Launch<'_>) -> Result<(), Error> {
        let Launch {
            input,
            output,
            n_rows,
            n_cols,
            chunk_size,
            missing,
            ..
        } = launch;
        let n_outputs = forest.n_outputs();
        let residency = |buffer| ShapeError::ResidencyMismatch {
            buffer,
            expected: Self::DEVICE.residency(),
            actual: Device::Accelerator.residency(),
        };

        let input = input.as_host_slice().ok_or_else(|| residency("input"))?;
        let output = output.as_host_slice_mut().ok_or_else(|| residency("output"))?;

        let features = ArrayView2::from_shape((n_rows, n_cols), input).map_err(|_| ShapeError::InputLength {
            expected: n_rows * n_cols,
            actual: input.len(),
        })?;
        let output_len = output.len();
        let mut output = ArrayViewMut2::from_shape((n_rows, n_outputs), output).map_err(|_| {
            ShapeError::OutputLength {
                expected: n_rows * n_outputs,
                actual: output_len,
            }
        })?;

        let chunks = features
            .axis_chunks_iter(Axis(0), chunk_size)
            .zip(output.axis_chunks_iter_mut(Axis(0), chunk_size));
        for (index, (features, output)) in chunks.enumerate() {
            tracing::trace!(chunk = index, rows = features.nrows(), "host chunk");
            predict_chunk(forest, features, output, missing);
        }
        Ok(())
    }
}

/// Predict one chunk of rows: trees outer, rows inner.
///
/// Each output element still receives its base score first and then one
/// contribution per tree in tree order.
fn predict_chunk<I: NodeIndex>(
    forest: &Forest<I>,
    features: ArrayView2<'_, f32>,
    mut output: ArrayViewMut2<'_, f32>,
    missing: MissingValue,
) {
    let base_score = ArrayView1::from(forest.base_score());
    for mut row in output.rows_mut() {
        row.assign(&base_score);
    }

    for (tree, group) in forest.trees_with_groups() {
        for (row, mut acc) in features.rows().into_iter().zip(output.rows_mut()) {
            let leaf = traverse(tree, &row, missing);
            forest.accumulate(tree, group, leaf, &mut acc);
        }
    }
}
