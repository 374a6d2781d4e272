//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;

use burn_dtensor::sharding::{DeviceMesh, PartitionSpec};
use ndarray::{ArrayD, Axis, IxDyn, Slice};

/// A mesh of the given shape whose devices are numbered by rank.
pub fn mesh(shape: &[usize]) -> Arc<DeviceMesh<usize>> {
    let devices = (0..shape.iter().product::<usize>()).collect();
    Arc::new(DeviceMesh::from_shape(devices, shape).unwrap())
}

/// A validated spec from `(dim, mesh axes)` pairs.
pub fn spec(
    mesh: &Arc<DeviceMesh<usize>>,
    shape: &[usize],
    partition: &[(usize, &[usize])],
) -> PartitionSpec<usize> {
    PartitionSpec::new(
        mesh.clone(),
        shape,
        partition.iter().map(|(dim, axes)| (*dim, axes.to_vec())),
    )
    .unwrap()
}

/// A tensor holding `0, 1, 2, ...` in row-major order.
pub fn arange(shape: &[usize]) -> ArrayD<i64> {
    let len = shape.iter().product::<usize>() as i64;
    ArrayD::from_shape_vec(IxDyn(shape), (0..len).collect()).unwrap()
}

/// The block of `global` that `rank` holds under `spec`.
pub fn expected_shard(global: &ArrayD<i64>, spec: &PartitionSpec<usize>, rank: usize) -> ArrayD<i64> {
    spec.shard_ranges(rank)
        .unwrap()
        .into_iter()
        .enumerate()
        .fold(global.clone(), |tensor, (dim, range)| {
            tensor.slice_axis(Axis(dim), Slice::from(range)).to_owned()
        })
}
