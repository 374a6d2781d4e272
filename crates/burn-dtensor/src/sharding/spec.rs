use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use super::DeviceMesh;
use crate::{DistributedError, Result};

/// Specifies how a single tensor dimension is distributed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DimDistribution {
    /// Dimension is sharded across the given mesh axes, the first being the most significant.
    Sharded(Vec<usize>),
    /// Dimension is replicated (not sharded).
    Replicated,
}

/// Describes how a tensor is distributed across the devices of a mesh.
///
/// Each logical dimension maps to an ordered list of mesh axes it is split across. A mesh axis
/// claimed by no dimension is an axis of replication. With `dim -> [a, b]` the dimension is cut
/// into `n_a * n_b` equal blocks, and the device at coordinates `(c_a, c_b)` on those axes holds
/// block `c_a * n_b + c_b`.
///
/// A spec built through [`PartitionSpec::new`] always satisfies its invariants:
/// * every mesh axis is in range and is claimed by at most one dimension;
/// * every dimension index is in range;
/// * every sharded dimension is evenly divisible by the product of its mesh axis extents.
#[derive(Clone, Debug)]
pub struct PartitionSpec<T> {
    /// Description of the device mesh
    mesh: Arc<DeviceMesh<T>>,
    /// Global shape of the tensor
    entire_shape: Vec<usize>,
    /// Mesh axes each sharded dimension is split across
    dim_partition: BTreeMap<usize, Vec<usize>>,
}

impl<T> PartitionSpec<T> {
    /// Creates a validated spec. Dimensions mapped to an empty axis list are treated as
    /// replicated.
    pub fn new<S, P>(mesh: Arc<DeviceMesh<T>>, entire_shape: S, dim_partition: P) -> Result<Self>
    where
        S: Into<Vec<usize>>,
        P: IntoIterator<Item = (usize, Vec<usize>)>,
    {
        let spec = Self {
            mesh,
            entire_shape: entire_shape.into(),
            dim_partition: dim_partition
                .into_iter()
                .filter(|(_, axes)| !axes.is_empty())
                .collect(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// The fully replicated spec: every device holds the whole tensor.
    pub fn replicated<S: Into<Vec<usize>>>(mesh: Arc<DeviceMesh<T>>, entire_shape: S) -> Self {
        Self {
            mesh,
            entire_shape: entire_shape.into(),
            dim_partition: BTreeMap::new(),
        }
    }

    /// Checks the spec invariants.
    pub fn validate(&self) -> Result<()> {
        let mut owners: Vec<Option<usize>> = alloc::vec![None; self.mesh.ndim()];

        for (&dim, axes) in &self.dim_partition {
            let Some(&extent) = self.entire_shape.get(dim) else {
                return Err(DistributedError::InvalidPartition(format!(
                    "dimension {} out of range for shape {:?}",
                    dim, self.entire_shape
                )));
            };

            for &axis in axes {
                match owners.get_mut(axis) {
                    None => {
                        return Err(DistributedError::InvalidPartition(format!(
                            "mesh axis {} out of range for mesh shape {:?}",
                            axis,
                            self.mesh.shape()
                        )));
                    }
                    Some(Some(owner)) => {
                        return Err(DistributedError::InvalidPartition(format!(
                            "mesh axis {} is claimed by both dimension {} and dimension {}",
                            axis, owner, dim
                        )));
                    }
                    Some(slot) => *slot = Some(dim),
                }
            }

            let parts = self.num_shards(dim);
            if extent % parts != 0 {
                return Err(DistributedError::InvalidPartition(format!(
                    "dimension {} of extent {} is not divisible by {} (mesh axes {:?})",
                    dim, extent, parts, axes
                )));
            }
        }

        Ok(())
    }

    /// Shape of the shard held by each device.
    pub fn local_shape(&self) -> Vec<usize> {
        self.entire_shape
            .iter()
            .enumerate()
            .map(|(dim, &extent)| extent / self.num_shards(dim))
            .collect()
    }

    /// Number of blocks a dimension is cut into.
    pub fn num_shards(&self, dim: usize) -> usize {
        self.mesh_axes(dim)
            .iter()
            .map(|&axis| self.mesh.shape()[axis])
            .product()
    }

    /// Mesh axes a dimension is split across, empty when replicated.
    pub fn mesh_axes(&self, dim: usize) -> &[usize] {
        self.dim_partition.get(&dim).map(Vec::as_slice).unwrap_or(&[])
    }

    /// How a dimension is distributed.
    pub fn dim_distribution(&self, dim: usize) -> DimDistribution {
        match self.dim_partition.get(&dim) {
            Some(axes) => DimDistribution::Sharded(axes.clone()),
            None => DimDistribution::Replicated,
        }
    }

    /// The logical dimension a mesh axis shards, if any.
    pub fn mesh_axis_owner(&self, axis: usize) -> Option<usize> {
        self.dim_partition
            .iter()
            .find(|(_, axes)| axes.contains(&axis))
            .map(|(&dim, _)| dim)
    }

    /// Whether no dimension is sharded.
    pub fn is_replicated(&self) -> bool {
        self.dim_partition.is_empty()
    }

    /// The index ranges of the global tensor held by the device at `rank`.
    pub fn shard_ranges(&self, rank: usize) -> Result<Vec<Range<usize>>> {
        let coords = self.mesh.coordinates(rank)?;
        let local_shape = self.local_shape();

        Ok(local_shape
            .iter()
            .enumerate()
            .map(|(dim, &extent)| {
                let block = self
                    .mesh_axes(dim)
                    .iter()
                    .fold(0, |block, &axis| block * self.mesh.shape()[axis] + coords[axis]);
                block * extent..(block + 1) * extent
            })
            .collect())
    }

    /// Global shape of the tensor.
    pub fn entire_shape(&self) -> &[usize] {
        &self.entire_shape
    }

    /// Sharded dimensions and their mesh axes.
    pub fn dim_partition(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.dim_partition
    }

    /// The mesh this spec lays the tensor over.
    pub fn mesh(&self) -> &Arc<DeviceMesh<T>> {
        &self.mesh
    }
}

/// Whether two mesh handles refer to the same mesh.
pub fn same_mesh<T: PartialEq>(lhs: &Arc<DeviceMesh<T>>, rhs: &Arc<DeviceMesh<T>>) -> bool {
    Arc::ptr_eq(lhs, rhs) || lhs == rhs
}

impl<T: PartialEq> PartialEq for PartitionSpec<T> {
    fn eq(&self, other: &Self) -> bool {
        same_mesh(&self.mesh, &other.mesh)
            && self.entire_shape == other.entire_shape
            && self.dim_partition == other.dim_partition
    }
}

/// Renders the sharding sequence, e.g. `[S01, R]`.
impl<T> fmt::Display for PartitionSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for dim in 0..self.entire_shape.len() {
            if dim > 0 {
                f.write_str(", ")?;
            }
            match self.dim_partition.get(&dim) {
                Some(axes) => {
                    f.write_str("S")?;
                    for axis in axes {
                        write!(f, "{axis}")?;
                    }
                }
                None => f.write_str("R")?,
            }
        }
        f.write_str("]")
    }
}
