use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{DeviceMesh, PartitionSpec};
use crate::{DistributedError, Result};

/// Declarative placement of a tensor over a device mesh.
///
/// A layout carries the same partitioning as a [`PartitionSpec`], but its global shape may be
/// left open: it is then bound to the shape of the first tensor the layout is applied to.
/// Once bound, the shape can't be rebound to a different value.
#[derive(Clone, Debug)]
pub struct Layout<T> {
    mesh: Arc<DeviceMesh<T>>,
    dim_partition: BTreeMap<usize, Vec<usize>>,
    entire_shape: Option<Vec<usize>>,
    device: Option<T>,
}

impl<T> Layout<T> {
    /// Creates a layout whose global shape is resolved on first use.
    pub fn new<P>(mesh: Arc<DeviceMesh<T>>, dim_partition: P) -> Self
    where
        P: IntoIterator<Item = (usize, Vec<usize>)>,
    {
        Self {
            mesh,
            dim_partition: dim_partition
                .into_iter()
                .filter(|(_, axes)| !axes.is_empty())
                .collect(),
            entire_shape: None,
            device: None,
        }
    }

    /// A layout that replicates the whole tensor on every device.
    pub fn replicated(mesh: Arc<DeviceMesh<T>>) -> Self {
        Self::new(mesh, [])
    }

    /// Binds the global shape, failing if a different shape is already bound.
    pub fn resolve_shape(&mut self, shape: &[usize]) -> Result<()> {
        match &self.entire_shape {
            Some(resolved) if resolved.as_slice() != shape => {
                Err(DistributedError::ShapeAlreadyResolved {
                    resolved: resolved.clone(),
                    requested: shape.to_vec(),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.entire_shape = Some(shape.to_vec());
                Ok(())
            }
        }
    }

    /// Builder form of [`resolve_shape`](Self::resolve_shape).
    pub fn with_shape(mut self, shape: &[usize]) -> Result<Self> {
        self.resolve_shape(shape)?;
        Ok(self)
    }

    /// The global shape, if already bound.
    pub fn entire_shape(&self) -> Option<&[usize]> {
        self.entire_shape.as_deref()
    }

    /// Sharded dimensions and their mesh axes.
    pub fn dim_partition(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.dim_partition
    }

    /// The mesh this layout places the tensor on.
    pub fn mesh(&self) -> &Arc<DeviceMesh<T>> {
        &self.mesh
    }

    /// The device the local shard was last moved to, if any.
    pub fn device(&self) -> Option<&T> {
        self.device.as_ref()
    }

    pub(crate) fn set_device(&mut self, device: T) {
        self.device = Some(device);
    }

    pub(crate) fn take_device(&mut self) -> Option<T> {
        self.device.take()
    }

    /// Converts into a validated [`PartitionSpec`]. The shape must already be bound.
    pub fn to_partition_spec(&self) -> Result<PartitionSpec<T>> {
        let shape = self
            .entire_shape
            .clone()
            .ok_or(DistributedError::UnresolvedShape)?;

        PartitionSpec::new(
            self.mesh.clone(),
            shape,
            self.dim_partition
                .iter()
                .map(|(&dim, axes)| (dim, axes.clone())),
        )
    }
}

impl<T> From<PartitionSpec<T>> for Layout<T> {
    fn from(spec: PartitionSpec<T>) -> Self {
        Self {
            mesh: spec.mesh().clone(),
            dim_partition: spec.dim_partition().clone(),
            entire_shape: Some(spec.entire_shape().to_vec()),
            device: None,
        }
    }
}
