use alloc::vec::Vec;
use core::fmt;
use core::ops::{Add, Div, Mul, Sub};

use ndarray::{ArrayD, ScalarOperand};
use num_traits::NumCast;

use crate::comm::Collective;
use crate::planner::ResidencyPlanner;
use crate::sharding::{DeviceMesh, Layout, PartitionSpec};
use crate::{DType, DistributedError, Element, Result};

/// Represents a tensor that is distributed (sharded or replicated) across multiple devices.
///
/// A `DistributedTensor` contains a local shard of a global tensor, along with the [`Layout`]
/// describing how the full tensor is partitioned across the devices of a mesh. The shape of the
/// local shard always matches the layout: any change of layout reshards the local data in the
/// same step.
///
/// Operations other than layout changes act on the local shard only and return plain arrays;
/// no layout is inferred for their result.
pub struct DistributedTensor<E: Element, T> {
    /// Local shard of the tensor
    local_shard: ArrayD<E>,
    /// How the global tensor is laid out over the mesh
    layout: Layout<T>,
    /// Global shape of the tensor (across all devices)
    global_shape: Vec<usize>,
    /// Element type of the local shard
    dtype: DType,
}

impl<E: Element, T: PartialEq> DistributedTensor<E, T> {
    /// Distributes a tensor that every device holds in full.
    ///
    /// An unbound layout shape is bound to the tensor's shape. The tensor is then resharded from
    /// full replication to the layout, so every device of the mesh must make the same call.
    pub fn new<C: Collective>(
        local_full: ArrayD<E>,
        mut layout: Layout<T>,
        planner: &ResidencyPlanner<C>,
    ) -> Result<Self> {
        let global_shape = local_full.shape().to_vec();
        layout.resolve_shape(&global_shape)?;

        let source = PartitionSpec::replicated(layout.mesh().clone(), global_shape.as_slice());
        let target = layout.to_partition_spec()?;
        let local_shard = planner.reshard(&local_full, &source, &target)?;

        Ok(Self {
            local_shard,
            layout,
            global_shape,
            dtype: E::DTYPE,
        })
    }

    /// Reshards the tensor to a new layout.
    ///
    /// An unbound layout shape is bound to this tensor's global shape. On error, the tensor is
    /// left as it was.
    pub fn layout_convert<C: Collective>(
        &mut self,
        mut layout: Layout<T>,
        planner: &ResidencyPlanner<C>,
    ) -> Result<()> {
        if layout.entire_shape().is_none() {
            layout.resolve_shape(&self.global_shape)?;
        }

        let source = self.partition_spec()?;
        let target = layout.to_partition_spec()?;
        let local_shard = planner.reshard(&self.local_shard, &source, &target)?;

        if layout.device().is_none() {
            if let Some(device) = self.layout.take_device() {
                layout.set_device(device);
            }
        }

        self.local_shard = local_shard;
        self.layout = layout;
        Ok(())
    }

    /// Reassembles the full tensor on every device, leaving this tensor unchanged.
    ///
    /// Meant for debugging and verification: it all-gathers every sharded mesh axis.
    pub fn to_global<C: Collective>(&self, planner: &ResidencyPlanner<C>) -> Result<ArrayD<E>> {
        planner.to_global(&self.local_shard, &self.partition_spec()?)
    }
}

impl<E: Element, T> DistributedTensor<E, T> {
    /// The shard held by this device.
    pub fn to_local(&self) -> &ArrayD<E> {
        &self.local_shard
    }

    /// Consumes the tensor, returning the shard held by this device.
    pub fn into_local(self) -> ArrayD<E> {
        self.local_shard
    }

    /// Global shape of the tensor.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Element type of the shard.
    pub fn element_type(&self) -> DType {
        self.dtype
    }

    /// The current layout.
    pub fn layout(&self) -> &Layout<T> {
        &self.layout
    }

    /// The mesh the tensor is distributed over.
    pub fn device_mesh(&self) -> &DeviceMesh<T> {
        self.layout.mesh()
    }

    /// The partition spec of the current layout.
    pub fn partition_spec(&self) -> Result<PartitionSpec<T>> {
        self.layout.to_partition_spec()
    }

    /// The device the shard was last moved to, if any.
    pub fn device(&self) -> Option<&T> {
        self.layout.device()
    }

    /// Records that the local shard now lives on `device`.
    ///
    /// The partitioning is unchanged.
    // TODO: communication groups are derived from mesh ranks, not devices; revisit once a
    // backend binds groups to a device kind.
    pub fn to_device(&mut self, device: T) -> &mut Self {
        self.layout.set_device(device);
        self
    }

    /// Converts the shard to another element type, keeping the layout.
    pub fn cast<F: Element>(self) -> Result<DistributedTensor<F, T>> {
        let values = self
            .local_shard
            .iter()
            .map(|&value| <F as NumCast>::from(value))
            .collect::<Option<Vec<_>>>()
            .ok_or(DistributedError::CastFailed {
                from: E::DTYPE,
                to: F::DTYPE,
            })?;

        let local_shard = ArrayD::from_shape_vec(self.local_shard.raw_dim(), values).map_err(
            |_| DistributedError::CastFailed {
                from: E::DTYPE,
                to: F::DTYPE,
            },
        )?;

        Ok(DistributedTensor {
            local_shard,
            layout: self.layout,
            global_shape: self.global_shape,
            dtype: F::DTYPE,
        })
    }

    /// Applies `op` to the local shard and returns its raw result.
    pub fn apply<R>(&self, op: impl FnOnce(&ArrayD<E>) -> R) -> R {
        op(&self.local_shard)
    }

    /// Applies `op` to the local shards of two tensors and returns its raw result.
    pub fn apply_with<F: Element, R>(
        &self,
        other: &DistributedTensor<F, T>,
        op: impl FnOnce(&ArrayD<E>, &ArrayD<F>) -> R,
    ) -> R {
        op(&self.local_shard, &other.local_shard)
    }
}

/// Distributes a tensor that every device holds in full, see [`DistributedTensor::new`].
pub fn distribute_tensor<E: Element, T: PartialEq, C: Collective>(
    local_full: ArrayD<E>,
    layout: Layout<T>,
    planner: &ResidencyPlanner<C>,
) -> Result<DistributedTensor<E, T>> {
    DistributedTensor::new(local_full, layout, planner)
}

impl<E: Element, T> fmt::Debug for DistributedTensor<E, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedTensor")
            .field("local_shape", &self.local_shard.shape())
            .field("global_shape", &self.global_shape)
            .field("dtype", &self.dtype)
            .field("dim_partition", self.layout.dim_partition())
            .finish()
    }
}

impl<E: Element, T: Clone> Clone for DistributedTensor<E, T> {
    fn clone(&self) -> Self {
        Self {
            local_shard: self.local_shard.clone(),
            layout: self.layout.clone(),
            global_shape: self.global_shape.clone(),
            dtype: self.dtype,
        }
    }
}

macro_rules! delegate_binary_op {
    ($trait:ident, $method:ident) => {
        impl<'a, E, T> $trait<&'a DistributedTensor<E, T>> for &'a DistributedTensor<E, T>
        where
            E: Element + $trait<Output = E>,
        {
            type Output = ArrayD<E>;

            fn $method(self, rhs: &'a DistributedTensor<E, T>) -> ArrayD<E> {
                $trait::$method(&self.local_shard, &rhs.local_shard)
            }
        }

        impl<'a, E, T> $trait<&'a ArrayD<E>> for &'a DistributedTensor<E, T>
        where
            E: Element + $trait<Output = E>,
        {
            type Output = ArrayD<E>;

            fn $method(self, rhs: &'a ArrayD<E>) -> ArrayD<E> {
                $trait::$method(&self.local_shard, rhs)
            }
        }

        impl<E, T> $trait<E> for &DistributedTensor<E, T>
        where
            E: Element + ScalarOperand + $trait<Output = E>,
        {
            type Output = ArrayD<E>;

            fn $method(self, rhs: E) -> ArrayD<E> {
                $trait::$method(&self.local_shard, rhs)
            }
        }
    };
}

delegate_binary_op!(Add, add);
delegate_binary_op!(Sub, sub);
delegate_binary_op!(Mul, mul);
delegate_binary_op!(Div, div);
