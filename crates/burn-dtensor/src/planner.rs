use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec::Vec;
use core::fmt;

use ndarray::{ArrayD, Axis, Slice};

use crate::comm::Collective;
use crate::sharding::{PartitionSpec, same_mesh};
use crate::{DistributedError, Element, Result};

/// A single step of a resharding, applied along one mesh axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReshardOp {
    /// Keep the slice of `dim` matching this device's coordinate on `axis`. No communication.
    Split {
        /// Mesh axis newly sharding `dim`.
        axis: usize,
        /// Logical dimension being split.
        dim: usize,
    },
    /// All-gather over `axis`, concatenating along `dim`.
    AllGather {
        /// Mesh axis that stops sharding `dim`.
        axis: usize,
        /// Logical dimension being reassembled.
        dim: usize,
    },
    /// All-to-all over `axis`: `gather_dim` is reassembled while `split_dim` is split.
    AllToAll {
        /// Mesh axis moving from one dimension to another.
        axis: usize,
        /// Logical dimension the axis leaves.
        gather_dim: usize,
        /// Logical dimension the axis joins.
        split_dim: usize,
    },
}

impl ReshardOp {
    /// The mesh axis this step acts along.
    pub fn axis(&self) -> usize {
        match self {
            Self::Split { axis, .. } | Self::AllGather { axis, .. } | Self::AllToAll { axis, .. } => {
                *axis
            }
        }
    }

    /// Whether this step issues a collective.
    pub fn is_collective(&self) -> bool {
        !matches!(self, Self::Split { .. })
    }
}

impl fmt::Display for ReshardOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split { axis, dim } => write!(f, "split(dim {dim}, axis {axis})"),
            Self::AllGather { axis, dim } => write!(f, "all_gather(dim {dim}, axis {axis})"),
            Self::AllToAll {
                axis,
                gather_dim,
                split_dim,
            } => write!(f, "all_to_all(dim {gather_dim} -> dim {split_dim}, axis {axis})"),
        }
    }
}

/// The ordered steps turning one partition spec into another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReshardPlan {
    ops: Vec<ReshardOp>,
}

impl ReshardPlan {
    /// Steps, in execution order.
    pub fn ops(&self) -> &[ReshardOp] {
        &self.ops
    }

    /// Whether the source and target layouts already agree.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Number of steps that communicate.
    pub fn num_collectives(&self) -> usize {
        self.ops.iter().filter(|op| op.is_collective()).count()
    }
}

impl<'a> IntoIterator for &'a ReshardPlan {
    type Item = &'a ReshardOp;
    type IntoIter = core::slice::Iter<'a, ReshardOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// Assignment of mesh axes to logical dimensions, mutated while planning.
struct Assignment {
    current: BTreeMap<usize, Vec<usize>>,
    target: BTreeMap<usize, Vec<usize>>,
}

impl Assignment {
    fn axes(map: &BTreeMap<usize, Vec<usize>>, dim: usize) -> &[usize] {
        map.get(&dim).map(Vec::as_slice).unwrap_or(&[])
    }

    fn owner(map: &BTreeMap<usize, Vec<usize>>, axis: usize) -> Option<usize> {
        map.iter()
            .find(|(_, axes)| axes.contains(&axis))
            .map(|(&dim, _)| dim)
    }

    /// `dim` holds only axes the target keeps at the same positions.
    fn is_settled(&self, dim: usize) -> bool {
        Self::axes(&self.target, dim).starts_with(Self::axes(&self.current, dim))
    }

    /// The dimension `axis` can be removed from: it must trail a dimension that is not settled.
    fn removable_from(&self, axis: usize) -> Option<usize> {
        let dim = Self::owner(&self.current, axis)?;
        let trailing = Self::axes(&self.current, dim).last() == Some(&axis);
        (trailing && !self.is_settled(dim)).then_some(dim)
    }

    /// The dimension `axis` can be appended to right now.
    fn appendable_to(&self, axis: usize) -> Option<usize> {
        let dim = Self::owner(&self.target, axis)?;
        let next = Self::axes(&self.target, dim).get(Self::axes(&self.current, dim).len());
        (self.is_settled(dim) && next == Some(&axis)).then_some(dim)
    }

    fn pop(&mut self, dim: usize) {
        if let Some(axes) = self.current.get_mut(&dim) {
            axes.pop();
            if axes.is_empty() {
                self.current.remove(&dim);
            }
        }
    }

    fn push(&mut self, dim: usize, axis: usize) {
        self.current.entry(dim).or_default().push(axis);
    }

    /// The step for `axis` if it can be taken now.
    fn step(&self, axis: usize) -> Option<ReshardOp> {
        match (self.removable_from(axis), Self::owner(&self.current, axis)) {
            (Some(from), _) => match (self.appendable_to(axis), Self::owner(&self.target, axis)) {
                (Some(to), _) if to != from => Some(ReshardOp::AllToAll {
                    axis,
                    gather_dim: from,
                    split_dim: to,
                }),
                (_, None) => Some(ReshardOp::AllGather { axis, dim: from }),
                // Wanted by a dimension that is not ready for it yet.
                _ => None,
            },
            (None, None) => self
                .appendable_to(axis)
                .map(|dim| ReshardOp::Split { axis, dim }),
            (None, Some(_)) => None,
        }
    }

    fn apply(&mut self, op: ReshardOp) {
        match op {
            ReshardOp::Split { axis, dim } => self.push(dim, axis),
            ReshardOp::AllGather { dim, .. } => self.pop(dim),
            ReshardOp::AllToAll {
                axis,
                gather_dim,
                split_dim,
            } => {
                self.pop(gather_dim);
                self.push(split_dim, axis);
            }
        }
    }
}

/// Checks that two specs describe the same tensor on the same mesh.
fn check_compatible<T: PartialEq>(source: &PartitionSpec<T>, target: &PartitionSpec<T>) -> Result<()> {
    if !same_mesh(source.mesh(), target.mesh()) {
        return Err(DistributedError::IncompatibleSpec(format!(
            "source spec {} and target spec {} refer to different meshes",
            source, target
        )));
    }
    if source.entire_shape() != target.entire_shape() {
        return Err(DistributedError::IncompatibleSpec(format!(
            "source shape {:?} differs from target shape {:?}",
            source.entire_shape(),
            target.entire_shape()
        )));
    }
    Ok(())
}

/// Computes the steps turning `source` into `target`.
///
/// The plan only depends on the two specs, so every device derives the same one without
/// coordinating. Mesh axes are scanned in ascending order and each axis whose assignment differs
/// gets one step:
/// * unassigned in the source, assigned in the target: [`ReshardOp::Split`];
/// * assigned in the source, unassigned in the target: [`ReshardOp::AllGather`];
/// * assigned to another dimension in the target: [`ReshardOp::AllToAll`].
///
/// A dimension split over several axes stays contiguous only when axes leave or join it at its
/// trailing end, so an axis that can't move yet is revisited on the next scan. When a scan
/// makes no progress (axes waiting on each other), the lowest removable axis is gathered.
pub fn plan_reshard<T: PartialEq>(
    source: &PartitionSpec<T>,
    target: &PartitionSpec<T>,
) -> Result<ReshardPlan> {
    source.validate()?;
    target.validate()?;
    check_compatible(source, target)?;

    let num_axes = source.mesh().ndim();
    let mut assignment = Assignment {
        current: source.dim_partition().clone(),
        target: target.dim_partition().clone(),
    };
    let mut ops = Vec::new();

    while assignment.current != assignment.target {
        let mut progressed = false;

        for axis in 0..num_axes {
            if let Some(op) = assignment.step(axis) {
                assignment.apply(op);
                ops.push(op);
                progressed = true;
            }
        }

        if !progressed {
            let (axis, dim) = (0..num_axes)
                .find_map(|axis| assignment.removable_from(axis).map(|dim| (axis, dim)))
                .ok_or_else(|| {
                    DistributedError::IncompatibleSpec(format!(
                        "no resharding step leads from {} to {}",
                        source, target
                    ))
                })?;
            let op = ReshardOp::AllGather { axis, dim };
            assignment.apply(op);
            ops.push(op);
        }
    }

    Ok(ReshardPlan { ops })
}

/// Moves local shards between partition specs.
///
/// The planner holds no tensor state: it is a communicator plus the planning rules, built once
/// per process and passed by reference wherever a layout changes.
#[derive(Debug)]
pub struct ResidencyPlanner<C> {
    collective: C,
}

impl<C: Collective> ResidencyPlanner<C> {
    /// Creates a planner communicating through `collective`.
    pub fn new(collective: C) -> Self {
        Self { collective }
    }

    /// The communicator.
    pub fn collective(&self) -> &C {
        &self.collective
    }

    /// Rank of this device in the mesh.
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// See [`plan_reshard`].
    pub fn plan<T: PartialEq>(
        &self,
        source: &PartitionSpec<T>,
        target: &PartitionSpec<T>,
    ) -> Result<ReshardPlan> {
        plan_reshard(source, target)
    }

    /// Turns this device's shard under `source` into its shard under `target`.
    ///
    /// Every device of the mesh must call this with the same specs. All checks run before the
    /// first collective is issued; a failing collective aborts the reshard.
    pub fn reshard<E: Element, T: PartialEq>(
        &self,
        local: &ArrayD<E>,
        source: &PartitionSpec<T>,
        target: &PartitionSpec<T>,
    ) -> Result<ArrayD<E>> {
        let plan = plan_reshard(source, target)?;

        let expected = source.local_shape();
        if local.shape() != expected.as_slice() {
            return Err(DistributedError::LocalShapeMismatch {
                expected,
                got: local.shape().to_vec(),
            });
        }

        let rank = self.rank();
        log::debug!(
            "Rank {rank}: resharding {source} -> {target} in {} step(s)",
            plan.len()
        );

        let mut tensor = local.clone();
        for op in &plan {
            log::trace!("Rank {rank}: {op} on local shape {:?}", tensor.shape());
            tensor = self.execute(tensor, *op, target)?;
        }

        let expected = target.local_shape();
        if tensor.shape() != expected.as_slice() {
            return Err(DistributedError::LocalShapeMismatch {
                expected,
                got: tensor.shape().to_vec(),
            });
        }

        Ok(tensor)
    }

    /// Reassembles the full tensor on every device. The input shard is left untouched.
    pub fn to_global<E: Element, T: PartialEq>(
        &self,
        local: &ArrayD<E>,
        spec: &PartitionSpec<T>,
    ) -> Result<ArrayD<E>> {
        let replicated = PartitionSpec::replicated(spec.mesh().clone(), spec.entire_shape());
        self.reshard(local, spec, &replicated)
    }

    fn execute<E: Element, T>(
        &self,
        tensor: ArrayD<E>,
        op: ReshardOp,
        target: &PartitionSpec<T>,
    ) -> Result<ArrayD<E>> {
        let group = target.mesh().process_group(&[op.axis()], self.rank())?;

        let tensor = match op {
            ReshardOp::Split { dim, .. } => {
                let chunk = tensor.shape()[dim] / group.size();
                let start = group.local_index() * chunk;
                tensor
                    .slice_axis(Axis(dim), Slice::from(start..start + chunk))
                    .to_owned()
            }
            ReshardOp::AllGather { dim, .. } => self.collective.all_gather(&tensor, &group, dim)?,
            ReshardOp::AllToAll {
                gather_dim,
                split_dim,
                ..
            } => self
                .collective
                .all_to_all(&tensor, &group, gather_dim, split_dim)?,
        };

        Ok(tensor)
    }
}
