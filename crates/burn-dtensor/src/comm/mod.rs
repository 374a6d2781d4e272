//! Collective communication consumed by the resharding planner.
//!
//! Every collective is blocking: it returns once all members of the group have contributed.
//! All members must issue the same call on the same group, in the same order, or the group
//! deadlocks.

#[cfg(feature = "std")]
pub mod recorder;
#[cfg(feature = "std")]
pub mod threaded;

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use ndarray::{ArrayD, Axis};

use crate::sharding::ProcessGroup;
use crate::{CollectiveError, Element};

/// A communicator bound to one rank of a device mesh.
pub trait Collective {
    /// Global rank of the caller in the mesh.
    fn rank(&self) -> usize;

    /// Concatenates every member's `tensor` along `dim`, in group order.
    fn all_gather<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError>;

    /// Cuts `tensor` into `group.size()` equal chunks along `split_dim` and sends chunk `j` to
    /// member `j`. The received chunks are concatenated along `gather_dim`, in group order.
    fn all_to_all<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        gather_dim: usize,
        split_dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError>;
}

impl<C: Collective + ?Sized> Collective for &C {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn all_gather<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        (**self).all_gather(tensor, group, dim)
    }

    fn all_to_all<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        gather_dim: usize,
        split_dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        (**self).all_to_all(tensor, group, gather_dim, split_dim)
    }
}

impl<C: Collective + ?Sized> Collective for Arc<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn all_gather<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        (**self).all_gather(tensor, group, dim)
    }

    fn all_to_all<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        gather_dim: usize,
        split_dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        (**self).all_to_all(tensor, group, gather_dim, split_dim)
    }
}

/// Cuts a tensor into `parts` equal chunks along `dim`.
pub fn split_even<E: Element>(
    tensor: &ArrayD<E>,
    dim: usize,
    parts: usize,
) -> Result<Vec<ArrayD<E>>, CollectiveError> {
    let extent = tensor.shape().get(dim).copied().ok_or_else(|| {
        CollectiveError::Malformed(format!(
            "dimension {} out of range for shape {:?}",
            dim,
            tensor.shape()
        ))
    })?;

    if parts == 0 || extent % parts != 0 {
        return Err(CollectiveError::UnevenSplit { dim, extent, parts });
    }

    if extent == 0 {
        return Ok((0..parts).map(|_| tensor.clone()).collect());
    }

    Ok(tensor
        .axis_chunks_iter(Axis(dim), extent / parts)
        .map(|chunk| chunk.to_owned())
        .collect())
}

/// Concatenates tensors along `dim`.
pub fn concat<E: Element>(dim: usize, parts: &[ArrayD<E>]) -> Result<ArrayD<E>, CollectiveError> {
    let views = parts.iter().map(|part| part.view()).collect::<Vec<_>>();

    ndarray::concatenate(Axis(dim), &views)
        .map_err(|err| CollectiveError::Malformed(format!("cannot concatenate along {dim}: {err}")))
}
