use alloc::string::String;
use alloc::vec::Vec;

use thiserror::Error;

use crate::DType;

/// Result type alias using [`DistributedError`].
pub type Result<T> = core::result::Result<T, DistributedError>;

/// Represents errors that can occur when constructing a [`DeviceMesh`](crate::sharding::DeviceMesh)
/// or querying its communication groups.
///
/// These errors are typically related to invalid dimension mappings or mismatches
/// between the device count and the mesh shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

/// Errors surfaced by a [`Collective`](crate::comm::Collective) backend.
///
/// Collectives are assumed reliable: any of these leaves the participating devices
/// in an unknown state and must be treated as fatal by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectiveError {
    /// A peer hung up before the collective completed.
    #[error("rank {peer} disconnected during a collective")]
    Disconnected {
        /// The rank that went away.
        peer: usize,
    },
    /// The calling rank is not part of the group it tried to communicate over.
    #[error("rank {rank} is not a member of group {group:?}")]
    NotAMember {
        /// The calling rank.
        rank: usize,
        /// The ranks of the group.
        group: Vec<usize>,
    },
    /// A tensor cannot be cut into equal chunks for the group.
    #[error("dimension {dim} of extent {extent} cannot be split across {parts} ranks")]
    UnevenSplit {
        /// The dimension being split.
        dim: usize,
        /// The extent of that dimension.
        extent: usize,
        /// The number of chunks requested.
        parts: usize,
    },
    /// The received contributions could not be assembled.
    #[error("malformed collective payload: {0}")]
    Malformed(String),
}

/// Errors that can occur while describing, planning or executing a resharding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributedError {
    /// A partition spec violates one of its invariants.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// The source and target specs of a reshard do not describe the same tensor.
    #[error("incompatible specs: {0}")]
    IncompatibleSpec(String),

    /// A collective failed; the distributed state is unrecoverable.
    #[error("collective failure: {0}")]
    CollectiveFailure(#[from] CollectiveError),

    /// The device mesh is malformed.
    #[error(transparent)]
    Mesh(#[from] DeviceMeshError),

    /// The local tensor does not have the shape the source spec implies.
    #[error("local shard has shape {got:?}, but the partition spec expects {expected:?}")]
    LocalShapeMismatch {
        /// Shape derived from the partition spec.
        expected: Vec<usize>,
        /// Shape of the supplied tensor.
        got: Vec<usize>,
    },

    /// A layout was used before its global shape was known.
    #[error("layout has no global shape yet")]
    UnresolvedShape,

    /// A layout's global shape was already resolved to a different value.
    #[error("layout shape already resolved to {resolved:?}, cannot rebind to {requested:?}")]
    ShapeAlreadyResolved {
        /// The shape the layout carries.
        resolved: Vec<usize>,
        /// The shape that was requested.
        requested: Vec<usize>,
    },

    /// An element could not be represented in the target element type.
    #[error("cannot cast elements from {from:?} to {to:?}")]
    CastFailed {
        /// Source element type.
        from: DType,
        /// Target element type.
        to: DType,
    },
}
