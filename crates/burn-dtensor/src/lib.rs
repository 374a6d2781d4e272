#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn distributed tensors.
//!
//! A [`DistributedTensor`] holds this device's shard of a logical tensor, laid out over a
//! [`DeviceMesh`](sharding::DeviceMesh) according to a [`Layout`](sharding::Layout). Moving
//! between layouts is planned by the [`ResidencyPlanner`], which turns the difference between
//! two [`PartitionSpec`](sharding::PartitionSpec)s into local splits, all-gathers and
//! all-to-alls over the mesh axes.

extern crate alloc;

mod element;
mod error;
mod module;
mod planner;
mod tensor;

pub mod comm;
pub mod sharding;

pub use element::*;
pub use error::*;
pub use module::*;
pub use planner::*;
pub use tensor::*;
