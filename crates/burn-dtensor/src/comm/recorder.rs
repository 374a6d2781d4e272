//! A collective wrapper that keeps a log of the calls it completes.

use std::sync::{Mutex, PoisonError};

use ndarray::ArrayD;

use super::Collective;
use crate::sharding::ProcessGroup;
use crate::{CollectiveError, Element};

/// A collective call, as observed by a [`RecordingCollective`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectiveRecord {
    /// An all-gather over `ranks`, concatenating along `dim`.
    AllGather {
        /// Group members.
        ranks: Vec<usize>,
        /// Concatenation dimension.
        dim: usize,
    },
    /// An all-to-all over `ranks`.
    AllToAll {
        /// Group members.
        ranks: Vec<usize>,
        /// Dimension the received chunks are concatenated along.
        gather_dim: usize,
        /// Dimension the local tensor is cut along.
        split_dim: usize,
    },
}

/// Forwards every collective to an inner backend and keeps a log of the calls.
///
/// Only calls the inner backend completes are recorded.
pub struct RecordingCollective<C> {
    inner: C,
    records: Mutex<Vec<CollectiveRecord>>,
}

impl<C: Collective> RecordingCollective<C> {
    /// Wraps a backend.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            records: Mutex::new(Vec::new()),
        }
    }

    /// The calls made so far, oldest first.
    pub fn records(&self) -> Vec<CollectiveRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forgets the calls made so far.
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn record(&self, record: CollectiveRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

impl<C: Collective> Collective for RecordingCollective<C> {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn all_gather<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        let gathered = self.inner.all_gather(tensor, group, dim)?;
        self.record(CollectiveRecord::AllGather {
            ranks: group.ranks().to_vec(),
            dim,
        });
        Ok(gathered)
    }

    fn all_to_all<E: Element>(
        &self,
        tensor: &ArrayD<E>,
        group: &ProcessGroup,
        gather_dim: usize,
        split_dim: usize,
    ) -> Result<ArrayD<E>, CollectiveError> {
        let exchanged = self.inner.all_to_all(tensor, group, gather_dim, split_dim)?;
        self.record(CollectiveRecord::AllToAll {
            ranks: group.ranks().to_vec(),
            gather_dim,
            split_dim,
        });
        Ok(exchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::threaded::LocalWorld;
    use crate::sharding::DeviceMesh;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_completed_calls_are_recorded() {
        let mesh = DeviceMesh::from_shape(vec![0], [1]).unwrap();
        let comm = RecordingCollective::new(LocalWorld::connect(1).remove(0));
        let group = mesh.process_group(&[0], 0).unwrap();
        let tensor = Array::from_elem(IxDyn(&[2, 2]), 3u8);

        comm.all_gather(&tensor, &group, 1).unwrap();
        comm.all_to_all(&tensor, &group, 0, 1).unwrap();

        assert_eq!(
            comm.records(),
            vec![
                CollectiveRecord::AllGather {
                    ranks: vec![0],
                    dim: 1,
                },
                CollectiveRecord::AllToAll {
                    ranks: vec![0],
                    gather_dim: 0,
                    split_dim: 1,
                },
            ]
        );

        comm.clear();
        assert!(comm.records().is_empty());
    }

    #[test]
    fn test_rejected_calls_are_not_recorded() {
        let mesh = DeviceMesh::from_shape(vec![0, 1], [2]).unwrap();
        let mut comms = LocalWorld::connect(2);
        let comm = RecordingCollective::new(comms.remove(0));
        let foreign = mesh.process_group(&[0], 1).unwrap();
        let tensor = Array::from_elem(IxDyn(&[2]), 1.0f64);

        assert!(matches!(
            comm.all_gather(&tensor, &foreign, 0),
            Err(CollectiveError::NotAMember { .. })
        ));
        assert!(matches!(
            comm.all_to_all(&tensor, &foreign, 0, 0),
            Err(CollectiveError::NotAMember { .. })
        ));
        assert!(comm.records().is_empty());
    }
}
