use alloc::string::String;
use alloc::vec::Vec;

use ndarray::ArrayD;

use crate::comm::Collective;
use crate::planner::ResidencyPlanner;
use crate::sharding::Layout;
use crate::{DistributedTensor, Element, Result};

/// A learnable parameter, either held in full or already distributed.
#[derive(Debug)]
pub enum Param<E: Element, T> {
    /// A full tensor, identical on every device.
    Local(ArrayD<E>),
    /// A tensor laid out over a device mesh.
    Distributed(DistributedTensor<E, T>),
}

impl<E: Element, T> Param<E, T> {
    /// Whether the parameter is already distributed.
    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed(_))
    }

    /// The values held by this device.
    pub fn local(&self) -> &ArrayD<E> {
        match self {
            Self::Local(tensor) => tensor,
            Self::Distributed(tensor) => tensor.to_local(),
        }
    }
}

impl<E: Element, T> From<ArrayD<E>> for Param<E, T> {
    fn from(tensor: ArrayD<E>) -> Self {
        Self::Local(tensor)
    }
}

impl<E: Element, T> From<DistributedTensor<E, T>> for Param<E, T> {
    fn from(tensor: DistributedTensor<E, T>) -> Self {
        Self::Distributed(tensor)
    }
}

/// A structure owning named learnable parameters.
pub trait Module<E: Element, T> {
    /// Calls `visitor` on every parameter, in a stable order. The first error stops the visit.
    fn visit_params_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Param<E, T>) -> Result<()>,
    ) -> Result<()>;
}

/// An ordered collection of named parameters.
#[derive(Debug)]
pub struct ParamStore<E: Element, T> {
    params: Vec<(String, Param<E, T>)>,
}

impl<E: Element, T> Default for ParamStore<E, T> {
    fn default() -> Self {
        Self { params: Vec::new() }
    }
}

impl<E: Element, T> ParamStore<E, T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, replacing any parameter with the same name.
    pub fn insert<S: Into<String>, P: Into<Param<E, T>>>(&mut self, name: S, param: P) {
        let name = name.into();
        let param = param.into();

        match self.params.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = param,
            None => self.params.push((name, param)),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<S: Into<String>, P: Into<Param<E, T>>>(mut self, name: S, param: P) -> Self {
        self.insert(name, param);
        self
    }

    /// Looks up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Param<E, T>> {
        self.params
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, param)| param)
    }

    /// Parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param<E, T>)> {
        self.params.iter().map(|(name, param)| (name.as_str(), param))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the store holds no parameter.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl<E: Element, T> Module<E, T> for ParamStore<E, T> {
    fn visit_params_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Param<E, T>) -> Result<()>,
    ) -> Result<()> {
        self.params
            .iter_mut()
            .try_for_each(|(name, param)| visitor(name, param))
    }
}

/// Distributes every parameter of `module` that isn't distributed yet.
///
/// `partition_fn` picks the layout of each parameter from its name and current value. Every
/// device must call this with the same module structure, since distributing a parameter may
/// communicate.
///
/// Parameters are only replaced once all of them have been distributed: on error, `module` is
/// left as it was.
pub fn distribute_module<M, E, T, C, F>(
    module: &mut M,
    mut partition_fn: F,
    planner: &ResidencyPlanner<C>,
) -> Result<()>
where
    M: Module<E, T>,
    E: Element,
    T: PartialEq,
    C: Collective,
    F: FnMut(&str, &ArrayD<E>) -> Layout<T>,
{
    let mut distributed = Vec::new();
    module.visit_params_mut(&mut |name, param| {
        if let Param::Local(value) = param {
            let layout = partition_fn(name, value);
            distributed.push(DistributedTensor::new(value.clone(), layout, planner)?);
        }
        Ok(())
    })?;

    let mut distributed = distributed.into_iter();
    module.visit_params_mut(&mut |name, param| {
        if matches!(param, Param::Local(_)) {
            if let Some(tensor) = distributed.next() {
                log::debug!("Distributed parameter `{name}`: {tensor:?}");
                *param = Param::Distributed(tensor);
            }
        }
        Ok(())
    })
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::DistributedError;
    use crate::comm::threaded::LocalWorld;
    use crate::sharding::DeviceMesh;
    use alloc::sync::Arc;
    use alloc::vec;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_distribute_module_shards_local_params() {
        let mesh = Arc::new(DeviceMesh::from_shape(vec![0usize, 1], [2]).unwrap());

        let shards = LocalWorld::run(2, |comm| {
            let planner = ResidencyPlanner::new(comm);
            let weight =
                Array::from_shape_vec(IxDyn(&[4, 2]), (0..8).collect::<Vec<i32>>()).unwrap();
            let bias = Array::from_shape_vec(IxDyn(&[2]), vec![10, 11]).unwrap();
            let mut store = ParamStore::<i32, usize>::new()
                .with("weight", weight)
                .with("bias", bias);

            distribute_module(
                &mut store,
                |name, _| match name {
                    "weight" => Layout::new(mesh.clone(), [(0, vec![0])]),
                    _ => Layout::replicated(mesh.clone()),
                },
                &planner,
            )
            .unwrap();

            assert!(store.iter().all(|(_, param)| param.is_distributed()));
            assert_eq!(store.get("bias").unwrap().local().shape(), &[2]);
            store.get("weight").unwrap().local().clone()
        });

        assert_eq!(shards[0].as_slice().unwrap(), &[0, 1, 2, 3]);
        assert_eq!(shards[1].as_slice().unwrap(), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_distributed_params_are_left_alone() {
        let mesh = Arc::new(DeviceMesh::from_shape(vec![0usize], [1]).unwrap());
        let planner = ResidencyPlanner::new(LocalWorld::connect(1).remove(0));
        let existing = DistributedTensor::new(
            Array::from_elem(IxDyn(&[2]), 1.0f32),
            Layout::replicated(mesh.clone()),
            &planner,
        )
        .unwrap();
        let mut store = ParamStore::<f32, usize>::new().with("frozen", existing);

        let mut calls = 0;
        distribute_module(
            &mut store,
            |_, _| {
                calls += 1;
                Layout::replicated(mesh.clone())
            },
            &planner,
        )
        .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_param_leaves_module_untouched() {
        let mesh = Arc::new(DeviceMesh::from_shape(vec![0usize, 1], [2]).unwrap());

        LocalWorld::run(2, |comm| {
            let planner = ResidencyPlanner::new(comm);
            let mut store = ParamStore::<i64, usize>::new()
                .with("weight", ArrayD::<i64>::zeros(IxDyn(&[4, 2])))
                .with("bias", ArrayD::<i64>::zeros(IxDyn(&[3])));

            // The bias extent of 3 can't be split over the 2-wide axis.
            let err = distribute_module(
                &mut store,
                |_, _| Layout::new(mesh.clone(), [(0, vec![0])]),
                &planner,
            )
            .unwrap_err();

            assert!(matches!(err, DistributedError::InvalidPartition(_)));
            assert!(store.iter().all(|(_, param)| !param.is_distributed()));
            assert_eq!(store.get("weight").unwrap().local().shape(), &[4, 2]);
            assert_eq!(store.get("bias").unwrap().local().shape(), &[3]);
        });
    }

    #[test]
    fn test_insert_replaces_same_name() {
        let mut store = ParamStore::<f64, usize>::new();
        store.insert("w", ArrayD::<f64>::zeros(IxDyn(&[1])));
        store.insert("w", ArrayD::<f64>::zeros(IxDyn(&[3])));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("w").unwrap().local().shape(), &[3]);
    }
}
