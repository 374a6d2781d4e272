use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};

use crate::DeviceMeshError;

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// They help organize and partition parallel computation workloads, such as data,
/// tensor, or pipeline parallelism, across the mesh. Each dimension is named
/// to provide unambiguous mapping during sharding operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The name of the dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of devices used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of physical devices,
/// where each dimension can be given a unique name (e.g., `"data"`, `"model"`, `"pipeline"`).
/// This logical mesh provides a basis for specifying tensor sharding and data distribution
/// strategies across devices.
///
/// Devices are laid out in row-major order: the device at rank `r` sits at the coordinates
/// obtained by decomposing `r` over the mesh shape with the last axis varying fastest.
///
/// For example, a 2D mesh with shape `[2, 4]` and dimensions `["dp", "tp"]` represents
/// a logical grid of devices for 2-way data parallelism and 4-way tensor parallelism.
///
/// A mesh is immutable once built and is shared by reference (usually through an `Arc`)
/// between every layout that refers to it.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceMesh<T> {
    /// Physical devices in an n-dimensional logical arrangement
    devices: Vec<T>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMesh<T> {
    /// Builds a mesh whose axes are named `axis0`, `axis1`, ...
    pub fn from_shape<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Result<Self, DeviceMeshError> {
        let shape = shape.into();
        let ndim = shape.len();
        (0..ndim)
            .fold(DeviceMeshBuilder::new(devices, shape), |builder, idx| {
                builder.with_dim(idx, MeshDim::new(format!("axis{idx}")))
            })
            .build()
    }

    /// Extents of the mesh, one per axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of mesh axes.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of devices in the mesh.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// The physical device placed at `rank`.
    pub fn device(&self, rank: usize) -> Option<&T> {
        self.devices.get(rank)
    }

    /// All devices, in rank order.
    pub fn devices(&self) -> &[T] {
        &self.devices
    }

    /// Resolves a named mesh dimension to its axis index.
    pub fn axis_index(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    /// Grid coordinates of the device at `rank`.
    pub fn coordinates(&self, rank: usize) -> Result<Vec<usize>, DeviceMeshError> {
        if rank >= self.num_devices() {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Rank {} out of range for mesh of {} devices",
                rank,
                self.num_devices()
            )));
        }

        let mut coords = alloc::vec![0; self.ndim()];
        let mut rem = rank;
        for (axis, &extent) in self.shape.iter().enumerate().rev() {
            coords[axis] = rem % extent;
            rem /= extent;
        }
        Ok(coords)
    }

    /// Rank of the device at the given grid coordinates.
    pub fn rank_of(&self, coords: &[usize]) -> Result<usize, DeviceMeshError> {
        if coords.len() != self.ndim() {
            return Err(DeviceMeshError::InvalidDimension(format!(
                "Expected {} coordinates, got {}",
                self.ndim(),
                coords.len()
            )));
        }

        coords
            .iter()
            .zip(&self.shape)
            .try_fold(0, |rank, (&coord, &extent)| {
                if coord >= extent {
                    Err(DeviceMeshError::InvalidDimension(format!(
                        "Coordinate {} exceeds mesh shape {:?}",
                        coord, self.shape
                    )))
                } else {
                    Ok(rank * extent + coord)
                }
            })
    }

    /// Returns the communication group of `rank` over the given mesh axes.
    ///
    /// The group holds every device that shares `rank`'s coordinate on all axes not listed in
    /// `axes`. Members are ordered mixed-radix over `axes` in the order given, the first axis
    /// being the most significant, so that position `i` in the group is the `i`-th block of a
    /// dimension split over those axes.
    pub fn process_group(&self, axes: &[usize], rank: usize) -> Result<ProcessGroup, DeviceMeshError> {
        let mut seen = HashSet::new();
        for &axis in axes {
            if axis >= self.ndim() {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    axis, self.shape
                )));
            }
            if !seen.insert(axis) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Axis {} listed twice in group",
                    axis
                )));
            }
        }

        let own = self.coordinates(rank)?;
        let size = axes.iter().map(|&axis| self.shape[axis]).product::<usize>();
        let local_index = axes
            .iter()
            .fold(0, |idx, &axis| idx * self.shape[axis] + own[axis]);

        let mut coords = own;
        let mut ranks = Vec::with_capacity(size);
        for member in 0..size {
            let mut rem = member;
            for &axis in axes.iter().rev() {
                coords[axis] = rem % self.shape[axis];
                rem /= self.shape[axis];
            }
            ranks.push(self.rank_of(&coords)?);
        }

        Ok(ProcessGroup {
            axes: axes.to_vec(),
            ranks,
            local_index,
        })
    }
}

/// The set of devices taking part in a collective, as seen from one member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessGroup {
    axes: Vec<usize>,
    ranks: Vec<usize>,
    local_index: usize,
}

impl ProcessGroup {
    /// Mesh axes the group varies along.
    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    /// Global ranks of the members, in group order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Position of the owning rank within the group.
    pub fn local_index(&self) -> usize {
        self.local_index
    }
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder<T> {
    /// Physical devices in an n-dimensional logical arrangement.
    devices: Vec<T>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMeshBuilder<T> {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    ///
    /// # Arguments
    /// * `devices` - A vector of devices to be arranged in the mesh, in rank order.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and should correspond to a
    /// unique index in the shape of the mesh. Mapping the same name twice keeps the last index.
    ///
    /// # Arguments
    /// * `idx` - The index of the dimension in the mesh shape.
    /// * `dim` - The mesh dimension to be assigned.
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_dtensor::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("data_parallel"))
    ///     .with_dim(1, MeshDim::new("tensor_parallel"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.axis_index(&MeshDim::new("tensor_parallel")), Some(1));
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// This method performs validation to ensure that all dimensions are correctly
    /// mapped, that every extent is positive, and that the number of devices matches
    /// the expected shape. If the validation fails, an error is returned.
    pub fn build(self) -> Result<DeviceMesh<T>, DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        if self.shape.contains(&0) {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Mesh extents must be positive, got {:?}",
                self.shape
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}
