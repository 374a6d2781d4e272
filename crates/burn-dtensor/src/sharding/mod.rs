//! Device meshes and the description of how tensors are laid out over them.

mod layout;
mod mesh;
mod spec;

pub use layout::*;
pub use mesh::*;
pub use spec::*;
