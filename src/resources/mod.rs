//! Resource management
//!
//! CPU-side mesh and texture data, staging uploads into GPU memory and an
//! asset-keyed cache that mirrors loaded assets on the GPU.

mod manager;
mod mesh;
mod texture;

pub use manager::*;
pub use mesh::*;
pub use texture::*;
