//! wgpu device, texture tables and readback helpers.

mod context;
mod readback;
mod textures;

pub use context::{CurrentLock, GpuContext};
pub use readback::read_texture;
pub use textures::{texture_format, SurfaceRegistry, TextureTable, WgpuTextureAllocator};
