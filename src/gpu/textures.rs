//! wgpu-backed texture storage for the buffer pool.

use super::{CurrentLock, GpuContext};
use crate::buffer::{
    BufferDescriptor, InternalFormat, NativeHandle, ResourceKind, Size, SurfaceId,
    TextureAllocator,
};
use crate::error::PoolError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Maps a pool storage format to the wgpu texture format.
pub fn texture_format(format: InternalFormat) -> wgpu::TextureFormat {
    match format {
        InternalFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        InternalFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
        InternalFormat::R8 => wgpu::TextureFormat::R8Unorm,
        InternalFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        InternalFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

/// Resident textures addressable by [`NativeHandle`].
///
/// Shared between the allocator (writer) and the effect engine and
/// publishers (readers).
#[derive(Clone, Default)]
pub struct TextureTable {
    inner: Arc<Mutex<HashMap<NativeHandle, wgpu::Texture>>>,
}

impl TextureTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<NativeHandle, wgpu::Texture>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, handle: NativeHandle) -> Option<wgpu::Texture> {
        self.lock().get(&handle).cloned()
    }

    fn insert(&self, handle: NativeHandle, texture: wgpu::Texture) {
        self.lock().insert(handle, texture);
    }

    fn remove(&self, handle: NativeHandle) -> Option<wgpu::Texture> {
        self.lock().remove(&handle)
    }
}

/// Decoder-owned surfaces, published under stable [`SurfaceId`]s.
#[derive(Clone, Default)]
pub struct SurfaceRegistry {
    inner: Arc<Mutex<HashMap<SurfaceId, wgpu::Texture>>>,
    next_id: Arc<AtomicU32>,
}

impl SurfaceRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SurfaceId, wgpu::Texture>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, texture: wgpu::Texture) -> SurfaceId {
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().insert(id, texture);
        id
    }

    pub fn unregister(&self, id: SurfaceId) -> Option<wgpu::Texture> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: SurfaceId) -> Option<wgpu::Texture> {
        self.lock().get(&id).cloned()
    }
}

/// [`TextureAllocator`] creating wgpu textures on the session device.
pub struct WgpuTextureAllocator {
    device: wgpu::Device,
    current: CurrentLock,
    max_dimension: u32,
    table: TextureTable,
    surfaces: SurfaceRegistry,
    next_handle: u64,
}

impl WgpuTextureAllocator {
    pub fn new(context: &GpuContext, table: TextureTable, surfaces: SurfaceRegistry) -> Self {
        Self {
            device: context.device.clone(),
            current: context.current.clone(),
            max_dimension: context.max_texture_dimension(),
            table,
            surfaces,
            next_handle: 0,
        }
    }

    fn next_handle(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle(self.next_handle)
    }
}

impl TextureAllocator for WgpuTextureAllocator {
    fn allocate(&mut self, desc: &BufferDescriptor) -> Result<NativeHandle, PoolError> {
        let Size { width, height } = desc.size;
        if desc.size.is_empty() {
            return Err(PoolError::allocation(desc, "zero-sized texture"));
        }
        if width > self.max_dimension || height > self.max_dimension {
            return Err(PoolError::allocation(
                desc,
                format!("exceeds device limit of {} pixels", self.max_dimension),
            ));
        }

        let usage = match desc.kind {
            ResourceKind::Texture => {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
            }
            ResourceKind::Renderbuffer => wgpu::TextureUsages::RENDER_ATTACHMENT,
        };
        let sample_count = match desc.kind {
            ResourceKind::Renderbuffer if desc.ms_amount > 1 => desc.ms_amount,
            _ => 1,
        };

        let handle = self.next_handle();
        let _current = self.current.make_current();
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Pooled Texture {}", handle.0)),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.internal_format),
            usage,
            view_formats: &[],
        });
        self.table.insert(handle, texture);
        Ok(handle)
    }

    fn destroy(&mut self, handle: NativeHandle) {
        if let Some(texture) = self.table.remove(handle) {
            let _current = self.current.make_current();
            texture.destroy();
        }
    }

    fn bind_surface(&mut self, surface: SurfaceId) -> Result<(NativeHandle, Size), PoolError> {
        let texture = self
            .surfaces
            .get(surface)
            .ok_or(PoolError::UnknownSurface(surface))?;
        let size = Size::new(texture.width(), texture.height());
        let handle = self.next_handle();
        self.table.insert(handle, texture);
        debug!("Bound surface {:?} to {:?}", surface, handle);
        Ok((handle, size))
    }

    fn unbind_surface(&mut self, handle: NativeHandle) {
        // The registry still holds the decoder's texture; only our alias goes.
        self.table.remove(handle);
    }
}
