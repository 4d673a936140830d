//! GPU buffer descriptors and reference-counted buffer handles.
//!
//! A [`Buffer`] wraps one GPU-resident resource together with the metadata the
//! [`BufferPool`] needs to recycle it. Cloning a `Buffer` retains it; dropping
//! the last clone hands the resource back to the pool.

pub mod pool;

pub use pool::{BufferPool, PoolConfig, PoolStats, TextureAllocator};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Kind of GPU resource a buffer represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    Renderbuffer,
}

/// Texture binding target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    /// Normalized-coordinate 2D texture
    Texture2D,
    /// Pixel-coordinate rectangle texture (video surfaces)
    Rectangle,
}

/// Storage format of the GPU resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalFormat {
    Rgba8,
    Bgra8,
    R8,
    Rgba16Float,
    Rgba32Float,
}

impl InternalFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            InternalFormat::Rgba8 | InternalFormat::Bgra8 => 4,
            InternalFormat::R8 => 1,
            InternalFormat::Rgba16Float => 8,
            InternalFormat::Rgba32Float => 16,
        }
    }
}

/// Channel layout of client-visible pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Red,
}

/// Component type of client-visible pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelType {
    UnsignedByte,
    UnsignedInt8888Rev,
    HalfFloat,
    Float,
}

/// CPU-side backing of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuBacking {
    None,
    Mapped,
}

/// GPU-side backing of a buffer.
///
/// `External` resources were created outside the pool; the pool only ever
/// drops its bookkeeping for them and never destroys the native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuBacking {
    Pooled,
    External,
}

/// Opaque handle of a native GPU resource, assigned by the [`TextureAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

/// Identifier of a platform video surface produced by a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

/// Client-defined backing identifier. Never interpreted by the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BackingId(pub u32);

/// Unique identifier of one buffer record inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Dimensions in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Region in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_size(size: Size) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Describes a GPU resource and how it is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub kind: ResourceKind,
    pub target: TextureTarget,
    pub internal_format: InternalFormat,
    pub pixel_format: PixelFormat,
    pub pixel_type: PixelType,
    pub cpu_backing: CpuBacking,
    pub gpu_backing: GpuBacking,
    /// Native resource handle; ignored by `acquire`, which assigns one.
    pub handle: NativeHandle,
    pub size: Size,
    /// Multisample count, only meaningful for renderbuffers.
    pub ms_amount: u32,
    /// Platform surface this resource is bound to, if any.
    pub local_surface: Option<SurfaceId>,
}

impl BufferDescriptor {
    /// A pooled RGBA8 2D texture of the given size.
    pub fn texture(size: Size) -> Self {
        Self {
            kind: ResourceKind::Texture,
            target: TextureTarget::Texture2D,
            internal_format: InternalFormat::Rgba8,
            pixel_format: PixelFormat::Rgba,
            pixel_type: PixelType::UnsignedByte,
            cpu_backing: CpuBacking::None,
            gpu_backing: GpuBacking::Pooled,
            handle: NativeHandle(0),
            size,
            ms_amount: 0,
            local_surface: None,
        }
    }

    /// A texture created by the client, which the pool must never destroy.
    pub fn external(handle: NativeHandle, size: Size) -> Self {
        Self {
            gpu_backing: GpuBacking::External,
            handle,
            ..Self::texture(size)
        }
    }

    /// A BGRA rectangle texture bound to a decoder surface.
    pub fn surface(surface: SurfaceId, handle: NativeHandle, size: Size) -> Self {
        Self {
            target: TextureTarget::Rectangle,
            internal_format: InternalFormat::Bgra8,
            pixel_format: PixelFormat::Bgra,
            pixel_type: PixelType::UnsignedInt8888Rev,
            local_surface: Some(surface),
            ..Self::external(handle, size)
        }
    }

    pub fn with_format(mut self, internal_format: InternalFormat) -> Self {
        self.internal_format = internal_format;
        self
    }

    pub fn is_external(&self) -> bool {
        self.gpu_backing == GpuBacking::External
    }
}

/// Mutable per-buffer metadata, owned by whoever holds the active reference.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferState {
    pub(crate) last_touched: Instant,
    pub(crate) size: Size,
    pub(crate) src_rect: Rect,
    pub(crate) backing_size: Size,
    pub(crate) backing_id: BackingId,
}

impl BufferState {
    pub(crate) fn for_size(size: Size, now: Instant) -> Self {
        Self {
            last_touched: now,
            size,
            src_rect: Rect::from_size(size),
            backing_size: size,
            backing_id: BackingId::default(),
        }
    }
}

/// Shared record behind every clone of a [`Buffer`].
pub(crate) struct BufferRecord {
    pub(crate) id: BufferId,
    pub(crate) descriptor: BufferDescriptor,
    pub(crate) created_at: Instant,
    pub(crate) prefer_deletion: AtomicBool,
    pub(crate) state: Mutex<BufferState>,
    pub(crate) pool: Arc<BufferPool>,
}

impl Drop for BufferRecord {
    fn drop(&mut self) {
        let prefer_deletion = *self.prefer_deletion.get_mut();
        let last_touched = self
            .state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .last_touched;
        self.pool.reclaim(
            self.id,
            self.descriptor,
            self.created_at,
            last_touched,
            prefer_deletion,
        );
    }
}

/// Reference-counted handle to one pooled or external GPU resource.
#[derive(Clone)]
pub struct Buffer {
    pub(crate) record: Arc<BufferRecord>,
}

impl Buffer {
    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.record.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> BufferId {
        self.record.id
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.record.descriptor
    }

    pub fn handle(&self) -> NativeHandle {
        self.record.descriptor.handle
    }

    pub fn is_external(&self) -> bool {
        self.record.descriptor.is_external()
    }

    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.record)
    }

    pub fn created_at(&self) -> Instant {
        self.record.created_at
    }

    pub fn last_touched(&self) -> Instant {
        self.state().last_touched
    }

    pub(crate) fn touch(&self, now: Instant) {
        self.state().last_touched = now;
    }

    /// When set, the resource is destroyed on release instead of recycled.
    pub fn prefer_deletion(&self) -> bool {
        self.record.prefer_deletion.load(Ordering::Acquire)
    }

    pub fn set_prefer_deletion(&self, prefer: bool) {
        self.record.prefer_deletion.store(prefer, Ordering::Release);
    }

    /// Size in pixels of the underlying resource.
    pub fn size(&self) -> Size {
        self.state().size
    }

    pub fn set_size(&self, size: Size) {
        self.state().size = size;
    }

    /// Region of the resource holding the image of interest.
    pub fn src_rect(&self) -> Rect {
        self.state().src_rect
    }

    pub fn set_src_rect(&self, rect: Rect) {
        self.state().src_rect = rect;
    }

    pub fn backing_size(&self) -> Size {
        self.state().backing_size
    }

    pub fn set_backing_size(&self, size: Size) {
        self.state().backing_size = size;
    }

    pub fn backing_id(&self) -> BackingId {
        self.state().backing_id
    }

    pub fn set_backing_id(&self, id: BackingId) {
        self.state().backing_id = id;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.record.id)
            .field("handle", &self.record.descriptor.handle)
            .field("backing", &self.record.descriptor.gpu_backing)
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_descriptor_is_external_rectangle() {
        let desc = BufferDescriptor::surface(SurfaceId(7), NativeHandle(3), Size::new(1280, 720));
        assert!(desc.is_external());
        assert_eq!(desc.target, TextureTarget::Rectangle);
        assert_eq!(desc.internal_format, InternalFormat::Bgra8);
        assert_eq!(desc.local_surface, Some(SurfaceId(7)));
        assert_eq!(desc.ms_amount, 0);
    }

    #[test]
    fn test_rect_from_size_covers_whole_resource() {
        let rect = Rect::from_size(Size::new(640, 480));
        assert_eq!((rect.x, rect.y), (0, 0));
        assert_eq!(rect.size(), Size::new(640, 480));
    }
}
