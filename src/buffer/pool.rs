//! Buffer pool: allocation, recycling and age-based eviction of GPU buffers.
//!
//! The pool is constructed once per session and shared as `Arc<BufferPool>`.
//! Every [`Buffer`] keeps its pool alive, so teardown order is always
//! "last buffer released, then pool destroyed".

use super::{
    Buffer, BufferDescriptor, BufferId, BufferRecord, BufferState, CpuBacking, GpuBacking,
    InternalFormat, NativeHandle, PixelFormat, PixelType, ResourceKind, Size, SurfaceId,
    TextureTarget,
};
use crate::error::PoolError;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Creates and destroys native GPU resources on behalf of the pool.
///
/// All calls happen with the pool lock held, so implementations never see
/// concurrent calls.
pub trait TextureAllocator: Send {
    /// Create a native resource matching `desc`.
    fn allocate(&mut self, desc: &BufferDescriptor) -> Result<NativeHandle, PoolError>;

    /// Destroy a resource returned by [`allocate`](Self::allocate).
    fn destroy(&mut self, handle: NativeHandle);

    /// Bind a decoder surface as a texture without copying its contents.
    fn bind_surface(&mut self, surface: SurfaceId) -> Result<(NativeHandle, Size), PoolError>;

    /// Forget a binding made by [`bind_surface`](Self::bind_surface).
    /// The surface itself belongs to the decoder and must stay alive.
    fn unbind_surface(&mut self, handle: NativeHandle);
}

/// Eviction policy applied during housekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Free buffers returned longer ago than this are destroyed.
    pub retention: Duration,
    /// Upper bound on the number of free buffers kept around.
    pub max_free: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(1),
            max_free: 16,
        }
    }
}

/// Snapshot of pool bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pooled resources waiting for reuse
    pub free: usize,
    /// Buffer records currently referenced (pooled and external)
    pub in_use: usize,
    /// External records currently referenced
    pub external: usize,
    /// Native resources created by the pool
    pub created: u64,
    /// Native resources destroyed by the pool
    pub destroyed: u64,
    /// Housekeeping passes run so far
    pub passes: u64,
}

/// Descriptor compatibility class used to match free buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    kind: ResourceKind,
    target: TextureTarget,
    internal_format: InternalFormat,
    pixel_format: PixelFormat,
    pixel_type: PixelType,
    cpu_backing: CpuBacking,
    size: Size,
    ms_amount: u32,
}

impl PoolKey {
    fn from_descriptor(desc: &BufferDescriptor) -> Self {
        Self {
            kind: desc.kind,
            target: desc.target,
            internal_format: desc.internal_format,
            pixel_format: desc.pixel_format,
            pixel_type: desc.pixel_type,
            cpu_backing: desc.cpu_backing,
            size: desc.size,
            ms_amount: desc.ms_amount,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeEntry {
    handle: NativeHandle,
    created_at: Instant,
    returned_at: Instant,
}

struct PoolState {
    allocator: Box<dyn TextureAllocator>,
    free: HashMap<PoolKey, Vec<FreeEntry>>,
    in_use: HashMap<BufferId, GpuBacking>,
    surfaces: HashMap<SurfaceId, (BufferId, Weak<BufferRecord>)>,
    next_id: u64,
    created: u64,
    destroyed: u64,
    passes: u64,
    shut_down: bool,
}

impl PoolState {
    fn next_id(&mut self) -> BufferId {
        self.next_id += 1;
        BufferId(self.next_id)
    }

    fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    fn destroy(&mut self, handle: NativeHandle) {
        self.allocator.destroy(handle);
        self.destroyed += 1;
        debug!("Destroyed pooled texture {:?}", handle);
    }
}

/// Lifecycle manager for [`Buffer`]s.
pub struct BufferPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create the session's pool. Call once at startup and share the `Arc`.
    pub fn new(allocator: Box<dyn TextureAllocator>, config: PoolConfig) -> Arc<Self> {
        info!(
            "Buffer pool created (retention {:?}, max free {})",
            config.retention, config.max_free
        );
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState {
                allocator,
                free: HashMap::new(),
                in_use: HashMap::new(),
                surfaces: HashMap::new(),
                next_id: 0,
                created: 0,
                destroyed: 0,
                passes: 0,
                shut_down: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn make_buffer(
        self: &Arc<Self>,
        id: BufferId,
        descriptor: BufferDescriptor,
        created_at: Instant,
        prefer_deletion: bool,
    ) -> Buffer {
        let now = Instant::now();
        Buffer {
            record: Arc::new(BufferRecord {
                id,
                descriptor,
                created_at,
                prefer_deletion: AtomicBool::new(prefer_deletion),
                state: Mutex::new(BufferState::for_size(descriptor.size, now)),
                pool: Arc::clone(self),
            }),
        }
    }

    /// Return a free buffer compatible with `desc`, or allocate a new one.
    ///
    /// Never blocks waiting for a release. Allocation failure is returned to
    /// the caller and not retried.
    pub fn acquire(self: &Arc<Self>, desc: &BufferDescriptor) -> Result<Buffer, PoolError> {
        if desc.is_external() {
            return self.wrap_external_texture(desc);
        }

        let key = PoolKey::from_descriptor(desc);
        let (id, handle, created_at) = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            let recycled = state.free.get_mut(&key).and_then(Vec::pop);
            let (handle, created_at) = match recycled {
                Some(entry) => (entry.handle, entry.created_at),
                None => {
                    let handle = state.allocator.allocate(desc)?;
                    state.created += 1;
                    debug!(
                        "Allocated {}x{} {:?} texture {:?}",
                        desc.size.width, desc.size.height, desc.internal_format, handle
                    );
                    (handle, Instant::now())
                }
            };
            let id = state.next_id();
            state.in_use.insert(id, GpuBacking::Pooled);
            (id, handle, created_at)
        };

        let descriptor = BufferDescriptor {
            handle,
            gpu_backing: GpuBacking::Pooled,
            local_surface: None,
            ..*desc
        };
        Ok(self.make_buffer(id, descriptor, created_at, false))
    }

    /// Register a texture the client created itself.
    ///
    /// The pool only tracks the record; the native resource is never destroyed
    /// by the pool.
    pub fn wrap_external_texture(
        self: &Arc<Self>,
        desc: &BufferDescriptor,
    ) -> Result<Buffer, PoolError> {
        if !desc.is_external() {
            return Err(PoolError::NotExternal(Box::new(*desc)));
        }
        let id = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            let id = state.next_id();
            state.in_use.insert(id, GpuBacking::External);
            id
        };
        Ok(self.make_buffer(id, *desc, Instant::now(), true))
    }

    /// Wrap a decoder surface as a zero-copy texture buffer.
    ///
    /// Importing a surface that already has a live buffer returns another
    /// reference to that buffer instead of creating a second record.
    pub fn import_external(self: &Arc<Self>, surface: SurfaceId) -> Result<Buffer, PoolError> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }
        if let Some(record) = state.surfaces.get(&surface).and_then(|(_, weak)| weak.upgrade()) {
            return Ok(Buffer { record });
        }

        let (handle, size) = state.allocator.bind_surface(surface)?;
        let id = state.next_id();
        state.in_use.insert(id, GpuBacking::External);
        let buffer = self.make_buffer(
            id,
            BufferDescriptor::surface(surface, handle, size),
            Instant::now(),
            true,
        );
        state
            .surfaces
            .insert(surface, (id, Arc::downgrade(&buffer.record)));
        debug!("Imported surface {:?} as {:?}", surface, handle);
        Ok(buffer)
    }

    /// Drop one reference to `buffer`.
    ///
    /// Equivalent to dropping the handle; provided for call sites that want
    /// the release to be explicit.
    pub fn release(&self, buffer: Buffer) {
        drop(buffer);
    }

    /// Refresh the buffer's last-touched timestamp.
    pub fn timestamp(&self, buffer: &Buffer) {
        buffer.touch(Instant::now());
    }

    /// Called when the last reference to a record goes away.
    pub(crate) fn reclaim(
        &self,
        id: BufferId,
        descriptor: BufferDescriptor,
        created_at: Instant,
        last_touched: Instant,
        prefer_deletion: bool,
    ) {
        let mut state = self.lock();
        state.in_use.remove(&id);
        let now = Instant::now();
        let idle = now.saturating_duration_since(last_touched);
        if idle > self.config.retention {
            debug!("Buffer {:?} was idle {:?} before release", id, idle);
        }

        if descriptor.is_external() {
            if let Some(surface) = descriptor.local_surface {
                if state.surfaces.get(&surface).is_some_and(|(owner, _)| *owner == id) {
                    state.surfaces.remove(&surface);
                }
                state.allocator.unbind_surface(descriptor.handle);
            }
            debug!("Released external buffer {:?}", id);
            return;
        }

        if prefer_deletion || state.shut_down {
            state.destroy(descriptor.handle);
            return;
        }

        state
            .free
            .entry(PoolKey::from_descriptor(&descriptor))
            .or_default()
            .push(FreeEntry {
                handle: descriptor.handle,
                created_at,
                returned_at: now,
            });
    }

    /// Evict free buffers older than the retention threshold and trim the
    /// free set to `max_free`. Returns the number of destroyed resources.
    pub fn housekeeping(&self) -> usize {
        self.housekeeping_at(Instant::now())
    }

    /// Housekeeping as of `now`.
    pub fn housekeeping_at(&self, now: Instant) -> usize {
        let mut state = self.lock();
        state.passes += 1;
        let retention = self.config.retention;

        let mut survivors: Vec<(PoolKey, FreeEntry)> = Vec::new();
        let mut expired = Vec::new();
        for (key, entries) in state.free.drain() {
            for entry in entries {
                if now.saturating_duration_since(entry.returned_at) > retention {
                    expired.push(entry.handle);
                } else {
                    survivors.push((key, entry));
                }
            }
        }

        if survivors.len() > self.config.max_free {
            survivors.sort_by(|a, b| b.1.returned_at.cmp(&a.1.returned_at));
            expired.extend(
                survivors
                    .drain(self.config.max_free..)
                    .map(|(_, entry)| entry.handle),
            );
        }

        // Oldest first, so LIFO reuse in acquire picks the freshest entry.
        survivors.sort_by(|a, b| a.1.returned_at.cmp(&b.1.returned_at));
        for (key, entry) in survivors {
            state.free.entry(key).or_default().push(entry);
        }

        let evicted = expired.len();
        for handle in expired {
            state.destroy(handle);
        }
        if evicted > 0 {
            debug!("Housekeeping evicted {} idle textures", evicted);
        }
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            free: state.free_count(),
            in_use: state.in_use.len(),
            external: state
                .in_use
                .values()
                .filter(|b| **b == GpuBacking::External)
                .count(),
            created: state.created,
            destroyed: state.destroyed,
            passes: state.passes,
        }
    }

    /// Destroy every free resource and stop handing out buffers.
    ///
    /// Buffers still referenced are destroyed when released.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let handles: Vec<NativeHandle> = state
            .free
            .drain()
            .flat_map(|(_, entries)| entries.into_iter().map(|e| e.handle))
            .collect();
        for handle in &handles {
            state.destroy(*handle);
        }
        if !state.in_use.is_empty() {
            warn!(
                "Buffer pool shut down with {} buffers still referenced",
                state.in_use.len()
            );
        }
        info!("Buffer pool shut down, destroyed {} free textures", handles.len());
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
