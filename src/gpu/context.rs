//! Shared GPU context for wgpu resources.

use crate::error::GpuError;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::info;

/// Exclusive right to issue work on the shared device.
///
/// Only one thread holds the context current at a time. Lock order is pool
/// state, then this lock, then texture tables.
#[derive(Clone, Default)]
pub struct CurrentLock(Arc<Mutex<()>>);

impl CurrentLock {
    /// Block until the context is current on this thread.
    pub fn make_current(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the context current unless another thread holds it.
    pub fn try_make_current(&self) -> Option<MutexGuard<'_, ()>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Device and queue shared by the pool allocator, the decoder, the effect
/// engine and publishers. Created once per session.
#[derive(Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
    pub current: CurrentLock,
}

impl GpuContext {
    /// Initialize a headless GPU context.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| GpuError::Adapter(format!("{:?}", e)))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("surfacefx Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| GpuError::Device(e.to_string()))?;

        let adapter_info = adapter.get_info();
        info!(
            "GPU context created on {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        Ok(Self {
            device,
            queue,
            adapter,
            current: CurrentLock::default(),
        })
    }

    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Shorthand for `self.current.make_current()`.
    pub fn make_current(&self) -> MutexGuard<'_, ()> {
        self.current.make_current()
    }
}
