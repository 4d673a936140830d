//! Error taxonomy for the frame pipeline.
//!
//! Per-tick failures (import, allocation, render, publish) are recovered by
//! skipping the tick. Only session setup failures (GPU context creation,
//! clock start) are fatal to a rendering session.

use crate::buffer::{BufferDescriptor, SurfaceId};
use thiserror::Error;

/// Errors raised by the buffer pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to allocate {width}x{height} {format:?} texture: {reason}")]
    Allocation {
        width: u32,
        height: u32,
        format: crate::buffer::InternalFormat,
        reason: String,
    },
    #[error("surface {0:?} has no accessible native texture")]
    UnknownSurface(SurfaceId),
    #[error("descriptor is not external-backed: {0:?}")]
    NotExternal(Box<BufferDescriptor>),
    #[error("buffer pool has been shut down")]
    ShutDown,
}

impl PoolError {
    pub fn allocation(desc: &BufferDescriptor, reason: impl Into<String>) -> Self {
        PoolError::Allocation {
            width: desc.size.width,
            height: desc.size.height,
            format: desc.internal_format,
            reason: reason.into(),
        }
    }
}

/// Errors raised while importing a decoded frame.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("decoded frame at {0:?} has no backing surface")]
    NoSurface(std::time::Duration),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors raised while opening a video source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to probe {path}: {reason}")]
    Probe { path: String, reason: String },
    #[error("failed to start decoder: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the effect stage and effect engines.
#[derive(Debug, Error)]
pub enum EffectError {
    #[error("failed to read effect definition {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid effect definition: {0}")]
    Definition(String),
    #[error("effect has no input named '{0}'")]
    UnknownInput(String),
    #[error("input '{name}' expects {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("required input '{0}' has no value")]
    MissingInput(String),
    #[error("shader translation failed: {0}")]
    Shader(String),
    #[error("effect engine rejected render: {0}")]
    Engine(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors raised by refresh clocks.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("refresh clock is already running")]
    AlreadyRunning,
    #[error("hardware refresh clock unavailable: {0}")]
    Unavailable(String),
    #[error("failed to spawn clock thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised by publishers.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("texture {0:?} is not resident")]
    MissingTexture(crate::buffer::NativeHandle),
    #[error("readback failed: {0}")]
    Readback(String),
    #[error("pixel conversion failed: {0}")]
    Conversion(String),
    #[error("output device error: {0}")]
    Device(#[from] std::io::Error),
}

/// Errors raised while creating GPU resources.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to obtain GPU adapter: {0}")]
    Adapter(String),
    #[error("failed to create GPU device: {0}")]
    Device(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Umbrella error for session-level operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
