//! In-memory fakes for the pool allocator, decoder, effect engine and
//! publisher boundaries.

use crate::buffer::{BufferDescriptor, NativeHandle, Size, SurfaceId, TextureAllocator};
use crate::clock::HostTime;
use crate::effect::{EffectEngine, ParamBlock, RenderRequest};
use crate::error::{EffectError, PoolError, PublishError};
use crate::import::{DecodedFrame, VideoSource};
use crate::output::{PublishedFrame, Publisher};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct AllocatorLog {
    next_handle: u64,
    fail: bool,
    surfaces: HashMap<SurfaceId, Size>,
    allocated: Vec<NativeHandle>,
    destroyed: Vec<NativeHandle>,
    bound: Vec<(SurfaceId, NativeHandle)>,
    unbound: Vec<NativeHandle>,
}

/// Allocator handing out sequential handles and recording every call.
#[derive(Clone, Default)]
pub struct RecordingAllocator {
    log: Arc<Mutex<AllocatorLog>>,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_surface(&self, surface: SurfaceId, size: Size) {
        lock(&self.log).surfaces.insert(surface, size);
    }

    pub fn fail_allocations(&self, fail: bool) {
        lock(&self.log).fail = fail;
    }

    pub fn allocated(&self) -> Vec<NativeHandle> {
        lock(&self.log).allocated.clone()
    }

    pub fn destroyed(&self) -> Vec<NativeHandle> {
        lock(&self.log).destroyed.clone()
    }

    pub fn bound(&self) -> Vec<(SurfaceId, NativeHandle)> {
        lock(&self.log).bound.clone()
    }

    pub fn unbound(&self) -> Vec<NativeHandle> {
        lock(&self.log).unbound.clone()
    }
}

impl TextureAllocator for RecordingAllocator {
    fn allocate(&mut self, desc: &BufferDescriptor) -> Result<NativeHandle, PoolError> {
        let mut log = lock(&self.log);
        if log.fail {
            return Err(PoolError::allocation(desc, "allocation disabled"));
        }
        log.next_handle += 1;
        let handle = NativeHandle(log.next_handle);
        log.allocated.push(handle);
        Ok(handle)
    }

    fn destroy(&mut self, handle: NativeHandle) {
        lock(&self.log).destroyed.push(handle);
    }

    fn bind_surface(&mut self, surface: SurfaceId) -> Result<(NativeHandle, Size), PoolError> {
        let mut log = lock(&self.log);
        let size = *log
            .surfaces
            .get(&surface)
            .ok_or(PoolError::UnknownSurface(surface))?;
        log.next_handle += 1;
        let handle = NativeHandle(1000 + log.next_handle);
        log.bound.push((surface, handle));
        Ok((handle, size))
    }

    fn unbind_surface(&mut self, handle: NativeHandle) {
        lock(&self.log).unbound.push(handle);
    }
}

/// Decoder with a fixed list of frames. Item time equals host time.
#[derive(Default)]
pub struct ScriptedSource {
    frames: Vec<DecodedFrame>,
    cursor: usize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame(mut self, item_time: Duration, surface: Option<SurfaceId>) -> Self {
        self.frames.push(DecodedFrame { item_time, surface });
        self.frames.sort_by_key(|f| f.item_time);
        self
    }
}

impl VideoSource for ScriptedSource {
    fn item_time_for_host_time(&mut self, host_time: HostTime) -> Duration {
        host_time.as_duration()
    }

    fn has_new_frame(&mut self, item_time: Duration) -> bool {
        self.frames
            .get(self.cursor)
            .is_some_and(|f| f.item_time <= item_time)
    }

    fn take_frame(&mut self, item_time: Duration) -> Option<DecodedFrame> {
        let mut newest = None;
        while let Some(frame) = self.frames.get(self.cursor) {
            if frame.item_time > item_time {
                break;
            }
            newest = Some(*frame);
            self.cursor += 1;
        }
        newest
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }
}

#[derive(Default)]
struct EngineLog {
    renders: usize,
    fail: bool,
    last_params: Option<ParamBlock>,
}

/// Engine that records renders without touching a GPU.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    log: Arc<Mutex<EngineLog>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renders(&self) -> usize {
        lock(&self.log).renders
    }

    pub fn last_params(&self) -> Option<ParamBlock> {
        lock(&self.log).last_params
    }

    pub fn fail_renders(&self, fail: bool) {
        lock(&self.log).fail = fail;
    }
}

impl EffectEngine for RecordingEngine {
    fn render(&mut self, request: &RenderRequest<'_>) -> Result<(), EffectError> {
        let mut log = lock(&self.log);
        if log.fail {
            return Err(EffectError::Engine("render disabled".into()));
        }
        log.renders += 1;
        log.last_params = Some(request.params);
        Ok(())
    }
}

#[derive(Default)]
struct PublisherLog {
    frames: Vec<PublishedFrame>,
    fail: bool,
}

/// Publisher that records every published frame.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    log: Arc<Mutex<PublisherLog>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<PublishedFrame> {
        lock(&self.log).frames.clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.log).fail = fail;
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, frame: &PublishedFrame) -> Result<(), PublishError> {
        let mut log = lock(&self.log);
        if log.fail {
            return Err(PublishError::Readback("publish disabled".into()));
        }
        log.frames.push(*frame);
        Ok(())
    }
}
