//! Per-refresh orchestration: import, render, publish, housekeeping.

use crate::buffer::BufferPool;
use crate::clock::HostTime;
use crate::effect::{EffectStage, ParameterHandle};
use crate::error::{EffectError, ImportError, PublishError};
use crate::import::{Import, SurfaceImporter};
use crate::output::{PublishedFrame, Publisher};
use crate::utils::FpsCounter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, error, warn};

/// Which stage of a tick failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Import,
    Allocation,
    Render,
    Publish,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous tick was still running; this one did nothing.
    Busy,
    /// No new frame was due.
    Dropped,
    Published,
    Failed(FailureKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ticks: u64,
    pub published: u64,
    pub dropped: u64,
    pub busy: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    busy: AtomicU64,
    failed: AtomicU64,
}

/// Everything that touches the GPU context. Only one tick holds it at a time.
struct PipelineState {
    importer: SurfaceImporter,
    effect: EffectStage,
    publisher: Box<dyn Publisher>,
    fps: FpsCounter,
}

impl PipelineState {
    fn run(&mut self, host_time: HostTime, pool: &BufferPool, flipped: bool) -> TickOutcome {
        let input = match self.importer.import(host_time) {
            Ok(Import::Frame(buffer)) => buffer,
            Ok(Import::Unavailable) => return TickOutcome::Dropped,
            Err(e) => {
                warn!("Import failed at {:?}: {}", host_time, e);
                return TickOutcome::Failed(import_failure(&e));
            }
        };

        let rendered = self.effect.render(&input);
        pool.release(input);
        let output = match rendered {
            Ok(output) => output,
            Err(e) => {
                let kind = render_failure(&e);
                match kind {
                    FailureKind::Allocation => warn!("Output allocation failed: {}", e),
                    _ => error!("Render failed: {}", e),
                }
                return TickOutcome::Failed(kind);
            }
        };

        let frame = PublishedFrame {
            texture: output.handle(),
            target: output.descriptor().target,
            region: output.src_rect(),
            dimensions: output.size(),
            flipped,
        };
        let published = self.publisher.publish(&frame);
        pool.release(output);

        match published {
            Ok(()) => {
                if let Some(fps) = self.fps.update() {
                    debug!("[Perf] published {:.1} fps", fps);
                }
                TickOutcome::Published
            }
            Err(e) => {
                warn!("Publish failed: {}", e);
                TickOutcome::Failed(publish_failure(&e))
            }
        }
    }
}

fn import_failure(_: &ImportError) -> FailureKind {
    FailureKind::Import
}

fn render_failure(e: &EffectError) -> FailureKind {
    match e {
        EffectError::Pool(_) => FailureKind::Allocation,
        _ => FailureKind::Render,
    }
}

fn publish_failure(_: &PublishError) -> FailureKind {
    FailureKind::Publish
}

/// Drives one import, render and publish per refresh tick.
pub struct FramePipeline {
    state: Mutex<PipelineState>,
    pool: Arc<BufferPool>,
    parameters: ParameterHandle,
    flipped: bool,
    counters: Counters,
}

impl FramePipeline {
    pub fn new(
        importer: SurfaceImporter,
        effect: EffectStage,
        publisher: Box<dyn Publisher>,
        pool: Arc<BufferPool>,
        flipped: bool,
    ) -> Self {
        let parameters = effect.parameters();
        Self {
            state: Mutex::new(PipelineState {
                importer,
                effect,
                publisher,
                fps: FpsCounter::new(),
            }),
            pool,
            parameters,
            flipped,
            counters: Counters::default(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one tick for `host_time`.
    ///
    /// Never runs concurrently with another tick: an overlapping call returns
    /// [`TickOutcome::Busy`] without doing any work. Housekeeping runs at the
    /// end of every non-busy tick, whether or not a frame was published.
    pub fn tick(&self, host_time: HostTime) -> TickOutcome {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("Previous tick still running, dropping tick at {:?}", host_time);
                self.counters.busy.fetch_add(1, Ordering::Relaxed);
                return TickOutcome::Busy;
            }
        };

        let outcome = state.run(host_time, &self.pool, self.flipped);
        let evicted = self.pool.housekeeping();
        drop(state);

        if evicted > 0 {
            debug!("Housekeeping evicted {} buffers", evicted);
        }
        let counter = match outcome {
            TickOutcome::Published => &self.counters.published,
            TickOutcome::Dropped => &self.counters.dropped,
            TickOutcome::Failed(_) => &self.counters.failed,
            TickOutcome::Busy => &self.counters.busy,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Seek the video source back to its start. Waits for an in-flight tick.
    pub fn rewind(&self) {
        let mut state = self.lock_state();
        state.importer.rewind();
        state.fps.reset();
    }

    pub fn parameters(&self) -> ParameterHandle {
        self.parameters.clone()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
