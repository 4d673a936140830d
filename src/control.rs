//! Control surface: start/stop the clock, rewind, and drive effect inputs.

use crate::buffer::BufferPool;
use crate::clock::{ClockState, RefreshClock};
use crate::effect::ParamValue;
use crate::error::{ClockError, EffectError};
use crate::pipeline::{FramePipeline, PipelineStats};
use std::sync::Arc;
use tracing::info;

/// Binds one refresh clock to one pipeline for a rendering session.
pub struct Controller<C: RefreshClock> {
    clock: C,
    pipeline: Arc<FramePipeline>,
}

impl<C: RefreshClock> Controller<C> {
    pub fn new(clock: C, pipeline: Arc<FramePipeline>) -> Self {
        Self { clock, pipeline }
    }

    /// Start delivering ticks to the pipeline.
    pub fn start(&mut self) -> Result<(), ClockError> {
        let pipeline = self.pipeline.clone();
        self.clock.start(Box::new(move |time| {
            pipeline.tick(time);
        }))?;
        info!("Rendering started");
        Ok(())
    }

    /// Stop the clock. No tick runs after this returns.
    pub fn stop(&mut self) {
        if self.clock.state() == ClockState::Running {
            self.clock.stop();
            info!("Rendering stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.clock.state() == ClockState::Running
    }

    /// Seek the video back to its first frame.
    pub fn rewind(&self) {
        self.pipeline.rewind();
    }

    /// Map `t` in `[0, 1]` onto the named input's declared range.
    pub fn set_slider(&self, name: &str, t: f32) -> Result<(), EffectError> {
        self.pipeline.parameters().set_normalized(name, t)
    }

    pub fn set_parameter(&self, name: &str, value: ParamValue) -> Result<(), EffectError> {
        self.pipeline.parameters().set(name, value)
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        self.pipeline.pool()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Stop the clock and release every pooled texture.
    ///
    /// Buffers still held elsewhere are destroyed when their last handle drops.
    pub fn shutdown(mut self) {
        self.stop();
        self.pipeline.pool().shutdown();
        info!("Session shut down: {:?}", self.pipeline.pool().stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PoolConfig, Size, SurfaceId};
    use crate::clock::{HostTime, ManualClock};
    use crate::effect::{EffectDefinition, EffectStage};
    use crate::import::SurfaceImporter;
    use crate::testing::{RecordingAllocator, RecordingEngine, RecordingPublisher, ScriptedSource};
    use std::time::Duration;

    const DEF: &str = "name: Fade\ninputs:\n  - {name: amount, type: float, min: -1.0, max: 1.0}\n";

    fn controller() -> (Controller<ManualClock>, RecordingPublisher, RecordingAllocator) {
        let allocator = RecordingAllocator::new();
        allocator.add_surface(SurfaceId(1), Size::new(16, 16));
        let pool = BufferPool::new(Box::new(allocator.clone()), PoolConfig::default());
        let source = ScriptedSource::new().with_frame(Duration::ZERO, Some(SurfaceId(1)));
        let publisher = RecordingPublisher::new();
        let effect = EffectStage::new(
            EffectDefinition::from_yaml(DEF).unwrap(),
            Box::new(RecordingEngine::new()),
            pool.clone(),
            Size::new(16, 16),
        );
        let pipeline = FramePipeline::new(
            SurfaceImporter::new(Box::new(source), pool.clone()),
            effect,
            Box::new(publisher.clone()),
            pool,
            false,
        );
        (
            Controller::new(ManualClock::new(), Arc::new(pipeline)),
            publisher,
            allocator,
        )
    }

    #[test]
    fn test_ticks_reach_pipeline_only_while_running() {
        let (mut controller, publisher, _) = controller();
        controller.set_slider("amount", 0.5).unwrap();

        controller.clock().tick(HostTime::ZERO);
        assert_eq!(controller.stats().ticks, 0);

        controller.start().unwrap();
        controller.clock().tick(HostTime::ZERO);
        assert_eq!(publisher.frames().len(), 1);

        controller.stop();
        controller.clock().tick(HostTime::from_millis(16));
        assert_eq!(controller.stats().ticks, 1);
    }

    #[test]
    fn test_double_start_is_an_error() {
        let (mut controller, _, _) = controller();
        controller.start().unwrap();
        assert!(matches!(controller.start(), Err(ClockError::AlreadyRunning)));
        controller.stop();
        assert!(controller.start().is_ok());
    }

    #[test]
    fn test_rewind_and_slider() {
        let (mut controller, publisher, _) = controller();
        controller.start().unwrap();
        controller.set_slider("amount", 0.75).unwrap();
        assert_eq!(
            controller.pipeline.parameters().get("amount"),
            Some(ParamValue::Float(0.5))
        );
        assert!(controller.set_slider("missing", 0.1).is_err());

        controller.clock().tick(HostTime::ZERO);
        controller.clock().tick(HostTime::ZERO);
        controller.rewind();
        controller.clock().tick(HostTime::ZERO);
        assert_eq!(publisher.frames().len(), 2);
    }

    #[test]
    fn test_shutdown_releases_pool() {
        let (mut controller, _, allocator) = controller();
        controller.set_slider("amount", 0.0).unwrap();
        controller.start().unwrap();
        controller.clock().tick(HostTime::ZERO);
        controller.shutdown();
        assert_eq!(allocator.destroyed().len(), 1);
    }
}
