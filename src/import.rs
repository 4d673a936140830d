//! Zero-copy import of decoded video surfaces.

use crate::buffer::{Buffer, BufferPool, SurfaceId};
use crate::clock::HostTime;
use crate::error::ImportError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A decoded frame handed out by a [`VideoSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Presentation time of the frame on the media timeline
    pub item_time: Duration,
    /// Native surface backing the frame, if the decoder exposes one
    pub surface: Option<SurfaceId>,
}

/// Decoder boundary. Frames are requested by display time, not polled as a queue.
pub trait VideoSource: Send {
    /// Map a host (display) time onto the media timeline.
    fn item_time_for_host_time(&mut self, host_time: HostTime) -> Duration;

    /// Whether a frame newer than the last one taken is due at `item_time`.
    fn has_new_frame(&mut self, item_time: Duration) -> bool;

    /// Take the newest frame due at `item_time`.
    fn take_frame(&mut self, item_time: Duration) -> Option<DecodedFrame>;

    /// Seek back to the start of the media.
    fn rewind(&mut self);
}

/// Result of an import attempt.
#[derive(Debug)]
pub enum Import {
    /// A new frame, wrapped as an external buffer
    Frame(Buffer),
    /// No new frame for this tick (expected, not an error)
    Unavailable,
}

/// Wraps decoded surfaces as external [`Buffer`]s without copying.
pub struct SurfaceImporter {
    source: Box<dyn VideoSource>,
    pool: Arc<BufferPool>,
}

impl SurfaceImporter {
    pub fn new(source: Box<dyn VideoSource>, pool: Arc<BufferPool>) -> Self {
        Self { source, pool }
    }

    /// Import the frame due at `host_time`, if any.
    pub fn import(&mut self, host_time: HostTime) -> Result<Import, ImportError> {
        let item_time = self.source.item_time_for_host_time(host_time);
        if !self.source.has_new_frame(item_time) {
            return Ok(Import::Unavailable);
        }
        let Some(frame) = self.source.take_frame(item_time) else {
            debug!("Decoder reported a frame at {:?} but returned none", item_time);
            return Ok(Import::Unavailable);
        };
        let surface = frame
            .surface
            .ok_or(ImportError::NoSurface(frame.item_time))?;

        let buffer = self.pool.import_external(surface)?;
        Ok(Import::Frame(buffer))
    }

    pub fn rewind(&mut self) {
        self.source.rewind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PoolConfig, Size};
    use crate::testing::{RecordingAllocator, ScriptedSource};

    fn importer(source: ScriptedSource) -> (SurfaceImporter, Arc<BufferPool>, RecordingAllocator) {
        let allocator = RecordingAllocator::new();
        allocator.add_surface(SurfaceId(1), Size::new(1280, 720));
        let pool = BufferPool::new(Box::new(allocator.clone()), PoolConfig::default());
        (SurfaceImporter::new(Box::new(source), pool.clone()), pool, allocator)
    }

    #[test]
    fn test_no_frame_is_unavailable() {
        let (mut importer, pool, _) = importer(ScriptedSource::new());
        let result = importer.import(HostTime::from_millis(0)).unwrap();
        assert!(matches!(result, Import::Unavailable));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_due_frame_imports_external_buffer() {
        let source = ScriptedSource::new().with_frame(Duration::from_millis(16), Some(SurfaceId(1)));
        let (mut importer, pool, _) = importer(source);

        assert!(matches!(importer.import(HostTime::from_millis(0)).unwrap(), Import::Unavailable));
        let Import::Frame(buffer) = importer.import(HostTime::from_millis(16)).unwrap() else {
            panic!("expected a frame at 16ms");
        };
        assert!(buffer.is_external());
        assert_eq!(buffer.descriptor().local_surface, Some(SurfaceId(1)));
        assert_eq!(pool.stats().external, 1);
    }

    #[test]
    fn test_frame_without_surface_is_import_failure() {
        let source = ScriptedSource::new().with_frame(Duration::ZERO, None);
        let (mut importer, pool, _) = importer(source);
        let result = importer.import(HostTime::ZERO);
        assert!(matches!(result, Err(ImportError::NoSurface(_))));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_unbound_surface_is_import_failure() {
        let source = ScriptedSource::new().with_frame(Duration::ZERO, Some(SurfaceId(99)));
        let (mut importer, _, _) = importer(source);
        assert!(matches!(importer.import(HostTime::ZERO), Err(ImportError::Pool(_))));
    }

    #[test]
    fn test_rewind_replays_frames() {
        let source = ScriptedSource::new().with_frame(Duration::ZERO, Some(SurfaceId(1)));
        let (mut importer, _, _) = importer(source);
        assert!(matches!(importer.import(HostTime::ZERO).unwrap(), Import::Frame(_)));
        assert!(matches!(importer.import(HostTime::ZERO).unwrap(), Import::Unavailable));

        importer.rewind();
        assert!(matches!(importer.import(HostTime::ZERO).unwrap(), Import::Frame(_)));
    }
}
