//! Publishers that hand rendered textures to external consumers.

#[cfg(target_os = "linux")]
pub mod virtual_camera_linux;

#[cfg(target_os = "linux")]
pub use virtual_camera_linux::{VirtualCameraConfig, VirtualCameraPublisher};

use crate::buffer::{NativeHandle, Rect, Size, TextureTarget};
use crate::error::PublishError;
use tracing::debug;

/// One rendered frame as seen by a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedFrame {
    pub texture: NativeHandle,
    pub target: TextureTarget,
    /// Region of the texture holding the image
    pub region: Rect,
    pub dimensions: Size,
    /// Rows are stored bottom-up. Rendered effect output is top-down, so
    /// publishers flip only when this is set.
    pub flipped: bool,
}

/// GPU frame-sharing boundary. Called on the render thread, fire-and-forget.
pub trait Publisher: Send {
    fn publish(&mut self, frame: &PublishedFrame) -> Result<(), PublishError>;
}

/// Publisher that only logs what it would share.
#[derive(Debug, Default)]
pub struct LogPublisher {
    published: u64,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl Publisher for LogPublisher {
    fn publish(&mut self, frame: &PublishedFrame) -> Result<(), PublishError> {
        self.published += 1;
        debug!(
            "Publish #{} {:?} {}x{} region {:?} flipped={}",
            self.published,
            frame.texture,
            frame.dimensions.width,
            frame.dimensions.height,
            frame.region,
            frame.flipped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_publisher_counts_frames() {
        let mut publisher = LogPublisher::new();
        let frame = PublishedFrame {
            texture: NativeHandle(3),
            target: TextureTarget::Texture2D,
            region: Rect::from_size(Size::new(8, 8)),
            dimensions: Size::new(8, 8),
            flipped: true,
        };
        publisher.publish(&frame).unwrap();
        publisher.publish(&frame).unwrap();
        assert_eq!(publisher.published(), 2);
    }
}
