//! Linux virtual camera publisher using v4l2loopback.
//!
//! Reads the published texture back to the CPU, converts it to YUYV and
//! writes it to a v4l2loopback device. Requires the v4l2loopback kernel
//! module to be loaded.

use super::{PublishedFrame, Publisher};
use crate::error::PublishError;
use crate::gpu::{read_texture, GpuContext, TextureTable};
use crate::frame::VideoFrame;
use crate::utils::FpsCounter;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default v4l2loopback device path.
pub const DEFAULT_DEVICE: &str = "/dev/video10";

// V4L2 Constants
const VIDIOC_S_FMT: u64 = 0xC0D05605; // _IOWR('V', 5, struct v4l2_format)
const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_PIX_FMT_YUYV: u32 = 0x56595559; // 'Y' 'U' 'Y' 'V'

#[repr(C)]
struct v4l2_format {
    type_: u32,
    fmt: v4l2_format_union,
}

#[repr(C)]
union v4l2_format_union {
    pix: v4l2_pix_format,
    raw_data: [u8; 200],
    _align: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct v4l2_pix_format {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

/// Device settings for the virtual camera.
#[derive(Debug, Clone)]
pub struct VirtualCameraConfig {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            width: 1280,
            height: 720,
        }
    }
}

/// Publisher writing frames to a v4l2loopback device.
pub struct VirtualCameraPublisher {
    config: VirtualCameraConfig,
    device: File,
    gpu: GpuContext,
    table: TextureTable,
    fps: FpsCounter,
}

impl VirtualCameraPublisher {
    pub fn new(
        config: VirtualCameraConfig,
        gpu: GpuContext,
        table: TextureTable,
    ) -> Result<Self, PublishError> {
        let device = Self::open_and_configure_device(&config)?;

        info!(
            "Virtual camera publisher on {} ({}x{}, YUYV)",
            config.device.display(),
            config.width,
            config.height
        );

        Ok(Self {
            config,
            device,
            gpu,
            table,
            fps: FpsCounter::new(),
        })
    }

    fn open_and_configure_device(config: &VirtualCameraConfig) -> Result<File, PublishError> {
        let path = &config.device;
        if !path.exists() {
            return Err(PublishError::Device(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "v4l2loopback device '{}' not found, load it with: \
                     sudo modprobe v4l2loopback devices=1 video_nr=10 exclusive_caps=1",
                    path.display()
                ),
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        let pix = v4l2_pix_format {
            width: config.width,
            height: config.height,
            pixelformat: V4L2_PIX_FMT_YUYV,
            field: 0,
            bytesperline: config.width * 2,
            sizeimage: config.width * config.height * 2,
            colorspace: 8, // V4L2_COLORSPACE_SRGB
            priv_: 0,
            flags: 0,
            ycbcr_enc: 0,
            quantization: 0,
            xfer_func: 0,
        };
        let mut fmt = v4l2_format {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            fmt: v4l2_format_union { pix },
        };

        // SAFETY: fd is open for the lifetime of `file`, `fmt` matches the
        // kernel's struct v4l2_format layout.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), VIDIOC_S_FMT as _, &mut fmt) };
        if rc < 0 {
            warn!(
                "Failed to set v4l2 format: {}. Output might be incorrect.",
                std::io::Error::last_os_error()
            );
        } else {
            debug!("Set v4l2 format to YUYV {}x{}", config.width, config.height);
        }

        Ok(file)
    }
}

/// Put a read-back frame in v4l2 order (top row first) and convert it to YUYV.
///
/// `flipped` marks a frame stored bottom-up.
fn device_frame(
    mut rgba: VideoFrame,
    flipped: bool,
    expected: (u32, u32),
) -> Result<VideoFrame, PublishError> {
    if flipped {
        rgba.flip_vertical();
    }
    if (rgba.width, rgba.height) != expected {
        return Err(PublishError::Readback(format!(
            "frame is {}x{}, device expects {}x{}",
            rgba.width, rgba.height, expected.0, expected.1
        )));
    }
    rgba.to_yuyv()
}

impl Publisher for VirtualCameraPublisher {
    fn publish(&mut self, frame: &PublishedFrame) -> Result<(), PublishError> {
        let texture = self
            .table
            .get(frame.texture)
            .ok_or(PublishError::MissingTexture(frame.texture))?;
        let rgba = {
            let _current = self.gpu.make_current();
            read_texture(&self.gpu.device, &self.gpu.queue, &texture, frame.region)?
        };
        let yuyv = device_frame(rgba, frame.flipped, (self.config.width, self.config.height))?;

        match self.device.write_all(&yuyv.data) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("v4l2loopback buffer full, frame dropped");
                return Ok(());
            }
            Err(e) => return Err(PublishError::Device(e)),
        }

        if let Some(fps) = self.fps.update() {
            debug!("[Perf] virtual camera: {:.1} fps", fps);
        }
        Ok(())
    }
}
