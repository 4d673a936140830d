//! CPU-side frames read back from the GPU and their pixel conversions.

use crate::error::PublishError;

/// Supported pixel formats for CPU frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
    /// BGRA with 8 bits per channel (32 bits per pixel)
    Bgra,
    /// YUV 4:2:2 packed format (Y0 U0 Y1 V0)
    Yuyv,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
            PixelFormat::Yuyv => 2,
        }
    }
}

/// A tightly packed frame of pixel data.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Reverse row order in place (bottom-up to top-down and back).
    pub fn flip_vertical(&mut self) {
        let row = self.row_bytes();
        let rows = self.height as usize;
        if row == 0 || self.data.len() < row * rows {
            return;
        }
        for y in 0..rows / 2 {
            let (top, bottom) = self.data.split_at_mut((rows - 1 - y) * row);
            top[y * row..(y + 1) * row].swap_with_slice(&mut bottom[..row]);
        }
    }

    /// Converts this frame to RGBA. BGRA is swizzled, YUYV is rejected.
    pub fn to_rgba(&self) -> Result<VideoFrame, PublishError> {
        match self.format {
            PixelFormat::Rgba => Ok(self.clone()),
            PixelFormat::Bgra => {
                let mut data = self.data.clone();
                for px in data.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                Ok(VideoFrame::from_data(self.width, self.height, PixelFormat::Rgba, data))
            }
            PixelFormat::Yuyv => Err(PublishError::Conversion(
                "YUYV to RGBA is not supported".into(),
            )),
        }
    }

    /// Converts this frame to YUYV (YUV 4:2:2 packed) using ezk-image.
    pub fn to_yuyv(&self) -> Result<VideoFrame, PublishError> {
        if self.format == PixelFormat::Yuyv {
            return Ok(self.clone());
        }
        let rgba = self.to_rgba()?;

        let width = self.width as usize;
        let height = self.height as usize;
        let mut yuyv_data = vec![0u8; width * height * 2];

        let dst_color = ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
            transfer: ezk_image::ColorTransfer::Linear,
            primaries: ezk_image::ColorPrimaries::BT709,
            space: ezk_image::ColorSpace::BT709,
            full_range: false,
        });
        let src_color = ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
            transfer: ezk_image::ColorTransfer::Linear,
            primaries: ezk_image::ColorPrimaries::BT709,
        });

        {
            let mut dst_image = ezk_image::Image::from_buffer(
                ezk_image::PixelFormat::YUYV,
                &mut yuyv_data[..],
                None,
                width,
                height,
                dst_color,
            )
            .map_err(|e| PublishError::Conversion(format!("YUYV destination: {:?}", e)))?;
            let src_image = ezk_image::Image::from_buffer(
                ezk_image::PixelFormat::RGBA,
                &rgba.data[..],
                None,
                width,
                height,
                src_color,
            )
            .map_err(|e| PublishError::Conversion(format!("RGBA source: {:?}", e)))?;
            ezk_image::convert(&src_image, &mut dst_image)
                .map_err(|e| PublishError::Conversion(format!("{:?}", e)))?;
        }

        Ok(VideoFrame::from_data(
            self.width,
            self.height,
            PixelFormat::Yuyv,
            yuyv_data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_to_rgba_swizzle() {
        let frame = VideoFrame::from_data(2, 1, PixelFormat::Bgra, vec![0, 0, 255, 255, 255, 0, 0, 128]);
        let rgba = frame.to_rgba().unwrap();
        assert_eq!(rgba.format, PixelFormat::Rgba);
        assert_eq!(rgba.data, vec![255, 0, 0, 255, 0, 0, 255, 128]);
    }

    #[test]
    fn test_flip_vertical_reverses_rows() {
        let mut frame = VideoFrame::from_data(
            1,
            3,
            PixelFormat::Rgba,
            vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3],
        );
        frame.flip_vertical();
        assert_eq!(frame.data, vec![3, 3, 3, 3, 2, 2, 2, 2, 1, 1, 1, 1]);
        frame.flip_vertical();
        assert_eq!(&frame.data[..4], &[1, 1, 1, 1]);
    }

    #[test]
    fn test_flip_ignores_truncated_frame() {
        let mut frame = VideoFrame::from_data(2, 2, PixelFormat::Rgba, vec![7; 4]);
        frame.flip_vertical();
        assert_eq!(frame.data, vec![7; 4]);
    }

    #[test]
    fn test_to_yuyv_halves_frame_size() {
        let frame = VideoFrame::from_data(4, 2, PixelFormat::Rgba, vec![128; 4 * 2 * 4]);
        let yuyv = frame.to_yuyv().unwrap();
        assert_eq!(yuyv.format, PixelFormat::Yuyv);
        assert_eq!(yuyv.data.len(), 4 * 2 * 2);
    }
}
