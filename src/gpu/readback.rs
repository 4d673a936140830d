use crate::buffer::Rect;
use crate::error::PublishError;
use crate::frame::{PixelFormat, VideoFrame};

const ROW_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * 4;
    unpadded.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
}

/// Copy `region` of an 8-bit, 4-channel texture into CPU memory.
///
/// Blocks until the GPU has finished all submitted work touching the texture.
pub fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    region: Rect,
) -> Result<VideoFrame, PublishError> {
    let format = match texture.format() {
        wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Rgba8UnormSrgb => PixelFormat::Rgba,
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb => PixelFormat::Bgra,
        other => {
            return Err(PublishError::Readback(format!(
                "unsupported texture format {:?}",
                other
            )))
        }
    };
    if region.width == 0
        || region.height == 0
        || region.x + region.width > texture.width()
        || region.y + region.height > texture.height()
    {
        return Err(PublishError::Readback(format!(
            "region {:?} outside {}x{} texture",
            region,
            texture.width(),
            texture.height()
        )));
    }

    let padded = padded_row_bytes(region.width);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Readback Buffer"),
        size: padded as wgpu::BufferAddress * region.height as wgpu::BufferAddress,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Readback Encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d {
                x: region.x,
                y: region.y,
                z: 0,
            },
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(region.height),
            },
        },
        wgpu::Extent3d {
            width: region.width,
            height: region.height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(std::iter::once(encoder.finish()));

    let slice = buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| PublishError::Readback(e.to_string()))?;
    receiver
        .recv()
        .map_err(|e| PublishError::Readback(e.to_string()))?
        .map_err(|e| PublishError::Readback(e.to_string()))?;

    let row = (region.width * 4) as usize;
    let mut data = Vec::with_capacity(row * region.height as usize);
    {
        let mapped = slice.get_mapped_range();
        for chunk in mapped.chunks(padded as usize) {
            data.extend_from_slice(&chunk[..row]);
        }
    }
    buffer.unmap();

    Ok(VideoFrame::from_data(region.width, region.height, format, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_padding() {
        assert_eq!(padded_row_bytes(64), 256);
        assert_eq!(padded_row_bytes(65), 512);
        assert_eq!(padded_row_bytes(1280), 5120);
    }
}
