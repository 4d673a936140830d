//! Video decoding via the `ffmpeg` command-line tool.
//!
//! A background thread pipes raw BGRA frames out of an `ffmpeg` subprocess.
//! Frames are uploaded into a small ring of decoder-owned GPU surfaces when
//! taken, and those surfaces are what the importer wraps as external buffers.

use crate::buffer::SurfaceId;
use crate::clock::HostTime;
use crate::error::SourceError;
use crate::gpu::{GpuContext, SurfaceRegistry};
use crate::import::{DecodedFrame, VideoSource};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Surfaces in the upload ring. A surface is rewritten only after two newer
/// frames have been taken.
const SURFACE_RING: usize = 3;

/// Stream metadata reported by ffprobe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    /// Zero when the container does not report one
    pub duration: f32,
}

fn parse_fps(s: &str) -> Option<f32> {
    if let Some((num, den)) = s.split_once('/') {
        let n: f32 = num.trim().parse().ok()?;
        let d: f32 = den.trim().parse().ok()?;
        if d == 0.0 {
            None
        } else {
            Some(n / d)
        }
    } else {
        s.trim().parse().ok()
    }
}

/// Parse `width,height,r_frame_rate,duration` CSV output. Duration may be
/// `N/A` for streams.
fn parse_probe(output: &str) -> Option<ProbeInfo> {
    let parts: Vec<&str> = output.trim().split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    let width = parts[0].parse().ok()?;
    let height = parts[1].parse().ok()?;

    let mut fps = None;
    let mut duration = 0.0;
    for part in &parts[2..] {
        if part.contains('/') {
            fps = parse_fps(part).or(fps);
        } else if let Ok(d) = part.parse::<f32>() {
            duration = d;
        }
    }
    Some(ProbeInfo {
        width,
        height,
        fps: fps.filter(|f| *f > 0.0).unwrap_or(30.0),
        duration,
    })
}

fn probe(path: &Path) -> Result<ProbeInfo, SourceError> {
    let probe_err = |reason: String| SourceError::Probe {
        path: path.display().to_string(),
        reason,
    };
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()?;
    if !output.status.success() {
        return Err(probe_err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe(&stdout).ok_or_else(|| probe_err(format!("unexpected ffprobe output '{}'", stdout.trim())))
}

/// A raw BGRA frame from the decode thread.
struct RawFrame {
    generation: u64,
    timestamp: Duration,
    data: Vec<u8>,
}

/// Selects the newest due frame out of the decoder channel.
struct FrameQueue {
    rx: Receiver<RawFrame>,
    generation: Arc<AtomicU64>,
    due: Option<RawFrame>,
    next: Option<RawFrame>,
}

impl FrameQueue {
    fn new(rx: Receiver<RawFrame>, generation: Arc<AtomicU64>) -> Self {
        Self {
            rx,
            generation,
            due: None,
            next: None,
        }
    }

    /// Drain the channel up to `item_time`, keeping only the newest due frame.
    fn poll(&mut self, item_time: Duration) {
        let current = self.generation.load(Ordering::Acquire);
        if let Some(next) = self.next.take() {
            if next.generation != current {
                // stale
            } else if next.timestamp <= item_time {
                self.due = Some(next);
            } else {
                self.next = Some(next);
                return;
            }
        }
        loop {
            match self.rx.try_recv() {
                Ok(frame) if frame.generation != current => continue,
                Ok(frame) if frame.timestamp <= item_time => {
                    if self.due.is_some() {
                        debug!("Skipping late frame at {:?}", frame.timestamp);
                    }
                    self.due = Some(frame);
                }
                Ok(frame) => {
                    self.next = Some(frame);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn has_due(&self) -> bool {
        self.due.is_some()
    }

    fn take_due(&mut self) -> Option<RawFrame> {
        self.due.take()
    }

    /// Forget everything buffered and ignore frames from older generations.
    fn reset(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.due = None;
        self.next = None;
        while self.rx.try_recv().is_ok() {}
    }
}

/// [`VideoSource`] decoding a file with a background ffmpeg process.
pub struct FfmpegSource {
    info: ProbeInfo,
    queue: FrameQueue,
    queue_ref: Option<HostTime>,
    gpu: GpuContext,
    surfaces: SurfaceRegistry,
    ring: Vec<(SurfaceId, wgpu::Texture)>,
    next_slot: usize,
    stop: Arc<AtomicBool>,
    _thread: JoinHandle<()>,
}

impl FfmpegSource {
    /// Probe `path` and start decoding in a background thread.
    pub fn open(
        path: impl AsRef<Path>,
        gpu: GpuContext,
        surfaces: SurfaceRegistry,
    ) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        info!("Opening video via ffmpeg CLI: {:?}", path);
        let info = probe(&path)?;
        info!(
            "Video: {}x{}, {:.1}s, {:.1} fps",
            info.width, info.height, info.duration, info.fps
        );

        let ring = (0..SURFACE_RING)
            .map(|i| {
                let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&format!("Decoder Surface {}", i)),
                    size: wgpu::Extent3d {
                        width: info.width,
                        height: info.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::Bgra8Unorm,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                (surfaces.register(texture.clone()), texture)
            })
            .collect();

        // Bounded channel so decoding never runs far ahead of playback
        let (frame_tx, frame_rx) = mpsc::sync_channel(5);
        let generation = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let generation = generation.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("ffmpeg-decode".into())
                .spawn(move || decode_loop(path, info, frame_tx, generation, stop))?
        };

        Ok(Self {
            info,
            queue: FrameQueue::new(frame_rx, generation),
            queue_ref: None,
            gpu,
            surfaces,
            ring,
            next_slot: 0,
            stop,
            _thread: thread,
        })
    }

    fn upload(&mut self, frame: &RawFrame) -> SurfaceId {
        let (surface, texture) = &self.ring[self.next_slot];
        self.next_slot = (self.next_slot + 1) % self.ring.len();
        let _current = self.gpu.make_current();
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.info.width * 4),
                rows_per_image: Some(self.info.height),
            },
            wgpu::Extent3d {
                width: self.info.width,
                height: self.info.height,
                depth_or_array_layers: 1,
            },
        );
        *surface
    }
}

impl VideoSource for FfmpegSource {
    fn item_time_for_host_time(&mut self, host_time: HostTime) -> Duration {
        let start = *self.queue_ref.get_or_insert(host_time);
        host_time.saturating_sub(start)
    }

    fn has_new_frame(&mut self, item_time: Duration) -> bool {
        self.queue.poll(item_time);
        self.queue.has_due()
    }

    fn take_frame(&mut self, item_time: Duration) -> Option<DecodedFrame> {
        self.queue.poll(item_time);
        let frame = self.queue.take_due()?;
        let surface = self.upload(&frame);
        Some(DecodedFrame {
            item_time: frame.timestamp,
            surface: Some(surface),
        })
    }

    fn rewind(&mut self) {
        info!("Rewinding video");
        self.queue.reset();
        self.queue_ref = None;
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Unblock a sender parked on a full channel.
        let (_, rx) = mpsc::sync_channel(0);
        drop(std::mem::replace(&mut self.queue.rx, rx));
        for (surface, _) in self.ring.drain(..) {
            self.surfaces.unregister(surface);
        }
    }
}

/// Background decode loop. Restarts ffmpeg at end of stream (looping) and on
/// rewind.
fn decode_loop(
    path: PathBuf,
    info: ProbeInfo,
    tx: SyncSender<RawFrame>,
    generation: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) {
    let frame_size = (info.width * info.height * 4) as usize;
    let frame_duration = Duration::from_secs_f32(1.0 / info.fps);
    let mut loop_offset = Duration::ZERO;
    let mut current = generation.load(Ordering::Acquire);

    while !stop.load(Ordering::Acquire) {
        debug!("Starting ffmpeg process");
        let mut child = match Command::new("ffmpeg")
            .arg("-i")
            .arg(&path)
            .args(["-f", "image2pipe", "-pix_fmt", "bgra", "-vcodec", "rawvideo", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to spawn ffmpeg: {}", e);
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        if let Some(mut stderr) = child.stderr.take() {
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    let msg = String::from_utf8_lossy(&buf[..n]);
                    for line in msg.lines() {
                        if line.contains("Error") || line.contains("error") || line.contains("failed") {
                            error!("ffmpeg: {}", line);
                        }
                    }
                }
            });
        }

        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill();
            return;
        };
        let mut frame_count: u32 = 0;
        let mut rewound = false;

        loop {
            if stop.load(Ordering::Acquire) {
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
            let latest = generation.load(Ordering::Acquire);
            if latest != current {
                current = latest;
                rewound = true;
                break;
            }

            let mut buffer = vec![0u8; frame_size];
            if let Err(e) = stdout.read_exact(&mut buffer) {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!("Error reading from ffmpeg: {}", e);
                }
                break;
            }

            let frame = RawFrame {
                generation: current,
                timestamp: loop_offset + frame_duration * frame_count,
                data: buffer,
            };
            frame_count += 1;

            if tx.send(frame).is_err() {
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }

        let _ = child.kill();
        let _ = child.wait();
        if rewound {
            loop_offset = Duration::ZERO;
        } else {
            loop_offset += frame_duration * frame_count;
            info!("Video loop restarting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let info = parse_probe("1920,1080,30000/1001,12.5\n").unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.duration, 12.5);
    }

    #[test]
    fn test_parse_probe_stream_without_duration() {
        let info = parse_probe("640,480,25/1,N/A").unwrap();
        assert_eq!(info.fps, 25.0);
        assert_eq!(info.duration, 0.0);
    }

    #[test]
    fn test_parse_probe_rejects_garbage() {
        assert!(parse_probe("").is_none());
        assert!(parse_probe("a,b,c").is_none());
    }

    #[test]
    fn test_zero_denominator_falls_back_to_default_fps() {
        assert_eq!(parse_fps("0/0"), None);
        assert_eq!(parse_probe("2,2,0/0").unwrap().fps, 30.0);
    }

    fn frame(generation: u64, ms: u64) -> RawFrame {
        RawFrame {
            generation,
            timestamp: Duration::from_millis(ms),
            data: Vec::new(),
        }
    }

    #[test]
    fn test_queue_keeps_newest_due_frame() {
        let (tx, rx) = mpsc::sync_channel(8);
        let mut queue = FrameQueue::new(rx, Arc::new(AtomicU64::new(0)));
        for ms in [0, 16, 33, 50] {
            tx.send(frame(0, ms)).unwrap();
        }

        queue.poll(Duration::from_millis(35));
        assert_eq!(queue.take_due().unwrap().timestamp, Duration::from_millis(33));
        queue.poll(Duration::from_millis(40));
        assert!(!queue.has_due());
        queue.poll(Duration::from_millis(50));
        assert_eq!(queue.take_due().unwrap().timestamp, Duration::from_millis(50));
    }

    #[test]
    fn test_queue_reset_drops_stale_generation() {
        let (tx, rx) = mpsc::sync_channel(8);
        let generation = Arc::new(AtomicU64::new(0));
        let mut queue = FrameQueue::new(rx, generation.clone());
        tx.send(frame(0, 0)).unwrap();
        queue.reset();
        assert_eq!(generation.load(Ordering::Acquire), 1);

        tx.send(frame(0, 5)).unwrap();
        tx.send(frame(1, 0)).unwrap();
        queue.poll(Duration::from_millis(10));
        let due = queue.take_due().unwrap();
        assert_eq!((due.generation, due.timestamp), (1, Duration::ZERO));
    }
}
