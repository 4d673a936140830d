//! surfacefx: play a video through a GPU effect, one frame per refresh.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use surfacefx::buffer::{BufferPool, Size};
use surfacefx::clock::{DisplayLinkClock, RefreshClock, TimerClock};
use surfacefx::config::{changed_parameters, ClockKind, Config, ConfigWatcher, OutputKind};
use surfacefx::control::Controller;
use surfacefx::effect::{EffectDefinition, EffectStage, ParamValue, WgpuEffectEngine};
use surfacefx::error::PublishError;
use surfacefx::gpu::{GpuContext, SurfaceRegistry, TextureTable, WgpuTextureAllocator};
use surfacefx::import::SurfaceImporter;
use surfacefx::output::{LogPublisher, Publisher};
use surfacefx::pipeline::FramePipeline;
use surfacefx::video::FfmpegSource;
use tracing::{error, info, warn};

/// Refresh-driven video effect pipeline.
#[derive(Parser, Debug)]
#[command(name = "surfacefx")]
#[command(about = "Render a video through a GPU effect once per display refresh")]
struct Args {
    /// YAML config file (watched for parameter changes)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Video file to play
    #[arg(short, long)]
    video: Option<PathBuf>,

    /// Effect definition (YAML); passthrough when omitted
    #[arg(short, long)]
    effect: Option<PathBuf>,

    /// Output width
    #[arg(long)]
    width: Option<u32>,

    /// Output height
    #[arg(long)]
    height: Option<u32>,

    /// Tick rate for the timer clock
    #[arg(long)]
    fps: Option<u32>,

    #[arg(long, value_enum)]
    clock: Option<ClockKind>,

    #[arg(long, value_enum)]
    output: Option<OutputKind>,

    /// v4l2loopback device for virtual-camera output
    #[arg(long)]
    device: Option<PathBuf>,

    /// Published frames are stored bottom-up and must be flipped for output
    #[arg(long)]
    flipped: Option<bool>,

    /// Begin paused; type `start` to begin rendering
    #[arg(long)]
    paused: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(video) = &self.video {
            config.video = Some(video.clone());
        }
        if let Some(effect) = &self.effect {
            config.effect = Some(effect.clone());
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(clock) = self.clock {
            config.clock = clock;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(flipped) = self.flipped {
            config.flipped = flipped;
        }
    }
}

/// Commands typed on stdin.
enum Command {
    Start,
    Stop,
    Rewind,
    Set(String, ParamValue),
    Slider(String, f32),
    Stats,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let mut arg = |what: &str| parts.next().ok_or_else(|| anyhow!("missing {}", what));
    Ok(match cmd {
        "start" => Command::Start,
        "stop" => Command::Stop,
        "rewind" => Command::Rewind,
        "stats" => Command::Stats,
        "quit" | "exit" => Command::Quit,
        "set" => {
            let name = arg("name")?.to_string();
            let value = serde_yaml::from_str::<ParamValue>(arg("value")?)
                .context("value must be a bool, number, [x, y] or [r, g, b, a]")?;
            Command::Set(name, value)
        }
        "slider" => {
            let name = arg("name")?.to_string();
            let t = arg("position")?.parse::<f32>()?;
            Command::Slider(name, t)
        }
        other => bail!("unknown command '{}'", other),
    })
}

fn spawn_stdin_reader(tx: mpsc::Sender<Command>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("{}", e),
            }
        }
    });
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    let video = config
        .video
        .clone()
        .ok_or_else(|| anyhow!("no video given (use --video or set `video` in the config)"))?;

    info!("Starting surfacefx...");
    let gpu = GpuContext::new()?;
    let pipeline = build_pipeline(&config, &video, &gpu)?;

    match config.clock {
        ClockKind::Timer => run(
            Controller::new(TimerClock::with_fps(config.fps), pipeline),
            &args,
        ),
        ClockKind::DisplayLink => run(Controller::new(DisplayLinkClock::new(), pipeline), &args),
    }
}

/// Wire pool, effect, video source and publisher into one pipeline.
fn build_pipeline(
    config: &Config,
    video: &Path,
    gpu: &GpuContext,
) -> surfacefx::Result<Arc<FramePipeline>> {
    let table = TextureTable::default();
    let surfaces = SurfaceRegistry::default();
    let allocator = WgpuTextureAllocator::new(gpu, table.clone(), surfaces.clone());
    let pool = BufferPool::new(Box::new(allocator), config.pool_config());

    let definition = match &config.effect {
        Some(path) => {
            info!("Loading effect from {:?}", path);
            EffectDefinition::load(path)?
        }
        None => {
            info!("Using passthrough effect");
            EffectDefinition::passthrough()
        }
    };
    let engine = WgpuEffectEngine::new(gpu, table.clone(), &definition)?;
    let effect = EffectStage::new(
        definition,
        Box::new(engine),
        pool.clone(),
        Size::new(config.width, config.height),
    );
    for (name, value) in &config.parameters {
        if let Err(e) = effect.set_parameter(name, *value) {
            warn!("Ignoring config parameter '{}': {}", name, e);
        }
    }

    let source = FfmpegSource::open(video, gpu.clone(), surfaces)?;
    let importer = SurfaceImporter::new(Box::new(source), pool.clone());
    let publisher = make_publisher(config, gpu, &table)?;
    Ok(Arc::new(FramePipeline::new(
        importer,
        effect,
        publisher,
        pool,
        config.flipped,
    )))
}

fn make_publisher(
    config: &Config,
    gpu: &GpuContext,
    table: &TextureTable,
) -> Result<Box<dyn Publisher>, PublishError> {
    match config.output {
        OutputKind::Log => Ok(Box::new(LogPublisher::new())),
        #[cfg(target_os = "linux")]
        OutputKind::VirtualCamera => {
            use surfacefx::output::{VirtualCameraConfig, VirtualCameraPublisher};
            let vc_config = VirtualCameraConfig {
                device: config.device.clone(),
                width: config.width,
                height: config.height,
            };
            Ok(Box::new(VirtualCameraPublisher::new(vc_config, gpu.clone(), table.clone())?))
        }
        #[cfg(not(target_os = "linux"))]
        OutputKind::VirtualCamera => {
            let _ = (gpu, table);
            Err(PublishError::Device(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "virtual-camera output is only available on Linux",
            )))
        }
    }
}

fn run<C: RefreshClock>(mut controller: Controller<C>, args: &Args) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut watcher = args.config.clone().and_then(ConfigWatcher::new);
    let (tx, rx) = mpsc::channel();
    spawn_stdin_reader(tx);

    if !args.paused {
        controller.start()?;
    }
    info!("Commands: start | stop | rewind | set <name> <value> | slider <name> <0..1> | stats | quit");

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Command::Start) => {
                if let Err(e) = controller.start() {
                    error!("Failed to start: {}", e);
                }
            }
            Ok(Command::Stop) => controller.stop(),
            Ok(Command::Rewind) => controller.rewind(),
            Ok(Command::Set(name, value)) => {
                if let Err(e) = controller.set_parameter(&name, value) {
                    error!("{}", e);
                }
            }
            Ok(Command::Slider(name, t)) => {
                if let Err(e) = controller.set_slider(&name, t) {
                    error!("{}", e);
                }
            }
            Ok(Command::Stats) => {
                println!("pipeline: {:?}", controller.stats());
                println!("pool:     {:?}", controller.pool().stats());
            }
            Ok(Command::Quit) => break,
            Err(RecvTimeoutError::Timeout) => {}
            // stdin closed; keep running until interrupted
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(100)),
        }

        if let Some((old, new)) = watcher.as_mut().and_then(|w| w.check_for_changes()) {
            for (name, value) in changed_parameters(old.as_ref(), &new) {
                match controller.set_parameter(&name, value) {
                    Ok(()) => info!("Reloaded parameter '{}' = {:?}", name, value),
                    Err(e) => warn!("Ignoring reloaded parameter '{}': {}", name, e),
                }
            }
        }
    }

    controller.shutdown();
    info!("Stopped");
    Ok(())
}
