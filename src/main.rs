//! uvc-preview binary: previews the first UVC camera that shows up.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uvc_preview::traits::Result;
use uvc_preview::watcher::{scan, SYSFS_VIDEO4LINUX};
use uvc_preview::{
    select_best_format_with, AspectRatio, CameraDevice, CameraLibrary, Frame, PreviewTarget,
    Session, SessionConfig, SharedTarget, SysfsWatcher, TargetFactory, V4l2Library,
};

#[derive(Debug, Parser)]
#[command(version, about = "Preview a USB Video Class camera")]
struct Options {
    /// JSON session configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Target aspect ratio, e.g. 16:9.
    #[arg(long, value_name = "W:H")]
    ratio: Option<AspectRatio>,

    /// List cameras and their formats, then exit.
    #[arg(long)]
    list: bool,

    /// Log the preview frame rate once per second.
    #[arg(long)]
    frames: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("uvc_preview=info")),
        )
        .init();

    if let Err(err) = run(Options::parse()).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(options: Options) -> Result<()> {
    let mut config = match &options.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(ratio) = options.ratio {
        config.aspect_ratio = ratio;
    }

    if options.list {
        list_devices(&config);
        return Ok(());
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let watcher = SysfsWatcher::new(events_tx, config.poll_interval());
    let library = V4l2Library::new(config.buffer_count).with_frame_timeout(config.frame_timeout());
    let targets = FrameCounterFactory {
        log_rate: options.frames,
    };
    let session = Session::new(library, targets, watcher, config);

    session.start()?;
    tokio::select! {
        () = session.run(events_rx) => {}
        result = tokio::signal::ctrl_c() => result?,
    }

    session.stop().wait().await;
    info!("stopped");
    Ok(())
}

fn list_devices(config: &SessionConfig) {
    let library = V4l2Library::new(config.buffer_count);
    let devices = scan(Path::new(SYSFS_VIDEO4LINUX), Path::new("/dev"));
    if devices.is_empty() {
        println!("No video capture devices found");
        return;
    }

    for device in devices.values() {
        println!("{device}");
        let formats = match library
            .open(device)
            .and_then(|camera| camera.supported_formats())
        {
            Ok(formats) => formats,
            Err(err) => {
                println!("  unavailable: {err}");
                continue;
            }
        };

        let best = select_best_format_with(&formats, config.aspect_ratio, config.fallback);
        for format in &formats {
            let marker = if *format == best { '*' } else { ' ' };
            println!(" {marker} {format}");
        }
    }
}

/// Preview target that counts frames instead of drawing them.
struct FrameCounter {
    log_rate: bool,
    total: u64,
    window: u64,
    since: Instant,
    released: bool,
}

impl PreviewTarget for FrameCounter {
    fn draw(&mut self, frame: &Frame) {
        if self.released {
            return;
        }
        self.total += 1;
        self.window += 1;

        let elapsed = self.since.elapsed();
        if elapsed >= Duration::from_secs(1) {
            if self.log_rate {
                #[allow(clippy::cast_precision_loss)]
                let fps = self.window as f64 / elapsed.as_secs_f64();
                info!(
                    fps,
                    sequence = frame.metadata.sequence,
                    bytes = frame.metadata.bytes_used,
                    "preview"
                );
            }
            self.window = 0;
            self.since = Instant::now();
        }
    }

    fn release(&mut self) {
        self.released = true;
        info!(frames = self.total, "preview target released");
    }
}

struct FrameCounterFactory {
    log_rate: bool,
}

impl TargetFactory for FrameCounterFactory {
    fn acquire(&self) -> Result<SharedTarget> {
        Ok(Arc::new(Mutex::new(FrameCounter {
            log_rate: self.log_rate,
            total: 0,
            window: 0,
            since: Instant::now(),
            released: false,
        })))
    }
}
