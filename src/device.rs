//! V4L2 camera library implementation using the v4l crate.
//!
//! UVC cameras on Linux are driven through V4L2. Preview runs on a dedicated
//! capture thread that owns the device while streaming and hands it back
//! when the preview stops. Dequeues wait at most one frame timeout, so a
//! stalled camera never blocks `stop_preview`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::framesize::{FrameSize, FrameSizeEnum};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    ButtonCallback, CameraDevice, CameraError, CameraLibrary, CaptureFormatDescriptor,
    DeviceInfo, FourCC, Frame, FrameMetadata, Result, SharedTarget, StatusCallback,
    StatusEvent,
};

/// How long a dequeue waits for a frame unless configured otherwise.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolutions offered for drivers that report stepwise size ranges.
const COMMON_SIZES: [(u32, u32); 10] = [
    (640, 360),
    (640, 480),
    (800, 600),
    (1024, 768),
    (1280, 720),
    (1280, 960),
    (1600, 1200),
    (1920, 1080),
    (2560, 1440),
    (3840, 2160),
];

/// Camera library opening V4L2 device nodes.
#[derive(Debug, Clone)]
pub struct V4l2Library {
    buffer_count: u32,
    frame_timeout: Duration,
}

impl Default for V4l2Library {
    fn default() -> Self {
        Self::new(4)
    }
}

impl V4l2Library {
    /// Create a library whose cameras stream with `buffer_count` mmap buffers.
    #[must_use]
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }

    /// Bound how long the capture thread waits for one frame (at least 1ms).
    #[must_use]
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

impl CameraLibrary for V4l2Library {
    type Device = V4l2Camera;

    fn open(&self, info: &DeviceInfo) -> Result<V4l2Camera> {
        let device = Device::with_path(&info.path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(info.path.clone()),
            _ => CameraError::unsupported(format!("cannot open {}: {err}", info.path.display())),
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::unsupported(err.to_string()))?;
        let can_capture = caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE);
        let can_stream = caps.capabilities.contains(v4l::capability::Flags::STREAMING);
        if !can_capture || !can_stream {
            return Err(CameraError::unsupported(format!(
                "{} ({}) cannot stream video",
                caps.card, caps.driver
            )));
        }

        info!(device = %info, driver = %caps.driver, card = %caps.card, "camera opened");
        Ok(V4l2Camera {
            info: info.clone(),
            state: State::Idle(device),
            buffer_count: self.buffer_count,
            frame_timeout: self.frame_timeout,
            target: None,
            status: Arc::new(Mutex::new(None)),
            button: None,
        })
    }
}

type SharedStatus = Arc<Mutex<Option<StatusCallback>>>;

enum State {
    Idle(Device),
    Previewing {
        stop: Arc<AtomicBool>,
        join: JoinHandle<Device>,
    },
    Closed,
}

/// An opened V4L2 camera.
pub struct V4l2Camera {
    info: DeviceInfo,
    state: State,
    buffer_count: u32,
    frame_timeout: Duration,
    target: Option<SharedTarget>,
    status: SharedStatus,
    // V4L2 has no UVC button events; kept so the callback contract holds.
    button: Option<ButtonCallback>,
}

impl V4l2Camera {
    fn idle(&self) -> Result<&Device> {
        match &self.state {
            State::Idle(device) => Ok(device),
            State::Previewing { .. } => Err(CameraError::stream("preview is running")),
            State::Closed => Err(CameraError::Closed),
        }
    }
}

impl CameraDevice for V4l2Camera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn supported_formats(&self) -> Result<Vec<CaptureFormatDescriptor>> {
        let device = self.idle()?;
        let mut formats = Vec::new();

        for description in device.enum_formats()? {
            let fourcc = FourCC::from(description.fourcc);
            let sizes = device.enum_framesizes(description.fourcc);
            formats.extend(frame_sizes(&self.info, fourcc, sizes));
        }

        let formats: Vec<_> = formats
            .into_iter()
            .zip(0u32..)
            .map(|((width, height, fourcc), index)| {
                CaptureFormatDescriptor::video(width, height, fourcc).with_index(index)
            })
            .collect();
        debug!(device = %self.info, count = formats.len(), "enumerated formats");
        Ok(formats)
    }

    fn set_preview_target(&mut self, target: SharedTarget) -> Result<()> {
        if matches!(self.state, State::Closed) {
            return Err(CameraError::Closed);
        }
        self.target = Some(target);
        Ok(())
    }

    fn set_preview_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<()> {
        let device = self.idle()?;
        let mut fmt = device
            .format()
            .map_err(|err| CameraError::stream(err.to_string()))?;

        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc.into();

        let actual = device
            .set_format(&fmt)
            .map_err(|err| CameraError::stream(err.to_string()))?;
        if actual.width != width || actual.height != height || FourCC::from(actual.fourcc) != fourcc
        {
            return Err(CameraError::FormatNotSupported(
                CaptureFormatDescriptor::video(width, height, fourcc),
            ));
        }
        Ok(())
    }

    fn start_preview(&mut self) -> Result<()> {
        let target = self
            .target
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| CameraError::Target("no preview target set".to_owned()))?;
        self.idle()?;
        let State::Idle(device) = std::mem::replace(&mut self.state, State::Closed) else {
            return Err(CameraError::Closed);
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker = CaptureWorker {
            buffer_count: self.buffer_count,
            frame_timeout: self.frame_timeout,
            target,
            status: Arc::clone(&self.status),
            stop: Arc::clone(&stop),
        };
        let join = std::thread::Builder::new()
            .name(format!("uvc-capture-{}", self.info.index))
            .spawn(move || worker.run(device))?;

        self.state = State::Previewing { stop, join };
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Previewing { stop, join } => {
                stop.store(true, Ordering::Release);
                let device = join
                    .join()
                    .map_err(|_| CameraError::stream("capture thread panicked"))?;
                self.state = State::Idle(device);
                Ok(())
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    fn set_status_callback(&mut self, callback: Option<StatusCallback>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn set_button_callback(&mut self, callback: Option<ButtonCallback>) {
        self.button = callback;
    }

    fn close(&mut self) -> Result<()> {
        if matches!(self.state, State::Closed) {
            return Err(CameraError::Closed);
        }
        let stopped = self.stop_preview();
        self.state = State::Closed;
        self.target = None;
        info!(device = %self.info, "camera closed");
        stopped
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        if let Err(err) = self.stop_preview() {
            warn!(device = %self.info, %err, "failed to stop preview on drop");
        }
    }
}

/// Sizes one pixel format offers, stepwise ranges narrowed to common sizes
/// plus their maximum. A format whose sizes cannot be enumerated offers none.
fn frame_sizes(
    info: &DeviceInfo,
    fourcc: FourCC,
    sizes: io::Result<Vec<FrameSize>>,
) -> Vec<(u32, u32, FourCC)> {
    let sizes = match sizes {
        Ok(sizes) => sizes,
        Err(err) => {
            warn!(device = %info, %fourcc, %err, "cannot enumerate frame sizes");
            return Vec::new();
        }
    };
    let fits = |value: u32, min: u32, max: u32, step: u32| {
        (min..=max).contains(&value) && (value - min) % step.max(1) == 0
    };

    let mut out = Vec::new();
    for size in sizes {
        match size.size {
            FrameSizeEnum::Discrete(discrete) => {
                out.push((discrete.width, discrete.height, fourcc));
            }
            FrameSizeEnum::Stepwise(range) => {
                out.extend(
                    COMMON_SIZES
                        .iter()
                        .filter(|(w, h)| {
                            fits(*w, range.min_width, range.max_width, range.step_width)
                                && fits(*h, range.min_height, range.max_height, range.step_height)
                        })
                        .map(|(w, h)| (*w, *h, fourcc)),
                );
                out.push((range.max_width, range.max_height, fourcc));
            }
        }
    }
    out
}

/// How a run of the mmap stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The stop flag was raised.
    Stopped,
    /// No frame arrived within the frame timeout.
    Stalled,
    /// The stream reported an error.
    Failed,
}

impl StreamEnd {
    fn from_error(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Self::Stalled
        } else {
            Self::Failed
        }
    }
}

/// Everything the capture thread needs besides the device itself.
struct CaptureWorker {
    buffer_count: u32,
    frame_timeout: Duration,
    target: SharedTarget,
    status: SharedStatus,
    stop: Arc<AtomicBool>,
}

impl CaptureWorker {
    fn run(self, device: Device) -> Device {
        let mut started = false;
        // An mmap stream cannot resume after a dequeue timeout, so a stalled
        // stream is rebuilt.
        while !self.stopped() {
            let mut stream =
                match Stream::with_buffers(&device, Type::VideoCapture, self.buffer_count) {
                    Ok(stream) => stream,
                    Err(err) => {
                        self.emit(StatusEvent::StreamError(err.to_string()));
                        break;
                    }
                };
            stream.set_timeout(self.frame_timeout);
            if !started {
                self.emit(StatusEvent::PreviewStarted);
                started = true;
            }

            match self.stream_frames(&mut stream) {
                StreamEnd::Stopped | StreamEnd::Failed => break,
                StreamEnd::Stalled => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = self.frame_timeout.as_millis() as u64;
                    warn!(timeout_ms, "no frame within timeout, restarting stream");
                }
            }
        }
        self.emit(StatusEvent::PreviewStopped);
        device
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn stream_frames(&self, stream: &mut Stream<'_>) -> StreamEnd {
        while !self.stopped() {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(err) => {
                    let end = StreamEnd::from_error(&err);
                    if end == StreamEnd::Failed {
                        self.emit(StatusEvent::StreamError(err.to_string()));
                    }
                    return end;
                }
            };

            // Safe conversions: V4L2 timestamps are always non-negative in practice
            #[allow(clippy::cast_sign_loss)]
            let secs = meta.timestamp.sec.max(0) as u64;
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

            let frame = Frame {
                data: buf.to_vec(),
                metadata: FrameMetadata {
                    sequence: meta.sequence,
                    timestamp: Duration::new(secs, nanos),
                    bytes_used: meta.bytesused,
                },
            };
            self.target
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draw(&frame);
        }
        StreamEnd::Stopped
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(callback) = self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            callback(event);
        }
    }
}
