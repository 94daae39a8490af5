//! Core traits and types for UVC camera abstraction.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel format representation (e.g., YUYV, UYVY, MJPG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| CameraError::invalid_config(format!("fourcc must be 4 bytes: {s:?}")))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for FourCC {
    type Error = CameraError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FourCC> for String {
    fn from(fourcc: FourCC) -> Self {
        fourcc.to_string()
    }
}

/// Capability tag of a device-reported stream mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    /// Still-image capture mode.
    StillImage,
    /// Video capture mode, the only kind the resolution selector prefers.
    VideoCapture,
    /// Any other tag the device reported.
    Other(u8),
}

impl FormatKind {
    /// Raw tag of still-image descriptors.
    pub const STILL_IMAGE_TAG: u8 = 3;
    /// Raw tag of video-capture descriptors.
    pub const VIDEO_CAPTURE_TAG: u8 = 4;

    /// Classify a raw descriptor tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Self {
        match tag {
            Self::STILL_IMAGE_TAG => Self::StillImage,
            Self::VIDEO_CAPTURE_TAG => Self::VideoCapture,
            other => Self::Other(other),
        }
    }

    /// Raw tag of this kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::StillImage => Self::STILL_IMAGE_TAG,
            Self::VideoCapture => Self::VIDEO_CAPTURE_TAG,
            Self::Other(tag) => tag,
        }
    }
}

/// One streaming mode a camera advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureFormatDescriptor {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Capability tag.
    pub kind: FormatKind,
    /// Pixel format the mode is delivered in.
    pub fourcc: FourCC,
    /// Position of the mode in the device's own enumeration.
    pub index: u32,
}

impl CaptureFormatDescriptor {
    /// The "no format" sentinel returned when a device reports nothing.
    pub const EMPTY: Self = Self {
        width: 0,
        height: 0,
        kind: FormatKind::Other(0),
        fourcc: FourCC([0; 4]),
        index: 0,
    };

    /// Create a video-capture descriptor.
    #[must_use]
    pub const fn video(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            kind: FormatKind::VideoCapture,
            fourcc,
            index: 0,
        }
    }

    /// Set the capability tag.
    #[must_use]
    pub const fn with_kind(mut self, kind: FormatKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the enumeration index.
    #[must_use]
    pub const fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    /// Whether this is the [`EMPTY`](Self::EMPTY) sentinel (zero area).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// Pixel count of one frame.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for CaptureFormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} (tag {})",
            self.width,
            self.height,
            self.fourcc,
            self.kind.tag()
        )
    }
}

/// Identity of an attached camera.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    /// Device index (N in /dev/videoN).
    pub index: u32,
    /// Human-readable device name.
    pub name: String,
    /// Device node path.
    pub path: PathBuf,
}

impl DeviceInfo {
    /// Describe the device node `/dev/video{index}`.
    #[must_use]
    pub fn from_index(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            path: PathBuf::from(format!("/dev/video{index}")),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Status reported by a device while it previews.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Frames started flowing to the preview target.
    PreviewStarted,
    /// The preview stream ended.
    PreviewStopped,
    /// The stream failed and stopped delivering frames.
    StreamError(String),
}

/// A hardware button on the camera changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    /// Button number as reported by the device.
    pub button: u8,
    /// Whether the button is now held down.
    pub pressed: bool,
}

/// Status callback registered on a device.
pub type StatusCallback = Box<dyn Fn(StatusEvent) + Send + Sync + 'static>;

/// Button callback registered on a device.
pub type ButtonCallback = Box<dyn Fn(ButtonEvent) + Send + Sync + 'static>;

/// A preview target shared between the device drawing into it and the owner
/// releasing it.
pub type SharedTarget = Arc<Mutex<dyn PreviewTarget>>;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device with given path was not found.
    #[error("device {0} not found")]
    DeviceNotFound(PathBuf),
    /// The device cannot be opened or does not support the operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Requested format is not supported.
    #[error("format not supported: {0}")]
    FormatNotSupported(CaptureFormatDescriptor),
    /// Error during streaming operation.
    #[error("stream error: {0}")]
    StreamError(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The preview target could not be acquired or used.
    #[error("preview target: {0}")]
    Target(String),
    /// The device was already closed.
    #[error("device closed")]
    Closed,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be parsed.
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CameraError {
    /// Build an [`Unsupported`](Self::Unsupported) error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Build an [`InvalidConfig`](Self::InvalidConfig) error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Build a [`StreamError`](Self::StreamError).
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::StreamError(msg.into())
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Entry point of a camera library: turns an attached device into an opened
/// camera.
pub trait CameraLibrary: Send + Sync + 'static {
    /// The camera type returned by `open`.
    type Device: CameraDevice;

    /// Open the device. Fails with [`CameraError::Unsupported`] if the device
    /// cannot be opened.
    fn open(&self, device: &DeviceInfo) -> Result<Self::Device>;
}

/// Abstraction over an opened camera connection.
pub trait CameraDevice: Send + 'static {
    /// Identity of the device this connection was opened on.
    fn info(&self) -> &DeviceInfo;

    /// Every streaming mode the device advertises, in device order.
    fn supported_formats(&self) -> Result<Vec<CaptureFormatDescriptor>>;

    /// Set the target frames are drawn into while previewing.
    fn set_preview_target(&mut self, target: SharedTarget) -> Result<()>;

    /// Set preview size and pixel format.
    fn set_preview_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<()>;

    /// Start delivering frames to the preview target.
    fn start_preview(&mut self) -> Result<()>;

    /// Stop delivering frames. Stopping an idle device is a no-op.
    fn stop_preview(&mut self) -> Result<()>;

    /// Register or clear the status callback.
    fn set_status_callback(&mut self, callback: Option<StatusCallback>);

    /// Register or clear the button callback.
    fn set_button_callback(&mut self, callback: Option<ButtonCallback>);

    /// Close the connection.
    fn close(&mut self) -> Result<()>;
}

/// A drawable surface the camera writes frames into.
pub trait PreviewTarget: Send {
    /// Draw one frame.
    fn draw(&mut self, frame: &Frame);

    /// Release the surface. Frames drawn after release are dropped.
    fn release(&mut self);
}

/// Creates the preview target for a new connection.
pub trait TargetFactory: Send + Sync + 'static {
    /// Acquire a fresh preview target.
    fn acquire(&self) -> Result<SharedTarget>;
}

/// Source of device attach/permission/detach events.
///
/// Events are delivered on the channel the watcher was constructed with.
pub trait DeviceWatcher: Send + Sync + 'static {
    /// Start delivering events.
    fn register(&self) -> Result<()>;

    /// Stop delivering events.
    fn unregister(&self);

    /// Ask for access to `device`; answered with a `Connected` or
    /// `Cancelled` event.
    fn request_permission(&self, device: &DeviceInfo);
}
