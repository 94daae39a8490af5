//! uvc-preview: connect to a USB Video Class camera and preview it
//!
//! This library picks the best capture resolution for a target aspect ratio
//! and keeps the one active camera connection behind a guarded slot that
//! serializes connect, replace and release across asynchronous device
//! events. The camera library, preview target and device watcher are traits,
//! with a V4L2 implementation for Linux and mock devices for testing.

pub mod config;
pub mod device;
pub mod guard;
pub mod resolution;
pub mod session;
pub mod traits;
pub mod watcher;

#[cfg(test)]
pub mod mock;

pub use config::SessionConfig;
pub use device::{V4l2Camera, V4l2Library};
pub use guard::{ActiveDevice, Completion, ConnectionGuard};
pub use resolution::{select_best_format, select_best_format_with, AspectRatio, FallbackPolicy};
pub use session::{ConnectError, DeviceEvent, Session};
pub use traits::{
    ButtonCallback, ButtonEvent, CameraDevice, CameraError, CameraLibrary,
    CaptureFormatDescriptor, DeviceInfo, DeviceWatcher, FormatKind, FourCC, Frame, FrameMetadata,
    PreviewTarget, SharedTarget, StatusCallback, StatusEvent, TargetFactory,
};
pub use watcher::SysfsWatcher;
