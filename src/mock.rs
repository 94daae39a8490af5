//! Mock camera library, preview target and watcher for testing without
//! hardware.
//!
//! Every mock records what was done to it into a shared [`CallLog`] so tests
//! can assert on the exact order of operations across components.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::session::DeviceEvent;
use crate::traits::{
    ButtonCallback, CameraDevice, CameraError, CameraLibrary, CaptureFormatDescriptor,
    DeviceInfo, DeviceWatcher, FourCC, Frame, FrameMetadata, PreviewTarget, Result,
    SharedTarget, StatusCallback, StatusEvent, TargetFactory,
};

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `CameraLibrary::open` on device index.
    Open(u32),
    /// `set_preview_target` on device index.
    SetTarget(u32),
    /// `set_preview_format` on device index.
    SetFormat(u32, u32, u32, FourCC),
    /// `start_preview` on device index.
    StartPreview(u32),
    /// `stop_preview` on device index.
    StopPreview(u32),
    /// `set_status_callback` on device index; `true` when a callback was set.
    StatusCallback(u32, bool),
    /// `set_button_callback` on device index; `true` when a callback was set.
    ButtonCallback(u32, bool),
    /// `close` on device index.
    Close(u32),
    /// `TargetFactory::acquire`, numbered from 0.
    AcquireTarget(u32),
    /// `PreviewTarget::release` of the numbered target.
    ReleaseTarget(u32),
    /// `DeviceWatcher::register`.
    Register,
    /// `DeviceWatcher::unregister`.
    Unregister,
    /// `DeviceWatcher::request_permission` on device index.
    RequestPermission(u32),
}

/// Shared, ordered record of [`Call`]s.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call.
    pub fn push(&self, call: Call) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    /// Snapshot of all calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// How many times `call` was recorded.
    #[must_use]
    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Position of the first occurrence of `call`.
    #[must_use]
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }
}

/// The full release sequence for device `index` paired with target `target`.
#[must_use]
pub fn teardown_calls(index: u32, target: u32) -> Vec<Call> {
    vec![
        Call::StopPreview(index),
        Call::StatusCallback(index, false),
        Call::ButtonCallback(index, false),
        Call::Close(index),
        Call::ReleaseTarget(target),
    ]
}

/// Which step of connecting a [`MockCamera`] should fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Failure {
    /// Nothing fails.
    #[default]
    None,
    /// `CameraLibrary::open` fails.
    Open,
    /// `supported_formats` fails.
    Formats,
    /// `set_preview_format` fails.
    SetFormat,
    /// `start_preview` fails.
    StartPreview,
}

/// Mock camera library.
#[derive(Debug, Clone)]
pub struct MockLibrary {
    log: CallLog,
    formats: Vec<CaptureFormatDescriptor>,
    failure: Failure,
    close_delay: Duration,
}

impl MockLibrary {
    /// Create a library whose cameras report `formats`.
    #[must_use]
    pub fn new(log: CallLog, formats: Vec<CaptureFormatDescriptor>) -> Self {
        Self {
            log,
            formats,
            failure: Failure::None,
            close_delay: Duration::ZERO,
        }
    }

    /// Make one connection step fail.
    #[must_use]
    pub const fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    /// Make `close` block for `delay`, widening teardown races.
    #[must_use]
    pub const fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Open a camera directly, bypassing failure injection.
    #[must_use]
    pub fn camera(&self, index: u32) -> MockCamera {
        MockCamera {
            info: DeviceInfo::from_index(index, "Mock Camera"),
            log: self.log.clone(),
            formats: self.formats.clone(),
            failure: self.failure,
            close_delay: self.close_delay,
            target: None,
            format: None,
            status: None,
            button: None,
            previewing: false,
            closed: false,
        }
    }
}

impl CameraLibrary for MockLibrary {
    type Device = MockCamera;

    fn open(&self, device: &DeviceInfo) -> Result<MockCamera> {
        self.log.push(Call::Open(device.index));
        if self.failure == Failure::Open {
            return Err(CameraError::unsupported("mock open failure"));
        }
        Ok(self.camera(device.index))
    }
}

/// Mock camera connection.
pub struct MockCamera {
    info: DeviceInfo,
    log: CallLog,
    formats: Vec<CaptureFormatDescriptor>,
    failure: Failure,
    close_delay: Duration,
    target: Option<SharedTarget>,
    format: Option<(u32, u32, FourCC)>,
    status: Option<StatusCallback>,
    button: Option<ButtonCallback>,
    previewing: bool,
    closed: bool,
}

impl MockCamera {
    /// Simulate a press of hardware button `button`.
    pub fn press_button(&self, button: u8) {
        if let Some(callback) = &self.button {
            callback(crate::traits::ButtonEvent {
                button,
                pressed: true,
            });
        }
    }

    /// Whether the camera is delivering frames.
    #[must_use]
    pub const fn is_previewing(&self) -> bool {
        self.previewing
    }
}

impl CameraDevice for MockCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn supported_formats(&self) -> Result<Vec<CaptureFormatDescriptor>> {
        if self.failure == Failure::Formats {
            return Err(CameraError::stream("mock format enumeration failure"));
        }
        Ok(self.formats.clone())
    }

    fn set_preview_target(&mut self, target: SharedTarget) -> Result<()> {
        self.log.push(Call::SetTarget(self.info.index));
        self.target = Some(target);
        Ok(())
    }

    fn set_preview_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<()> {
        self.log
            .push(Call::SetFormat(self.info.index, width, height, fourcc));
        if self.failure == Failure::SetFormat {
            return Err(CameraError::FormatNotSupported(CaptureFormatDescriptor::video(
                width, height, fourcc,
            )));
        }
        self.format = Some((width, height, fourcc));
        Ok(())
    }

    fn start_preview(&mut self) -> Result<()> {
        self.log.push(Call::StartPreview(self.info.index));
        if self.failure == Failure::StartPreview {
            return Err(CameraError::stream("mock start failure"));
        }
        if self.closed {
            return Err(CameraError::Closed);
        }
        let (width, height, _) = self.format.ok_or_else(|| CameraError::stream("no format"))?;
        self.previewing = true;
        if let Some(status) = &self.status {
            status(StatusEvent::PreviewStarted);
        }
        if let Some(target) = &self.target {
            let frame = Frame {
                data: vec![0; (width * height * 2) as usize],
                metadata: FrameMetadata {
                    sequence: 0,
                    timestamp: Duration::ZERO,
                    bytes_used: width * height * 2,
                },
            };
            target
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draw(&frame);
        }
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<()> {
        self.log.push(Call::StopPreview(self.info.index));
        if self.previewing {
            self.previewing = false;
            if let Some(status) = &self.status {
                status(StatusEvent::PreviewStopped);
            }
        }
        Ok(())
    }

    fn set_status_callback(&mut self, callback: Option<StatusCallback>) {
        self.log
            .push(Call::StatusCallback(self.info.index, callback.is_some()));
        self.status = callback;
    }

    fn set_button_callback(&mut self, callback: Option<ButtonCallback>) {
        self.log
            .push(Call::ButtonCallback(self.info.index, callback.is_some()));
        self.button = callback;
    }

    fn close(&mut self) -> Result<()> {
        if !self.close_delay.is_zero() {
            std::thread::sleep(self.close_delay);
        }
        self.log.push(Call::Close(self.info.index));
        if self.closed {
            return Err(CameraError::Closed);
        }
        self.closed = true;
        self.target = None;
        Ok(())
    }
}

/// Mock preview target counting drawn frames into its factory.
#[derive(Debug)]
pub struct MockTarget {
    id: u32,
    log: CallLog,
    drawn: Arc<AtomicUsize>,
    released: bool,
}

impl PreviewTarget for MockTarget {
    fn draw(&mut self, _frame: &Frame) {
        if !self.released {
            self.drawn.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn release(&mut self) {
        self.log.push(Call::ReleaseTarget(self.id));
        self.released = true;
    }
}

/// Hands out numbered [`MockTarget`]s.
#[derive(Debug, Clone)]
pub struct MockTargetFactory {
    log: CallLog,
    next: Arc<Mutex<u32>>,
    drawn: Arc<AtomicUsize>,
    fail: bool,
}

impl MockTargetFactory {
    /// Create a factory recording into `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next: Arc::new(Mutex::new(0)),
            drawn: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    /// Frames drawn into any target this factory (or a clone) handed out,
    /// before that target was released.
    #[must_use]
    pub fn frames_drawn(&self) -> usize {
        self.drawn.load(Ordering::SeqCst)
    }

    /// Make every `acquire` fail.
    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Create a target directly, outside the numbering sequence.
    #[must_use]
    pub fn target(&self, id: u32) -> SharedTarget {
        Arc::new(Mutex::new(MockTarget {
            id,
            log: self.log.clone(),
            drawn: Arc::clone(&self.drawn),
            released: false,
        }))
    }
}

impl TargetFactory for MockTargetFactory {
    fn acquire(&self) -> Result<SharedTarget> {
        if self.fail {
            return Err(CameraError::Target("mock target unavailable".to_owned()));
        }
        let id = {
            let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
            let id = *next;
            *next += 1;
            id
        };
        self.log.push(Call::AcquireTarget(id));
        Ok(self.target(id))
    }
}

/// Mock device watcher.
///
/// When built with a sender, `request_permission` answers immediately with
/// `Connected` (or `Cancelled` if permission is denied).
#[derive(Debug, Clone)]
pub struct MockWatcher {
    log: CallLog,
    events: Option<UnboundedSender<DeviceEvent>>,
    grant: bool,
}

impl MockWatcher {
    /// Create a watcher that only records calls.
    #[must_use]
    pub const fn new(log: CallLog) -> Self {
        Self {
            log,
            events: None,
            grant: true,
        }
    }

    /// Answer permission requests on `events`.
    #[must_use]
    pub fn with_sender(mut self, events: UnboundedSender<DeviceEvent>, grant: bool) -> Self {
        self.events = Some(events);
        self.grant = grant;
        self
    }
}

impl DeviceWatcher for MockWatcher {
    fn register(&self) -> Result<()> {
        self.log.push(Call::Register);
        Ok(())
    }

    fn unregister(&self) {
        self.log.push(Call::Unregister);
    }

    fn request_permission(&self, device: &DeviceInfo) {
        self.log.push(Call::RequestPermission(device.index));
        if let Some(events) = &self.events {
            let event = if self.grant {
                DeviceEvent::Connected(device.clone())
            } else {
                DeviceEvent::Cancelled(device.clone())
            };
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_library_open() {
        let log = CallLog::new();
        let library = MockLibrary::new(log.clone(), vec![]);
        let camera = library
            .open(&DeviceInfo::from_index(2, "cam"))
            .expect("open should succeed");
        assert_eq!(camera.info().index, 2);
        assert_eq!(log.calls(), vec![Call::Open(2)]);
    }

    #[test]
    fn test_mock_library_open_failure() {
        let library = MockLibrary::new(CallLog::new(), vec![]).with_failure(Failure::Open);
        let result = library.open(&DeviceInfo::from_index(0, "cam"));
        assert!(matches!(result, Err(CameraError::Unsupported(_))));
    }

    #[test]
    fn test_mock_camera_preview_draws_frame() {
        let log = CallLog::new();
        let library = MockLibrary::new(log.clone(), vec![]);
        let factory = MockTargetFactory::new(log.clone());
        let target = factory.acquire().expect("acquire should succeed");

        let mut camera = library.camera(0);
        camera
            .set_preview_target(Arc::clone(&target))
            .expect("set target should succeed");
        camera
            .set_preview_format(64, 36, FourCC::YUYV)
            .expect("set format should succeed");
        camera.start_preview().expect("start should succeed");
        assert!(camera.is_previewing());
        assert_eq!(factory.frames_drawn(), 1);

        camera.stop_preview().expect("stop should succeed");
        assert!(!camera.is_previewing());
        assert_eq!(log.count(&Call::StartPreview(0)), 1);

        target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .draw(&Frame {
                data: vec![],
                metadata: FrameMetadata {
                    sequence: 1,
                    timestamp: Duration::ZERO,
                    bytes_used: 0,
                },
            });
        assert_eq!(factory.frames_drawn(), 1, "released target ignores frames");
    }

    #[test]
    fn test_mock_camera_double_close_errors() {
        let mut camera = MockLibrary::new(CallLog::new(), vec![]).camera(0);
        assert!(camera.close().is_ok());
        assert!(matches!(camera.close(), Err(CameraError::Closed)));
    }

    #[test]
    fn test_mock_camera_button_callback() {
        let pressed = Arc::new(Mutex::new(Vec::new()));
        let mut camera = MockLibrary::new(CallLog::new(), vec![]).camera(0);

        let sink = Arc::clone(&pressed);
        camera.set_button_callback(Some(Box::new(move |event| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(event.button);
        })));
        camera.press_button(1);
        camera.set_button_callback(None);
        camera.press_button(2);

        assert_eq!(*pressed.lock().unwrap_or_else(PoisonError::into_inner), vec![1]);
    }
}
