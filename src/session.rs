//! Device event handling: turns watcher events into guarded connect and
//! release operations.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::guard::{ActiveDevice, Completion, ConnectionGuard};
use crate::resolution::select_best_format_with;
use crate::traits::{
    CameraDevice, CameraError, CameraLibrary, CaptureFormatDescriptor, DeviceInfo, DeviceWatcher,
    Result, StatusEvent, TargetFactory,
};

/// Lifecycle event delivered by a [`DeviceWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A camera was plugged in.
    Attached(DeviceInfo),
    /// Permission to use the camera was granted.
    Connected(DeviceInfo),
    /// Permission was denied or the request was abandoned.
    Cancelled(DeviceInfo),
    /// The camera connection went away.
    Disconnected(DeviceInfo),
    /// The camera was unplugged.
    Detached(DeviceInfo),
}

impl DeviceEvent {
    /// The device the event is about.
    pub const fn device(&self) -> &DeviceInfo {
        match self {
            Self::Attached(device)
            | Self::Connected(device)
            | Self::Cancelled(device)
            | Self::Disconnected(device)
            | Self::Detached(device) => device,
        }
    }
}

/// Why a connect attempt was abandoned.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The camera library refused to open the device.
    #[error("failed to open camera: {0}")]
    Open(#[source] CameraError),
    /// No preview target was available.
    #[error("failed to acquire preview target: {0}")]
    Target(#[source] CameraError),
    /// The camera reported no format at all.
    #[error("camera reported no usable resolution")]
    NoUsableFormat,
    /// Configuring or starting the preview failed.
    #[error("failed to start preview: {0}")]
    Configure(#[source] CameraError),
}

/// One camera session: a library, a preview target source, a watcher and
/// the guarded slot holding the active camera.
///
/// Must be created inside a tokio runtime.
pub struct Session<L: CameraLibrary, F, W> {
    library: L,
    targets: F,
    watcher: W,
    guard: ConnectionGuard<L::Device>,
    config: SessionConfig,
}

impl<L, F, W> Session<L, F, W>
where
    L: CameraLibrary,
    F: TargetFactory,
    W: DeviceWatcher,
{
    /// Create an idle session.
    pub fn new(library: L, targets: F, watcher: W, config: SessionConfig) -> Self {
        Self {
            library,
            targets,
            watcher,
            guard: ConnectionGuard::new(),
            config,
        }
    }

    /// The guarded camera slot.
    pub const fn guard(&self) -> &ConnectionGuard<L::Device> {
        &self.guard
    }

    /// The session configuration.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start receiving device events.
    pub fn start(&self) -> Result<()> {
        self.watcher.register()?;
        info!(ratio = %self.config.aspect_ratio, "camera session started");
        Ok(())
    }

    /// Stop receiving device events and release the active camera.
    pub fn stop(&self) -> Completion {
        self.watcher.unregister();
        info!("camera session stopping");
        self.guard.release()
    }

    /// Handle events in delivery order until the channel closes.
    pub async fn run(&self, mut events: UnboundedReceiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("device event channel closed");
    }

    /// Handle one device event.
    pub async fn handle(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Attached(device) => {
                info!(device = %device, "device attached");
                // A new attach means any stored camera is stale.
                self.guard.release().wait().await;
                self.watcher.request_permission(&device);
            }
            DeviceEvent::Connected(device) => {
                info!(device = %device, "device connected");
                if let Err(err) = self.connect(&device).await {
                    error!(device = %device, %err, "failed to connect camera");
                }
            }
            DeviceEvent::Cancelled(device) => {
                info!(device = %device, "device connection cancelled");
            }
            DeviceEvent::Disconnected(device) => {
                info!(device = %device, "device disconnected");
                let _ = self.guard.release();
            }
            DeviceEvent::Detached(device) => {
                info!(device = %device, "device detached");
            }
        }
    }

    /// Open `device`, start its preview and hand it to the guard.
    ///
    /// On any failure after the device opened, the device is closed and the
    /// preview target released before returning. That cleanup runs on the
    /// blocking pool, like the guard's teardown.
    pub async fn connect(
        &self,
        device: &DeviceInfo,
    ) -> std::result::Result<Completion, ConnectError> {
        let camera = self.library.open(device).map_err(ConnectError::Open)?;

        let target = match self.targets.acquire() {
            Ok(target) => target,
            Err(err) => {
                let label = device.clone();
                let mut camera = camera;
                cleanup(move || {
                    if let Err(close_err) = camera.close() {
                        warn!(device = %label, err = %close_err, "failed to close camera");
                    }
                })
                .await;
                return Err(ConnectError::Target(err));
            }
        };

        let mut active = ActiveDevice::new(camera, target);
        match self.start_preview(&mut active) {
            Ok(format) => {
                info!(device = %device, %format, "preview started");
                Ok(self.guard.store(active))
            }
            Err(err) => {
                cleanup(move || active.teardown()).await;
                Err(err)
            }
        }
    }

    fn start_preview(
        &self,
        active: &mut ActiveDevice<L::Device>,
    ) -> std::result::Result<CaptureFormatDescriptor, ConnectError> {
        let target = Arc::clone(active.target());
        let label = active.info().to_string();
        let camera = active.device_mut();

        camera.set_status_callback(Some(Box::new(move |event| match event {
            StatusEvent::StreamError(msg) => warn!(device = %label, %msg, "camera stream error"),
            other => debug!(device = %label, ?other, "camera status"),
        })));
        camera
            .set_preview_target(target)
            .map_err(ConnectError::Configure)?;

        let formats = camera.supported_formats().map_err(ConnectError::Configure)?;
        let format =
            select_best_format_with(&formats, self.config.aspect_ratio, self.config.fallback);
        if format.is_empty() {
            return Err(ConnectError::NoUsableFormat);
        }
        debug!(%format, candidates = formats.len(), "selected preview format");

        let fourcc = self.config.pixel_format.unwrap_or(format.fourcc);
        camera
            .set_preview_format(format.width, format.height, fourcc)
            .map_err(ConnectError::Configure)?;
        camera.start_preview().map_err(ConnectError::Configure)?;
        Ok(format)
    }
}

async fn cleanup(work: impl FnOnce() + Send + 'static) {
    if let Err(err) = tokio::task::spawn_blocking(work).await {
        error!(%err, "camera cleanup failed");
    }
}
