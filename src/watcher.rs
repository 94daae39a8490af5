//! Device watcher polling the V4L2 sysfs class directory.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::DeviceEvent;
use crate::traits::{CameraError, DeviceInfo, DeviceWatcher, Result};

/// Default sysfs class directory for video devices.
pub const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

/// Watcher that rescans `/sys/class/video4linux` on an interval.
///
/// Nodes appearing between scans are reported as `Attached`; nodes that
/// vanish as `Disconnected` followed by `Detached`. Devices present when the
/// watcher registers are reported as attached. Only the first node of each
/// device (sysfs `index` 0) is reported, so UVC metadata nodes are skipped.
pub struct SysfsWatcher {
    class_dir: PathBuf,
    dev_dir: PathBuf,
    interval: Duration,
    events: UnboundedSender<DeviceEvent>,
    running: Mutex<Option<CancellationToken>>,
}

impl SysfsWatcher {
    /// Watch the system's video devices, delivering events on `events`.
    #[must_use]
    pub fn new(events: UnboundedSender<DeviceEvent>, interval: Duration) -> Self {
        Self::with_dirs(events, interval, SYSFS_VIDEO4LINUX, "/dev")
    }

    /// Watch a custom class directory whose device nodes live in `dev_dir`.
    #[must_use]
    pub fn with_dirs(
        events: UnboundedSender<DeviceEvent>,
        interval: Duration,
        class_dir: impl Into<PathBuf>,
        dev_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            class_dir: class_dir.into(),
            dev_dir: dev_dir.into(),
            interval,
            events,
            running: Mutex::new(None),
        }
    }

    /// Whether the polling task is running.
    pub fn is_registered(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn send_event(events: &UnboundedSender<DeviceEvent>, event: DeviceEvent) {
    if events.send(event).is_err() {
        debug!("device event receiver dropped");
    }
}

impl DeviceWatcher for SysfsWatcher {
    fn register(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            CameraError::unsupported(format!("watcher needs a tokio runtime: {err}"))
        })?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let poller = Poller {
            class_dir: self.class_dir.clone(),
            dev_dir: self.dev_dir.clone(),
            events: self.events.clone(),
        };
        let interval = self.interval;
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut known = BTreeMap::new();
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => known = poller.poll(&known),
                }
            }
            debug!("device watcher stopped");
        });

        info!(dir = %self.class_dir.display(), "device watcher registered");
        Ok(())
    }

    fn unregister(&self) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
            info!("device watcher unregistered");
        }
    }

    fn request_permission(&self, device: &DeviceInfo) {
        let device = device.clone();
        let events = self.events.clone();
        let probe = move || {
            let access = OpenOptions::new().read(true).write(true).open(&device.path);
            let answer = match access {
                Ok(_) => DeviceEvent::Connected(device),
                Err(err) => {
                    warn!(device = %device, %err, "no access to device");
                    DeviceEvent::Cancelled(device)
                }
            };
            send_event(&events, answer);
        };

        // Opening a device node can block; keep it off the async workers.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(probe);
            }
            Err(_) => probe(),
        }
    }
}

impl Drop for SysfsWatcher {
    fn drop(&mut self) {
        self.unregister();
    }
}

struct Poller {
    class_dir: PathBuf,
    dev_dir: PathBuf,
    events: UnboundedSender<DeviceEvent>,
}

impl Poller {
    fn poll(&self, known: &BTreeMap<u32, DeviceInfo>) -> BTreeMap<u32, DeviceInfo> {
        let current = scan(&self.class_dir, &self.dev_dir);

        for (index, device) in known {
            if !current.contains_key(index) {
                send_event(&self.events, DeviceEvent::Disconnected(device.clone()));
                send_event(&self.events, DeviceEvent::Detached(device.clone()));
            }
        }
        for (index, device) in &current {
            if !known.contains_key(index) {
                send_event(&self.events, DeviceEvent::Attached(device.clone()));
            }
        }
        current
    }
}

/// List the capture devices under `class_dir`, keyed by node index.
pub fn scan(class_dir: &Path, dev_dir: &Path) -> BTreeMap<u32, DeviceInfo> {
    let entries = match fs::read_dir(class_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %class_dir.display(), %err, "cannot read video class directory");
            return BTreeMap::new();
        }
    };

    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let node = entry.file_name().into_string().ok()?;
            let index: u32 = node.strip_prefix("video")?.parse().ok()?;
            let attr = |name: &str| {
                fs::read_to_string(entry.path().join(name))
                    .ok()
                    .map(|value| value.trim().to_owned())
            };
            if attr("index").is_some_and(|value| value != "0") {
                return None;
            }
            let name = attr("name").unwrap_or_else(|| node.clone());
            Some((
                index,
                DeviceInfo {
                    index,
                    name,
                    path: dev_dir.join(&node),
                },
            ))
        })
        .collect()
}
