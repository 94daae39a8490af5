//! Single-slot ownership of the active camera connection.
//!
//! Every store and release is a command on one FIFO queue consumed by a
//! worker task. The worker holds the slot lock for the whole command, so a
//! teardown never interleaves with a store and commands run in the order
//! they were submitted.

use std::sync::{Arc, PoisonError};

use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::traits::{CameraDevice, DeviceInfo, SharedTarget};

/// An opened camera together with the preview target it draws into.
pub struct ActiveDevice<D> {
    device: D,
    target: SharedTarget,
}

impl<D: CameraDevice> ActiveDevice<D> {
    /// Pair an opened device with its preview target.
    pub fn new(device: D, target: SharedTarget) -> Self {
        Self { device, target }
    }

    /// Identity of the device.
    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    /// The opened device, mutably.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The paired preview target.
    pub const fn target(&self) -> &SharedTarget {
        &self.target
    }

    /// Stop preview, clear callbacks, close the device and release the
    /// target. Every step runs even when an earlier one fails.
    pub fn teardown(mut self) {
        let info = self.device.info().clone();

        if let Err(err) = self.device.stop_preview() {
            warn!(device = %info, %err, "failed to stop preview");
        }
        self.device.set_status_callback(None);
        self.device.set_button_callback(None);
        if let Err(err) = self.device.close() {
            warn!(device = %info, %err, "failed to close camera");
        }
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();

        info!(device = %info, "camera released");
    }
}

enum Command<D> {
    Store(ActiveDevice<D>, oneshot::Sender<()>),
    Release(oneshot::Sender<()>),
}

/// Resolves once a submitted store or release has fully run.
///
/// Dropping it does not cancel the command.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<()>);

impl Completion {
    /// Wait for the command to finish.
    pub async fn wait(self) {
        // A dropped sender means the worker is gone and the command already
        // ran inline.
        let _ = self.0.await;
    }
}

type Slot<D> = Arc<Mutex<Option<ActiveDevice<D>>>>;

/// Owner of the one active camera slot.
///
/// Must be created inside a tokio runtime; it spawns its worker task.
/// Dropping the guard lets the worker drain its queue and release whatever
/// is still stored.
pub struct ConnectionGuard<D: CameraDevice> {
    slot: Slot<D>,
    commands: mpsc::UnboundedSender<Command<D>>,
}

impl<D: CameraDevice> ConnectionGuard<D> {
    /// Create an empty guard and start its worker.
    pub fn new() -> Self {
        let slot: Slot<D> = Arc::new(Mutex::new(None));
        let (commands, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(Arc::clone(&slot), queue));
        Self { slot, commands }
    }

    /// Store `active` as the current camera, tearing down any camera stored
    /// before it.
    pub fn store(&self, active: ActiveDevice<D>) -> Completion {
        let (done, completion) = oneshot::channel();
        if let Err(mpsc::error::SendError(Command::Store(active, _))) =
            self.commands.send(Command::Store(active, done))
        {
            warn!(device = %active.info(), "connection worker stopped, releasing camera");
            active.teardown();
        }
        Completion(completion)
    }

    /// Release the current camera. A no-op when nothing is stored.
    pub fn release(&self) -> Completion {
        let (done, completion) = oneshot::channel();
        if self.commands.send(Command::Release(done)).is_err() {
            debug!("connection worker stopped, nothing to release");
        }
        Completion(completion)
    }

    /// Whether a camera is currently stored.
    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Identity of the stored camera, if any.
    pub async fn active_device(&self) -> Option<DeviceInfo> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|active| active.info().clone())
    }
}

impl<D: CameraDevice> Default for ConnectionGuard<D> {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker<D: CameraDevice>(
    slot: Slot<D>,
    mut queue: mpsc::UnboundedReceiver<Command<D>>,
) {
    while let Some(command) = queue.recv().await {
        let locked = Arc::clone(&slot).lock_owned().await;
        let (done, result) = match command {
            Command::Store(active, done) => {
                let result =
                    tokio::task::spawn_blocking(move || store_locked(locked, active)).await;
                (done, result)
            }
            Command::Release(done) => {
                let result = tokio::task::spawn_blocking(move || release_locked(locked)).await;
                (done, result)
            }
        };
        if let Err(err) = result {
            error!(%err, "camera slot command failed");
        }
        let _ = done.send(());
    }

    let locked = slot.lock_owned().await;
    if let Err(err) = tokio::task::spawn_blocking(move || release_locked(locked)).await {
        error!(%err, "final camera release failed");
    }
}

fn store_locked<D: CameraDevice>(
    mut slot: OwnedMutexGuard<Option<ActiveDevice<D>>>,
    active: ActiveDevice<D>,
) {
    if let Some(previous) = slot.take() {
        warn!(device = %previous.info(), "replacing camera that was never released");
        previous.teardown();
    }
    info!(device = %active.info(), "camera stored");
    *slot = Some(active);
}

fn release_locked<D: CameraDevice>(mut slot: OwnedMutexGuard<Option<ActiveDevice<D>>>) {
    match slot.take() {
        Some(active) => active.teardown(),
        None => debug!("no active camera to release"),
    }
}
