//! Session configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resolution::{AspectRatio, FallbackPolicy};
use crate::traits::{FourCC, Result};

/// Tunables for a camera session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ratio the preview resolution must match.
    pub aspect_ratio: AspectRatio,
    /// What to pick when nothing matches the ratio.
    pub fallback: FallbackPolicy,
    /// Preview pixel format; `None` uses the selected descriptor's own.
    pub pixel_format: Option<FourCC>,
    /// Number of capture buffers a backend should queue.
    pub buffer_count: u32,
    /// How often a polling watcher rescans for devices, in milliseconds.
    pub poll_interval_ms: u64,
    /// Longest wait for one captured frame before the stream is restarted,
    /// in milliseconds.
    pub frame_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatio::R16X9,
            fallback: FallbackPolicy::FirstReported,
            pixel_format: None,
            buffer_count: 4,
            poll_interval_ms: 500,
            frame_timeout_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Shortest allowed poll interval.
    pub const MIN_POLL_INTERVAL_MS: u64 = 10;
    /// Shortest allowed frame timeout.
    pub const MIN_FRAME_TIMEOUT_MS: u64 = 10;

    /// Default configuration targeting `aspect_ratio`.
    #[must_use]
    pub fn new(aspect_ratio: AspectRatio) -> Self {
        Self {
            aspect_ratio,
            ..Default::default()
        }
    }

    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.normalize();
        Ok(config)
    }

    /// Set the fallback policy.
    #[must_use]
    pub const fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    /// Force a preview pixel format.
    #[must_use]
    pub const fn with_pixel_format(mut self, fourcc: FourCC) -> Self {
        self.pixel_format = Some(fourcc);
        self
    }

    /// Set the capture buffer count (at least 1).
    #[must_use]
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    /// Set the watcher poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(Self::MIN_POLL_INTERVAL_MS);
        self
    }

    /// Set the frame timeout.
    #[must_use]
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout_ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(Self::MIN_FRAME_TIMEOUT_MS);
        self
    }

    /// Watcher poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Longest wait for one captured frame.
    #[must_use]
    pub const fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    fn normalize(&mut self) {
        self.buffer_count = self.buffer_count.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(Self::MIN_POLL_INTERVAL_MS);
        self.frame_timeout_ms = self.frame_timeout_ms.max(Self::MIN_FRAME_TIMEOUT_MS);
    }
}
