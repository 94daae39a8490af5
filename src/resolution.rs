//! Best-resolution selection for a target aspect ratio.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::traits::{CameraError, CaptureFormatDescriptor, FormatKind, Result};

/// Target width:height ratio, both components strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAspectRatio")]
pub struct AspectRatio {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct RawAspectRatio {
    width: u32,
    height: u32,
}

impl TryFrom<RawAspectRatio> for AspectRatio {
    type Error = CameraError;

    fn try_from(raw: RawAspectRatio) -> Result<Self> {
        Self::new(raw.width, raw.height)
    }
}

impl AspectRatio {
    /// 16:9.
    pub const R16X9: Self = Self {
        width: 16,
        height: 9,
    };
    /// 4:3.
    pub const R4X3: Self = Self {
        width: 4,
        height: 3,
    };

    /// Create a ratio; both components must be non-zero.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CameraError::invalid_config(format!(
                "aspect ratio components must be positive, got {width}:{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// Width component.
    #[must_use]
    pub const fn width(self) -> u32 {
        self.width
    }

    /// Height component.
    #[must_use]
    pub const fn height(self) -> u32 {
        self.height
    }

    /// Whether `width x height` is an exact integer multiple of this ratio.
    ///
    /// A width that is not a multiple of the ratio's width never matches.
    #[must_use]
    pub const fn matches(self, width: u32, height: u32) -> bool {
        if width % self.width != 0 {
            return false;
        }
        let scale = width / self.width;
        scale > 0 && scale as u64 * self.height as u64 == height as u64
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::R16X9
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = CameraError;

    /// Parses `16:9` or `16x9`.
    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .split_once([':', 'x'])
            .ok_or_else(|| CameraError::invalid_config(format!("expected W:H, got {s:?}")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|err| CameraError::invalid_config(format!("bad ratio {s:?}: {err}")))
        };
        Self::new(parse(w)?, parse(h)?)
    }
}

/// What to return when no video-capture descriptor matches the ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// First descriptor the device reported, whatever its kind.
    #[default]
    FirstReported,
    /// First video-capture descriptor, else the sentinel.
    FirstVideoCapture,
    /// Always the sentinel.
    Empty,
}

/// Pick the largest video-capture descriptor matching `target`.
///
/// Falls back to the first reported descriptor when nothing matches and to
/// [`CaptureFormatDescriptor::EMPTY`] when `formats` is empty.
#[must_use]
pub fn select_best_format(
    formats: &[CaptureFormatDescriptor],
    target: AspectRatio,
) -> CaptureFormatDescriptor {
    select_best_format_with(formats, target, FallbackPolicy::FirstReported)
}

/// [`select_best_format`] with an explicit fallback policy.
#[must_use]
pub fn select_best_format_with(
    formats: &[CaptureFormatDescriptor],
    target: AspectRatio,
    policy: FallbackPolicy,
) -> CaptureFormatDescriptor {
    let video = || {
        formats
            .iter()
            .filter(|format| format.kind == FormatKind::VideoCapture)
    };

    // `max_by_key` keeps the last maximum, fold keeps the first.
    let best = video()
        .filter(|format| target.matches(format.width, format.height))
        .fold(None::<&CaptureFormatDescriptor>, |best, format| match best {
            Some(current) if current.area() >= format.area() => Some(current),
            _ => Some(format),
        });

    if let Some(best) = best {
        return *best;
    }

    let fallback = match policy {
        FallbackPolicy::FirstReported => formats.first(),
        FallbackPolicy::FirstVideoCapture => video().next(),
        FallbackPolicy::Empty => None,
    };
    fallback.copied().unwrap_or(CaptureFormatDescriptor::EMPTY)
}
