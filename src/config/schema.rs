use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::video::format::FrameFormat;

/// Default per-stream inactivity timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Granularity of the readiness wait; cancellation is observed between slices
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Which endpoint of a stream owns the physical buffer memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportSide {
    /// The capture (input) device exports, descriptor letter `i`
    Capture,
    /// The output device exports, descriptor letter `o`
    Output,
}

impl ExportSide {
    pub fn letter(&self) -> char {
        match self {
            ExportSide::Capture => 'i',
            ExportSide::Output => 'o',
        }
    }
}

/// Target relay rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameRate {
    /// Relay as fast as the endpoints allow
    Unpaced,
    /// Cap the relay at this many frames per second
    Fixed(NonZeroU32),
}

impl FrameRate {
    /// Map the descriptor value; zero and negative values mean unpaced.
    pub fn from_fps(fps: i64) -> Self {
        u32::try_from(fps)
            .ok()
            .and_then(NonZeroU32::new)
            .map_or(FrameRate::Unpaced, FrameRate::Fixed)
    }

    /// Minimum inter-frame interval in microseconds.
    ///
    /// Integer division; the sub-microsecond remainder is dropped.
    pub fn frame_us(&self) -> Option<u64> {
        match self {
            FrameRate::Unpaced => None,
            FrameRate::Fixed(fps) => Some(1_000_000 / fps.get() as u64),
        }
    }

    pub fn frame_interval(&self) -> Option<Duration> {
        self.frame_us().map(Duration::from_micros)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameRate::Unpaced => write!(f, "unpaced"),
            FrameRate::Fixed(fps) => write!(f, "{} fps", fps),
        }
    }
}

/// Complete description of one capture/output stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Capture (input) device node
    pub capture_device: String,
    /// Output device node
    pub output_device: String,
    /// Endpoint that exports buffer memory
    pub export_side: ExportSide,
    pub frame_rate: FrameRate,
    /// Number of circulating buffer slots (>= 1)
    pub buffer_count: u32,
    /// Requested format; the negotiated one may differ
    pub format: FrameFormat,
}

impl StreamConfig {
    pub fn frame_us(&self) -> Option<u64> {
        self.frame_rate.frame_us()
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (export: {}, {}, {} buffers, {})",
            self.capture_device,
            self.output_device,
            self.export_side.letter(),
            self.frame_rate,
            self.buffer_count,
            self.format
        )
    }
}

/// Relay loop timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// A stream with no readiness for this long stops on its own
    pub idle_timeout: Duration,
    /// Upper bound of a single readiness wait
    pub wait_slice: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            wait_slice: DEFAULT_WAIT_SLICE,
        }
    }
}

impl RelayOptions {
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_wait_slice(mut self, wait_slice: Duration) -> Self {
        self.wait_slice = wait_slice;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_sentinels() {
        assert_eq!(FrameRate::from_fps(-1), FrameRate::Unpaced);
        assert_eq!(FrameRate::from_fps(0), FrameRate::Unpaced);
        assert_eq!(
            FrameRate::from_fps(30),
            FrameRate::Fixed(NonZeroU32::new(30).unwrap())
        );
    }

    #[test]
    fn test_frame_us_truncates() {
        assert_eq!(FrameRate::from_fps(30).frame_us(), Some(33_333));
        assert_eq!(FrameRate::from_fps(7).frame_us(), Some(142_857));
        assert_eq!(FrameRate::from_fps(1).frame_us(), Some(1_000_000));
        assert_eq!(FrameRate::Unpaced.frame_us(), None);
        assert_eq!(FrameRate::Unpaced.frame_interval(), None);
    }

    #[test]
    fn test_relay_options_default() {
        let opts = RelayOptions::default();
        assert_eq!(opts.idle_timeout, Duration::from_secs(5));
        assert!(opts.wait_slice < opts.idle_timeout);
    }
}
