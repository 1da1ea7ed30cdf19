//! Stream descriptor parsing
//!
//! A descriptor packs one stream into a single command-line token:
//!
//! ```text
//! capture:output@export_side@fps:buffer_count:width,height:fourcc
//! ```
//!
//! e.g. `/dev/video0:/dev/video1@o@30:4:640,480:YUYV`. `export_side` is `i`
//! (capture exports) or `o` (output exports); a non-positive `fps` disables
//! pacing.

use std::str::FromStr;

use super::schema::{ExportSide, FrameRate, StreamConfig};
use crate::error::{BridgeError, Result};
use crate::video::format::{Fourcc, FrameFormat};

fn invalid(descriptor: &str, reason: impl std::fmt::Display) -> BridgeError {
    BridgeError::Config(format!("invalid stream descriptor {:?}: {}", descriptor, reason))
}

fn parse_number<T: FromStr>(descriptor: &str, field: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| invalid(descriptor, format_args!("bad {} {:?}: {}", field, value, e)))
}

/// Parse one stream descriptor into a [`StreamConfig`]
pub fn parse_descriptor(descriptor: &str) -> Result<StreamConfig> {
    let (devices, rest) = descriptor
        .split_once('@')
        .ok_or_else(|| invalid(descriptor, "missing '@' after device names"))?;
    let (capture_device, output_device) = devices
        .split_once(':')
        .ok_or_else(|| invalid(descriptor, "missing ':' between device names"))?;
    if capture_device.is_empty() || output_device.is_empty() {
        return Err(invalid(descriptor, "empty device name"));
    }

    let (side, params) = rest
        .split_once('@')
        .ok_or_else(|| invalid(descriptor, "missing '@' after export side"))?;
    let export_side = match side {
        "i" => ExportSide::Capture,
        "o" => ExportSide::Output,
        other => {
            return Err(invalid(
                descriptor,
                format_args!("export side must be 'i' or 'o', got {:?}", other),
            ))
        }
    };

    let fields: Vec<&str> = params.splitn(4, ':').collect();
    let [fps, buffers, size, fourcc] = fields[..] else {
        return Err(invalid(
            descriptor,
            "expected fps:buffer_count:width,height:fourcc",
        ));
    };

    let fps: i64 = parse_number(descriptor, "fps", fps)?;
    if fps > u32::MAX as i64 {
        return Err(invalid(descriptor, format_args!("fps {} out of range", fps)));
    }

    let buffer_count: u32 = parse_number(descriptor, "buffer count", buffers)?;
    if buffer_count == 0 {
        return Err(invalid(descriptor, "buffer count must be at least 1"));
    }

    let (width, height) = size
        .split_once(',')
        .ok_or_else(|| invalid(descriptor, "size must be width,height"))?;
    let width: u32 = parse_number(descriptor, "width", width)?;
    let height: u32 = parse_number(descriptor, "height", height)?;
    if width == 0 || height == 0 {
        return Err(invalid(descriptor, "width and height must be non-zero"));
    }

    let fourcc: Fourcc = fourcc.parse().map_err(|e| invalid(descriptor, e))?;

    Ok(StreamConfig {
        capture_device: capture_device.to_string(),
        output_device: output_device.to_string(),
        export_side,
        frame_rate: FrameRate::from_fps(fps),
        buffer_count,
        format: FrameFormat::new(fourcc, width, height),
    })
}

impl FromStr for StreamConfig {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        parse_descriptor(s)
    }
}
