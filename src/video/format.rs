//! Pixel format definitions and conversions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use v4l::format::fourcc;
use v4l::v4l_sys;

use crate::error::BridgeError;

/// Four-character pixel format code
///
/// The code is packed little-endian: the first character ends up in the
/// least significant byte, which is the layout V4L2 uses for `pixelformat`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fourcc([u8; 4]);

impl Fourcc {
    pub const YUYV: Fourcc = Fourcc(*b"YUYV");
    pub const UYVY: Fourcc = Fourcc(*b"UYVY");
    pub const NV12: Fourcc = Fourcc(*b"NV12");
    pub const MJPG: Fourcc = Fourcc(*b"MJPG");

    pub const fn new(repr: [u8; 4]) -> Self {
        Self(repr)
    }

    /// Raw characters in descriptor order
    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// 32-bit code as stored by the driver
    pub fn code(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_code(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// Convert to V4L2 FourCC
    pub fn to_v4l(&self) -> fourcc::FourCC {
        fourcc::FourCC::new(&self.0)
    }

    pub fn from_v4l(fourcc: fourcc::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl FromStr for Fourcc {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let repr: [u8; 4] = s.as_bytes().try_into().map_err(|_| {
            BridgeError::Config(format!("fourcc must be exactly 4 characters: {:?}", s))
        })?;
        if !repr.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(BridgeError::Config(format!(
                "fourcc must be printable ASCII: {:?}",
                s
            )));
        }
        Ok(Self(repr))
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({})", self)
    }
}

impl Serialize for Fourcc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fourcc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is valid
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Common resolutions
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Memory layout granted by a driver for one plane
///
/// All-zero means "let the driver choose". Once a capture device has
/// answered, the same layout is requested from the output device so both
/// drivers agree on the shared buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Bytes per line (`bytesperline`)
    pub stride: u32,
    /// Bytes per image (`sizeimage`)
    pub size: u32,
    /// `enum v4l2_field` code
    pub field: u32,
    /// `enum v4l2_colorspace` code
    pub colorspace: u32,
}

impl Layout {
    pub fn is_unset(&self) -> bool {
        *self == Layout::default()
    }
}

/// Negotiable frame format: pixel layout plus geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub fourcc: Fourcc,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Layout::is_unset")]
    pub layout: Layout,
}

impl FrameFormat {
    pub fn new(fourcc: Fourcc, width: u32, height: u32) -> Self {
        Self {
            fourcc,
            resolution: Resolution::new(width, height),
            layout: Layout::default(),
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Same pixel format and geometry, whatever the layout
    pub fn same_picture(&self, other: &FrameFormat) -> bool {
        self.fourcc == other.fourcc && self.resolution == other.resolution
    }

    pub fn to_v4l(&self) -> v4l::Format {
        let base = v4l::Format::new(
            self.resolution.width,
            self.resolution.height,
            self.fourcc.to_v4l(),
        );
        if self.layout.is_unset() {
            return base;
        }
        let mut pix: v4l_sys::v4l2_pix_format = base.into();
        pix.bytesperline = self.layout.stride;
        pix.sizeimage = self.layout.size;
        pix.field = self.layout.field;
        pix.colorspace = self.layout.colorspace;
        v4l::Format::from(pix)
    }

    pub fn from_v4l(fmt: &v4l::Format) -> Self {
        let pix: v4l_sys::v4l2_pix_format = (*fmt).into();
        Self::new(Fourcc::from_v4l(fmt.fourcc), fmt.width, fmt.height).with_layout(Layout {
            stride: pix.bytesperline,
            size: pix.sizeimage,
            field: pix.field,
            colorspace: pix.colorspace,
        })
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resolution, self.fourcc)?;
        if !self.layout.is_unset() {
            write!(f, " (stride {}, {} bytes)", self.layout.stride, self.layout.size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_little_endian_packing() {
        let fourcc: Fourcc = "YUYV".parse().unwrap();
        assert_eq!(fourcc.bytes(), *b"YUYV");
        let code = fourcc.code();
        assert_eq!(code & 0xff, b'Y' as u32);
        assert_eq!((code >> 8) & 0xff, b'U' as u32);
        assert_eq!((code >> 16) & 0xff, b'Y' as u32);
        assert_eq!(code >> 24, b'V' as u32);
        assert_eq!(Fourcc::from_code(code), fourcc);
    }

    #[test]
    fn test_fourcc_rejects_wrong_length() {
        assert!("YUY".parse::<Fourcc>().is_err());
        assert!("YUYV2".parse::<Fourcc>().is_err());
        assert!("".parse::<Fourcc>().is_err());
    }

    #[test]
    fn test_fourcc_v4l_conversion() {
        let back = Fourcc::from_v4l(Fourcc::NV12.to_v4l());
        assert_eq!(back, Fourcc::NV12);
    }

    #[test]
    fn test_frame_format_display() {
        let fmt = FrameFormat::new(Fourcc::YUYV, 640, 480);
        assert_eq!(fmt.to_string(), "640x480 YUYV");
        assert!(fmt.resolution.is_valid());
        assert_eq!(fmt.resolution, Resolution::VGA);
    }

    #[test]
    fn test_fourcc_serializes_as_string() {
        let json = serde_json::to_string(&Fourcc::MJPG).unwrap();
        assert_eq!(json, "\"MJPG\"");
        let back: Fourcc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Fourcc::MJPG);
    }

    #[test]
    fn test_layout_reaches_v4l_request() {
        let layout = Layout {
            stride: 1280,
            size: 1280 * 480,
            field: 1,
            colorspace: 8,
        };
        let fmt = FrameFormat::new(Fourcc::YUYV, 640, 480).with_layout(layout);
        let request = fmt.to_v4l();
        assert_eq!(request.stride, 1280);
        assert_eq!(request.size, 1280 * 480);
        assert_eq!(FrameFormat::from_v4l(&request).layout, layout);
    }

    #[test]
    fn test_unset_layout_leaves_driver_defaults() {
        let fmt = FrameFormat::new(Fourcc::NV12, 1280, 720);
        let request = fmt.to_v4l();
        assert_eq!(request.stride, 0);
        assert_eq!(request.size, 0);
        assert!(fmt.same_picture(&fmt.with_layout(Layout {
            stride: 1280,
            ..Layout::default()
        })));
    }
}
