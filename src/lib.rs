//! v4l2-bridge - zero-copy V4L2 buffer relay
//!
//! Moves frames from V4L2 capture devices to V4L2 output devices by sharing
//! DMA-BUF handles between the two drivers, without copying pixel data.

pub mod config;
pub mod error;
pub mod video;

pub use error::{BridgeError, Result};
