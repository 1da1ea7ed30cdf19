//! Stream configuration
//!
//! Descriptors are parsed into [`StreamConfig`] values before any device is
//! touched, so a malformed command line never opens a device node.

pub mod descriptor;
pub mod schema;

pub use descriptor::parse_descriptor;
pub use schema::{ExportSide, FrameRate, RelayOptions, StreamConfig};
