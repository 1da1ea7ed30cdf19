//! Device endpoint contract
//!
//! The relay engine only talks to devices through [`DeviceEndpoint`] and
//! [`DeviceBackend`]. The V4L2 implementation lives in
//! [`super::v4l2_device`]; [`super::mock`] provides a software-only one.

use std::fmt;
use std::time::Duration;

use super::buffer_pool::Buffer;
use super::format::FrameFormat;
use crate::error::Result;

/// Direction of buffer flow through an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Capture,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Capture => write!(f, "capture"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Buffer memory role of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryRole {
    /// Owns the physical buffer memory and publishes handles to it
    Exporter,
    /// Queues the exporter's handles, allocates no memory
    Importer,
}

/// Endpoint streaming state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Opened, nothing negotiated or allocated
    Closed,
    /// Format negotiated and buffer slots allocated
    Configured,
    /// Buffer flow active
    Streaming,
}

/// Which endpoints of a stream to wait on, or which ones are ready
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Capture endpoint has a completed buffer
    pub capture: bool,
    /// Output endpoint has released a buffer
    pub output: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.capture || self.output
    }
}

/// One capture or output video device
pub trait DeviceEndpoint: Send + 'static {
    /// Shareable memory handle produced by the exporter
    type Handle: Send + 'static;

    /// Device identifier (node path)
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    fn role(&self) -> MemoryRole;

    fn state(&self) -> EndpointState;

    /// Query the current format, request `desired`, and return the format the
    /// driver actually granted, which may differ from the request.
    fn negotiate(&mut self, desired: &FrameFormat) -> Result<FrameFormat>;

    /// Request `count` buffer slots in this endpoint's memory role.
    ///
    /// Granting fewer slots than requested is an error.
    fn allocate_pool(&mut self, count: u32) -> Result<u32>;

    /// Export slot `index` as a shareable handle. Exporter only.
    fn export_handle(&mut self, index: u32) -> Result<Self::Handle>;

    /// Hand a buffer to the driver
    fn enqueue(&mut self, buffer: &Buffer<Self::Handle>) -> Result<()>;

    /// Take back a buffer the driver has finished with, returning its index
    fn dequeue(&mut self) -> Result<u32>;

    /// Start or stop buffer flow
    fn set_streaming(&mut self, on: bool) -> Result<()>;
}

/// Opens endpoints and waits on them
pub trait DeviceBackend: Send + Sync + 'static {
    type Endpoint: DeviceEndpoint;

    /// Open `name`, checking it supports `direction`
    fn open(&self, name: &str, direction: Direction, role: MemoryRole) -> Result<Self::Endpoint>;

    /// Block for at most `timeout` until one of the endpoints selected by
    /// `interest` is ready. An empty result means the wait timed out.
    fn wait_ready(
        &self,
        capture: &Self::Endpoint,
        output: &Self::Endpoint,
        interest: Readiness,
        timeout: Duration,
    ) -> Result<Readiness>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_any() {
        assert!(!Readiness::default().any());
        assert!(Readiness {
            capture: true,
            output: false
        }
        .any());
        assert!(Readiness {
            capture: false,
            output: true
        }
        .any());
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Capture.to_string(), "capture");
        assert_eq!(Direction::Output.to_string(), "output");
    }
}
