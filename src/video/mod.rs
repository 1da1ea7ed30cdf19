//! Video device relay
//!
//! Device endpoints (V4L2 and mock), the shared buffer pool, pacing, the
//! per-stream relay engine and the multi-stream manager.

pub mod buffer_pool;
pub mod device;
pub mod format;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pacer;
pub mod stream_engine;
pub mod stream_manager;
pub mod v4l2_device;

pub use buffer_pool::{Buffer, BufferPool, Ownership, OwnershipError};
pub use device::{DeviceBackend, DeviceEndpoint, Direction, EndpointState, MemoryRole, Readiness};
pub use format::{Fourcc, FrameFormat, Resolution};
pub use pacer::{Clock, FramePacer, SystemClock};
pub use stream_engine::{RelayStats, StopReason, StreamEngine, StreamHandle, StreamReport, StreamState};
pub use stream_manager::{ShutdownHandle, StreamManager};
pub use v4l2_device::{V4l2Backend, V4l2Endpoint};
