//! Software-only device backend
//!
//! `MockBackend` implements the endpoint contract without hardware. Capture
//! buffers complete as soon as they are queued (optionally up to a frame
//! limit), output buffers are released as soon as they are queued. Every
//! device call is recorded so tests can check ordering and ownership.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::buffer_pool::Buffer;
use super::device::{
    DeviceBackend, DeviceEndpoint, Direction, EndpointState, MemoryRole, Readiness,
};
use super::format::FrameFormat;
use super::pacer::Clock;
use crate::error::{BridgeError, Result};

/// Handle published by a mock exporter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockHandle {
    pub exporter: String,
    pub index: u32,
}

/// Recorded device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Opened {
        device: String,
        direction: Direction,
        role: MemoryRole,
    },
    Negotiated {
        device: String,
        requested: FrameFormat,
        accepted: FrameFormat,
    },
    Allocated {
        device: String,
        count: u32,
    },
    Exported {
        device: String,
        index: u32,
    },
    Enqueued {
        device: String,
        index: u32,
    },
    Dequeued {
        device: String,
        index: u32,
    },
    Streaming {
        device: String,
        on: bool,
    },
}

impl MockEvent {
    pub fn device(&self) -> &str {
        match self {
            MockEvent::Opened { device, .. }
            | MockEvent::Negotiated { device, .. }
            | MockEvent::Allocated { device, .. }
            | MockEvent::Exported { device, .. }
            | MockEvent::Enqueued { device, .. }
            | MockEvent::Dequeued { device, .. }
            | MockEvent::Streaming { device, .. } => device,
        }
    }
}

#[derive(Default)]
struct MockState {
    events: Vec<MockEvent>,
    /// Remaining capture completions; `None` is unlimited
    frames_left: Option<u64>,
    frames_delivered: u64,
    missing: HashSet<String>,
    lacking: HashMap<String, Direction>,
    grant_limits: HashMap<String, u32>,
    format_overrides: HashMap<String, FrameFormat>,
    /// Fail the enqueue that follows this many successful ones
    enqueue_failures: HashMap<String, u64>,
    /// (device, on) pairs whose streaming toggle is rejected
    streaming_failures: HashSet<(String, bool)>,
    /// Handle -> device it is currently queued on
    in_flight: HashMap<MockHandle, String>,
}

/// Backend factory for [`MockEndpoint`]s
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    clock: Option<Arc<ManualClock>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop completing capture buffers after `frames` frames
    pub fn with_frame_limit(self, frames: u64) -> Self {
        self.state.lock().frames_left = Some(frames);
        self
    }

    /// Make `device` fail to open
    pub fn with_missing_device(self, device: &str) -> Self {
        self.state.lock().missing.insert(device.to_string());
        self
    }

    /// Make `device` lack the capability for `direction`
    pub fn without_capability(self, device: &str, direction: Direction) -> Self {
        self.state.lock().lacking.insert(device.to_string(), direction);
        self
    }

    /// Grant at most `count` buffers on `device`
    pub fn with_grant_limit(self, device: &str, count: u32) -> Self {
        self.state.lock().grant_limits.insert(device.to_string(), count);
        self
    }

    /// Have `device` grant `format` whatever is requested
    pub fn with_format_override(self, device: &str, format: FrameFormat) -> Self {
        self.state
            .lock()
            .format_overrides
            .insert(device.to_string(), format);
        self
    }

    /// Reject the enqueue on `device` after `successes` successful ones
    pub fn fail_enqueue_after(self, device: &str, successes: u64) -> Self {
        self.state
            .lock()
            .enqueue_failures
            .insert(device.to_string(), successes);
        self
    }

    /// Reject STREAMON on `device`
    pub fn fail_streaming_on(self, device: &str) -> Self {
        self.state
            .lock()
            .streaming_failures
            .insert((device.to_string(), true));
        self
    }

    /// Reject STREAMOFF on `device`
    pub fn fail_streaming_off(self, device: &str) -> Self {
        self.state
            .lock()
            .streaming_failures
            .insert((device.to_string(), false));
        self
    }

    /// Idle waits advance `clock` instead of sleeping
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn events_for(&self, device: &str) -> Vec<MockEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.device() == device)
            .cloned()
            .collect()
    }

    /// Every `set_streaming` call made on `device`, in order
    pub fn streaming_calls(&self, device: &str) -> Vec<bool> {
        self.events_for(device)
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Streaming { on, .. } => Some(on),
                _ => None,
            })
            .collect()
    }

    /// Every exported index on `device`, in order
    pub fn exports(&self, device: &str) -> Vec<u32> {
        self.events_for(device)
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Exported { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.state.lock().frames_delivered
    }

    fn record(&self, event: MockEvent) {
        self.state.lock().events.push(event);
    }
}

impl DeviceBackend for MockBackend {
    type Endpoint = MockEndpoint;

    fn open(&self, name: &str, direction: Direction, role: MemoryRole) -> Result<MockEndpoint> {
        {
            let state = self.state.lock();
            if state.missing.contains(name) {
                return Err(BridgeError::open(name, "No such file or directory"));
            }
            if state.lacking.get(name) == Some(&direction) {
                return Err(BridgeError::open(
                    name,
                    format!("video {} is not supported", direction),
                ));
            }
        }
        self.record(MockEvent::Opened {
            device: name.to_string(),
            direction,
            role,
        });
        Ok(MockEndpoint {
            name: name.to_string(),
            direction,
            role,
            state: EndpointState::Closed,
            granted: 0,
            queue: VecDeque::new(),
            enqueues: 0,
            backend: self.clone(),
        })
    }

    fn wait_ready(
        &self,
        capture: &MockEndpoint,
        output: &MockEndpoint,
        interest: Readiness,
        timeout: Duration,
    ) -> Result<Readiness> {
        let frames_available = self.state.lock().frames_left != Some(0);
        let ready = Readiness {
            capture: interest.capture
                && capture.is_streaming()
                && !capture.queue.is_empty()
                && frames_available,
            output: interest.output && output.is_streaming() && !output.queue.is_empty(),
        };
        if !ready.any() {
            match &self.clock {
                Some(clock) => clock.advance(timeout),
                None => std::thread::sleep(timeout),
            }
        }
        Ok(ready)
    }
}

/// In-memory endpoint
pub struct MockEndpoint {
    name: String,
    direction: Direction,
    role: MemoryRole,
    state: EndpointState,
    granted: u32,
    /// Indices currently owned by the "driver", in completion order
    queue: VecDeque<u32>,
    enqueues: u64,
    backend: MockBackend,
}

impl MockEndpoint {
    fn is_streaming(&self) -> bool {
        self.state == EndpointState::Streaming
    }

    /// Indices currently queued on this endpoint
    pub fn queued(&self) -> Vec<u32> {
        self.queue.iter().copied().collect()
    }
}

impl DeviceEndpoint for MockEndpoint {
    type Handle = MockHandle;

    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn role(&self) -> MemoryRole {
        self.role
    }

    fn state(&self) -> EndpointState {
        self.state
    }

    fn negotiate(&mut self, desired: &FrameFormat) -> Result<FrameFormat> {
        let accepted = self
            .backend
            .state
            .lock()
            .format_overrides
            .get(&self.name)
            .copied()
            .unwrap_or(*desired);
        self.backend.record(MockEvent::Negotiated {
            device: self.name.clone(),
            requested: *desired,
            accepted,
        });
        Ok(accepted)
    }

    fn allocate_pool(&mut self, count: u32) -> Result<u32> {
        let limit = self.backend.state.lock().grant_limits.get(&self.name).copied();
        let granted = limit.map_or(count, |limit| limit.min(count));
        self.backend.record(MockEvent::Allocated {
            device: self.name.clone(),
            count: granted,
        });
        if granted < count {
            return Err(BridgeError::alloc(
                &self.name,
                format!("allocated only {} of {} buffers", granted, count),
            ));
        }
        self.granted = granted;
        self.state = EndpointState::Configured;
        Ok(granted)
    }

    fn export_handle(&mut self, index: u32) -> Result<MockHandle> {
        if self.role != MemoryRole::Exporter {
            return Err(BridgeError::alloc(&self.name, "export on importer endpoint"));
        }
        if index >= self.granted {
            return Err(BridgeError::alloc(
                &self.name,
                format!("export of unallocated buffer {}", index),
            ));
        }
        self.backend.record(MockEvent::Exported {
            device: self.name.clone(),
            index,
        });
        Ok(MockHandle {
            exporter: self.name.clone(),
            index,
        })
    }

    fn enqueue(&mut self, buffer: &Buffer<MockHandle>) -> Result<()> {
        let index = buffer.index();
        if self.state == EndpointState::Closed || index >= self.granted {
            return Err(BridgeError::queue(
                &self.name,
                format!("QBUF(index = {}) on unallocated slot", index),
            ));
        }
        let handle = buffer.handle();
        if handle.index != index {
            return Err(BridgeError::queue(
                &self.name,
                format!("handle for {} queued as {}", handle.index, index),
            ));
        }
        let own_handle = handle.exporter == self.name;
        if own_handle != (self.role == MemoryRole::Exporter) {
            return Err(BridgeError::queue(
                &self.name,
                format!("foreign handle from {} on {:?}", handle.exporter, self.role),
            ));
        }

        {
            let mut state = self.backend.state.lock();
            if state.enqueue_failures.get(&self.name) == Some(&self.enqueues) {
                return Err(BridgeError::queue(
                    &self.name,
                    format!("QBUF(index = {}) failed: injected", index),
                ));
            }
            if let Some(holder) = state.in_flight.get(handle) {
                return Err(BridgeError::queue(
                    &self.name,
                    format!("buffer {} already queued on {}", index, holder),
                ));
            }
            state.in_flight.insert(handle.clone(), self.name.clone());
        }

        self.enqueues += 1;
        self.queue.push_back(index);
        self.backend.record(MockEvent::Enqueued {
            device: self.name.clone(),
            index,
        });
        Ok(())
    }

    fn dequeue(&mut self) -> Result<u32> {
        let index = self
            .queue
            .pop_front()
            .ok_or_else(|| BridgeError::queue(&self.name, "DQBUF failed: no buffer ready"))?;
        {
            let mut state = self.backend.state.lock();
            if self.direction == Direction::Capture {
                if let Some(left) = state.frames_left.as_mut() {
                    *left = left.saturating_sub(1);
                }
                state.frames_delivered += 1;
            }
            state.in_flight.retain(|h, holder| !(h.index == index && *holder == self.name));
        }
        self.backend.record(MockEvent::Dequeued {
            device: self.name.clone(),
            index,
        });
        Ok(index)
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        if self.state == EndpointState::Closed {
            return Err(BridgeError::state(&self.name, "streaming toggled before allocation"));
        }
        self.backend.record(MockEvent::Streaming {
            device: self.name.clone(),
            on,
        });
        let rejected = self
            .backend
            .state
            .lock()
            .streaming_failures
            .contains(&(self.name.clone(), on));
        if rejected {
            let label = if on { "STREAMON" } else { "STREAMOFF" };
            return Err(BridgeError::state(
                &self.name,
                format!("{} failed: Input/output error", label),
            ));
        }
        self.state = if on {
            EndpointState::Streaming
        } else {
            EndpointState::Configured
        };
        Ok(())
    }
}

/// Virtual clock: time only moves when slept or advanced
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Virtual time since the clock was created
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    /// Every sleep requested so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Fourcc;

    #[test]
    fn test_open_checks_capability() {
        let backend = MockBackend::new().without_capability("/dev/video1", Direction::Capture);
        assert!(matches!(
            backend.open("/dev/video1", Direction::Capture, MemoryRole::Importer),
            Err(BridgeError::DeviceOpen { .. })
        ));
        assert!(backend
            .open("/dev/video1", Direction::Output, MemoryRole::Importer)
            .is_ok());
    }

    #[test]
    fn test_grant_limit_fails_allocation() {
        let backend = MockBackend::new().with_grant_limit("/dev/video0", 2);
        let mut ep = backend
            .open("/dev/video0", Direction::Capture, MemoryRole::Exporter)
            .unwrap();
        assert!(matches!(
            ep.allocate_pool(4),
            Err(BridgeError::Alloc { .. })
        ));
        assert_eq!(ep.state(), EndpointState::Closed);
    }

    #[test]
    fn test_format_override() {
        let granted = FrameFormat::new(Fourcc::UYVY, 320, 240);
        let backend = MockBackend::new().with_format_override("/dev/video0", granted);
        let mut ep = backend
            .open("/dev/video0", Direction::Capture, MemoryRole::Exporter)
            .unwrap();
        let accepted = ep
            .negotiate(&FrameFormat::new(Fourcc::YUYV, 640, 480))
            .unwrap();
        assert_eq!(accepted, granted);
    }

    #[test]
    fn test_importer_cannot_export() {
        let backend = MockBackend::new();
        let mut ep = backend
            .open("/dev/video1", Direction::Output, MemoryRole::Importer)
            .unwrap();
        ep.allocate_pool(2).unwrap();
        assert!(ep.export_handle(0).is_err());
    }

    #[test]
    fn test_manual_clock_records_sleeps() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(5));
        clock.advance(Duration::from_millis(3));
        assert_eq!(clock.now() - start, Duration::from_millis(8));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(5)]);
        assert_eq!(clock.elapsed(), Duration::from_millis(8));
    }
}
