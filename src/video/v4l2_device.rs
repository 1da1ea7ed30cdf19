//! V4L2 endpoint implementation
//!
//! Device open, capability and format handling go through the `v4l` crate's
//! [`Device`]; buffer ioctls (REQBUFS, EXPBUF, QBUF, DQBUF, STREAMON/OFF) are
//! issued directly since the exporter/importer DMA-BUF split is not covered
//! by its stream types.

use std::ffi::c_void;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, trace};
use v4l::buffer::Type as BufferType;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys;
use v4l::video::{Capture, Output};
use v4l::Device;

use super::buffer_pool::Buffer;
use super::device::{
    DeviceBackend, DeviceEndpoint, Direction, EndpointState, MemoryRole, Readiness,
};
use super::format::FrameFormat;
use crate::error::{BridgeError, Result};

/// Backend opening real `/dev/videoN` nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Backend;

impl DeviceBackend for V4l2Backend {
    type Endpoint = V4l2Endpoint;

    fn open(&self, name: &str, direction: Direction, role: MemoryRole) -> Result<V4l2Endpoint> {
        V4l2Endpoint::open(name, direction, role)
    }

    fn wait_ready(
        &self,
        capture: &V4l2Endpoint,
        output: &V4l2Endpoint,
        interest: Readiness,
        timeout: Duration,
    ) -> Result<Readiness> {
        // SAFETY: both endpoints outlive this call and own their descriptors.
        let capture_fd = unsafe { BorrowedFd::borrow_raw(capture.fd()) };
        let output_fd = unsafe { BorrowedFd::borrow_raw(output.fd()) };

        let mut fds = Vec::with_capacity(2);
        let mut slots = Vec::with_capacity(2);
        if interest.capture {
            fds.push(PollFd::new(capture_fd, PollFlags::POLLIN));
            slots.push((capture, PollFlags::POLLIN));
        }
        if interest.output {
            fds.push(PollFd::new(output_fd, PollFlags::POLLOUT));
            slots.push((output, PollFlags::POLLOUT));
        }

        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => return Ok(Readiness::default()),
            Ok(_) => {}
            // A signal landed on this thread; report an empty cycle.
            Err(Errno::EINTR) => return Ok(Readiness::default()),
            Err(e) => return Err(BridgeError::Io(e.into())),
        }

        let mut ready = Readiness::default();
        for (fd, (endpoint, wanted)) in fds.iter().zip(slots) {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(BridgeError::queue(
                    endpoint.name(),
                    format!("poll reported {:?}", revents),
                ));
            }
            if revents.contains(wanted) {
                match endpoint.direction() {
                    Direction::Capture => ready.capture = true,
                    Direction::Output => ready.output = true,
                }
            }
        }
        Ok(ready)
    }
}

/// One opened V4L2 video node
pub struct V4l2Endpoint {
    name: String,
    device: Device,
    direction: Direction,
    role: MemoryRole,
    buf_type: u32,
    memory: u32,
    state: EndpointState,
    buffer_count: u32,
}

impl V4l2Endpoint {
    pub fn open(name: &str, direction: Direction, role: MemoryRole) -> Result<Self> {
        debug!("Opening video device: {} ({}, {:?})", name, direction, role);

        let device = Device::with_path(name).map_err(|e| BridgeError::open(name, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| BridgeError::open(name, format!("VIDIOC_QUERYCAP failed: {}", e)))?;
        let required = match direction {
            Direction::Capture => Flags::VIDEO_CAPTURE,
            Direction::Output => Flags::VIDEO_OUTPUT,
        };
        if !caps.capabilities.contains(required) {
            return Err(BridgeError::open(
                name,
                format!(
                    "video {} is not supported (capabilities: {:?})",
                    direction, caps.capabilities
                ),
            ));
        }
        debug!("{}: driver={} card={}", name, caps.driver, caps.card);

        let buf_type = match direction {
            Direction::Capture => BufferType::VideoCapture,
            Direction::Output => BufferType::VideoOutput,
        } as u32;
        let memory = match role {
            MemoryRole::Exporter => Memory::Mmap,
            MemoryRole::Importer => Memory::DmaBuf,
        } as u32;

        Ok(Self {
            name: name.to_string(),
            device,
            direction,
            role,
            buf_type,
            memory,
            state: EndpointState::Closed,
            buffer_count: 0,
        })
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn current_format(&self) -> std::io::Result<v4l::Format> {
        match self.direction {
            Direction::Capture => Capture::format(&self.device),
            Direction::Output => Output::format(&self.device),
        }
    }

    fn request_format(&self, fmt: &v4l::Format) -> std::io::Result<v4l::Format> {
        match self.direction {
            Direction::Capture => Capture::set_format(&self.device, fmt),
            Direction::Output => Output::set_format(&self.device, fmt),
        }
    }

    fn new_buffer(&self, index: u32) -> v4l_sys::v4l2_buffer {
        // SAFETY: v4l2_buffer is plain old data; all-zero is a valid value.
        let mut vb: v4l_sys::v4l2_buffer = unsafe { mem::zeroed() };
        vb.type_ = self.buf_type;
        vb.memory = self.memory;
        vb.index = index;
        vb
    }
}

impl DeviceEndpoint for V4l2Endpoint {
    type Handle = OwnedFd;

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
        let current = self
            .current_format()
            .map_err(|e| BridgeError::format(&self.name, format!("VIDIOC_G_FMT failed: {}", e)))?;
        info!(
            "{}: G_FMT(start): {}",
            self.name,
            FrameFormat::from_v4l(&current)
        );

        // set_format re-reads the format after S_FMT, so `granted` is what
        // the driver settled on rather than an echo of the request.
        let granted = self
            .request_format(&desired.to_v4l())
            .map_err(|e| BridgeError::format(&self.name, format!("VIDIOC_S_FMT failed: {}", e)))?;
        let accepted = FrameFormat::from_v4l(&granted);
        info!("{}: G_FMT(final): {}", self.name, accepted);

        Ok(accepted)
    }

    fn allocate_pool(&mut self, count: u32) -> Result<u32> {
        // SAFETY: see new_buffer.
        let mut req: v4l_sys::v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = self.buf_type;
        req.memory = self.memory;

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )
        }.map_err(|e| {
            BridgeError::alloc(&self.name, format!("VIDIOC_REQBUFS failed: {}", e))
        })?;
        if req.count < count {
            return Err(BridgeError::alloc(
                &self.name,
                format!("video node allocated only {} of {} buffers", req.count, count),
            ));
        }

        debug!("{}: {} buffers allocated ({:?})", self.name, req.count, self.role);
        self.buffer_count = req.count;
        self.state = EndpointState::Configured;
        Ok(req.count)
    }

    fn export_handle(&mut self, index: u32) -> Result<OwnedFd> {
        if self.role != MemoryRole::Exporter {
            return Err(BridgeError::alloc(
                &self.name,
                "VIDIOC_EXPBUF requested on importing endpoint",
            ));
        }

        // SAFETY: see new_buffer.
        let mut eb: v4l_sys::v4l2_exportbuffer = unsafe { mem::zeroed() };
        eb.type_ = self.buf_type;
        eb.index = index;
        eb.flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_EXPBUF,
                &mut eb as *mut _ as *mut c_void,
            )
        }.map_err(|e| {
            BridgeError::alloc(
                &self.name,
                format!("VIDIOC_EXPBUF(index = {}) failed: {}", index, e),
            )
        })?;
        trace!("{}: exported buffer {} as fd {}", self.name, index, eb.fd);

        // SAFETY: EXPBUF hands us a fresh descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(eb.fd) })
    }

    fn enqueue(&mut self, buffer: &Buffer<OwnedFd>) -> Result<()> {
        let mut vb = self.new_buffer(buffer.index());
        if self.role == MemoryRole::Importer {
            vb.m.fd = buffer.handle().as_raw_fd();
        }

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                &mut vb as *mut _ as *mut c_void,
            )
        }.map_err(|e| {
            BridgeError::queue(
                &self.name,
                format!("VIDIOC_QBUF(index = {}) failed: {}", buffer.index(), e),
            )
        })
    }

    fn dequeue(&mut self) -> Result<u32> {
        let mut vb = self.new_buffer(0);

        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut vb as *mut _ as *mut c_void,
            )
        }.map_err(|e| {
            BridgeError::queue(&self.name, format!("VIDIOC_DQBUF failed: {}", e))
        })?;
        if vb.index >= self.buffer_count {
            return Err(BridgeError::queue(
                &self.name,
                format!("driver returned unknown buffer {}", vb.index),
            ));
        }
        Ok(vb.index)
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        let (request, label) = if on {
            (v4l2::vidioc::VIDIOC_STREAMON, "STREAMON")
        } else {
            (v4l2::vidioc::VIDIOC_STREAMOFF, "STREAMOFF")
        };
        let mut typ = self.buf_type;

        unsafe { v4l2::ioctl(self.fd(), request, &mut typ as *mut _ as *mut c_void) }
            .map_err(|e| BridgeError::state(&self.name, format!("{} failed: {}", label, e)))?;

        self.state = if on {
            EndpointState::Streaming
        } else {
            EndpointState::Configured
        };
        debug!("{}: {}", self.name, label);
        Ok(())
    }
}
