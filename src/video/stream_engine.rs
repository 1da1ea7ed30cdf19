//! Per-stream relay engine
//!
//! # Lifecycle
//!
//! ```text
//! Created ──init()──► Initialized ──start()/run()──► Streaming
//!                                                       │ cancel, idle timeout
//!                                                       │ or device error
//!                                                       ▼
//!                                   Stopped ◄──────── Stopping
//! ```
//!
//! The relay loop runs on a blocking thread. Each cycle waits (bounded) for
//! the capture endpoint to complete a buffer or the output endpoint to release
//! one, and performs the corresponding handoff. Streaming is switched off by
//! [`StreamingGuard`] on every exit path.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use super::buffer_pool::{BufferPool, Ownership};
use super::device::{DeviceBackend, DeviceEndpoint, Direction, MemoryRole, Readiness};
use super::format::FrameFormat;
use super::pacer::{Clock, FramePacer, SystemClock};
use crate::config::{ExportSide, RelayOptions, StreamConfig};
use crate::error::{BridgeError, Result};

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Endpoints identified, nothing opened
    Created,
    /// Devices opened, formats negotiated, buffers allocated and primed
    Initialized,
    /// Relay loop running
    Streaming,
    /// Loop is winding down
    Stopping,
    /// Streaming switched off on both endpoints; terminal
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Created => "created",
            StreamState::Initialized => "initialized",
            StreamState::Streaming => "streaming",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a relay loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop was requested
    Cancelled,
    /// No readiness for a full idle timeout
    Idle,
}

/// Relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Capture -> output handoffs
    pub frames_relayed: u64,
    /// Output -> capture handoffs
    pub buffers_returned: u64,
    /// Handoffs delayed by the pacer
    pub pacing_suspensions: u64,
}

/// Result of a finished stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub index: usize,
    pub reason: StopReason,
    pub stats: RelayStats,
}

/// Resources owned once a stream is initialized
struct Pipeline<E: DeviceEndpoint> {
    capture: E,
    output: E,
    pool: BufferPool<E::Handle>,
    format: FrameFormat,
}

/// Switches streaming off on both endpoints exactly once.
///
/// [`StreamingGuard::finish`] reports a failed STREAMOFF to the caller; on
/// any other exit the teardown runs in `Drop` and failures are only logged.
struct StreamingGuard<'a, E: DeviceEndpoint> {
    pipeline: Pipeline<E>,
    state: &'a watch::Sender<StreamState>,
    stopped: bool,
}

impl<E: DeviceEndpoint> StreamingGuard<'_, E> {
    /// Stop both endpoints, returning the first STREAMOFF failure
    fn finish(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.state.send_replace(StreamState::Stopping);

        let Pipeline {
            capture, output, ..
        } = &mut self.pipeline;
        let mut first_error = None;
        for endpoint in [capture, output] {
            if let Err(e) = endpoint.set_streaming(false) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        self.state.send_replace(StreamState::Stopped);
        debug!("Streaming off");
        first_error.map_or(Ok(()), Err)
    }
}

impl<E: DeviceEndpoint> Drop for StreamingGuard<'_, E> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// One capture -> output relay
pub struct StreamEngine<B: DeviceBackend> {
    index: usize,
    config: StreamConfig,
    options: RelayOptions,
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    pipeline: Option<Pipeline<B::Endpoint>>,
    state: Arc<watch::Sender<StreamState>>,
    cancel: CancellationToken,
    stats: Arc<Mutex<RelayStats>>,
}

impl<B: DeviceBackend> StreamEngine<B> {
    pub fn new(index: usize, config: StreamConfig, options: RelayOptions, backend: Arc<B>) -> Self {
        let (state, _) = watch::channel(StreamState::Created);
        Self {
            index,
            config,
            options,
            backend,
            clock: Arc::new(SystemClock),
            pipeline: None,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            stats: Arc::new(Mutex::new(RelayStats::default())),
        }
    }

    /// Use `clock` for pacing and idle detection
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observe `token` for cancellation instead of a private one
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Format of record: what the output endpoint accepted
    pub fn negotiated_format(&self) -> Option<FrameFormat> {
        self.pipeline.as_ref().map(|p| p.format)
    }

    /// Slots held by `owner`; `None` before init
    pub fn buffers_on(&self, owner: Ownership) -> Option<usize> {
        self.pipeline.as_ref().map(|p| p.pool.count(owner))
    }

    pub fn stats(&self) -> RelayStats {
        *self.stats.lock()
    }

    /// Created -> Initialized
    ///
    /// Opens both devices, negotiates the format (capture first, its result
    /// feeding the output request), allocates the buffer slots, exports them
    /// from the exporter and primes them all on the capture endpoint.
    pub fn init(&mut self) -> Result<()> {
        if self.state() != StreamState::Created {
            return Err(BridgeError::state(
                &self.config.capture_device,
                format!("stream {} initialized twice", self.index),
            ));
        }

        let config = &self.config;
        let _span = info_span!(
            "stream",
            index = self.index,
            capture = %config.capture_device,
            output = %config.output_device
        )
        .entered();
        info!("Initializing {}", config);

        let (capture_role, output_role) = match config.export_side {
            ExportSide::Capture => (MemoryRole::Exporter, MemoryRole::Importer),
            ExportSide::Output => (MemoryRole::Importer, MemoryRole::Exporter),
        };

        let mut capture =
            self.backend
                .open(&config.capture_device, Direction::Capture, capture_role)?;
        let accepted = capture.negotiate(&config.format)?;
        capture.allocate_pool(config.buffer_count)?;

        let mut output = self
            .backend
            .open(&config.output_device, Direction::Output, output_role)?;
        let format = output.negotiate(&accepted)?;
        output.allocate_pool(config.buffer_count)?;

        if !format.same_picture(&config.format) {
            warn!("Requested {}, negotiated {}", config.format, format);
        }

        let exporter = match config.export_side {
            ExportSide::Capture => &mut capture,
            ExportSide::Output => &mut output,
        };
        let handles = (0..config.buffer_count)
            .map(|index| exporter.export_handle(index))
            .collect::<Result<Vec<_>>>()?;

        let pool = BufferPool::prime(handles, &mut capture)?;

        self.pipeline = Some(Pipeline {
            capture,
            output,
            pool,
            format,
        });
        self.state.send_replace(StreamState::Initialized);
        Ok(())
    }

    /// Initialized -> Streaming -> Stopped, on the calling thread.
    ///
    /// Returns once the stream is stopped: by cancellation, by the idle
    /// timeout, or by a device error (which is returned).
    pub fn run(mut self) -> Result<StreamReport> {
        let Some(pipeline) = self.pipeline.take() else {
            return Err(BridgeError::state(
                &self.config.capture_device,
                format!("stream {} started before init", self.index),
            ));
        };

        let _span = info_span!(
            "stream",
            index = self.index,
            capture = %self.config.capture_device,
            output = %self.config.output_device
        )
        .entered();

        let mut guard = StreamingGuard {
            pipeline,
            state: &self.state,
            stopped: false,
        };
        guard.pipeline.capture.set_streaming(true)?;
        guard.pipeline.output.set_streaming(true)?;
        self.state.send_replace(StreamState::Streaming);
        info!("Streaming");

        let mut pacer = FramePacer::new(self.config.frame_rate.frame_interval(), self.clock.clone());
        let relayed = relay(
            self.backend.as_ref(),
            &mut guard.pipeline,
            &mut pacer,
            self.clock.as_ref(),
            &self.cancel,
            &self.options,
            &self.stats,
        );
        let stopped = guard.finish();

        // A relay error wins over a teardown error
        let result = relayed.and_then(|reason| stopped.map(|()| reason));
        let stats = self.stats();
        match result {
            Ok(reason) => {
                info!(
                    "Stopped ({:?}), {} frames relayed, {} pacing waits",
                    reason, stats.frames_relayed, stats.pacing_suspensions
                );
                Ok(StreamReport {
                    index: self.index,
                    reason,
                    stats,
                })
            }
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }

    /// Run the relay on a blocking worker thread and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> StreamHandle {
        let index = self.index;
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let stats = self.stats.clone();
        let task = tokio::task::spawn_blocking(move || self.run());
        StreamHandle {
            index,
            cancel,
            state,
            stats,
            task,
        }
    }
}

/// Relay loop body. Teardown is left to the caller's guard.
fn relay<B: DeviceBackend>(
    backend: &B,
    pipeline: &mut Pipeline<B::Endpoint>,
    pacer: &mut FramePacer,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    options: &RelayOptions,
    stats: &Mutex<RelayStats>,
) -> Result<StopReason> {
    let Pipeline {
        capture,
        output,
        pool,
        ..
    } = pipeline;
    let mut last_activity = clock.now();

    loop {
        if cancel.is_cancelled() {
            return Ok(StopReason::Cancelled);
        }
        let idle = clock.now().saturating_duration_since(last_activity);
        if idle >= options.idle_timeout {
            return Ok(StopReason::Idle);
        }

        // Only wait on an endpoint that holds at least one buffer
        let interest = Readiness {
            capture: pool.count(Ownership::OnCapture) > 0,
            output: pool.count(Ownership::OnOutput) > 0,
        };
        let slice = options.wait_slice.min(options.idle_timeout - idle);
        let ready = backend.wait_ready(capture, output, interest, slice)?;

        if ready.capture {
            pacer.pace();
            let index = capture.dequeue()?;
            let buffer = pool
                .handoff(index, Ownership::OnCapture)
                .map_err(|e| BridgeError::queue(capture.name(), e))?;
            output.enqueue(buffer)?;
        }

        if ready.output {
            let index = output.dequeue()?;
            let buffer = pool
                .handoff(index, Ownership::OnOutput)
                .map_err(|e| BridgeError::queue(output.name(), e))?;
            capture.enqueue(buffer)?;
        }

        if ready.any() {
            let mut s = stats.lock();
            s.frames_relayed += ready.capture as u64;
            s.buffers_returned += ready.output as u64;
            s.pacing_suspensions = pacer.stats().suspensions;
            drop(s);
            last_activity = clock.now();
        }
    }
}

/// Handle to a started stream
pub struct StreamHandle {
    index: usize,
    cancel: CancellationToken,
    state: Arc<watch::Sender<StreamState>>,
    stats: Arc<Mutex<RelayStats>>,
    task: JoinHandle<Result<StreamReport>>,
}

impl StreamHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> RelayStats {
        *self.stats.lock()
    }

    /// Request cancellation; observed at the next wait boundary
    pub fn stop(&self) {
        self.cancel.cancel();
        self.state.send_if_modified(|state| {
            if *state == StreamState::Streaming {
                *state = StreamState::Stopping;
                true
            } else {
                false
            }
        });
    }

    /// Wait for the stream to reach Stopped
    pub async fn join(self) -> Result<StreamReport> {
        self.task.await.map_err(|e| BridgeError::Worker {
            index: self.index,
            reason: e.to_string(),
        })?
    }
}
