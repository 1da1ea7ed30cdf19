//! Stream Manager
//!
//! Owns every configured stream of the process.
//!
//! # Architecture
//!
//! ```text
//! StreamManager
//!     │
//!     ├── shutdown: CancellationToken (parent)
//!     │       ├── child ──► StreamEngine 0 ──► spawn_blocking relay
//!     │       ├── child ──► StreamEngine 1 ──► spawn_blocking relay
//!     │       └── clone ──► ShutdownHandle (interrupt signal task)
//!     │
//!     └── join: FuturesUnordered over StreamHandle::join
//! ```
//!
//! Initialization is sequential and all-or-nothing: no stream starts unless
//! every stream initialized. Join is fail-fast: the first stream error stops
//! the rest, waits for their teardown and is returned.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::DeviceBackend;
use super::pacer::{Clock, SystemClock};
use super::stream_engine::{StreamEngine, StreamHandle, StreamReport, StreamState};
use crate::config::{RelayOptions, StreamConfig};
use crate::error::{BridgeError, Result};

/// Cloneable trigger for [`StreamManager::stop`] usable from another task
#[derive(Debug, Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Multi-stream controller
pub struct StreamManager<B: DeviceBackend> {
    backend: Arc<B>,
    configs: Vec<StreamConfig>,
    options: RelayOptions,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    ready: Vec<StreamEngine<B>>,
    running: Vec<StreamHandle>,
}

impl<B: DeviceBackend> StreamManager<B> {
    pub fn new(backend: B, configs: Vec<StreamConfig>, options: RelayOptions) -> Self {
        Self {
            backend: Arc::new(backend),
            configs,
            options,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            ready: Vec::new(),
            running: Vec::new(),
        }
    }

    /// Clock handed to every engine
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stream_count(&self) -> usize {
        self.configs.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Handle that stops every stream when triggered
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// State of every stream, in configuration order
    pub fn states(&self) -> Vec<StreamState> {
        if self.running.is_empty() {
            self.ready.iter().map(|e| e.state()).collect()
        } else {
            self.running.iter().map(|h| h.state()).collect()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .iter()
            .any(|h| h.state() == StreamState::Streaming)
    }

    /// Bring every stream to Initialized, in order.
    ///
    /// The first failure drops the streams built so far (closing their
    /// devices) and is returned; nothing is started.
    pub fn init(&mut self) -> Result<()> {
        if !self.ready.is_empty() || !self.running.is_empty() {
            return Err(BridgeError::Config("streams already initialized".to_string()));
        }
        info!("Initializing {} stream(s)", self.configs.len());

        let mut engines = Vec::with_capacity(self.configs.len());
        for (index, config) in self.configs.iter().enumerate() {
            let mut engine =
                StreamEngine::new(index, config.clone(), self.options, self.backend.clone())
                    .with_clock(self.clock.clone())
                    .with_cancel_token(self.shutdown.child_token());
            if let Err(e) = engine.init() {
                error!("Stream {} failed to initialize: {}", index, e);
                return Err(e);
            }
            engines.push(engine);
        }

        self.ready = engines;
        Ok(())
    }

    /// Start every initialized stream on its own worker; returns at once.
    pub fn start(&mut self) {
        if self.ready.is_empty() {
            debug!("No initialized streams to start");
            return;
        }
        for engine in self.ready.drain(..) {
            self.running.push(engine.start());
        }
        info!("{} stream(s) started", self.running.len());
    }

    /// Request cancellation of every stream
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping all streams");
        }
        self.shutdown.cancel();
        for handle in &self.running {
            handle.stop();
        }
    }

    /// Wait until every started stream reached Stopped.
    ///
    /// Reports come back in configuration order. On the first stream error
    /// the remaining streams are stopped and drained before the error is
    /// returned.
    pub async fn join(&mut self) -> Result<Vec<StreamReport>> {
        let mut pending: FuturesUnordered<_> =
            self.running.drain(..).map(|handle| handle.join()).collect();

        let mut reports = Vec::with_capacity(pending.len());
        let mut failure = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok(report) => {
                    debug!("Stream {} joined", report.index);
                    reports.push(report);
                }
                Err(e) if failure.is_none() => {
                    warn!("Stream failed, stopping the others: {}", e);
                    self.shutdown.cancel();
                    failure = Some(e);
                }
                Err(e) => warn!("{}", e),
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        reports.sort_by_key(|r| r.index);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_descriptor, StreamConfig};
    use crate::video::mock::MockBackend;
    use crate::video::stream_engine::StopReason;
    use std::time::Duration;

    fn configs(descriptors: &[&str]) -> Vec<StreamConfig> {
        descriptors
            .iter()
            .map(|d| parse_descriptor(d).unwrap())
            .collect()
    }

    fn quick() -> RelayOptions {
        RelayOptions::default()
            .with_idle_timeout(Duration::from_millis(150))
            .with_wait_slice(Duration::from_millis(10))
    }

    #[test]
    fn test_zero_streams_are_noops() {
        let mut manager = StreamManager::new(MockBackend::new(), Vec::new(), quick());
        manager.init().unwrap();
        manager.start();
        manager.stop();
        let reports = tokio_test::block_on(manager.join()).unwrap();
        assert!(reports.is_empty());
        assert!(!manager.is_running());
    }

    #[test]
    fn test_init_is_all_or_nothing() {
        let backend = MockBackend::new().with_missing_device("/dev/video3");
        let mut manager = StreamManager::new(
            backend.clone(),
            configs(&[
                "/dev/video0:/dev/video1@o@30:2:640,480:YUYV",
                "/dev/video2:/dev/video3@i@30:2:640,480:YUYV",
            ]),
            quick(),
        );

        assert!(matches!(
            manager.init(),
            Err(BridgeError::DeviceOpen { .. })
        ));
        manager.start();
        assert!(manager.states().is_empty());
        // First stream was built but never switched on
        assert!(backend.streaming_calls("/dev/video0").is_empty());
    }

    #[tokio::test]
    async fn test_streams_stop_on_idle() {
        let backend = MockBackend::new().with_frame_limit(5);
        let mut manager = StreamManager::new(
            backend.clone(),
            configs(&[
                "/dev/video0:/dev/video1@o@-1:2:640,480:YUYV",
                "/dev/video2:/dev/video3@i@0:3:320,240:UYVY",
            ]),
            quick(),
        );
        manager.init().unwrap();
        assert_eq!(manager.states(), vec![StreamState::Initialized; 2]);
        manager.start();

        let reports = manager.join().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].index, 0);
        assert!(reports.iter().all(|r| r.reason == StopReason::Idle));
        let relayed: u64 = reports.iter().map(|r| r.stats.frames_relayed).sum();
        assert_eq!(relayed, 5);
        for device in ["/dev/video0", "/dev/video1", "/dev/video2", "/dev/video3"] {
            assert_eq!(backend.streaming_calls(device), vec![true, false]);
        }
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_everything() {
        let backend = MockBackend::new().with_frame_limit(0);
        let mut manager = StreamManager::new(
            backend.clone(),
            configs(&[
                "/dev/video0:/dev/video1@o@30:2:640,480:YUYV",
                "/dev/video2:/dev/video3@o@30:2:640,480:YUYV",
            ]),
            quick().with_idle_timeout(Duration::from_secs(60)),
        );
        manager.init().unwrap();
        manager.start();

        let shutdown = manager.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger();
        });

        let reports = tokio::time::timeout(Duration::from_secs(2), manager.join())
            .await
            .expect("join timed out")
            .unwrap();
        assert!(reports.iter().all(|r| r.reason == StopReason::Cancelled));
        assert!(manager.shutdown_handle().is_triggered());
    }

    #[tokio::test]
    async fn test_join_is_fail_fast() {
        let backend = MockBackend::new().fail_enqueue_after("/dev/video1", 2);
        let mut manager = StreamManager::new(
            backend.clone(),
            configs(&[
                "/dev/video0:/dev/video1@i@-1:2:640,480:YUYV",
                "/dev/video2:/dev/video3@o@30:2:640,480:YUYV",
            ]),
            quick().with_idle_timeout(Duration::from_secs(60)),
        );
        manager.init().unwrap();
        manager.start();

        let err = tokio::time::timeout(Duration::from_secs(2), manager.join())
            .await
            .expect("join timed out")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Queue { .. }));
        // The healthy stream was cancelled and torn down too
        for device in ["/dev/video0", "/dev/video1", "/dev/video2", "/dev/video3"] {
            assert_eq!(backend.streaming_calls(device), vec![true, false]);
        }
    }

    #[tokio::test]
    async fn test_streamoff_failure_surfaces_from_join() {
        let backend = MockBackend::new()
            .with_frame_limit(2)
            .fail_streaming_off("/dev/video1");
        let mut manager = StreamManager::new(
            backend.clone(),
            configs(&["/dev/video0:/dev/video1@o@-1:2:640,480:YUYV"]),
            quick(),
        );
        manager.init().unwrap();
        manager.start();

        let err = manager.join().await.unwrap_err();
        assert!(matches!(err, BridgeError::State { .. }));
        assert_eq!(backend.streaming_calls("/dev/video0"), vec![true, false]);
        assert_eq!(backend.streaming_calls("/dev/video1"), vec![true, false]);
    }
}
