//! Session orchestrator
//!
//! Brings a tunnel session up and down:
//!
//! 1. resolve the active engine document
//! 2. make sure both executables are present
//! 3. establish the virtual interface
//! 4. launch the engine, then the relay bound to the interface
//! 5. publish the connected status and start sampling traffic
//!
//! Teardown runs the other way round. Every transition happens under one
//! async lock, so concurrent `start`/`stop` calls never interleave.
//!
//! # Usage
//!
//! ```rust,ignore
//! let session = SessionOrchestrator::new(parts, settings.interface.clone(), settings.stats.interval());
//! let mut status = session.bus().subscribe_status();
//!
//! session.start().await?;
//! // ...
//! session.shutdown().await;
//! ```

use crate::bus::{SessionStatus, StatusBus};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::interface::{InterfaceHandle, InterfaceProvider, InterfaceSettings};
use crate::process::{LaunchSpec, ProcessPair, ENGINE_NAME, RELAY_NAME};
use crate::provision::{BinaryProvider, LocalBinary};
use crate::stats::{SamplerHandle, StatsSampler, TrafficSource};
use crate::store::ProfileStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Start failed; rolled back to Idle right after
    Failed,
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A session was already up; nothing was launched
    AlreadyRunning,
}

/// External collaborators the session drives
pub struct SessionParts {
    pub store: Arc<ProfileStore>,
    pub engine: Arc<dyn BinaryProvider>,
    pub relay: Arc<dyn BinaryProvider>,
    pub interfaces: Arc<dyn InterfaceProvider>,
    pub traffic: Arc<dyn TrafficSource>,
}

impl SessionParts {
    /// Local binaries and interface counters from `settings`
    pub fn local(
        settings: &Settings,
        store: Arc<ProfileStore>,
        interfaces: Arc<dyn InterfaceProvider>,
    ) -> Self {
        Self {
            store,
            engine: Arc::new(LocalBinary::new(ENGINE_NAME, &settings.engine_binary)),
            relay: Arc::new(LocalBinary::new(RELAY_NAME, &settings.relay_binary)),
            interfaces,
            traffic: Arc::new(settings.stats.counters(&settings.interface.name)),
        }
    }
}

/// Everything a running session holds
struct Resources {
    interface: Option<Box<dyn InterfaceHandle>>,
    processes: ProcessPair,
    sampler: Option<SamplerHandle>,
}

impl Resources {
    fn new() -> Self {
        Self {
            interface: None,
            processes: ProcessPair::new(),
            sampler: None,
        }
    }
}

/// Owns the interface and both subprocesses of a tunnel session
pub struct SessionOrchestrator {
    store: Arc<ProfileStore>,
    engine: Arc<dyn BinaryProvider>,
    relay: Arc<dyn BinaryProvider>,
    interfaces: Arc<dyn InterfaceProvider>,
    sampler: StatsSampler,
    interface_settings: InterfaceSettings,
    bus: StatusBus,
    /// Readable state
    state: Arc<RwLock<SessionState>>,
    /// Transition lock and the resources it guards
    resources: Mutex<Resources>,
}

impl SessionOrchestrator {
    pub fn new(
        parts: SessionParts,
        interface_settings: InterfaceSettings,
        sample_interval: Duration,
    ) -> Self {
        Self::with_bus(parts, interface_settings, sample_interval, StatusBus::new())
    }

    /// Publish to an existing bus
    pub fn with_bus(
        parts: SessionParts,
        interface_settings: InterfaceSettings,
        sample_interval: Duration,
        bus: StatusBus,
    ) -> Self {
        Self {
            store: parts.store,
            engine: parts.engine,
            relay: parts.relay,
            interfaces: parts.interfaces,
            sampler: StatsSampler::new(parts.traffic, bus.clone(), sample_interval),
            interface_settings,
            bus,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            resources: Mutex::new(Resources::new()),
        }
    }

    /// Status and log channels
    pub fn bus(&self) -> &StatusBus {
        &self.bus
    }

    /// Get current state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    /// Bring the session up.
    ///
    /// Returns [`StartOutcome::AlreadyRunning`] without side effects when a
    /// session is up. On failure everything acquired so far is released, the
    /// error is reported once on the log channel and returned.
    pub async fn start(&self) -> Result<StartOutcome> {
        let mut resources = self.resources.lock().await;

        if self.state().await != SessionState::Idle {
            debug!("Start requested while session is up");
            return Ok(StartOutcome::AlreadyRunning);
        }

        self.set_state(SessionState::Starting).await;
        info!("Starting session");

        match self.bring_up(&mut resources).await {
            Ok(()) => {
                self.set_state(SessionState::Running).await;
                info!("Session running");
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                self.tear_down(&mut resources).await;
                self.set_state(SessionState::Failed).await;

                error!("Session start failed: {}", e);
                self.bus.emit_log(format!("Failed to start session: {}", e));
                self.bus.publish_status(SessionStatus::DISCONNECTED);

                self.set_state(SessionState::Idle).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, resources: &mut Resources) -> Result<()> {
        // The engine runs from its own directory, so relative paths would
        // resolve against the wrong place.
        let config = std::path::absolute(self.store.resolve_active()?)?;
        let engine = std::path::absolute(self.engine.ensure_present()?)?;
        let relay = std::path::absolute(self.relay.ensure_present()?)?;

        let tun_fd = match &resources.interface {
            Some(handle) => handle.raw_fd(),
            None => {
                let handle = self
                    .interfaces
                    .establish(&self.interface_settings)
                    .map_err(|e| Error::TunEstablishFailed(e.to_string()))?;
                let fd = handle.raw_fd();
                info!("Interface {} established (fd {})", handle.name(), fd);
                resources.interface = Some(handle);
                fd
            }
        };

        let mut processes = ProcessPair::new();
        let launched = processes
            .launch(
                &LaunchSpec::engine(&engine, &config),
                &LaunchSpec::relay(&relay, tun_fd, self.interface_settings.mtu),
                &self.bus,
            )
            .await;
        resources.processes = processes;
        launched?;

        let baseline = self.sampler.baseline();
        let start_time_ms = now_millis();
        self.bus
            .publish_status(SessionStatus::connected_at(start_time_ms));
        resources.sampler = Some(self.sampler.spawn(baseline, start_time_ms));

        Ok(())
    }

    /// Release everything, sampler first so it cannot publish afterwards
    async fn tear_down(&self, resources: &mut Resources) {
        if let Some(sampler) = resources.sampler.take() {
            sampler.stop();
        }
        resources.processes.stop().await;
        if let Some(mut interface) = resources.interface.take() {
            interface.close();
        }
    }

    /// Tear the session down. Does nothing when idle.
    pub async fn stop(&self) {
        let mut resources = self.resources.lock().await;

        if self.state().await == SessionState::Idle {
            return;
        }

        self.set_state(SessionState::Stopping).await;
        info!("Stopping session");

        self.tear_down(&mut resources).await;
        self.bus.publish_status(SessionStatus::DISCONNECTED);

        self.set_state(SessionState::Idle).await;
        info!("Session stopped");
    }

    /// Teardown before the owner exits
    pub async fn shutdown(&self) {
        self.stop().await;
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        // Children are killed on drop; the interface must be closed here so
        // host routing is restored.
        let resources = self.resources.get_mut();
        if let Some(sampler) = resources.sampler.take() {
            sampler.stop();
        }
        if let Some(mut interface) = resources.interface.take() {
            interface.close();
        }

        let was_idle = self
            .state
            .try_read()
            .map(|s| *s == SessionState::Idle)
            .unwrap_or(false);
        if !was_idle {
            self.bus.publish_status(SessionStatus::DISCONNECTED);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
