//! Connection supervisor.
//!
//! One supervisor keeps one device streaming for as long as it runs:
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Subscribing -> Handshaking -> Streaming
//!            ^                                                        |
//!            |                                                        v
//!          Backoff <------------------------------------------- Disconnecting
//! ```
//!
//! Any failure goes to `Backoff`. Once a connection has been opened, leaving
//! goes through `Disconnecting` first, which always attempts a bounded
//! disconnect and clears `connected`. `Stopped` is reached from any state
//! when the handle asks the worker to stop; backoff and liveness sleeps wake
//! immediately, radio operations are allowed to finish or time out.
//!
//! The worker is the only writer of the reassembly buffer and of the
//! measurement store. Consumers read through [`SupervisorHandle`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use power_watchdog_types::WatchdogSnapshot;
use power_watchdog_types::protocol::HANDSHAKE;
use power_watchdog_types::uuid::WATCHDOG_CHARACTERISTIC;

use crate::dispatch::PacketDispatcher;
use crate::error::{Error, Result};
use crate::events::{DisconnectReason, EventDispatcher, EventReceiver, LinkEvent};
use crate::metrics::{LinkMetrics, LinkMetricsSnapshot};
use crate::reconnect::{Backoff, ReconnectOptions};
use crate::store::MeasurementStore;
use crate::transport::{Link, NotificationStream, Transport};
use crate::watchdog::LinkWatchdog;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, not yet running.
    Idle,
    /// Looking for the target address.
    Scanning,
    /// Opening the radio connection.
    Connecting,
    /// Enabling notifications.
    Subscribing,
    /// Writing the handshake.
    Handshaking,
    /// Receiving data.
    Streaming,
    /// Closing the connection.
    Disconnecting,
    /// Waiting before the next attempt.
    Backoff,
    /// Worker has exited.
    Stopped,
}

impl ConnectionState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one supervised device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// BLE address of the device.
    pub address: String,
    /// Adapter to use (matched against the start of the adapter name).
    pub adapter: Option<String>,
    /// How long to scan for the address before backing off.
    pub scan_timeout: Duration,
    /// Connection timeout (includes service discovery).
    pub connect_timeout: Duration,
    /// Timeout for enabling notifications.
    pub subscribe_timeout: Duration,
    /// Timeout for the acknowledged handshake write.
    pub write_timeout: Duration,
    /// Upper bound on the explicit disconnect.
    pub disconnect_timeout: Duration,
    /// How often the transport's connected flag is checked while streaming.
    pub poll_interval: Duration,
    /// Reconnect if no valid packet arrives for this long.
    pub watchdog_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            adapter: None,
            scan_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(15),
            subscribe_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            watchdog_timeout: Duration::from_secs(30),
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl SupervisorConfig {
    /// Defaults for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the adapter hint.
    #[must_use]
    pub fn adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Set the scan timeout.
    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the subscribe timeout.
    #[must_use]
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Set the handshake write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the liveness poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the watchdog timeout.
    #[must_use]
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Set the reconnect options.
    #[must_use]
    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::invalid_config("address must not be empty"));
        }
        let durations = [
            ("scan_timeout", self.scan_timeout),
            ("connect_timeout", self.connect_timeout),
            ("subscribe_timeout", self.subscribe_timeout),
            ("write_timeout", self.write_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
            ("poll_interval", self.poll_interval),
            ("watchdog_timeout", self.watchdog_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
        }
        self.reconnect.validate()
    }
}

/// Run `fut` with a deadline, mapping expiry to [`Error::Timeout`].
async fn bounded<T>(
    operation: &str,
    duration: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    timeout(duration, fut)
        .await
        .map_err(|_| Error::timeout(operation, duration))?
}

/// The connection state machine for one device.
///
/// Build one and hand it to [`ConnectionSupervisor::spawn`] or
/// [`ConnectionSupervisor::spawn_dedicated`].
pub struct ConnectionSupervisor<T: Transport> {
    transport: Arc<T>,
    config: SupervisorConfig,
    store: MeasurementStore,
    metrics: Arc<LinkMetrics>,
    events: EventDispatcher,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl<T: Transport> fmt::Debug for ConnectionSupervisor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("address", &self.config.address)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<T: Transport + 'static> ConnectionSupervisor<T> {
    /// Create a supervisor in the `Idle` state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid.
    pub fn new(transport: Arc<T>, config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        let backoff = config.reconnect.backoff();
        Ok(Self {
            transport,
            config,
            store: MeasurementStore::new(),
            metrics: Arc::new(LinkMetrics::new()),
            events: EventDispatcher::default(),
            state,
            cancel: CancellationToken::new(),
            backoff,
        })
    }

    /// Use an existing store, so a host can keep readers across supervisors.
    #[must_use]
    pub fn with_store(mut self, store: MeasurementStore) -> Self {
        self.store = store;
        self
    }

    /// Subscribe to events before the worker starts.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn handle(&self, worker: Worker) -> SupervisorHandle {
        SupervisorHandle {
            address: self.config.address.clone(),
            store: self.store.clone(),
            metrics: Arc::clone(&self.metrics),
            events: self.events.clone(),
            state: self.state.subscribe(),
            cancel: self.cancel.clone(),
            worker,
        }
    }

    /// Run the worker as a task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> SupervisorHandle {
        let mut handle = self.handle(Worker::None);
        let task = tokio::spawn(self.run());
        handle.worker = Worker::Task(task);
        handle
    }

    /// Run the worker on its own OS thread with a private current-thread
    /// runtime.
    pub fn spawn_dedicated(self) -> SupervisorHandle {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let mut handle = self.handle(Worker::None);
        let name = format!("power-watchdog-{}", self.config.address);

        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(self.run()),
                Err(e) => {
                    error!("Failed to build supervisor runtime: {}", e);
                    self.finish();
                }
            }
            let _ = done_tx.send(());
        });

        match spawned {
            Ok(thread) => {
                handle.worker = Worker::Thread {
                    thread: Some(thread),
                    done: done_rx,
                };
            }
            Err(e) => {
                // The closure, and the supervisor in it, was dropped, closing
                // the state channel.
                error!("Failed to spawn supervisor thread: {}", e);
            }
        }
        handle
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!("{}: {} -> {}", self.config.address, from, to);
            self.events.send(LinkEvent::StateChanged { from, to });
        }
    }

    fn finish(&self) {
        self.store.set_connected(false);
        self.set_state(ConnectionState::Stopped);
    }

    async fn run(mut self) {
        info!("Supervising Power Watchdog {}", self.config.address);

        while !self.cancel.is_cancelled() {
            match self.attempt().await {
                Ok(reason) => {
                    info!(
                        "Power Watchdog {} disconnected ({:?})",
                        self.config.address, reason
                    );
                }
                Err(Error::Cancelled) => debug!("Attempt abandoned on stop"),
                Err(Error::DeviceNotFound(reason)) => {
                    warn!("Power Watchdog {} not found: {}", self.config.address, reason);
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.config.address, e);
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            self.wait_backoff().await;
        }

        self.finish();
        info!("Supervisor for {} stopped", self.config.address);
    }

    async fn wait_backoff(&mut self) {
        let delay = self.backoff.next_delay();
        self.set_state(ConnectionState::Backoff);
        self.events.send(LinkEvent::BackoffScheduled {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        info!("Retrying {} in {:?}", self.config.address, delay);

        tokio::select! {
            _ = self.cancel.cancelled() => debug!("Backoff interrupted by stop"),
            _ = sleep(delay) => {}
        }
    }

    /// One pass from `Scanning` to either a failure or the end of a session.
    async fn attempt(&mut self) -> Result<DisconnectReason> {
        self.set_state(ConnectionState::Scanning);
        self.metrics.record_connection_attempt();
        info!("Scanning for Power Watchdog {}...", self.config.address);
        let link = self
            .transport
            .find(
                self.config.adapter.as_deref(),
                &self.config.address,
                self.config.scan_timeout,
            )
            .await?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to Power Watchdog {}...", self.config.address);
        if let Err(e) = link.connect(self.config.connect_timeout).await {
            // Service discovery can fail after the radio link is already up.
            if link.is_connected().await {
                self.disconnect(&link).await;
            }
            return Err(e);
        }

        let outcome = self.session(&link).await;

        self.set_state(ConnectionState::Disconnecting);
        self.disconnect(&link).await;

        if let Ok(reason) = &outcome {
            self.events.send(LinkEvent::Disconnected {
                address: self.config.address.clone(),
                reason: reason.clone(),
            });
        }
        outcome
    }

    /// Subscribe, handshake and stream until the session ends.
    async fn session(&mut self, link: &T::Link) -> Result<DisconnectReason> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.set_state(ConnectionState::Subscribing);
        info!("Subscribing to notifications on {}", WATCHDOG_CHARACTERISTIC);
        let notifications = bounded(
            "subscribe",
            self.config.subscribe_timeout,
            link.subscribe(WATCHDOG_CHARACTERISTIC),
        )
        .await?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.set_state(ConnectionState::Handshaking);
        info!("Sending handshake...");
        bounded(
            "handshake",
            self.config.write_timeout,
            link.write(WATCHDOG_CHARACTERISTIC, HANDSHAKE),
        )
        .await?;
        info!("Handshake sent, waiting for data...");

        self.store.set_connected(true);
        self.backoff.reset();
        self.metrics.record_session();
        self.set_state(ConnectionState::Streaming);
        self.events.send(LinkEvent::Connected {
            address: self.config.address.clone(),
        });

        Ok(self.stream(link, notifications).await)
    }

    async fn stream(
        &self,
        link: &T::Link,
        mut notifications: NotificationStream,
    ) -> DisconnectReason {
        let watchdog = LinkWatchdog::new(self.config.watchdog_timeout);
        let mut dispatcher = PacketDispatcher::new(
            self.store.clone(),
            watchdog.feeder(),
            Arc::clone(&self.metrics),
            self.events.clone(),
        );

        let starved = watchdog.starved();
        tokio::pin!(starved);

        let mut liveness = interval(self.config.poll_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.reset();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return DisconnectReason::Stopped;
                }
                _ = &mut starved => {
                    warn!(
                        "No valid packet from {} in {:?}, forcing reconnect",
                        self.config.address,
                        watchdog.timeout()
                    );
                    self.metrics.record_watchdog_expiration();
                    self.events.send(LinkEvent::WatchdogExpired);
                    return DisconnectReason::WatchdogExpired;
                }
                chunk = notifications.next() => match chunk {
                    Some(chunk) => dispatcher.handle_chunk(&chunk),
                    None => {
                        warn!("Notification stream from {} ended", self.config.address);
                        return DisconnectReason::StreamClosed;
                    }
                },
                _ = liveness.tick() => {
                    if !link.is_connected().await {
                        warn!("Power Watchdog {} link lost", self.config.address);
                        return DisconnectReason::LinkLost;
                    }
                }
            }
        }
    }

    async fn disconnect(&self, link: &T::Link) {
        info!("Disconnecting from Power Watchdog {}...", self.config.address);
        match bounded(
            "disconnect",
            self.config.disconnect_timeout,
            link.disconnect(),
        )
        .await
        {
            Ok(()) => debug!("Disconnected from {}", self.config.address),
            Err(e) => warn!("Disconnect from {} failed: {}", self.config.address, e),
        }
        self.store.set_connected(false);
    }
}

enum Worker {
    None,
    Task(JoinHandle<()>),
    Thread {
        thread: Option<std::thread::JoinHandle<()>>,
        done: std::sync::mpsc::Receiver<()>,
    },
}

/// Consumer side of a running supervisor.
///
/// Dropping the handle asks the worker to stop.
pub struct SupervisorHandle {
    address: String,
    store: MeasurementStore,
    metrics: Arc<LinkMetrics>,
    events: EventDispatcher,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    worker: Worker,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("connected", &self.connected())
            .finish()
    }
}

impl SupervisorHandle {
    /// Address of the supervised device.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the device is currently streaming.
    pub fn connected(&self) -> bool {
        self.store.connected()
    }

    /// Copy of the latest snapshot.
    pub fn snapshot(&self) -> WatchdogSnapshot {
        self.store.snapshot()
    }

    /// A reader handle to the measurement store.
    pub fn store(&self) -> MeasurementStore {
        self.store.clone()
    }

    /// Current supervisor state.
    ///
    /// Reports `Stopped` once the worker is gone, even if it never got to
    /// publish that state.
    pub fn state(&self) -> ConnectionState {
        if self.state.has_changed().is_err() {
            return ConnectionState::Stopped;
        }
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the supervisor reaches `target`, up to `limit`.
    ///
    /// Returns `false` on timeout or if the worker exited first.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.state.clone();
        matches!(
            timeout(limit, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        )
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> LinkMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ask the worker to stop and wait up to `limit` for it to finish.
    ///
    /// Returns `true` if the worker stopped in time.
    pub async fn stop(&mut self, limit: Duration) -> bool {
        self.cancel.cancel();

        let mut rx = self.state.clone();
        // A closed channel means the worker is already gone.
        let stopped = timeout(
            limit,
            rx.wait_for(|state| *state == ConnectionState::Stopped),
        )
        .await
        .is_ok();

        if stopped {
            match std::mem::replace(&mut self.worker, Worker::None) {
                Worker::Task(task) => {
                    if let Err(e) = task.await {
                        warn!("Supervisor task for {} ended abnormally: {}", self.address, e);
                    }
                }
                Worker::Thread { thread, .. } => {
                    if let Some(thread) = thread {
                        match tokio::task::spawn_blocking(move || thread.join()).await {
                            Ok(Ok(())) => {}
                            _ => warn!("Supervisor thread for {} panicked", self.address),
                        }
                    }
                }
                Worker::None => {}
            }
        } else {
            warn!(
                "Supervisor for {} did not stop within {:?}, connection may not be cleanly closed",
                self.address, limit
            );
        }
        stopped
    }

    /// Blocking variant of [`stop`](Self::stop) for hosts without a runtime.
    ///
    /// Only waits on workers started with
    /// [`ConnectionSupervisor::spawn_dedicated`]; for task workers it just
    /// requests the stop.
    pub fn stop_blocking(&mut self, limit: Duration) -> bool {
        self.cancel.cancel();

        let Worker::Thread { thread, done } = &mut self.worker else {
            return self.state() == ConnectionState::Stopped;
        };

        let finished = match done.recv_timeout(limit) {
            Ok(()) => true,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => true,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => false,
        };

        if finished {
            if let Some(thread) = thread.take()
                && thread.join().is_err()
            {
                warn!("Supervisor thread for {} panicked", self.address);
            }
        } else {
            warn!(
                "Supervisor for {} did not stop within {:?}, connection may not be cleanly closed",
                self.address, limit
            );
        }
        finished
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
