//! Mode Controller
//!
//! The router runs in one of two modes. In server mode every command gets
//! exactly one reply, read by the command exchange. In operate mode the
//! router streams frames on its own and the event stream owns the read side.
//! This controller is the single entry point for switching between them:
//! transitions are serialized behind one lock, the current mode is published
//! on a watch channel, and every component that cares holds a receiver.
//!
//! Independent of the mode, a network block can be raised around internal
//! operations. API commands wait for it to clear before they run.

use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hbus_metrics::{metric_defs, RouterLabels};
use hbus_protocol::{templates, Command, DEFAULT_ROUTER_ID};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event_stream::{
    self, MirrorStore, RouterEvent, StatsSnapshot, StreamContext, StreamExit, StreamHandle,
    StreamStats, STOP_GRACE,
};
use crate::exchange::{Exchange, ExchangeError, ExchangeOutcome, AWAIT_TIMEOUT, REPLY_TIMEOUT};
use crate::transport::SerialBus;

/// First delay before operate mode is entered again after a stream fault.
pub const RECOVER_DELAY: Duration = Duration::from_secs(1);
/// Longest delay between recovery attempts.
pub const RECOVER_MAX_DELAY: Duration = Duration::from_secs(60);

/// Mode of the router bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusMode {
    /// Synchronous command/reply.
    Server,
    /// Router streams events and mirrors.
    Operate,
    /// Leaving operate mode.
    TransitioningToServer,
    /// Entering operate mode.
    TransitioningToOperate,
}

impl BusMode {
    /// Whether a transition is under way.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            BusMode::TransitioningToServer | BusMode::TransitioningToOperate
        )
    }
}

impl std::fmt::Display for BusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BusMode::Server => "server",
            BusMode::Operate => "operate",
            BusMode::TransitioningToServer => "to-server",
            BusMode::TransitioningToOperate => "to-operate",
        };
        f.write_str(name)
    }
}

// ============================================================================
// API Groups
// ============================================================================

/// Command group of a local API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApiGroup {
    /// Status and data queries.
    Data = 10,
    /// Settings reads and writes.
    Settings = 20,
    /// Output actions.
    Actions = 30,
    /// File transfers.
    Files = 40,
    /// Module setup.
    Setup = 50,
    /// Administration, firmware updates.
    Admin = 60,
    /// Forwarded commands for other hubs.
    Forward = 80,
}

/// What a command group needs from the bus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePolicy {
    /// Run in whatever mode the bus is in.
    Untouched,
    /// Run in server mode, then restore operate mode if it was active.
    ServerThenRestore,
    /// Run in server mode, then enter operate mode.
    ServerThenOperate,
    /// Run in server mode and stay there.
    ServerAndStay,
}

impl ApiGroup {
    /// Look up a group by its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            10 => ApiGroup::Data,
            20 => ApiGroup::Settings,
            30 => ApiGroup::Actions,
            40 => ApiGroup::Files,
            50 => ApiGroup::Setup,
            60 => ApiGroup::Admin,
            80 => ApiGroup::Forward,
            _ => return None,
        })
    }

    /// Mode handling for this group.
    pub fn policy(self) -> ModePolicy {
        match self {
            ApiGroup::Data | ApiGroup::Settings => ModePolicy::ServerThenRestore,
            ApiGroup::Actions => ModePolicy::ServerThenOperate,
            ApiGroup::Files | ApiGroup::Setup | ApiGroup::Admin => ModePolicy::ServerAndStay,
            ApiGroup::Forward => ModePolicy::Untouched,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Errors from mode transitions.
#[derive(Debug, Error)]
pub enum ModeError {
    /// Operate mode needs a known client address.
    #[error("no client address known, operate mode refused")]
    NoClient,

    /// The exchange failed during the transition.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Mode controller settings.
#[derive(Debug, Clone)]
pub struct ModeConfig {
    /// Router id.
    pub router: u8,
    /// Request mirror updates in operate mode.
    pub mirror: bool,
    /// Request discrete events in operate mode.
    pub events: bool,
    /// Deadline for mode acknowledgements.
    pub ack_timeout: Duration,
    /// Grace period for stopping the event stream.
    pub stop_grace: Duration,
    /// Allow operate mode without a client address.
    pub test_mode: bool,
    /// First delay before re-entering operate mode after a stream fault;
    /// doubles per failed attempt.
    pub recover_delay: Duration,
}

impl Default for ModeConfig {
    fn default() -> Self {
        ModeConfig {
            router: DEFAULT_ROUTER_ID,
            mirror: true,
            events: true,
            ack_timeout: REPLY_TIMEOUT,
            stop_grace: STOP_GRACE,
            test_mode: false,
            recover_delay: RECOVER_DELAY,
        }
    }
}

struct Inner {
    config: ModeConfig,
    bus: SerialBus,
    exchange: Exchange,
    mode: watch::Sender<BusMode>,
    blocked: watch::Sender<usize>,
    reachable: watch::Sender<bool>,
    client: watch::Sender<Option<IpAddr>>,
    test_mode: AtomicBool,
    /// Held for the duration of a transition; owns the running stream.
    transition: Mutex<Option<StreamHandle>>,
    /// Serializes API commands.
    api: Mutex<()>,
    /// Bumped by every API command and blocked operation.
    api_epoch: AtomicU64,
    stream: StreamContext,
    faults: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<StreamExit>>>,
    labels: RouterLabels,
}

/// Owner of the bus mode.
///
/// Cloning is cheap and every clone controls the same bus.
#[derive(Clone)]
pub struct ModeController {
    inner: Arc<Inner>,
}

impl ModeController {
    /// Create a controller for `bus`, starting in server mode.
    ///
    /// Events produced in operate mode go to `events`.
    pub fn new(
        bus: SerialBus,
        config: ModeConfig,
        mirrors: MirrorStore,
        events: mpsc::Sender<RouterEvent>,
    ) -> Self {
        let (mode, mode_rx) = watch::channel(BusMode::Server);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let exchange = Exchange::new(bus.clone(), config.router, mode_rx);
        let stream = StreamContext {
            router: config.router,
            mirrors,
            events,
            stats: Arc::new(StreamStats::default()),
            faults: faults_tx,
        };
        ModeController {
            inner: Arc::new(Inner {
                labels: RouterLabels::new(config.router),
                test_mode: AtomicBool::new(config.test_mode),
                config,
                bus,
                exchange,
                mode,
                blocked: watch::channel(0).0,
                reachable: watch::channel(true).0,
                client: watch::channel(None).0,
                transition: Mutex::new(None),
                api: Mutex::new(()),
                api_epoch: AtomicU64::new(0),
                stream,
                faults: parking_lot::Mutex::new(Some(faults_rx)),
            }),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> BusMode {
        *self.inner.mode.borrow()
    }

    /// Receiver of mode changes.
    pub fn subscribe(&self) -> watch::Receiver<BusMode> {
        self.inner.mode.subscribe()
    }

    /// Receiver of router reachability; false after a transport failure.
    pub fn router_reachable(&self) -> watch::Receiver<bool> {
        self.inner.reachable.subscribe()
    }

    /// Command exchange bound to this controller's mode.
    pub fn exchange(&self) -> Exchange {
        self.inner.exchange.clone()
    }

    /// Router state learned in operate mode.
    pub fn mirrors(&self) -> &MirrorStore {
        &self.inner.stream.mirrors
    }

    /// Counters of the event stream.
    pub fn stream_stats(&self) -> StatsSnapshot {
        self.inner.stream.stats.snapshot()
    }

    /// Whether the event stream is running.
    pub async fn stream_running(&self) -> bool {
        self.inner
            .transition
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Record the address of the latest client.
    pub fn set_client(&self, addr: IpAddr) {
        self.inner.client.send_replace(Some(addr));
    }

    /// Address of the latest client.
    pub fn client(&self) -> Option<IpAddr> {
        *self.inner.client.borrow()
    }

    /// Receiver of client address changes.
    pub fn client_watch(&self) -> watch::Receiver<Option<IpAddr>> {
        self.inner.client.subscribe()
    }

    /// Enable or disable test mode.
    pub fn set_test_mode(&self, on: bool) {
        self.inner.test_mode.store(on, Ordering::Relaxed);
    }

    /// Whether test mode is on.
    pub fn test_mode(&self) -> bool {
        self.inner.test_mode.load(Ordering::Relaxed)
    }

    fn publish(&self, mode: BusMode) {
        let previous = self.inner.mode.send_replace(mode);
        if previous == mode {
            return;
        }
        debug!("Mode[{}]: {} -> {}", self.inner.config.router, previous, mode);
        if !mode.is_transitioning() {
            metrics::counter!(
                metric_defs::MODE_TRANSITIONS.name,
                &self.inner.labels.with_target(&mode.to_string())
            )
            .increment(1);
            let operate = if mode == BusMode::Operate { 1.0 } else { 0.0 };
            metrics::gauge!(metric_defs::MODE_OPERATE.name, &self.inner.labels.to_labels())
                .set(operate);
        }
    }

    fn mark_unreachable(&self, reason: &str) {
        if self.inner.reachable.send_replace(false) {
            error!(
                "Mode[{}]: router unreachable: {}",
                self.inner.config.router, reason
            );
        }
    }

    fn mark_reachable(&self) {
        if !self.inner.reachable.send_replace(true) {
            info!("Mode[{}]: router reachable again", self.inner.config.router);
        }
    }

    /// Put the router into server mode at startup.
    ///
    /// Returns whether the router acknowledged.
    pub async fn set_initial_server_mode(&self) -> Result<bool, ModeError> {
        let _slot = self.inner.transition.lock().await;
        self.publish(BusMode::TransitioningToServer);
        let outcome = self
            .inner
            .exchange
            .send_and_await(&Command::new(templates::SET_SRV_MODE), self.inner.config.ack_timeout)
            .await;
        self.publish(BusMode::Server);
        match outcome {
            Ok(ExchangeOutcome::Reply(_)) => {
                self.mark_reachable();
                info!("Mode[{}]: server mode set", self.inner.config.router);
                Ok(true)
            }
            Ok(_) => {
                warn!(
                    "Mode[{}]: server mode not acknowledged",
                    self.inner.config.router
                );
                Ok(false)
            }
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                Err(e.into())
            }
        }
    }

    /// Switch to operate mode and start the event stream.
    ///
    /// Refused while no client address is known, unless in test mode.
    pub async fn enter_operate(&self) -> Result<(), ModeError> {
        let router = self.inner.config.router;
        let mut slot = self.inner.transition.lock().await;
        if self.mode() == BusMode::Operate && slot.is_some() {
            return Ok(());
        }
        if self.client().is_none() && !self.test_mode() {
            warn!("Mode[{}]: no client connected, staying in server mode", router);
            return Err(ModeError::NoClient);
        }

        self.publish(BusMode::TransitioningToOperate);
        let cmd = Command::new(templates::SET_OPR_MODE)
            .byte("mirr", u8::from(self.inner.config.mirror))
            .byte("evnt", u8::from(self.inner.config.events));
        match self
            .inner
            .exchange
            .send_and_await(&cmd, self.inner.config.ack_timeout)
            .await
        {
            Ok(ExchangeOutcome::Reply(ack)) => {
                if ack.payload().first() != Some(&1) {
                    warn!(
                        "Mode[{}]: unexpected operate acknowledgement {}",
                        router,
                        hex::encode(ack.as_bytes())
                    );
                }
                self.mark_reachable();
            }
            Ok(_) => warn!("Mode[{}]: operate mode not acknowledged, continuing", router),
            Err(e) => {
                self.publish(BusMode::Server);
                self.mark_unreachable(&e.to_string());
                return Err(e.into());
            }
        }

        let reader = self.inner.bus.lock_reader_owned().await;
        *slot = Some(event_stream::spawn(reader, self.inner.stream.clone()));
        self.publish(BusMode::Operate);
        info!("Mode[{}]: operate mode", router);
        Ok(())
    }

    /// Leave operate mode: stop the event stream and clear stray replies.
    pub async fn enter_server(&self) -> Result<(), ModeError> {
        let router = self.inner.config.router;
        let mut slot = self.inner.transition.lock().await;
        if self.mode() == BusMode::Server && slot.is_none() {
            return Ok(());
        }

        self.publish(BusMode::TransitioningToServer);
        if let Some(handle) = slot.as_ref() {
            handle.request_stop();
        }
        let sent = self
            .inner
            .exchange
            .send_only(&Command::new(templates::SET_SRV_MODE))
            .await;
        if let Some(handle) = slot.take() {
            let exit = handle.stop(self.inner.config.stop_grace).await;
            debug!("Mode[{}]: event stream ended: {:?}", router, exit);
        }
        if let Err(e) = sent {
            self.publish(BusMode::Server);
            self.mark_unreachable(&e.to_string());
            return Err(e.into());
        }

        match self.inner.exchange.drain_stray_replies(AWAIT_TIMEOUT).await {
            Ok(ExchangeOutcome::Reply(_)) => self.mark_reachable(),
            Ok(_) => warn!("Mode[{}]: no reply while draining", router),
            Err(e) => {
                self.publish(BusMode::Server);
                self.mark_unreachable(&e.to_string());
                return Err(e.into());
            }
        }
        self.publish(BusMode::Server);
        info!("Mode[{}]: server mode", router);
        Ok(())
    }

    /// Fall back to server mode after the event stream failed.
    async fn force_server_mode(&self, exit: StreamExit) {
        let router = self.inner.config.router;
        let mut slot = self.inner.transition.lock().await;
        if let Some(handle) = slot.take() {
            handle.stop(self.inner.config.stop_grace).await;
        }
        match exit {
            StreamExit::TransportFailure(reason) => {
                self.mark_unreachable(&reason);
                self.publish(BusMode::Server);
            }
            StreamExit::ModeAckOff => {
                warn!("Mode[{}]: router left operate mode on its own", router);
                self.publish(BusMode::TransitioningToServer);
                if let Err(e) = self.inner.exchange.drain_stray_replies(AWAIT_TIMEOUT).await {
                    self.mark_unreachable(&e.to_string());
                }
                self.publish(BusMode::Server);
            }
            StreamExit::Stopped => {}
        }
    }

    /// Re-enter operate mode after a fault, backing off between attempts.
    ///
    /// Gives up once the client is gone, the mode was changed by someone
    /// else, or an API command ran in the meantime.
    async fn recover_operate(&self) {
        let router = self.inner.config.router;
        let epoch = self.inner.api_epoch.load(Ordering::SeqCst);
        let mut delay = self.inner.config.recover_delay;
        loop {
            tokio::time::sleep(delay).await;
            self.wait_network_free().await;
            if self.client().is_none() && !self.test_mode() {
                debug!("Mode[{}]: no client, operate mode not recovered", router);
                return;
            }
            if self.mode() != BusMode::Server
                || self.inner.api_epoch.load(Ordering::SeqCst) != epoch
            {
                debug!("Mode[{}]: mode taken over, recovery ends", router);
                return;
            }
            match self.enter_operate().await {
                Ok(()) => {
                    info!("Mode[{}]: operate mode recovered", router);
                    return;
                }
                Err(e) => {
                    delay = (delay * 2).min(RECOVER_MAX_DELAY);
                    warn!(
                        "Mode[{}]: operate mode not recovered ({}), retry in {:?}",
                        router, e, delay
                    );
                }
            }
        }
    }

    /// Start the task that reacts to event stream faults.
    ///
    /// The bus is forced into server mode, then operate mode is entered
    /// again while a client is known. Returns `None` if the monitor was
    /// already started. The task runs until aborted.
    pub fn spawn_fault_monitor(&self) -> Option<JoinHandle<()>> {
        let mut faults = self.inner.faults.lock().take()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            while let Some(exit) = faults.recv().await {
                warn!(
                    "Mode[{}]: event stream fault: {:?}",
                    this.inner.config.router, exit
                );
                let recover = exit != StreamExit::Stopped;
                this.force_server_mode(exit).await;
                if recover {
                    this.recover_operate().await;
                }
            }
        }))
    }

    // ========================================================================
    // Network Block
    // ========================================================================

    /// Raise the network block until the returned guard is dropped.
    pub fn block_network(&self) -> NetworkBlock {
        self.inner.blocked.send_modify(|n| *n += 1);
        NetworkBlock {
            inner: self.inner.clone(),
        }
    }

    /// Whether API commands are held back.
    pub fn network_blocked(&self) -> bool {
        *self.inner.blocked.borrow() > 0
    }

    /// Wait until no network block is raised.
    pub async fn wait_network_free(&self) {
        let mut blocked = self.inner.blocked.subscribe();
        let _ = blocked.wait_for(|n| *n == 0).await;
    }

    /// Run an internal operation under the network block.
    ///
    /// Raises the block, waits for a running API command to finish and puts
    /// the bus into server mode before `op` runs. With `restore_operate`,
    /// operate mode is entered again afterwards if it was active before.
    /// `op` must not go through [`Self::dispatch`].
    pub async fn run_blocked<F, Fut, T>(&self, restore_operate: bool, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let router = self.inner.config.router;
        let _block = self.block_network();
        let _api = self.inner.api.lock().await;
        self.inner.api_epoch.fetch_add(1, Ordering::SeqCst);
        let was_operate = self.mode() == BusMode::Operate;
        if was_operate {
            if let Err(e) = self.enter_server().await {
                warn!("Mode[{}]: server mode not set for blocked operation: {}", router, e);
            }
        }
        let out = op().await;
        if restore_operate && was_operate && self.mode() != BusMode::Operate {
            if let Err(e) = self.enter_operate().await {
                warn!("Mode[{}]: could not restore operate mode: {}", router, e);
            }
        }
        out
    }

    /// Run an API command with the mode its group requires.
    ///
    /// Waits for the network block and for any API command already running.
    pub async fn dispatch<F, Fut, T>(&self, group: ApiGroup, handler: F) -> Result<T, ModeError>
    where
        F: FnOnce(Exchange) -> Fut,
        Fut: Future<Output = T>,
    {
        let _api = loop {
            self.wait_network_free().await;
            let guard = self.inner.api.lock().await;
            if !self.network_blocked() {
                break guard;
            }
        };
        self.inner.api_epoch.fetch_add(1, Ordering::SeqCst);

        let policy = group.policy();
        let was_operate = self.mode() == BusMode::Operate;
        if policy != ModePolicy::Untouched && was_operate {
            self.enter_server().await?;
        }

        let out = handler(self.exchange()).await;

        let reenter = match policy {
            ModePolicy::ServerThenRestore => was_operate,
            ModePolicy::ServerThenOperate => true,
            ModePolicy::Untouched | ModePolicy::ServerAndStay => false,
        };
        if reenter && self.mode() != BusMode::Operate {
            if let Err(e) = self.enter_operate().await {
                warn!(
                    "Mode[{}]: operate mode not entered after {:?} command: {}",
                    self.inner.config.router, group, e
                );
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for ModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeController")
            .field("router", &self.inner.config.router)
            .field("mode", &self.mode())
            .field("blocked", &self.network_blocked())
            .finish()
    }
}

/// Guard holding the network block raised.
#[must_use = "the block is released when the guard is dropped"]
pub struct NetworkBlock {
    inner: Arc<Inner>,
}

impl Drop for NetworkBlock {
    fn drop(&mut self) {
        self.inner.blocked.send_modify(|n| *n = n.saturating_sub(1));
    }
}
