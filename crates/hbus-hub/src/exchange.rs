//! Command/Response Exchange
//!
//! The only path that writes commands to the router on behalf of a caller.
//! Three shapes are offered:
//!
//! - [`Exchange::send_only`]: write and return.
//! - [`Exchange::send_and_await`]: write, then read frames until one matches
//!   the expected reply or the deadline passes.
//! - [`Exchange::await_only`]: read a reply that is already on its way.
//!
//! Reads are only possible while the event stream is not running. In
//! operate mode the stream owns the read side and a read request returns
//! [`ExchangeOutcome::Unavailable`] at once.

use std::io;
use std::time::Duration;

use hbus_metrics::{metric_defs, RouterLabels};
use hbus_protocol::{
    templates, Command, ProtocolError, ResponseFrame, OP_GLOBAL_MODE, OP_MIRROR, OP_ROUTER_BOOTING,
    OP_ROUTER_ISP,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mode::BusMode;
use crate::transport::{BusReader, SerialBus};

/// Default deadline for a command reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(3);
/// Default deadline for a reply already in flight.
pub const AWAIT_TIMEOUT: Duration = Duration::from_millis(1500);
/// Wait after the router reported it is booting.
pub const BOOT_WAIT: Duration = Duration::from_secs(5);
/// Probe attempts before the router is declared unreachable.
pub const PROBE_ATTEMPTS: usize = 3;

/// Errors that end an exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The serial line failed.
    #[error("bus transport failed: {0}")]
    Transport(#[from] io::Error),

    /// The command could not be encoded.
    #[error("command encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// How a read request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The matching reply.
    Reply(ResponseFrame),
    /// The deadline passed without a matching reply.
    Timeout,
    /// The bus is in operate mode; nothing was read.
    Unavailable,
}

impl ExchangeOutcome {
    /// The reply, if there was one.
    pub fn reply(self) -> Option<ResponseFrame> {
        match self {
            ExchangeOutcome::Reply(frame) => Some(frame),
            _ => None,
        }
    }

    /// Whether the deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeOutcome::Timeout)
    }
}

/// Which frames count as the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMatcher {
    router: u8,
    opcodes: Vec<u8>,
}

impl ReplyMatcher {
    /// Any frame from `router`.
    pub fn any(router: u8) -> Self {
        ReplyMatcher {
            router,
            opcodes: Vec::new(),
        }
    }

    /// Frames from `router` with `opcode`.
    pub fn opcode(router: u8, opcode: u8) -> Self {
        Self::opcodes(router, &[opcode])
    }

    /// Frames from `router` with any of `opcodes`.
    pub fn opcodes(router: u8, opcodes: &[u8]) -> Self {
        ReplyMatcher {
            router,
            opcodes: opcodes.to_vec(),
        }
    }

    /// Whether `frame` is the reply.
    pub fn matches(&self, frame: &ResponseFrame) -> bool {
        frame.source() == self.router
            && (self.opcodes.is_empty() || self.opcodes.contains(&frame.opcode()))
    }
}

/// What the startup probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterProbe {
    /// The router answered.
    Available,
    /// No usable answer after every attempt.
    Unreachable,
}

/// Command/response access to one router.
#[derive(Clone)]
pub struct Exchange {
    bus: SerialBus,
    router: u8,
    mode: watch::Receiver<BusMode>,
    labels: RouterLabels,
}

impl Exchange {
    /// Create an exchange that consults `mode` before every read.
    pub fn new(bus: SerialBus, router: u8, mode: watch::Receiver<BusMode>) -> Self {
        Exchange {
            bus,
            router,
            mode,
            labels: RouterLabels::new(router),
        }
    }

    /// Create an exchange for a bus that never leaves server mode.
    pub fn standalone(bus: SerialBus, router: u8) -> Self {
        let (_tx, rx) = watch::channel(BusMode::Server);
        Self::new(bus, router, rx)
    }

    /// Router this exchange talks to.
    pub fn router(&self) -> u8 {
        self.router
    }

    /// The underlying line.
    pub fn bus(&self) -> &SerialBus {
        &self.bus
    }

    fn reads_blocked(&self) -> bool {
        *self.mode.borrow() == BusMode::Operate
    }

    /// Encode and write `cmd` without waiting.
    pub async fn send_only(&self, cmd: &Command) -> Result<(), ExchangeError> {
        let bytes = cmd.encode(self.router)?;
        debug!("Exchange[{}]: -> {}", self.router, hex::encode(&bytes));
        self.bus.write(&bytes).await?;
        Ok(())
    }

    /// Write `cmd` and wait for the reply carrying the same opcode.
    pub async fn send_and_await(
        &self,
        cmd: &Command,
        timeout: Duration,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let matcher = ReplyMatcher::opcode(self.router, cmd.opcode()?);
        self.send_and_await_matching(cmd, &matcher, timeout).await
    }

    /// Write `cmd` and wait for a frame accepted by `matcher`.
    pub async fn send_and_await_matching(
        &self,
        cmd: &Command,
        matcher: &ReplyMatcher,
        timeout: Duration,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        if self.reads_blocked() {
            warn!(
                "Exchange[{}]: reply requested in operate mode, command not sent",
                self.router
            );
            return Ok(ExchangeOutcome::Unavailable);
        }
        let bytes = cmd.encode(self.router)?;
        let mut reader = self.bus.lock_reader().await;
        debug!("Exchange[{}]: -> {}", self.router, hex::encode(&bytes));
        self.bus.write(&bytes).await?;
        self.read_matching(&mut reader, matcher, timeout).await
    }

    /// Wait for any reply from the router without writing.
    pub async fn await_only(&self, timeout: Duration) -> Result<ExchangeOutcome, ExchangeError> {
        self.await_matching(&ReplyMatcher::any(self.router), timeout)
            .await
    }

    /// Wait for a frame accepted by `matcher` without writing.
    pub async fn await_matching(
        &self,
        matcher: &ReplyMatcher,
        timeout: Duration,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        if self.reads_blocked() {
            warn!(
                "Exchange[{}]: await requested in operate mode, ignored",
                self.router
            );
            return Ok(ExchangeOutcome::Unavailable);
        }
        let mut reader = self.bus.lock_reader().await;
        self.read_matching(&mut reader, matcher, timeout).await
    }

    async fn read_matching(
        &self,
        reader: &mut BusReader,
        matcher: &ReplyMatcher,
        timeout: Duration,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let started = Instant::now();
        let wait = async {
            loop {
                let (frame, resyncs) = reader.next_frame().await?;
                if resyncs > 0 {
                    metrics::counter!(metric_defs::BUS_RESYNCS.name, &self.labels.to_labels())
                        .increment(resyncs as u64);
                }
                if matcher.matches(&frame) {
                    return Ok::<_, io::Error>(frame);
                }
                debug!(
                    "Exchange[{}]: skipping unrelated frame {}",
                    self.router,
                    hex::encode(frame.as_bytes())
                );
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(frame)) => {
                metrics::histogram!(metric_defs::EXCHANGE_LATENCY.name, &self.labels.to_labels())
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                debug!(
                    "Exchange[{}]: <- {}",
                    self.router,
                    hex::encode(frame.as_bytes())
                );
                Ok(ExchangeOutcome::Reply(frame))
            }
            Ok(Err(e)) => Err(ExchangeError::Transport(e)),
            Err(_) => {
                metrics::counter!(metric_defs::EXCHANGE_TIMEOUTS.name, &self.labels.to_labels())
                    .increment(1);
                warn!(
                    "Exchange[{}]: no reply within {:?}",
                    self.router, timeout
                );
                Ok(ExchangeOutcome::Timeout)
            }
        }
    }

    /// Clear replies left over from operate mode.
    ///
    /// Drops whatever is already buffered, then queries the global mode and
    /// discards every frame up to its reply.
    pub async fn drain_stray_replies(
        &self,
        timeout: Duration,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let stray = self.bus.lock_reader().await.discard_buffered();
        if stray > 0 {
            debug!(
                "Exchange[{}]: dropped {} stray bytes before drain",
                self.router, stray
            );
        }
        let cmd = Command::new(templates::GET_GLOB_MODE);
        let matcher = ReplyMatcher::opcode(self.router, OP_GLOBAL_MODE);
        self.send_and_await_matching(&cmd, &matcher, timeout).await
    }

    /// Check that the router is up and running its firmware.
    ///
    /// A booting router is given time to finish; a router stuck in its
    /// bootloader is told to restart.
    pub async fn probe_router(&self) -> Result<RouterProbe, ExchangeError> {
        let cmd = Command::new(templates::STOP_MIRROR);
        let matcher =
            ReplyMatcher::opcodes(self.router, &[OP_MIRROR, OP_ROUTER_BOOTING, OP_ROUTER_ISP]);

        for attempt in 1..=PROBE_ATTEMPTS {
            let outcome = self
                .send_and_await_matching(&cmd, &matcher, REPLY_TIMEOUT)
                .await?;
            match outcome {
                ExchangeOutcome::Reply(frame) => match frame.opcode() {
                    OP_ROUTER_BOOTING => {
                        info!("Exchange[{}]: router is booting, waiting", self.router);
                        tokio::time::sleep(BOOT_WAIT).await;
                    }
                    OP_ROUTER_ISP => {
                        warn!(
                            "Exchange[{}]: router in bootloader, restarting firmware",
                            self.router
                        );
                        self.send_only(&Command::new(templates::SYSTEM_RESTART))
                            .await?;
                        tokio::time::sleep(BOOT_WAIT).await;
                    }
                    _ => {
                        info!("Exchange[{}]: router available", self.router);
                        return Ok(RouterProbe::Available);
                    }
                },
                ExchangeOutcome::Timeout => {
                    warn!(
                        "Exchange[{}]: probe {}/{} unanswered",
                        self.router, attempt, PROBE_ATTEMPTS
                    );
                }
                ExchangeOutcome::Unavailable => return Ok(RouterProbe::Available),
            }
        }
        Ok(RouterProbe::Unreachable)
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("router", &self.router)
            .field("mode", &*self.mode.borrow())
            .finish()
    }
}
