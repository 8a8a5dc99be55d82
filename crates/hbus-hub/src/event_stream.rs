//! Event Stream Processor
//!
//! In operate mode the router pushes frames on its own: module mirrors,
//! discrete system events, command echoes. This module runs the single read
//! loop that owns the read half of the line for as long as operate mode
//! lasts, realigns on the frame marker whenever the stream is corrupted, and
//! turns what it reads into [`Event`]s for the notification bridge.
//!
//! The loop never stops on bad input. It stops when asked to, when the router
//! acknowledges leaving operate mode, or when the line itself fails; the last
//! two are reported to the mode controller as faults.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hbus_metrics::{metric_defs, RouterLabels};
use hbus_protocol::{
    appended_frame, is_plausible_len, split_appended, BusMessage, CompactStatus, Event,
    MirrorStatus, MirrorTable, ProtocolError, ResponseFrame, Split, SystemEvent, RESP_MARKER,
    RESP_PREAMBLE, RESP_PREFIX_LEN,
};
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::BusReader;

/// Capacity of the hand-off queue to the notification bridge.
pub const EVENT_QUEUE_LEN: usize = 256;
/// Time the loop gets to finish its current read before it is cancelled.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Shared State
// ============================================================================

/// An event together with the router it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterEvent {
    /// Router id.
    pub router: u8,
    /// The event.
    pub event: Event,
}

#[derive(Debug, Default)]
struct StoreInner {
    table: MirrorTable,
    channel_status: Option<Vec<u8>>,
    system_mode: Option<u8>,
}

/// Router-side state learned from the stream.
///
/// The event stream is the only writer. Readers get copies and never hold
/// the lock across an await.
#[derive(Debug, Clone, Default)]
pub struct MirrorStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MirrorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the group reported with a module's mode changes.
    pub fn set_group(&self, module: u8, group: u8) {
        self.inner.write().table.set_group(module, group);
    }

    /// Store a fresh mirror and return the events it implies.
    pub fn apply(&self, status: MirrorStatus) -> Vec<Event> {
        self.inner.write().table.apply(status)
    }

    /// Copy of a module's current mirror.
    pub fn snapshot(&self, module: u8) -> Option<MirrorStatus> {
        self.inner.read().table.get(module).cloned()
    }

    /// Compact view of a module's current mirror.
    pub fn compact(&self, module: u8) -> Option<CompactStatus> {
        self.inner.read().table.get(module).map(MirrorStatus::compact)
    }

    /// Modules seen so far.
    pub fn modules(&self) -> Vec<u8> {
        self.inner.read().table.modules()
    }

    /// Last router channel status.
    pub fn channel_status(&self) -> Option<Vec<u8>> {
        self.inner.read().channel_status.clone()
    }

    /// Last reported system mode.
    pub fn system_mode(&self) -> Option<u8> {
        self.inner.read().system_mode
    }

    /// Forget everything; the next mirror of each module only seeds again.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.table.clear();
        inner.channel_status = None;
        inner.system_mode = None;
    }

    fn set_channel_status(&self, status: Vec<u8>) {
        self.inner.write().channel_status = Some(status);
    }

    fn set_system_mode(&self, mode: u8) {
        self.inner.write().system_mode = Some(mode);
    }
}

/// Running counters of the read loop.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames: AtomicU64,
    resyncs: AtomicU64,
    checksum_failures: AtomicU64,
    appended: AtomicU64,
    events: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Valid frames read.
    pub frames: u64,
    /// Realignments on the frame marker.
    pub resyncs: u64,
    /// Frames rejected by validation.
    pub checksum_failures: u64,
    /// Frames found appended to another.
    pub appended: u64,
    /// Events produced.
    pub events: u64,
    /// Events lost at the hand-off.
    pub dropped: u64,
}

impl StreamStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Everything the loop needs besides the read half.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Router id, used for logging and event attribution.
    pub router: u8,
    /// Mirror table and router state.
    pub mirrors: MirrorStore,
    /// Hand-off to the notification bridge.
    pub events: mpsc::Sender<RouterEvent>,
    /// Shared counters.
    pub stats: Arc<StreamStats>,
    /// Where faults are reported.
    pub faults: mpsc::UnboundedSender<StreamExit>,
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamExit {
    /// Stop was requested.
    Stopped,
    /// The router acknowledged leaving operate mode.
    ModeAckOff,
    /// The line failed.
    TransportFailure(String),
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a running read loop.
#[derive(Debug)]
pub struct StreamHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<StreamExit>,
}

impl StreamHandle {
    /// Ask the loop to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop, cancelling it if it does not end within `grace`.
    ///
    /// The read half is released once this returns.
    pub async fn stop(mut self, grace: Duration) -> StreamExit {
        self.request_stop();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                warn!("EventStream: task ended abnormally: {}", e);
                StreamExit::Stopped
            }
            Err(_) => {
                warn!("EventStream: no stop within {:?}, cancelling", grace);
                self.task.abort();
                let _ = (&mut self.task).await;
                StreamExit::Stopped
            }
        }
    }
}

/// Start the read loop on `reader`.
pub(crate) fn spawn(reader: OwnedMutexGuard<BusReader>, ctx: StreamContext) -> StreamHandle {
    let (stop, stop_rx) = watch::channel(false);
    let stream = EventStream {
        labels: RouterLabels::new(ctx.router),
        reader,
        ctx,
        pending: None,
        realigning: false,
    };
    let task = tokio::spawn(stream.run(stop_rx));
    StreamHandle { stop, task }
}

// ============================================================================
// Read Loop
// ============================================================================

struct EventStream {
    reader: OwnedMutexGuard<BusReader>,
    ctx: StreamContext,
    labels: RouterLabels,
    /// Appended frame waiting to be processed without a read.
    pending: Option<Vec<u8>>,
    /// Set from the first sign of misalignment until the next valid frame.
    realigning: bool,
}

enum Idle {
    Recheck,
    Stop,
    Ready,
    Failed(io::Error),
}

impl EventStream {
    async fn run(mut self, mut stop: watch::Receiver<bool>) -> StreamExit {
        let router = self.ctx.router;
        info!("EventStream[{}]: started", router);

        let exit = loop {
            if *stop.borrow() {
                break StreamExit::Stopped;
            }
            // Stop is only honoured between frames. Once a byte is in, the
            // frame is read to its end; `StreamHandle::stop` bounds that wait.
            if self.pending.is_none() {
                let idle = tokio::select! {
                    biased;
                    changed = stop.changed() => match changed {
                        Ok(()) => Idle::Recheck,
                        Err(_) => Idle::Stop,
                    },
                    ready = self.reader.wait_readable() => match ready {
                        Ok(()) => Idle::Ready,
                        Err(e) => Idle::Failed(e),
                    },
                };
                match idle {
                    Idle::Recheck => continue,
                    Idle::Stop => break StreamExit::Stopped,
                    Idle::Ready => {}
                    Idle::Failed(e) => {
                        error!("EventStream[{}]: read failed: {}", router, e);
                        break StreamExit::TransportFailure(e.to_string());
                    }
                }
            }
            match self.read_raw().await {
                Err(e) => {
                    error!("EventStream[{}]: read failed: {}", router, e);
                    break StreamExit::TransportFailure(e.to_string());
                }
                Ok((raw, appended)) => {
                    if let Some(exit) = self.handle_raw(raw, appended) {
                        break exit;
                    }
                }
            }
        };

        if exit != StreamExit::Stopped && !*stop.borrow() {
            let _ = self.ctx.faults.send(exit.clone());
        }
        info!("EventStream[{}]: stopped ({:?})", router, exit);
        exit
    }

    fn begin_resync(&mut self, detail: std::fmt::Arguments<'_>) {
        if self.realigning {
            debug!("EventStream[{}]: {}", self.ctx.router, detail);
            return;
        }
        self.realigning = true;
        self.ctx.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::BUS_RESYNCS.name, &self.labels.to_labels()).increment(1);
        warn!("EventStream[{}]: {}, resync", self.ctx.router, detail);
    }

    /// Read one raw frame: prefix aligned on the marker, plus the declared
    /// number of bytes. The flag is true for an appended frame.
    async fn read_raw(&mut self) -> io::Result<(Vec<u8>, bool)> {
        if let Some(raw) = self.pending.take() {
            return Ok((raw, true));
        }

        let mut prefix = self.reader.read_exact_bytes(RESP_PREFIX_LEN).await?;
        loop {
            if prefix[0] == RESP_PREAMBLE && prefix[1] == RESP_MARKER {
                if is_plausible_len(prefix[3]) {
                    break;
                }
                self.begin_resync(format_args!("degenerate length {}", prefix[3]));
                self.reader.unread(&prefix[1..]);
                prefix = self.scan_for_marker().await?;
                continue;
            }

            self.begin_resync(format_args!("bad header {}", hex::encode(&prefix)));
            let shift = (1..RESP_PREFIX_LEN).find(|&s| {
                prefix[s] == RESP_PREAMBLE && prefix.get(s + 1).map_or(true, |&b| b == RESP_MARKER)
            });
            match shift {
                Some(s) => {
                    let mut shifted = prefix[s..].to_vec();
                    shifted.extend_from_slice(&self.reader.read_exact_bytes(s).await?);
                    prefix = shifted;
                }
                None => {
                    self.reader.unread(&prefix[1..]);
                    prefix = self.scan_for_marker().await?;
                }
            }
        }

        let total = prefix[3] as usize + 1;
        let body = self.reader.read_exact_bytes(total - RESP_PREFIX_LEN).await?;
        prefix.extend_from_slice(&body);
        Ok((prefix, false))
    }

    /// Discard bytes one at a time until `ff 23`, then read the rest of the
    /// prefix.
    async fn scan_for_marker(&mut self) -> io::Result<Vec<u8>> {
        let mut prev = self.reader.read_byte().await?;
        loop {
            let byte = self.reader.read_byte().await?;
            if prev == RESP_PREAMBLE && byte == RESP_MARKER {
                let mut prefix = vec![RESP_PREAMBLE, RESP_MARKER];
                prefix.extend_from_slice(&self.reader.read_exact_bytes(2).await?);
                return Ok(prefix);
            }
            prev = byte;
        }
    }

    fn handle_raw(&mut self, raw: Vec<u8>, appended: bool) -> Option<StreamExit> {
        let router = self.ctx.router;
        let (first, rest, short_of) = match split_appended(raw.clone()) {
            Split::Single(bytes) => (bytes, None, None),
            Split::Appended { first, rest } => (first, Some(rest), None),
            Split::Truncated { expected } => (raw.clone(), None, Some(expected)),
        };

        let frame = match ResponseFrame::parse(first) {
            Ok(frame) => frame,
            Err(cause) => {
                self.reject(&raw, &cause, appended);
                return None;
            }
        };
        self.realigning = false;
        self.ctx.stats.frames.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::BUS_FRAMES.name, &self.labels.to_labels()).increment(1);

        if let Some(expected) = short_of {
            warn!(
                "EventStream[{}]: frame shorter than its type ({} < {}): {}",
                router,
                frame.len(),
                expected,
                hex::encode(frame.as_bytes())
            );
            return None;
        }

        if let Some(rest) = rest {
            self.ctx.stats.appended.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(metric_defs::BUS_APPENDED_FRAMES.name, &self.labels.to_labels())
                .increment(1);
            warn!(
                "EventStream[{}]: second frame appended: {} (complete: {})",
                router,
                hex::encode(&rest),
                hex::encode(&raw)
            );
            match appended_frame(frame.source(), &rest) {
                Ok(next) => self.pending = Some(next.into_bytes()),
                Err(e) => warn!("EventStream[{}]: appended frame dropped ({})", router, e),
            }
        }

        self.dispatch(&frame)
    }

    fn reject(&mut self, raw: &[u8], cause: &ProtocolError, appended: bool) {
        self.ctx.stats.checksum_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::BUS_CHECKSUM_FAILURES.name, &self.labels.to_labels())
            .increment(1);
        if appended {
            warn!(
                "EventStream[{}]: appended frame rejected ({}): {}",
                self.ctx.router,
                cause,
                hex::encode(raw)
            );
            return;
        }
        // The marker may have been a false one; rescan from the next byte.
        self.begin_resync(format_args!("invalid frame {} ({})", hex::encode(raw), cause));
        self.reader.unread(&raw[1..]);
    }

    fn dispatch(&mut self, frame: &ResponseFrame) -> Option<StreamExit> {
        let router = self.ctx.router;
        match BusMessage::decode(frame) {
            BusMessage::ModeAck { operate: false } => {
                info!("EventStream[{}]: router left operate mode", router);
                return Some(StreamExit::ModeAckOff);
            }
            BusMessage::ModeAck { operate: true } => {
                debug!("EventStream[{}]: operate mode acknowledged", router);
            }
            BusMessage::ChannelStatus(Some(status)) => {
                debug!("EventStream[{}]: channel status, mode {}", router, status[1]);
                self.ctx.mirrors.set_channel_status(status);
            }
            BusMessage::ChannelStatus(None) => {
                warn!("EventStream[{}]: channel status with mode 0 discarded", router);
            }
            BusMessage::CollectiveEcho { command } => {
                debug!("EventStream[{}]: collective command {}", router, command);
            }
            BusMessage::DirectEcho { module } => {
                debug!("EventStream[{}]: direct command to module {}", router, module);
            }
            BusMessage::ForwardEcho => {
                info!(
                    "EventStream[{}]: forward response discarded: {}",
                    router,
                    hex::encode(frame.payload())
                );
            }
            BusMessage::Mirror(status) => {
                for event in self.ctx.mirrors.apply(status) {
                    self.emit(event);
                }
            }
            BusMessage::System(system) => self.system_event(system),
            BusMessage::SystemMode { mode } => {
                debug!("EventStream[{}]: system mode {}", router, mode);
                self.ctx.mirrors.set_system_mode(mode);
            }
            BusMessage::GlobalFlag { .. } => {}
            BusMessage::Unrecognised { opcode } => {
                debug!(
                    "EventStream[{}]: response discarded (opcode {:#04x}): {}",
                    router,
                    opcode,
                    hex::encode(frame.as_bytes())
                );
            }
        }
        None
    }

    fn system_event(&mut self, system: SystemEvent) {
        let router = self.ctx.router;
        match system {
            SystemEvent::Module(event) => self.emit(event),
            SystemEvent::EventsStarted => info!("EventStream[{}]: router events started", router),
            SystemEvent::EventsStopped => info!("EventStream[{}]: router events stopped", router),
            SystemEvent::Unknown { detail } => {
                warn!("EventStream[{}]: unknown event {}", router, hex::encode(detail));
            }
            SystemEvent::DirectEcho { module } => {
                debug!("EventStream[{}]: direct command echo from module {}", router, module);
            }
            SystemEvent::Unmapped { module, event_id } => {
                debug!(
                    "EventStream[{}]: event {} from module {} not forwarded",
                    router, event_id, module
                );
            }
        }
    }

    /// Hand an event to the bridge without waiting.
    fn emit(&mut self, event: Event) {
        let router = self.ctx.router;
        self.ctx.stats.events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_defs::EVENTS_PRODUCED.name, &self.labels.to_labels()).increment(1);

        match self.ctx.events.try_send(RouterEvent { router, event }) {
            Ok(()) => debug!("EventStream[{}]: {}", router, event),
            Err(TrySendError::Full(_)) => {
                self.ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_defs::EVENTS_DROPPED.name, &self.labels.to_labels())
                    .increment(1);
                warn!("EventStream[{}]: bridge queue full, dropped {}", router, event);
            }
            Err(TrySendError::Closed(_)) => {
                self.ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("EventStream[{}]: no bridge attached, dropped {}", router, event);
            }
        }
    }
}
