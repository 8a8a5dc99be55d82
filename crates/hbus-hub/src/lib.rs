//! Router Bus Hub
//!
//! The hub side of the router bus: it owns the serial line, exchanges
//! commands with the router, switches the router between server and operate
//! mode, turns the operate-mode frame stream into events and forwards those
//! to the automation backend.
//!
//! # Components
//!
//! - [`SerialBus`]: the shared line, split into a buffered read half and a
//!   write half
//! - [`Exchange`]: command/reply correlation with deadlines
//! - [`ModeController`]: the single owner of the bus mode and the network
//!   block
//! - event stream: the operate-mode read loop, started and stopped by the
//!   controller, feeding [`RouterEvent`]s into a channel
//! - [`bridge::NotificationBridge`]: delivers events to the backend
//!
//! # Example
//!
//! ```rust,ignore
//! use hbus_hub::{MirrorStore, ModeConfig, ModeController, SerialBus};
//!
//! let bus = SerialBus::open("tcp://192.168.1.40:4001", 19200).await?;
//! let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
//! let ctl = ModeController::new(bus, ModeConfig::default(), MirrorStore::new(), events_tx);
//! ctl.set_initial_server_mode().await?;
//! ctl.spawn_fault_monitor();
//! ctl.set_client("192.168.1.2".parse()?);
//! ctl.enter_operate().await?;
//! ```

pub mod bridge;
mod config;
mod event_stream;
mod exchange;
mod mode;
mod transport;

pub use config::*;
pub use event_stream::*;
pub use exchange::*;
pub use mode::*;
pub use transport::*;
