//! Simulated router for integration tests.
//!
//! The router end of an in-memory pipe: it parses every command the hub
//! writes, records it, and answers mode, global-mode and probe commands the
//! way a router in server mode does. Tests push operate-mode traffic with
//! [`SimRouter::send`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hbus_hub::{MirrorStore, ModeConfig, ModeController, RouterEvent, SerialBus};
use hbus_protocol::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Deadline for anything a test waits on.
pub const TEST_WAIT: Duration = Duration::from_secs(5);

struct Script {
    mute: AtomicBool,
    booting_replies: AtomicUsize,
}

/// Router end of the line.
pub struct SimRouter {
    id: u8,
    writer: Arc<Mutex<Option<WriteHalf<DuplexStream>>>>,
    commands: mpsc::UnboundedReceiver<Vec<u8>>,
    script: Arc<Script>,
    task: JoinHandle<()>,
}

/// A bus whose far end is a simulated router with id `id`.
pub fn sim_bus(id: u8) -> (SerialBus, SimRouter) {
    let (router_end, hub_end) = tokio::io::duplex(4096);
    let (read_half, write_half) = tokio::io::split(router_end);
    let writer = Arc::new(Mutex::new(Some(write_half)));
    let script = Arc::new(Script {
        mute: AtomicBool::new(false),
        booting_replies: AtomicUsize::new(0),
    });
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let task = tokio::spawn(serve(id, read_half, writer.clone(), script.clone(), commands_tx));
    (
        SerialBus::new(hub_end),
        SimRouter {
            id,
            writer,
            commands,
            script,
            task,
        },
    )
}

async fn serve(
    id: u8,
    mut reader: ReadHalf<DuplexStream>,
    writer: Arc<Mutex<Option<WriteHalf<DuplexStream>>>>,
    script: Arc<Script>,
    commands: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        let mut head = [0u8; 3];
        if reader.read_exact(&mut head[..1]).await.is_err() {
            return;
        }
        if head[0] != CMD_MARKER {
            continue;
        }
        if reader.read_exact(&mut head[1..]).await.is_err() {
            return;
        }
        let mut cmd = head.to_vec();
        let mut tail = vec![0u8; (head[2] as usize).saturating_sub(3)];
        if reader.read_exact(&mut tail).await.is_err() {
            return;
        }
        cmd.extend_from_slice(&tail);
        let reply = reply_to(id, &cmd, &script);
        let _ = commands.send(cmd);

        if let Some(reply) = reply {
            if let Some(w) = writer.lock().await.as_mut() {
                let _ = w.write_all(reply.as_bytes()).await;
            }
        }
    }
}

fn reply_to(id: u8, cmd: &[u8], script: &Script) -> Option<ResponseFrame> {
    if script.mute.load(Ordering::SeqCst) {
        return None;
    }
    let opcode = *cmd.get(CMD_OPCODE_INDEX)?;
    match opcode {
        OP_MODE_ACK if cmd.get(4) == Some(&1) => Some(ResponseFrame::build(
            id,
            OP_MODE_ACK,
            &[1, cmd.get(5).copied().unwrap_or(0), cmd.get(6).copied().unwrap_or(0)],
        )),
        OP_MODE_ACK => Some(ResponseFrame::build(id, OP_MODE_ACK, &[0])),
        OP_GLOBAL_MODE => Some(ResponseFrame::build(id, OP_GLOBAL_MODE, &[0x20])),
        OP_MIRROR if cmd.get(4) == Some(&0xfe) => {
            let booting = script
                .booting_replies
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if booting {
                Some(ResponseFrame::build(id, OP_ROUTER_BOOTING, &[0]))
            } else {
                Some(ResponseFrame::build(id, OP_MIRROR, &[0xfe]))
            }
        }
        _ => None,
    }
}

impl SimRouter {
    /// Router id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Write raw bytes onto the line.
    pub async fn send(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().expect("line already closed");
        w.write_all(bytes).await.unwrap();
    }

    /// Stop or resume answering commands.
    pub fn set_mute(&self, mute: bool) {
        self.script.mute.store(mute, Ordering::SeqCst);
    }

    /// Answer the next `n` probes as a booting router.
    pub fn boot_for(&self, n: usize) {
        self.script.booting_replies.store(n, Ordering::SeqCst);
    }

    /// Next command the hub wrote.
    pub async fn next_command(&mut self) -> Vec<u8> {
        tokio::time::timeout(TEST_WAIT, self.commands.recv())
            .await
            .expect("no command from hub")
            .expect("router task ended")
    }

    /// Commands written so far and not yet taken.
    pub fn take_commands(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }

    /// Close the line.
    pub async fn hang_up(self) {
        self.task.abort();
        let _ = self.task.await;
        self.writer.lock().await.take();
    }
}

/// Opcodes of a list of commands.
pub fn opcodes(commands: &[Vec<u8>]) -> Vec<u8> {
    commands.iter().map(|c| c[CMD_OPCODE_INDEX]).collect()
}

/// A controller on `bus` with a known client.
pub fn controller(bus: SerialBus) -> (ModeController, mpsc::Receiver<RouterEvent>) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let config = ModeConfig {
        ack_timeout: Duration::from_millis(500),
        ..ModeConfig::default()
    };
    let ctl = ModeController::new(bus, config, MirrorStore::new(), events_tx);
    ctl.set_client("127.0.0.1".parse().unwrap());
    (ctl, events_rx)
}

/// Next event from the stream.
pub async fn next_event(rx: &mut mpsc::Receiver<RouterEvent>) -> RouterEvent {
    tokio::time::timeout(TEST_WAIT, rx.recv())
        .await
        .expect("no event")
        .expect("event channel closed")
}

/// Output-on system event frame.
pub fn output_on(router: u8, module: u8, channel: u8) -> ResponseFrame {
    ResponseFrame::build(router, OP_SYSTEM_EVENT, &[module, EVT_OUTPUT_ON, channel])
}

/// Button system event frame.
pub fn button(router: u8, module: u8, button: u8, event_id: u8) -> ResponseFrame {
    ResponseFrame::build(router, OP_SYSTEM_EVENT, &[module, event_id, button])
}

/// Mirror frame of a controller module.
pub fn controller_mirror(router: u8, module: u8, tweak: impl FnOnce(&mut [u8])) -> ResponseFrame {
    let mut bytes = vec![0u8; MIRROR_LEN];
    bytes[mirror_idx::ADDR] = module;
    bytes[mirror_idx::MOD_DESC] = 0x01;
    bytes[mirror_idx::MOD_DESC + 1] = 0x02;
    tweak(&mut bytes);
    ResponseFrame::build(router, OP_MIRROR, &bytes)
}
