//! Protocol constants
//!
//! Markers, opcodes, router event ids and the command template catalogue of
//! the router bus protocol.

// ============================================================================
// Frame Markers
// ============================================================================

/// First byte of every outbound (hub → router) frame.
pub const CMD_MARKER: u8 = 0x2A;
/// Trailing placeholder byte of a command template, replaced by the checksum.
pub const FRAME_SENTINEL: u8 = 0xFF;
/// First byte of every inbound (router → hub) frame.
pub const RESP_PREAMBLE: u8 = 0xFF;
/// Second byte of every inbound frame (`'#'`).
pub const RESP_MARKER: u8 = 0x23;
/// Length of the inbound prefix: preamble, marker, source, length.
pub const RESP_PREFIX_LEN: usize = 4;
/// Smallest declared length that can hold marker, source, length, opcode and
/// checksum.
pub const MIN_DECLARED_LEN: u8 = 5;
/// Largest declared length accepted before the length byte is distrusted.
///
/// The longest regular frame is the module mirror (declared length 231).
pub const MAX_DECLARED_LEN: u8 = 240;
/// Largest outbound frame the one-byte length field can describe.
pub const MAX_COMMAND_LEN: usize = 255;

/// Offset of the declared length in an outbound frame.
pub const CMD_LEN_INDEX: usize = 2;
/// Offset of the opcode in an outbound frame.
pub const CMD_OPCODE_INDEX: usize = 3;
/// Offset of the opcode in an inbound frame.
pub const RESP_OPCODE_INDEX: usize = 4;

/// Router id used when the configuration does not name one.
pub const DEFAULT_ROUTER_ID: u8 = 1;

// ============================================================================
// Response Opcodes (router → hub)
// ============================================================================

/// Global flag set notification.
pub const OP_GLOBAL_FLAG_SET: u8 = 10;
/// Global flag reset notification.
pub const OP_GLOBAL_FLAG_RESET: u8 = 11;
/// Echo of a collective command.
pub const OP_COLLECTIVE_CMD: u8 = 50;
/// Echo of a direct module command.
pub const OP_DIRECT_CMD: u8 = 68;
/// Echo of a forwarded command.
pub const OP_FORWARD_CMD: u8 = 87;
/// Router channel status snapshot.
pub const OP_CHANNEL_STATUS: u8 = 100;
/// Acknowledgement of a mode switch.
pub const OP_MODE_ACK: u8 = 0x85;
/// System event or event-mode control.
pub const OP_SYSTEM_EVENT: u8 = 0x86;
/// Module mirror status, also the stop-mirror reply.
pub const OP_MIRROR: u8 = 0x87;
/// Reply to the global mode query.
pub const OP_GLOBAL_MODE: u8 = 0x88;
/// System mode change notification.
pub const OP_SYSTEM_MODE: u8 = 137;
/// Router bootloader (in-system programming) marker.
pub const OP_ROUTER_ISP: u8 = 0xC9;
/// Router is still booting.
pub const OP_ROUTER_BOOTING: u8 = 0xFD;

/// System event sub-code: event mode started.
pub const SYS_EVENTS_STARTED: u8 = 254;
/// System event sub-code: event mode stopped.
pub const SYS_EVENTS_STOPPED: u8 = 255;
/// System event id reported for events the router cannot attribute.
pub const SYS_EVENT_UNKNOWN: u8 = 163;

// ============================================================================
// Router Event Ids (system event frames)
// ============================================================================

/// Flag changed.
pub const EVT_FLAG_CHANGE: u8 = 6;
/// Logic unit / counter changed.
pub const EVT_LOGIC_CHANGE: u8 = 7;
/// Output switched on.
pub const EVT_OUTPUT_ON: u8 = 10;
/// Output switched off.
pub const EVT_OUTPUT_OFF: u8 = 11;
/// Infrared command, short press.
pub const EVT_IR_SHORT: u8 = 23;
/// Infrared command, long press.
pub const EVT_IR_LONG: u8 = 24;
/// Infrared command, end of long press.
pub const EVT_IR_LONG_END: u8 = 25;
/// Direct module command echo.
pub const EVT_DIRECT_CMD: u8 = 68;
/// System error.
pub const EVT_SYS_ERROR: u8 = 101;
/// Router mode changed.
pub const EVT_MODE_CHANGE: u8 = 137;
/// Button short press.
pub const EVT_BUTTON_SHORT: u8 = 150;
/// Button long press.
pub const EVT_BUTTON_LONG: u8 = 151;
/// Switch closed.
pub const EVT_SWITCH_ON: u8 = 152;
/// Switch opened.
pub const EVT_SWITCH_OFF: u8 = 153;
/// End of a button long press.
pub const EVT_BUTTON_LONG_END: u8 = 154;
/// Access reader recognised a finger.
pub const EVT_EKEY_FINGER: u8 = 169;
/// Collective/direct command triggered on the router.
pub const EVT_COLLECTIVE_CMD: u8 = 253;

// ============================================================================
// Command Templates
// ============================================================================

/// Command templates understood by the router.
///
/// `<name>` is a one-byte field, `<name:N>` an N-byte field and `<name:*>` a
/// variable-length field. The length byte at offset 2 is recomputed on
/// encode and the trailing `0xFF` is replaced by the checksum.
pub mod templates {
    /// Switch the router to server (synchronous) mode.
    pub const SET_SRV_MODE: &[u8] = b"\x2a<rtr>\x06\x85\x00\xff";
    /// Switch the router to operate mode with mirror and event flags.
    pub const SET_OPR_MODE: &[u8] = b"\x2a<rtr>\x08\x85\x01<mirr><evnt>\xff";
    /// Query the router's global mode.
    pub const GET_GLOB_MODE: &[u8] = b"\x2a<rtr>\x05\x88\xff";
    /// Query the router status block.
    pub const GET_RT_STATUS: &[u8] = b"\x2a<rtr>\x06\x64L\xff";
    /// Start event forwarding.
    pub const START_EVENTS: &[u8] = b"\x2a<rtr>\x07\x86\xff\x64\xff";
    /// Stop event forwarding.
    pub const STOP_EVENTS: &[u8] = b"\x2a<rtr>\x07\x86\xfe\x64\xff";
    /// Start cyclic mirror updates.
    pub const START_MIRROR: &[u8] = b"\x2a<rtr>\x07\x87\xfc<cyc>\xff";
    /// Stop cyclic mirror updates.
    pub const STOP_MIRROR: &[u8] = b"\x2a<rtr>\x06\x87\xfe\xff";
    /// Request the full mirror of one module.
    pub const GET_MOD_MIRROR: &[u8] = b"\x2a<rtr>\x06\x87<mod>\xff";
    /// Switch outputs on (three mask bytes, low to high).
    pub const SET_OUT_ON: &[u8] = b"\x2a<rtr>\x0c\x44<mod>\x08\x0a\x45<outl><outm><outh>\xff";
    /// Switch outputs off (three mask bytes, low to high).
    pub const SET_OUT_OFF: &[u8] = b"\x2a<rtr>\x0c\x44<mod>\x08\x0b\x41<outl><outm><outh>\xff";
    /// Set a dimmer output value.
    pub const SET_DIMM_VAL: &[u8] = b"\x2a<rtr>\x0a\x44<mod>\x06\x0f<out><val>\xff";
    /// Trigger a direct command on one module.
    pub const CALL_DIR_CMD: &[u8] = b"\x2a<rtr>\x09\x44<mod>\x05\x20<cmd>\xff";
    /// Trigger a collective command on the router.
    pub const CALL_COLL_CMD: &[u8] = b"\x2a<rtr>\x06\x32<cmd>\xff";
    /// Set the router name.
    pub const SEND_RT_NAME: &[u8] = b"\x2a<rtr>\xff\x67\x53<name:*>\xff";
    /// Leave the bootloader and restart the router firmware.
    pub const SYSTEM_RESTART: &[u8] = b"\x2a<rtr>\x08\xc9\x4e\x45\x55\xff";
    /// Reboot the router.
    pub const RT_REBOOT: &[u8] = b"\x2a<rtr>\x0a\xf0\x52\x45\x53\x45\x54\xff";
}
