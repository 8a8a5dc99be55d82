//! Normalized events and system event decoding.

use crate::constants::*;

/// Kind of a normalized event, as understood by the automation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventKind {
    /// Button press; arg2 is 1 short, 2 long, 3 long end.
    Button = 1,
    /// Switch input; arg2 is 1 closed, 0 open.
    Switch = 2,
    /// Output state; arg2 is 1 on, 0 off.
    Output = 3,
    /// Cover position.
    CoverValue = 4,
    /// Blade position.
    BladeValue = 5,
    /// Dimmer value.
    DimValue = 6,
    /// Finger recognised by an access reader.
    Finger = 7,
    /// Infrared command.
    IrCommand = 8,
    /// Flag state; arg2 is 0 or 1.
    Flag = 9,
    /// Counter value.
    CounterValue = 10,
    /// Percentage value.
    Percent = 11,
    /// Direct command triggered on the router.
    DirectCommand = 12,
    /// Movement detected.
    Move = 13,
    /// Analog input value.
    AnalogValue = 14,
    /// Module or router mode.
    Mode = 15,
    /// System error.
    SystemError = 16,
}

impl EventKind {
    /// Numeric code sent to the backend.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Look up a kind by its numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        use EventKind::*;
        Some(match code {
            1 => Button,
            2 => Switch,
            3 => Output,
            4 => CoverValue,
            5 => BladeValue,
            6 => DimValue,
            7 => Finger,
            8 => IrCommand,
            9 => Flag,
            10 => CounterValue,
            11 => Percent,
            12 => DirectCommand,
            13 => Move,
            14 => AnalogValue,
            15 => Mode,
            16 => SystemError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The unit handed to the notification bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    /// Module address, 0 for router-level events.
    pub module: u8,
    /// What happened.
    pub kind: EventKind,
    /// First argument, usually the channel or unit index.
    pub arg1: i32,
    /// Second argument, usually the new value.
    pub arg2: i32,
}

impl Event {
    /// Create an event.
    pub fn new(module: u8, kind: EventKind, arg1: i32, arg2: i32) -> Self {
        Event { module, kind, arg1, arg2 }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mod {} {} ({}, {})", self.module, self.kind, self.arg1, self.arg2)
    }
}

// ============================================================================
// System Events (opcode 0x86)
// ============================================================================

/// Decoded content of a system event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// Router started forwarding events.
    EventsStarted,
    /// Router stopped forwarding events.
    EventsStopped,
    /// Router reported an event it cannot attribute.
    Unknown {
        /// Raw event bytes.
        detail: Vec<u8>,
    },
    /// A module event mapped to a normalized event.
    Module(Event),
    /// Echo of a direct command; logged, not forwarded.
    DirectEcho {
        /// Module addressed.
        module: u8,
    },
    /// Event id without a mapping.
    Unmapped {
        /// Module address.
        module: u8,
        /// Router event id.
        event_id: u8,
    },
}

/// Event ids whose frames carry a second argument byte.
fn has_two_args(event_id: u8) -> bool {
    matches!(
        event_id,
        EVT_MODE_CHANGE
            | EVT_EKEY_FINGER
            | EVT_IR_SHORT
            | EVT_FLAG_CHANGE
            | EVT_LOGIC_CHANGE
            | EVT_SYS_ERROR
    )
}

impl SystemEvent {
    /// Expected wire length of the system event starting at `raw[0]`.
    ///
    /// `raw` holds the whole frame including prefix. Returns `None` when the
    /// frame is too short to tell.
    pub fn expected_len(raw: &[u8]) -> Option<usize> {
        let sub = *raw.get(5)?;
        if sub == SYS_EVENTS_STARTED || sub == SYS_EVENTS_STOPPED {
            return Some(8);
        }
        let event_id = *raw.get(6)?;
        if event_id == SYS_EVENT_UNKNOWN || raw[3] == 6 {
            return Some(7);
        }
        if event_id == EVT_DIRECT_CMD {
            return raw.get(8).map(|&n| n as usize + 7);
        }
        Some(if has_two_args(event_id) { 10 } else { 9 })
    }

    /// Decode a complete, validated system event frame.
    pub fn decode(raw: &[u8]) -> SystemEvent {
        let body_end = raw.len().saturating_sub(1);
        let sub = raw.get(5).copied().unwrap_or(0);
        if sub == SYS_EVENTS_STARTED {
            return SystemEvent::EventsStarted;
        }
        if sub == SYS_EVENTS_STOPPED {
            return SystemEvent::EventsStopped;
        }

        let event_id = raw.get(6).copied().unwrap_or(SYS_EVENT_UNKNOWN);
        if event_id == SYS_EVENT_UNKNOWN || raw.get(3) == Some(&6) {
            let detail = raw.get(6..body_end).map(<[u8]>::to_vec).unwrap_or_default();
            return SystemEvent::Unknown { detail };
        }

        let module = sub;
        let args = raw.get(7..body_end).unwrap_or(&[]);
        let a0 = args.first().copied().map(i32::from);
        let a1 = args.get(1).copied().map(i32::from);

        let event = match (event_id, a0, a1) {
            (EVT_DIRECT_CMD, _, _) => return SystemEvent::DirectEcho { module },
            (EVT_BUTTON_SHORT, Some(a0), _) => Event::new(module, EventKind::Button, a0, 1),
            (EVT_BUTTON_LONG, Some(a0), _) => Event::new(module, EventKind::Button, a0, 2),
            (EVT_BUTTON_LONG_END, Some(a0), _) => Event::new(module, EventKind::Button, a0, 3),
            (EVT_SWITCH_ON, Some(a0), _) => Event::new(module, EventKind::Switch, a0, 1),
            (EVT_SWITCH_OFF, Some(a0), _) => Event::new(module, EventKind::Switch, a0, 0),
            (EVT_OUTPUT_ON, Some(a0), _) => Event::new(module, EventKind::Output, a0, 1),
            (EVT_OUTPUT_OFF, Some(a0), _) => Event::new(module, EventKind::Output, a0, 0),
            (EVT_MODE_CHANGE, Some(a0), Some(a1)) => Event::new(0, EventKind::Mode, a0, a1),
            (EVT_EKEY_FINGER, Some(a0), Some(a1)) => Event::new(module, EventKind::Finger, a0, a1),
            (EVT_IR_SHORT, Some(a0), Some(a1)) => Event::new(module, EventKind::IrCommand, a0, a1),
            (EVT_FLAG_CHANGE, Some(a0), Some(a1)) => {
                // Router flags are numbered from 32 upward.
                let flag = if module == 0 { a0 + a1 - 32 } else { a0 + a1 };
                Event::new(module, EventKind::Flag, flag, i32::from(a0 > a1))
            }
            (EVT_LOGIC_CHANGE, Some(a0), Some(a1)) => {
                Event::new(module, EventKind::CounterValue, a0, a1)
            }
            (EVT_COLLECTIVE_CMD, Some(a0), _) => Event::new(0, EventKind::DirectCommand, a0, 0),
            (EVT_SYS_ERROR, Some(a0), Some(a1)) => Event::new(0, EventKind::SystemError, a0, a1),
            _ => return SystemEvent::Unmapped { module, event_id },
        };
        SystemEvent::Module(event)
    }
}
