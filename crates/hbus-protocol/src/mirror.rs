//! Module mirror status and delta computation.
//!
//! The router keeps a 226-byte shadow of every module's live state and sends
//! it in operate mode whenever something changes. Comparing two consecutive
//! snapshots of a module yields the fields that changed; each changed field
//! maps to zero or more [`Event`]s. Which byte ranges are compared depends on
//! the module class, read from the descriptor bytes at offsets 1..3.

use std::collections::HashMap;
use std::ops::Range;

use crate::error::{ProtocolError, Result};
use crate::events::{Event, EventKind};

/// Length of a module mirror.
pub const MIRROR_LEN: usize = 226;

/// Byte offsets inside a module mirror.
pub mod mirror_idx {
    pub const ADDR: usize = 0;
    pub const MOD_DESC: usize = 1;
    pub const MODE: usize = 3;
    pub const INP_1_8: usize = 4;
    pub const AD_1: usize = 7;
    pub const AD_2: usize = 8;
    pub const OUT_1_8: usize = 9;
    pub const DIM_1: usize = 13;
    pub const DIM_4: usize = 16;
    pub const TEMP_ROOM: usize = 19;
    pub const TEMP_PWR: usize = 21;
    pub const TEMP_EXT: usize = 23;
    pub const HUM: usize = 25;
    pub const AQI: usize = 26;
    pub const LUM: usize = 27;
    pub const MOV: usize = 29;
    pub const GEN_1: usize = 31;
    pub const GEN_2: usize = 32;
    pub const COVER_POS: usize = 41;
    pub const BLAD_POS: usize = 57;
    pub const T_SHORT: usize = 65;
    pub const GEN_3: usize = 78;
    pub const GEN_4: usize = 79;
    pub const DISPL_CONTR: usize = 79;
    pub const LOGIC: usize = 186;
    pub const COUNTER_VAL: usize = 188;
    pub const FLAG_LOC: usize = 218;
}

use mirror_idx as idx;

/// Number of counter units in the logic block.
const COUNTER_UNITS: usize = 10;
/// Bytes per logic unit: type, maximum, value.
const LOGIC_UNIT_LEN: usize = 3;

/// Descriptor of the analog input module, the only one reporting GEN bytes.
const ANALOG_INPUT_DESC: [u8; 2] = [0x0b, 0x1f];

/// Behaviour class of a module, derived from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    /// Reports nothing through mirror deltas.
    Silent,
    /// Analog input module.
    AnalogInput,
    /// Movement and brightness detector.
    Detector,
    /// Relay or dimmer output module.
    Output,
    /// Room controller (the default).
    Controller,
}

impl ModuleClass {
    /// Classify a module by its two descriptor bytes.
    pub fn from_descriptor(desc: [u8; 2]) -> Self {
        match desc {
            [0x14, 0x01] | [0x1e, 0x03] | [0x0b, 0x1e] | [0x0b, 0x01] | [0x1e, 0x01]
            | [0x32, 0x28] => ModuleClass::Silent,
            ANALOG_INPUT_DESC => ModuleClass::AnalogInput,
            [0x50, 0x64] | [0x50, 0x65] | [0x50, 0x66] => ModuleClass::Detector,
            [0x0a, 0x01] | [0x0a, 0x02] | [0x0a, 0x32] | [0x0a, 0x33] => ModuleClass::Output,
            _ => ModuleClass::Controller,
        }
    }

    /// Byte ranges compared between snapshots.
    fn compared_ranges(self) -> &'static [Range<usize>] {
        const ANALOG: &[Range<usize>] = &[idx::AD_1..idx::DISPL_CONTR + 1];
        const DETECTOR: &[Range<usize>] = &[idx::LUM..idx::MOV + 1];
        const OUTPUT: &[Range<usize>] = &[idx::DIM_1..idx::T_SHORT];
        const CONTROLLER: &[Range<usize>] = &[
            idx::LOGIC..idx::FLAG_LOC + 2,
            idx::MODE..idx::MODE + 1,
            idx::AD_1..idx::AD_2 + 1,
            idx::DIM_1..idx::T_SHORT,
        ];
        match self {
            ModuleClass::Silent => &[],
            ModuleClass::AnalogInput => ANALOG,
            ModuleClass::Detector => DETECTOR,
            ModuleClass::Output => OUTPUT,
            ModuleClass::Controller => CONTROLLER,
        }
    }

    /// Sensor bytes that change too often to be reported.
    fn blocked(self) -> &'static [usize] {
        match self {
            ModuleClass::Output => &[idx::LUM, idx::TEMP_ROOM, idx::TEMP_PWR, idx::TEMP_EXT],
            ModuleClass::Controller => &[
                idx::HUM,
                idx::AQI,
                idx::LUM,
                idx::TEMP_ROOM,
                idx::TEMP_PWR,
                idx::TEMP_EXT,
            ],
            _ => &[],
        }
    }
}

// ============================================================================
// Mirror Status
// ============================================================================

/// The last-known full state of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStatus {
    bytes: Vec<u8>,
}

impl MirrorStatus {
    /// Wrap a 226-byte mirror.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != MIRROR_LEN {
            return Err(ProtocolError::LengthMismatch {
                declared: MIRROR_LEN,
                actual: bytes.len(),
            });
        }
        Ok(MirrorStatus { bytes })
    }

    /// Module address.
    pub fn module(&self) -> u8 {
        self.bytes[idx::ADDR]
    }

    /// Descriptor bytes identifying the module type.
    pub fn descriptor(&self) -> [u8; 2] {
        [self.bytes[idx::MOD_DESC], self.bytes[idx::MOD_DESC + 1]]
    }

    /// Behaviour class from the descriptor.
    pub fn class(&self) -> ModuleClass {
        ModuleClass::from_descriptor(self.descriptor())
    }

    /// Raw mirror bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Indices of reportable bytes that differ from `new`.
    pub fn changed_bytes(&self, new: &MirrorStatus) -> Vec<usize> {
        let class = new.class();
        let blocked = class.blocked();
        class
            .compared_ranges()
            .iter()
            .flat_map(|r| r.clone())
            .filter(|i| self.bytes[*i] != new.bytes[*i] && !blocked.contains(i))
            .collect()
    }

    /// Events describing the change from `self` to `new`.
    ///
    /// `group` is the module's group number, reported with mode changes.
    pub fn delta(&self, new: &MirrorStatus, group: u8) -> Vec<Event> {
        let mut events = Vec::new();
        for i in self.changed_bytes(new) {
            field_events(new, i, self.bytes[i], new.bytes[i], group, &mut events);
        }
        events
    }

    /// A compact view of the commonly queried fields.
    pub fn compact(&self) -> CompactStatus {
        let b = &self.bytes;
        let mut counters = [0u8; COUNTER_UNITS];
        for (k, c) in counters.iter_mut().enumerate() {
            *c = b[idx::COUNTER_VAL + LOGIC_UNIT_LEN * k];
        }
        CompactStatus {
            module: self.module(),
            mode: b[idx::MODE],
            inputs: u32::from_le_bytes([b[idx::INP_1_8], b[idx::INP_1_8 + 1], b[idx::INP_1_8 + 2], 0]),
            outputs: u32::from_le_bytes([b[idx::OUT_1_8], b[idx::OUT_1_8 + 1], b[idx::OUT_1_8 + 2], 0]),
            dimmers: [b[idx::DIM_1], b[idx::DIM_1 + 1], b[idx::DIM_1 + 2], b[idx::DIM_4]],
            flags: u16::from_le_bytes([b[idx::FLAG_LOC], b[idx::FLAG_LOC + 1]]),
            counters,
        }
    }
}

/// Frequently used fields of a module mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStatus {
    /// Module address.
    pub module: u8,
    /// Mode byte.
    pub mode: u8,
    /// Input bits 1..24.
    pub inputs: u32,
    /// Output bits 1..24.
    pub outputs: u32,
    /// Dimmer values 1..4.
    pub dimmers: [u8; 4],
    /// Local flag bits 1..16.
    pub flags: u16,
    /// Counter values.
    pub counters: [u8; COUNTER_UNITS],
}

/// Controller cover outputs 1..5 are wired in a rotated order.
fn cover_index(desc: [u8; 2], raw: usize) -> i32 {
    if desc[0] != 1 || raw > 4 {
        return raw as i32;
    }
    let i = raw + 2;
    (if i > 4 { i - 5 } else { i }) as i32
}

/// Append the events for a change of byte `i` from `old` to `new_val`.
fn field_events(status: &MirrorStatus, i: usize, old: u8, new_val: u8, group: u8, out: &mut Vec<Event>) {
    let module = status.module();
    let desc = status.descriptor();
    let value = i32::from(new_val);
    let mut push = |kind, arg1: i32, arg2: i32| out.push(Event::new(module, kind, arg1, arg2));

    match i {
        idx::MODE => push(EventKind::Mode, i32::from(group), value),
        idx::MOV => push(EventKind::Move, 0, value),
        i if (idx::COVER_POS..idx::COVER_POS + 8).contains(&i) => {
            push(EventKind::CoverValue, cover_index(desc, i - idx::COVER_POS), value)
        }
        i if (idx::BLAD_POS..idx::BLAD_POS + 8).contains(&i) => {
            push(EventKind::BladeValue, cover_index(desc, i - idx::BLAD_POS), value)
        }
        i if (idx::DIM_1..=idx::DIM_4).contains(&i) => {
            push(EventKind::DimValue, (i - idx::DIM_1) as i32, value)
        }
        i if (idx::FLAG_LOC..idx::FLAG_LOC + 2).contains(&i) => {
            let offset = if i > idx::FLAG_LOC { 8 } else { 0 };
            let changed = old ^ new_val;
            for bit in 0..8i32 {
                if changed & (1u8 << bit) != 0 {
                    push(EventKind::Flag, offset + bit, i32::from((new_val >> bit) & 1));
                }
            }
        }
        i if (idx::COUNTER_VAL..idx::COUNTER_VAL + LOGIC_UNIT_LEN * COUNTER_UNITS).contains(&i)
            && (i - idx::COUNTER_VAL) % LOGIC_UNIT_LEN == 0 =>
        {
            push(EventKind::CounterValue, ((i - idx::COUNTER_VAL) / LOGIC_UNIT_LEN) as i32, value)
        }
        idx::AD_1 | idx::AD_2 => push(EventKind::AnalogValue, (i - idx::AD_1) as i32, value),
        idx::GEN_1 | idx::GEN_2 if desc == ANALOG_INPUT_DESC => {
            push(EventKind::AnalogValue, (i - idx::GEN_1 + 2) as i32, value)
        }
        idx::GEN_3 | idx::GEN_4 if desc == ANALOG_INPUT_DESC => {
            push(EventKind::AnalogValue, (i - idx::GEN_3 + 4) as i32, value)
        }
        _ => {}
    }
}

// ============================================================================
// Mirror Table
// ============================================================================

/// Mirrors of all modules on one router.
#[derive(Debug, Clone, Default)]
pub struct MirrorTable {
    modules: HashMap<u8, MirrorStatus>,
    groups: HashMap<u8, u8>,
}

impl MirrorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the group reported with a module's mode changes.
    pub fn set_group(&mut self, module: u8, group: u8) {
        self.groups.insert(module, group);
    }

    /// Store a fresh mirror and return the events it implies.
    ///
    /// The first mirror of a module only seeds the table.
    pub fn apply(&mut self, status: MirrorStatus) -> Vec<Event> {
        let module = status.module();
        let group = self.groups.get(&module).copied().unwrap_or(0);
        let events = match self.modules.get(&module) {
            Some(previous) if *previous == status => Vec::new(),
            Some(previous) => previous.delta(&status, group),
            None => Vec::new(),
        };
        self.modules.insert(module, status);
        events
    }

    /// Current mirror of a module.
    pub fn get(&self, module: u8) -> Option<&MirrorStatus> {
        self.modules.get(&module)
    }

    /// Addresses of every module seen, in ascending order.
    pub fn modules(&self) -> Vec<u8> {
        let mut modules: Vec<u8> = self.modules.keys().copied().collect();
        modules.sort_unstable();
        modules
    }

    /// Number of modules seen.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module has reported yet.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Forget all mirrors.
    pub fn clear(&mut self) {
        self.modules.clear();
    }
}
