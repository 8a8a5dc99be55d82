//! Command templates and outbound frame encoding.
//!
//! A template is the raw byte image of a command with named placeholders:
//!
//! ```text
//! 2a <rtr> 08 85 01 <mirr> <evnt> ff
//! ^  ^     ^  ^               ^     ^
//! |  |     |  opcode          |     sentinel, replaced by the checksum
//! |  |     length (recomputed on encode)
//! |  router id
//! marker
//! ```
//!
//! `<name>` is one byte, `<name:N>` exactly N bytes and `<name:*>` any number
//! of bytes. A `<` that does not open a well-formed placeholder is a literal.

use std::collections::HashMap;

use crate::constants::*;
use crate::error::{ProtocolError, Result};
use crate::frame::checksum;

/// Longest placeholder text accepted between `<` and `>`.
const MAX_PLACEHOLDER_LEN: usize = 16;

/// Width of a template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    /// Exactly this many bytes.
    Fixed(usize),
    /// Any number of bytes.
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(u8),
    Field { name: String, width: FieldWidth },
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    segments: Vec<Segment>,
    opcode: u8,
}

impl CommandTemplate {
    /// Parse a raw template.
    ///
    /// The template must start with the command marker and the `<rtr>` field,
    /// carry a literal length byte and opcode, and end with the `0xFF`
    /// sentinel.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut segments = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == b'<' {
                if let Some((name, width, consumed)) = parse_placeholder(&raw[i..]) {
                    segments.push(Segment::Field { name, width });
                    i += consumed;
                    continue;
                }
            }
            segments.push(Segment::Literal(raw[i]));
            i += 1;
        }

        if segments.len() < 5 {
            return Err(ProtocolError::InvalidTemplate(format!(
                "{} segments, need at least 5",
                segments.len()
            )));
        }
        if segments[0] != Segment::Literal(CMD_MARKER) {
            return Err(ProtocolError::InvalidTemplate("missing command marker".into()));
        }
        match &segments[1] {
            Segment::Field { name, width: FieldWidth::Fixed(1) } if name == "rtr" => {}
            _ => {
                return Err(ProtocolError::InvalidTemplate(
                    "router field must follow the marker".into(),
                ))
            }
        }
        if !matches!(segments[CMD_LEN_INDEX], Segment::Literal(_)) {
            return Err(ProtocolError::InvalidTemplate("length byte must be literal".into()));
        }
        let opcode = match segments[CMD_OPCODE_INDEX] {
            Segment::Literal(op) => op,
            _ => return Err(ProtocolError::InvalidTemplate("opcode must be literal".into())),
        };
        if segments.last() != Some(&Segment::Literal(FRAME_SENTINEL)) {
            return Err(ProtocolError::InvalidTemplate("missing trailing sentinel".into()));
        }

        Ok(CommandTemplate { segments, opcode })
    }

    /// The command's opcode byte.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Names of all placeholders in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = (&str, FieldWidth)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field { name, width } => Some((name.as_str(), *width)),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute all placeholders and produce the wire frame.
    ///
    /// Values supplied for names the template does not use are ignored.
    pub fn encode(&self, values: &Substitutions) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.segments.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(b) => out.push(*b),
                Segment::Field { name, width } => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| ProtocolError::MissingPlaceholder(name.clone()))?;
                    value.write(name, *width, &mut out)?;
                }
            }
        }

        if out.len() > MAX_COMMAND_LEN {
            return Err(ProtocolError::FrameTooLong {
                max: MAX_COMMAND_LEN,
                actual: out.len(),
            });
        }

        out[CMD_LEN_INDEX] = out.len() as u8;
        let last = out.len() - 1;
        out[last] = checksum(&out[..last]);
        Ok(out)
    }
}

/// Parse `<name>`, `<name:N>` or `<name:*>` at the start of `raw`.
///
/// Returns the name, the width and the number of bytes consumed.
fn parse_placeholder(raw: &[u8]) -> Option<(String, FieldWidth, usize)> {
    let end = raw
        .iter()
        .take(MAX_PLACEHOLDER_LEN + 2)
        .position(|&b| b == b'>')?;
    let inner = std::str::from_utf8(&raw[1..end]).ok()?;
    let (name, width) = match inner.split_once(':') {
        None => (inner, FieldWidth::Fixed(1)),
        Some((name, "*")) => (name, FieldWidth::Variable),
        Some((name, n)) => {
            let n: usize = n.parse().ok()?;
            if n == 0 {
                return None;
            }
            (name, FieldWidth::Fixed(n))
        }
    };

    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    if !first_ok || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return None;
    }

    Some((name.to_string(), width, end + 1))
}

// ============================================================================
// Substitution Values
// ============================================================================

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Unsigned number, written little-endian and zero-extended to the field.
    Number(u32),
    /// Raw bytes, written as-is. Fixed fields require an exact length.
    Bytes(Vec<u8>),
}

impl FieldValue {
    fn write(&self, name: &str, width: FieldWidth, out: &mut Vec<u8>) -> Result<()> {
        match (self, width) {
            (FieldValue::Number(v), FieldWidth::Fixed(w)) => {
                let needed = number_width(*v);
                if needed > w {
                    return Err(ProtocolError::FieldWidth {
                        name: name.to_string(),
                        width: w,
                        actual: needed,
                    });
                }
                let bytes = v.to_le_bytes();
                out.extend((0..w).map(|i| bytes.get(i).copied().unwrap_or(0)));
            }
            (FieldValue::Number(v), FieldWidth::Variable) => {
                out.extend_from_slice(&v.to_le_bytes()[..number_width(*v)]);
            }
            (FieldValue::Bytes(b), FieldWidth::Fixed(w)) => {
                if b.len() != w {
                    return Err(ProtocolError::FieldWidth {
                        name: name.to_string(),
                        width: w,
                        actual: b.len(),
                    });
                }
                out.extend_from_slice(b);
            }
            (FieldValue::Bytes(b), FieldWidth::Variable) => out.extend_from_slice(b),
        }
        Ok(())
    }
}

/// Minimum little-endian byte count for `v` (at least one).
fn number_width(v: u32) -> usize {
    let bits = 32 - v.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Placeholder values for one encode call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    values: HashMap<String, FieldValue>,
}

impl Substitutions {
    /// Create an empty set of values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a single byte.
    pub fn byte(self, name: &str, value: u8) -> Self {
        self.number(name, u32::from(value))
    }

    /// Bind a number; it must fit the field width.
    pub fn number(mut self, name: &str, value: u32) -> Self {
        self.values.insert(name.to_string(), FieldValue::Number(value));
        self
    }

    /// Bind raw bytes.
    pub fn bytes(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert(name.to_string(), FieldValue::Bytes(value.into()));
        self
    }

    /// Bind in place.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.values.insert(name.to_string(), value);
    }

    /// Look up a binding.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }
}

/// Encode `template` with `values`.
pub fn encode(template: &[u8], values: &Substitutions) -> Result<Vec<u8>> {
    CommandTemplate::parse(template)?.encode(values)
}

// ============================================================================
// Commands
// ============================================================================

/// A template together with its values, minus the router id.
///
/// The router id is supplied when the command is encoded, so the same
/// command can be addressed to any router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    template: &'static [u8],
    values: Substitutions,
}

impl Command {
    /// Start a command from a catalogue template.
    pub fn new(template: &'static [u8]) -> Self {
        Command {
            template,
            values: Substitutions::new(),
        }
    }

    /// Bind a single byte.
    pub fn byte(mut self, name: &str, value: u8) -> Self {
        self.values = self.values.byte(name, value);
        self
    }

    /// Bind a number.
    pub fn number(mut self, name: &str, value: u32) -> Self {
        self.values = self.values.number(name, value);
        self
    }

    /// Bind raw bytes.
    pub fn bytes(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.values = self.values.bytes(name, value);
        self
    }

    /// The raw template.
    pub fn template(&self) -> &'static [u8] {
        self.template
    }

    /// The command's opcode.
    pub fn opcode(&self) -> Result<u8> {
        Ok(CommandTemplate::parse(self.template)?.opcode())
    }

    /// Encode the command for `router`.
    pub fn encode(&self, router: u8) -> Result<Vec<u8>> {
        let mut values = self.values.clone();
        values.set("rtr", FieldValue::Number(u32::from(router)));
        encode(self.template, &values)
    }
}
