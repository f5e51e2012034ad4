//! Settings registry descriptors and the fan plugin's persisted blob.

use std::fmt;

use crate::errors::FansError;
use crate::fan::{FanMask, FAN_NAMES, MAX_FANS};
use crate::gcode::Status;

// ---------------------------------------------------------------------------
// Registry descriptors
// ---------------------------------------------------------------------------

/// How a setting value is written and parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingFormat {
    /// Signed integer.
    Integer,
    /// Floating point value.
    Decimal,
    /// Bit mask; the names label each bit.
    Bitfield(&'static [&'static str]),
}

/// A setting value as exchanged with the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Integer(i32),
    Decimal(f32),
    Bits(u8),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Integer(value) => write!(f, "{}", value),
            SettingValue::Decimal(value) => write!(f, "{:.1}", value),
            SettingValue::Bits(value) => write!(f, "{}", value),
        }
    }
}

impl SettingFormat {
    /// Parse the text after `$<id>=` according to this format.
    pub fn parse(self, text: &str) -> Result<SettingValue, Status> {
        let text = text.trim();
        match self {
            SettingFormat::Integer => text
                .parse::<i32>()
                .map(SettingValue::Integer)
                .map_err(|_| Status::BadNumberFormat),
            SettingFormat::Decimal => match text.parse::<f32>() {
                Ok(value) if value.is_finite() => Ok(SettingValue::Decimal(value)),
                _ => Err(Status::BadNumberFormat),
            },
            SettingFormat::Bitfield(_) => text
                .parse::<u8>()
                .map(SettingValue::Bits)
                .map_err(|_| Status::BadNumberFormat),
        }
    }
}

/// One row of a plugin's settings table.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingDetail {
    pub id: u16,
    pub group: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub format: SettingFormat,
    pub min: f32,
    pub max: f32,
    pub description: &'static str,
}

/// Lay out `details` as a table for the `settings` command. Values come
/// from a `$$` report; descriptions are printed indented under their row.
pub fn render_table(details: &[SettingDetail], values: &str) -> String {
    let mut out = format!(
        "{:<6} {:<10} {:<28} {:>8} {:<6} RANGE\n{}\n",
        "ID",
        "GROUP",
        "NAME",
        "VALUE",
        "UNIT",
        "-".repeat(75)
    );
    for detail in details {
        let prefix = format!("${}=", detail.id);
        let value = values
            .lines()
            .find_map(|line| line.strip_prefix(&prefix))
            .unwrap_or("-");
        let range = match detail.format {
            SettingFormat::Bitfield(names) => names.join(","),
            _ => format!("{}..{}", detail.min, detail.max),
        };
        out.push_str(&format!(
            "{:<6} {:<10} {:<28} {:>8} {:<6} {}\n",
            detail.id,
            detail.group,
            detail.name,
            value,
            detail.unit.unwrap_or(""),
            range
        ));
        for line in detail.description.lines().filter(|line| !line.is_empty()) {
            out.push_str(&format!("       {}\n", line));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Fan settings
// ---------------------------------------------------------------------------

/// Setting ids owned by the fan plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanSettingId {
    FanPort(usize),
    Fan0OffDelay,
    SpindleLink,
}

const FAN_PORT_BASE: u16 = 386;
const FAN0_OFF_DELAY: u16 = 480;
const FAN_TO_SPINDLE_LINK: u16 = 483;

/// Upper bound of the fan 0 off delay, in minutes.
pub const MAX_OFF_DELAY_MINUTES: f32 = 20.0;

impl FanSettingId {
    pub fn id(self) -> u16 {
        match self {
            FanSettingId::FanPort(fan) => FAN_PORT_BASE + fan as u16,
            FanSettingId::Fan0OffDelay => FAN0_OFF_DELAY,
            FanSettingId::SpindleLink => FAN_TO_SPINDLE_LINK,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            FAN0_OFF_DELAY => Some(FanSettingId::Fan0OffDelay),
            FAN_TO_SPINDLE_LINK => Some(FanSettingId::SpindleLink),
            id if (FAN_PORT_BASE..FAN_PORT_BASE + MAX_FANS as u16).contains(&id) => {
                Some(FanSettingId::FanPort((id - FAN_PORT_BASE) as usize))
            }
            _ => None,
        }
    }
}

const PORT_DESCRIPTIONS: [&str; MAX_FANS] = [
    "Aux port number to use for fan 0 control, -1 to disable.\n\nNOTE: A hard reset of the controller is required after changing this setting.",
    "Aux port number to use for fan 1 control, -1 to disable.\n\nNOTE: A hard reset of the controller is required after changing this setting.",
    "Aux port number to use for fan 2 control, -1 to disable.\n\nNOTE: A hard reset of the controller is required after changing this setting.",
    "Aux port number to use for fan 3 control, -1 to disable.\n\nNOTE: A hard reset of the controller is required after changing this setting.",
];

const PORT_NAMES: [&str; MAX_FANS] = ["Fan 0 port", "Fan 1 port", "Fan 2 port", "Fan 3 port"];

/// Build the settings table for `fan_count` fans on a board with `n_ports`
/// digital outputs. Port rows exist only for configured fans.
pub fn fan_setting_details(fan_count: usize, n_ports: u8) -> Vec<SettingDetail> {
    let mut details = vec![SettingDetail {
        id: FanSettingId::Fan0OffDelay.id(),
        group: "Aux ports",
        name: "Fan 0 off delay",
        unit: Some("min"),
        format: SettingFormat::Decimal,
        min: 0.0,
        max: MAX_OFF_DELAY_MINUTES,
        description: "Fan 0 off delay after the spindle is stopped, in minutes. Only used when fan 0 is linked to the spindle.",
    }];

    details.extend((0..fan_count.min(MAX_FANS)).map(|fan| SettingDetail {
        id: FanSettingId::FanPort(fan).id(),
        group: "Aux ports",
        name: PORT_NAMES[fan],
        unit: None,
        format: SettingFormat::Integer,
        min: -1.0,
        max: f32::from(n_ports.saturating_sub(1)),
        description: PORT_DESCRIPTIONS[fan],
    }));

    details.push(SettingDetail {
        id: FanSettingId::SpindleLink.id(),
        group: "Spindle",
        name: "Fan to spindle enable link",
        unit: None,
        format: SettingFormat::Bitfield(&FAN_NAMES[..fan_count.min(MAX_FANS)]),
        min: 0.0,
        max: f32::from((1u8 << fan_count.min(MAX_FANS)) - 1),
        description: "Fans that turn on and off together with the spindle.",
    });

    details
}

/// Blob layout: `port[4]`, `spindle_link`, `fan0_off_delay` (f32 LE).
pub const BLOB_SIZE: usize = MAX_FANS + 1 + 4;

const PORT_UNASSIGNED: u8 = 0xFF;
const PORT_DISABLED: u8 = 0xFE;

/// Persisted fan configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanSettings {
    /// Output port per fan, `None` when unassigned.
    pub ports: [Option<u8>; MAX_FANS],
    /// Fans that mirror the spindle state.
    pub spindle_link: FanMask,
    /// Fan 0 off delay in minutes.
    pub fan0_off_delay: f32,
}

impl FanSettings {
    /// Defaults: the highest numbered free outputs, no spindle link, no
    /// delay. `free_ports` must be sorted ascending.
    pub fn defaults(free_ports: &[u8], fan_count: usize) -> Self {
        let fan_count = fan_count.min(MAX_FANS);
        let mut ports = [None; MAX_FANS];
        if let Some(base) = free_ports.len().checked_sub(fan_count) {
            for (port, &free) in ports.iter_mut().zip(&free_ports[base..]) {
                *port = Some(free);
            }
        }
        Self {
            ports,
            spindle_link: FanMask::EMPTY,
            fan0_off_delay: 0.0,
        }
    }

    /// True when every assigned port exists on the board.
    pub fn ports_in_range(&self, n_ports: u8) -> bool {
        self.ports.iter().flatten().all(|&port| port < n_ports)
    }

    /// The fan 0 off delay converted to milliseconds.
    pub fn fan0_off_delay_ms(&self) -> u64 {
        (self.fan0_off_delay.max(0.0) * 60_000.0).round() as u64
    }

    pub fn to_bytes(&self) -> [u8; BLOB_SIZE] {
        let mut bytes = [0u8; BLOB_SIZE];
        for (slot, port) in bytes.iter_mut().zip(self.ports.iter()) {
            *slot = port.unwrap_or(PORT_UNASSIGNED);
        }
        bytes[MAX_FANS] = self.spindle_link.bits();
        bytes[MAX_FANS + 1..].copy_from_slice(&self.fan0_off_delay.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FansError> {
        if bytes.len() != BLOB_SIZE {
            return Err(FansError::InvalidBlob(format!(
                "expected {} bytes, got {}",
                BLOB_SIZE,
                bytes.len()
            )));
        }

        let mut ports = [None; MAX_FANS];
        for (port, &raw) in ports.iter_mut().zip(bytes.iter()) {
            *port = match raw {
                PORT_UNASSIGNED | PORT_DISABLED => None,
                raw => Some(raw),
            };
        }

        let mut delay = [0u8; 4];
        delay.copy_from_slice(&bytes[MAX_FANS + 1..]);
        let fan0_off_delay = f32::from_le_bytes(delay);
        if !fan0_off_delay.is_finite() || !(0.0..=MAX_OFF_DELAY_MINUTES).contains(&fan0_off_delay) {
            return Err(FansError::InvalidBlob(format!(
                "fan 0 off delay {} out of range",
                fan0_off_delay
            )));
        }

        Ok(Self {
            ports,
            spindle_link: FanMask::from_bits(bytes[MAX_FANS]),
            fan0_off_delay,
        })
    }
}
