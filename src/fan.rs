use std::fmt;

/// Maximum number of fans the plugin can drive.
pub const MAX_FANS: usize = 4;

/// Port description used when claiming an output for each fan.
pub const FAN_NAMES: [&str; MAX_FANS] = ["Fan 0", "Fan 1", "Fan 2", "Fan 3"];

/// Compact per-fan flag set (bit N = fan N).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanMask(u8);

impl FanMask {
    pub const EMPTY: FanMask = FanMask(0);

    /// Build a mask from raw bits, dropping anything above `MAX_FANS`.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & ((1 << MAX_FANS) - 1))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, fan: usize) -> bool {
        fan < MAX_FANS && self.0 & (1 << fan) != 0
    }

    pub fn set(&mut self, fan: usize, on: bool) {
        if fan < MAX_FANS {
            if on {
                self.0 |= 1 << fan;
            } else {
                self.0 &= !(1 << fan);
            }
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// The report field is the plain decimal value of the mask.
impl fmt::Display for FanMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a single fan, as shown by the `fans` command.
#[derive(Debug, Clone)]
pub struct FanStatus {
    /// Fan index (0..N)
    pub index: usize,
    /// Claimed output port, `None` when the fan is unassigned
    pub port: Option<u8>,
    /// Last commanded state
    pub on: bool,
    /// Whether the fan follows the spindle right now
    pub linked: bool,
    /// Whether the fan is configured to follow the spindle
    pub spindle_link: bool,
    /// Name of the spindle fan 0 is routed through, if any
    pub via_spindle: Option<String>,
    /// Time left before a delayed off
    pub off_in_ms: Option<u64>,
}

impl fmt::Display for FanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = match (&self.via_spindle, self.port) {
            (Some(spindle), _) => format!("spindle '{}'", spindle),
            (None, Some(port)) => format!("port {}", port),
            (None, None) => "unassigned".to_string(),
        };
        let state = if self.on { "on" } else { "off" };
        write!(f, "{}: {} [{}]", FAN_NAMES[self.index], state, port)?;
        if self.spindle_link {
            write!(f, " spindle-linked")?;
            if self.linked {
                write!(f, " (following)")?;
            }
        }
        if let Some(ms) = self.off_in_ms {
            write!(f, ", off in {:.1} s", ms as f64 / 1000.0)?;
        }
        Ok(())
    }
}
