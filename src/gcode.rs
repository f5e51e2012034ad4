//! The small slice of G-code the host needs to drive plugins: status codes,
//! the parsed block handed to M-code hooks and a line reader for `M`, `P`
//! and `S` words.

use thiserror::Error;

/// `M106`: fan on.
pub const FAN_ON: u16 = 106;
/// `M107`: fan off.
pub const FAN_OFF: u16 = 107;

/// Outcome of a command, reported as `error:<code>`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[error("bad number format")]
    BadNumberFormat,

    #[error("invalid statement")]
    InvalidStatement,

    #[error("setting disabled")]
    SettingDisabled,

    #[error("unsupported command")]
    UnsupportedCommand,

    #[error("setting value out of range")]
    SettingValueOutOfRange,

    #[error("unused value words")]
    UnusedWords,

    #[error("value out of range")]
    ValueOutOfRange,

    /// No handler in the chain claimed the command.
    #[error("unhandled")]
    Unhandled,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::BadNumberFormat => 2,
            Status::InvalidStatement => 3,
            Status::SettingDisabled => 5,
            Status::UnsupportedCommand | Status::Unhandled => 20,
            Status::SettingValueOutOfRange => 33,
            Status::UnusedWords => 36,
            Status::ValueOutOfRange => 39,
        }
    }
}

/// Classification returned by the M-code check hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McodeKind {
    Unsupported,
    Normal,
}

/// Machine state passed to execute hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    CheckMode,
}

/// How a program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramFlow {
    /// `M2`
    Completed,
    /// `M30`
    CompletedM30,
}

/// A parsed line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParserBlock {
    /// M-code number, if the line carries one.
    pub mcode: Option<u16>,
    /// `P` word value.
    pub p: Option<f32>,
    /// Set by a validator that used the `P` word.
    pub p_consumed: bool,
    /// `S` word value.
    pub s: Option<f32>,
}

impl ParserBlock {
    /// True when a `P` word is present that nobody has claimed.
    pub fn has_unused_words(&self) -> bool {
        self.p.is_some() && !self.p_consumed
    }
}

/// Read a single line of `M`/`P`/`S`/`N` words.
///
/// Spaces are ignored, `(...)` and `;` comments are stripped. Only one M-code
/// per line is accepted.
pub fn parse_line(line: &str) -> Result<ParserBlock, Status> {
    let mut block = ParserBlock::default();
    let text = strip_comments(line);
    let mut chars = text.chars().filter(|c| !c.is_whitespace()).peekable();

    while let Some(letter) = chars.next() {
        let letter = letter.to_ascii_uppercase();
        if !letter.is_ascii_alphabetic() {
            return Err(Status::InvalidStatement);
        }

        let mut number = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() && !number.is_empty() && !is_nan_continuation(&number, next) {
                break;
            }
            number.push(next);
            chars.next();
        }

        let value: f32 = number.parse().map_err(|_| Status::BadNumberFormat)?;

        match letter {
            'M' => {
                if block.mcode.is_some() {
                    return Err(Status::UnsupportedCommand);
                }
                if value.is_nan() || value < 0.0 || value.fract() != 0.0 || value > u16::MAX as f32 {
                    return Err(Status::BadNumberFormat);
                }
                block.mcode = Some(value as u16);
            }
            'P' => block.p = Some(value),
            'S' => block.s = Some(value),
            'N' => {}
            _ => return Err(Status::UnsupportedCommand),
        }
    }

    Ok(block)
}

fn strip_comments(line: &str) -> String {
    let line = line.split(';').next().unwrap_or("");
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

// `P NaN` must reach the validator as a NaN rather than split into words.
fn is_nan_continuation(number: &str, next: char) -> bool {
    let upper = number.to_ascii_uppercase();
    matches!((upper.as_str(), next.to_ascii_uppercase()), ("N", 'A') | ("NA", 'N'))
}
