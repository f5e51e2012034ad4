//! Script lines for driving the simulated controller.
//!
//! Plain lines are sent to the controller as commands. A few extra forms
//! stand in for what a real sender would do on the real-time channel:
//!
//! ```text
//! ?                 status report
//! !wait <ms>        advance the clock
//! !reset            soft reset (Ctrl-X)
//! !override <byte>  accessory override, decimal or 0x hex
//! # ...             comment
//! ```

use std::io::Write;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

use crate::host::Host;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Line(String),
    Status,
    Wait(u64),
    Reset,
    Override(u8),
    Nothing,
}

pub fn parse_directive(line: &str) -> Result<Directive> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Directive::Nothing);
    }
    if line == "?" {
        return Ok(Directive::Status);
    }
    let Some(directive) = line.strip_prefix('!') else {
        return Ok(Directive::Line(line.to_string()));
    };

    let mut words = directive.split_whitespace();
    let name = words.next().unwrap_or_default();
    let argument = words.next();
    if words.next().is_some() {
        bail!("too many arguments in '{}'", line);
    }

    match (name, argument) {
        ("wait", Some(ms)) => ms
            .parse()
            .map(Directive::Wait)
            .with_context(|| format!("bad wait time '{}'", ms)),
        ("reset", None) => Ok(Directive::Reset),
        ("override", Some(byte)) => parse_byte(byte).map(Directive::Override),
        _ => Err(anyhow!("unknown directive '{}'", line)),
    }
}

fn parse_byte(text: &str) -> Result<u8> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("bad override byte '{}'", text))
}

/// Run every line through `host`, writing the replies to `out`.
///
/// Command failures are reported as `error:<code>` and do not stop the
/// script; malformed directives do.
pub fn run<W: Write>(host: &mut Host, lines: impl IntoIterator<Item = String>, out: &mut W) -> Result<()> {
    for (number, line) in lines.into_iter().enumerate() {
        let directive = parse_directive(&line).with_context(|| format!("line {}", number + 1))?;
        debug!("{:?}", directive);
        match directive {
            Directive::Nothing => {}
            Directive::Line(command) => {
                match host.execute_line(&command) {
                    Ok(text) => write!(out, "{}ok\r\n", text)?,
                    Err(status) => write!(out, "error:{}\r\n", status.code())?,
                }
                write!(out, "{}", host.messages())?;
            }
            Directive::Status => write!(out, "{}\r\n", host.realtime_report())?,
            Directive::Wait(ms) => host.advance(ms),
            Directive::Reset => host.soft_reset(),
            Directive::Override(cmd) => host.accessory_override(cmd),
        }
    }
    Ok(())
}
