mod sim;
mod tasks;

pub use sim::{NvsImage, SimOutputs, SimSpindle};
pub use tasks::{MessageKind, TaskId, TaskQueue};

use std::path::Path;

use log::info;

use crate::config::BoardProfile;
use crate::errors::FansError;

/// Digital output bank the plugin claims its fan ports from.
pub trait DigitalOutputs {
    /// Number of outputs that exist on the board.
    fn count(&self) -> u8;

    /// Unclaimed outputs, in ascending order.
    fn free_ports(&self) -> Vec<u8>;

    /// Number of outputs nobody has claimed yet.
    fn available(&self) -> u8 {
        self.free_ports().len() as u8
    }

    /// Take exclusive ownership of `port`, tagging it with `description`.
    fn claim(&mut self, port: u8, description: &str) -> Result<(), FansError>;

    /// Give back a previously claimed port. Unknown ports are ignored.
    fn release(&mut self, port: u8);

    /// Drive an output.
    fn write(&mut self, port: u8, on: bool);

    /// Current level of an output, `None` for ports that do not exist.
    #[cfg(test)]
    fn level(&self, port: u8) -> Option<bool>;
}

/// Address of an allocated NVS region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvsAddress(pub usize);

/// Non-volatile storage with checksummed regions.
pub trait Nvs {
    /// Reserve `size` bytes (plus checksum). `None` when storage is full.
    fn alloc(&mut self, size: usize) -> Option<NvsAddress>;

    /// Copy a region into `buf`, verifying its checksum.
    fn read(&self, address: NvsAddress, buf: &mut [u8]) -> Result<(), FansError>;

    /// Write `data` and its checksum.
    fn write(&mut self, address: NvsAddress, data: &[u8]) -> Result<(), FansError>;
}

/// Spindle direction/enable state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpindleState {
    pub on: bool,
    pub ccw: bool,
}

impl SpindleState {
    pub const OFF: SpindleState = SpindleState { on: false, ccw: false };
    pub const ON: SpindleState = SpindleState { on: true, ccw: false };
}

/// A spindle driver registered with the host.
pub trait Spindle {
    fn name(&self) -> &str;

    /// Output port used as the enable line, if the spindle owns one.
    fn enable_port(&self) -> Option<u8>;

    fn set_state(&mut self, state: SpindleState, rpm: f32);

    fn state(&self) -> SpindleState;
}

/// Which optional fields the next real-time report should carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportFlags {
    pub fan: bool,
    pub spindle: bool,
}

/// Everything plugins may reach on the host.
pub struct Hal {
    pub outputs: Box<dyn DigitalOutputs>,
    pub nvs: Box<dyn Nvs>,
    pub spindles: Vec<Box<dyn Spindle>>,
    pub active_spindle: usize,
    pub tasks: TaskQueue,
    pub report: ReportFlags,
}

impl Hal {
    pub fn new(outputs: Box<dyn DigitalOutputs>, nvs: Box<dyn Nvs>, spindles: Vec<Box<dyn Spindle>>) -> Self {
        Self {
            outputs,
            nvs,
            spindles,
            active_spindle: 0,
            tasks: TaskQueue::new(),
            report: ReportFlags::default(),
        }
    }

    /// Set the state of the active spindle directly, bypassing plugins.
    pub fn set_active_spindle_state(&mut self, state: SpindleState, rpm: f32) {
        if let Some(spindle) = self.spindles.get_mut(self.active_spindle) {
            spindle.set_state(state, rpm);
            self.report.spindle = true;
        }
    }

    /// Index of a registered spindle, other than the active one, whose enable
    /// line is `port`.
    pub fn spindle_on_port(&self, port: u8) -> Option<usize> {
        self.spindles
            .iter()
            .enumerate()
            .find(|(index, spindle)| *index != self.active_spindle && spindle.enable_port() == Some(port))
            .map(|(index, _)| index)
    }
}

/// Create the simulated board described by `profile`.
///
/// Spindle enable lines are claimed from the output bank up front, like a
/// driver would at boot. With `nvs_path` the NVS image is backed by a file.
pub fn create_hal(profile: &BoardProfile, nvs_path: Option<&Path>) -> Result<Hal, FansError> {
    let mut outputs = SimOutputs::new(profile.digital_outputs);
    let mut spindles: Vec<Box<dyn Spindle>> = Vec::new();
    for spindle in &profile.spindles {
        if let Some(port) = spindle.enable_port {
            outputs.claim(port, &spindle.name)?;
        }
        spindles.push(Box::new(SimSpindle::new(&spindle.name, spindle.enable_port)));
    }

    let nvs = match nvs_path {
        Some(path) => NvsImage::open(path, profile.nvs_size)?,
        None => NvsImage::in_memory(profile.nvs_size),
    };

    info!(
        "board: {} outputs, {} bytes NVS, {} spindle(s)",
        profile.digital_outputs,
        profile.nvs_size,
        spindles.len()
    );

    Ok(Hal::new(Box::new(outputs), Box::new(nvs), spindles))
}
