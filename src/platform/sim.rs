use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::errors::FansError;
use super::{DigitalOutputs, Nvs, NvsAddress, Spindle, SpindleState};

/// Value of erased storage.
const ERASED: u8 = 0xFF;

// ---------------------------------------------------------------------------
// Digital outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OutputPort {
    owner: Option<String>,
    level: bool,
}

/// In-memory bank of digital outputs.
pub struct SimOutputs {
    ports: Vec<OutputPort>,
}

impl SimOutputs {
    pub fn new(count: u8) -> Self {
        Self {
            ports: vec![OutputPort { owner: None, level: false }; count as usize],
        }
    }

    /// Who claimed `port`, if anyone.
    #[cfg(test)]
    pub fn owner(&self, port: u8) -> Option<&str> {
        self.ports.get(port as usize).and_then(|output| output.owner.as_deref())
    }
}

impl DigitalOutputs for SimOutputs {
    fn count(&self) -> u8 {
        self.ports.len() as u8
    }

    fn free_ports(&self) -> Vec<u8> {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, output)| output.owner.is_none())
            .map(|(port, _)| port as u8)
            .collect()
    }

    fn claim(&mut self, port: u8, description: &str) -> Result<(), FansError> {
        let unavailable = || FansError::PortUnavailable {
            port,
            owner: description.to_string(),
        };
        let output = self.ports.get_mut(port as usize).ok_or_else(unavailable)?;
        if output.owner.is_some() {
            return Err(unavailable());
        }
        output.owner = Some(description.to_string());
        debug!("output {} claimed by '{}'", port, description);
        Ok(())
    }

    fn release(&mut self, port: u8) {
        if let Some(output) = self.ports.get_mut(port as usize) {
            output.owner = None;
            output.level = false;
        }
    }

    fn write(&mut self, port: u8, on: bool) {
        if let Some(output) = self.ports.get_mut(port as usize) {
            trace!("output {} -> {}", port, on);
            output.level = on;
        }
    }

    #[cfg(test)]
    fn level(&self, port: u8) -> Option<bool> {
        self.ports.get(port as usize).map(|output| output.level)
    }
}

// ---------------------------------------------------------------------------
// Non-volatile storage
// ---------------------------------------------------------------------------

/// Byte image of an EEPROM-like store. Regions are allocated front to back
/// and each carries a trailing checksum byte. When opened from a file every
/// write is flushed back to it.
pub struct NvsImage {
    data: Vec<u8>,
    next_free: usize,
    path: Option<PathBuf>,
}

impl NvsImage {
    pub fn in_memory(size: usize) -> Self {
        Self {
            data: vec![ERASED; size],
            next_free: 0,
            path: None,
        }
    }

    /// Open an image file. A missing file reads as erased storage; a file of
    /// the wrong size is padded or cut to `size`.
    pub fn open(path: &Path, size: usize) -> Result<Self, FansError> {
        let mut data = match fs::read(path) {
            Ok(data) => data,
            Err(error) if error.kind() == ErrorKind::NotFound => Vec::new(),
            Err(error) => return Err(FansError::Io(error)),
        };
        data.resize(size, ERASED);
        debug!("NVS image {} opened ({} bytes)", path.display(), size);
        Ok(Self {
            data,
            next_free: 0,
            path: Some(path.to_path_buf()),
        })
    }

    fn check_range(&self, address: NvsAddress, len: usize) -> Result<(), FansError> {
        if address.0 + len + 1 > self.data.len() {
            return Err(FansError::NvsRange {
                address: address.0,
                len,
            });
        }
        Ok(())
    }

    /// Corrupt a byte, for exercising checksum failures.
    #[cfg(test)]
    pub fn poke(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }
}

/// Rotate-and-add checksum over a region.
fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &byte| sum.rotate_left(1).wrapping_add(byte))
}

impl Nvs for NvsImage {
    fn alloc(&mut self, size: usize) -> Option<NvsAddress> {
        let address = self.next_free;
        if address + size + 1 > self.data.len() {
            return None;
        }
        self.next_free += size + 1;
        Some(NvsAddress(address))
    }

    fn read(&self, address: NvsAddress, buf: &mut [u8]) -> Result<(), FansError> {
        self.check_range(address, buf.len())?;
        let region = &self.data[address.0..address.0 + buf.len()];
        if checksum(region) != self.data[address.0 + buf.len()] {
            return Err(FansError::NvsChecksum(address.0));
        }
        buf.copy_from_slice(region);
        Ok(())
    }

    fn write(&mut self, address: NvsAddress, data: &[u8]) -> Result<(), FansError> {
        self.check_range(address, data.len())?;
        self.data[address.0..address.0 + data.len()].copy_from_slice(data);
        self.data[address.0 + data.len()] = checksum(data);
        if let Some(path) = &self.path {
            fs::write(path, &self.data)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Spindles
// ---------------------------------------------------------------------------

/// Spindle that remembers what it was told.
pub struct SimSpindle {
    name: String,
    enable_port: Option<u8>,
    state: SpindleState,
}

impl SimSpindle {
    pub fn new(name: &str, enable_port: Option<u8>) -> Self {
        Self {
            name: name.to_string(),
            enable_port,
            state: SpindleState::OFF,
        }
    }
}

impl Spindle for SimSpindle {
    fn name(&self) -> &str {
        &self.name
    }

    fn enable_port(&self) -> Option<u8> {
        self.enable_port
    }

    fn set_state(&mut self, state: SpindleState, rpm: f32) {
        debug!("spindle '{}' -> on={} ccw={} rpm={}", self.name, state.on, state.ccw, rpm);
        self.state = state;
    }

    fn state(&self) -> SpindleState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
