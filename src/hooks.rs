//! Plugin chain.
//!
//! Plugins are stacked in install order. Every extension point is dispatched
//! to the most recently installed plugin first; a plugin handles what it owns
//! and hands the rest to [`Next`], which walks down to older plugins and
//! finally to the host's built-in behaviour.

use log::{debug, warn};

use crate::gcode::{MachineState, McodeKind, ParserBlock, ProgramFlow, Status};
use crate::platform::{Hal, ReportFlags, SpindleState, TaskId};
use crate::settings::{SettingDetail, SettingValue};

/// Extension points a plugin may intercept. Every default passes the call on
/// unchanged.
pub trait Plugin {
    fn name(&self) -> &'static str;

    fn mcode_check(&self, code: u16, next: Next<'_>) -> McodeKind {
        next.mcode_check(code)
    }

    fn mcode_validate(&self, block: &mut ParserBlock, next: Next<'_>) -> Result<(), Status> {
        next.mcode_validate(block)
    }

    fn mcode_execute(&mut self, hal: &mut Hal, state: MachineState, block: &ParserBlock, next: Next<'_>) {
        next.mcode_execute(hal, state, block)
    }

    fn driver_reset(&mut self, hal: &mut Hal, next: Next<'_>) {
        next.driver_reset(hal)
    }

    fn program_completed(&mut self, hal: &mut Hal, flow: ProgramFlow, check_mode: bool, next: Next<'_>) {
        next.program_completed(hal, flow, check_mode)
    }

    fn realtime_report(&mut self, hal: &mut Hal, out: &mut String, flags: ReportFlags, next: Next<'_>) {
        next.realtime_report(hal, out, flags)
    }

    fn accessory_override(&mut self, hal: &mut Hal, cmd: u8, next: Next<'_>) {
        next.accessory_override(hal, cmd)
    }

    fn report_options(&self, out: &mut String, newopt: bool, next: Next<'_>) {
        next.report_options(out, newopt)
    }

    fn spindle_set_state(&mut self, hal: &mut Hal, state: SpindleState, rpm: f32, next: Next<'_>) {
        next.spindle_set_state(hal, state, rpm)
    }

    /// Called after `hal.active_spindle` changed to `spindle`.
    fn spindle_selected(&mut self, hal: &mut Hal, spindle: usize, next: Next<'_>) {
        next.spindle_selected(hal, spindle)
    }

    fn task_due(&mut self, hal: &mut Hal, task: TaskId, next: Next<'_>) {
        next.task_due(hal, task)
    }

    /// One line per item of plugin state, for diagnostics.
    fn describe(&self, _hal: &Hal) -> Vec<String> {
        Vec::new()
    }

    // Settings registry callbacks. These are not chained: the host routes
    // each id to the plugin that lists it.

    fn setting_details(&self) -> Vec<SettingDetail> {
        Vec::new()
    }

    fn setting_get(&self, _id: u16) -> Option<SettingValue> {
        None
    }

    fn setting_set(&mut self, _id: u16, _value: SettingValue) -> Result<(), Status> {
        Err(Status::InvalidStatement)
    }

    fn settings_load(&mut self, _hal: &mut Hal) {}

    fn settings_save(&self, _hal: &mut Hal) {}

    fn settings_restore(&mut self, _hal: &mut Hal) {}
}

/// The part of the chain below the plugin currently running.
pub struct Next<'a> {
    rest: &'a mut [Box<dyn Plugin>],
}

impl<'a> Next<'a> {
    /// The whole chain, starting at the newest plugin.
    pub fn chain(plugins: &'a mut [Box<dyn Plugin>]) -> Self {
        Self { rest: plugins }
    }

    pub fn mcode_check(self, code: u16) -> McodeKind {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.mcode_check(code, Next { rest }),
            None => McodeKind::Unsupported,
        }
    }

    pub fn mcode_validate(self, block: &mut ParserBlock) -> Result<(), Status> {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.mcode_validate(block, Next { rest }),
            None => Err(Status::Unhandled),
        }
    }

    pub fn mcode_execute(self, hal: &mut Hal, state: MachineState, block: &ParserBlock) {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.mcode_execute(hal, state, block, Next { rest }),
            None => debug!("M{:?} reached the end of the chain", block.mcode),
        }
    }

    pub fn driver_reset(self, hal: &mut Hal) {
        if let Some((plugin, rest)) = self.rest.split_last_mut() {
            plugin.driver_reset(hal, Next { rest });
        }
    }

    pub fn program_completed(self, hal: &mut Hal, flow: ProgramFlow, check_mode: bool) {
        if let Some((plugin, rest)) = self.rest.split_last_mut() {
            plugin.program_completed(hal, flow, check_mode, Next { rest });
        }
    }

    pub fn realtime_report(self, hal: &mut Hal, out: &mut String, flags: ReportFlags) {
        if let Some((plugin, rest)) = self.rest.split_last_mut() {
            plugin.realtime_report(hal, out, flags, Next { rest });
        }
    }

    pub fn accessory_override(self, hal: &mut Hal, cmd: u8) {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.accessory_override(hal, cmd, Next { rest }),
            None => debug!("override 0x{:02X} ignored", cmd),
        }
    }

    pub fn report_options(self, out: &mut String, newopt: bool) {
        if let Some((plugin, rest)) = self.rest.split_last_mut() {
            plugin.report_options(out, newopt, Next { rest });
        }
    }

    /// The end of this chain is the active spindle itself.
    pub fn spindle_set_state(self, hal: &mut Hal, state: SpindleState, rpm: f32) {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.spindle_set_state(hal, state, rpm, Next { rest }),
            None => hal.set_active_spindle_state(state, rpm),
        }
    }

    pub fn spindle_selected(self, hal: &mut Hal, spindle: usize) {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.spindle_selected(hal, spindle, Next { rest }),
            None => debug!("spindle {} selected", spindle),
        }
    }

    pub fn task_due(self, hal: &mut Hal, task: TaskId) {
        match self.rest.split_last_mut() {
            Some((plugin, rest)) => plugin.task_due(hal, task, Next { rest }),
            None => warn!("no plugin owns task '{}'", task.0),
        }
    }
}
