//! Minimal controller core: owns the HAL and the plugin chain and turns
//! command lines, reports, overrides and clock ticks into chain calls.

use log::{debug, info};

use crate::gcode::{parse_line, MachineState, McodeKind, ProgramFlow, Status};
use crate::hooks::{Next, Plugin};
use crate::platform::{Hal, MessageKind, ReportFlags, SpindleState};
use crate::settings::SettingDetail;

const EOL: &str = "\r\n";

pub struct Host {
    hal: Hal,
    plugins: Vec<Box<dyn Plugin>>,
    check_mode: bool,
    rpm: f32,
}

impl Host {
    pub fn new(hal: Hal) -> Self {
        Self {
            hal,
            plugins: Vec::new(),
            check_mode: false,
            rpm: 0.0,
        }
    }

    /// Put a plugin on top of the chain.
    pub fn install(&mut self, plugin: Box<dyn Plugin>) {
        info!("plugin '{}' installed", plugin.name());
        self.plugins.push(plugin);
    }

    #[cfg(test)]
    pub fn hal(&self) -> &Hal {
        &self.hal
    }

    /// Load every plugin's settings and return the startup messages.
    pub fn startup(&mut self) -> String {
        for plugin in self.plugins.iter_mut() {
            plugin.settings_load(&mut self.hal);
        }
        self.hal.report = ReportFlags { fan: true, spindle: true };
        self.messages()
    }

    /// Drain queued messages as `[MSG:...]` lines.
    pub fn messages(&mut self) -> String {
        self.hal
            .tasks
            .drain_messages()
            .into_iter()
            .map(|message| match message.kind {
                MessageKind::Warning => format!("[MSG:Warning: {}]{}", message.text, EOL),
                MessageKind::Info => format!("[MSG:{}]{}", message.text, EOL),
            })
            .collect()
    }

    fn machine_state(&self) -> MachineState {
        if self.check_mode {
            MachineState::CheckMode
        } else {
            MachineState::Idle
        }
    }

    /// Execute one line and return whatever it printed before `ok`.
    pub fn execute_line(&mut self, line: &str) -> Result<String, Status> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(String::new());
        }
        if let Some(command) = line.strip_prefix('$') {
            return self.system_command(command);
        }

        let mut block = parse_line(line)?;
        let Some(code) = block.mcode else {
            return if block.has_unused_words() {
                Err(Status::UnusedWords)
            } else {
                Ok(String::new())
            };
        };

        match code {
            3 | 4 | 5 => {
                if block.has_unused_words() {
                    return Err(Status::UnusedWords);
                }
                if let Some(rpm) = block.s {
                    self.rpm = rpm;
                }
                if !self.check_mode {
                    let state = SpindleState {
                        on: code != 5,
                        ccw: code == 4,
                    };
                    Next::chain(&mut self.plugins).spindle_set_state(&mut self.hal, state, self.rpm);
                }
            }
            104 => {
                let spindle = match block.p {
                    Some(p) if p.is_nan() => return Err(Status::BadNumberFormat),
                    Some(p) if p.fract() == 0.0 && p >= 0.0 && (p as usize) < self.hal.spindles.len() => p as usize,
                    _ => return Err(Status::ValueOutOfRange),
                };
                block.p_consumed = true;
                if block.has_unused_words() {
                    return Err(Status::UnusedWords);
                }
                if !self.check_mode {
                    self.select_spindle(spindle);
                }
            }
            2 | 30 => {
                if block.has_unused_words() {
                    return Err(Status::UnusedWords);
                }
                if !self.check_mode {
                    Next::chain(&mut self.plugins).spindle_set_state(&mut self.hal, SpindleState::OFF, 0.0);
                }
                let flow = if code == 2 {
                    ProgramFlow::Completed
                } else {
                    ProgramFlow::CompletedM30
                };
                Next::chain(&mut self.plugins).program_completed(&mut self.hal, flow, self.check_mode);
            }
            code => {
                if Next::chain(&mut self.plugins).mcode_check(code) == McodeKind::Unsupported {
                    return Err(Status::UnsupportedCommand);
                }
                Next::chain(&mut self.plugins)
                    .mcode_validate(&mut block)
                    .map_err(|status| match status {
                        Status::Unhandled => Status::UnsupportedCommand,
                        status => status,
                    })?;
                if block.has_unused_words() {
                    return Err(Status::UnusedWords);
                }
                let state = self.machine_state();
                Next::chain(&mut self.plugins).mcode_execute(&mut self.hal, state, &block);
            }
        }

        Ok(String::new())
    }

    /// `M104 P<n>`: make spindle `index` the active one. A running spindle
    /// is stopped through the chain first.
    fn select_spindle(&mut self, index: usize) {
        if index == self.hal.active_spindle {
            return;
        }
        let running = self
            .hal
            .spindles
            .get(self.hal.active_spindle)
            .is_some_and(|spindle| spindle.state().on);
        if running {
            Next::chain(&mut self.plugins).spindle_set_state(&mut self.hal, SpindleState::OFF, 0.0);
        }

        self.hal.active_spindle = index;
        self.hal.report.spindle = true;
        info!("spindle '{}' selected", self.hal.spindles[index].name());
        Next::chain(&mut self.plugins).spindle_selected(&mut self.hal, index);
    }

    fn system_command(&mut self, command: &str) -> Result<String, Status> {
        match command.to_ascii_uppercase().as_str() {
            "$" => Ok(self.settings_report()),
            "I" => Ok(self.report_options()),
            "C" => {
                self.check_mode = !self.check_mode;
                if self.check_mode {
                    Ok(format!("[MSG:Enabled]{}", EOL))
                } else {
                    self.soft_reset();
                    Ok(format!("[MSG:Disabled]{}", EOL))
                }
            }
            "RST=$" => {
                self.hal.tasks.report_message(MessageKind::Info, "Restoring defaults");
                for plugin in self.plugins.iter_mut() {
                    plugin.settings_restore(&mut self.hal);
                }
                for plugin in self.plugins.iter_mut() {
                    plugin.settings_load(&mut self.hal);
                }
                Ok(self.messages())
            }
            _ => self.setting_command(command),
        }
    }

    fn setting_command(&mut self, command: &str) -> Result<String, Status> {
        let (id, value) = match command.split_once('=') {
            Some((id, value)) => (id, Some(value)),
            None => (command, None),
        };
        let id: u16 = id.trim().parse().map_err(|_| Status::InvalidStatement)?;

        let (index, detail) = self.find_setting(id).ok_or(Status::InvalidStatement)?;
        let plugin = &mut self.plugins[index];

        match value {
            None => {
                let value = plugin.setting_get(id).ok_or(Status::SettingDisabled)?;
                Ok(format!("${}={}{}", id, value, EOL))
            }
            Some(text) => {
                let value = detail.format.parse(text)?;
                plugin.setting_set(id, value)?;
                plugin.settings_save(&mut self.hal);
                debug!("${} set to {}", id, value);
                Ok(String::new())
            }
        }
    }

    fn find_setting(&self, id: u16) -> Option<(usize, SettingDetail)> {
        self.plugins.iter().enumerate().find_map(|(index, plugin)| {
            plugin
                .setting_details()
                .into_iter()
                .find(|detail| detail.id == id)
                .map(|detail| (index, detail))
        })
    }

    /// `$$`: every plugin setting, sorted by id.
    pub fn settings_report(&self) -> String {
        let mut rows: Vec<(u16, String)> = self
            .plugins
            .iter()
            .flat_map(|plugin| {
                plugin
                    .setting_details()
                    .into_iter()
                    .filter_map(|detail| plugin.setting_get(detail.id).map(|value| (detail.id, value.to_string())))
                    .collect::<Vec<_>>()
            })
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter()
            .map(|(id, value)| format!("${}={}{}", id, value, EOL))
            .collect()
    }

    /// Every plugin's settings table, sorted by id.
    pub fn setting_details(&self) -> Vec<SettingDetail> {
        let mut details: Vec<SettingDetail> =
            self.plugins.iter().flat_map(|plugin| plugin.setting_details()).collect();
        details.sort_by_key(|detail| detail.id);
        details
    }

    /// `$I`
    pub fn report_options(&mut self) -> String {
        let mut out = String::new();
        Next::chain(&mut self.plugins).report_options(&mut out, false);
        out
    }

    /// `?`
    pub fn realtime_report(&mut self) -> String {
        let flags = std::mem::take(&mut self.hal.report);
        let mut out = String::from(if self.check_mode { "<Check" } else { "<Idle" });

        if flags.spindle {
            if let Some(spindle) = self.hal.spindles.get(self.hal.active_spindle) {
                match spindle.state() {
                    SpindleState { on: true, ccw: false } => out.push_str("|A:S"),
                    SpindleState { on: true, ccw: true } => out.push_str("|A:C"),
                    _ => {}
                }
            }
        }

        Next::chain(&mut self.plugins).realtime_report(&mut self.hal, &mut out, flags);
        out.push('>');
        out
    }

    pub fn accessory_override(&mut self, cmd: u8) {
        Next::chain(&mut self.plugins).accessory_override(&mut self.hal, cmd);
    }

    /// Ctrl-X: reset the driver and stop the spindle without going through
    /// the plugins.
    pub fn soft_reset(&mut self) {
        info!("soft reset");
        Next::chain(&mut self.plugins).driver_reset(&mut self.hal);
        self.hal.set_active_spindle_state(SpindleState::OFF, 0.0);
        self.hal.report = ReportFlags { fan: true, spindle: true };
    }

    /// Move the clock forward and run whatever fell due.
    pub fn advance(&mut self, ms: u64) {
        for task in self.hal.tasks.advance(ms) {
            debug!("task '{}' due at {} ms", task.0, self.hal.tasks.now_ms());
            Next::chain(&mut self.plugins).task_due(&mut self.hal, task);
        }
    }

    /// Human readable state of every plugin.
    pub fn describe(&self) -> Vec<String> {
        self.plugins.iter().flat_map(|plugin| plugin.describe(&self.hal)).collect()
    }
}
