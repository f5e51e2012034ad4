//! Fan outputs driven by `M106`/`M107`, the fan 0 toggle override and,
//! optionally, the spindle enable state.

use log::{debug, info, warn};

use crate::errors::FansError;
use crate::fan::{FanMask, FanStatus, FAN_NAMES, MAX_FANS};
use crate::gcode::{MachineState, McodeKind, ParserBlock, ProgramFlow, Status, FAN_OFF, FAN_ON};
use crate::hooks::{Next, Plugin};
use crate::platform::{Hal, MessageKind, NvsAddress, ReportFlags, SpindleState, TaskId};
use crate::settings::{
    fan_setting_details, FanSettingId, FanSettings, SettingDetail, SettingValue, BLOB_SIZE,
    MAX_OFF_DELAY_MINUTES,
};

pub const PLUGIN_VERSION: &str = "0.10";

/// Real-time override command that toggles fan 0.
pub const CMD_OVERRIDE_FAN0_TOGGLE: u8 = 0x8A;

const FAN0_OFF_TASK: TaskId = TaskId("fans.fan0_off");

const INIT_FAILED: &str = "Fans plugin failed to initialize!";
const PORTS_UNAVAILABLE: &str = "Fans plugin: configured port number(s) not available";

pub struct FansPlugin {
    fan_count: usize,
    n_ports: u8,
    nvs_address: NvsAddress,
    /// Persisted configuration, as edited through the settings table.
    settings: FanSettings,
    /// Ports actually claimed at the last load.
    ports: [Option<u8>; MAX_FANS],
    /// Spindle fan 0 is routed through, when its port is a spindle enable line.
    fan0_spindle: Option<usize>,
    fans_on: FanMask,
    fans_linked: FanMask,
}

impl FansPlugin {
    /// Reserve what the plugin needs on `hal`.
    ///
    /// Fails when the board has fewer free outputs than fans or when NVS has
    /// no room for the settings; a startup warning is queued in that case and
    /// the plugin must not be installed.
    pub fn init(hal: &mut Hal, fan_count: usize) -> Result<Self, FansError> {
        let fan_count = if fan_count > MAX_FANS {
            warn!("{} fans requested, max number of allowed fans is {}", fan_count, MAX_FANS);
            MAX_FANS
        } else {
            fan_count.max(1)
        };

        let result = Self::reserve(hal, fan_count);
        if let Err(error) = &result {
            warn!("fans plugin disabled: {}", error);
            hal.tasks.report_message(MessageKind::Warning, INIT_FAILED);
        }
        result
    }

    fn reserve(hal: &mut Hal, fan_count: usize) -> Result<Self, FansError> {
        let available = hal.outputs.available();
        if (available as usize) < fan_count {
            return Err(FansError::NotEnoughOutputs {
                required: fan_count,
                available,
            });
        }

        let nvs_address = hal.nvs.alloc(BLOB_SIZE).ok_or(FansError::NvsAlloc(BLOB_SIZE))?;
        let n_ports = hal.outputs.count();
        info!("fans plugin: {} fan(s), {} output ports", fan_count, n_ports);

        Ok(Self {
            fan_count,
            n_ports,
            nvs_address,
            settings: FanSettings::defaults(&hal.outputs.free_ports(), fan_count),
            ports: [None; MAX_FANS],
            fan0_spindle: None,
            fans_on: FanMask::EMPTY,
            fans_linked: FanMask::EMPTY,
        })
    }

    #[cfg(test)]
    pub fn fan_count(&self) -> usize {
        self.fan_count
    }

    #[cfg(test)]
    pub fn settings(&self) -> &FanSettings {
        &self.settings
    }

    fn port(&self, fan: usize) -> Option<u8> {
        if fan < self.fan_count {
            self.ports[fan]
        } else {
            None
        }
    }

    /// Last commanded state of `fan`; false for unknown or unassigned fans.
    pub fn get(&self, fan: usize) -> bool {
        self.port(fan).is_some() && self.fans_on.contains(fan)
    }

    /// Switch a fan. Unassigned fans are ignored.
    pub fn set(&mut self, hal: &mut Hal, fan: usize, on: bool) {
        let Some(port) = self.port(fan) else {
            debug!("fan {} has no port, ignoring set({})", fan, on);
            return;
        };

        self.fans_on.set(fan, on);
        if !on {
            self.fans_linked.set(fan, false);
        }

        if fan == 0 && hal.tasks.cancel(FAN0_OFF_TASK) {
            debug!("fan 0 delayed off cancelled");
        }

        match (fan, self.fan0_spindle.and_then(|index| hal.spindles.get_mut(index))) {
            (0, Some(spindle)) => {
                let state = if on { SpindleState::ON } else { SpindleState::OFF };
                spindle.set_state(state, 0.0);
            }
            _ => hal.outputs.write(port, on),
        }

        debug!("{} {}", FAN_NAMES[fan], if on { "on" } else { "off" });
        hal.report.fan = true;
    }

    /// Snapshot of every configured fan.
    pub fn status(&self, hal: &Hal) -> Vec<FanStatus> {
        (0..self.fan_count)
            .map(|fan| FanStatus {
                index: fan,
                port: self.ports[fan],
                on: self.get(fan),
                linked: self.fans_linked.contains(fan),
                spindle_link: self.settings.spindle_link.contains(fan),
                via_spindle: match fan {
                    0 => self
                        .fan0_spindle
                        .and_then(|index| hal.spindles.get(index))
                        .map(|spindle| spindle.name().to_string()),
                    _ => None,
                },
                off_in_ms: match fan {
                    0 => hal.tasks.remaining_ms(FAN0_OFF_TASK),
                    _ => None,
                },
            })
            .collect()
    }

    fn fan0_delays_off(&self) -> bool {
        self.fans_linked.contains(0) && self.settings.fan0_off_delay > 0.0
    }

    fn schedule_fan0_off(&self, hal: &mut Hal) {
        let delay_ms = self.settings.fan0_off_delay_ms();
        debug!("fan 0 off in {} ms", delay_ms);
        hal.tasks.schedule(FAN0_OFF_TASK, delay_ms);
    }

    /// Mirror the spindle state onto the linked fans.
    fn follow_spindle(&mut self, hal: &mut Hal, spindle_on: bool) {
        let link = self.settings.spindle_link;
        for fan in (0..self.fan_count).filter(|&fan| link.contains(fan)) {
            if spindle_on {
                if !self.get(fan) || self.fans_linked.contains(fan) {
                    self.set(hal, fan, true);
                    self.fans_linked.set(fan, self.port(fan).is_some());
                }
            } else if self.fans_linked.contains(fan) {
                if fan == 0 && self.fan0_delays_off() {
                    self.schedule_fan0_off(hal);
                } else {
                    self.set(hal, fan, false);
                }
            }
        }
    }

    /// Turn every fan off, taking the delayed path for a linked fan 0.
    fn all_off(&mut self, hal: &mut Hal) {
        for fan in 0..self.fan_count {
            if fan == 0 && self.get(0) && self.fan0_delays_off() {
                if !hal.tasks.is_pending(FAN0_OFF_TASK) {
                    self.schedule_fan0_off(hal);
                }
            } else {
                self.set(hal, fan, false);
            }
        }
    }

    fn save(&self, hal: &mut Hal) {
        if let Err(error) = hal.nvs.write(self.nvs_address, &self.settings.to_bytes()) {
            warn!("failed to save fan settings: {}", error);
        }
    }

    fn restore(&mut self, hal: &mut Hal) {
        // Ports we hold right now count as free for the defaults.
        let mut free = hal.outputs.free_ports();
        free.extend(self.ports.iter().flatten().copied());
        if let (Some(index), Some(port)) = (self.fan0_spindle, self.ports[0]) {
            debug!("port {} belongs to spindle {}", port, index);
            free.retain(|&free_port| free_port != port);
        }
        free.sort_unstable();
        free.dedup();

        self.settings = FanSettings::defaults(&free, self.fan_count);
        info!("fan settings restored to defaults: {:?}", self.settings.ports);
        self.save(hal);
    }

    fn read_settings(&self, hal: &Hal) -> Result<FanSettings, FansError> {
        let mut bytes = [0u8; BLOB_SIZE];
        hal.nvs.read(self.nvs_address, &mut bytes)?;
        FanSettings::from_bytes(&bytes)
    }

    fn release_ports(&mut self, hal: &mut Hal) {
        // Lit fans go off through `set` so an aliased spindle stops too.
        for fan in 0..self.fan_count {
            if self.get(fan) {
                self.set(hal, fan, false);
            }
        }
        for fan in 0..MAX_FANS {
            if let Some(port) = self.ports[fan].take() {
                if !(fan == 0 && self.fan0_spindle.is_some()) {
                    hal.outputs.release(port);
                }
            }
        }
        self.fan0_spindle = None;
        if hal.tasks.cancel(FAN0_OFF_TASK) {
            debug!("fan 0 delayed off dropped on reload");
        }
        self.fans_on.clear();
        self.fans_linked.clear();
        hal.report.fan = true;
    }

    /// Fan 0 may only borrow the enable line of a spindle that is not the
    /// active one. Drop the alias when its spindle gets selected and take it
    /// back once another spindle is.
    fn check_fan0_alias(&mut self, hal: &mut Hal) {
        match (self.fan0_spindle, self.ports[0], self.settings.ports[0]) {
            (Some(index), Some(_), _) if index == hal.active_spindle => {
                if self.get(0) {
                    self.set(hal, 0, false);
                }
                self.ports[0] = None;
                self.fan0_spindle = None;
                warn!("Fan 0: spindle '{}' is now active, fan 0 disabled", hal.spindles[index].name());
                hal.tasks.report_message(MessageKind::Warning, PORTS_UNAVAILABLE);
            }
            (None, None, Some(port)) => {
                if let Some(index) = hal.spindle_on_port(port) {
                    info!("Fan 0 routed through spindle '{}'", hal.spindles[index].name());
                    self.ports[0] = Some(port);
                    self.fan0_spindle = Some(index);
                }
            }
            _ => {}
        }
    }

    fn claim_ports(&mut self, hal: &mut Hal) -> bool {
        let mut ok = true;
        for fan in 0..self.fan_count {
            let Some(port) = self.settings.ports[fan] else {
                continue;
            };
            match hal.outputs.claim(port, FAN_NAMES[fan]) {
                Ok(()) => {
                    info!("{} on port {}", FAN_NAMES[fan], port);
                    self.ports[fan] = Some(port);
                }
                Err(error) => match hal.spindle_on_port(port) {
                    Some(index) if fan == 0 => {
                        info!("Fan 0 routed through spindle '{}'", hal.spindles[index].name());
                        self.ports[0] = Some(port);
                        self.fan0_spindle = Some(index);
                    }
                    _ => {
                        warn!("{}: {}", FAN_NAMES[fan], error);
                        ok = false;
                    }
                },
            }
        }
        ok
    }
}

impl Plugin for FansPlugin {
    fn name(&self) -> &'static str {
        "Fans"
    }

    fn mcode_check(&self, code: u16, next: Next<'_>) -> McodeKind {
        match code {
            FAN_ON | FAN_OFF => McodeKind::Normal,
            _ => next.mcode_check(code),
        }
    }

    fn mcode_validate(&self, block: &mut ParserBlock, next: Next<'_>) -> Result<(), Status> {
        match block.mcode {
            Some(FAN_ON) | Some(FAN_OFF) => {
                let fan = match block.p {
                    Some(p) if p.is_nan() => return Err(Status::BadNumberFormat),
                    Some(p) if p.fract() != 0.0 || p < 0.0 || p >= self.fan_count as f32 => {
                        return Err(Status::ValueOutOfRange)
                    }
                    Some(p) => {
                        block.p_consumed = true;
                        p as usize
                    }
                    None => 0,
                };
                match self.port(fan) {
                    Some(_) => Ok(()),
                    None => Err(Status::ValueOutOfRange),
                }
            }
            _ => next.mcode_validate(block),
        }
    }

    fn mcode_execute(&mut self, hal: &mut Hal, state: MachineState, block: &ParserBlock, next: Next<'_>) {
        let on = match block.mcode {
            Some(FAN_ON) => true,
            Some(FAN_OFF) => false,
            _ => return next.mcode_execute(hal, state, block),
        };
        if state != MachineState::CheckMode {
            let fan = block.p.map(|p| p as usize).unwrap_or(0);
            self.set(hal, fan, on);
        }
    }

    fn driver_reset(&mut self, hal: &mut Hal, next: Next<'_>) {
        self.all_off(hal);
        next.driver_reset(hal)
    }

    fn program_completed(&mut self, hal: &mut Hal, flow: ProgramFlow, check_mode: bool, next: Next<'_>) {
        self.all_off(hal);
        next.program_completed(hal, flow, check_mode)
    }

    fn realtime_report(&mut self, hal: &mut Hal, out: &mut String, flags: ReportFlags, next: Next<'_>) {
        if flags.fan {
            out.push_str("|Fan:");
            out.push_str(&self.fans_on.to_string());
        }
        next.realtime_report(hal, out, flags)
    }

    fn accessory_override(&mut self, hal: &mut Hal, cmd: u8, next: Next<'_>) {
        if cmd == CMD_OVERRIDE_FAN0_TOGGLE && self.port(0).is_some() {
            let on = !self.get(0);
            self.set(hal, 0, on);
        } else {
            next.accessory_override(hal, cmd)
        }
    }

    fn report_options(&self, out: &mut String, newopt: bool, next: Next<'_>) {
        next.report_options(out, newopt);
        if !newopt {
            out.push_str(&format!("[PLUGIN:Fans v{}]\r\n", PLUGIN_VERSION));
            out.push_str(&format!("[FANS:{}]\r\n", self.fan_count));
        }
    }

    fn spindle_set_state(&mut self, hal: &mut Hal, state: SpindleState, rpm: f32, next: Next<'_>) {
        if !self.settings.spindle_link.is_empty() {
            self.follow_spindle(hal, state.on);
        }
        next.spindle_set_state(hal, state, rpm)
    }

    fn spindle_selected(&mut self, hal: &mut Hal, spindle: usize, next: Next<'_>) {
        self.check_fan0_alias(hal);
        next.spindle_selected(hal, spindle)
    }

    fn task_due(&mut self, hal: &mut Hal, task: TaskId, next: Next<'_>) {
        if task == FAN0_OFF_TASK {
            debug!("fan 0 off delay expired");
            self.set(hal, 0, false);
        } else {
            next.task_due(hal, task)
        }
    }

    fn describe(&self, hal: &Hal) -> Vec<String> {
        self.status(hal).iter().map(ToString::to_string).collect()
    }

    fn setting_details(&self) -> Vec<SettingDetail> {
        fan_setting_details(self.fan_count, self.n_ports)
    }

    fn setting_get(&self, id: u16) -> Option<SettingValue> {
        match FanSettingId::from_id(id)? {
            FanSettingId::FanPort(fan) if fan < self.fan_count => Some(SettingValue::Integer(
                self.settings.ports[fan].map(i32::from).unwrap_or(-1),
            )),
            FanSettingId::FanPort(_) => None,
            FanSettingId::Fan0OffDelay => Some(SettingValue::Decimal(self.settings.fan0_off_delay)),
            FanSettingId::SpindleLink => Some(SettingValue::Bits(self.settings.spindle_link.bits())),
        }
    }

    fn setting_set(&mut self, id: u16, value: SettingValue) -> Result<(), Status> {
        match (FanSettingId::from_id(id), value) {
            (Some(FanSettingId::FanPort(fan)), SettingValue::Integer(port)) if fan < self.fan_count => {
                self.settings.ports[fan] = match port {
                    -1 => None,
                    port if (0..i32::from(self.n_ports)).contains(&port) => Some(port as u8),
                    _ => return Err(Status::SettingValueOutOfRange),
                };
            }
            (Some(FanSettingId::Fan0OffDelay), SettingValue::Decimal(delay)) => {
                if !(0.0..=MAX_OFF_DELAY_MINUTES).contains(&delay) {
                    return Err(Status::SettingValueOutOfRange);
                }
                self.settings.fan0_off_delay = delay;
            }
            (Some(FanSettingId::SpindleLink), SettingValue::Bits(bits)) => {
                if u32::from(bits) >= 1 << self.fan_count {
                    return Err(Status::SettingValueOutOfRange);
                }
                self.settings.spindle_link = FanMask::from_bits(bits);
                self.fans_linked = FanMask::from_bits(self.fans_linked.bits() & bits);
            }
            (Some(_), _) => return Err(Status::BadNumberFormat),
            (None, _) => return Err(Status::InvalidStatement),
        }
        Ok(())
    }

    fn settings_load(&mut self, hal: &mut Hal) {
        match self.read_settings(hal) {
            Ok(settings) if settings.ports_in_range(self.n_ports) => self.settings = settings,
            Ok(settings) => {
                warn!("stored fan ports {:?} out of range, restoring defaults", settings.ports);
                self.restore(hal);
            }
            Err(error) => {
                warn!("fan settings not loaded ({}), restoring defaults", error);
                self.restore(hal);
            }
        }

        self.release_ports(hal);
        if !self.claim_ports(hal) {
            hal.tasks.report_message(MessageKind::Warning, PORTS_UNAVAILABLE);
        }
    }

    fn settings_save(&self, hal: &mut Hal) {
        self.save(hal)
    }

    fn settings_restore(&mut self, hal: &mut Hal) {
        self.restore(hal)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::parse_line;
    use crate::platform::{DigitalOutputs, NvsImage, SimOutputs, SimSpindle, Spindle};

    fn hal_with(outputs: SimOutputs, nvs_size: usize, spindles: Vec<Box<dyn Spindle>>) -> Hal {
        Hal::new(Box::new(outputs), Box::new(NvsImage::in_memory(nvs_size)), spindles)
    }

    fn hal(ports: u8) -> Hal {
        hal_with(SimOutputs::new(ports), 64, vec![Box::new(SimSpindle::new("PWM spindle", None)) as Box<dyn Spindle>])
    }

    /// Plugin with `fans` fans on an 8 port board, settings loaded.
    fn loaded(fans: usize) -> (FansPlugin, Hal) {
        let mut hal = hal(8);
        let mut plugin = FansPlugin::init(&mut hal, fans).unwrap();
        plugin.settings_load(&mut hal);
        hal.tasks.drain_messages();
        hal.report = ReportFlags::default();
        (plugin, hal)
    }

    fn linked(fans: usize, link: u8, delay: f32) -> (FansPlugin, Hal) {
        let (mut plugin, hal) = loaded(fans);
        plugin.setting_set(483, SettingValue::Bits(link)).unwrap();
        plugin.setting_set(480, SettingValue::Decimal(delay)).unwrap();
        (plugin, hal)
    }

    fn spindle(plugin: &mut FansPlugin, hal: &mut Hal, on: bool) {
        let state = if on { SpindleState::ON } else { SpindleState::OFF };
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.spindle_set_state(hal, state, 1000.0, Next::chain(&mut rest));
    }

    fn validate(plugin: &FansPlugin, line: &str) -> Result<(), Status> {
        let mut block = parse_line(line).unwrap();
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.mcode_validate(&mut block, Next::chain(&mut rest))
    }

    fn execute(plugin: &mut FansPlugin, hal: &mut Hal, state: MachineState, line: &str) {
        let block = parse_line(line).unwrap();
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.mcode_execute(hal, state, &block, Next::chain(&mut rest));
    }

    // -- init ---------------------------------------------------------------

    #[test]
    fn init_fails_without_enough_outputs() {
        let mut hal = hal(1);
        let result = FansPlugin::init(&mut hal, 2);
        assert!(matches!(result, Err(FansError::NotEnoughOutputs { required: 2, available: 1 })));
        let messages = hal.tasks.drain_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, INIT_FAILED);
    }

    #[test]
    fn init_fails_without_nvs_space() {
        let mut hal = hal_with(SimOutputs::new(8), 4, Vec::new());
        assert!(matches!(FansPlugin::init(&mut hal, 2), Err(FansError::NvsAlloc(_))));
        assert_eq!(hal.tasks.drain_messages()[0].kind, MessageKind::Warning);
    }

    #[test]
    fn fan_count_is_clamped() {
        let mut hal = hal(8);
        let plugin = FansPlugin::init(&mut hal, 9).unwrap();
        assert_eq!(plugin.fan_count(), MAX_FANS);
    }

    // -- get/set ------------------------------------------------------------

    #[test]
    fn set_then_get_for_assigned_fans() {
        let (mut plugin, mut hal) = loaded(2);
        for fan in 0..2 {
            plugin.set(&mut hal, fan, true);
            assert!(plugin.get(fan));
            plugin.set(&mut hal, fan, false);
            assert!(!plugin.get(fan));
        }
    }

    #[test]
    fn set_drives_the_claimed_port() {
        let (mut plugin, mut hal) = loaded(2);
        assert_eq!(plugin.settings().ports, [Some(6), Some(7), None, None]);
        plugin.set(&mut hal, 1, true);
        assert_eq!(hal.outputs.level(7), Some(true));
        assert_eq!(hal.outputs.level(6), Some(false));
        assert!(hal.report.fan);
    }

    #[test]
    fn unassigned_fan_is_ignored() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.setting_set(387, SettingValue::Integer(-1)).unwrap();
        plugin.settings_save(&mut hal);
        plugin.settings_load(&mut hal);
        hal.report = ReportFlags::default();

        plugin.set(&mut hal, 1, true);
        assert!(!plugin.get(1));
        assert!(!hal.report.fan);
        assert_eq!(hal.outputs.level(7), Some(false));

        plugin.set(&mut hal, 3, true);
        assert!(!plugin.get(3));
    }

    // -- M106/M107 ----------------------------------------------------------

    #[test]
    fn check_claims_fan_codes_only() {
        let (plugin, _hal) = loaded(2);
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        assert_eq!(plugin.mcode_check(106, Next::chain(&mut rest)), McodeKind::Normal);
        assert_eq!(plugin.mcode_check(107, Next::chain(&mut rest)), McodeKind::Normal);
        assert_eq!(plugin.mcode_check(108, Next::chain(&mut rest)), McodeKind::Unsupported);
    }

    #[test]
    fn validate_accepts_configured_fan() {
        let (plugin, _hal) = loaded(2);
        assert_eq!(validate(&plugin, "M106 P1"), Ok(()));
        assert_eq!(validate(&plugin, "M107"), Ok(()));
    }

    #[test]
    fn validate_rejects_out_of_range_index() {
        let (plugin, _hal) = loaded(2);
        assert_eq!(validate(&plugin, "M106 P5"), Err(Status::ValueOutOfRange));
        assert_eq!(validate(&plugin, "M106 P2"), Err(Status::ValueOutOfRange));
        assert_eq!(validate(&plugin, "M106 P-1"), Err(Status::ValueOutOfRange));
        assert_eq!(validate(&plugin, "M106 P0.5"), Err(Status::ValueOutOfRange));
    }

    #[test]
    fn validate_rejects_nan() {
        let (plugin, _hal) = loaded(2);
        assert_eq!(validate(&plugin, "M106 PNaN"), Err(Status::BadNumberFormat));
    }

    #[test]
    fn validate_rejects_unassigned_fan() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.setting_set(386, SettingValue::Integer(-1)).unwrap();
        plugin.settings_save(&mut hal);
        plugin.settings_load(&mut hal);
        assert_eq!(validate(&plugin, "M106 P0"), Err(Status::ValueOutOfRange));
        assert_eq!(validate(&plugin, "M106"), Err(Status::ValueOutOfRange));
        assert_eq!(validate(&plugin, "M106 P1"), Ok(()));
    }

    #[test]
    fn validate_consumes_p_word() {
        let (plugin, _hal) = loaded(2);
        let mut block = parse_line("M107 P1").unwrap();
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.mcode_validate(&mut block, Next::chain(&mut rest)).unwrap();
        assert!(!block.has_unused_words());
    }

    #[test]
    fn validate_passes_other_codes_on() {
        let (plugin, _hal) = loaded(2);
        assert_eq!(validate(&plugin, "M62 P1"), Err(Status::Unhandled));
    }

    #[test]
    fn execute_switches_addressed_fan() {
        let (mut plugin, mut hal) = loaded(2);
        execute(&mut plugin, &mut hal, MachineState::Idle, "M106 P1");
        assert!(plugin.get(1));
        assert!(!plugin.get(0));
        execute(&mut plugin, &mut hal, MachineState::Idle, "M106");
        assert!(plugin.get(0));
        execute(&mut plugin, &mut hal, MachineState::Idle, "M107 P1");
        assert!(!plugin.get(1));
    }

    #[test]
    fn execute_does_nothing_in_check_mode() {
        let (mut plugin, mut hal) = loaded(2);
        execute(&mut plugin, &mut hal, MachineState::CheckMode, "M106 P1");
        assert!(!plugin.get(1));
        assert!(!hal.report.fan);
    }

    // -- spindle link -------------------------------------------------------

    #[test]
    fn linked_fans_follow_spindle() {
        let (mut plugin, mut hal) = linked(2, 0b11, 0.0);
        spindle(&mut plugin, &mut hal, true);
        assert!(plugin.get(0) && plugin.get(1));
        assert!(hal.spindles[0].state().on);

        spindle(&mut plugin, &mut hal, false);
        assert!(!plugin.get(0) && !plugin.get(1));
        assert!(!hal.spindles[0].state().on);
        assert!(!hal.tasks.is_pending(FAN0_OFF_TASK));
    }

    #[test]
    fn unlinked_fans_ignore_spindle() {
        let (mut plugin, mut hal) = linked(2, 0b01, 0.0);
        spindle(&mut plugin, &mut hal, true);
        assert!(plugin.get(0));
        assert!(!plugin.get(1));
    }

    #[test]
    fn spindle_off_with_delay_schedules_one_off() {
        let (mut plugin, mut hal) = linked(1, 0b1, 1.0);
        spindle(&mut plugin, &mut hal, true);
        spindle(&mut plugin, &mut hal, false);
        assert!(plugin.get(0));
        assert_eq!(hal.tasks.remaining_ms(FAN0_OFF_TASK), Some(60_000));

        assert!(hal.tasks.advance(59_999).is_empty());
        let due = hal.tasks.advance(1);
        assert_eq!(due, vec![FAN0_OFF_TASK]);
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.task_due(&mut hal, FAN0_OFF_TASK, Next::chain(&mut rest));
        assert!(!plugin.get(0));
        assert!(hal.tasks.advance(120_000).is_empty());
    }

    #[test]
    fn fan0_on_cancels_delayed_off() {
        let (mut plugin, mut hal) = linked(1, 0b1, 1.0);
        spindle(&mut plugin, &mut hal, true);
        spindle(&mut plugin, &mut hal, false);
        assert!(hal.tasks.is_pending(FAN0_OFF_TASK));

        execute(&mut plugin, &mut hal, MachineState::Idle, "M106");
        assert!(!hal.tasks.is_pending(FAN0_OFF_TASK));
        assert!(hal.tasks.advance(120_000).is_empty());
        assert!(plugin.get(0));
    }

    #[test]
    fn spindle_restart_cancels_delayed_off() {
        let (mut plugin, mut hal) = linked(1, 0b1, 1.0);
        spindle(&mut plugin, &mut hal, true);
        spindle(&mut plugin, &mut hal, false);
        spindle(&mut plugin, &mut hal, true);
        assert!(!hal.tasks.is_pending(FAN0_OFF_TASK));
        assert!(plugin.get(0));

        // Still linked: the next stop schedules again.
        spindle(&mut plugin, &mut hal, false);
        assert!(hal.tasks.is_pending(FAN0_OFF_TASK));
    }

    #[test]
    fn fan_switched_off_by_command_is_not_retriggered() {
        let (mut plugin, mut hal) = linked(1, 0b1, 1.0);
        spindle(&mut plugin, &mut hal, true);
        execute(&mut plugin, &mut hal, MachineState::Idle, "M107");
        spindle(&mut plugin, &mut hal, false);
        assert!(!plugin.get(0));
        assert!(!hal.tasks.is_pending(FAN0_OFF_TASK));
    }

    #[test]
    fn fan_switched_on_by_command_stays_on_after_spindle_stop() {
        let (mut plugin, mut hal) = linked(2, 0b10, 0.0);
        execute(&mut plugin, &mut hal, MachineState::Idle, "M106 P1");
        spindle(&mut plugin, &mut hal, true);
        spindle(&mut plugin, &mut hal, false);
        assert!(plugin.get(1));
    }

    // -- lifecycle ----------------------------------------------------------

    #[test]
    fn driver_reset_turns_fans_off() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.set(&mut hal, 0, true);
        plugin.set(&mut hal, 1, true);
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.driver_reset(&mut hal, Next::chain(&mut rest));
        assert!(!plugin.get(0) && !plugin.get(1));
        assert_eq!(hal.outputs.level(6), Some(false));
    }

    #[test]
    fn program_end_delays_linked_fan0() {
        let (mut plugin, mut hal) = linked(2, 0b01, 0.5);
        spindle(&mut plugin, &mut hal, true);
        plugin.set(&mut hal, 1, true);

        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.program_completed(&mut hal, ProgramFlow::CompletedM30, false, Next::chain(&mut rest));
        assert!(plugin.get(0));
        assert!(!plugin.get(1));
        assert_eq!(hal.tasks.remaining_ms(FAN0_OFF_TASK), Some(30_000));
    }

    // -- override and reports -----------------------------------------------

    #[test]
    fn override_toggles_fan0() {
        let (mut plugin, mut hal) = loaded(2);
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.accessory_override(&mut hal, CMD_OVERRIDE_FAN0_TOGGLE, Next::chain(&mut rest));
        assert!(plugin.get(0));
        plugin.accessory_override(&mut hal, CMD_OVERRIDE_FAN0_TOGGLE, Next::chain(&mut rest));
        assert!(!plugin.get(0));
        plugin.accessory_override(&mut hal, 0x8B, Next::chain(&mut rest));
        assert!(!plugin.get(0));
    }

    #[test]
    fn report_adds_fan_field_when_flagged() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.set(&mut hal, 1, true);
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();

        let mut out = String::new();
        let flags = hal.report;
        plugin.realtime_report(&mut hal, &mut out, flags, Next::chain(&mut rest));
        assert_eq!(out, "|Fan:2");

        let mut quiet = String::new();
        plugin.realtime_report(&mut hal, &mut quiet, ReportFlags::default(), Next::chain(&mut rest));
        assert!(quiet.is_empty());
    }

    #[test]
    fn options_report_carries_banner() {
        let (plugin, _hal) = loaded(3);
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        let mut out = String::new();
        plugin.report_options(&mut out, false, Next::chain(&mut rest));
        assert_eq!(out, "[PLUGIN:Fans v0.10]\r\n[FANS:3]\r\n");

        let mut newopt = String::new();
        plugin.report_options(&mut newopt, true, Next::chain(&mut rest));
        assert!(newopt.is_empty());
    }

    // -- settings -----------------------------------------------------------

    #[test]
    fn settings_round_trip_through_nvs() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.setting_set(386, SettingValue::Integer(2)).unwrap();
        plugin.setting_set(387, SettingValue::Integer(-1)).unwrap();
        plugin.setting_set(483, SettingValue::Bits(1)).unwrap();
        plugin.setting_set(480, SettingValue::Decimal(2.5)).unwrap();
        plugin.settings_save(&mut hal);
        let saved = *plugin.settings();

        plugin.settings_restore(&mut hal);
        assert_ne!(*plugin.settings(), saved);
        plugin.settings = saved;
        plugin.settings_save(&mut hal);

        plugin.settings_load(&mut hal);
        assert_eq!(*plugin.settings(), saved);
        assert_eq!(plugin.setting_get(386), Some(SettingValue::Integer(2)));
        assert_eq!(plugin.setting_get(387), Some(SettingValue::Integer(-1)));
        assert_eq!(plugin.setting_get(480), Some(SettingValue::Decimal(2.5)));
    }

    #[test]
    fn corrupted_storage_falls_back_to_defaults() {
        let mut hal = hal(8);
        let mut plugin = FansPlugin::init(&mut hal, 2).unwrap();
        plugin.settings_load(&mut hal);
        assert_eq!(plugin.settings().ports, [Some(6), Some(7), None, None]);
        assert!(plugin.settings().spindle_link.is_empty());
        assert_eq!(plugin.settings().fan0_off_delay, 0.0);

        // The defaults were written back, so a second load reads them.
        plugin.settings_load(&mut hal);
        assert_eq!(plugin.settings().ports, [Some(6), Some(7), None, None]);
    }

    #[test]
    fn setting_set_checks_ranges() {
        let (mut plugin, _hal) = loaded(2);
        assert_eq!(plugin.setting_set(386, SettingValue::Integer(8)), Err(Status::SettingValueOutOfRange));
        assert_eq!(plugin.setting_set(386, SettingValue::Integer(-2)), Err(Status::SettingValueOutOfRange));
        assert_eq!(plugin.setting_set(483, SettingValue::Bits(4)), Err(Status::SettingValueOutOfRange));
        assert_eq!(plugin.setting_set(480, SettingValue::Decimal(-1.0)), Err(Status::SettingValueOutOfRange));
        assert_eq!(plugin.setting_set(480, SettingValue::Decimal(21.0)), Err(Status::SettingValueOutOfRange));
        assert_eq!(plugin.setting_set(388, SettingValue::Integer(1)), Err(Status::InvalidStatement));
        assert_eq!(plugin.setting_get(388), None);
    }

    #[test]
    fn unavailable_port_warns_and_keeps_other_fans() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.setting_set(386, SettingValue::Integer(1)).unwrap();
        plugin.settings_save(&mut hal);
        hal.outputs.claim(1, "Probe relay").unwrap();

        plugin.settings_load(&mut hal);
        let messages = hal.tasks.drain_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, PORTS_UNAVAILABLE);

        plugin.set(&mut hal, 0, true);
        assert!(!plugin.get(0));
        plugin.set(&mut hal, 1, true);
        assert!(plugin.get(1));
    }

    #[test]
    fn reload_releases_old_ports() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.setting_set(386, SettingValue::Integer(0)).unwrap();
        plugin.settings_save(&mut hal);
        plugin.settings_load(&mut hal);
        assert!(hal.outputs.free_ports().contains(&6));
        assert!(!hal.outputs.free_ports().contains(&0));
        assert!(hal.tasks.drain_messages().is_empty());
    }

    #[test]
    fn fan0_on_spindle_enable_line_drives_that_spindle() {
        let mut outputs = SimOutputs::new(8);
        outputs.claim(3, "Laser").unwrap();
        let spindles: Vec<Box<dyn Spindle>> = vec![
            Box::new(SimSpindle::new("VFD", None)) as Box<dyn Spindle>,
            Box::new(SimSpindle::new("Laser", Some(3))),
        ];
        let mut hal = hal_with(outputs, 64, spindles);
        let mut plugin = FansPlugin::init(&mut hal, 1).unwrap();
        plugin.settings_load(&mut hal);
        plugin.setting_set(386, SettingValue::Integer(3)).unwrap();
        plugin.settings_save(&mut hal);
        plugin.settings_load(&mut hal);
        assert!(hal.tasks.drain_messages().is_empty());

        plugin.set(&mut hal, 0, true);
        assert!(plugin.get(0));
        assert!(hal.spindles[1].state().on);
        assert_eq!(hal.outputs.level(3), Some(false));

        let status = plugin.status(&hal);
        assert_eq!(status[0].via_spindle.as_deref(), Some("Laser"));
    }

    /// One fan on port 3, which is the enable line of the "Laser" spindle.
    fn aliased() -> (FansPlugin, Hal) {
        let mut outputs = SimOutputs::new(8);
        outputs.claim(3, "Laser").unwrap();
        let spindles: Vec<Box<dyn Spindle>> = vec![
            Box::new(SimSpindle::new("VFD", None)) as Box<dyn Spindle>,
            Box::new(SimSpindle::new("Laser", Some(3))),
        ];
        let mut hal = hal_with(outputs, 64, spindles);
        let mut plugin = FansPlugin::init(&mut hal, 1).unwrap();
        plugin.settings_load(&mut hal);
        plugin.setting_set(386, SettingValue::Integer(3)).unwrap();
        plugin.settings_save(&mut hal);
        plugin.settings_load(&mut hal);
        hal.tasks.drain_messages();
        (plugin, hal)
    }

    fn select(plugin: &mut FansPlugin, hal: &mut Hal, spindle: usize) {
        hal.active_spindle = spindle;
        let mut rest: Vec<Box<dyn Plugin>> = Vec::new();
        plugin.spindle_selected(hal, spindle, Next::chain(&mut rest));
    }

    #[test]
    fn reload_switches_aliased_spindle_off() {
        let (mut plugin, mut hal) = aliased();
        plugin.set(&mut hal, 0, true);
        assert!(hal.spindles[1].state().on);
        hal.report = ReportFlags::default();

        plugin.settings_restore(&mut hal);
        plugin.settings_load(&mut hal);

        assert!(!plugin.get(0));
        assert!(!hal.spindles[1].state().on);
        assert_eq!(plugin.status(&hal)[0].port, Some(7));
        assert!(hal.report.fan);
    }

    #[test]
    fn reload_lowers_plain_ports_that_were_on() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.set(&mut hal, 1, true);
        plugin.settings_load(&mut hal);
        assert!(!plugin.get(1));
        assert_eq!(hal.outputs.level(7), Some(false));
    }

    #[test]
    fn selecting_the_aliased_spindle_disables_fan0() {
        let (mut plugin, mut hal) = aliased();
        plugin.set(&mut hal, 0, true);

        select(&mut plugin, &mut hal, 1);
        assert!(!plugin.get(0));
        assert!(!hal.spindles[1].state().on);
        assert_eq!(plugin.status(&hal)[0].port, None);
        let messages = hal.tasks.drain_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, PORTS_UNAVAILABLE);

        // M106 now has nothing to drive.
        assert_eq!(validate(&plugin, "M106"), Err(Status::ValueOutOfRange));
    }

    #[test]
    fn fan0_alias_returns_when_another_spindle_is_selected() {
        let (mut plugin, mut hal) = aliased();
        select(&mut plugin, &mut hal, 1);
        hal.tasks.drain_messages();

        select(&mut plugin, &mut hal, 0);
        assert_eq!(plugin.status(&hal)[0].via_spindle.as_deref(), Some("Laser"));
        plugin.set(&mut hal, 0, true);
        assert!(hal.spindles[1].state().on);
        assert!(hal.tasks.drain_messages().is_empty());
    }

    #[test]
    fn selecting_another_spindle_keeps_plain_ports() {
        let (mut plugin, mut hal) = loaded(2);
        plugin.set(&mut hal, 0, true);
        hal.spindles.push(Box::new(SimSpindle::new("Router", None)));
        select(&mut plugin, &mut hal, 1);
        assert!(plugin.get(0));
        assert_eq!(plugin.status(&hal)[0].port, Some(6));
    }
}
