//! System Management & Peripheral Control unit.
//!
//! The SMPC runs the power/reset sequencing commands, the clock-change
//! commands, the battery-backed SMEM, a wall-clock RTC and the INTBACK
//! peripheral-collection protocol. Peripherals themselves live on the
//! host side of the `PeripheralReport` callback.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::bus::{Bus, HandlerSet};
use crate::clocks::{ClockRatios, ClockSpeed};
use crate::sched::{EventId, Scheduler};

// ── Commands ──────────────────────────────────────────────────

pub const CMD_MSHON: u8 = 0x00;
pub const CMD_SSHON: u8 = 0x02;
pub const CMD_SSHOFF: u8 = 0x03;
pub const CMD_SNDON: u8 = 0x06;
pub const CMD_SNDOFF: u8 = 0x07;
pub const CMD_CDON: u8 = 0x08;
pub const CMD_CDOFF: u8 = 0x09;
pub const CMD_SYSRES: u8 = 0x0D;
pub const CMD_CKCHG352: u8 = 0x0E;
pub const CMD_CKCHG320: u8 = 0x0F;
pub const CMD_INTBACK: u8 = 0x10;
pub const CMD_SETTIME: u8 = 0x16;
pub const CMD_SETSMEM: u8 = 0x17;
pub const CMD_NMIREQ: u8 = 0x18;
pub const CMD_RESENAB: u8 = 0x19;
pub const CMD_RESDISA: u8 = 0x1A;

/// One controller port's report, filled in by the host.
#[derive(Debug, Clone, Copy)]
pub struct PadReport {
    pub connected: bool,
    /// Active-low button bits in the standard digital-pad layout.
    pub buttons: u16,
}

impl Default for PadReport {
    fn default() -> Self {
        Self {
            connected: false,
            buttons: 0xFFFF,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeripheralReport {
    pub port1: PadReport,
    pub port2: PadReport,
}

pub type SystemManagerInterruptFn = Box<dyn FnMut()>;
pub type PeripheralReportFn = Box<dyn FnMut(&mut PeripheralReport)>;
pub type ClockChangeFn = Box<dyn FnMut(ClockSpeed)>;
pub type SoundCpuEnableFn = Box<dyn FnMut(bool)>;

pub struct Smpc {
    ireg: [u8; 7],
    oreg: [u8; 32],
    comreg: u8,
    sr: u8,
    sf: bool,

    /// Battery-backed memory (4 bytes).
    pub smem: [u8; 4],

    /// Seconds since the epoch the host last set.
    rtc_seconds: u64,
    rtc_event: EventId,

    reset_enabled: bool,
    slave_sh2_on: bool,
    sound_cpu_on: bool,

    intback_peripheral_pending: bool,

    on_system_manager: Option<SystemManagerInterruptFn>,
    on_peripheral_report: Option<PeripheralReportFn>,
    on_clock_change: Option<ClockChangeFn>,
    on_sound_cpu_enable: Option<SoundCpuEnableFn>,
}

impl Smpc {
    pub fn new(scheduler: &Rc<Scheduler>) -> crate::error::CoreResult<Rc<RefCell<Self>>> {
        let smpc = Rc::new(RefCell::new(Self {
            ireg: [0; 7],
            oreg: [0; 32],
            comreg: 0,
            sr: 0,
            sf: false,
            smem: [0; 4],
            rtc_seconds: 0,
            rtc_event: 0,
            reset_enabled: false,
            slave_sh2_on: false,
            sound_cpu_on: false,
            intback_peripheral_pending: false,
            on_system_manager: None,
            on_peripheral_report: None,
            on_clock_change: None,
            on_sound_cpu_enable: None,
        }));

        // RTC tick: once per second of SMPC time (4 MHz).
        let rtc_smpc = smpc.clone();
        let rtc_event = scheduler.register_event(Box::new(move |ctx| {
            rtc_smpc.borrow_mut().rtc_seconds += 1;
            ctx.reschedule(4_000_000);
        }))?;
        smpc.borrow_mut().rtc_event = rtc_event;
        Ok(smpc)
    }

    pub fn reset(&mut self, _hard: bool) {
        self.ireg = [0; 7];
        self.oreg = [0; 32];
        self.comreg = 0;
        self.sr = 0;
        self.sf = false;
        self.reset_enabled = false;
        self.slave_sh2_on = false;
        self.sound_cpu_on = false;
        self.intback_peripheral_pending = false;
    }

    pub fn start(&self, scheduler: &Scheduler) {
        scheduler.schedule_from_now(self.rtc_event, 4_000_000);
    }

    pub fn update_clock_ratios(&self, scheduler: &Scheduler, ratios: &ClockRatios) {
        scheduler.set_event_count_factor(self.rtc_event, ratios.smpc_num, ratios.smpc_den);
    }

    // ── Wiring ─────────────────────────────────────────────────

    pub fn set_system_manager_callback(&mut self, callback: SystemManagerInterruptFn) {
        self.on_system_manager = Some(callback);
    }

    pub fn set_peripheral_report_callback(&mut self, callback: PeripheralReportFn) {
        self.on_peripheral_report = Some(callback);
    }

    pub fn set_clock_change_callback(&mut self, callback: ClockChangeFn) {
        self.on_clock_change = Some(callback);
    }

    pub fn set_sound_cpu_enable_callback(&mut self, callback: SoundCpuEnableFn) {
        self.on_sound_cpu_enable = Some(callback);
    }

    pub fn set_rtc_seconds(&mut self, seconds: u64) {
        self.rtc_seconds = seconds;
    }

    pub fn rtc_seconds(&self) -> u64 {
        self.rtc_seconds
    }

    pub fn sound_cpu_on(&self) -> bool {
        self.sound_cpu_on
    }

    // ── Save states ────────────────────────────────────────────

    pub fn save_state(&self) -> crate::state::SmpcState {
        crate::state::SmpcState {
            smem: self.smem,
            rtc_seconds: self.rtc_seconds,
            reset_enabled: self.reset_enabled,
            slave_sh2_on: self.slave_sh2_on,
            sound_cpu_on: self.sound_cpu_on,
        }
    }

    pub fn load_state(&mut self, state: &crate::state::SmpcState) {
        self.smem = state.smem;
        self.rtc_seconds = state.rtc_seconds;
        self.reset_enabled = state.reset_enabled;
        self.slave_sh2_on = state.slave_sh2_on;
        self.sound_cpu_on = state.sound_cpu_on;
    }

    // ── Register interface (byte registers on odd addresses) ───

    pub fn read_reg8(&mut self, address: u32) -> u8 {
        match address & 0x7F {
            0x61 => self.sr,
            0x63 => self.sf as u8,
            a @ 0x21..=0x5F if a & 1 == 1 => self.oreg[((a - 0x21) >> 1) as usize],
            0x1F => self.comreg,
            _ => 0,
        }
    }

    pub fn write_reg8(&mut self, address: u32, value: u8, poke: bool) {
        match address & 0x7F {
            a @ 0x01..=0x0D if a & 1 == 1 => {
                let index = ((a - 0x01) >> 1) as usize;
                self.ireg[index] = value;
                // A BREAK/CONTINUE handshake arrives through IREG0 while
                // an INTBACK peripheral phase is pending.
                if !poke && index == 0 && self.intback_peripheral_pending {
                    if value & 0x40 != 0 {
                        // BREAK
                        self.intback_peripheral_pending = false;
                        self.sr &= !0x20;
                    } else if value & 0x80 != 0 {
                        // CONTINUE: re-report peripherals
                        self.intback_peripherals();
                    }
                }
            }
            0x1F => {
                self.comreg = value;
                if !poke {
                    self.execute_command();
                }
            }
            0x63 => self.sf = value & 1 != 0,
            _ => {}
        }
    }

    // ── Commands ───────────────────────────────────────────────

    fn execute_command(&mut self) {
        trace!("SMPC: command {:02X}", self.comreg);
        match self.comreg {
            CMD_MSHON => {}
            CMD_SSHON => self.slave_sh2_on = true,
            CMD_SSHOFF => self.slave_sh2_on = false,
            CMD_SNDON => {
                self.sound_cpu_on = true;
                if let Some(cb) = self.on_sound_cpu_enable.as_mut() {
                    cb(true);
                }
            }
            CMD_SNDOFF => {
                self.sound_cpu_on = false;
                if let Some(cb) = self.on_sound_cpu_enable.as_mut() {
                    cb(false);
                }
            }
            CMD_CDON | CMD_CDOFF => {
                // The CD block is always powered in this core.
            }
            CMD_SYSRES => debug!("SMPC: system reset requested"),
            CMD_CKCHG352 => {
                if let Some(cb) = self.on_clock_change.as_mut() {
                    cb(ClockSpeed::Dot352);
                }
            }
            CMD_CKCHG320 => {
                if let Some(cb) = self.on_clock_change.as_mut() {
                    cb(ClockSpeed::Dot320);
                }
            }
            CMD_INTBACK => self.intback(),
            CMD_SETTIME => {
                // IREG0-6 carry a BCD timestamp; fold it into a plain
                // seconds count (date handling stays host-side).
                let bcd = |v: u8| ((v >> 4) * 10 + (v & 0xF)) as u64;
                let h = bcd(self.ireg[4]);
                let m = bcd(self.ireg[5]);
                let s = bcd(self.ireg[6]);
                self.rtc_seconds = h * 3600 + m * 60 + s;
            }
            CMD_SETSMEM => {
                for i in 0..4 {
                    self.smem[i] = self.ireg[i];
                }
            }
            CMD_NMIREQ => debug!("SMPC: NMI requested"),
            CMD_RESENAB => self.reset_enabled = true,
            CMD_RESDISA => self.reset_enabled = false,
            other => debug!("SMPC: unknown command {other:02X}"),
        }
        self.oreg[31] = self.comreg;
        self.sf = false;
    }

    /// INTBACK: report SMPC status and/or collect peripheral data, then
    /// raise the System Manager interrupt.
    fn intback(&mut self) {
        let want_status = self.ireg[0] & 0x01 != 0;
        let want_peripherals = self.ireg[1] & 0x08 != 0;

        if want_status {
            self.fill_status_report();
            self.sr = 0x40 | ((want_peripherals as u8) << 5);
            self.intback_peripheral_pending = want_peripherals;
            if let Some(cb) = self.on_system_manager.as_mut() {
                cb();
            }
            return;
        }

        if want_peripherals {
            self.intback_peripherals();
        }
    }

    fn fill_status_report(&mut self) {
        let sec = self.rtc_seconds;
        let bcd = |v: u64| (((v / 10) << 4) | (v % 10)) as u8;

        self.oreg.fill(0);
        self.oreg[0] = 0x80 | ((self.reset_enabled as u8) << 6); // STE | RESD
        // RTC: year (two bytes), day/month, day, hour, minute, second.
        self.oreg[1] = 0x19;
        self.oreg[2] = 0x96;
        self.oreg[3] = 0x01;
        self.oreg[4] = 0x01;
        self.oreg[5] = bcd(sec / 3600 % 24);
        self.oreg[6] = bcd(sec / 60 % 60);
        self.oreg[7] = bcd(sec % 60);
        self.oreg[8] = 0; // no cartridge code
        self.oreg[9] = 0x01; // area code: Japan
        self.oreg[10] = 0b0011_0100
            | ((self.slave_sh2_on as u8) << 7)
            | ((self.sound_cpu_on as u8) << 6);
        self.oreg[11] = 0;
        self.oreg[12..16].copy_from_slice(&self.smem);
    }

    fn intback_peripherals(&mut self) {
        let mut report = PeripheralReport::default();
        if let Some(cb) = self.on_peripheral_report.as_mut() {
            cb(&mut report);
        }

        // Optimized-format report: one port header + standard digital
        // pad data per connected port.
        self.oreg.fill(0);
        let mut pos = 0usize;
        for pad in [report.port1, report.port2] {
            if pos + 3 > self.oreg.len() {
                break;
            }
            if pad.connected {
                self.oreg[pos] = 0xF1; // direct pad, 1 peripheral
                self.oreg[pos + 1] = 0x02; // digital pad, 2 data bytes
                self.oreg[pos + 2] = (pad.buttons >> 8) as u8;
                self.oreg[pos + 3] = pad.buttons as u8;
                pos += 4;
            } else {
                self.oreg[pos] = 0xF0; // nothing connected
                pos += 1;
            }
        }

        self.sr = 0x80; // PDL: first peripheral data
        self.intback_peripheral_pending = false;
        if let Some(cb) = self.on_system_manager.as_mut() {
            cb();
        }
    }
}

// ── Bus mapping ───────────────────────────────────────────────

pub fn map_smpc(smpc: &Rc<RefCell<Smpc>>, bus: &Bus) {
    for normal in [true, false] {
        let poke = !normal;
        let (r8, r16) = (smpc.clone(), smpc.clone());
        let (w8, w16) = (smpc.clone(), smpc.clone());
        let handlers = HandlerSet {
            read8: Box::new(move |a| r8.borrow_mut().read_reg8(a)),
            read16: Box::new(move |a| r16.borrow_mut().read_reg8(a | 1) as u16),
            read32: Box::new(|_| 0),
            write8: Box::new(move |a, v| w8.borrow_mut().write_reg8(a, v, poke)),
            write16: Box::new(move |a, v| w16.borrow_mut().write_reg8(a | 1, v as u8, poke)),
            write32: Box::new(|_, _| {}),
        };
        if normal {
            bus.map_normal(0x010_0000, 0x017_FFFF, handlers);
        } else {
            bus.map_side_effect_free(0x010_0000, 0x017_FFFF, handlers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smpc() -> Rc<RefCell<Smpc>> {
        let scheduler = Rc::new(Scheduler::new());
        Smpc::new(&scheduler).unwrap()
    }

    #[test]
    fn command_clears_the_busy_flag_and_echoes_in_oreg31() {
        let smpc = smpc();
        let mut s = smpc.borrow_mut();
        s.write_reg8(0x63, 1, false); // SF
        assert!(s.sf);
        s.write_reg8(0x1F, CMD_RESENAB, false);
        assert!(!s.sf);
        assert_eq!(s.read_reg8(0x5F), CMD_RESENAB); // OREG31
        assert!(s.reset_enabled);
    }

    #[test]
    fn sndon_reaches_the_sound_block() {
        let smpc = smpc();
        let enabled = Rc::new(RefCell::new(None));
        {
            let enabled = enabled.clone();
            smpc.borrow_mut()
                .set_sound_cpu_enable_callback(Box::new(move |on| {
                    *enabled.borrow_mut() = Some(on)
                }));
        }
        smpc.borrow_mut().write_reg8(0x1F, CMD_SNDON, false);
        assert_eq!(*enabled.borrow(), Some(true));
    }

    #[test]
    fn intback_status_then_peripherals() {
        let smpc = smpc();
        let interrupts = Rc::new(RefCell::new(0));
        {
            let interrupts = interrupts.clone();
            let mut s = smpc.borrow_mut();
            s.set_system_manager_callback(Box::new(move || *interrupts.borrow_mut() += 1));
            s.set_peripheral_report_callback(Box::new(|report| {
                report.port1.connected = true;
                report.port1.buttons = 0xFF7F;
            }));
        }

        let mut s = smpc.borrow_mut();
        s.write_reg8(0x01, 0x01, false); // IREG0: status requested
        s.write_reg8(0x03, 0x08, false); // IREG1: peripherals too
        s.write_reg8(0x1F, CMD_INTBACK, false);
        assert_eq!(*interrupts.borrow(), 1);
        assert_eq!(s.read_reg8(0x21) & 0x80, 0x80); // STE set
        assert!(s.sr & 0x20 != 0, "more data pending");

        // CONTINUE via IREG0 bit 7 delivers the pad report.
        s.write_reg8(0x01, 0x80, false);
        assert_eq!(*interrupts.borrow(), 2);
        assert_eq!(s.read_reg8(0x21), 0xF1);
        assert_eq!(s.read_reg8(0x23), 0x02);
        assert_eq!(s.read_reg8(0x25), 0xFF);
        assert_eq!(s.read_reg8(0x27), 0x7F);
    }

    #[test]
    fn setsmem_persists_and_settime_sets_the_clock() {
        let smpc = smpc();
        let mut s = smpc.borrow_mut();
        for (i, v) in [0xDE, 0xAD, 0xBE, 0xEF].into_iter().enumerate() {
            s.write_reg8(0x01 + (i as u32) * 2, v, false);
        }
        s.write_reg8(0x1F, CMD_SETSMEM, false);
        assert_eq!(s.smem, [0xDE, 0xAD, 0xBE, 0xEF]);

        s.ireg[4] = 0x12; // 12h
        s.ireg[5] = 0x34; // 34m
        s.ireg[6] = 0x56; // 56s
        s.write_reg8(0x1F, CMD_SETTIME, false);
        assert_eq!(s.rtc_seconds(), 12 * 3600 + 34 * 60 + 56);
    }

    #[test]
    fn clock_change_commands_broadcast() {
        let smpc = smpc();
        let speed = Rc::new(RefCell::new(None));
        {
            let speed = speed.clone();
            smpc.borrow_mut()
                .set_clock_change_callback(Box::new(move |s| *speed.borrow_mut() = Some(s)));
        }
        smpc.borrow_mut().write_reg8(0x1F, CMD_CKCHG352, false);
        assert_eq!(*speed.borrow(), Some(ClockSpeed::Dot352));
        smpc.borrow_mut().write_reg8(0x1F, CMD_CKCHG320, false);
        assert_eq!(*speed.borrow(), Some(ClockSpeed::Dot320));
    }
}
