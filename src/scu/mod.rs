//! System Control Unit: interrupt arbiter, DMA engine and timers.
//!
//! The SCU sits between the master CPUs and everything else: it owns the
//! cartridge window on the A-Bus, arbitrates interrupt delivery to both
//! CPUs, runs three DMA channels and the DSP, and drives two line-locked
//! timers.

pub mod dma;
pub mod dsp;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, trace};

use crate::bus::{Bus, HandlerSet};
use crate::cart::Cartridge;
use crate::sched::{EventId, Scheduler};
use dma::{bus_id, BusId, DmaChannel, DmaTrigger};
use dsp::ScuDsp;

// ── Interrupt sources ─────────────────────────────────────────
//
//  bit  vec   lvl  source  reason
//    0   40     F  VDP2    VBlank IN
//    1   41     E  VDP2    VBlank OUT
//    2   42     D  VDP2    HBlank IN
//    3   43     C  SCU     Timer 0
//    4   44     B  SCU     Timer 1
//    5   45     A  SCU     DSP End
//    6   46     9  SCSP    Sound Request
//    7   47     8  SMPC    System Manager
//    8   48     8  SMPC    PAD Interrupt
//    9   49     6  SCU     Level 2 DMA End
//   10   4A     6  SCU     Level 1 DMA End
//   11   4B     5  SCU     Level 0 DMA End
//   12   4C     3  SCU     DMA-illegal
//   13   4D     2  VDP1    Sprite Draw End
//   16+  50+   7/4/1       A-Bus external interrupts

pub const INTR_VBLANK_IN: u32 = 1 << 0;
pub const INTR_VBLANK_OUT: u32 = 1 << 1;
pub const INTR_HBLANK_IN: u32 = 1 << 2;
pub const INTR_TIMER_0: u32 = 1 << 3;
pub const INTR_TIMER_1: u32 = 1 << 4;
pub const INTR_DSP_END: u32 = 1 << 5;
pub const INTR_SOUND_REQUEST: u32 = 1 << 6;
pub const INTR_SYSTEM_MANAGER: u32 = 1 << 7;
pub const INTR_PAD: u32 = 1 << 8;
pub const INTR_DMA2_END: u32 = 1 << 9;
pub const INTR_DMA1_END: u32 = 1 << 10;
pub const INTR_DMA0_END: u32 = 1 << 11;
pub const INTR_DMA_ILLEGAL: u32 = 1 << 12;
pub const INTR_SPRITE_DRAW_END: u32 = 1 << 13;

const INTERNAL_LEVELS: [u8; 17] = [
    0xF, 0xE, 0xD, 0xC, 0xB, 0xA, 0x9, 0x8, //
    0x8, 0x6, 0x6, 0x5, 0x3, 0x2, 0x0, 0x0, //
    0x0,
];
const EXTERNAL_LEVELS: [u8; 17] = [
    0x7, 0x7, 0x7, 0x7, 0x4, 0x4, 0x4, 0x4, //
    0x1, 0x1, 0x1, 0x1, 0x1, 0x1, 0x1, 0x1, //
    0x0,
];

/// Default interrupt mask after reset/acknowledge: everything masked,
/// A-Bus gate (bit 15) off.
const INTR_MASK_DEFAULT: u32 = 0xBFFF;

/// External CPU interrupt line: (level, vector).
pub type ExternalInterruptFn = Box<dyn FnMut(u8, u8)>;

/// The cartridge slot, shared with the bus handlers so DMA can stream
/// cartridge data without re-entering the SCU.
pub struct CartSlot {
    pub cartridge: Cartridge,
    debug_output: String,
}

impl CartSlot {
    fn new() -> Self {
        Self {
            cartridge: Cartridge::None,
            debug_output: String::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.cartridge.id()
    }

    fn read_word(&self, address: u32) -> u16 {
        if address >= 0x4FF_FFFE {
            0xFF00 | self.id() as u16
        } else {
            self.cartridge.read_word(address)
        }
    }

    fn read_byte(&self, address: u32) -> u8 {
        if address >= 0x4FF_FFFE {
            if address & 1 == 0 {
                0xFF
            } else {
                self.id()
            }
        } else {
            self.cartridge.read_byte(address)
        }
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        if address == 0x210_0001 {
            // Debug port: accumulate and log complete lines.
            if value == b'\n' {
                debug!("guest: {}", self.debug_output);
                self.debug_output.clear();
            } else if value != b'\r' {
                self.debug_output.push(value as char);
            }
        } else {
            self.cartridge.write_byte(address, value);
        }
    }

    fn write_word(&mut self, address: u32, value: u16) {
        self.cartridge.write_word(address, value);
    }
}

pub struct Scu {
    // ── Interrupts ──
    intr_mask: u32,
    intr_status: u32,
    abus_intr_ack: bool,
    pending_intr_level: u8,
    pending_intr_index: u8,

    // ── DMA ──
    pub dma: [DmaChannel; 3],
    active_dma_channel: usize, // 3 = none

    // ── DSP ──
    pub dsp: ScuDsp,
    dsp_end_flag: Rc<Cell<bool>>,

    // ── Timers ──
    timer0_counter: u16,
    timer0_compare: u16,
    timer1_reload: u16,
    timer1_mode: bool,
    timer_enable: bool,
    timer1_event: EventId,

    wram_size_select: bool,

    pub cart_slot: Rc<RefCell<CartSlot>>,

    bus: Rc<Bus>,
    scheduler: Rc<Scheduler>,

    on_master_interrupt: Option<ExternalInterruptFn>,
    on_slave_interrupt: Option<ExternalInterruptFn>,
}

impl Scu {
    pub fn new(scheduler: Rc<Scheduler>, bus: Rc<Bus>) -> crate::error::CoreResult<Rc<RefCell<Self>>> {
        let dsp_end_flag = Rc::new(Cell::new(false));
        let mut dsp = ScuDsp::new(bus.clone());
        let flag = dsp_end_flag.clone();
        dsp.set_dsp_end_callback(Box::new(move || flag.set(true)));

        let scu = Rc::new(RefCell::new(Self {
            intr_mask: INTR_MASK_DEFAULT,
            intr_status: 0,
            abus_intr_ack: false,
            pending_intr_level: 0,
            pending_intr_index: 0,
            dma: [DmaChannel::new(), DmaChannel::new(), DmaChannel::new()],
            active_dma_channel: 3,
            dsp,
            dsp_end_flag,
            timer0_counter: 0,
            timer0_compare: 0,
            timer1_reload: 0,
            timer1_mode: false,
            timer_enable: false,
            timer1_event: 0,
            wram_size_select: false,
            cart_slot: Rc::new(RefCell::new(CartSlot::new())),
            bus,
            scheduler: scheduler.clone(),
            on_master_interrupt: None,
            on_slave_interrupt: None,
        }));

        let timer1_scu = scu.clone();
        let timer1_event = scheduler.register_event(Box::new(move |_ctx| {
            timer1_scu.borrow_mut().tick_timer1();
        }))?;
        scu.borrow_mut().timer1_event = timer1_event;

        Ok(scu)
    }

    pub fn set_master_interrupt_callback(&mut self, callback: ExternalInterruptFn) {
        self.on_master_interrupt = Some(callback);
    }

    pub fn set_slave_interrupt_callback(&mut self, callback: ExternalInterruptFn) {
        self.on_slave_interrupt = Some(callback);
    }

    pub fn reset(&mut self, hard: bool) {
        self.intr_mask = INTR_MASK_DEFAULT;
        self.intr_status = 0;
        self.abus_intr_ack = false;
        self.pending_intr_level = 0;
        self.pending_intr_index = 0;

        if hard {
            for ch in &mut self.dma {
                ch.reset();
            }
            self.active_dma_channel = 3;

            self.timer0_counter = 0;
            self.timer0_compare = 0;
            self.scheduler.cancel(self.timer1_event);
            self.timer1_reload = 0;
            self.timer1_mode = false;
            self.timer_enable = false;
        }

        self.dsp.reset(hard);
        self.wram_size_select = false;
    }

    /// Advance the SCU's share of master cycles: the DSP runs at half the
    /// master clock.
    pub fn advance(&mut self, cycles: u64) {
        self.dsp.run(cycles / 2);
        if self.dsp_end_flag.take() {
            self.trigger_dsp_end();
        }
    }

    pub fn wram_size_select(&self) -> bool {
        self.wram_size_select
    }

    // ── Interrupt triggers ─────────────────────────────────────

    fn raise_internal(&mut self, bit: u32) -> bool {
        if self.intr_status & bit == 0 {
            self.intr_status |= bit;
            self.update_interrupt_level();
            true
        } else {
            false
        }
    }

    pub fn notify_hblank(&mut self) {
        self.intr_status |= INTR_HBLANK_IN;
        self.update_interrupt_level();
        if self.timer_enable {
            if self.timer0_counter == self.timer0_compare {
                self.trigger_timer0();
            }
            self.timer0_counter = self.timer0_counter.wrapping_add(1);
            self.scheduler
                .schedule_from_now(self.timer1_event, self.timer1_reload as u64);
            self.trigger_dma_transfer(DmaTrigger::HBlankIn);
        }
    }

    pub fn notify_vblank(&mut self, level: bool) {
        if level {
            self.intr_status |= INTR_VBLANK_IN;
            self.trigger_dma_transfer(DmaTrigger::VBlankIn);
        } else {
            self.intr_status |= INTR_VBLANK_OUT;
            self.timer0_counter = 0;
            self.trigger_dma_transfer(DmaTrigger::VBlankOut);
        }
        self.update_interrupt_level();
    }

    fn trigger_timer0(&mut self) {
        if self.raise_internal(INTR_TIMER_0) {
            self.trigger_dma_transfer(DmaTrigger::Timer0);
        }
    }

    fn trigger_timer1(&mut self) {
        if self.raise_internal(INTR_TIMER_1) {
            self.trigger_dma_transfer(DmaTrigger::Timer1);
        }
    }

    fn tick_timer1(&mut self) {
        // Gated by mode: either every line, or only on lines where
        // Timer 0 matched.
        if self.timer_enable && (!self.timer1_mode || self.timer0_counter == self.timer0_compare) {
            self.trigger_timer1();
        }
    }

    pub fn trigger_dsp_end(&mut self) {
        self.raise_internal(INTR_DSP_END);
    }

    pub fn trigger_sound_request(&mut self, level: bool) {
        let current = self.intr_status & INTR_SOUND_REQUEST != 0;
        if current != level {
            self.intr_status = (self.intr_status & !INTR_SOUND_REQUEST)
                | if level { INTR_SOUND_REQUEST } else { 0 };
            self.update_interrupt_level();
            if level {
                self.trigger_dma_transfer(DmaTrigger::SoundRequest);
            }
        }
    }

    pub fn trigger_system_manager(&mut self) {
        self.raise_internal(INTR_SYSTEM_MANAGER);
    }

    pub fn trigger_pad(&mut self) {
        self.raise_internal(INTR_PAD);
    }

    fn trigger_dma_end(&mut self, channel: usize) {
        let bit = match channel {
            0 => INTR_DMA0_END,
            1 => INTR_DMA1_END,
            _ => INTR_DMA2_END,
        };
        self.raise_internal(bit);
    }

    fn trigger_dma_illegal(&mut self) {
        self.raise_internal(INTR_DMA_ILLEGAL);
    }

    pub fn notify_sprite_draw_end(&mut self) {
        if self.raise_internal(INTR_SPRITE_DRAW_END) {
            self.trigger_dma_transfer(DmaTrigger::SpriteDrawEnd);
        }
    }

    /// Raise one of the 16 A-Bus external interrupts (the CD block uses
    /// line 0).
    pub fn trigger_external_interrupt(&mut self, index: u8) {
        let bit = 1u32 << (16 + (index & 15));
        if self.intr_status & bit == 0 {
            self.intr_status |= bit;
            self.update_interrupt_level();
        }
    }

    /// Called by the CPU wrapper when the master CPU takes the interrupt.
    pub fn acknowledge_external_interrupt(&mut self) {
        if self.pending_intr_level > 0 {
            trace!(
                "SCU: acknowledging {} interrupt {:X}",
                if self.pending_intr_index <= 15 {
                    "internal"
                } else {
                    "external"
                },
                self.pending_intr_index
            );
            self.pending_intr_level = 0;
            self.intr_mask = INTR_MASK_DEFAULT;
        }
        if let Some(cb) = self.on_master_interrupt.as_mut() {
            cb(0, 0);
        }
        if let Some(cb) = self.on_slave_interrupt.as_mut() {
            cb(0, 0);
        }
    }

    /// Re-arbitrate after any change to `intr_status & !intr_mask`.
    fn update_interrupt_level(&mut self) {
        let internal_bits = (self.intr_status as u16) & !(self.intr_mask as u16) & 0x3FFF;
        let external_bits = if self.intr_mask & 0x8000 != 0 {
            (self.intr_status >> 16) as u16
        } else {
            0
        };
        if internal_bits == 0 && external_bits == 0 {
            return;
        }

        let internal_index = internal_bits.trailing_zeros() as usize;
        let external_index = external_bits.trailing_zeros() as usize;
        let internal_level = INTERNAL_LEVELS[internal_index];
        let external_level = EXTERNAL_LEVELS[external_index];

        // Ties go to internal; a new interrupt replaces the pending one
        // only at a strictly higher level.
        if internal_level >= external_level {
            if internal_level <= self.pending_intr_level {
                return;
            }
            trace!("SCU: raising internal interrupt {internal_index:X}, level {internal_level:X}");
            self.pending_intr_level = internal_level;
            self.pending_intr_index = internal_index as u8;
            self.intr_status &= !(1u32 << internal_index);

            if let Some(cb) = self.on_master_interrupt.as_mut() {
                cb(internal_level, 0x40 + internal_index as u8);
            }
            // VBlank IN and HBlank IN also go to the slave CPU.
            if let Some(cb) = self.on_slave_interrupt.as_mut() {
                match internal_index {
                    0 => cb(2, 0x43),
                    2 => cb(1, 0x41),
                    _ => cb(0, 0),
                }
            }
        } else if self.abus_intr_ack {
            if external_level <= self.pending_intr_level {
                return;
            }
            trace!("SCU: raising external interrupt {external_index:X}, level {external_level:X}");
            self.pending_intr_level = external_level;
            self.pending_intr_index = 16 + external_index as u8;
            self.intr_status &= !(1u32 << (16 + external_index));
            self.abus_intr_ack = false;

            if let Some(cb) = self.on_master_interrupt.as_mut() {
                cb(external_level, 0x50 + external_index as u8);
            }
            if let Some(cb) = self.on_slave_interrupt.as_mut() {
                cb(0, 0);
            }
        }
    }

    pub fn pending_interrupt(&self) -> (u8, u8) {
        (self.pending_intr_level, self.pending_intr_index)
    }

    pub fn interrupt_status(&self) -> u32 {
        self.intr_status
    }

    pub fn interrupt_mask(&self) -> u32 {
        self.intr_mask
    }

    // ── DMA engine ─────────────────────────────────────────────

    /// Mark channels keyed to `trigger` as started. The transfer itself
    /// runs from `run_pending_dma`, which the facade drains before the
    /// next scheduled event dispatches.
    pub fn trigger_dma_transfer(&mut self, trigger: DmaTrigger) {
        for (i, ch) in self.dma.iter_mut().enumerate() {
            if ch.enabled && !ch.active && ch.trigger == trigger {
                trace!("SCU DMA{i}: transfer triggered by {}", trigger.name());
                ch.start = true;
            }
        }
        self.recalc_dma_channel();
    }

    /// True when a channel is started or mid-transfer.
    pub fn dma_pending(&self) -> bool {
        self.active_dma_channel < 3
    }

    /// Run every pending transfer to completion.
    pub fn run_pending_dma(&mut self) {
        while self.active_dma_channel < 3 {
            self.run_dma();
        }
    }

    fn recalc_dma_channel(&mut self) {
        self.active_dma_channel = 3;

        for level in (0..3).rev() {
            let ch = &mut self.dma[level];
            if !ch.enabled {
                continue;
            }
            if ch.start && !ch.active {
                ch.start = false;
                ch.active = true;
                if ch.indirect {
                    ch.curr_indirect_src = ch.dst_addr;
                    self.dma_load_indirect_record(level);
                } else {
                    let count = ch.effective_count(level);
                    let ch = &mut self.dma[level];
                    ch.curr_src_addr = ch.src_addr & 0x7FF_FFFF;
                    ch.curr_dst_addr = ch.dst_addr & 0x7FF_FFFF;
                    ch.curr_xfer_count = count;
                    ch.setup_increments();
                    trace!(
                        "SCU DMA{level}: direct transfer of {:06X} bytes from {:07X} (+{:X}) to {:07X} (+{:X})",
                        ch.curr_xfer_count,
                        ch.curr_src_addr,
                        ch.curr_src_addr_inc,
                        ch.curr_dst_addr,
                        ch.curr_dst_addr_inc
                    );
                }
                self.active_dma_channel = level;
                break;
            }
        }
    }

    /// Load the next indirect-mode record: three longwords holding count,
    /// destination and source; the source's high bit flags the last
    /// record.
    fn dma_load_indirect_record(&mut self, level: usize) {
        let src = self.dma[level].curr_indirect_src;
        let count = self.bus.read32(src);
        let dst = self.bus.read32(src + 4);
        let raw_src = self.bus.read32(src + 8);

        let ch = &mut self.dma[level];
        ch.curr_xfer_count = if count != 0 {
            count
        } else {
            ch.effective_count(level)
        };
        ch.curr_dst_addr = dst & 0x7FF_FFFF;
        ch.end_indirect = raw_src & 0x8000_0000 != 0;
        ch.curr_src_addr = raw_src & 0x7FF_FFFF;
        ch.curr_indirect_src += 12;
        ch.setup_increments();

        trace!(
            "SCU DMA{level}: indirect record - {:06X} bytes from {:07X} to {:07X}{}",
            ch.curr_xfer_count,
            ch.curr_src_addr,
            ch.curr_dst_addr,
            if ch.end_indirect { " (final)" } else { "" }
        );
    }

    /// Run the active channel until it finishes or faults. 32 bits move
    /// per step: one long access on A-Bus/WRAM, two word accesses on the
    /// B-Bus.
    fn run_dma(&mut self) {
        let level = self.active_dma_channel;
        if level >= 3 {
            return;
        }

        while self.dma[level].active {
            let (src_addr, dst_addr) = {
                let ch = &self.dma[level];
                (ch.curr_src_addr, ch.curr_dst_addr)
            };
            let src_bus = bus_id(src_addr);
            let dst_bus = bus_id(dst_addr);

            if src_bus == dst_bus || src_bus == BusId::None || dst_bus == BusId::None {
                if src_bus == dst_bus {
                    trace!("SCU DMA{level}: invalid same-bus transfer; ignored");
                } else {
                    trace!("SCU DMA{level}: invalid bus; transfer ignored");
                }
                self.dma[level].active = false;
                self.trigger_dma_illegal();
                self.recalc_dma_channel();
                break;
            }

            // Read one longword.
            let value = {
                let (inc, addr) = {
                    let ch = &self.dma[level];
                    (ch.curr_src_addr_inc, ch.curr_src_addr)
                };
                if src_bus == BusId::BBus {
                    let hi = self.bus.read16(addr) as u32;
                    let mid = addr.wrapping_add(inc / 2);
                    let lo = self.bus.read16(mid) as u32;
                    self.dma[level].curr_src_addr = mid.wrapping_add(inc / 2) & 0x7FF_FFFF;
                    (hi << 16) | lo
                } else {
                    let hi = self.bus.read16(addr) as u32;
                    let lo = self.bus.read16(addr + 2) as u32;
                    self.dma[level].curr_src_addr = addr.wrapping_add(inc) & 0x7FF_FFFF;
                    (hi << 16) | lo
                }
            };

            // Write it out.
            {
                let (inc, addr) = {
                    let ch = &self.dma[level];
                    (ch.curr_dst_addr_inc, ch.curr_dst_addr)
                };
                if dst_bus == BusId::BBus {
                    self.bus.write16(addr, (value >> 16) as u16);
                    let mid = addr.wrapping_add(inc);
                    self.bus.write16(mid, value as u16);
                    self.dma[level].curr_dst_addr = mid.wrapping_add(inc) & 0x7FF_FFFF;
                } else {
                    self.bus.write16(addr, (value >> 16) as u16);
                    self.bus.write16(addr + 2, value as u16);
                    self.dma[level].curr_dst_addr = addr.wrapping_add(inc) & 0x7FF_FFFF;
                }
            }

            let remaining = self.dma[level].curr_xfer_count;
            if remaining > 4 {
                self.dma[level].curr_xfer_count = remaining - 4;
            } else if self.dma[level].indirect && !self.dma[level].end_indirect {
                self.dma_load_indirect_record(level);
            } else {
                trace!("SCU DMA{level}: finished transfer");
                let ch = &mut self.dma[level];
                ch.active = false;
                ch.curr_xfer_count = 0;
                if ch.update_src_addr {
                    ch.src_addr = ch.curr_src_addr;
                }
                if ch.update_dst_addr {
                    ch.dst_addr = if ch.indirect {
                        ch.curr_indirect_src
                    } else {
                        ch.curr_dst_addr
                    };
                }
                self.trigger_dma_end(level);
                self.recalc_dma_channel();
            }
        }
    }

    // ── Save states ────────────────────────────────────────────

    pub fn save_state(&self) -> crate::state::ScuState {
        use crate::state::{ScuDmaState, ScuDspState};
        crate::state::ScuState {
            intr_mask: self.intr_mask,
            intr_status: self.intr_status,
            abus_intr_ack: self.abus_intr_ack,
            pending_intr_level: self.pending_intr_level,
            pending_intr_index: self.pending_intr_index,
            timer0_counter: self.timer0_counter,
            timer0_compare: self.timer0_compare,
            timer1_reload: self.timer1_reload,
            timer1_mode: self.timer1_mode,
            timer_enable: self.timer_enable,
            wram_size_select: self.wram_size_select,
            dma: self
                .dma
                .iter()
                .map(|ch| ScuDmaState {
                    src_addr: ch.src_addr,
                    dst_addr: ch.dst_addr,
                    xfer_count: ch.xfer_count,
                    src_addr_inc: ch.src_addr_inc,
                    dst_addr_inc: ch.dst_addr_inc,
                    update_src_addr: ch.update_src_addr,
                    update_dst_addr: ch.update_dst_addr,
                    enabled: ch.enabled,
                    active: ch.active,
                    indirect: ch.indirect,
                    trigger: ch.trigger as u8,
                    start: ch.start,
                    curr_src_addr: ch.curr_src_addr,
                    curr_dst_addr: ch.curr_dst_addr,
                    curr_xfer_count: ch.curr_xfer_count,
                    curr_src_addr_inc: ch.curr_src_addr_inc,
                    curr_dst_addr_inc: ch.curr_dst_addr_inc,
                    curr_indirect_src: ch.curr_indirect_src,
                    end_indirect: ch.end_indirect,
                })
                .collect(),
            dsp: ScuDspState {
                program_ram: self.dsp.program_ram.iter().map(|i| i.0).collect(),
                data_ram: self.dsp.data_ram.iter().map(|b| b.to_vec()).collect(),
                program_executing: self.dsp.program_executing,
                program_paused: self.dsp.program_paused,
                program_ended: self.dsp.program_ended,
                program_step: self.dsp.program_step,
                pc: self.dsp.pc,
                data_address: self.dsp.data_address,
                next_pc: self.dsp.next_pc,
                jmp_counter: self.dsp.jmp_counter,
                sign: self.dsp.sign,
                zero: self.dsp.zero,
                carry: self.dsp.carry,
                overflow: self.dsp.overflow,
                ct: self.dsp.ct,
                alu: self.dsp.alu.raw(),
                ac: self.dsp.ac.raw(),
                p: self.dsp.p.raw(),
                rx: self.dsp.rx,
                ry: self.dsp.ry,
                lop: self.dsp.loop_count,
                top: self.dsp.loop_top,
                dma_run: self.dsp.dma_run,
                dma_to_d0: self.dsp.dma_to_d0,
                dma_hold: self.dsp.dma_hold,
                dma_count: self.dsp.dma_count,
                dma_src: self.dsp.dma_src,
                dma_dst: self.dsp.dma_dst,
                dma_read_addr: self.dsp.dma_read_addr,
                dma_write_addr: self.dsp.dma_write_addr,
                dma_addr_inc: self.dsp.dma_addr_inc,
            },
        }
    }

    pub fn load_state(&mut self, state: &crate::state::ScuState) {
        self.intr_mask = state.intr_mask;
        self.intr_status = state.intr_status;
        self.abus_intr_ack = state.abus_intr_ack;
        self.pending_intr_level = state.pending_intr_level;
        self.pending_intr_index = state.pending_intr_index;
        self.timer0_counter = state.timer0_counter;
        self.timer0_compare = state.timer0_compare;
        self.timer1_reload = state.timer1_reload;
        self.timer1_mode = state.timer1_mode;
        self.timer_enable = state.timer_enable;
        self.wram_size_select = state.wram_size_select;
        for (ch, s) in self.dma.iter_mut().zip(&state.dma) {
            ch.src_addr = s.src_addr;
            ch.dst_addr = s.dst_addr;
            ch.xfer_count = s.xfer_count;
            ch.src_addr_inc = s.src_addr_inc;
            ch.dst_addr_inc = s.dst_addr_inc;
            ch.update_src_addr = s.update_src_addr;
            ch.update_dst_addr = s.update_dst_addr;
            ch.enabled = s.enabled;
            ch.active = s.active;
            ch.indirect = s.indirect;
            ch.trigger = DmaTrigger::from_bits(s.trigger as u32);
            ch.start = s.start;
            ch.curr_src_addr = s.curr_src_addr;
            ch.curr_dst_addr = s.curr_dst_addr;
            ch.curr_xfer_count = s.curr_xfer_count;
            ch.curr_src_addr_inc = s.curr_src_addr_inc;
            ch.curr_dst_addr_inc = s.curr_dst_addr_inc;
            ch.curr_indirect_src = s.curr_indirect_src;
            ch.end_indirect = s.end_indirect;
        }
        self.active_dma_channel = 3;

        let dsp = &mut self.dsp;
        for (i, word) in state.dsp.program_ram.iter().enumerate() {
            dsp.program_ram[i] = dsp::DspInstr(*word);
        }
        for (bank, data) in dsp.data_ram.iter_mut().zip(&state.dsp.data_ram) {
            bank.copy_from_slice(data);
        }
        dsp.program_executing = state.dsp.program_executing;
        dsp.program_paused = state.dsp.program_paused;
        dsp.program_ended = state.dsp.program_ended;
        dsp.program_step = state.dsp.program_step;
        dsp.pc = state.dsp.pc;
        dsp.data_address = state.dsp.data_address;
        dsp.next_pc = state.dsp.next_pc;
        dsp.jmp_counter = state.dsp.jmp_counter;
        dsp.sign = state.dsp.sign;
        dsp.zero = state.dsp.zero;
        dsp.carry = state.dsp.carry;
        dsp.overflow = state.dsp.overflow;
        dsp.ct = state.dsp.ct;
        dsp.alu = dsp::Reg48::new(state.dsp.alu);
        dsp.ac = dsp::Reg48::new(state.dsp.ac);
        dsp.p = dsp::Reg48::new(state.dsp.p);
        dsp.rx = state.dsp.rx;
        dsp.ry = state.dsp.ry;
        dsp.loop_count = state.dsp.lop & 0xFFF;
        dsp.loop_top = state.dsp.top;
        dsp.dma_run = state.dsp.dma_run;
        dsp.dma_to_d0 = state.dsp.dma_to_d0;
        dsp.dma_hold = state.dsp.dma_hold;
        dsp.dma_count = state.dsp.dma_count;
        dsp.dma_src = state.dsp.dma_src & 3;
        dsp.dma_dst = state.dsp.dma_dst & 7;
        dsp.dma_read_addr = state.dsp.dma_read_addr & 0x7FF_FFFC;
        dsp.dma_write_addr = state.dsp.dma_write_addr & 0x7FF_FFFC;
        dsp.dma_addr_inc = state.dsp.dma_addr_inc;
    }

    // ── Register file ──────────────────────────────────────────

    pub fn read_reg32(&mut self, address: u32, peek: bool) -> u32 {
        let address = address & 0xFF & !3;
        match address {
            0x00 | 0x20 | 0x40 => self.dma[(address >> 5) as usize].src_addr,
            0x04 | 0x24 | 0x44 => self.dma[(address >> 5) as usize].dst_addr,
            0x08 | 0x28 | 0x48 => self.dma[(address >> 5) as usize].xfer_count,
            0x0C | 0x2C | 0x4C => {
                if peek {
                    let ch = &self.dma[(address >> 5) as usize];
                    let dst = if ch.dst_addr_inc == 0 {
                        0
                    } else {
                        ch.dst_addr_inc.trailing_zeros()
                    };
                    ((ch.src_addr_inc / 4) << 8) | dst
                } else {
                    0
                }
            }
            0x10 | 0x30 | 0x50 => {
                if peek {
                    (self.dma[(address >> 5) as usize].enabled as u32) << 8
                } else {
                    0
                }
            }
            0x14 | 0x34 | 0x54 => {
                if peek {
                    let ch = &self.dma[(address >> 5) as usize];
                    ((ch.indirect as u32) << 24)
                        | ((ch.update_src_addr as u32) << 16)
                        | ((ch.update_dst_addr as u32) << 8)
                        | ch.trigger as u32
                } else {
                    0
                }
            }
            0x60 => 0, // DMA force stop (write-only)
            0x7C => {
                // DMA status
                let mut value = 0u32;
                value |= (self.dma[0].active as u32) << 4;
                value |= (self.dma[1].active as u32) << 8;
                value |= (self.dma[2].active as u32) << 12;
                value |= ((self.dma[0].active && (self.dma[1].active || self.dma[2].active)) as u32)
                    << 16;
                value |= ((self.dma[1].active && self.dma[2].active) as u32) << 17;
                value
            }

            0x80 => {
                // DSP program control port
                let mut value = self.dsp.pc as u32;
                value |= (self.dsp.program_executing as u32) << 16;
                value |= (self.dsp.program_ended as u32) << 18;
                value |= (self.dsp.overflow as u32) << 19;
                value |= (self.dsp.carry as u32) << 20;
                value |= (self.dsp.zero as u32) << 21;
                value |= (self.dsp.sign as u32) << 22;
                value |= (self.dsp.dma_run as u32) << 23;
                if !peek {
                    self.dsp.overflow = false;
                }
                value
            }
            0x84 => {
                if peek {
                    self.dsp.read_program()
                } else {
                    0
                }
            }
            0x88 => {
                if peek {
                    self.dsp.data_address as u32
                } else {
                    0
                }
            }
            0x8C => self.dsp.read_data(peek),

            0x90 => {
                if peek {
                    self.timer0_compare as u32
                } else {
                    0
                }
            }
            0x94 => {
                if peek {
                    self.timer1_reload as u32
                } else {
                    0
                }
            }
            0x98 => {
                if peek {
                    (self.timer_enable as u32) | ((self.timer1_mode as u32) << 8)
                } else {
                    0
                }
            }

            0xA0 => self.intr_mask,
            0xA4 => self.intr_status,
            0xA8 => self.abus_intr_ack as u32,

            0xB0 | 0xB4 | 0xB8 => 0, // A-Bus set/refresh, ignored

            0xC4 => self.wram_size_select as u32,
            0xC8 => 0x4, // SCU version

            _ => {
                if !peek {
                    debug!("SCU: unhandled 32-bit register read from {address:02X}");
                }
                0
            }
        }
    }

    pub fn write_reg32(&mut self, address: u32, value: u32, poke: bool) {
        let address = address & 0xFF & !3;
        match address {
            0x00 | 0x20 | 0x40 => {
                self.dma[(address >> 5) as usize].src_addr = value & 0x7FF_FFFF;
            }
            0x04 | 0x24 | 0x44 => {
                self.dma[(address >> 5) as usize].dst_addr = value & 0x7FF_FFFF;
            }
            0x08 => self.dma[0].xfer_count = value & 0xF_FFFF,
            0x28 | 0x48 => self.dma[(address >> 5) as usize].xfer_count = value & 0xFFF,
            0x0C | 0x2C | 0x4C => {
                let ch = &mut self.dma[(address >> 5) as usize];
                ch.src_addr_inc = ((value >> 8) & 1) * 4;
                ch.dst_addr_inc = (1u32 << (value & 7)) & !1;
            }
            0x10 | 0x30 | 0x50 => {
                let index = (address >> 5) as usize;
                let ch = &mut self.dma[index];
                ch.enabled = value & 0x100 != 0;
                if !poke && ch.enabled && ch.trigger == DmaTrigger::Immediate && value & 1 != 0 {
                    if self.dma[index].active {
                        // Finish the outstanding transfer first.
                        self.run_pending_dma();
                    }
                    trace!("SCU DMA{index}: transfer triggered immediately");
                    self.dma[index].start = true;
                    self.recalc_dma_channel();
                    self.run_pending_dma();
                }
            }
            0x14 | 0x34 | 0x54 => {
                let ch = &mut self.dma[(address >> 5) as usize];
                ch.indirect = value & 0x0100_0000 != 0;
                ch.update_src_addr = value & 0x0001_0000 != 0;
                ch.update_dst_addr = value & 0x0000_0100 != 0;
                ch.trigger = DmaTrigger::from_bits(value);
            }

            0x60 => {
                if !poke && value & 1 != 0 {
                    for ch in &mut self.dma {
                        ch.active = false;
                    }
                    self.active_dma_channel = 3;
                }
            }
            0x7C => {} // status is read-only

            0x80 => {
                if value & 0x8000 != 0 {
                    self.dsp.write_pc(value as u8);
                }
                if value & 0x0200_0000 != 0 {
                    self.dsp.program_paused = true;
                } else if value & 0x0400_0000 != 0 {
                    self.dsp.program_paused = false;
                } else {
                    self.dsp.program_executing = value & 0x1_0000 != 0;
                    self.dsp.program_step = value & 0x2_0000 != 0;
                    self.dsp.program_ended = false;
                }
            }
            0x84 => self.dsp.write_program(value, poke),
            0x88 => self.dsp.data_address = value as u8,
            0x8C => self.dsp.write_data(value, poke),

            0x90 => self.timer0_compare = (value & 0x3FF) as u16,
            0x94 => self.timer1_reload = (value & 0x1FF) as u16,
            0x98 => {
                self.timer_enable = value & 1 != 0;
                self.timer1_mode = value & 0x100 != 0;
            }

            0xA0 => {
                self.intr_mask = value & 0xBFFF;
                if !poke {
                    self.update_interrupt_level();
                }
            }
            0xA4 => {
                if poke {
                    self.intr_status = value & 0xFFFF_BFFF;
                } else {
                    self.intr_status &= value;
                }
            }
            0xA8 => {
                self.abus_intr_ack = value & 1 != 0;
                if !poke {
                    self.update_interrupt_level();
                }
            }

            0xB0 | 0xB4 | 0xB8 => {} // A-Bus config, ignored
            0xC4 => self.wram_size_select = value & 1 != 0,
            0xC8 => {} // version is read-only

            _ => {
                if !poke {
                    debug!("SCU: unhandled 32-bit register write to {address:02X} = {value:X}");
                }
            }
        }
    }

    fn read_reg16(&mut self, address: u32, peek: bool) -> u16 {
        let value = self.read_reg32(address & !3, peek);
        (value >> ((!address & 2) * 8)) as u16
    }

    fn read_reg8(&mut self, address: u32, peek: bool) -> u8 {
        let value = self.read_reg32(address & !3, peek);
        (value >> ((!address & 3) * 8)) as u8
    }

    fn write_reg16(&mut self, address: u32, value: u16, poke: bool) {
        let current = self.read_reg32(address & !3, true);
        let shift = (!address & 2) * 8;
        let merged = (current & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write_reg32(address & !3, merged, poke);
    }

    fn write_reg8(&mut self, address: u32, value: u8, poke: bool) {
        let address = address & 0xFF;
        // IMS/IST/AIACK honor byte granularity directly; everything else
        // read-modify-writes the containing longword.
        match address {
            0xA2 => {
                self.intr_mask = ((value as u32) << 8) & 0xBF00;
                if !poke {
                    self.update_interrupt_level();
                }
            }
            0xA3 => {
                self.intr_mask = value as u32;
                if !poke {
                    self.update_interrupt_level();
                }
            }
            0xA4..=0xA7 => {
                let shift = (!address & 3) * 8;
                self.intr_status &= ((value as u32) << shift) | !(0xFFu32 << shift);
            }
            0xAB => {
                self.abus_intr_ack = value & 1 != 0;
                if !poke {
                    self.update_interrupt_level();
                }
            }
            _ => {
                let current = self.read_reg32(address & !3, true);
                let shift = (!address & 3) * 8;
                let merged = (current & !(0xFF << shift)) | ((value as u32) << shift);
                self.write_reg32(address & !3, merged, poke);
            }
        }
    }
}

// ── Bus mapping ───────────────────────────────────────────────

pub fn map_scu(scu: &Rc<RefCell<Scu>>, bus: &Bus) {
    // Cartridge window: A-Bus CS0 + CS1. 32-bit accesses split into two
    // 16-bit halves the way the A-Bus does.
    let cart = scu.borrow().cart_slot.clone();
    for normal in [true, false] {
        let (r8, r16, r32) = (cart.clone(), cart.clone(), cart.clone());
        let (w8, w16, w32) = (cart.clone(), cart.clone(), cart.clone());
        let handlers = HandlerSet {
            read8: Box::new(move |a| r8.borrow().read_byte(a)),
            read16: Box::new(move |a| r16.borrow().read_word(a)),
            read32: Box::new(move |a| {
                let slot = r32.borrow();
                ((slot.read_word(a) as u32) << 16) | slot.read_word(a + 2) as u32
            }),
            write8: Box::new(move |a, v| w8.borrow_mut().write_byte(a, v)),
            write16: Box::new(move |a, v| w16.borrow_mut().write_word(a, v)),
            write32: Box::new(move |a, v| {
                let mut slot = w32.borrow_mut();
                slot.write_word(a, (v >> 16) as u16);
                slot.write_word(a + 2, v as u16);
            }),
        };
        if normal {
            bus.map_normal(0x200_0000, 0x4FF_FFFF, handlers);
        } else {
            bus.map_side_effect_free(0x200_0000, 0x4FF_FFFF, handlers);
        }
    }

    // SCU registers.
    for normal in [true, false] {
        let peek = !normal;
        let (r8, r16, r32) = (scu.clone(), scu.clone(), scu.clone());
        let (w8, w16, w32) = (scu.clone(), scu.clone(), scu.clone());
        let handlers = HandlerSet {
            read8: Box::new(move |a| r8.borrow_mut().read_reg8(a, peek)),
            read16: Box::new(move |a| r16.borrow_mut().read_reg16(a, peek)),
            read32: Box::new(move |a| r32.borrow_mut().read_reg32(a, peek)),
            write8: Box::new(move |a, v| w8.borrow_mut().write_reg8(a, v, peek)),
            write16: Box::new(move |a, v| w16.borrow_mut().write_reg16(a, v, peek)),
            write32: Box::new(move |a, v| w32.borrow_mut().write_reg32(a, v, peek)),
        };
        if normal {
            bus.map_normal(0x5FE_0000, 0x5FE_FFFF, handlers);
        } else {
            bus.map_side_effect_free(0x5FE_0000, 0x5FE_FFFF, handlers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{map_memory, SystemMemory};

    fn system() -> (Rc<Scheduler>, Rc<Bus>, Rc<RefCell<Scu>>, Rc<RefCell<SystemMemory>>) {
        let scheduler = Rc::new(Scheduler::new());
        let bus = Rc::new(Bus::new());
        let memory = Rc::new(RefCell::new(SystemMemory::new()));
        map_memory(&memory, &bus);
        let scu = Scu::new(scheduler.clone(), bus.clone()).unwrap();
        map_scu(&scu, &bus);
        (scheduler, bus, scu, memory)
    }

    #[test]
    fn direct_dma_copies_wram_to_wram_is_illegal() {
        let (_sched, bus, scu, _mem) = system();
        // Same-bus (WRAM -> WRAM) must raise DMA illegal.
        bus.write32(0x5FE_0000, 0x600_0000); // D0R
        bus.write32(0x5FE_0004, 0x610_0000); // D0W
        bus.write32(0x5FE_0008, 0x20); // D0C
        bus.write32(0x5FE_0014, 0x0000_0007); // mode: immediate
        bus.write32(0x5FE_0010, 0x101); // enable + start
        let scu = scu.borrow();
        assert!(scu.interrupt_status() & INTR_DMA_ILLEGAL != 0);
        assert!(!scu.dma[0].active);
    }

    #[test]
    fn direct_dma_channel0_copies_cartridge_to_wram() {
        let (_sched, bus, scu, mem) = system();
        scu.borrow_mut().cart_slot.borrow_mut().cartridge = Cartridge::dram_8mbit();
        // Source pattern in cartridge DRAM (A-Bus).
        {
            let slot = scu.borrow();
            let mut cart = slot.cart_slot.borrow_mut();
            for i in 0..0x20u32 {
                cart.cartridge.write_byte(i, i as u8);
            }
        }

        bus.write32(0x5FE_0000, 0x200_0000); // D0R: cartridge
        bus.write32(0x5FE_0004, 0x610_0000); // D0W: WRAM high mirror
        bus.write32(0x5FE_0008, 0x20); // D0C: 32 bytes
        bus.write32(0x5FE_000C, 0x0000_0102); // increments: src +4, dst +4
        bus.write32(0x5FE_0014, 0x0000_0007); // direct, immediate
        bus.write32(0x5FE_0010, 0x101); // enable + start bit

        {
            let scu = scu.borrow();
            assert!(!scu.dma[0].active, "transfer must have completed inline");
            assert_eq!(scu.dma[0].curr_xfer_count, 0);
            assert!(scu.interrupt_status() & INTR_DMA0_END != 0);
        }
        let mem = mem.borrow();
        for i in 0..0x20usize {
            assert_eq!(mem.wram_high[0x10_0000 + i], i as u8);
        }
    }

    #[test]
    fn timer1_fires_through_the_scheduler() {
        let (sched, bus, scu, _mem) = system();
        bus.write32(0x5FE_0094, 8); // T1S reload
        bus.write32(0x5FE_0098, 1); // timer enable, every line
        scu.borrow_mut().notify_hblank();
        sched.advance(8);
        let scu = scu.borrow();
        assert!(scu.interrupt_status() & INTR_TIMER_1 != 0);
    }

    #[test]
    fn timer1_reload_zero_fires_on_the_same_cycle() {
        let (sched, bus, scu, _mem) = system();
        bus.write32(0x5FE_0094, 0);
        bus.write32(0x5FE_0098, 1);
        scu.borrow_mut().notify_hblank();
        sched.advance(0);
        assert!(scu.borrow().interrupt_status() & INTR_TIMER_1 != 0);
    }

    #[test]
    fn abus_gate_masks_all_external_interrupts() {
        let (_sched, bus, scu, _mem) = system();
        let raised = Rc::new(RefCell::new(Vec::new()));
        let raised2 = raised.clone();
        scu.borrow_mut()
            .set_master_interrupt_callback(Box::new(move |level, vector| {
                raised2.borrow_mut().push((level, vector));
            }));

        // Gate closed: nothing happens.
        scu.borrow_mut().trigger_external_interrupt(0);
        assert!(raised.borrow().is_empty());

        // Open the gate and the acknowledge latch: the pending external
        // interrupt is delivered at level 7, vector 0x50.
        bus.write32(0x5FE_00A8, 1); // AIACK
        bus.write32(0x5FE_00A0, 0x8000 | 0x3FFF); // unmask gate only
        assert_eq!(*raised.borrow(), vec![(7, 0x50)]);
    }

    #[test]
    fn interrupt_priority_prefers_higher_levels() {
        let (_sched, _bus, scu, _mem) = system();
        let raised = Rc::new(RefCell::new(Vec::new()));
        let raised2 = raised.clone();
        let mut scu_mut = scu.borrow_mut();
        scu_mut.set_master_interrupt_callback(Box::new(move |level, vector| {
            raised2.borrow_mut().push((level, vector));
        }));
        scu_mut.intr_mask = 0; // unmask everything internal

        scu_mut.trigger_pad(); // level 8, vector 0x48
        scu_mut.notify_vblank(true); // level F, vector 0x40 - replaces pending
        drop(scu_mut);
        assert_eq!(*raised.borrow(), vec![(8, 0x48), (15, 0x40)]);

        // Acknowledge resets the mask to its default.
        scu.borrow_mut().acknowledge_external_interrupt();
        assert_eq!(scu.borrow().interrupt_mask(), 0xBFFF);
    }
}
