//! SCSP sound block: 32-voice mixer, effects DSP, timers, interrupt
//! arbiter, DMA micro-engine, MIDI queues and the CDDA receive ring.
//!
//! The block advances on a scheduled tick event. At the default
//! granularity one firing covers a full 44.1 kHz sample (512 SCSP
//! cycles, all 32 slots); finer granularities fire every 2^n slots for
//! tighter interleaving with the auxiliary CPU.

pub mod dsp;
pub mod slot;

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::bus::{Bus, HandlerSet};
use crate::clocks::ClockRatios;
use crate::sched::{EventContext, EventId, Scheduler};
use dsp::ScspDsp;
use slot::{Slot, SoundSource};

pub const SOUND_RAM_SIZE: usize = 512 * 1024;

/// SCSP cycles per output sample (22.5792 MHz / 44.1 kHz).
pub const CYCLES_PER_SAMPLE: u64 = 512;
/// SCSP cycles per slot step.
pub const CYCLES_PER_SLOT: u64 = 16;
/// The auxiliary CPU runs at half the SCSP clock.
pub const AUX_CPU_CYCLES_PER_SAMPLE: u64 = CYCLES_PER_SAMPLE / 2;

/// CDDA receive ring: 75 sectors of 2352 bytes (one second at 1x).
pub const CDDA_RING_SIZE: usize = 75 * 2352;

// ── Interrupt sources (bit positions in SCIPD/SCIEB/MCIPD/MCIEB) ──

pub const INTR_EXT0: u16 = 0;
pub const INTR_EXT1: u16 = 1;
pub const INTR_EXT2: u16 = 2;
pub const INTR_MIDI_INPUT: u16 = 3;
pub const INTR_DMA_END: u16 = 4;
pub const INTR_CPU_MANUAL: u16 = 5;
pub const INTR_TIMER_A: u16 = 6;
pub const INTR_TIMER_B: u16 = 7;
pub const INTR_TIMER_C: u16 = 8;
pub const INTR_MIDI_OUTPUT: u16 = 9;
pub const INTR_SAMPLE: u16 = 10;

const INTR_COUNT: u16 = 11;

pub type AuxRunFn = Box<dyn FnMut(u64) -> u64>;
pub type AuxInterruptFn = Box<dyn FnMut(u8)>;
pub type SoundRequestFn = Box<dyn FnMut(bool)>;
pub type OutputSampleFn = Box<dyn FnMut(i32, i32)>;
pub type MidiOutputFn = Box<dyn FnMut(&[u8])>;

/// One of the three sample-interval timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    /// Increment interval selector: one step every 2^interval samples.
    pub interval: u8,
    /// 8-bit counter; overflow raises the timer interrupt.
    pub counter: u16,
}

impl Timer {
    /// Returns true on overflow.
    fn tick(&mut self, sample_counter: u32) -> bool {
        if sample_counter & ((1 << self.interval) - 1) != 0 {
            return false;
        }
        self.counter += 1;
        if self.counter >= 0x100 {
            self.counter &= 0xFF;
            true
        } else {
            false
        }
    }
}

/// Scheduled MIDI input byte.
struct MidiInMessage {
    deliver_at_sample: u32,
    byte: u8,
}

pub struct Scsp {
    pub slots: [Slot; 32],
    pub sound_ram: Box<[u8]>,
    pub dsp: ScspDsp,

    // ── Mixer ──
    master_volume: u8,
    dac_18_bits: bool,
    mem_4mb: bool,
    interpolate: bool,
    sound_stack: [i16; 64],
    sound_stack_index: usize,
    out: [i32; 2],

    // ── Noise ──
    lfsr: u32,

    // ── Key strobe ──
    kyonex: bool,

    // ── Tick state ──
    curr_slot: usize,
    sample_counter: u32,
    step_shift: u32,         // log2 of slots per firing (5 = full sample)
    pending_step_shift: Option<u32>,
    tick_event: EventId,

    // ── Timers ──
    pub timers: [Timer; 3],

    // ── Interrupts ──
    scieb: u16,
    scipd: u16,
    scilv: [u8; 3],
    mcieb: u16,
    mcipd: u16,
    scu_sound_request: bool,

    // ── DMA ──
    dma_mem_addr: u32, // DMEA, 20 bits
    dma_reg_addr: u32, // DRGA, 12 bits
    dma_length: u32,   // DTLG, 12 bits
    dma_gate: bool,    // DGATE
    dma_to_mem: bool,  // DDIR
    dma_exec: bool,    // DEXE

    // ── MIDI ──
    midi_in_queue: Vec<MidiInMessage>,
    midi_in_ring: [u8; 64],
    midi_in_read: usize,
    midi_in_write: usize,
    midi_in_overflow: bool,
    midi_out_buffer: Vec<u8>,

    // ── CDDA ──
    cdda_ring: Box<[u8]>,
    cdda_read_pos: usize,
    cdda_write_pos: usize,
    cdda_ready: bool,

    // ── Auxiliary CPU ──
    aux_enabled: bool,
    aux_spillover: u64,

    // ── Callbacks ──
    run_aux_cpu: Option<AuxRunFn>,
    on_aux_interrupt: Option<AuxInterruptFn>,
    on_sound_request: Option<SoundRequestFn>,
    on_sample: Option<OutputSampleFn>,
    on_midi_out: Option<MidiOutputFn>,
    sample_tx: Option<crossbeam_channel::Sender<(i32, i32)>>,
}

impl Scsp {
    pub fn new(scheduler: &Rc<Scheduler>) -> crate::error::CoreResult<Rc<RefCell<Self>>> {
        let scsp = Rc::new(RefCell::new(Self {
            slots: std::array::from_fn(Slot::new),
            sound_ram: vec![0; SOUND_RAM_SIZE].into_boxed_slice(),
            dsp: ScspDsp::new(),
            master_volume: 0,
            dac_18_bits: false,
            mem_4mb: false,
            interpolate: true,
            sound_stack: [0; 64],
            sound_stack_index: 0,
            out: [0; 2],
            lfsr: 1,
            kyonex: false,
            curr_slot: 0,
            sample_counter: 0,
            step_shift: 5,
            pending_step_shift: None,
            tick_event: 0,
            timers: [Timer::default(); 3],
            scieb: 0,
            scipd: 0,
            scilv: [0; 3],
            mcieb: 0,
            mcipd: 0,
            scu_sound_request: false,
            dma_mem_addr: 0,
            dma_reg_addr: 0,
            dma_length: 0,
            dma_gate: false,
            dma_to_mem: false,
            dma_exec: false,
            midi_in_queue: Vec::new(),
            midi_in_ring: [0; 64],
            midi_in_read: 0,
            midi_in_write: 0,
            midi_in_overflow: false,
            midi_out_buffer: Vec::new(),
            cdda_ring: vec![0; CDDA_RING_SIZE].into_boxed_slice(),
            cdda_read_pos: 0,
            cdda_write_pos: 0,
            cdda_ready: false,
            aux_enabled: false,
            aux_spillover: 0,
            run_aux_cpu: None,
            on_aux_interrupt: None,
            on_sound_request: None,
            on_sample: None,
            on_midi_out: None,
            sample_tx: None,
        }));

        let tick_scsp = scsp.clone();
        let tick_event = scheduler.register_event(Box::new(move |ctx| {
            tick_scsp.borrow_mut().on_tick(ctx);
        }))?;
        scsp.borrow_mut().tick_event = tick_event;
        Ok(scsp)
    }

    pub fn reset(&mut self, hard: bool) {
        for slot in &mut self.slots {
            slot.reset();
        }
        if hard {
            self.sound_ram.fill(0);
        }
        self.dsp.reset(hard);
        self.master_volume = 0;
        self.dac_18_bits = false;
        self.sound_stack = [0; 64];
        self.sound_stack_index = 0;
        self.out = [0; 2];
        self.lfsr = 1;
        self.kyonex = false;
        self.curr_slot = 0;
        self.sample_counter = 0;
        self.timers = [Timer::default(); 3];
        self.scieb = 0;
        self.scipd = 0;
        self.scilv = [0; 3];
        self.mcieb = 0;
        self.mcipd = 0;
        self.scu_sound_request = false;
        self.dma_exec = false;
        self.midi_in_queue.clear();
        self.midi_in_read = 0;
        self.midi_in_write = 0;
        self.midi_in_overflow = false;
        self.midi_out_buffer.clear();
        self.cdda_read_pos = 0;
        self.cdda_write_pos = 0;
        self.cdda_ready = false;
        self.aux_spillover = 0;
    }

    // ── Wiring ─────────────────────────────────────────────────

    pub fn set_aux_cpu_callback(&mut self, callback: AuxRunFn) {
        self.run_aux_cpu = Some(callback);
    }

    pub fn set_aux_interrupt_callback(&mut self, callback: AuxInterruptFn) {
        self.on_aux_interrupt = Some(callback);
    }

    pub fn set_sound_request_callback(&mut self, callback: SoundRequestFn) {
        self.on_sound_request = Some(callback);
    }

    pub fn set_output_callback(&mut self, callback: OutputSampleFn) {
        self.on_sample = Some(callback);
    }

    pub fn set_midi_output_callback(&mut self, callback: MidiOutputFn) {
        self.on_midi_out = Some(callback);
    }

    /// Route output samples into a channel instead of the callback (the
    /// threaded-audio handoff).
    pub fn set_sample_channel(&mut self, tx: crossbeam_channel::Sender<(i32, i32)>) {
        self.sample_tx = Some(tx);
    }

    pub fn set_aux_cpu_enabled(&mut self, enabled: bool) {
        self.aux_enabled = enabled;
        if !enabled {
            self.aux_spillover = 0;
        }
    }

    pub fn set_interpolation(&mut self, linear: bool) {
        self.interpolate = linear;
    }

    /// Start ticking. Called once by the facade after wiring.
    pub fn start(&self, scheduler: &Scheduler) {
        scheduler.schedule_from_now(self.tick_event, CYCLES_PER_SLOT << self.step_shift);
    }

    pub fn update_clock_ratios(&self, scheduler: &Scheduler, ratios: &ClockRatios) {
        scheduler.set_event_count_factor(self.tick_event, ratios.scsp_num, ratios.scsp_den);
    }

    /// Select how many slots one tick covers: granularity 0 processes a
    /// full sample per firing, 5 a single slot.
    pub fn set_step_granularity(&mut self, granularity: u32) {
        let shift = 5 - granularity.min(5);
        if shift != self.step_shift {
            if shift < self.step_shift {
                // Finer steps take effect immediately.
                self.step_shift = shift;
                self.pending_step_shift = None;
            } else {
                // Coarser steps wait until the slot counter aligns.
                self.pending_step_shift = Some(shift);
            }
        }
    }

    // ── Tick pipeline ──────────────────────────────────────────

    fn on_tick(&mut self, ctx: &mut EventContext) {
        // Adopt a pending coarser cadence once aligned to its window.
        if let Some(shift) = self.pending_step_shift {
            if self.curr_slot & ((1 << shift) - 1) == 0 {
                self.step_shift = shift;
                self.pending_step_shift = None;
            }
        }

        let slots = 1usize << self.step_shift;
        self.run_aux((AUX_CPU_CYCLES_PER_SAMPLE << self.step_shift) >> 5);
        self.process_midi_input_queue();
        for _ in 0..slots {
            let index = self.curr_slot;
            self.process_slot(index);
            self.curr_slot = (self.curr_slot + 1) & 31;
            if self.curr_slot == 0 {
                self.finish_sample();
            }
        }

        ctx.reschedule(CYCLES_PER_SLOT << self.step_shift);
    }

    fn run_aux(&mut self, cycles: u64) {
        if !self.aux_enabled {
            return;
        }
        if let Some(run) = self.run_aux_cpu.as_mut() {
            if self.aux_spillover >= cycles {
                self.aux_spillover -= cycles;
            } else {
                let wanted = cycles - self.aux_spillover;
                let ran = run(wanted);
                self.aux_spillover = ran.saturating_sub(wanted);
            }
        }
    }

    fn process_slot(&mut self, index: usize) {
        let interpolate = self.interpolate;
        let sample_counter = self.sample_counter;

        // Noise generator: 17-bit Galois LFSR, stepped every slot.
        self.lfsr = (self.lfsr >> 1) | ((((self.lfsr >> 5) ^ self.lfsr) & 1) << 16);

        if index == 0 && self.kyonex {
            self.kyonex = false;
            for slot in &mut self.slots {
                if slot.trigger_key() {
                    trace!(
                        "SCSP: slot {:02} key {} addr={:05X} loop={:04X}-{:04X}",
                        slot.index,
                        if slot.key_on_bit { "ON" } else { "OFF" },
                        slot.start_address,
                        slot.loop_start,
                        slot.loop_end
                    );
                }
            }
        }

        // Pitch LFO and phase advance.
        let pitch_lfo = self.pitch_lfo(index);
        let slot = &mut self.slots[index];
        slot.increment_lfo();
        let steps = slot.increment_phase(pitch_lfo);

        // Frequency modulation samples from the sound stack.
        let (mod_x_sel, mod_y_sel, mod_level) =
            (slot.mod_x_select, slot.mod_y_select, slot.mod_level);
        if mod_level >= 5 {
            let base = self.sound_stack_index;
            let x = self.sound_stack[(base.wrapping_sub(1) + mod_x_sel as usize) & 63] as i32;
            let y = self.sound_stack[(base.wrapping_sub(1) + mod_y_sel as usize) & 63] as i32;
            let slot = &mut self.slots[index];
            slot.mod_x_sample = x;
            slot.mod_y_sample = y;
            let zd = ((x + y) as u32) & 0x3F_FFFE;
            slot.modulation =
                sign_extend(((zd << 5) >> (16 - mod_level as u32)) as i32, 16);
        } else {
            self.slots[index].modulation = 0;
        }

        // Advance the sample position and fetch.
        self.slots[index].increment_sample(steps);
        self.fetch_samples(index);

        // Interpolate, amplitude LFO, envelope.
        let slot = &mut self.slots[index];
        if slot.sound_source == SoundSource::SoundRam && !interpolate {
            slot.output = slot.sample1;
        } else if slot.sound_source == SoundSource::SoundRam {
            let frac = slot.phase_fraction() as i32;
            let s1 = slot.sample1 as i32;
            let s2 = slot.sample2 as i32;
            slot.output = (s1 + (((s2 - s1) * frac) >> 6)) as i16;
        } else {
            slot.output = slot.sample1;
        }

        let lfsr = self.lfsr;
        let slot = &mut self.slots[index];
        slot.alfo_output = 0;
        if slot.amp_lfo_sens != 0 {
            let raw: u16 = match slot.amp_lfo_waveform {
                slot::Waveform::Saw => (slot.lfo_step & !1) as u16,
                slot::Waveform::Square => {
                    if slot.lfo_step < 128 {
                        0x00
                    } else {
                        0xFE
                    }
                }
                slot::Waveform::Triangle => {
                    let i = if slot.lfo_step < 128 {
                        slot.lfo_step
                    } else {
                        255 - slot.lfo_step
                    };
                    (i as u16) * 2
                }
                slot::Waveform::Noise => (lfsr as u16 & 0xFF) & !1,
            };
            slot.alfo_output = raw >> (7 - slot.amp_lfo_sens as u16);
        }
        let eg_counter = sample_counter.wrapping_add(1);
        slot.increment_eg(eg_counter);

        // Total attenuation, clamped to 10 bits.
        let slot = &mut self.slots[index];
        let level = slot.alfo_output as u32
            + slot.eg_attenuation() as u32
            + ((slot.total_level as u32) << 2);
        slot.final_level = level.min(0x3FF) as u16;

        if slot.sound_source == SoundSource::SoundRam && !slot.active {
            slot.output = slot.sample_xor() as i16;
        } else if !slot.sound_direct {
            let att = slot.final_level as i32;
            slot.output =
                ((slot.output as i32 * ((att & 0x3F) ^ 0x7F)) >> ((att >> 6) + 7)) as i16;
        }

        // Sound stack write.
        let output = self.slots[index].output;
        if !self.slots[index].stack_write_inhibit {
            let stack_index = self.sound_stack_index.wrapping_sub(6) & 63;
            self.sound_stack[stack_index] = output;
        }
        self.sound_stack_index = (self.sound_stack_index + 1) & 63;

        // Feed the effects DSP mix stack and step the DSP (4 of the 128
        // steps per slot).
        let (imxl, isel) = (self.slots[index].input_mix_level, self.slots[index].input_select);
        if imxl > 0 {
            let mixed = ((output as i32) << 4) >> (imxl ^ 7);
            self.dsp.mixs_write(isel as u32, mixed);
        }
        for _ in 0..4 {
            self.dsp.step(&mut self.sound_ram);
        }

        // Direct send into the output bus.
        let (disdl, dipan) = (self.slots[index].direct_send_level, self.slots[index].direct_pan);
        let direct = self.slots[index].output as i32;
        self.add_output(direct, disdl, dipan);
    }

    fn pitch_lfo(&self, index: usize) -> i32 {
        let slot = &self.slots[index];
        if slot.pitch_lfo_sens == 0 {
            return 0;
        }
        let raw: i32 = match slot.pitch_lfo_waveform {
            slot::Waveform::Saw => ((slot.lfo_step as i8) & !1) as i32,
            slot::Waveform::Square => {
                if slot.lfo_step < 128 {
                    126
                } else {
                    -128
                }
            }
            slot::Waveform::Triangle => {
                let i = slot.lfo_step.wrapping_sub(64);
                let v = if i < 128 { i } else { 255 - i };
                (v as i32) * 2 - 128
            }
            slot::Waveform::Noise => ((self.lfsr as u8 ^ 0x80) & !1) as i8 as i32,
        };
        let mut value = raw >> (7 - slot.pitch_lfo_sens as i32);
        value *= ((0x400 | slot.freq_num_switch as i32) >> 4) as i32;
        value >> 6
    }

    fn fetch_samples(&mut self, index: usize) {
        let slot = &self.slots[index];
        match slot.sound_source {
            SoundSource::SoundRam => {
                if !slot.active {
                    return;
                }
                let base = slot.start_address as usize;
                let mod_int = slot.modulation >> 5;
                let pos1 = slot.curr_sample as i64 + mod_int as i64;
                let pos2 = pos1 + 1;
                let xor = slot.sample_xor();
                let pcm8 = slot.pcm8_bit;
                let s1 = self.read_sample(base, pos1, pcm8) ^ xor as i16;
                let s2 = self.read_sample(base, pos2, pcm8) ^ xor as i16;
                let slot = &mut self.slots[index];
                slot.sample1 = s1;
                slot.sample2 = s2;
            }
            SoundSource::Noise => {
                let s = ((self.lfsr & 0xFF) << 8) as u16 as i16;
                let slot = &mut self.slots[index];
                slot.sample1 = s;
                slot.sample2 = s;
            }
            SoundSource::Silence | SoundSource::Unknown => {
                let slot = &mut self.slots[index];
                slot.sample1 = 0;
                slot.sample2 = 0;
            }
        }
    }

    fn read_sample(&self, base: usize, pos: i64, pcm8: bool) -> i16 {
        let ram_mask = if self.mem_4mb {
            SOUND_RAM_SIZE - 1
        } else {
            SOUND_RAM_SIZE / 2 - 1
        };
        if pcm8 {
            let addr = (base as i64 + pos) as usize & ram_mask;
            ((self.sound_ram[addr] as i8) as i16) << 8
        } else {
            let addr = ((base & !1) as i64 + pos * 2) as usize & ram_mask & !1;
            i16::from_be_bytes([self.sound_ram[addr], self.sound_ram[addr + 1]])
        }
    }

    /// Accumulate a send into the stereo bus. Send levels attenuate in
    /// 6 dB steps, pan in 3 dB steps on one channel.
    fn add_output(&mut self, output: i32, send_level: u8, pan: u8) {
        if send_level == 0 {
            return;
        }
        let mut value = output << 14;
        value >>= (send_level ^ 7) as i32;

        let pan_amount = pan & 0xF;
        let pan_out = if pan_amount == 0xF {
            0
        } else {
            let mut v = value >> (pan_amount >> 1);
            if pan_amount & 1 != 0 {
                v -= v >> 2;
            }
            v
        };

        let pan_left = pan & 0x10 != 0;
        self.out[0] += (if pan_left { value } else { pan_out }) >> 14;
        self.out[1] += (if pan_left { pan_out } else { value }) >> 14;
    }

    fn finish_sample(&mut self) {
        // Effect sends: EFREG for slots 0..15, external inputs for 16/17.
        for i in 0..16 {
            let (efsdl, efpan) = (self.slots[i].effect_send_level, self.slots[i].effect_pan);
            let value = self.dsp.efreg[i] as i32;
            self.add_output(value, efsdl, efpan);
        }
        for i in 16..18 {
            let (efsdl, efpan) = (self.slots[i].effect_send_level, self.slots[i].effect_pan);
            let value = self.dsp.exts[i - 16] as i32;
            self.add_output(value, efsdl, efpan);
        }

        // Master volume: 3 dB steps with a half-bit residue; 0 mutes the
        // DAC outright.
        let mvol = (self.master_volume ^ 0xF) as i32;
        let muted = self.master_volume == 0;
        let apply = |mut out: i32| {
            if muted {
                return 0;
            }
            out <<= 8;
            out >>= mvol >> 1;
            if mvol & 1 != 0 {
                out -= out >> 2;
            }
            out >> 8
        };
        let mut left = apply(self.out[0]).clamp(i16::MIN as i32, i16::MAX as i32);
        let mut right = apply(self.out[1]).clamp(i16::MIN as i32, i16::MAX as i32);
        if self.dac_18_bits {
            left <<= 2;
            right <<= 2;
        }
        if let Some(cb) = self.on_sample.as_mut() {
            cb(left, right);
        }
        if let Some(tx) = self.sample_tx.as_ref() {
            let _ = tx.try_send((left, right));
        }
        self.out = [0; 2];

        // Feed the next CDDA sample pair into the external audio ports.
        if self.cdda_ready && self.cdda_read_pos != self.cdda_write_pos {
            let p = self.cdda_read_pos;
            self.dsp.exts[0] =
                i16::from_le_bytes([self.cdda_ring[p], self.cdda_ring[p + 1]]);
            self.dsp.exts[1] =
                i16::from_le_bytes([self.cdda_ring[p + 2], self.cdda_ring[p + 3]]);
            self.cdda_read_pos = (self.cdda_read_pos + 4) % CDDA_RING_SIZE;
        } else {
            self.dsp.exts = [0; 2];
            self.cdda_ready = false;
        }

        self.dsp.on_sample_boundary();

        // Sample counter, timers and the per-sample interrupt.
        self.sample_counter = self.sample_counter.wrapping_add(1);
        for i in 0..3 {
            let mut timer = self.timers[i];
            if timer.tick(self.sample_counter) {
                self.set_interrupt(INTR_TIMER_A + i as u16, true);
            }
            self.timers[i] = timer;
        }
        self.set_interrupt(INTR_SAMPLE, true);
        self.flush_midi_output(false);
        self.update_aux_interrupts();
        self.update_scu_interrupts();
    }

    // ── Interrupts ─────────────────────────────────────────────

    fn set_interrupt(&mut self, intr: u16, level: bool) {
        let bit = 1u16 << intr;
        if level {
            self.scipd |= bit;
            self.mcipd |= bit;
        } else {
            self.scipd &= !bit;
            self.mcipd &= !bit;
        }
    }

    /// Parallel priority selection for the auxiliary CPU: SCILV0..2 hold
    /// bit n of each source's level; sources 7..10 share source 7's bit.
    fn update_aux_interrupts(&mut self) {
        let base = self.scipd & self.scieb;
        let mut mask = (base & 0xFF) as u8 | if base & !0xFF != 0 { 0x80 } else { 0 };

        let mut level = 0u8;
        if self.scilv[2] & mask != 0 {
            level |= 4;
            mask &= self.scilv[2];
        }
        if self.scilv[1] & mask != 0 {
            level |= 2;
            mask &= self.scilv[1];
        }
        if self.scilv[0] & mask != 0 {
            level |= 1;
        }

        if let Some(cb) = self.on_aux_interrupt.as_mut() {
            cb(level);
        }
    }

    /// The SCU-facing line goes high while any enabled pending bit is
    /// set.
    fn update_scu_interrupts(&mut self) {
        let level = self.mcipd & self.mcieb != 0;
        if level != self.scu_sound_request {
            self.scu_sound_request = level;
            if let Some(cb) = self.on_sound_request.as_mut() {
                cb(level);
            }
        }
    }

    // ── DMA ────────────────────────────────────────────────────

    /// Serial transfer between sound RAM and the register file, one
    /// 16-bit word per step. DGATE zeroes the data while still walking
    /// the addresses.
    fn execute_dma(&mut self) {
        while self.dma_exec {
            if self.dma_to_mem {
                let value = if self.dma_gate {
                    0
                } else {
                    self.read_reg16(self.dma_reg_addr, false)
                };
                trace!(
                    "SCSP DMA: reg {:03X} -> mem {:05X} = {value:04X}",
                    self.dma_reg_addr,
                    self.dma_mem_addr
                );
                let addr = (self.dma_mem_addr as usize) & (SOUND_RAM_SIZE - 2);
                self.sound_ram[addr..addr + 2].copy_from_slice(&value.to_be_bytes());
            } else {
                let addr = (self.dma_mem_addr as usize) & (SOUND_RAM_SIZE - 2);
                let value = if self.dma_gate {
                    0
                } else {
                    u16::from_be_bytes([self.sound_ram[addr], self.sound_ram[addr + 1]])
                };
                trace!(
                    "SCSP DMA: mem {:05X} -> reg {:03X} = {value:04X}",
                    self.dma_mem_addr,
                    self.dma_reg_addr
                );
                self.write_reg16(self.dma_reg_addr, value);
            }
            self.dma_mem_addr = (self.dma_mem_addr + 2) & 0x7_FFFE;
            self.dma_reg_addr = (self.dma_reg_addr + 2) & 0xFFE;
            self.dma_length = self.dma_length.saturating_sub(2);
            if self.dma_length == 0 {
                self.dma_exec = false;
                self.set_interrupt(INTR_DMA_END, true);
                self.update_aux_interrupts();
                self.update_scu_interrupts();
            }
        }
    }

    // ── MIDI ───────────────────────────────────────────────────

    /// Queue a MIDI input byte for delivery at a sample timestamp.
    pub fn receive_midi_input(&mut self, deliver_at_sample: u32, byte: u8) {
        self.midi_in_queue.push(MidiInMessage {
            deliver_at_sample,
            byte,
        });
    }

    fn process_midi_input_queue(&mut self) {
        let now = self.sample_counter;
        let mut i = 0;
        while i < self.midi_in_queue.len() {
            if self.midi_in_queue[i].deliver_at_sample <= now {
                let msg = self.midi_in_queue.remove(i);
                let next = (self.midi_in_write + 1) & 63;
                if next == self.midi_in_read {
                    // Ring full: sticky overflow until reset.
                    self.midi_in_overflow = true;
                } else {
                    self.midi_in_ring[self.midi_in_write] = msg.byte;
                    self.midi_in_write = next;
                    self.set_interrupt(INTR_MIDI_INPUT, true);
                }
            } else {
                i += 1;
            }
        }
    }

    fn flush_midi_output(&mut self, force: bool) {
        if self.midi_out_buffer.is_empty() {
            return;
        }
        if force || self.midi_out_buffer.len() >= 8 || self.sample_counter % 32 == 0 {
            if let Some(cb) = self.on_midi_out.as_mut() {
                cb(&self.midi_out_buffer);
            }
            self.midi_out_buffer.clear();
            self.set_interrupt(INTR_MIDI_OUTPUT, true);
        }
    }

    // ── CDDA ───────────────────────────────────────────────────

    /// Receive one CDDA sector into the ring. Returns the number of free
    /// sector slots remaining.
    pub fn receive_cdda(&mut self, data: &[u8; 2352]) -> u32 {
        let p = self.cdda_write_pos;
        let end = p + 2352;
        if end <= CDDA_RING_SIZE {
            self.cdda_ring[p..end].copy_from_slice(data);
        } else {
            let first = CDDA_RING_SIZE - p;
            self.cdda_ring[p..].copy_from_slice(&data[..first]);
            self.cdda_ring[..2352 - first].copy_from_slice(&data[first..]);
        }
        self.cdda_write_pos = end % CDDA_RING_SIZE;

        let used = (self.cdda_write_pos + CDDA_RING_SIZE - self.cdda_read_pos) % CDDA_RING_SIZE;
        if used >= CDDA_RING_SIZE / 2 {
            self.cdda_ready = true;
        }
        ((CDDA_RING_SIZE - used) / 2352) as u32
    }

    pub fn midi_input_overflow(&self) -> bool {
        self.midi_in_overflow
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_counter
    }

    // ── Register file ──────────────────────────────────────────

    pub fn read_reg16(&mut self, address: u32, peek: bool) -> u16 {
        let address = address & 0xFFE;
        match address {
            0x000..=0x3FF => {
                let slot = (address >> 5) as usize;
                self.slots[slot].read_reg16(address & 0x1E)
            }
            0x400 => {
                ((self.mem_4mb as u16) << 9)
                    | ((self.dac_18_bits as u16) << 8)
                    | self.master_volume as u16
            }
            0x402 => ((self.dsp.rbl as u16) << 7) | self.dsp.rbp as u16,
            0x404 => {
                // MIDI status + input FIFO read.
                let empty = self.midi_in_read == self.midi_in_write;
                let mut value = 0u16;
                if empty {
                    value |= 1 << 8;
                } else {
                    value |= self.midi_in_ring[self.midi_in_read] as u16;
                    if !peek {
                        self.midi_in_read = (self.midi_in_read + 1) & 63;
                    }
                }
                if self.midi_in_overflow {
                    value |= 1 << 10;
                }
                value |= 1 << 11; // output FIFO empty
                value
            }
            0x408 => {
                // Monitor: call address of slot 0 (MSLC selection is not
                // latched; titles poll this for coarse sync only).
                let slot = &self.slots[0];
                (((slot.curr_sample >> 12) & 0xF) as u16) << 7
            }
            0x412 => (self.dma_mem_addr & 0xFFFE) as u16,
            0x414 => (((self.dma_mem_addr >> 16) & 0xF) << 12) as u16 | (self.dma_reg_addr & 0xFFE) as u16,
            0x416 => {
                ((self.dma_gate as u16) << 14)
                    | ((self.dma_to_mem as u16) << 13)
                    | ((self.dma_exec as u16) << 12)
                    | (self.dma_length & 0xFFE) as u16
            }
            0x418 => ((self.timers[0].interval as u16) << 8) | (self.timers[0].counter & 0xFF),
            0x41A => ((self.timers[1].interval as u16) << 8) | (self.timers[1].counter & 0xFF),
            0x41C => ((self.timers[2].interval as u16) << 8) | (self.timers[2].counter & 0xFF),
            0x41E => self.scieb,
            0x420 => self.scipd,
            0x424 => self.scilv[0] as u16,
            0x426 => self.scilv[1] as u16,
            0x428 => self.scilv[2] as u16,
            0x42A => self.mcieb,
            0x42C => self.mcipd,
            0x700..=0x77E => self.dsp.coef[((address - 0x700) >> 1) as usize] as u16,
            0x780..=0x7BE => self.dsp.madrs[((address - 0x780) >> 1) as usize],
            0x800..=0xBFE => {
                let step = ((address - 0x800) >> 3) as usize;
                let word = ((address - 0x800) >> 1) & 3;
                (self.dsp.mpro[step].0 >> ((3 - word) * 16)) as u16
            }
            0xC00..=0xDFE => {
                let index = ((address - 0xC00) >> 2) as usize;
                let value = self.dsp.temp[index] as u32;
                if address & 2 == 0 {
                    (value >> 16) as u16 & 0xFF
                } else {
                    value as u16
                }
            }
            0xE00..=0xE7E => {
                let index = ((address - 0xE00) >> 2) as usize;
                let value = self.dsp.mems[index] as u32;
                if address & 2 == 0 {
                    (value >> 16) as u16 & 0xFF
                } else {
                    value as u16
                }
            }
            0xE80..=0xEBE => {
                let index = ((address - 0xE80) >> 2) as usize;
                let value = self.dsp.mixs[index] as u32;
                if address & 2 == 0 {
                    (value >> 16) as u16 & 0xF
                } else {
                    value as u16
                }
            }
            0xEC0..=0xEDE => self.dsp.efreg[((address - 0xEC0) >> 1) as usize] as u16,
            0xEE0 | 0xEE2 => self.dsp.exts[((address - 0xEE0) >> 1) as usize] as u16,
            _ => {
                debug!("SCSP: unhandled register read from {address:03X}");
                0
            }
        }
    }

    pub fn write_reg16(&mut self, address: u32, value: u16) {
        let address = address & 0xFFE;
        match address {
            0x000..=0x3FF => {
                let slot = (address >> 5) as usize;
                if self.slots[slot].write_reg16(address & 0x1E, value) {
                    self.kyonex = true;
                }
            }
            0x400 => {
                self.mem_4mb = value & (1 << 9) != 0;
                self.dac_18_bits = value & (1 << 8) != 0;
                self.master_volume = (value & 0xF) as u8;
            }
            0x402 => {
                self.dsp.rbl = ((value >> 7) & 3) as u32;
                self.dsp.rbp = (value & 0x7F) as u32;
            }
            0x406 => {
                self.midi_out_buffer.push(value as u8);
                self.flush_midi_output(self.midi_out_buffer.len() >= 8);
            }
            0x412 => self.dma_mem_addr = (self.dma_mem_addr & 0xF_0000) | (value & 0xFFFE) as u32,
            0x414 => {
                self.dma_mem_addr =
                    (self.dma_mem_addr & 0xFFFE) | ((((value >> 12) & 0xF) as u32) << 16);
                self.dma_reg_addr = (value & 0xFFE) as u32;
            }
            0x416 => {
                self.dma_gate = value & (1 << 14) != 0;
                self.dma_to_mem = value & (1 << 13) != 0;
                self.dma_length = (value & 0xFFE) as u32;
                if value & (1 << 12) != 0 {
                    self.dma_exec = true;
                    self.execute_dma();
                }
            }
            0x418 | 0x41A | 0x41C => {
                let timer = &mut self.timers[((address - 0x418) >> 1) as usize];
                timer.interval = ((value >> 8) & 7) as u8;
                timer.counter = value & 0xFF;
            }
            0x41E => {
                self.scieb = value & ((1 << INTR_COUNT) - 1);
                self.update_aux_interrupts();
            }
            0x420 => {
                // Only the CPU-manual interrupt can be set by writes.
                if value & (1 << INTR_CPU_MANUAL) != 0 {
                    self.set_interrupt(INTR_CPU_MANUAL, true);
                    self.update_aux_interrupts();
                }
            }
            0x422 => {
                self.scipd &= !value;
                self.update_aux_interrupts();
            }
            0x424 => self.scilv[0] = value as u8,
            0x426 => self.scilv[1] = value as u8,
            0x428 => self.scilv[2] = value as u8,
            0x42A => {
                self.mcieb = value & ((1 << INTR_COUNT) - 1);
                self.update_scu_interrupts();
            }
            0x42C => {
                if value & (1 << INTR_CPU_MANUAL) != 0 {
                    self.mcipd |= 1 << INTR_CPU_MANUAL;
                    self.update_scu_interrupts();
                }
            }
            0x42E => {
                self.mcipd &= !value;
                self.update_scu_interrupts();
            }
            0x700..=0x77E => {
                self.dsp.coef[((address - 0x700) >> 1) as usize] = (value as i16) >> 3;
            }
            0x780..=0x7BE => self.dsp.madrs[((address - 0x780) >> 1) as usize] = value,
            0x800..=0xBFE => {
                let step = ((address - 0x800) >> 3) as usize;
                let word = ((address - 0x800) >> 1) & 3;
                let shift = (3 - word) * 16;
                let mask = !(0xFFFFu64 << shift);
                self.dsp.mpro[step] =
                    dsp::DspStep((self.dsp.mpro[step].0 & mask) | ((value as u64) << shift));
            }
            0xC00..=0xDFE => {
                let index = ((address - 0xC00) >> 2) as usize;
                let current = self.dsp.temp[index];
                self.dsp.temp[index] = if address & 2 == 0 {
                    (current & 0xFFFF) | sign_extend(((value as i32) & 0xFF) << 16, 24)
                } else {
                    (current & !0xFFFF) | value as i32
                };
            }
            0xE00..=0xE7E => {
                let index = ((address - 0xE00) >> 2) as usize;
                let current = self.dsp.mems[index];
                self.dsp.mems[index] = if address & 2 == 0 {
                    (current & 0xFFFF) | sign_extend(((value as i32) & 0xFF) << 16, 24)
                } else {
                    (current & !0xFFFF) | value as i32
                };
            }
            0xEC0..=0xEDE => {
                self.dsp.efreg[((address - 0xEC0) >> 1) as usize] = value as i16;
            }
            _ => {
                debug!("SCSP: unhandled register write to {address:03X} = {value:04X}");
            }
        }
    }

    // ── Save states ────────────────────────────────────────────

    pub fn save_state(&self) -> crate::state::ScspState {
        use crate::state::{ScspDspState, ScspSlotState, ScspTimerState};
        crate::state::ScspState {
            sound_ram: self.sound_ram.to_vec(),
            slots: self
                .slots
                .iter()
                .map(|s| ScspSlotState {
                    sa: s.start_address,
                    lsa: s.loop_start,
                    lea: s.loop_end,
                    pcm8b: s.pcm8_bit,
                    kyonb: s.key_on_bit,
                    sbctl: s.sbctl,
                    lpctl: s.loop_control,
                    ssctl: s.sound_source,
                    ar: s.attack_rate,
                    d1r: s.decay1_rate,
                    d2r: s.decay2_rate,
                    rr: s.release_rate,
                    dl: s.decay_level,
                    krs: s.key_rate_scaling,
                    eghold: s.eg_hold,
                    lpslnk: s.loop_start_link,
                    egbypass: s.eg_bypass,
                    mdl: s.mod_level,
                    mdxsl: s.mod_x_select,
                    mdysl: s.mod_y_select,
                    stwinh: s.stack_write_inhibit,
                    tl: s.total_level,
                    sdir: s.sound_direct,
                    oct: s.octave,
                    fns: s.freq_num_switch,
                    lfore: s.lfo_reset,
                    lfof: s.lfo_freq,
                    alfos: s.amp_lfo_sens,
                    plfos: s.pitch_lfo_sens,
                    alfows: s.amp_lfo_waveform,
                    plfows: s.pitch_lfo_waveform,
                    imxl: s.input_mix_level,
                    isel: s.input_select,
                    disdl: s.direct_send_level,
                    dipan: s.direct_pan,
                    efsdl: s.effect_send_level,
                    efpan: s.effect_pan,
                    active: s.active,
                    eg_state: s.eg_state,
                    eg_level: s.eg_level,
                    curr_sample: s.curr_sample,
                    curr_phase: s.curr_phase,
                    next_phase: s.next_phase,
                    reverse: s.reverse,
                    crossed_loop_start: s.crossed_loop_start,
                    lfo_cycles: s.lfo_cycles,
                    lfo_step: s.lfo_step,
                    sample1: s.sample1,
                    sample2: s.sample2,
                    output: s.output,
                })
                .collect(),
            dsp: ScspDspState {
                mpro: self.dsp.mpro.iter().map(|s| s.0).collect(),
                temp: self.dsp.temp.to_vec(),
                mems: self.dsp.mems.to_vec(),
                coef: self.dsp.coef.to_vec(),
                madrs: self.dsp.madrs.to_vec(),
                mixs: self.dsp.mixs.to_vec(),
                efreg: self.dsp.efreg.to_vec(),
                exts: self.dsp.exts.to_vec(),
                rbp: self.dsp.rbp,
                rbl: self.dsp.rbl,
                mdec_ct: self.dsp.mdec_ct,
            },
            master_volume: self.master_volume,
            dac_18_bits: self.dac_18_bits,
            mem_4mb: self.mem_4mb,
            sound_stack: self.sound_stack.to_vec(),
            sound_stack_index: self.sound_stack_index,
            lfsr: self.lfsr,
            kyonex: self.kyonex,
            curr_slot: self.curr_slot,
            sample_counter: self.sample_counter,
            timers: self
                .timers
                .iter()
                .map(|t| ScspTimerState {
                    interval: t.interval,
                    counter: t.counter,
                })
                .collect(),
            scieb: self.scieb,
            scipd: self.scipd,
            scilv: self.scilv,
            mcieb: self.mcieb,
            mcipd: self.mcipd,
            dma_mem_addr: self.dma_mem_addr,
            dma_reg_addr: self.dma_reg_addr,
            dma_length: self.dma_length,
            dma_gate: self.dma_gate,
            dma_to_mem: self.dma_to_mem,
            dma_exec: self.dma_exec,
            midi_overflow: self.midi_in_overflow,
            aux_spillover: self.aux_spillover,
        }
    }

    pub fn load_state(&mut self, state: &crate::state::ScspState) {
        self.sound_ram.copy_from_slice(&state.sound_ram);
        for (slot, s) in self.slots.iter_mut().zip(&state.slots) {
            slot.start_address = s.sa;
            slot.loop_start = s.lsa;
            slot.loop_end = s.lea;
            slot.pcm8_bit = s.pcm8b;
            slot.key_on_bit = s.kyonb;
            slot.sbctl = s.sbctl;
            slot.loop_control = s.lpctl;
            slot.sound_source = s.ssctl;
            slot.attack_rate = s.ar;
            slot.decay1_rate = s.d1r;
            slot.decay2_rate = s.d2r;
            slot.release_rate = s.rr;
            slot.decay_level = s.dl;
            slot.key_rate_scaling = s.krs;
            slot.eg_hold = s.eghold;
            slot.loop_start_link = s.lpslnk;
            slot.eg_bypass = s.egbypass;
            slot.mod_level = s.mdl;
            slot.mod_x_select = s.mdxsl;
            slot.mod_y_select = s.mdysl;
            slot.stack_write_inhibit = s.stwinh;
            slot.total_level = s.tl;
            slot.sound_direct = s.sdir;
            slot.octave = s.oct;
            slot.freq_num_switch = s.fns;
            slot.lfo_reset = s.lfore;
            slot.lfo_freq = s.lfof;
            slot.amp_lfo_sens = s.alfos;
            slot.pitch_lfo_sens = s.plfos;
            slot.amp_lfo_waveform = s.alfows;
            slot.pitch_lfo_waveform = s.plfows;
            slot.input_mix_level = s.imxl;
            slot.input_select = s.isel;
            slot.direct_send_level = s.disdl;
            slot.direct_pan = s.dipan;
            slot.effect_send_level = s.efsdl;
            slot.effect_pan = s.efpan;
            slot.active = s.active;
            slot.eg_state = s.eg_state;
            slot.eg_level = s.eg_level;
            slot.curr_sample = s.curr_sample;
            slot.curr_phase = s.curr_phase;
            slot.next_phase = s.next_phase;
            slot.reverse = s.reverse;
            slot.crossed_loop_start = s.crossed_loop_start;
            slot.lfo_cycles = s.lfo_cycles;
            slot.lfo_step = s.lfo_step;
            slot.sample1 = s.sample1;
            slot.sample2 = s.sample2;
            slot.output = s.output;
        }
        for (i, word) in state.dsp.mpro.iter().enumerate() {
            self.dsp.mpro[i] = dsp::DspStep(*word);
        }
        self.dsp.temp.copy_from_slice(&state.dsp.temp);
        self.dsp.mems.copy_from_slice(&state.dsp.mems);
        self.dsp.coef.copy_from_slice(&state.dsp.coef);
        self.dsp.madrs.copy_from_slice(&state.dsp.madrs);
        self.dsp.mixs.copy_from_slice(&state.dsp.mixs);
        self.dsp.efreg.copy_from_slice(&state.dsp.efreg);
        self.dsp.exts.copy_from_slice(&state.dsp.exts);
        self.dsp.rbp = state.dsp.rbp;
        self.dsp.rbl = state.dsp.rbl;
        self.dsp.mdec_ct = state.dsp.mdec_ct;
        self.master_volume = state.master_volume;
        self.dac_18_bits = state.dac_18_bits;
        self.mem_4mb = state.mem_4mb;
        self.sound_stack.copy_from_slice(&state.sound_stack);
        self.sound_stack_index = state.sound_stack_index;
        self.lfsr = state.lfsr;
        self.kyonex = state.kyonex;
        self.curr_slot = state.curr_slot;
        self.sample_counter = state.sample_counter;
        for (t, s) in self.timers.iter_mut().zip(&state.timers) {
            t.interval = s.interval;
            t.counter = s.counter;
        }
        self.scieb = state.scieb;
        self.scipd = state.scipd;
        self.scilv = state.scilv;
        self.mcieb = state.mcieb;
        self.mcipd = state.mcipd;
        self.dma_mem_addr = state.dma_mem_addr;
        self.dma_reg_addr = state.dma_reg_addr;
        self.dma_length = state.dma_length;
        self.dma_gate = state.dma_gate;
        self.dma_to_mem = state.dma_to_mem;
        self.dma_exec = state.dma_exec;
        self.midi_in_overflow = state.midi_overflow;
        self.aux_spillover = state.aux_spillover;
    }

    fn read_wram16(&self, address: u32) -> u16 {
        let addr = (address as usize) & (SOUND_RAM_SIZE - 2);
        u16::from_be_bytes([self.sound_ram[addr], self.sound_ram[addr + 1]])
    }

    fn write_wram16(&mut self, address: u32, value: u16) {
        let addr = (address as usize) & (SOUND_RAM_SIZE - 2);
        self.sound_ram[addr..addr + 2].copy_from_slice(&value.to_be_bytes());
    }
}

fn sign_extend(value: i32, bits: u32) -> i32 {
    (value << (32 - bits)) >> (32 - bits)
}

// ── Bus mapping ───────────────────────────────────────────────

pub fn map_scsp(scsp: &Rc<RefCell<Scsp>>, bus: &Bus) {
    // Sound RAM window.
    for normal in [true, false] {
        let (r, w) = (scsp.clone(), scsp.clone());
        let handlers = HandlerSet::from_word_handlers(
            move |a| r.borrow().read_wram16(a),
            move |a, v| w.borrow_mut().write_wram16(a, v),
        );
        if normal {
            bus.map_normal(0x5A0_0000, 0x5AF_FFFF, handlers);
        } else {
            bus.map_side_effect_free(0x5A0_0000, 0x5AF_FFFF, handlers);
        }
    }

    // Register window.
    for normal in [true, false] {
        let peek = !normal;
        let (r, w) = (scsp.clone(), scsp.clone());
        let handlers = HandlerSet::from_word_handlers(
            move |a| r.borrow_mut().read_reg16(a, peek),
            move |a, v| w.borrow_mut().write_reg16(a, v),
        );
        if normal {
            bus.map_normal(0x5B0_0000, 0x5BF_FFFF, handlers);
        } else {
            bus.map_side_effect_free(0x5B0_0000, 0x5BF_FFFF, handlers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scsp() -> Rc<RefCell<Scsp>> {
        let scheduler = Rc::new(Scheduler::new());
        Scsp::new(&scheduler).unwrap()
    }

    fn run_samples(scsp: &Rc<RefCell<Scsp>>, count: usize) {
        let mut s = scsp.borrow_mut();
        for _ in 0..count {
            for i in 0..32 {
                s.process_slot(i);
            }
            s.finish_sample();
        }
    }

    #[test]
    fn master_volume_zero_is_silent() {
        let scsp = scsp();
        let samples = Rc::new(RefCell::new(Vec::new()));
        {
            let samples = samples.clone();
            let mut s = scsp.borrow_mut();
            s.set_output_callback(Box::new(move |l, r| samples.borrow_mut().push((l, r))));
            // Slot 0: noise source, full send, key on.
            s.write_reg16(0x00, (1 << 12) | (1 << 11) | (1 << 7)); // KYONEX+KYONB+noise
            s.write_reg16(0x16, 7 << 13); // DISDL max, pan center
            s.write_reg16(0x400, 0); // MVOL = 0
        }
        run_samples(&scsp, 8);
        assert!(samples.borrow().iter().all(|&(l, r)| l == 0 && r == 0));
    }

    #[test]
    fn sample_interrupt_pends_every_sample() {
        let scsp = scsp();
        scsp.borrow_mut().write_reg16(0x42A, 1 << INTR_SAMPLE);
        let requests = Rc::new(RefCell::new(Vec::new()));
        {
            let requests = requests.clone();
            scsp.borrow_mut()
                .set_sound_request_callback(Box::new(move |level| {
                    requests.borrow_mut().push(level)
                }));
        }
        run_samples(&scsp, 1);
        assert_eq!(*requests.borrow(), vec![true]);
        // Acknowledge through MCIRE and the line drops on the next
        // update.
        scsp.borrow_mut().write_reg16(0x42E, 1 << INTR_SAMPLE);
        assert_eq!(*requests.borrow(), vec![true, false]);
    }

    #[test]
    fn timer_a_overflow_raises_its_interrupt() {
        let scsp = scsp();
        {
            let mut s = scsp.borrow_mut();
            s.write_reg16(0x418, 0xFF); // interval 1 sample, counter at 0xFF
            s.write_reg16(0x41E, 1 << INTR_TIMER_A);
        }
        run_samples(&scsp, 2);
        assert!(scsp.borrow().scipd & (1 << INTR_TIMER_A) != 0);
    }

    #[test]
    fn midi_input_queue_delivers_by_sample_timestamp() {
        let scsp = scsp();
        {
            let mut s = scsp.borrow_mut();
            s.receive_midi_input(0, 0x90);
            s.receive_midi_input(1000, 0x3C);
            s.process_midi_input_queue();
        }
        let mut s = scsp.borrow_mut();
        assert_eq!(s.read_reg16(0x404, false) & 0xFF, 0x90);
        // The far-future byte is still queued.
        assert!(s.read_reg16(0x404, false) & (1 << 8) != 0);
    }

    #[test]
    fn midi_ring_overflow_is_sticky() {
        let scsp = scsp();
        let mut s = scsp.borrow_mut();
        for i in 0..70 {
            s.receive_midi_input(0, i as u8);
        }
        s.process_midi_input_queue();
        assert!(s.midi_input_overflow());
    }

    #[test]
    fn cdda_ring_reports_free_space_and_recovers_from_underrun() {
        let scsp = scsp();
        let mut s = scsp.borrow_mut();
        let sector = [0x11u8; 2352];
        let free = s.receive_cdda(&sector);
        assert_eq!(free, 74);
        assert!(!s.cdda_ready, "ready only after half the ring fills");
        for _ in 0..40 {
            s.receive_cdda(&sector);
        }
        assert!(s.cdda_ready);
    }

    #[test]
    fn dma_gate_zeroes_sound_ram(){
        let scsp = scsp();
        let mut s = scsp.borrow_mut();
        s.sound_ram[0x100] = 0xAA;
        s.sound_ram[0x101] = 0xBB;
        s.write_reg16(0x412, 0x100); // DMEA
        s.write_reg16(0x414, 0x000); // DRGA
        // DGATE + DEXE + DDIR(to mem) + length 2
        s.write_reg16(0x416, (1 << 14) | (1 << 13) | (1 << 12) | 2);
        assert_eq!(s.sound_ram[0x100], 0);
        assert_eq!(s.sound_ram[0x101], 0);
        assert!(s.scipd & (1 << INTR_DMA_END) != 0);
    }

    #[test]
    fn granularity_switch_keeps_slot_alignment() {
        let scsp = scsp();
        {
            let mut s = scsp.borrow_mut();
            s.set_step_granularity(5); // 1 slot per firing
            assert_eq!(s.step_shift, 0);
            // Walk 3 slots so the counter is unaligned.
            for i in 0..3 {
                s.process_slot(i);
            }
            s.curr_slot = 3;
            s.set_step_granularity(0); // back to full samples
            assert_eq!(s.step_shift, 0, "coarse switch must wait for alignment");
            assert_eq!(s.pending_step_shift, Some(5));
        }
    }
}
