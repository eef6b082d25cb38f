//! Versioned save-state records.
//!
//! Every component contributes a plain-data record with stable field
//! ordering; the top-level `State` carries the container version and the
//! hashes used to authenticate the disc and IPL ROM. Loading validates
//! the whole container before any component state is touched, so a
//! failed load leaves the prior state intact.
//!
//! Current version: 3. Version 2 states stored the slot phase as a
//! 24-bit accumulator and predate `SBCTL`/`EGBYPASS`/`nextPhase`;
//! upgrading shifts the phase right by 4 and mirrors it into
//! `next_phase`, with the new fields defaulted.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::scsp::slot::{EgState, LoopControl, SoundSource, Waveform};

pub const STATE_VERSION: u32 = 3;

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEventState {
    pub target: u64,
    pub num: u64,
    pub den: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub now: u64,
    pub events: Vec<SchedulerEventState>,
}

// ── System memory ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMemoryState {
    pub wram_low: Vec<u8>,
    pub wram_high: Vec<u8>,
    pub internal_backup: Vec<u8>,
}

// ── SCU ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScuDmaState {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub xfer_count: u32,
    pub src_addr_inc: u32,
    pub dst_addr_inc: u32,
    pub update_src_addr: bool,
    pub update_dst_addr: bool,
    pub enabled: bool,
    pub active: bool,
    pub indirect: bool,
    pub trigger: u8,
    pub start: bool,
    pub curr_src_addr: u32,
    pub curr_dst_addr: u32,
    pub curr_xfer_count: u32,
    pub curr_src_addr_inc: u32,
    pub curr_dst_addr_inc: u32,
    pub curr_indirect_src: u32,
    pub end_indirect: bool,
}

impl ScuDmaState {
    pub fn validate(&self, channel: usize) -> bool {
        let max = if channel == 0 { 0x10_0000 } else { 0x1000 };
        if self.xfer_count > max || self.curr_xfer_count > max {
            return false;
        }
        if self.src_addr_inc != 0 && self.src_addr_inc != 4 {
            return false;
        }
        if self.dst_addr_inc != 0
            && (!self.dst_addr_inc.is_power_of_two() || self.dst_addr_inc == 1)
        {
            return false;
        }
        self.trigger < 8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScuDspState {
    pub program_ram: Vec<u32>, // 256
    pub data_ram: Vec<Vec<u32>>, // 4 x 64
    pub program_executing: bool,
    pub program_paused: bool,
    pub program_ended: bool,
    pub program_step: bool,
    pub pc: u8,
    pub data_address: u8,
    pub next_pc: u8,
    pub jmp_counter: u8,
    pub sign: bool,
    pub zero: bool,
    pub carry: bool,
    pub overflow: bool,
    pub ct: [u8; 4],
    pub alu: i64,
    pub ac: i64,
    pub p: i64,
    pub rx: i32,
    pub ry: i32,
    pub lop: u16,
    pub top: u8,
    pub dma_run: bool,
    pub dma_to_d0: bool,
    pub dma_hold: bool,
    pub dma_count: u8,
    pub dma_src: u8,
    pub dma_dst: u8,
    pub dma_read_addr: u32,
    pub dma_write_addr: u32,
    pub dma_addr_inc: u32,
}

impl ScuDspState {
    pub fn validate(&self) -> bool {
        if self.program_ram.len() != 256 {
            return false;
        }
        if self.data_ram.len() != 4 || self.data_ram.iter().any(|b| b.len() != 64) {
            return false;
        }
        if self.dma_addr_inc != 0
            && (!self.dma_addr_inc.is_power_of_two() || self.dma_addr_inc == 1)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScuState {
    pub intr_mask: u32,
    pub intr_status: u32,
    pub abus_intr_ack: bool,
    pub pending_intr_level: u8,
    pub pending_intr_index: u8,
    pub timer0_counter: u16,
    pub timer0_compare: u16,
    pub timer1_reload: u16,
    pub timer1_mode: bool,
    pub timer_enable: bool,
    pub wram_size_select: bool,
    pub dma: Vec<ScuDmaState>, // 3
    pub dsp: ScuDspState,
}

impl ScuState {
    pub fn validate(&self) -> bool {
        self.dma.len() == 3
            && self.dma.iter().enumerate().all(|(i, ch)| ch.validate(i))
            && self.dsp.validate()
            && self.pending_intr_level <= 0xF
    }
}

// ── SCSP ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScspSlotState {
    pub sa: u32,
    pub lsa: u32,
    pub lea: u32,
    pub pcm8b: bool,
    pub kyonb: bool,
    #[serde(default)]
    pub sbctl: u16,
    pub lpctl: LoopControl,
    pub ssctl: SoundSource,
    pub ar: u8,
    pub d1r: u8,
    pub d2r: u8,
    pub rr: u8,
    pub dl: u8,
    pub krs: u8,
    pub eghold: bool,
    pub lpslnk: bool,
    #[serde(default)]
    pub egbypass: bool,
    pub mdl: u8,
    pub mdxsl: u8,
    pub mdysl: u8,
    pub stwinh: bool,
    pub tl: u8,
    pub sdir: bool,
    pub oct: u8,
    pub fns: u16,
    pub lfore: bool,
    pub lfof: u8,
    pub alfos: u8,
    pub plfos: u8,
    pub alfows: Waveform,
    pub plfows: Waveform,
    pub imxl: u8,
    pub isel: u8,
    pub disdl: u8,
    pub dipan: u8,
    pub efsdl: u8,
    pub efpan: u8,
    pub active: bool,
    pub eg_state: EgState,
    pub eg_level: u16,
    pub curr_sample: u32,
    pub curr_phase: u32,
    #[serde(default)]
    pub next_phase: u32,
    pub reverse: bool,
    pub crossed_loop_start: bool,
    pub lfo_cycles: u32,
    pub lfo_step: u8,
    pub sample1: i16,
    pub sample2: i16,
    pub output: i16,
}

impl ScspSlotState {
    pub fn validate(&self) -> bool {
        self.eg_level <= 0x3FF
            && self.sa <= 0xF_FFFF
            && self.fns <= 0x3FF
            && self.ar <= 0x1F
            && self.d1r <= 0x1F
            && self.d2r <= 0x1F
            && self.rr <= 0x1F
    }

    /// v2 -> v3: the phase accumulator lost its bottom 4 bits and split
    /// into current/next.
    pub fn upgrade_from_v2(&mut self) {
        self.curr_phase >>= 4;
        self.next_phase = self.curr_phase;
        self.sbctl = 0;
        self.egbypass = false;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScspTimerState {
    pub interval: u8,
    pub counter: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScspDspState {
    pub mpro: Vec<u64>,   // 128
    pub temp: Vec<i32>,   // 128
    pub mems: Vec<i32>,   // 32
    pub coef: Vec<i16>,   // 64
    pub madrs: Vec<u16>,  // 32
    pub mixs: Vec<i32>,   // 16
    pub efreg: Vec<i16>,  // 16
    pub exts: Vec<i16>,   // 2
    pub rbp: u32,
    pub rbl: u32,
    pub mdec_ct: u32,
}

impl ScspDspState {
    pub fn validate(&self) -> bool {
        self.mpro.len() == 128
            && self.temp.len() == 128
            && self.mems.len() == 32
            && self.coef.len() == 64
            && self.madrs.len() == 32
            && self.mixs.len() == 16
            && self.efreg.len() == 16
            && self.exts.len() == 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScspState {
    pub sound_ram: Vec<u8>,
    pub slots: Vec<ScspSlotState>, // 32
    pub dsp: ScspDspState,
    pub master_volume: u8,
    pub dac_18_bits: bool,
    pub mem_4mb: bool,
    pub sound_stack: Vec<i16>, // 64
    pub sound_stack_index: usize,
    pub lfsr: u32,
    pub kyonex: bool,
    pub curr_slot: usize,
    pub sample_counter: u32,
    pub timers: Vec<ScspTimerState>, // 3
    pub scieb: u16,
    pub scipd: u16,
    pub scilv: [u8; 3],
    pub mcieb: u16,
    pub mcipd: u16,
    pub dma_mem_addr: u32,
    pub dma_reg_addr: u32,
    pub dma_length: u32,
    pub dma_gate: bool,
    pub dma_to_mem: bool,
    pub dma_exec: bool,
    pub midi_overflow: bool,
    pub aux_spillover: u64,
}

impl ScspState {
    pub fn validate(&self) -> bool {
        self.sound_ram.len() == crate::scsp::SOUND_RAM_SIZE
            && self.slots.len() == 32
            && self.slots.iter().all(|s| s.validate())
            && self.timers.len() == 3
            && self.sound_stack.len() == 64
            && self.curr_slot < 32
            && self.dsp.validate()
    }
}

// ── CD block ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdBufferState {
    pub data: Vec<u8>, // 2352
    pub size: u16,
    pub frame_address: u32,
    pub mode2: bool,
    pub file_num: u8,
    pub chan_num: u8,
    pub submode: u8,
    pub coding_info: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdFilterState {
    pub start_frame_address: u32,
    pub frame_address_count: u32,
    pub mode: u8,
    pub file_num: u8,
    pub chan_num: u8,
    pub submode_mask: u8,
    pub submode_value: u8,
    pub coding_info_mask: u8,
    pub coding_info_value: u8,
    pub pass_output: u8,
    pub fail_output: u8,
}

impl CdFilterState {
    pub fn validate(&self) -> bool {
        (self.pass_output == 0xFF || (self.pass_output as usize) < 24)
            && (self.fail_output == 0xFF || (self.fail_output as usize) < 24)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdBlockState {
    pub cr: [u16; 4],
    pub hirq: u16,
    pub hirq_mask: u16,
    pub status_code: u8,
    pub frame_address: u32,
    pub status_flags: u8,
    pub repeat_count: u8,
    pub control_adr: u8,
    pub track: u8,
    pub index: u8,
    pub read_speed: u8,
    pub disc_auth: u8,
    pub play_start_pos: u32,
    pub play_end_pos: u32,
    pub play_max_repeat: u8,
    pub play_file: bool,
    pub buffer_full_pause: bool,
    pub play_end_pending: bool,
    pub cd_device_connection: u8,
    pub get_sector_length: u32,
    pub put_sector_length: u32,
    pub filters: Vec<CdFilterState>, // 24
    pub partitions: Vec<Vec<CdBufferState>>, // 24
}

impl CdBlockState {
    pub fn validate(&self) -> bool {
        if self.filters.len() != 24 || self.partitions.len() != 24 {
            return false;
        }
        if !self.filters.iter().all(|f| f.validate()) {
            return false;
        }
        let held: usize = self.partitions.iter().map(|p| p.len()).sum();
        if held > 200 {
            return false;
        }
        if self.partitions
            .iter()
            .flatten()
            .any(|b| b.data.len() != 2352)
        {
            return false;
        }
        matches!(self.get_sector_length, 2048 | 2336 | 2340 | 2352)
            && matches!(self.put_sector_length, 2048 | 2336 | 2340 | 2352)
            && (self.read_speed == 1 || self.read_speed == 2)
    }
}

// ── SMPC ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmpcState {
    pub smem: [u8; 4],
    pub rtc_seconds: u64,
    pub reset_enabled: bool,
    pub slave_sh2_on: bool,
    pub sound_cpu_on: bool,
}

// ── Top level ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub version: u32,
    pub disc_hash: [u8; 16],
    pub ipl_hash: [u8; 16],
    /// Program counter of the master CPU at save time, used to decide
    /// whether an IPL hash mismatch is fatal.
    pub master_cpu_pc: u32,
    /// Fractional cycles owed to the slave CPU at the save boundary.
    pub slave_cpu_spillover: u64,
    pub scheduler: SchedulerState,
    pub memory: SystemMemoryState,
    pub scu: ScuState,
    pub scsp: ScspState,
    pub cdblock: CdBlockState,
    pub smpc: SmpcState,
}

impl State {
    /// Upgrade an older container in place. Unknown future versions are
    /// rejected.
    pub fn upgrade(&mut self) -> CoreResult<()> {
        match self.version {
            2 => {
                for slot in &mut self.scsp.slots {
                    slot.upgrade_from_v2();
                }
                self.version = 3;
                Ok(())
            }
            STATE_VERSION => Ok(()),
            _ => Err(CoreError::InvalidState("unsupported state version")),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.version != STATE_VERSION {
            return Err(CoreError::InvalidState("state must be upgraded first"));
        }
        if !self.scu.validate() {
            return Err(CoreError::InvalidState("SCU record out of range"));
        }
        if !self.scsp.validate() {
            return Err(CoreError::InvalidState("SCSP record out of range"));
        }
        if !self.cdblock.validate() {
            return Err(CoreError::InvalidState("CD block record out of range"));
        }
        if self.memory.wram_low.len() != crate::memory::WRAM_LOW_SIZE
            || self.memory.wram_high.len() != crate::memory::WRAM_HIGH_SIZE
            || self.memory.internal_backup.len() != crate::memory::INTERNAL_BACKUP_SIZE
        {
            return Err(CoreError::InvalidState("memory image size mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_state() -> ScspSlotState {
        ScspSlotState {
            sa: 0,
            lsa: 0,
            lea: 0,
            pcm8b: false,
            kyonb: false,
            sbctl: 0,
            lpctl: LoopControl::Off,
            ssctl: SoundSource::SoundRam,
            ar: 0,
            d1r: 0,
            d2r: 0,
            rr: 0,
            dl: 0,
            krs: 0,
            eghold: false,
            lpslnk: false,
            egbypass: false,
            mdl: 0,
            mdxsl: 0,
            mdysl: 0,
            stwinh: false,
            tl: 0,
            sdir: false,
            oct: 0,
            fns: 0,
            lfore: false,
            lfof: 0,
            alfos: 0,
            plfos: 0,
            alfows: Waveform::Saw,
            plfows: Waveform::Saw,
            imxl: 0,
            isel: 0,
            disdl: 0,
            dipan: 0,
            efsdl: 0,
            efpan: 0,
            active: false,
            eg_state: EgState::Release,
            eg_level: 0x3FF,
            curr_sample: 0,
            curr_phase: 0,
            next_phase: 0,
            reverse: false,
            crossed_loop_start: false,
            lfo_cycles: 0,
            lfo_step: 0,
            sample1: 0,
            sample2: 0,
            output: 0,
        }
    }

    #[test]
    fn v2_slot_upgrade_decompresses_the_phase() {
        let mut slot = slot_state();
        slot.curr_phase = 0x1F_0000;
        slot.sbctl = 0xFFFF; // garbage that must be defaulted
        slot.egbypass = true;
        slot.upgrade_from_v2();
        assert_eq!(slot.curr_phase, 0x1_F000);
        assert_eq!(slot.next_phase, 0x1_F000);
        assert_eq!(slot.sbctl, 0);
        assert!(!slot.egbypass);
    }

    #[test]
    fn dma_validation_rejects_bad_increments() {
        let ch = ScuDmaState {
            src_addr: 0,
            dst_addr: 0,
            xfer_count: 0,
            src_addr_inc: 4,
            dst_addr_inc: 2,
            update_src_addr: false,
            update_dst_addr: false,
            enabled: false,
            active: false,
            indirect: false,
            trigger: 7,
            start: false,
            curr_src_addr: 0,
            curr_dst_addr: 0,
            curr_xfer_count: 0,
            curr_src_addr_inc: 0,
            curr_dst_addr_inc: 0,
            curr_indirect_src: 0,
            end_indirect: false,
        };
        assert!(ch.validate(0));

        let mut bad = ch.clone();
        bad.src_addr_inc = 2;
        assert!(!bad.validate(0));

        let mut bad = ch.clone();
        bad.dst_addr_inc = 3;
        assert!(!bad.validate(0));

        let mut bad = ch.clone();
        bad.xfer_count = 0x2000;
        assert!(bad.validate(0));
        assert!(!bad.validate(1));

        let mut bad = ch;
        bad.trigger = 8;
        assert!(!bad.validate(0));
    }

    #[test]
    fn filter_validation_accepts_disconnected() {
        let f = CdFilterState {
            start_frame_address: 0,
            frame_address_count: 0,
            mode: 0,
            file_num: 0,
            chan_num: 0,
            submode_mask: 0,
            submode_value: 0,
            coding_info_mask: 0,
            coding_info_value: 0,
            pass_output: 0xFF,
            fail_output: 23,
        };
        assert!(f.validate());
        let mut bad = f;
        bad.fail_output = 24;
        assert!(!bad.validate());
    }
}
