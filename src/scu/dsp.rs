//! SCU DSP: a VLIW signal processor with parallel X/Y/D1 buses.
//!
//! 256 words of program RAM, four 64-word data RAM banks addressed
//! through auto-increment CT pointers, a 48-bit accumulator datapath and
//! a small DMA engine bridging the banks to the external D0 bus.
//!
//! Instructions decode by their top two bits: 00 = parallel operation,
//! 10 = load immediate, 11 = special (DMA / jump / loop / end). Jumps are
//! delayed by one instruction via a 2-step counter.

use std::rc::Rc;

use log::trace;

use crate::bus::Bus;
use crate::scu::dma::{bus_id, BusId};

// ── Instruction word ──────────────────────────────────────────
//
// Several bitfield views layer over one 32-bit word; each sub-form gets
// an explicit extractor instead of relying on native bitfield layout.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DspInstr(pub u32);

impl DspInstr {
    #[inline]
    fn bits(self, lo: u32, hi: u32) -> u32 {
        (self.0 >> lo) & ((1 << (hi - lo + 1)) - 1)
    }

    #[inline]
    fn sbits(self, lo: u32, hi: u32) -> i32 {
        let width = hi - lo + 1;
        ((self.bits(lo, hi) << (32 - width)) as i32) >> (32 - width)
    }

    pub fn class(self) -> u32 {
        self.bits(30, 31)
    }

    // Parallel operation fields
    pub fn alu_op(self) -> u32 {
        self.bits(26, 29)
    }
    pub fn x_bus_op(self) -> u32 {
        self.bits(23, 25)
    }
    pub fn x_bus_source(self) -> u32 {
        self.bits(20, 22)
    }
    pub fn y_bus_op(self) -> u32 {
        self.bits(17, 19)
    }
    pub fn y_bus_source(self) -> u32 {
        self.bits(14, 16)
    }
    pub fn d1_bus_op(self) -> u32 {
        self.bits(12, 13)
    }
    pub fn d1_bus_dest(self) -> u32 {
        self.bits(8, 11)
    }
    pub fn d1_bus_imm(self) -> i32 {
        self.sbits(0, 7)
    }

    // Load-immediate fields
    pub fn load_dest(self) -> u32 {
        self.bits(26, 29)
    }
    pub fn load_conditional(self) -> bool {
        self.bits(25, 25) != 0
    }
    pub fn load_imm25(self) -> i32 {
        self.sbits(0, 24)
    }
    pub fn load_imm19(self) -> i32 {
        self.sbits(0, 18)
    }
    pub fn load_condition(self) -> u32 {
        self.bits(19, 24)
    }

    // Special-operation fields
    pub fn special_class(self) -> u32 {
        self.bits(28, 29)
    }
    pub fn dma_imm(self) -> u32 {
        self.bits(0, 7)
    }
    pub fn dma_address(self) -> u32 {
        self.bits(8, 10)
    }
    pub fn dma_to_d0(self) -> bool {
        self.bits(12, 12) != 0
    }
    pub fn dma_size_from_ram(self) -> bool {
        self.bits(13, 13) != 0
    }
    pub fn dma_hold(self) -> bool {
        self.bits(14, 14) != 0
    }
    pub fn dma_stride(self) -> u32 {
        self.bits(15, 17)
    }
    pub fn jump_target(self) -> u32 {
        self.bits(0, 7)
    }
    pub fn jump_condition(self) -> u32 {
        self.bits(19, 24)
    }
    pub fn loop_repeat(self) -> bool {
        self.bits(27, 27) != 0
    }
    pub fn end_interrupt(self) -> bool {
        self.bits(27, 27) != 0
    }
}

// ── 48-bit accumulator ────────────────────────────────────────

const MASK48: u64 = (1 << 48) - 1;

/// 48-bit register stored sign-extended in an i64; every constructor
/// restores the invariant that bits 48..63 mirror bit 47.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reg48(i64);

impl Reg48 {
    pub fn new(value: i64) -> Self {
        Self((value << 16) >> 16)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    /// Low 32 bits (the `.L` view).
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    /// Bits 16..47 (the `.H` view used by source index 10).
    pub fn high(self) -> u32 {
        ((self.0 as u64) >> 16) as u32
    }

    /// Replace the low 32 bits, keeping the upper 16.
    pub fn with_low(self, low: u32) -> Self {
        Self::new(((self.0 as u64 & !0xFFFF_FFFF) | low as u64) as i64)
    }
}

/// Callback fired on an END instruction carrying the interrupt bit.
pub type DspEndFn = Box<dyn FnMut()>;

pub struct ScuDsp {
    pub program_ram: [DspInstr; 256],
    pub data_ram: [[u32; 64]; 4],

    pub program_executing: bool,
    pub program_paused: bool,
    pub program_ended: bool,
    pub program_step: bool,

    pub pc: u8,
    /// Host-side data RAM address port (bits 6-7 bank, 0-5 offset).
    pub data_address: u8,

    pub next_pc: u8,
    pub jmp_counter: u8,

    pub sign: bool,
    pub zero: bool,
    pub carry: bool,
    pub overflow: bool,

    pub ct: [u8; 4],

    pub alu: Reg48,
    pub ac: Reg48,
    pub p: Reg48,
    pub rx: i32,
    pub ry: i32,

    pub loop_top: u8,     // TOP
    pub loop_count: u16,  // LOP, 12 bits

    pub dma_run: bool,
    pub dma_to_d0: bool,
    pub dma_hold: bool,
    pub dma_count: u8,
    pub dma_src: u8, // CT bank when writing to D0
    pub dma_dst: u8, // CT bank (or 4 = program RAM) when reading from D0
    pub dma_read_addr: u32,
    pub dma_write_addr: u32,
    pub dma_addr_inc: u32,

    bus: Rc<Bus>,
    on_dsp_end: Option<DspEndFn>,
}

impl ScuDsp {
    pub fn new(bus: Rc<Bus>) -> Self {
        let mut dsp = Self {
            program_ram: [DspInstr::default(); 256],
            data_ram: [[0; 64]; 4],
            program_executing: false,
            program_paused: false,
            program_ended: false,
            program_step: false,
            pc: 0,
            data_address: 0,
            next_pc: 0,
            jmp_counter: 0,
            sign: false,
            zero: false,
            carry: false,
            overflow: false,
            ct: [0; 4],
            alu: Reg48::default(),
            ac: Reg48::default(),
            p: Reg48::default(),
            rx: 0,
            ry: 0,
            loop_top: 0,
            loop_count: 0,
            dma_run: false,
            dma_to_d0: false,
            dma_hold: false,
            dma_count: 0,
            dma_src: 0,
            dma_dst: 0,
            dma_read_addr: 0,
            dma_write_addr: 0,
            dma_addr_inc: 0,
            bus,
            on_dsp_end: None,
        };
        dsp.reset(true);
        dsp
    }

    pub fn set_dsp_end_callback(&mut self, callback: DspEndFn) {
        self.on_dsp_end = Some(callback);
    }

    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.program_ram = [DspInstr::default(); 256];
            self.data_ram = [[0; 64]; 4];
        }
        self.program_executing = false;
        self.program_paused = false;
        self.program_ended = false;
        self.program_step = false;
        self.pc = 0;
        self.data_address = 0;
        self.next_pc = 0;
        self.jmp_counter = 0;
        self.sign = false;
        self.zero = false;
        self.carry = false;
        self.overflow = false;
        self.ct = [0; 4];
        self.alu = Reg48::default();
        self.ac = Reg48::default();
        self.p = Reg48::default();
        self.rx = 0;
        self.ry = 0;
        self.loop_top = 0;
        self.loop_count = 0;
        self.dma_run = false;
        self.dma_to_d0 = false;
        self.dma_hold = false;
        self.dma_count = 0;
        self.dma_src = 0;
        self.dma_dst = 0;
        self.dma_read_addr = 0;
        self.dma_write_addr = 0;
        self.dma_addr_inc = 0;
    }

    // ── Host port accessors ────────────────────────────────────

    pub fn read_program(&self) -> u32 {
        self.program_ram[self.pc as usize].0
    }

    pub fn write_program(&mut self, value: u32, poke: bool) {
        if !poke && self.program_executing {
            return;
        }
        self.program_ram[self.pc as usize] = DspInstr(value);
        self.pc = self.pc.wrapping_add(1);
    }

    pub fn write_pc(&mut self, value: u8) {
        self.pc = value;
    }

    pub fn read_data(&mut self, peek: bool) -> u32 {
        if !peek && self.program_executing {
            return 0;
        }
        let bank = (self.data_address >> 6) as usize;
        let offset = (self.data_address & 0x3F) as usize;
        if !peek {
            self.data_address = self.data_address.wrapping_add(1);
        }
        self.data_ram[bank][offset]
    }

    pub fn write_data(&mut self, value: u32, poke: bool) {
        if !poke && self.program_executing {
            return;
        }
        let bank = (self.data_address >> 6) as usize;
        let offset = (self.data_address & 0x3F) as usize;
        self.data_address = self.data_address.wrapping_add(1);
        self.data_ram[bank][offset] = value;
    }

    // ── Execution ──────────────────────────────────────────────

    pub fn run(&mut self, cycles: u64) {
        self.run_dma();

        for _ in 0..cycles {
            if !self.program_executing && !self.program_step {
                return;
            }
            if self.program_paused {
                return;
            }

            let instr = self.program_ram[self.pc as usize];
            self.pc = self.pc.wrapping_add(1);
            match instr.class() {
                0b00 => self.cmd_operation(instr),
                0b10 => self.cmd_load_imm(instr),
                0b11 => self.cmd_special(instr),
                _ => {}
            }

            if self.jmp_counter > 0 {
                self.jmp_counter -= 1;
                if self.jmp_counter == 0 {
                    self.pc = self.next_pc;
                }
            }

            // Stepping executes exactly one command.
            self.program_step = false;
        }
    }

    fn cond_check(&self, cond: u32) -> bool {
        match cond {
            0b000001 => !self.zero,
            0b000010 => !self.sign,
            0b000011 => !self.zero && !self.sign,
            0b000100 => !self.carry,
            0b001000 => !self.dma_run,
            0b100001 => self.zero,
            0b100010 => self.sign,
            0b100011 => self.zero || self.sign,
            0b100100 => self.carry,
            0b101000 => self.dma_run,
            _ => false,
        }
    }

    fn delayed_jump(&mut self, target: u8) {
        self.next_pc = target;
        self.jmp_counter = 2;
    }

    // ── ALU ────────────────────────────────────────────────────

    fn set_nz32(&mut self, value: u32) {
        self.zero = value == 0;
        self.sign = (value as i32) < 0;
    }

    fn alu_logic(&mut self, result: u32) {
        self.alu = self.ac.with_low(result);
        self.set_nz32(result);
        self.carry = false;
    }

    fn alu_add(&mut self) {
        let op1 = self.ac.low() as u64;
        let op2 = self.p.low() as u64;
        let result = op1 + op2;
        self.zero = result == 0;
        self.sign = (result as u32 as i32) < 0;
        self.carry = result & (1 << 32) != 0;
        self.overflow |= (!(op1 ^ op2) & (op1 ^ result)) & (1 << 31) != 0;
        self.alu = self.ac.with_low(result as u32);
    }

    fn alu_sub(&mut self) {
        let op1 = self.ac.low() as u64;
        let op2 = self.p.low() as u64;
        let result = op1.wrapping_sub(op2);
        self.zero = result == 0;
        self.sign = (result as u32 as i32) < 0;
        self.carry = result & (1 << 32) != 0;
        self.overflow |= ((op1 ^ op2) & (op1 ^ result)) & (1 << 31) != 0;
        self.alu = self.ac.with_low(result as u32);
    }

    fn alu_ad2(&mut self) {
        let op1 = self.ac.raw() as u64 & MASK48;
        let op2 = self.p.raw() as u64 & MASK48;
        let result = op1 + op2;
        self.zero = result & MASK48 == 0;
        self.sign = result & (1 << 47) != 0;
        self.carry = result & (1 << 48) != 0;
        self.overflow |= (!(op1 ^ op2) & (op1 ^ result)) & (1 << 47) != 0;
        self.alu = Reg48::new(result as i64);
    }

    fn alu_shift(&mut self, op: u32) {
        let ac = self.ac.low();
        let result = match op {
            0b1000 => {
                // SR
                self.carry = ac & 1 != 0;
                ((ac as i32) >> 1) as u32
            }
            0b1001 => {
                // RR
                self.carry = ac & 1 != 0;
                ac.rotate_right(1)
            }
            0b1010 => {
                // SL
                self.carry = ac & (1 << 31) != 0;
                ac << 1
            }
            0b1011 => {
                // RL
                self.carry = ac & (1 << 31) != 0;
                ac.rotate_left(1)
            }
            _ => {
                // RL8
                self.carry = ac & (1 << 24) != 0;
                ac.rotate_left(8)
            }
        };
        self.alu = self.ac.with_low(result);
        self.set_nz32(result);
    }

    // ── Bus source / destination ───────────────────────────────

    /// Read a source operand. Indices 0..3 read M0..M3, 4..7 read MC0..MC3
    /// (marking the CT for post-increment), 9 reads ALU.L, 10 ALU.H.
    /// `reads` accumulates the banks touched; `pending_inc` the CTs to
    /// advance at the end of the instruction.
    fn read_source(
        &mut self,
        index: u32,
        reads: &mut u8,
        pending_inc: &mut u8,
    ) -> u32 {
        match index {
            0..=7 => {
                let bank = (index & 3) as usize;
                // Finish an outstanding DMA before touching data RAM.
                if self.dma_run {
                    self.run_dma();
                }
                *reads |= 1 << bank;
                if index >= 4 {
                    *pending_inc |= 1 << bank;
                }
                self.data_ram[bank][self.ct[bank] as usize]
            }
            9 => self.alu.low(),
            10 => self.alu.high(),
            _ => !0u32,
        }
    }

    /// D1-bus write, with the data-RAM hazard rules applied by the caller.
    fn write_d1(&mut self, index: u32, value: u32, pending_inc: &mut u8) {
        if self.dma_run {
            self.run_dma();
        }
        match index {
            0..=3 => {
                let bank = index as usize;
                self.data_ram[bank][self.ct[bank] as usize] = value;
                *pending_inc |= 1 << bank;
            }
            4 => self.rx = value as i32,
            5 => self.p = Reg48::new(value as i32 as i64),
            6 => self.dma_read_addr = (value << 2) & 0x7FF_FFFC,
            7 => self.dma_write_addr = (value << 2) & 0x7FF_FFFC,
            10 => self.loop_count = (value & 0xFFF) as u16,
            11 => self.loop_top = value as u8,
            12..=15 => {
                let bank = (index & 3) as usize;
                self.data_ram[bank][self.ct[bank] as usize] = value;
            }
            _ => {}
        }
    }

    fn cmd_operation(&mut self, instr: DspInstr) {
        let mut reads: u8 = 0;
        let mut pending_inc: u8 = 0;
        let prev_alu = self.alu;

        // X-Bus: may write P and X simultaneously.
        //   op 010: MOV MUL,P            op 011: MOV [s],P
        //   op 1x0/1x1: MOV [s],X, with bits 0-1 selecting the P source
        let xop = instr.x_bus_op();
        if xop & 0b11 == 0b10 {
            self.p = Reg48::new(self.rx as i64 * self.ry as i64);
        }
        if xop >= 0b011 {
            let value = self.read_source(instr.x_bus_source(), &mut reads, &mut pending_inc);
            if xop & 0b11 == 0b11 {
                self.p = Reg48::new(value as i32 as i64);
            }
            if xop & 0b100 != 0 {
                self.rx = value as i32;
            }
        }

        // Y-Bus: may write A and Y simultaneously. MOV ALU,A sees the ALU
        // output of the previous instruction.
        let yop = instr.y_bus_op();
        if yop & 0b11 == 0b01 {
            self.ac = Reg48::default(); // CLR A
        } else if yop & 0b11 == 0b10 {
            self.ac = prev_alu; // MOV ALU,A
        }
        if yop >= 0b011 {
            let value = self.read_source(instr.y_bus_source(), &mut reads, &mut pending_inc);
            if yop & 0b11 == 0b11 {
                self.ac = Reg48::new(value as i32 as i64);
            }
            if yop & 0b100 != 0 {
                self.ry = value as i32;
            }
        }

        // ALU, operating on the freshly loaded A/P pair.
        self.alu = self.ac;
        match instr.alu_op() {
            0b0000 => {}
            0b0001 => self.alu_logic(self.ac.low() & self.p.low()),
            0b0010 => self.alu_logic(self.ac.low() | self.p.low()),
            0b0011 => self.alu_logic(self.ac.low() ^ self.p.low()),
            0b0100 => self.alu_add(),
            0b0101 => self.alu_sub(),
            0b0110 => self.alu_ad2(),
            0b1000 | 0b1001 | 0b1010 | 0b1011 | 0b1111 => self.alu_shift(instr.alu_op()),
            _ => {}
        }

        // D1-Bus. Writes to a data RAM bank that was read this cycle are
        // suppressed; the CT still advances once for the read. Writes to
        // X or P lose against a concurrent X-bus write.
        match instr.d1_bus_op() {
            0b01 => {
                // MOV SImm,[d]
                let dst = instr.d1_bus_dest();
                let imm = instr.d1_bus_imm() as u32;
                self.d1_write_checked(instr, dst, imm, reads, &mut pending_inc, None);
            }
            0b11 => {
                // MOV [s],[d]
                let src = instr.d1_bus_imm() as u32 & 0b1111;
                let dst = instr.d1_bus_dest();
                self.d1_write_checked(instr, dst, 0, reads, &mut pending_inc, Some(src));
            }
            _ => {}
        }

        // Apply CT post-increments.
        for bank in 0..4 {
            if pending_inc & (1 << bank) != 0 {
                self.ct[bank] = (self.ct[bank] + 1) & 0x3F;
            }
        }
    }

    fn d1_write_checked(
        &mut self,
        instr: DspInstr,
        dst: u32,
        imm: u32,
        reads_before: u8,
        pending_inc: &mut u8,
        src: Option<u32>,
    ) {
        let mut reads = reads_before;
        let value = match src {
            Some(s) => self.read_source(s, &mut reads, pending_inc),
            None => imm,
        };

        // A D1 source read of the same bank also suppresses the write.
        let bank_conflict = |bank: u32| reads & (1 << (bank & 3)) != 0;
        match dst {
            0..=3 if bank_conflict(dst) => {
                // Suppressed MC write: no data write, no extra increment.
                trace!("SCU DSP: suppressed MC{dst} write after bank read");
            }
            12..=15 if bank_conflict(dst & 3) => {
                // Suppressed M write: the read still advances the CT once.
                *pending_inc |= 1 << (dst & 3);
                trace!("SCU DSP: suppressed M{} write after bank read", dst & 3);
            }
            4 if instr.x_bus_op() & 0b100 != 0 => {
                // X already written by the X-bus this cycle.
            }
            5 if instr.x_bus_op() & 0b010 != 0 => {
                // P already written by the X-bus this cycle.
            }
            _ => self.write_d1(dst, value, pending_inc),
        }
    }

    fn cmd_load_imm(&mut self, instr: DspInstr) {
        let dst = instr.load_dest();
        let imm = if instr.load_conditional() {
            if !self.cond_check(instr.load_condition()) {
                return;
            }
            instr.load_imm19()
        } else {
            instr.load_imm25()
        };
        self.write_imm(dst, imm as u32);
    }

    /// Immediate writes to [d]; destination 12 loads TOP and starts a
    /// delayed jump (the LPS/BTM setup form).
    fn write_imm(&mut self, index: u32, value: u32) {
        if self.dma_run {
            self.run_dma();
        }
        match index {
            0..=3 => {
                let bank = index as usize;
                self.data_ram[bank][self.ct[bank] as usize] = value;
                self.ct[bank] = (self.ct[bank] + 1) & 0x3F;
            }
            4 => self.rx = value as i32,
            5 => self.p = Reg48::new(value as i32 as i64),
            6 => self.dma_read_addr = (value << 2) & 0x7FF_FFFC,
            7 => self.dma_write_addr = (value << 2) & 0x7FF_FFFC,
            10 => self.loop_count = (value & 0xFFF) as u16,
            12 => {
                self.loop_top = self.pc;
                self.delayed_jump(value as u8);
            }
            _ => {}
        }
    }

    fn cmd_special(&mut self, instr: DspInstr) {
        match instr.special_class() {
            0b00 => self.cmd_dma(instr),
            0b01 => self.cmd_jump(instr),
            0b10 => self.cmd_loop(instr),
            0b11 => self.cmd_end(instr),
            _ => {}
        }
    }

    fn cmd_dma(&mut self, instr: DspInstr) {
        if self.dma_run {
            self.run_dma();
        }

        self.dma_run = true;
        self.dma_to_d0 = instr.dma_to_d0();
        self.dma_hold = instr.dma_hold();

        // Transfer length: an immediate, or a value pulled from data RAM.
        if instr.dma_size_from_ram() {
            let bank = (instr.dma_imm() & 3) as usize;
            let inc = instr.dma_imm() & 4 != 0;
            self.dma_count = self.data_ram[bank][self.ct[bank] as usize] as u8;
            if inc {
                self.ct[bank] = (self.ct[bank] + 1) & 0x3F;
            }
        } else {
            self.dma_count = instr.dma_imm() as u8;
        }

        let stride = instr.dma_stride();
        if self.dma_to_d0 {
            self.dma_src = instr.dma_address() as u8;
            self.dma_addr_inc = (1u32 << stride) & !1;
        } else {
            self.dma_dst = instr.dma_address() as u8;
            self.dma_addr_inc = (1u32 << (stride & 0x2)) & !1;
        }

        trace!("SCU DSP: DMA command {:08X} @ {:02X}", instr.0, self.pc);
    }

    fn cmd_jump(&mut self, instr: DspInstr) {
        let cond = instr.jump_condition();
        if cond != 0 && !self.cond_check(cond) {
            return;
        }
        self.delayed_jump(instr.jump_target() as u8);
    }

    fn cmd_loop(&mut self, instr: DspInstr) {
        if self.loop_count != 0 {
            if instr.loop_repeat() {
                // LPS: repeat the current instruction
                self.delayed_jump(self.pc.wrapping_sub(1));
            } else {
                // BTM: jump back to TOP
                self.delayed_jump(self.loop_top);
            }
        }
        self.loop_count = self.loop_count.wrapping_sub(1) & 0xFFF;
    }

    fn cmd_end(&mut self, instr: DspInstr) {
        self.program_executing = false;
        self.program_ended = true;
        self.pc = self.pc.wrapping_add(1);
        if instr.end_interrupt() {
            if let Some(cb) = self.on_dsp_end.as_mut() {
                cb();
            }
        }
    }

    // ── DSP DMA ────────────────────────────────────────────────

    /// Run the outstanding DSP-DMA transfer to completion. One 32-bit
    /// word moves per step between the external D0 address and the
    /// selected CT bank (or program RAM when reading into bank index 4).
    pub fn run_dma(&mut self) {
        if !self.dma_run {
            return;
        }

        let to_d0 = self.dma_to_d0;
        let mut addr = if to_d0 {
            self.dma_write_addr
        } else {
            self.dma_read_addr
        };
        let bus_kind = bus_id(addr);
        if bus_kind == BusId::None {
            self.dma_run = false;
            return;
        }

        let ct_index = if to_d0 { self.dma_src } else { self.dma_dst } as usize;
        let use_data_ram = ct_index <= 3;
        let use_program_ram = !to_d0 && ct_index == 4;
        let mut program_index = 0usize;

        trace!(
            "SCU DSP: DMA {} {:07X} (+{:X}), {} longwords",
            if to_d0 { "DSP ->" } else { "-> DSP from" },
            addr,
            self.dma_addr_inc,
            self.dma_count
        );

        loop {
            self.dma_count = self.dma_count.wrapping_sub(1);
            if to_d0 {
                let value = if use_data_ram {
                    self.data_ram[ct_index][self.ct[ct_index] as usize]
                } else {
                    !0u32
                };
                match bus_kind {
                    BusId::ABus => {
                        self.bus.write32(addr, value);
                        addr = addr.wrapping_add(self.dma_addr_inc);
                    }
                    BusId::BBus => {
                        self.bus.write16(addr, (value >> 16) as u16);
                        addr = addr.wrapping_add(self.dma_addr_inc);
                        self.bus.write16(addr, value as u16);
                        addr = addr.wrapping_add(self.dma_addr_inc);
                    }
                    BusId::Wram | BusId::CpuBus => {
                        self.bus.write32(addr & !3, value);
                        addr = addr.wrapping_add(self.dma_addr_inc);
                    }
                    BusId::None => unreachable!(),
                }
            } else {
                let value = match bus_kind {
                    BusId::ABus => {
                        let v = self.bus.read32(addr);
                        addr = addr.wrapping_add(self.dma_addr_inc);
                        v
                    }
                    BusId::BBus => {
                        let hi = self.bus.read16(addr) as u32;
                        let lo = self.bus.read16(addr | 2) as u32;
                        addr = addr.wrapping_add(4);
                        (hi << 16) | lo
                    }
                    BusId::Wram | BusId::CpuBus => {
                        let v = self.bus.read32(addr);
                        addr = addr.wrapping_add(self.dma_addr_inc);
                        v
                    }
                    BusId::None => unreachable!(),
                };
                if use_data_ram {
                    self.data_ram[ct_index][self.ct[ct_index] as usize] = value;
                } else if use_program_ram {
                    self.program_ram[program_index & 0xFF] = DspInstr(value);
                    program_index += 1;
                }
            }
            addr &= 0x7FF_FFFF;
            if use_data_ram {
                self.ct[ct_index] = (self.ct[ct_index] + 1) & 0x3F;
            }
            if self.dma_count == 0 {
                break;
            }
        }

        // Write back RA0/WA0 unless holding.
        if !self.dma_hold {
            if to_d0 {
                self.dma_write_addr = addr.wrapping_add(2) & !3;
            } else {
                self.dma_read_addr = addr;
            }
        }

        self.dma_run = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsp() -> ScuDsp {
        ScuDsp::new(Rc::new(Bus::new()))
    }

    /// Encode a parallel operation.
    fn op(alu: u32, xop: u32, xsrc: u32, yop: u32, ysrc: u32, d1op: u32, d1dst: u32, d1imm: u32) -> u32 {
        (alu << 26)
            | (xop << 23)
            | (xsrc << 20)
            | (yop << 17)
            | (ysrc << 14)
            | (d1op << 12)
            | (d1dst << 8)
            | (d1imm & 0xFF)
    }

    #[test]
    fn parallel_read_suppresses_conflicting_write() {
        let mut d = dsp();
        d.data_ram[0][0] = 7; // M0
        d.data_ram[1][0] = 3; // M1

        // ALU=ADD, X: MOV M0,X (op 100), Y: MOV M1,A (op 011),
        // D1: MOV [s],[d] with s=9 (ALU.L), d=12 (M0).
        d.program_ram[0] = DspInstr(op(0b0100, 0b100, 0, 0b011, 1, 0b11, 12, 9));
        d.program_executing = true;
        d.run(1);

        // A+P with P unchanged: A receives M1=3, P stays 0, ALU.L = 3.
        assert_eq!(d.alu.low(), 3);
        assert_eq!(d.rx, 7);
        // The M0 write is suppressed because bank 0 was read; the CT still
        // advances once.
        assert_eq!(d.data_ram[0][0], 7);
        assert_eq!(d.ct[0], 1);
    }

    #[test]
    fn mc_reads_post_increment_ct() {
        let mut d = dsp();
        d.data_ram[2][0] = 0x1111;
        d.data_ram[2][1] = 0x2222;
        // X: MOV MC2,X twice
        d.program_ram[0] = DspInstr(op(0, 0b100, 6, 0, 0, 0, 0, 0));
        d.program_ram[1] = DspInstr(op(0, 0b100, 6, 0, 0, 0, 0, 0));
        d.program_executing = true;
        d.run(2);
        assert_eq!(d.rx, 0x2222);
        assert_eq!(d.ct[2], 2);
    }

    #[test]
    fn multiply_moves_through_p() {
        let mut d = dsp();
        d.rx = 6;
        d.ry = 7;
        // X op 010: MOV MUL,P; ALU ADD with A=0 -> ALU.L = 42
        d.program_ram[0] = DspInstr(op(0b0100, 0b010, 0, 0, 0, 0, 0, 0));
        d.program_executing = true;
        d.run(1);
        assert_eq!(d.alu.low(), 42);
    }

    #[test]
    fn delayed_jump_takes_effect_after_one_instruction() {
        let mut d = dsp();
        // 0: JMP 0x10 (unconditional); 1: NOP; then PC must be 0x10.
        d.program_ram[0] = DspInstr((0b11 << 30) | (0b01 << 28) | 0x10);
        d.program_ram[1] = DspInstr(0); // delay slot
        d.program_executing = true;
        d.run(2);
        assert_eq!(d.pc, 0x10);
    }

    #[test]
    fn end_stops_execution_and_fires_interrupt() {
        use std::cell::Cell;
        use std::rc::Rc as StdRc;

        let mut d = dsp();
        let fired = StdRc::new(Cell::new(0));
        let fired2 = fired.clone();
        d.set_dsp_end_callback(Box::new(move || fired2.set(fired2.get() + 1)));

        // ENDI: class 11, special class 11, interrupt bit 27
        d.program_ram[0] = DspInstr((0b11 << 30) | (0b11 << 28) | (1 << 27));
        d.program_executing = true;
        d.run(4);
        assert!(!d.program_executing);
        assert!(d.program_ended);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn lps_repeats_the_next_instruction() {
        let mut d = dsp();
        d.loop_count = 2;
        // 0: LPS (special class 10, repeat bit 27)
        d.program_ram[0] = DspInstr((0b11 << 30) | (0b10 << 28) | (1 << 27));
        // 1: MVI 1,MC0 (load imm, dst 0)
        d.program_ram[1] = DspInstr((0b10 << 30) | (0 << 26) | 1);
        d.program_executing = true;
        // LPS + delay-slot execution + repeats: data lands in bank 0
        d.run(4);
        assert!(d.ct[0] >= 2, "loop body must have run more than once");
    }

    #[test]
    fn ad2_carries_through_48_bits() {
        let mut d = dsp();
        d.ac = Reg48::new(0x7FFF_FFFF_FFFF);
        d.p = Reg48::new(1);
        d.program_ram[0] = DspInstr(op(0b0110, 0, 0, 0, 0, 0, 0, 0));
        d.program_executing = true;
        d.run(1);
        assert!(d.sign);
        assert!(d.overflow);
        assert_eq!(d.alu.raw() as u64 & MASK48, 0x8000_0000_0000);
    }
}
