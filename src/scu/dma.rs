//! SCU DMA channel records and bus classification.
//!
//! Three channels share one transfer engine (in the parent module).
//! Channel 0 moves up to 1 MiB per transfer; channels 1 and 2 up to
//! 4 KiB. Live "current" copies of the programmed registers are updated
//! as the transfer engine advances.

/// Peripheral bus a physical address belongs to. Same-bus transfers and
/// transfers touching `None` are illegal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusId {
    /// CPU bus: IPL ROM, low work RAM, internal backup memory.
    CpuBus,
    ABus,
    BBus,
    /// High work RAM.
    Wram,
    None,
}

/// Classify an address the way the SCU arbitrates it: A-Bus fronts the
/// cartridge and CD block, B-Bus fronts video and sound, high work RAM
/// sits alone from 0x600'0000 up, and the low 32 MiB (IPL ROM, low work
/// RAM, backup memory) share the CPU bus.
pub fn bus_id(address: u32) -> BusId {
    let address = address & 0x7FF_FFFF;
    if address <= 0x1FF_FFFF {
        BusId::CpuBus
    } else if address <= 0x58F_FFFF {
        BusId::ABus
    } else if (0x5A0_0000..=0x5FB_FFFF).contains(&address) {
        BusId::BBus
    } else if address >= 0x600_0000 {
        BusId::Wram
    } else {
        BusId::None
    }
}

/// DMA starting factor (DxFT2-0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTrigger {
    VBlankIn = 0,
    VBlankOut = 1,
    HBlankIn = 2,
    Timer0 = 3,
    Timer1 = 4,
    SoundRequest = 5,
    SpriteDrawEnd = 6,
    Immediate = 7,
}

impl DmaTrigger {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            0 => DmaTrigger::VBlankIn,
            1 => DmaTrigger::VBlankOut,
            2 => DmaTrigger::HBlankIn,
            3 => DmaTrigger::Timer0,
            4 => DmaTrigger::Timer1,
            5 => DmaTrigger::SoundRequest,
            6 => DmaTrigger::SpriteDrawEnd,
            _ => DmaTrigger::Immediate,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DmaTrigger::VBlankIn => "VBlank IN",
            DmaTrigger::VBlankOut => "VBlank OUT",
            DmaTrigger::HBlankIn => "HBlank IN",
            DmaTrigger::Timer0 => "Timer 0",
            DmaTrigger::Timer1 => "Timer 1",
            DmaTrigger::SoundRequest => "Sound Request",
            DmaTrigger::SpriteDrawEnd => "Sprite Draw End",
            DmaTrigger::Immediate => "Immediate",
        }
    }
}

pub struct DmaChannel {
    pub src_addr: u32,        // DnR - read address
    pub dst_addr: u32,        // DnW - write address
    pub xfer_count: u32,      // DnC - transfer byte count
    pub src_addr_inc: u32,    // DnAD.DnRA - 0 or +4 bytes
    pub dst_addr_inc: u32,    // DnAD.DnWA - +0,2,4,8,16,32,64,128 bytes
    pub update_src_addr: bool, // DnRUP
    pub update_dst_addr: bool, // DnWUP
    pub enabled: bool,        // DxEN
    pub active: bool,         // transfer in progress
    pub indirect: bool,       // DxMOD
    pub trigger: DmaTrigger,  // DxFT

    pub start: bool, // start transfer on the next recalc
    pub curr_src_addr: u32,
    pub curr_dst_addr: u32,
    pub curr_xfer_count: u32,
    pub curr_src_addr_inc: u32,
    pub curr_dst_addr_inc: u32,

    pub curr_indirect_src: u32,
    pub end_indirect: bool,
}

impl DmaChannel {
    pub fn new() -> Self {
        let mut ch = Self {
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
            trigger: DmaTrigger::Immediate,
            start: false,
            curr_src_addr: 0,
            curr_dst_addr: 0,
            curr_xfer_count: 0,
            curr_src_addr_inc: 0,
            curr_dst_addr_inc: 0,
            curr_indirect_src: 0,
            end_indirect: false,
        };
        ch.reset();
        ch
    }

    pub fn reset(&mut self) {
        self.src_addr = 0;
        self.dst_addr = 0;
        self.xfer_count = 0;
        self.src_addr_inc = 4;
        self.dst_addr_inc = 2;
        self.update_src_addr = false;
        self.update_dst_addr = false;
        self.enabled = false;
        self.active = false;
        self.indirect = false;
        self.trigger = DmaTrigger::Immediate;
        self.start = false;
        self.curr_src_addr = 0;
        self.curr_dst_addr = 0;
        self.curr_xfer_count = 0;
        self.curr_src_addr_inc = 0;
        self.curr_dst_addr_inc = 0;
        self.curr_indirect_src = 0;
        self.end_indirect = false;
    }

    /// Source address increment:
    /// - the programmed value (0 or 4) inside CS2 or work RAM
    /// - always 4 bytes elsewhere
    ///
    /// Destination address increment:
    /// - the programmed power-of-two inside the B-Bus or work RAM
    /// - 0 or 4 inside CS2
    /// - always 4 bytes elsewhere
    pub fn setup_increments(&mut self) {
        let src_cs2 = (0x580_0000..=0x58F_FFFF).contains(&self.curr_src_addr);
        let src_wram =
            self.curr_src_addr >= 0x600_0000 || bus_id(self.curr_src_addr) == BusId::CpuBus;
        self.curr_src_addr_inc = if src_cs2 || src_wram {
            self.src_addr_inc
        } else {
            4
        };

        let dst_bbus = (0x5A0_0000..=0x5FF_FFFF).contains(&self.curr_dst_addr);
        let dst_cs2 = (0x580_0000..=0x58F_FFFF).contains(&self.curr_dst_addr);
        let dst_wram =
            self.curr_dst_addr >= 0x600_0000 || bus_id(self.curr_dst_addr) == BusId::CpuBus;
        self.curr_dst_addr_inc = if dst_bbus || dst_wram {
            self.dst_addr_inc
        } else if dst_cs2 {
            if self.dst_addr_inc != 0 {
                4
            } else {
                0
            }
        } else {
            4
        };
    }

    /// Transfer count with the zero-means-maximum rule applied.
    pub fn effective_count(&self, channel: usize) -> u32 {
        if self.xfer_count != 0 {
            self.xfer_count
        } else if channel == 0 {
            0x10_0000
        } else {
            0x1000
        }
    }
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_classification_matches_the_memory_map() {
        assert_eq!(bus_id(0x020_0000), BusId::CpuBus); // low work RAM
        assert_eq!(bus_id(0x200_0000), BusId::ABus); // cartridge
        assert_eq!(bus_id(0x580_0000), BusId::ABus); // CD block
        assert_eq!(bus_id(0x5A0_0000), BusId::BBus); // sound RAM
        assert_eq!(bus_id(0x5C0_0000), BusId::BBus); // VDP1 RAM
        assert_eq!(bus_id(0x610_0000), BusId::Wram);
        assert_eq!(bus_id(0x5FE_0000), BusId::None); // SCU registers
    }

    #[test]
    fn zero_count_expands_per_channel() {
        let ch = DmaChannel::new();
        assert_eq!(ch.effective_count(0), 0x10_0000);
        assert_eq!(ch.effective_count(1), 0x1000);
        assert_eq!(ch.effective_count(2), 0x1000);
    }

    #[test]
    fn cs2_destination_increment_is_0_or_4() {
        let mut ch = DmaChannel::new();
        ch.curr_src_addr = 0x600_0000;
        ch.curr_dst_addr = 0x580_0000;
        ch.dst_addr_inc = 32;
        ch.setup_increments();
        assert_eq!(ch.curr_dst_addr_inc, 4);
        ch.dst_addr_inc = 0;
        ch.setup_increments();
        assert_eq!(ch.curr_dst_addr_inc, 0);
    }
}
