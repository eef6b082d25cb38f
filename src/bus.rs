//! Address-decoded system bus.
//!
//! A flat 27-bit address space dispatches byte/word/long reads and writes
//! to per-region handler sets. Two parallel worlds exist: the normal
//! world used by execution, and a side-effect-free world used by debug
//! inspection — handlers in the latter must never clear latches or
//! advance state.
//!
//! Reads of unmapped addresses return 0; writes are dropped. Multi-byte
//! accesses synthesized from narrower handlers combine big-endian
//! (most significant byte at the low address).

use std::cell::RefCell;

use log::trace;

/// Address space mask (27 bits).
pub const ADDRESS_MASK: u32 = 0x7FF_FFFF;

pub type Read8Fn = Box<dyn FnMut(u32) -> u8>;
pub type Read16Fn = Box<dyn FnMut(u32) -> u16>;
pub type Read32Fn = Box<dyn FnMut(u32) -> u32>;
pub type Write8Fn = Box<dyn FnMut(u32, u8)>;
pub type Write16Fn = Box<dyn FnMut(u32, u16)>;
pub type Write32Fn = Box<dyn FnMut(u32, u32)>;

/// The six handlers covering one mapped region.
pub struct HandlerSet {
    pub read8: Read8Fn,
    pub read16: Read16Fn,
    pub read32: Read32Fn,
    pub write8: Write8Fn,
    pub write16: Write16Fn,
    pub write32: Write32Fn,
}

impl HandlerSet {
    /// Build a full handler set from just the 16-bit pair; 8-bit accesses
    /// address the containing word and 32-bit accesses are split into two
    /// word accesses, big-endian.
    pub fn from_word_handlers(
        read16: impl FnMut(u32) -> u16 + Clone + 'static,
        write16: impl FnMut(u32, u16) + Clone + 'static,
    ) -> Self {
        let mut r16_byte = read16.clone();
        let mut r16_long = read16.clone();
        let mut r16_word = read16.clone();
        let mut r16_wr8 = read16;
        let mut w16_byte = write16.clone();
        let mut w16_long = write16.clone();
        let mut w16_word = write16;
        HandlerSet {
            read8: Box::new(move |addr| {
                let word = r16_byte(addr & !1);
                (word >> ((!addr & 1) * 8)) as u8
            }),
            read16: Box::new(move |addr| r16_word(addr)),
            read32: Box::new(move |addr| {
                let hi = r16_long(addr) as u32;
                let lo = r16_long(addr + 2) as u32;
                (hi << 16) | lo
            }),
            write8: Box::new(move |addr, value| {
                let word = r16_wr8(addr & !1);
                let shift = (!addr & 1) * 8;
                let word = (word & !(0xFF << shift)) | ((value as u16) << shift);
                w16_byte(addr & !1, word);
            }),
            write16: Box::new(move |addr, value| w16_word(addr, value)),
            write32: Box::new(move |addr, value| {
                w16_long(addr, (value >> 16) as u16);
                w16_long(addr + 2, value as u16);
            }),
        }
    }
}

struct Region {
    lo: u32,
    hi: u32,
    handlers: RefCell<HandlerSet>,
}

/// The two handler worlds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum World {
    Normal,
    SideEffectFree,
}

pub struct Bus {
    normal: RefCell<Vec<Region>>,
    probe: RefCell<Vec<Region>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            normal: RefCell::new(Vec::new()),
            probe: RefCell::new(Vec::new()),
        }
    }

    /// Map a region in the normal world. Overlaps are a programming error
    /// and panic at construction time.
    pub fn map_normal(&self, lo: u32, hi: u32, handlers: HandlerSet) {
        Self::insert(&mut self.normal.borrow_mut(), lo, hi, handlers);
    }

    /// Map a region in the side-effect-free world.
    pub fn map_side_effect_free(&self, lo: u32, hi: u32, handlers: HandlerSet) {
        Self::insert(&mut self.probe.borrow_mut(), lo, hi, handlers);
    }

    fn insert(regions: &mut Vec<Region>, lo: u32, hi: u32, handlers: HandlerSet) {
        assert!(lo <= hi, "bus region bounds are inverted");
        assert!(hi <= ADDRESS_MASK, "bus region exceeds the address space");
        for r in regions.iter() {
            assert!(
                hi < r.lo || lo > r.hi,
                "bus regions {lo:07X}-{hi:07X} and {:07X}-{:07X} overlap",
                r.lo,
                r.hi
            );
        }
        let pos = regions.partition_point(|r| r.lo < lo);
        regions.insert(
            pos,
            Region {
                lo,
                hi,
                handlers: RefCell::new(handlers),
            },
        );
    }

    fn with_region<R>(
        &self,
        world: World,
        addr: u32,
        f: impl FnOnce(&mut HandlerSet, u32) -> R,
    ) -> Option<R> {
        let table = match world {
            World::Normal => self.normal.borrow(),
            World::SideEffectFree => self.probe.borrow(),
        };
        // Binary search over the sorted, non-overlapping region table.
        let idx = table.partition_point(|r| r.hi < addr);
        let region = table.get(idx)?;
        if addr < region.lo {
            return None;
        }
        let mut handlers = region.handlers.borrow_mut();
        Some(f(&mut handlers, addr))
    }

    // ── Normal world ───────────────────────────────────────────

    pub fn read8(&self, addr: u32) -> u8 {
        let addr = addr & ADDRESS_MASK;
        self.with_region(World::Normal, addr, |h, a| (h.read8)(a))
            .unwrap_or_else(|| {
                trace!("bus: unmapped 8-bit read from {addr:07X}");
                0
            })
    }

    pub fn read16(&self, addr: u32) -> u16 {
        let addr = addr & ADDRESS_MASK;
        self.with_region(World::Normal, addr, |h, a| (h.read16)(a))
            .unwrap_or_else(|| {
                trace!("bus: unmapped 16-bit read from {addr:07X}");
                0
            })
    }

    pub fn read32(&self, addr: u32) -> u32 {
        let addr = addr & ADDRESS_MASK;
        self.with_region(World::Normal, addr, |h, a| (h.read32)(a))
            .unwrap_or_else(|| {
                trace!("bus: unmapped 32-bit read from {addr:07X}");
                0
            })
    }

    pub fn write8(&self, addr: u32, value: u8) {
        let addr = addr & ADDRESS_MASK;
        if self
            .with_region(World::Normal, addr, |h, a| (h.write8)(a, value))
            .is_none()
        {
            trace!("bus: unmapped 8-bit write to {addr:07X} = {value:02X}");
        }
    }

    pub fn write16(&self, addr: u32, value: u16) {
        let addr = addr & ADDRESS_MASK;
        if self
            .with_region(World::Normal, addr, |h, a| (h.write16)(a, value))
            .is_none()
        {
            trace!("bus: unmapped 16-bit write to {addr:07X} = {value:04X}");
        }
    }

    pub fn write32(&self, addr: u32, value: u32) {
        let addr = addr & ADDRESS_MASK;
        if self
            .with_region(World::Normal, addr, |h, a| (h.write32)(a, value))
            .is_none()
        {
            trace!("bus: unmapped 32-bit write to {addr:07X} = {value:08X}");
        }
    }

    // ── Side-effect-free world ─────────────────────────────────

    pub fn peek8(&self, addr: u32) -> u8 {
        let addr = addr & ADDRESS_MASK;
        self.with_region(World::SideEffectFree, addr, |h, a| (h.read8)(a))
            .unwrap_or(0)
    }

    pub fn peek16(&self, addr: u32) -> u16 {
        let addr = addr & ADDRESS_MASK;
        self.with_region(World::SideEffectFree, addr, |h, a| (h.read16)(a))
            .unwrap_or(0)
    }

    pub fn peek32(&self, addr: u32) -> u32 {
        let addr = addr & ADDRESS_MASK;
        self.with_region(World::SideEffectFree, addr, |h, a| (h.read32)(a))
            .unwrap_or(0)
    }

    pub fn poke8(&self, addr: u32, value: u8) {
        let addr = addr & ADDRESS_MASK;
        let _ = self.with_region(World::SideEffectFree, addr, |h, a| (h.write8)(a, value));
    }

    pub fn poke16(&self, addr: u32, value: u16) {
        let addr = addr & ADDRESS_MASK;
        let _ = self.with_region(World::SideEffectFree, addr, |h, a| (h.write16)(a, value));
    }

    pub fn poke32(&self, addr: u32, value: u32) {
        let addr = addr & ADDRESS_MASK;
        let _ = self.with_region(World::SideEffectFree, addr, |h, a| (h.write32)(a, value));
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ram_region(bus: &Bus, lo: u32, hi: u32) -> Rc<RefCell<Vec<u8>>> {
        let mem = Rc::new(RefCell::new(vec![0u8; (hi - lo + 1) as usize]));
        let (m8r, m16r, m32r) = (mem.clone(), mem.clone(), mem.clone());
        let (m8w, m16w, m32w) = (mem.clone(), mem.clone(), mem.clone());
        bus.map_normal(
            lo,
            hi,
            HandlerSet {
                read8: Box::new(move |a| m8r.borrow()[(a - lo) as usize]),
                read16: Box::new(move |a| {
                    let m = m16r.borrow();
                    let i = (a - lo) as usize;
                    u16::from_be_bytes([m[i], m[i + 1]])
                }),
                read32: Box::new(move |a| {
                    let m = m32r.borrow();
                    let i = (a - lo) as usize;
                    u32::from_be_bytes([m[i], m[i + 1], m[i + 2], m[i + 3]])
                }),
                write8: Box::new(move |a, v| m8w.borrow_mut()[(a - lo) as usize] = v),
                write16: Box::new(move |a, v| {
                    let mut m = m16w.borrow_mut();
                    let i = (a - lo) as usize;
                    m[i..i + 2].copy_from_slice(&v.to_be_bytes());
                }),
                write32: Box::new(move |a, v| {
                    let mut m = m32w.borrow_mut();
                    let i = (a - lo) as usize;
                    m[i..i + 4].copy_from_slice(&v.to_be_bytes());
                }),
            },
        );
        mem
    }

    #[test]
    fn dispatches_to_the_mapped_region() {
        let bus = Bus::new();
        let mem = ram_region(&bus, 0x100, 0x1FF);
        bus.write32(0x100, 0x0102_0304);
        assert_eq!(mem.borrow()[0..4], [1, 2, 3, 4]);
        assert_eq!(bus.read16(0x102), 0x0304);
        assert_eq!(bus.read8(0x103), 0x04);
    }

    #[test]
    fn unmapped_reads_return_zero_and_writes_drop() {
        let bus = Bus::new();
        let _mem = ram_region(&bus, 0x100, 0x1FF);
        assert_eq!(bus.read32(0x1000), 0);
        bus.write16(0x1000, 0xBEEF); // must not panic
    }

    #[test]
    #[should_panic(expected = "overlap")]
    fn overlapping_maps_fail_fast() {
        let bus = Bus::new();
        let _a = ram_region(&bus, 0x100, 0x1FF);
        let _b = ram_region(&bus, 0x180, 0x27F);
    }

    #[test]
    fn word_handler_synthesis_is_big_endian() {
        let backing = Rc::new(RefCell::new([0u16; 4]));
        let (r, w) = (backing.clone(), backing.clone());
        let bus = Bus::new();
        bus.map_normal(
            0,
            7,
            HandlerSet::from_word_handlers(
                move |a| r.borrow()[(a >> 1) as usize],
                move |a, v| w.borrow_mut()[(a >> 1) as usize] = v,
            ),
        );
        bus.write32(0, 0xAABB_CCDD);
        assert_eq!(backing.borrow()[0], 0xAABB);
        assert_eq!(backing.borrow()[1], 0xCCDD);
        assert_eq!(bus.read32(0), 0xAABB_CCDD);
        assert_eq!(bus.read8(0), 0xAA);
        assert_eq!(bus.read8(1), 0xBB);
    }
}
