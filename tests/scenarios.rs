//! End-to-end scenarios exercising the core through its public surface:
//! the bus, the command protocols and the facade.

use std::cell::RefCell;
use std::rc::Rc;

use kronos::cdblock::buffer::{Buffer, NUM_BUFFERS};
use kronos::cdblock::HIRQ_CSCT;
use kronos::media::{Disc, Track, FAD_OFFSET};
use kronos::sched::Scheduler;
use kronos::scsp::slot::EgState;
use kronos::{Config, Saturn};

fn saturn() -> Saturn {
    Saturn::new(&Config::default()).unwrap()
}

/// A small ISO-9660 volume: a Saturn header, a PVD, a root directory
/// with one file (DATA.BIN) and a subdirectory (SUB).
fn build_test_volume() -> Disc {
    fn push_record(sector: &mut Vec<u8>, extent: u32, size: u32, flags: u8, name: &[u8]) {
        let mut len = 33 + name.len();
        if len % 2 == 1 {
            len += 1;
        }
        let base = sector.len();
        sector.resize(base + len, 0);
        let rec = &mut sector[base..base + len];
        rec[0] = len as u8;
        rec[2..6].copy_from_slice(&extent.to_le_bytes());
        rec[6..10].copy_from_slice(&extent.to_be_bytes());
        rec[10..14].copy_from_slice(&size.to_le_bytes());
        rec[14..18].copy_from_slice(&size.to_be_bytes());
        rec[25] = flags;
        rec[32] = name.len() as u8;
        rec[33..33 + name.len()].copy_from_slice(name);
    }

    let mut data = vec![0u8; 2048 * 24];
    data[..16].copy_from_slice(b"SEGA SEGASATURN ");

    let pvd = 16 * 2048;
    data[pvd] = 0x01;
    data[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
    data[pvd + 40..pvd + 48].copy_from_slice(b"TESTDISC");
    let mut root_rec = Vec::new();
    push_record(&mut root_rec, 20, 2048, 0x02, &[0x00]);
    data[pvd + 156..pvd + 156 + root_rec.len()].copy_from_slice(&root_rec);

    let mut root_dir = Vec::new();
    push_record(&mut root_dir, 20, 2048, 0x02, &[0x00]);
    push_record(&mut root_dir, 20, 2048, 0x02, &[0x01]);
    push_record(&mut root_dir, 22, 6, 0x00, b"DATA.BIN;1");
    push_record(&mut root_dir, 21, 2048, 0x02, b"SUB");
    data[20 * 2048..20 * 2048 + root_dir.len()].copy_from_slice(&root_dir);

    let mut sub_dir = Vec::new();
    push_record(&mut sub_dir, 21, 2048, 0x02, &[0x00]);
    push_record(&mut sub_dir, 20, 2048, 0x02, &[0x01]);
    push_record(&mut sub_dir, 23, 4, 0x00, b"INNER.DAT;1");
    data[21 * 2048..21 * 2048 + sub_dir.len()].copy_from_slice(&sub_dir);

    data[22 * 2048..22 * 2048 + 6].copy_from_slice(b"SATURN");
    data[23 * 2048..23 * 2048 + 4].copy_from_slice(b"DEEP");

    Disc::from_tracks(vec![Track::data(1, FAD_OFFSET, 2048, data)])
}

fn issue_command(saturn: &mut Saturn, cr: [u16; 4]) {
    let bus = &saturn.bus;
    bus.write16(0x580_0018, cr[0]);
    bus.write16(0x580_001C, cr[1]);
    bus.write16(0x580_0020, cr[2]);
    bus.write16(0x580_0024, cr[3]);
    bus.read16(0x580_0024);
    saturn.run_frame();
}

// ── Scheduler precision ───────────────────────────────────────

#[test]
fn scheduler_fires_exactly_once_at_the_scaled_target() {
    let sched = Scheduler::new();
    let fired = Rc::new(RefCell::new(0u32));
    let fired2 = fired.clone();
    let id = sched
        .register_event(Box::new(move |_| *fired2.borrow_mut() += 1))
        .unwrap();

    sched.set_event_count_factor(id, 2464, 3125);
    sched.schedule_from_now(id, 128);

    // 128 * 3125 / 2464 = 162 (truncating division).
    let target = 128u64 * 3125 / 2464;
    sched.advance(target - 1);
    assert_eq!(*fired.borrow(), 0);
    sched.advance(1);
    assert_eq!(*fired.borrow(), 1);
    sched.advance(10_000);
    assert_eq!(*fired.borrow(), 1, "one-shot events fire exactly once");
}

// ── SCU DMA direct transfer, channel 0 ────────────────────────

#[test]
fn scu_dma_direct_channel0_moves_low_wram_to_high_wram() {
    let saturn = saturn();
    let bus = &saturn.bus;

    // Source pattern 0x00..0x1F at 0x020'0000 (low work RAM).
    for i in 0..0x20u32 {
        bus.write8(0x020_0000 + i, i as u8);
    }

    bus.write32(0x5FE_0000, 0x020_0000); // D0R
    bus.write32(0x5FE_0004, 0x610_0000); // D0W
    bus.write32(0x5FE_0008, 0x20); // D0C = 32 bytes
    bus.write32(0x5FE_000C, 0x0000_0102); // src +4, dst +4
    bus.write32(0x5FE_0014, 0x0000_0007); // direct, immediate trigger
    bus.write32(0x5FE_0010, 0x101); // enable + start

    {
        let scu = saturn.scu.borrow();
        assert_eq!(scu.dma[0].curr_xfer_count, 0);
        assert!(!scu.dma[0].active);
        // DMA0-End is interrupt bit 11.
        assert!(scu.interrupt_status() & (1 << 11) != 0);
    }
    for i in 0..0x20u32 {
        assert_eq!(bus.read8(0x610_0000 + i), i as u8);
    }
}

// ── SCU DSP parallel operation via the host ports ─────────────

#[test]
fn scu_dsp_suppresses_conflicting_data_ram_write() {
    let saturn = saturn();
    let bus = &saturn.bus;

    // Pre-load M0 = 7 (bank 0, offset 0) and M1 = 3 (bank 1, offset 0)
    // through the data RAM ports.
    bus.write32(0x5FE_0088, 0x00);
    bus.write32(0x5FE_008C, 7);
    bus.write32(0x5FE_0088, 0x40);
    bus.write32(0x5FE_008C, 3);

    // One instruction: ALU=ADD, X: MOV M0,X; Y: MOV M1,A;
    // D1: MOV [s=9 ALU.L],[d=12 M0].
    let instr: u32 = (0b0100 << 26)
        | (0b100 << 23)
        | (0b011 << 17)
        | (1 << 14)
        | (0b11 << 12)
        | (12 << 8)
        | 9;
    bus.write32(0x5FE_0080, 0x8000); // PC = 0
    bus.write32(0x5FE_0084, instr); // program RAM[0]
    bus.write32(0x5FE_0080, 0x8000); // rewind PC
    bus.write32(0x5FE_0080, 0x0002_0000); // step one instruction

    saturn.scu.borrow_mut().advance(8);

    {
        let scu = saturn.scu.borrow();
        assert_eq!(scu.dsp.alu.low(), 3, "ALU = A(3) + P(0)");
        assert_eq!(scu.dsp.rx, 7, "X-bus loaded RX from M0");
        assert_eq!(scu.dsp.data_ram[0][0], 7, "conflicting write suppressed");
        assert_eq!(scu.dsp.ct[0], 1, "CT0 incremented by the read");
    }
}

// ── SCSP envelope boundary ────────────────────────────────────

#[test]
fn scsp_instant_attack_parks_in_decay1() {
    let mut saturn = saturn();
    {
        let mut scsp = saturn.scsp.borrow_mut();
        scsp.write_reg16(0x08, 31); // AR=31, D1R=0
        scsp.write_reg16(0x0A, 0); // DL=0, RR=0
        scsp.write_reg16(0x00, (1 << 12) | (1 << 11) | (2 << 7)); // KYONEX|KYONB|silence
    }
    saturn.run_frame();

    {
        let scsp = saturn.scsp.borrow();
        assert_eq!(scsp.slots[0].eg_level, 0, "peak reached");
        assert_eq!(scsp.slots[0].eg_state, EgState::Decay1);
    }

    // Key off: Release, level unchanged while RR=0.
    {
        let mut scsp = saturn.scsp.borrow_mut();
        scsp.write_reg16(0x00, (1 << 12) | (2 << 7));
    }
    saturn.run_frame();
    {
        let scsp = saturn.scsp.borrow();
        assert_eq!(scsp.slots[0].eg_state, EgState::Release);
        assert_eq!(scsp.slots[0].eg_level, 0);
    }
}

// ── CD filter chain ───────────────────────────────────────────

#[test]
fn cd_filter_chain_routes_in_range_sectors_and_drops_the_rest() {
    let mut saturn = saturn();
    saturn.load_disc(build_test_volume());

    // Filter 0: range [150, 200) -> partition 0, fail -> filter 1.
    issue_command(&mut saturn, [0x4000, 150, 0x0000, 50]);
    issue_command(&mut saturn, [0x4440, 0, 0x0000, 0]);
    issue_command(&mut saturn, [0x4603, 0x0001, 0x0000, 0]);
    // Filter 1: submode & 0xE0 == 0x00 plus a whole-disc range,
    // pass -> partition 1, fail disconnected.
    issue_command(&mut saturn, [0x4000, 0, 0x01FF, 0xFFFF]);
    issue_command(&mut saturn, [0x4200, 0xE000, 0x0100, 0x0000]);
    issue_command(&mut saturn, [0x4444, 0, 0x0100, 0]);
    issue_command(&mut saturn, [0x4603, 0x01FF, 0x0100, 0]);
    // Drive output -> filter 0.
    issue_command(&mut saturn, [0x3000, 0, 0x0000, 0]);

    let mut cdb = saturn.cdblock.borrow_mut();
    assert_eq!(cdb.filters[0].mode, 0x40);
    assert_eq!(cdb.filters[0].pass_output, 0);
    assert_eq!(cdb.filters[0].fail_output, 1);
    assert_eq!(cdb.filters[1].mode, 0x44);
    assert_eq!(cdb.filters[1].submode_mask, 0xE0);

    // FAD 175, submode 0x20: filter 0 passes on range -> partition 0.
    let mut sector = Buffer::default();
    sector.frame_address = 175;
    sector.size = 2048;
    sector.subheader.submode = 0x20;
    assert!(cdb.deliver_sector(sector));
    assert_eq!(cdb.partitions.buffer_count(0), 1);
    assert!(cdb.hirq() & HIRQ_CSCT != 0);

    // FAD 300, submode 0x20: filter 0 fails (range), filter 1 fails
    // (0x20 & 0xE0 == 0x20, not 0x00), disconnected -> dropped.
    let mut sector = Buffer::default();
    sector.frame_address = 300;
    sector.size = 2048;
    sector.subheader.submode = 0x20;
    assert!(cdb.deliver_sector(sector));
    assert_eq!(cdb.partitions.buffer_count(0), 1);
    assert_eq!(cdb.partitions.buffer_count(1), 0);
    assert_eq!(cdb.partitions.accounted_buffers(), NUM_BUFFERS);
}

// ── ISO-9660 directory round trip through the command layer ───

#[test]
fn change_directory_returns_to_the_prior_directory() {
    let mut saturn = saturn();
    saturn.load_disc(build_test_volume());

    let before = saturn.cdblock.borrow().current_directory_id();
    assert!(before.is_some());
    issue_command(&mut saturn, [0x7000, 0, 0x0000, 3]); // into SUB
    assert_ne!(saturn.cdblock.borrow().current_directory_id(), before);
    issue_command(&mut saturn, [0x7000, 0, 0x0000, 1]); // back via ".."
    assert_eq!(saturn.cdblock.borrow().current_directory_id(), before);
}

// ── Save-state upgrade ────────────────────────────────────────

#[test]
fn v2_state_upgrade_decompresses_slot_phase() {
    let mut saturn = saturn();
    saturn.run_frame();
    let mut state = saturn.save_state(0x600_0100);

    // Rewrite as a v2 state: 24-bit phase, stale new fields.
    state.version = 2;
    state.scsp.slots[0].curr_phase = 0x1F_0000;
    state.scsp.slots[0].next_phase = 0xDEAD;
    state.scsp.slots[0].sbctl = 3;
    state.scsp.slots[0].egbypass = true;

    saturn.load_state(&state).unwrap();
    let scsp = saturn.scsp.borrow();
    assert_eq!(scsp.slots[0].curr_phase, 0x1F_0000 >> 4);
    assert_eq!(scsp.slots[0].next_phase, 0x1F_0000 >> 4);
    assert_eq!(scsp.slots[0].sbctl, 0);
    assert!(!scsp.slots[0].eg_bypass);
}

// ── Buffer accounting invariant across frames ─────────────────

#[test]
fn partition_accounting_holds_at_frame_boundaries() {
    let mut saturn = saturn();
    saturn.load_disc(build_test_volume());

    // Connect the drive and play a handful of sectors.
    issue_command(&mut saturn, [0x3000, 0, 0x0000, 0]);
    issue_command(&mut saturn, [0x1080, FAD_OFFSET as u16, 0x0080, 8]);
    for _ in 0..10 {
        saturn.run_frame();
        let cdb = saturn.cdblock.borrow();
        assert_eq!(cdb.partitions.accounted_buffers(), NUM_BUFFERS);
    }
    assert!(saturn.cdblock.borrow().partitions.buffer_count(0) > 0);
}
