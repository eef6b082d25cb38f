//! CD block: command protocol, drive state machine, sector filtering
//! and host data transfers.
//!
//! The guest talks through four 16-bit command registers and the HIRQ
//! flag lines. The drive advances on a scheduled tick whose cadence
//! follows the read speed; each tick can deliver one sector into the
//! filter/partition engine and emits a periodic status report.

pub mod buffer;
pub mod filter;
pub mod fs;

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::bus::{Bus, HandlerSet};
use crate::clocks::ClockRatios;
use crate::media::{Disc, Subheader, SECTOR_SIZE};
use crate::sched::{EventId, Scheduler};
use buffer::{Buffer, PartitionManager, NUM_PARTITIONS};
use filter::{Filter, DISCONNECTED};

// ── HIRQ bits ─────────────────────────────────────────────────

pub const HIRQ_CMOK: u16 = 1 << 0; // ready for command
pub const HIRQ_DRDY: u16 = 1 << 1; // data ready
pub const HIRQ_CSCT: u16 = 1 << 2; // sector read
pub const HIRQ_BFUL: u16 = 1 << 3; // buffer full
pub const HIRQ_PEND: u16 = 1 << 4; // playback stopped
pub const HIRQ_DCHG: u16 = 1 << 5; // disc changed
pub const HIRQ_ESEL: u16 = 1 << 6; // selector done
pub const HIRQ_EHST: u16 = 1 << 7; // host I/O done
pub const HIRQ_ECPY: u16 = 1 << 8; // copy/move done
pub const HIRQ_EFLS: u16 = 1 << 9; // filesystem done
pub const HIRQ_SCDQ: u16 = 1 << 10; // subcode Q updated
pub const HIRQ_MPED: u16 = 1 << 11; // MPEG done
pub const HIRQ_MPCM: u16 = 1 << 12; // long-running MPEG done
pub const HIRQ_MPST: u16 = 1 << 13; // MPEG interrupt

// ── Status codes ──────────────────────────────────────────────

pub const STATUS_BUSY: u8 = 0x00;
pub const STATUS_PAUSE: u8 = 0x01;
pub const STATUS_STANDBY: u8 = 0x02;
pub const STATUS_PLAY: u8 = 0x03;
pub const STATUS_SEEK: u8 = 0x04;
pub const STATUS_SCAN: u8 = 0x05;
pub const STATUS_OPEN: u8 = 0x06;
pub const STATUS_NODISC: u8 = 0x07;
pub const STATUS_RETRY: u8 = 0x08;
pub const STATUS_ERROR: u8 = 0x09;
pub const STATUS_FATAL: u8 = 0x0A;

pub const STATUS_FLAG_PERIODIC: u8 = 0x20;
pub const STATUS_FLAG_XFER_REQUEST: u8 = 0x40;
pub const STATUS_FLAG_WAIT: u8 = 0x80;
pub const STATUS_REJECT: u8 = 0xFF;

// ── Drive timing (CD-block clock, 20 MHz) ─────────────────────

/// One sector period at 1x speed (75 sectors/second).
const DRIVE_CYCLES_1X: u64 = 266_667;
/// Tick period when not playing (~16.7 ms).
const DRIVE_CYCLES_STANDBY: u64 = 333_333;
/// Command execution latency (~50 us).
const COMMAND_CYCLES: u64 = 1000;
/// Drive ticks a seek takes before reaching the target.
const SEEK_TICKS: u32 = 3;

pub type ExternalInterrupt0Fn = Box<dyn FnMut()>;
pub type CddaSectorFn = Box<dyn FnMut(&[u8; SECTOR_SIZE])>;

#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    pub code: u8,
    pub frame_address: u32,
    pub flags: u8,
    pub repeat_count: u8,
    pub control_adr: u8,
    pub track: u8,
    pub index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferType {
    None,
    Toc,
    GetSector { delete: bool },
    PutSector,
    FileInfo,
    Subcode,
}

pub struct CdBlock {
    scheduler: Rc<Scheduler>,
    drive_event: EventId,
    command_event: EventId,

    cr: [u16; 4],
    hirq: u16,
    hirq_mask: u16,
    command_pending: bool,
    processing_command: bool,
    ready_for_periodic: bool,

    pub disc: Disc,
    fs: fs::Filesystem,

    status: Status,
    seek_ticks: u32,
    seek_to_pause: bool,

    play_start_pos: u32,
    play_end_pos: u32,
    play_max_repeat: u8,
    play_file: bool,
    buffer_full_pause: bool,
    play_end_pending: bool,
    scan_direction: bool,
    scan_counter: u8,

    read_speed: u8,
    disc_auth: u8,
    mpeg_auth: u8,

    pub partitions: PartitionManager,
    pub filters: [Filter; NUM_PARTITIONS],
    cd_device_connection: u8,
    last_cd_write_partition: u8,
    calculated_size_words: u32,

    get_sector_length: u32,
    put_sector_length: u32,

    fad_search_result: Option<(u32, u8, u16)>, // fad, partition, offset

    // ── Transfer state ──
    xfer_type: TransferType,
    xfer_pos: u32,    // words transferred so far
    xfer_length: u32, // total words
    xfer_count: u32,  // words moved in the last completed transfer
    xfer_buffer: Vec<u16>,
    xfer_buffer_pos: usize,
    xfer_sector_pos: u32,
    xfer_sector_end: u32,
    xfer_partition: u8,
    xfer_del_start: u32,
    xfer_del_count: u32,
    put_staging: Vec<u16>,
    put_frame_address: u32,

    on_external_interrupt: Option<ExternalInterrupt0Fn>,
    on_cdda: Option<CddaSectorFn>,
}

impl CdBlock {
    pub fn new(scheduler: Rc<Scheduler>) -> crate::error::CoreResult<Rc<RefCell<Self>>> {
        let cdb = Rc::new(RefCell::new(Self {
            scheduler: scheduler.clone(),
            drive_event: 0,
            command_event: 0,
            cr: [0; 4],
            hirq: 0,
            hirq_mask: 0,
            command_pending: false,
            processing_command: false,
            ready_for_periodic: false,
            disc: Disc::default(),
            fs: fs::Filesystem::new(),
            status: Status {
                code: STATUS_NODISC,
                ..Default::default()
            },
            seek_ticks: 0,
            seek_to_pause: false,
            play_start_pos: 0,
            play_end_pos: 0,
            play_max_repeat: 0,
            play_file: false,
            buffer_full_pause: false,
            play_end_pending: false,
            scan_direction: false,
            scan_counter: 0,
            read_speed: 2,
            disc_auth: 0,
            mpeg_auth: 0,
            partitions: PartitionManager::new(),
            filters: std::array::from_fn(|i| Filter::new(i as u8)),
            cd_device_connection: DISCONNECTED,
            last_cd_write_partition: DISCONNECTED,
            calculated_size_words: 0,
            get_sector_length: 2048,
            put_sector_length: 2048,
            fad_search_result: None,
            xfer_type: TransferType::None,
            xfer_pos: 0,
            xfer_length: 0,
            xfer_count: 0,
            xfer_buffer: Vec::new(),
            xfer_buffer_pos: 0,
            xfer_sector_pos: 0,
            xfer_sector_end: 0,
            xfer_partition: 0,
            xfer_del_start: 0,
            xfer_del_count: 0,
            put_staging: Vec::new(),
            put_frame_address: 0,
            on_external_interrupt: None,
            on_cdda: None,
        }));

        let drive_cdb = cdb.clone();
        let drive_event = scheduler.register_event(Box::new(move |ctx| {
            let period = drive_cdb.borrow_mut().on_drive_tick();
            ctx.reschedule(period);
        }))?;
        let cmd_cdb = cdb.clone();
        let command_event = scheduler.register_event(Box::new(move |_ctx| {
            cmd_cdb.borrow_mut().process_command();
        }))?;
        {
            let mut cdb = cdb.borrow_mut();
            cdb.drive_event = drive_event;
            cdb.command_event = command_event;
        }
        Ok(cdb)
    }

    pub fn set_external_interrupt_callback(&mut self, callback: ExternalInterrupt0Fn) {
        self.on_external_interrupt = Some(callback);
    }

    pub fn set_cdda_callback(&mut self, callback: CddaSectorFn) {
        self.on_cdda = Some(callback);
    }

    pub fn reset(&mut self, hard: bool) {
        self.cr = [0; 4];
        self.hirq = HIRQ_CMOK;
        self.hirq_mask = 0;
        self.command_pending = false;
        self.processing_command = false;
        self.ready_for_periodic = false;
        self.status = Status {
            code: if self.disc.is_empty() {
                STATUS_NODISC
            } else {
                STATUS_PAUSE
            },
            frame_address: crate::media::FAD_OFFSET,
            ..Default::default()
        };
        self.seek_ticks = 0;
        self.play_end_pending = false;
        self.buffer_full_pause = false;
        self.play_file = false;
        if hard {
            self.read_speed = 2;
            self.disc_auth = 0;
        }
        self.partitions.reset();
        for f in &mut self.filters {
            f.reset();
        }
        self.cd_device_connection = DISCONNECTED;
        self.last_cd_write_partition = DISCONNECTED;
        self.get_sector_length = 2048;
        self.put_sector_length = 2048;
        self.end_transfer_state();
        self.xfer_count = 0;
    }

    /// Start the drive tick. Called once by the facade after wiring.
    pub fn start(&self, scheduler: &Scheduler) {
        scheduler.schedule_from_now(self.drive_event, DRIVE_CYCLES_STANDBY);
    }

    pub fn update_clock_ratios(&self, scheduler: &Scheduler, ratios: &ClockRatios) {
        scheduler.set_event_count_factor(
            self.drive_event,
            ratios.cd_block_num,
            ratios.cd_block_den,
        );
        scheduler.set_event_count_factor(
            self.command_event,
            ratios.cd_block_num,
            ratios.cd_block_den,
        );
    }

    // ── Disc management ────────────────────────────────────────

    pub fn load_disc(&mut self, disc: Disc) {
        self.disc = disc;
        self.fs.mount(&self.disc);
        self.disc_auth = 0;
        self.status.code = STATUS_PAUSE;
        self.status.frame_address = crate::media::FAD_OFFSET;
        self.set_hirq(HIRQ_DCHG);
        debug!("CD block: disc loaded ({} tracks)", self.disc.tracks.len());
    }

    pub fn eject_disc(&mut self) {
        self.disc = Disc::default();
        self.fs.clear();
        self.disc_auth = 0;
        self.status.code = STATUS_NODISC;
        self.set_hirq(HIRQ_DCHG);
    }

    pub fn open_tray(&mut self) {
        self.status.code = STATUS_OPEN;
        self.set_hirq(HIRQ_DCHG);
    }

    pub fn close_tray(&mut self) {
        self.status.code = if self.disc.is_empty() {
            STATUS_NODISC
        } else {
            STATUS_PAUSE
        };
    }

    pub fn is_tray_open(&self) -> bool {
        self.status.code == STATUS_OPEN
    }

    pub fn disc_hash(&self) -> [u8; 16] {
        self.disc.hash()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn hirq(&self) -> u16 {
        self.hirq
    }

    // ── Interrupts ─────────────────────────────────────────────

    fn set_hirq(&mut self, bits: u16) {
        self.hirq |= bits;
        self.update_interrupts();
    }

    fn update_interrupts(&mut self) {
        if self.hirq & self.hirq_mask != 0 {
            if let Some(cb) = self.on_external_interrupt.as_mut() {
                cb();
            }
        }
    }

    // ── Drive state machine ────────────────────────────────────

    /// One drive tick. Returns the period until the next tick, in
    /// CD-block cycles.
    fn on_drive_tick(&mut self) -> u64 {
        match self.status.code {
            STATUS_PLAY => self.drive_tick_play(false),
            STATUS_SCAN => self.drive_tick_play(true),
            STATUS_SEEK => {
                self.seek_ticks = self.seek_ticks.saturating_sub(1);
                if self.seek_ticks == 0 {
                    self.status.code = if self.seek_to_pause {
                        STATUS_PAUSE
                    } else {
                        STATUS_PLAY
                    };
                }
            }
            _ => {}
        }

        // Periodic status report.
        if self.ready_for_periodic && !self.processing_command {
            self.report_status(true);
            self.set_hirq(HIRQ_SCDQ);
        }

        match self.status.code {
            STATUS_PLAY | STATUS_SCAN => DRIVE_CYCLES_1X / self.read_speed as u64,
            _ => DRIVE_CYCLES_STANDBY,
        }
    }

    fn drive_tick_play(&mut self, scan: bool) {
        if self.play_end_pending {
            self.play_end_pending = false;
            self.status.code = STATUS_PAUSE;
            self.set_hirq(HIRQ_PEND);
            return;
        }

        // Buffer-full pause: resume on the first tick that sees a free
        // buffer.
        if self.buffer_full_pause {
            if self.partitions.free_buffer_count() == 0 {
                return;
            }
            self.buffer_full_pause = false;
        }

        let fad = self.status.frame_address;
        let Some(track) = self.disc.find_track(fad) else {
            self.status.code = STATUS_ERROR;
            return;
        };
        self.status.track = track.number;
        self.status.index = track.find_index(fad);
        self.status.control_adr = track.control_adr;
        self.status.flags = if track.is_audio() { 0 } else { 0x80 };

        let mut sector = [0u8; SECTOR_SIZE];
        if !track.read_sector(fad, &mut sector) {
            self.status.code = STATUS_ERROR;
            return;
        }

        if track.is_audio() {
            if let Some(cb) = self.on_cdda.as_mut() {
                cb(&sector);
            }
            self.set_hirq(HIRQ_CSCT);
        } else {
            let buf = Buffer {
                data: sector,
                size: self.get_sector_length as u16,
                frame_address: fad,
                mode2: track.mode2,
                subheader: Subheader::parse(&sector),
            };
            if !self.deliver_sector(buf) {
                // Pool exhausted: pause without consuming the sector.
                return;
            }
        }

        // Advance the head; scans skip ahead on a cadence.
        let step: i64 = if scan {
            self.scan_counter = self.scan_counter.wrapping_add(1);
            let skip = if self.scan_counter % 4 == 0 { 25 } else { 1 };
            if self.scan_direction {
                -skip
            } else {
                skip
            }
        } else {
            1
        };
        let next = (fad as i64 + step).max(0) as u32;
        self.status.frame_address = next;

        if next > self.play_end_pos {
            if self.status.repeat_count < self.play_max_repeat {
                self.status.repeat_count += 1;
                self.status.frame_address = self.play_start_pos;
            } else {
                self.play_end_pending = true;
            }
        }
    }

    /// Identifier of the filesystem's current directory.
    pub fn current_directory_id(&self) -> Option<u32> {
        self.fs.current_directory_id()
    }

    /// Route a sector through the filter chain, as the drive (or an
    /// external streaming device) would. Returns false when the buffer
    /// pool was exhausted (buffer-full pause entered).
    pub fn deliver_sector(&mut self, buf: Buffer) -> bool {
        let mut filter_index = self.cd_device_connection;
        let mut hops = 0;
        while filter_index != DISCONNECTED {
            if hops >= NUM_PARTITIONS {
                debug!("CD block: filter chain cycle, sector dropped");
                return true;
            }
            let f = &self.filters[filter_index as usize];
            if f.test(&buf) {
                let partition = f.pass_output;
                if partition == DISCONNECTED {
                    return true; // pass to nowhere: dropped
                }
                if !self.partitions.insert_head(partition as usize, buf) {
                    self.buffer_full_pause = true;
                    self.set_hirq(HIRQ_BFUL);
                    return false;
                }
                self.last_cd_write_partition = partition;
                self.set_hirq(HIRQ_CSCT);
                if self.partitions.free_buffer_count() == 0 {
                    self.set_hirq(HIRQ_BFUL);
                }
                return true;
            }
            filter_index = f.fail_output;
            hops += 1;
        }
        true // disconnected: dropped
    }

    // ── Status reports ─────────────────────────────────────────

    fn status_code(&self) -> u8 {
        if self.play_end_pending {
            STATUS_PAUSE
        } else {
            self.status.code
        }
    }

    fn report_status(&mut self, periodic: bool) {
        let mut code = self.status_code();
        if periodic {
            code |= STATUS_FLAG_PERIODIC;
        }
        self.cr[0] = ((code as u16) << 8)
            | ((self.status.flags & 0x80) as u16)
            | (self.status.repeat_count & 0xF) as u16;
        self.cr[1] = ((self.status.control_adr as u16) << 8) | self.status.track as u16;
        self.cr[2] =
            ((self.status.index as u16) << 8) | ((self.status.frame_address >> 16) & 0xFF) as u16;
        self.cr[3] = self.status.frame_address as u16;
    }

    fn report_reject(&mut self) {
        self.cr[0] = (STATUS_REJECT as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = 0;
        self.cr[3] = 0;
    }

    // ── Register interface ─────────────────────────────────────

    pub fn read_reg16(&mut self, address: u32, peek: bool) -> u16 {
        let offset = address & 0xF_FFFF;
        if offset == 0x9_8000 {
            return if peek {
                self.peek_data_port()
            } else {
                self.read_data_port()
            };
        }
        match offset & 0x3F {
            0x08 => self.hirq,
            0x0C => self.hirq_mask,
            0x18 => self.cr[0],
            0x1C => self.cr[1],
            0x20 => self.cr[2],
            0x24 => {
                let value = self.cr[3];
                if !peek {
                    self.on_cr4_read();
                }
                value
            }
            _ => 0,
        }
    }

    pub fn write_reg16(&mut self, address: u32, value: u16, poke: bool) {
        let offset = address & 0xF_FFFF;
        if offset == 0x9_8000 {
            if !poke {
                self.write_data_port(value);
            }
            return;
        }
        match offset & 0x3F {
            0x08 => {
                // Writing acknowledges (clears) HIRQ bits.
                self.hirq &= value;
            }
            0x0C => {
                self.hirq_mask = value;
                if !poke {
                    self.update_interrupts();
                }
            }
            0x18 => self.cr[0] = value,
            0x1C => self.cr[1] = value,
            0x20 => self.cr[2] = value,
            0x24 => {
                self.cr[3] = value;
                if !poke {
                    // A full CR1-4 write marks a command pending; the
                    // guest's CR4 read strobes execution.
                    self.command_pending = true;
                    self.processing_command = true;
                    self.hirq &= !HIRQ_CMOK;
                }
            }
            _ => {}
        }
    }

    fn on_cr4_read(&mut self) {
        if self.command_pending {
            self.command_pending = false;
            self.scheduler
                .schedule_from_now(self.command_event, COMMAND_CYCLES);
        } else {
            self.processing_command = false;
            self.ready_for_periodic = true;
        }
    }

    // ── Command dispatch ───────────────────────────────────────

    fn process_command(&mut self) {
        let command = (self.cr[0] >> 8) as u8;
        trace!(
            "CD block: command {command:02X} ({:04X} {:04X} {:04X} {:04X})",
            self.cr[0],
            self.cr[1],
            self.cr[2],
            self.cr[3]
        );
        match command {
            0x00 => self.cmd_get_status(),
            0x01 => self.cmd_get_hardware_info(),
            0x02 => self.cmd_get_toc(),
            0x03 => self.cmd_get_session_info(),
            0x04 => self.cmd_initialize_cd_system(),
            0x05 => self.cmd_open_tray(),
            0x06 => self.cmd_end_data_transfer(),
            0x10 => self.cmd_play_disc(),
            0x11 => self.cmd_seek_disc(),
            0x12 => self.cmd_scan_disc(),
            0x20 => self.cmd_get_subcode(),
            0x30 => self.cmd_set_cd_device_connection(),
            0x31 => self.cmd_get_cd_device_connection(),
            0x32 => self.cmd_get_last_buffer_dest(),
            0x40 => self.cmd_set_filter_range(),
            0x41 => self.cmd_get_filter_range(),
            0x42 => self.cmd_set_filter_subheader_conditions(),
            0x43 => self.cmd_get_filter_subheader_conditions(),
            0x44 => self.cmd_set_filter_mode(),
            0x45 => self.cmd_get_filter_mode(),
            0x46 => self.cmd_set_filter_connection(),
            0x47 => self.cmd_get_filter_connection(),
            0x48 => self.cmd_reset_selector(),
            0x50 => self.cmd_get_buffer_size(),
            0x51 => self.cmd_get_sector_number(),
            0x52 => self.cmd_calculate_actual_size(),
            0x53 => self.cmd_get_actual_size(),
            0x54 => self.cmd_get_sector_info(),
            0x55 => self.cmd_execute_fad_search(),
            0x56 => self.cmd_get_fad_search_results(),
            0x60 => self.cmd_set_sector_length(),
            0x61 => self.cmd_get_sector_data(false),
            0x62 => self.cmd_delete_sector_data(),
            0x63 => self.cmd_get_sector_data(true),
            0x64 => self.cmd_put_sector_data(),
            0x65 => self.cmd_copy_or_move_sector_data(false),
            0x66 => self.cmd_copy_or_move_sector_data(true),
            0x67 => self.cmd_get_copy_error(),
            0x70 => self.cmd_change_directory(),
            0x71 => self.cmd_read_directory(),
            0x72 => self.cmd_get_file_system_scope(),
            0x73 => self.cmd_get_file_info(),
            0x74 => self.cmd_read_file(),
            0x75 => self.cmd_abort_file(),
            0x90..=0xAF => self.cmd_mpeg(command),
            0xE0 => self.cmd_authenticate_device(),
            0xE1 => self.cmd_is_device_authenticated(),
            0xE2 => self.cmd_get_mpeg_rom(),
            _ => {
                debug!("CD block: unknown command {command:02X}");
                self.report_reject();
            }
        }
        self.set_hirq(HIRQ_CMOK);
    }

    // ── General operations ─────────────────────────────────────

    fn cmd_get_status(&mut self) {
        self.report_status(false);
    }

    fn cmd_get_hardware_info(&mut self) {
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = 0x0002; // hardware flag / version
        self.cr[2] = 0x0000; // MPEG absent
        self.cr[3] = 0x0400; // drive version
    }

    fn cmd_get_toc(&mut self) {
        let toc = self.disc.build_toc();
        self.xfer_buffer.clear();
        for entry in toc {
            self.xfer_buffer.push((entry >> 16) as u16);
            self.xfer_buffer.push(entry as u16);
        }
        self.xfer_type = TransferType::Toc;
        self.xfer_pos = 0;
        self.xfer_length = self.xfer_buffer.len() as u32;
        self.xfer_buffer_pos = 0;

        self.cr[0] = ((self.status_code() | STATUS_FLAG_XFER_REQUEST) as u16) << 8;
        self.cr[1] = self.xfer_length as u16;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.set_hirq(HIRQ_DRDY);
    }

    fn cmd_get_session_info(&mut self) {
        let session_number = (self.cr[0] & 0xFF) as usize;
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = 0;
        match self.disc.sessions.get(session_number.saturating_sub(1)) {
            Some(session) if session_number > 0 => {
                self.cr[2] = ((session.start_fad >> 16) & 0xFF) as u16 | 0x0100;
                self.cr[3] = session.start_fad as u16;
            }
            _ => {
                // Session 0: whole-disc info (session count + leadout).
                let leadout = self.disc.leadout_fad();
                self.cr[2] = (((self.disc.sessions.len() as u32) << 8)
                    | ((leadout >> 16) & 0xFF)) as u16;
                self.cr[3] = leadout as u16;
            }
        }
    }

    fn cmd_initialize_cd_system(&mut self) {
        let flags = (self.cr[0] & 0xFF) as u8;
        // bit 0: software reset; bit 4: change read speed to 1x
        self.read_speed = if flags & 0x10 != 0 { 1 } else { 2 };
        if flags & 0x01 != 0 {
            self.status.frame_address = crate::media::FAD_OFFSET;
            self.status.code = if self.disc.is_empty() {
                STATUS_NODISC
            } else {
                STATUS_PAUSE
            };
            self.status.repeat_count = 0;
            self.play_end_pending = false;
            self.buffer_full_pause = false;
        }
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_open_tray(&mut self) {
        self.open_tray();
        self.report_status(false);
    }

    fn cmd_end_data_transfer(&mut self) {
        let count = self.xfer_count;
        self.finalize_transfer();
        self.cr[0] = ((self.status_code() as u16) << 8) | ((count >> 16) & 0xFF) as u16;
        self.cr[1] = count as u16;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.hirq &= !HIRQ_DRDY;
    }

    // ── Playback ───────────────────────────────────────────────

    fn play_position(&self, param: u32) -> Option<u32> {
        if param == 0xFF_FFFF {
            // Keep the current position.
            Some(self.status.frame_address)
        } else if param & 0x80_0000 != 0 {
            Some(param & 0x7F_FFFF)
        } else if param == 0 {
            None
        } else {
            // Track[/index] addressing.
            let track_number = (param >> 8) as u8;
            self.disc
                .tracks
                .iter()
                .find(|t| t.number == track_number)
                .map(|t| t.start_fad)
        }
    }

    fn cmd_play_disc(&mut self) {
        if self.disc.is_empty() {
            self.report_reject();
            return;
        }
        let start_param = (((self.cr[0] & 0xFF) as u32) << 16) | self.cr[1] as u32;
        let end_param = (((self.cr[2] & 0xFF) as u32) << 16) | self.cr[3] as u32;
        let repeat_param = ((self.cr[2] >> 8) & 0xF) as u8;

        let start = self
            .play_position(start_param)
            .unwrap_or(crate::media::FAD_OFFSET);
        let end = match end_param {
            0 => self.disc.leadout_fad() - 1,
            0xFF_FFFF => self.play_end_pos,
            // FAD form carries a sector count.
            p if p & 0x80_0000 != 0 => start + (p & 0x7F_FFFF).max(1) - 1,
            p => self
                .disc
                .tracks
                .iter()
                .find(|t| t.number == (p >> 8) as u8)
                .map(|t| t.end_fad)
                .unwrap_or(self.disc.leadout_fad() - 1),
        };

        self.play_start_pos = start;
        self.play_end_pos = end;
        self.play_max_repeat = if repeat_param == 0xF { 0xFF } else { repeat_param };
        self.play_file = false;
        self.play_end_pending = false;
        self.status.repeat_count = 0;

        self.seek_to_pause = false;
        self.seek_ticks = SEEK_TICKS;
        self.status.code = STATUS_SEEK;
        self.status.frame_address = start;
        trace!("CD block: play {start:06X}..{end:06X} repeat {repeat_param}");

        self.report_status(false);
    }

    fn cmd_seek_disc(&mut self) {
        let param = (((self.cr[0] & 0xFF) as u32) << 16) | self.cr[1] as u32;
        match self.play_position(param) {
            Some(target) => {
                self.seek_to_pause = true;
                self.seek_ticks = SEEK_TICKS;
                self.status.code = STATUS_SEEK;
                self.status.frame_address = target;
            }
            None => {
                // Seek to nothing: stop the drive.
                self.status.code = STATUS_PAUSE;
            }
        }
        self.report_status(false);
    }

    fn cmd_scan_disc(&mut self) {
        if self.disc.is_empty() {
            self.report_reject();
            return;
        }
        self.scan_direction = self.cr[0] & 1 != 0;
        self.scan_counter = 0;
        self.play_end_pos = self.disc.leadout_fad() - 1;
        self.play_max_repeat = 0;
        self.status.code = STATUS_SCAN;
        self.report_status(false);
    }

    // ── Subcode ────────────────────────────────────────────────

    fn cmd_get_subcode(&mut self) {
        let kind = (self.cr[0] & 0xFF) as u8;
        self.xfer_buffer.clear();
        match kind {
            0 => {
                // Subcode Q: position data packed into 5 words.
                let fad = self.status.frame_address;
                let (m, s, f) = crate::media::fad_to_msf(fad);
                self.xfer_buffer.push(
                    ((self.status.control_adr as u16) << 8) | self.status.track as u16,
                );
                self.xfer_buffer.push((self.status.index as u16) << 8 | m as u16);
                self.xfer_buffer.push(((s as u16) << 8) | f as u16);
                self.xfer_buffer.push(((fad >> 16) & 0xFF) as u16);
                self.xfer_buffer.push(fad as u16);
            }
            _ => {
                // Subcode R-W: not recorded on our media model.
                self.xfer_buffer.resize(12, 0);
            }
        }
        self.xfer_type = TransferType::Subcode;
        self.xfer_pos = 0;
        self.xfer_length = self.xfer_buffer.len() as u32;
        self.xfer_buffer_pos = 0;
        self.cr[0] = ((self.status_code() | STATUS_FLAG_XFER_REQUEST) as u16) << 8;
        self.cr[1] = self.xfer_length as u16;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.set_hirq(HIRQ_DRDY);
    }

    // ── Device connection ──────────────────────────────────────

    fn cmd_set_cd_device_connection(&mut self) {
        let filter_number = (self.cr[2] >> 8) as u8;
        self.cd_device_connection = if filter_number as usize >= NUM_PARTITIONS {
            DISCONNECTED
        } else {
            filter_number
        };
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_cd_device_connection(&mut self) {
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = (self.cd_device_connection as u16) << 8;
        self.cr[3] = 0;
    }

    fn cmd_get_last_buffer_dest(&mut self) {
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = (self.last_cd_write_partition as u16) << 8;
        self.cr[3] = 0;
    }

    // ── Filters ────────────────────────────────────────────────

    fn filter_arg(&self) -> usize {
        ((self.cr[2] >> 8) as usize).min(NUM_PARTITIONS - 1)
    }

    fn cmd_set_filter_range(&mut self) {
        let index = self.filter_arg();
        let f = &mut self.filters[index];
        f.start_frame_address = (((self.cr[0] & 0xFF) as u32) << 16) | self.cr[1] as u32;
        f.frame_address_count = (((self.cr[2] & 0xFF) as u32) << 16) | self.cr[3] as u32;
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_filter_range(&mut self) {
        let f = &self.filters[self.filter_arg()];
        let (start, count) = (f.start_frame_address, f.frame_address_count);
        self.cr[0] = ((self.status_code() as u16) << 8) | ((start >> 16) & 0xFF) as u16;
        self.cr[1] = start as u16;
        self.cr[2] = ((self.filter_arg() as u16) << 8) | ((count >> 16) & 0xFF) as u16;
        self.cr[3] = count as u16;
    }

    fn cmd_set_filter_subheader_conditions(&mut self) {
        let index = self.filter_arg();
        let f = &mut self.filters[index];
        f.chan_num = (self.cr[0] & 0xFF) as u8;
        f.submode_mask = (self.cr[1] >> 8) as u8;
        f.coding_info_mask = (self.cr[1] & 0xFF) as u8;
        f.file_num = (self.cr[2] & 0xFF) as u8;
        f.submode_value = (self.cr[3] >> 8) as u8;
        f.coding_info_value = (self.cr[3] & 0xFF) as u8;
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_filter_subheader_conditions(&mut self) {
        let f = &self.filters[self.filter_arg()];
        self.cr[0] = ((self.status_code() as u16) << 8) | f.chan_num as u16;
        self.cr[1] = ((f.submode_mask as u16) << 8) | f.coding_info_mask as u16;
        self.cr[2] = ((f.index as u16) << 8) | f.file_num as u16;
        self.cr[3] = ((f.submode_value as u16) << 8) | f.coding_info_value as u16;
    }

    fn cmd_set_filter_mode(&mut self) {
        let index = self.filter_arg();
        let mode = (self.cr[0] & 0xFF) as u8;
        let f = &mut self.filters[index];
        if mode & 0x80 != 0 {
            f.reset_conditions();
        } else {
            f.mode = mode;
        }
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_filter_mode(&mut self) {
        let f = &self.filters[self.filter_arg()];
        self.cr[0] = ((self.status_code() as u16) << 8) | f.mode as u16;
        self.cr[1] = 0;
        self.cr[2] = (f.index as u16) << 8;
        self.cr[3] = 0;
    }

    fn cmd_set_filter_connection(&mut self) {
        let index = self.filter_arg();
        let flags = (self.cr[0] & 0xFF) as u8;
        let f = &mut self.filters[index];
        if flags & 0x01 != 0 {
            f.pass_output = (self.cr[1] >> 8) as u8;
        }
        if flags & 0x02 != 0 {
            f.fail_output = (self.cr[1] & 0xFF) as u8;
        }
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_filter_connection(&mut self) {
        let f = &self.filters[self.filter_arg()];
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = ((f.pass_output as u16) << 8) | f.fail_output as u16;
        self.cr[2] = (f.index as u16) << 8;
        self.cr[3] = 0;
    }

    fn cmd_reset_selector(&mut self) {
        let flags = (self.cr[0] & 0xFF) as u8;
        if flags == 0 {
            // Clear one partition's data.
            let partition = (self.cr[2] >> 8) as usize;
            if partition < NUM_PARTITIONS {
                self.partitions.clear(partition);
            }
        } else {
            if flags & 0x04 != 0 {
                self.partitions.reset();
            }
            if flags & 0x10 != 0 {
                for f in &mut self.filters {
                    f.reset_conditions();
                }
            }
            if flags & 0x40 != 0 {
                for f in &mut self.filters {
                    f.pass_output = f.index;
                }
            }
            if flags & 0x80 != 0 {
                for f in &mut self.filters {
                    f.fail_output = DISCONNECTED;
                }
            }
            if flags & 0x20 != 0 {
                self.cd_device_connection = DISCONNECTED;
            }
        }
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    // ── Buffer queries ─────────────────────────────────────────

    fn cmd_get_buffer_size(&mut self) {
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = self.partitions.free_buffer_count() as u16;
        self.cr[2] = (NUM_PARTITIONS as u16) << 8;
        self.cr[3] = buffer::NUM_BUFFERS as u16;
    }

    fn cmd_get_sector_number(&mut self) {
        let partition = (self.cr[2] >> 8) as usize;
        let count = if partition < NUM_PARTITIONS {
            self.partitions.buffer_count(partition)
        } else {
            0
        };
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = 0;
        self.cr[3] = count as u16;
    }

    fn cmd_calculate_actual_size(&mut self) {
        let pos = self.cr[1] as usize;
        let partition = (self.cr[2] >> 8) as usize;
        let count = self.cr[3] as usize;
        let bytes = if partition < NUM_PARTITIONS {
            self.partitions.calculate_size(partition, pos, count)
        } else {
            0
        };
        self.calculated_size_words = (bytes / 2) as u32;
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_actual_size(&mut self) {
        self.cr[0] =
            ((self.status_code() as u16) << 8) | ((self.calculated_size_words >> 16) & 0xFF) as u16;
        self.cr[1] = self.calculated_size_words as u16;
        self.cr[2] = 0;
        self.cr[3] = 0;
    }

    fn cmd_get_sector_info(&mut self) {
        let sector = (self.cr[1] & 0xFF) as usize;
        let partition = (self.cr[2] >> 8) as usize;
        match self.partitions.tail(partition.min(NUM_PARTITIONS - 1), sector) {
            Some(buf) => {
                let fad = buf.frame_address;
                self.cr[0] = ((self.status_code() as u16) << 8) | ((fad >> 16) & 0xFF) as u16;
                self.cr[1] = fad as u16;
                self.cr[2] = ((buf.subheader.file_num as u16) << 8) | buf.subheader.chan_num as u16;
                self.cr[3] =
                    ((buf.subheader.submode as u16) << 8) | buf.subheader.coding_info as u16;
            }
            None => self.report_reject(),
        }
    }

    fn cmd_execute_fad_search(&mut self) {
        let pos = self.cr[1];
        let partition = (self.cr[2] >> 8) as usize;
        let fad = (((self.cr[2] & 0xFF) as u32) << 16) | self.cr[3] as u32;

        self.fad_search_result = None;
        if partition < NUM_PARTITIONS {
            let mut offset = pos as usize;
            while let Some(buf) = self.partitions.tail(partition, offset) {
                if buf.frame_address >= fad {
                    self.fad_search_result =
                        Some((buf.frame_address, partition as u8, offset as u16));
                    break;
                }
                offset += 1;
            }
        }
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    fn cmd_get_fad_search_results(&mut self) {
        match self.fad_search_result {
            Some((fad, partition, offset)) => {
                self.cr[0] = (self.status_code() as u16) << 8;
                self.cr[1] = offset;
                self.cr[2] = ((partition as u16) << 8) | ((fad >> 16) & 0xFF) as u16;
                self.cr[3] = fad as u16;
            }
            None => self.report_reject(),
        }
    }

    // ── Sector I/O ─────────────────────────────────────────────

    fn sector_length(code: u16) -> u32 {
        match code & 3 {
            0 => 2048,
            1 => 2336,
            2 => 2340,
            _ => 2352,
        }
    }

    fn cmd_set_sector_length(&mut self) {
        self.get_sector_length = Self::sector_length(self.cr[0] & 0xFF);
        self.put_sector_length = Self::sector_length(self.cr[1] >> 8);
        self.report_status(false);
        self.set_hirq(HIRQ_ESEL);
    }

    /// Offset of the first byte of a get-length window within a raw
    /// sector (shorter reads drop sync/header bytes from the front).
    fn get_data_offset(&self, mode2: bool) -> usize {
        match self.get_sector_length {
            2048 => {
                if mode2 {
                    24
                } else {
                    16
                }
            }
            2336 => 16,
            2340 => 12,
            _ => 0,
        }
    }

    fn cmd_get_sector_data(&mut self, delete: bool) {
        let pos = self.cr[1] as u32;
        let partition = (self.cr[2] >> 8) as u8;
        let mut count = self.cr[3] as u32;
        if partition as usize >= NUM_PARTITIONS {
            self.report_reject();
            return;
        }
        let available = self.partitions.buffer_count(partition as usize) as u32;
        if count == 0xFFFF {
            count = available.saturating_sub(pos);
        }
        if pos + count > available || count == 0 {
            self.report_reject();
            return;
        }

        self.xfer_type = TransferType::GetSector { delete };
        self.xfer_partition = partition;
        self.xfer_sector_pos = pos;
        self.xfer_sector_end = pos + count;
        self.xfer_pos = 0;
        self.xfer_length = count * self.get_sector_length / 2;
        self.xfer_del_start = pos;
        self.xfer_del_count = if delete { count } else { 0 };
        self.load_sector_into_xfer_buffer();

        self.cr[0] = ((self.status_code() | STATUS_FLAG_XFER_REQUEST) as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.set_hirq(HIRQ_DRDY | HIRQ_EHST);
    }

    fn cmd_delete_sector_data(&mut self) {
        let pos = self.cr[1] as u32;
        let partition = (self.cr[2] >> 8) as usize;
        let mut count = self.cr[3] as u32;
        if partition >= NUM_PARTITIONS {
            self.report_reject();
            return;
        }
        if count == 0xFFFF {
            count = (self.partitions.buffer_count(partition) as u32).saturating_sub(pos);
        }
        self.partitions
            .delete_sectors(partition, pos as usize, count as usize);
        if self.partitions.free_buffer_count() > 0 {
            self.hirq &= !HIRQ_BFUL;
        }
        self.report_status(false);
        self.set_hirq(HIRQ_EHST);
    }

    fn cmd_put_sector_data(&mut self) {
        let partition = (self.cr[2] >> 8) as u8;
        let count = self.cr[3] as u32;
        if partition as usize >= NUM_PARTITIONS
            || !self.partitions.reserve_buffers(count as usize)
        {
            self.report_reject();
            return;
        }
        self.xfer_type = TransferType::PutSector;
        self.xfer_partition = partition;
        self.xfer_pos = 0;
        self.xfer_length = count * self.put_sector_length / 2;
        self.put_staging.clear();
        self.put_frame_address = 0;

        self.cr[0] = ((self.status_code() | STATUS_FLAG_XFER_REQUEST) as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.set_hirq(HIRQ_DRDY | HIRQ_EHST);
    }

    fn cmd_copy_or_move_sector_data(&mut self, mv: bool) {
        let dst_filter = (self.cr[0] & 0xFF) as usize;
        let pos = self.cr[1] as usize;
        let src_partition = (self.cr[2] >> 8) as usize;
        let count = self.cr[3] as usize;
        if dst_filter >= NUM_PARTITIONS || src_partition >= NUM_PARTITIONS {
            self.report_reject();
            return;
        }

        let mut copied = Vec::new();
        for i in 0..count {
            match self.partitions.tail(src_partition, pos + i) {
                Some(buf) => copied.push(buf.clone()),
                None => break,
            }
        }
        if mv {
            self.partitions
                .delete_sectors(src_partition, pos, copied.len());
        }
        let target = self.filters[dst_filter].pass_output;
        for buf in copied {
            if target != DISCONNECTED && self.filters[dst_filter].test(&buf) {
                if !self.partitions.insert_head(target as usize, buf) {
                    self.set_hirq(HIRQ_BFUL);
                    break;
                }
            }
        }
        self.report_status(false);
        self.set_hirq(HIRQ_ECPY);
    }

    fn cmd_get_copy_error(&mut self) {
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = 0;
        self.cr[3] = 0;
    }

    // ── Filesystem ─────────────────────────────────────────────

    fn file_id_arg(&self) -> u32 {
        (((self.cr[2] & 0xFF) as u32) << 16) | self.cr[3] as u32
    }

    fn cmd_change_directory(&mut self) {
        let id = self.file_id_arg();
        let ok = {
            let disc = std::mem::take(&mut self.disc);
            let ok = self.fs.change_directory(&disc, id);
            self.disc = disc;
            ok
        };
        if ok {
            self.report_status(false);
        } else {
            self.report_reject();
        }
        self.set_hirq(HIRQ_EFLS);
    }

    fn cmd_read_directory(&mut self) {
        let id = self.file_id_arg();
        let ok = {
            let disc = std::mem::take(&mut self.disc);
            let ok = self.fs.read_directory(&disc, id);
            self.disc = disc;
            ok
        };
        if ok {
            self.report_status(false);
        } else {
            self.report_reject();
        }
        self.set_hirq(HIRQ_EFLS);
    }

    fn cmd_get_file_system_scope(&mut self) {
        if !self.fs.is_mounted() {
            self.report_reject();
            self.set_hirq(HIRQ_EFLS);
            return;
        }
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = self.fs.entry_count() as u16;
        self.cr[2] = 0x0100; // directory view is complete
        self.cr[3] = 2; // first file identifier
        self.set_hirq(HIRQ_EFLS);
    }

    fn cmd_get_file_info(&mut self) {
        let id = self.file_id_arg();
        self.xfer_buffer.clear();

        let mut push_info = |buf: &mut Vec<u16>, info: &fs::FileInfo| {
            buf.push(((info.frame_address >> 16) & 0xFFFF) as u16);
            buf.push(info.frame_address as u16);
            buf.push((info.size >> 16) as u16);
            buf.push(info.size as u16);
            buf.push(((info.unit_size as u16) << 8) | info.interleave_gap as u16);
            buf.push(((info.file_number as u16) << 8) | info.attributes as u16);
        };

        if id == fs::ROOT_DIRECTORY_ID {
            // All entries of the current directory view.
            for file_id in 0..self.fs.entry_count() as u32 {
                if let Some(info) = self.fs.file_info(file_id) {
                    let mut buf = std::mem::take(&mut self.xfer_buffer);
                    push_info(&mut buf, &info);
                    self.xfer_buffer = buf;
                }
            }
        } else {
            match self.fs.file_info(id) {
                Some(info) => {
                    let mut buf = std::mem::take(&mut self.xfer_buffer);
                    push_info(&mut buf, &info);
                    self.xfer_buffer = buf;
                }
                None => {
                    self.report_reject();
                    self.set_hirq(HIRQ_EFLS);
                    return;
                }
            }
        }

        self.xfer_type = TransferType::FileInfo;
        self.xfer_pos = 0;
        self.xfer_length = self.xfer_buffer.len() as u32;
        self.xfer_buffer_pos = 0;
        self.cr[0] = ((self.status_code() | STATUS_FLAG_XFER_REQUEST) as u16) << 8;
        self.cr[1] = self.xfer_length as u16;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.set_hirq(HIRQ_DRDY | HIRQ_EFLS);
    }

    fn cmd_read_file(&mut self) {
        let offset = (((self.cr[0] & 0xFF) as u32) << 16) | self.cr[1] as u32;
        let filter = (self.cr[2] >> 8) as u8;
        let id = (((self.cr[2] & 0xFF) as u32) << 16) | self.cr[3] as u32;

        let Some(info) = self.fs.file_info(id) else {
            self.report_reject();
            self.set_hirq(HIRQ_EFLS);
            return;
        };
        let start = info.frame_address + offset;
        let sectors = info.size.div_ceil(2048).saturating_sub(offset);
        if sectors == 0 {
            self.report_reject();
            self.set_hirq(HIRQ_EFLS);
            return;
        }

        self.cd_device_connection = if (filter as usize) < NUM_PARTITIONS {
            filter
        } else {
            DISCONNECTED
        };
        self.play_start_pos = start;
        self.play_end_pos = start + sectors - 1;
        self.play_max_repeat = 0;
        self.play_file = true;
        self.play_end_pending = false;
        self.status.repeat_count = 0;
        self.seek_to_pause = false;
        self.seek_ticks = SEEK_TICKS;
        self.status.code = STATUS_SEEK;
        self.status.frame_address = start;

        self.report_status(false);
        self.set_hirq(HIRQ_EFLS);
    }

    fn cmd_abort_file(&mut self) {
        if self.play_file {
            self.play_file = false;
            self.status.code = STATUS_PAUSE;
        }
        self.end_transfer_state();
        self.hirq &= !HIRQ_DRDY;
        self.report_status(false);
        self.set_hirq(HIRQ_EFLS);
    }

    // ── MPEG (no card fitted) ──────────────────────────────────

    fn cmd_mpeg(&mut self, command: u8) {
        // Without an MPEG card every MPEG command reports an
        // unauthenticated, all-zero payload.
        debug!("CD block: MPEG command {command:02X} without card");
        self.cr[0] = (STATUS_REJECT as u16) << 8;
        self.cr[1] = 0;
        self.cr[2] = 0;
        self.cr[3] = 0;
        if command == 0x90 || command == 0x93 {
            self.set_hirq(HIRQ_MPED);
        }
    }

    // ── Authentication ─────────────────────────────────────────

    fn cmd_authenticate_device(&mut self) {
        self.disc_auth = if self.disc.is_empty() {
            0
        } else if self.disc.tracks.iter().all(|t| t.is_audio()) {
            1
        } else if self.disc.has_saturn_header() {
            4
        } else {
            2
        };
        trace!("CD block: disc authentication result {}", self.disc_auth);
        self.report_status(false);
        self.set_hirq(HIRQ_EFLS | HIRQ_ESEL);
    }

    fn cmd_is_device_authenticated(&mut self) {
        self.cr[0] = (self.status_code() as u16) << 8;
        self.cr[1] = self.disc_auth as u16;
        self.cr[2] = 0;
        self.cr[3] = 0;
    }

    fn cmd_get_mpeg_rom(&mut self) {
        self.report_reject();
    }

    // ── Save states ────────────────────────────────────────────

    pub fn save_state(&self) -> crate::state::CdBlockState {
        use crate::state::{CdBufferState, CdFilterState};
        crate::state::CdBlockState {
            cr: self.cr,
            hirq: self.hirq,
            hirq_mask: self.hirq_mask,
            status_code: self.status.code,
            frame_address: self.status.frame_address,
            status_flags: self.status.flags,
            repeat_count: self.status.repeat_count,
            control_adr: self.status.control_adr,
            track: self.status.track,
            index: self.status.index,
            read_speed: self.read_speed,
            disc_auth: self.disc_auth,
            play_start_pos: self.play_start_pos,
            play_end_pos: self.play_end_pos,
            play_max_repeat: self.play_max_repeat,
            play_file: self.play_file,
            buffer_full_pause: self.buffer_full_pause,
            play_end_pending: self.play_end_pending,
            cd_device_connection: self.cd_device_connection,
            get_sector_length: self.get_sector_length,
            put_sector_length: self.put_sector_length,
            filters: self
                .filters
                .iter()
                .map(|f| CdFilterState {
                    start_frame_address: f.start_frame_address,
                    frame_address_count: f.frame_address_count,
                    mode: f.mode,
                    file_num: f.file_num,
                    chan_num: f.chan_num,
                    submode_mask: f.submode_mask,
                    submode_value: f.submode_value,
                    coding_info_mask: f.coding_info_mask,
                    coding_info_value: f.coding_info_value,
                    pass_output: f.pass_output,
                    fail_output: f.fail_output,
                })
                .collect(),
            partitions: (0..NUM_PARTITIONS)
                .map(|p| {
                    (0..self.partitions.buffer_count(p))
                        .filter_map(|offset| self.partitions.tail(p, offset))
                        .map(|b| CdBufferState {
                            data: b.data.to_vec(),
                            size: b.size,
                            frame_address: b.frame_address,
                            mode2: b.mode2,
                            file_num: b.subheader.file_num,
                            chan_num: b.subheader.chan_num,
                            submode: b.subheader.submode,
                            coding_info: b.subheader.coding_info,
                        })
                        .collect()
                })
                .collect(),
        }
    }

    pub fn load_state(&mut self, state: &crate::state::CdBlockState) {
        self.cr = state.cr;
        self.hirq = state.hirq;
        self.hirq_mask = state.hirq_mask;
        self.status.code = state.status_code;
        self.status.frame_address = state.frame_address;
        self.status.flags = state.status_flags;
        self.status.repeat_count = state.repeat_count;
        self.status.control_adr = state.control_adr;
        self.status.track = state.track;
        self.status.index = state.index;
        self.read_speed = state.read_speed;
        self.disc_auth = state.disc_auth;
        self.play_start_pos = state.play_start_pos;
        self.play_end_pos = state.play_end_pos;
        self.play_max_repeat = state.play_max_repeat;
        self.play_file = state.play_file;
        self.buffer_full_pause = state.buffer_full_pause;
        self.play_end_pending = state.play_end_pending;
        self.cd_device_connection = state.cd_device_connection;
        self.get_sector_length = state.get_sector_length;
        self.put_sector_length = state.put_sector_length;
        for (f, s) in self.filters.iter_mut().zip(&state.filters) {
            f.start_frame_address = s.start_frame_address;
            f.frame_address_count = s.frame_address_count;
            f.mode = s.mode;
            f.file_num = s.file_num;
            f.chan_num = s.chan_num;
            f.submode_mask = s.submode_mask;
            f.submode_value = s.submode_value;
            f.coding_info_mask = s.coding_info_mask;
            f.coding_info_value = s.coding_info_value;
            f.pass_output = s.pass_output;
            f.fail_output = s.fail_output;
        }
        self.partitions.reset();
        for (p, buffers) in state.partitions.iter().enumerate() {
            // Oldest first: re-inserting at the head preserves order.
            for b in buffers {
                let mut buf = Buffer {
                    size: b.size,
                    frame_address: b.frame_address,
                    mode2: b.mode2,
                    subheader: Subheader {
                        file_num: b.file_num,
                        chan_num: b.chan_num,
                        submode: b.submode,
                        coding_info: b.coding_info,
                    },
                    ..Default::default()
                };
                buf.data.copy_from_slice(&b.data);
                self.partitions.insert_head(p, buf);
            }
        }
        // A premature reset invalidates any in-flight transfer.
        self.end_transfer_state();
        // Remount the filesystem for the current disc.
        let disc = std::mem::take(&mut self.disc);
        self.fs.mount(&disc);
        self.disc = disc;
    }

    // ── Data transfers ─────────────────────────────────────────

    fn load_sector_into_xfer_buffer(&mut self) {
        self.xfer_buffer.clear();
        self.xfer_buffer_pos = 0;
        let length = self.get_sector_length as usize;
        if let Some(buf) = self
            .partitions
            .tail(self.xfer_partition as usize, self.xfer_sector_pos as usize)
        {
            let offset = self.get_data_offset(buf.mode2);
            let data = &buf.data[offset..offset + length];
            for pair in data.chunks_exact(2) {
                self.xfer_buffer.push(u16::from_be_bytes([pair[0], pair[1]]));
            }
        }
    }

    fn read_data_port(&mut self) -> u16 {
        match self.xfer_type {
            TransferType::Toc | TransferType::FileInfo | TransferType::Subcode => {
                let value = self
                    .xfer_buffer
                    .get(self.xfer_buffer_pos)
                    .copied()
                    .unwrap_or(0);
                self.xfer_buffer_pos += 1;
                self.xfer_pos += 1;
                if self.xfer_pos >= self.xfer_length {
                    self.complete_read_transfer();
                }
                value
            }
            TransferType::GetSector { .. } => {
                let value = self
                    .xfer_buffer
                    .get(self.xfer_buffer_pos)
                    .copied()
                    .unwrap_or(0);
                self.xfer_buffer_pos += 1;
                self.xfer_pos += 1;
                if self.xfer_buffer_pos >= self.xfer_buffer.len() {
                    self.xfer_sector_pos += 1;
                    if self.xfer_sector_pos < self.xfer_sector_end {
                        self.load_sector_into_xfer_buffer();
                    }
                }
                if self.xfer_pos >= self.xfer_length {
                    self.complete_read_transfer();
                }
                value
            }
            _ => 0,
        }
    }

    fn peek_data_port(&self) -> u16 {
        self.xfer_buffer
            .get(self.xfer_buffer_pos)
            .copied()
            .unwrap_or(0)
    }

    fn write_data_port(&mut self, value: u16) {
        if self.xfer_type != TransferType::PutSector {
            return;
        }
        self.put_staging.push(value);
        self.xfer_pos += 1;
        let words_per_sector = (self.put_sector_length / 2) as usize;
        if self.put_staging.len() >= words_per_sector {
            let mut buf = Buffer {
                size: self.put_sector_length as u16,
                frame_address: self.put_frame_address,
                ..Default::default()
            };
            for (i, word) in self.put_staging.drain(..).enumerate() {
                buf.data[i * 2..i * 2 + 2].copy_from_slice(&word.to_be_bytes());
            }
            self.put_frame_address += 1;
            self.partitions
                .insert_head(self.xfer_partition as usize, buf);
        }
        if self.xfer_pos >= self.xfer_length {
            self.xfer_count = self.xfer_pos;
            self.partitions.release_reserved_buffers();
            self.xfer_type = TransferType::None;
            self.set_hirq(HIRQ_EHST);
        }
    }

    fn complete_read_transfer(&mut self) {
        self.xfer_count = self.xfer_pos;
        self.set_hirq(HIRQ_EHST);
    }

    /// Finish the transfer on EndDataTransfer: get-then-delete releases
    /// its source sectors here.
    fn finalize_transfer(&mut self) {
        if let TransferType::GetSector { delete: true } = self.xfer_type {
            self.partitions.delete_sectors(
                self.xfer_partition as usize,
                self.xfer_del_start as usize,
                self.xfer_del_count as usize,
            );
            if self.partitions.free_buffer_count() > 0 {
                self.hirq &= !HIRQ_BFUL;
            }
        }
        if self.xfer_pos > 0 {
            self.xfer_count = self.xfer_pos;
        }
        self.end_transfer_state();
    }

    fn end_transfer_state(&mut self) {
        self.xfer_type = TransferType::None;
        self.xfer_pos = 0;
        self.xfer_length = 0;
        self.xfer_buffer.clear();
        self.xfer_buffer_pos = 0;
        self.put_staging.clear();
    }
}

// ── Bus mapping ───────────────────────────────────────────────

pub fn map_cdblock(cdb: &Rc<RefCell<CdBlock>>, bus: &Bus) {
    for normal in [true, false] {
        let peek = !normal;
        let (r, w) = (cdb.clone(), cdb.clone());
        let handlers = HandlerSet::from_word_handlers(
            move |a| r.borrow_mut().read_reg16(a, peek),
            move |a, v| w.borrow_mut().write_reg16(a, v, peek),
        );
        if normal {
            bus.map_normal(0x580_0000, 0x58F_FFFF, handlers);
        } else {
            bus.map_side_effect_free(0x580_0000, 0x58F_FFFF, handlers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Track, FAD_OFFSET};

    fn cdblock_with_disc() -> (Rc<Scheduler>, Rc<RefCell<CdBlock>>) {
        let scheduler = Rc::new(Scheduler::new());
        let cdb = CdBlock::new(scheduler.clone()).unwrap();
        {
            let mut b = cdb.borrow_mut();
            b.reset(true);
            b.load_disc(crate::media::iso9660::testdisc::build());
            b.ready_for_periodic = true;
        }
        (scheduler, cdb)
    }

    /// Issue a command the way the guest does: write CR1-4, read CR4,
    /// let the latency elapse.
    fn command(
        sched: &Scheduler,
        cdb: &Rc<RefCell<CdBlock>>,
        cr: [u16; 4],
    ) -> [u16; 4] {
        {
            let mut b = cdb.borrow_mut();
            b.write_reg16(0x18, cr[0], false);
            b.write_reg16(0x1C, cr[1], false);
            b.write_reg16(0x20, cr[2], false);
            b.write_reg16(0x24, cr[3], false);
            b.read_reg16(0x24, false);
        }
        sched.advance(100_000);
        let mut b = cdb.borrow_mut();
        [b.cr[0], b.cr[1], b.cr[2], b.cr[3]]
    }

    fn data_sector(fad: u32, submode: u8) -> Buffer {
        Buffer {
            frame_address: fad,
            size: 2048,
            subheader: Subheader {
                submode,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn get_status_reports_pause_after_disc_load() {
        let (sched, cdb) = cdblock_with_disc();
        let cr = command(&sched, &cdb, [0x0000, 0, 0, 0]);
        assert_eq!(cr[0] >> 8, STATUS_PAUSE as u16);
        assert!(cdb.borrow().hirq() & HIRQ_CMOK != 0);
    }

    #[test]
    fn filter_chain_routes_and_drops_per_spec() {
        let (_sched, cdb) = cdblock_with_disc();
        let mut b = cdb.borrow_mut();

        // Filter 0: range [150, 200), pass -> partition 0, fail -> 1.
        b.filters[0].mode = 0x40;
        b.filters[0].start_frame_address = 150;
        b.filters[0].frame_address_count = 50;
        b.filters[0].pass_output = 0;
        b.filters[0].fail_output = 1;
        // Filter 1: submode mask 0xE0 == 0, wide range, pass -> 1.
        b.filters[1].mode = 0x04 | 0x40;
        b.filters[1].start_frame_address = 0;
        b.filters[1].frame_address_count = 0xFF_FFFF;
        b.filters[1].submode_mask = 0xE0;
        b.filters[1].submode_value = 0x00;
        b.filters[1].pass_output = 1;
        b.filters[1].fail_output = DISCONNECTED;
        b.cd_device_connection = 0;

        assert!(b.deliver_sector(data_sector(175, 0x20)));
        assert_eq!(b.partitions.buffer_count(0), 1);
        assert!(b.hirq() & HIRQ_CSCT != 0);

        // FAD 300: filter 0 fails (range), filter 1 fails (submode 0x20
        // under mask 0xE0 is 0x20, not 0), disconnected -> dropped.
        assert!(b.deliver_sector(data_sector(300, 0x20)));
        assert_eq!(b.partitions.buffer_count(0), 1);
        assert_eq!(b.partitions.buffer_count(1), 0);
        assert_eq!(b.partitions.accounted_buffers(), buffer::NUM_BUFFERS);
    }

    #[test]
    fn play_delivers_sectors_into_the_connected_partition() {
        let (sched, cdb) = cdblock_with_disc();
        // Connect drive -> filter 0 (default pass to partition 0).
        command(&sched, &cdb, [0x3000, 0, 0x0000, 0]);
        // Play FAD 150..154.
        command(
            &sched,
            &cdb,
            [0x1080, FAD_OFFSET as u16, 0x0080, 5],
        );
        // Seek takes a few drive ticks, then sectors flow.
        sched.advance(20_000_000);
        let b = cdb.borrow();
        assert_eq!(b.partitions.buffer_count(0), 5);
        assert!(b.hirq() & HIRQ_PEND != 0, "playback end must raise PEND");
        assert_eq!(b.status().code, STATUS_PAUSE);
    }

    #[test]
    fn get_toc_transfers_102_entries() {
        let (sched, cdb) = cdblock_with_disc();
        let cr = command(&sched, &cdb, [0x0200, 0, 0, 0]);
        assert_eq!(cr[1], 204); // words
        let mut b = cdb.borrow_mut();
        assert!(b.hirq() & HIRQ_DRDY != 0);
        let hi = b.read_reg16(0x9_8000, false);
        let lo = b.read_reg16(0x9_8000, false);
        let entry = ((hi as u32) << 16) | lo as u32;
        assert_eq!(entry, 0x4100_0000 | FAD_OFFSET);
    }

    #[test]
    fn get_then_delete_releases_buffers_at_end_transfer() {
        let (sched, cdb) = cdblock_with_disc();
        {
            let mut b = cdb.borrow_mut();
            b.cd_device_connection = 0;
            for fad in 0..3 {
                assert!(b.deliver_sector(data_sector(150 + fad, 0)));
            }
        }
        // GetThenDeleteSectorData: partition 0, pos 0, all sectors.
        command(&sched, &cdb, [0x6300, 0, 0x0000, 0xFFFF]);
        {
            let mut b = cdb.borrow_mut();
            let words = 3 * 2048 / 2;
            for _ in 0..words {
                b.read_data_port();
            }
            assert_eq!(b.partitions.buffer_count(0), 3, "delete happens at end");
        }
        command(&sched, &cdb, [0x0600, 0, 0, 0]);
        let b = cdb.borrow();
        assert_eq!(b.partitions.buffer_count(0), 0);
        assert_eq!(b.partitions.accounted_buffers(), buffer::NUM_BUFFERS);
    }

    #[test]
    fn change_directory_round_trips() {
        let (sched, cdb) = cdblock_with_disc();
        let before = cdb.borrow().fs.current_directory_id().unwrap();
        // ChangeDirectory into SUB (file ID 3).
        command(&sched, &cdb, [0x7000, 0, 0x0000, 3]);
        assert_ne!(cdb.borrow().fs.current_directory_id().unwrap(), before);
        // Back up through ".." (file ID 1).
        command(&sched, &cdb, [0x7000, 0, 0x0000, 1]);
        assert_eq!(cdb.borrow().fs.current_directory_id().unwrap(), before);
    }

    #[test]
    fn device_connection_0xff_disconnects_the_drive() {
        let (sched, cdb) = cdblock_with_disc();
        command(&sched, &cdb, [0x3000, 0, 0xFF00, 0]);
        let mut b = cdb.borrow_mut();
        assert_eq!(b.cd_device_connection, DISCONNECTED);
        assert!(b.deliver_sector(data_sector(150, 0)));
        assert_eq!(b.partitions.accounted_buffers(), buffer::NUM_BUFFERS);
        for i in 0..NUM_PARTITIONS {
            assert_eq!(b.partitions.buffer_count(i), 0);
        }
    }

    #[test]
    fn authentication_recognizes_the_saturn_header() {
        let (sched, cdb) = cdblock_with_disc();
        command(&sched, &cdb, [0xE000, 0, 0, 0]);
        let cr = command(&sched, &cdb, [0xE100, 0, 0, 0]);
        assert_eq!(cr[1], 4, "original Saturn disc");
    }

    #[test]
    fn mpeg_commands_report_unauthenticated() {
        let (sched, cdb) = cdblock_with_disc();
        let cr = command(&sched, &cdb, [0x9000, 0, 0, 0]);
        assert_eq!(cr[0] >> 8, STATUS_REJECT as u16);
        assert_eq!(&cr[1..], &[0, 0, 0]);
    }
}
