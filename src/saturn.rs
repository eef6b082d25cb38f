//! Top-level Saturn machine: wires every component to the scheduler and
//! bus, drives frames, and owns the save-state round trip.
//!
//! The CPU cores and video rasterizers are external collaborators: the
//! host drives them against this core's bus and feeds back the video
//! timing notifications (HBlank/VBlank/sprite-draw-end).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, warn};

use crate::bus::Bus;
use crate::cart::Cartridge;
use crate::cdblock::{map_cdblock, CdBlock};
use crate::clocks::{clock_ratios, ClockRatios, ClockSpeed};
use crate::config::{Config, SampleInterpolation, VideoStandard};
use crate::error::{CoreError, CoreResult};
use crate::media::Disc;
use crate::memory::{map_memory, SystemMemory};
use crate::scsp::{map_scsp, Scsp};
use crate::scu::{map_scu, Scu};
use crate::sched::Scheduler;
use crate::smpc::{map_smpc, Smpc};
use crate::state::{State, STATE_VERSION};

pub struct Saturn {
    pub scheduler: Rc<Scheduler>,
    pub bus: Rc<Bus>,
    pub memory: Rc<RefCell<SystemMemory>>,
    pub scu: Rc<RefCell<Scu>>,
    pub scsp: Rc<RefCell<Scsp>>,
    pub cdblock: Rc<RefCell<CdBlock>>,
    pub smpc: Rc<RefCell<Smpc>>,

    video_standard: VideoStandard,
    clock_speed: ClockSpeed,
    pending_clock_speed: Rc<Cell<Option<ClockSpeed>>>,

    /// Fractional cycles owed to the slave CPU across frame boundaries.
    pub slave_cpu_spillover: u64,

    audio_rx: Option<crossbeam_channel::Receiver<(i32, i32)>>,
}

impl Saturn {
    pub fn new(config: &Config) -> CoreResult<Self> {
        let scheduler = Rc::new(Scheduler::new());
        let bus = Rc::new(Bus::new());

        let memory = Rc::new(RefCell::new(SystemMemory::new()));
        map_memory(&memory, &bus);

        let scu = Scu::new(scheduler.clone(), bus.clone())?;
        map_scu(&scu, &bus);

        let scsp = Scsp::new(&scheduler)?;
        map_scsp(&scsp, &bus);

        let cdblock = CdBlock::new(scheduler.clone())?;
        map_cdblock(&cdblock, &bus);

        let smpc = Smpc::new(&scheduler)?;
        map_smpc(&smpc, &bus);

        // ── Callback wiring ────────────────────────────────────
        // SCSP sound request line -> SCU.
        {
            let scu = scu.clone();
            scsp.borrow_mut()
                .set_sound_request_callback(Box::new(move |level| {
                    scu.borrow_mut().trigger_sound_request(level);
                }));
        }
        // CD block HIRQ -> SCU external interrupt 0.
        {
            let scu = scu.clone();
            cdblock
                .borrow_mut()
                .set_external_interrupt_callback(Box::new(move || {
                    scu.borrow_mut().trigger_external_interrupt(0);
                }));
        }
        // CDDA sectors -> SCSP ring.
        {
            let scsp = scsp.clone();
            cdblock.borrow_mut().set_cdda_callback(Box::new(move |data| {
                scsp.borrow_mut().receive_cdda(data);
            }));
        }
        // SMPC -> SCU system manager line, SCSP sound CPU gate, clock
        // changes.
        {
            let scu = scu.clone();
            smpc.borrow_mut()
                .set_system_manager_callback(Box::new(move || {
                    scu.borrow_mut().trigger_system_manager();
                }));
        }
        {
            let scsp = scsp.clone();
            smpc.borrow_mut()
                .set_sound_cpu_enable_callback(Box::new(move |enabled| {
                    scsp.borrow_mut().set_aux_cpu_enabled(enabled);
                }));
        }
        let pending_clock_speed = Rc::new(Cell::new(None));
        {
            let pending = pending_clock_speed.clone();
            smpc.borrow_mut()
                .set_clock_change_callback(Box::new(move |speed| {
                    pending.set(Some(speed));
                }));
        }

        let mut saturn = Self {
            scheduler,
            bus,
            memory,
            scu,
            scsp,
            cdblock,
            smpc,
            video_standard: config.video_standard,
            clock_speed: ClockSpeed::Dot320,
            pending_clock_speed,
            slave_cpu_spillover: 0,
            audio_rx: None,
        };

        saturn
            .scsp
            .borrow_mut()
            .set_interpolation(config.interpolation == SampleInterpolation::Linear);
        saturn
            .scsp
            .borrow_mut()
            .set_step_granularity(config.scsp_step_granularity);
        if config.threaded_scsp {
            let (tx, rx) = crossbeam_channel::bounded(4096);
            saturn.scsp.borrow_mut().set_sample_channel(tx);
            saturn.audio_rx = Some(rx);
        }

        saturn.apply_clock_speed(ClockSpeed::Dot320);
        saturn.scsp.borrow().start(&saturn.scheduler);
        saturn.cdblock.borrow().start(&saturn.scheduler);
        saturn.smpc.borrow().start(&saturn.scheduler);

        Ok(saturn)
    }

    /// Receiver side of the threaded-audio channel, when enabled.
    pub fn audio_receiver(&self) -> Option<crossbeam_channel::Receiver<(i32, i32)>> {
        self.audio_rx.clone()
    }

    pub fn clock_ratios(&self) -> &'static ClockRatios {
        clock_ratios(self.video_standard, self.clock_speed)
    }

    pub fn clock_speed(&self) -> ClockSpeed {
        self.clock_speed
    }

    fn apply_clock_speed(&mut self, speed: ClockSpeed) {
        self.clock_speed = speed;
        let ratios = clock_ratios(self.video_standard, speed);
        self.scsp
            .borrow()
            .update_clock_ratios(&self.scheduler, ratios);
        self.cdblock
            .borrow()
            .update_clock_ratios(&self.scheduler, ratios);
        self.smpc
            .borrow()
            .update_clock_ratios(&self.scheduler, ratios);
        debug!(
            "clock speed changed: {:?} ({} Hz master)",
            speed, ratios.master_clock_hz
        );
    }

    /// Master-clock cycles in one video frame.
    pub fn frame_cycles(&self) -> u64 {
        let ratios = self.clock_ratios();
        match self.video_standard {
            VideoStandard::Ntsc => ratios.master_clock_hz / 60,
            VideoStandard::Pal => ratios.master_clock_hz / 50,
        }
    }

    /// Run one frame: repeatedly advance to the next scheduled event and
    /// dispatch it, draining triggered DMA before the next dispatch.
    pub fn run_frame(&mut self) {
        if let Some(speed) = self.pending_clock_speed.take() {
            self.apply_clock_speed(speed);
        }

        let end = self.scheduler.now() + self.frame_cycles();
        loop {
            let now = self.scheduler.now();
            if now >= end {
                break;
            }
            let target = self.scheduler.next_target().min(end).max(now);
            let delta = target - now;

            // Components with their own execution engines advance up to
            // the event timestamp before it dispatches.
            self.scu.borrow_mut().advance(delta);
            self.scheduler.advance_to(target);
            // Event-triggered DMA completes before the next dispatch.
            self.scu.borrow_mut().run_pending_dma();
        }
    }

    // ── Video timing notifications (from the rasterizer contract) ──

    pub fn notify_hblank(&mut self) {
        self.scu.borrow_mut().notify_hblank();
        self.scu.borrow_mut().run_pending_dma();
    }

    pub fn notify_vblank(&mut self, level: bool) {
        self.scu.borrow_mut().notify_vblank(level);
        self.scu.borrow_mut().run_pending_dma();
    }

    pub fn notify_sprite_draw_end(&mut self) {
        self.scu.borrow_mut().notify_sprite_draw_end();
        self.scu.borrow_mut().run_pending_dma();
    }

    pub fn acknowledge_external_interrupt(&mut self) {
        self.scu.borrow_mut().acknowledge_external_interrupt();
    }

    // ── Media and cartridge management ─────────────────────────

    pub fn load_disc(&mut self, disc: Disc) {
        self.cdblock.borrow_mut().load_disc(disc);
    }

    pub fn eject_disc(&mut self) {
        self.cdblock.borrow_mut().eject_disc();
    }

    pub fn open_tray(&mut self) {
        self.cdblock.borrow_mut().open_tray();
    }

    pub fn close_tray(&mut self) {
        self.cdblock.borrow_mut().close_tray();
    }

    pub fn insert_cartridge(&mut self, cartridge: Cartridge) {
        let scu = self.scu.borrow();
        scu.cart_slot.borrow_mut().cartridge = cartridge;
    }

    pub fn remove_cartridge(&mut self) {
        self.insert_cartridge(Cartridge::None);
    }

    pub fn load_ipl_rom(&mut self, image: &[u8]) -> CoreResult<()> {
        self.memory.borrow_mut().load_ipl_rom(image)
    }

    pub fn load_internal_backup(&mut self, image: &[u8]) -> CoreResult<()> {
        self.memory.borrow_mut().load_internal_backup(image)
    }

    pub fn reset(&mut self, hard: bool) {
        self.scu.borrow_mut().reset(hard);
        self.scsp.borrow_mut().reset(hard);
        self.cdblock.borrow_mut().reset(hard);
        self.smpc.borrow_mut().reset(hard);
        self.memory.borrow_mut().reset(hard);
        if hard {
            self.scheduler.reset();
            self.scsp.borrow().start(&self.scheduler);
            self.cdblock.borrow().start(&self.scheduler);
            self.smpc.borrow().start(&self.scheduler);
        }
        self.slave_cpu_spillover = 0;
    }

    // ── Save states ────────────────────────────────────────────

    /// Capture the full machine state. `master_cpu_pc` comes from the
    /// external CPU core and is stored for IPL-mismatch handling on
    /// load.
    pub fn save_state(&self, master_cpu_pc: u32) -> State {
        State {
            version: STATE_VERSION,
            disc_hash: self.cdblock.borrow().disc_hash(),
            ipl_hash: self.memory.borrow().ipl_hash(),
            master_cpu_pc,
            slave_cpu_spillover: self.slave_cpu_spillover,
            scheduler: self.scheduler.save_state(),
            memory: self.memory.borrow().save_state(),
            scu: self.scu.borrow().save_state(),
            scsp: self.scsp.borrow().save_state(),
            cdblock: self.cdblock.borrow().save_state(),
            smpc: self.smpc.borrow().save_state(),
        }
    }

    /// Restore a previously captured state. Validation happens before
    /// any mutation; a failed load leaves the machine untouched.
    pub fn load_state(&mut self, state: &State) -> CoreResult<()> {
        let mut state = state.clone();
        state.upgrade()?;
        state.validate()?;

        if state.disc_hash != self.cdblock.borrow().disc_hash() {
            return Err(CoreError::DiscHashMismatch);
        }
        if state.ipl_hash != self.memory.borrow().ipl_hash() {
            // Fatal only when the CPU was executing IPL ROM code.
            if (state.master_cpu_pc & 0x7FF_FFFF) < crate::memory::IPL_ROM_SIZE as u32 {
                return Err(CoreError::IplHashMismatch);
            }
            warn!("save state IPL hash differs; proceeding (PC outside ROM)");
        }
        if !self.scheduler.validate_state(&state.scheduler) {
            return Err(CoreError::InvalidState("scheduler record out of range"));
        }

        self.scheduler.load_state(&state.scheduler);
        self.memory.borrow_mut().load_state(&state.memory);
        self.scu.borrow_mut().load_state(&state.scu);
        self.scsp.borrow_mut().load_state(&state.scsp);
        self.cdblock.borrow_mut().load_state(&state.cdblock);
        self.smpc.borrow_mut().load_state(&state.smpc);
        self.slave_cpu_spillover = state.slave_cpu_spillover;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_loop_dispatches_scheduled_events() {
        let mut saturn = Saturn::new(&Config::default()).unwrap();
        let before = saturn.scheduler.now();
        saturn.run_frame();
        assert_eq!(saturn.scheduler.now(), before + saturn.frame_cycles());
        // The SCSP must have produced roughly a frame of samples.
        let samples = saturn.scsp.borrow().sample_count();
        assert!((700..=760).contains(&samples), "got {samples} samples");
    }

    #[test]
    fn save_state_round_trips() {
        let mut saturn = Saturn::new(&Config::default()).unwrap();
        saturn.bus.write32(0x600_0000, 0xCAFE_BABE);
        saturn.run_frame();
        let state = saturn.save_state(0x600_0100);

        saturn.run_frame();
        saturn.load_state(&state).unwrap();
        let again = saturn.save_state(0x600_0100);

        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            serde_json::to_string(&again).unwrap()
        );
    }

    #[test]
    fn disc_hash_mismatch_refuses_the_load() {
        let mut saturn = Saturn::new(&Config::default()).unwrap();
        let state = saturn.save_state(0x600_0100);
        saturn.load_disc(crate::media::iso9660::testdisc::build());
        let sample_before = saturn.scsp.borrow().sample_count();
        assert!(matches!(
            saturn.load_state(&state),
            Err(CoreError::DiscHashMismatch)
        ));
        // Prior state intact.
        assert_eq!(saturn.scsp.borrow().sample_count(), sample_before);
    }

    #[test]
    fn ipl_mismatch_refuses_only_rom_resident_states() {
        let mut saturn = Saturn::new(&Config::default()).unwrap();
        let mut state = saturn.save_state(0x0000_1000); // inside IPL ROM
        state.ipl_hash = [0xAA; 16];
        assert!(matches!(
            saturn.load_state(&state),
            Err(CoreError::IplHashMismatch)
        ));

        state.master_cpu_pc = 0x600_0100; // running from WRAM
        saturn.load_state(&state).unwrap();
    }

    #[test]
    fn clock_change_takes_effect_at_the_frame_boundary() {
        let mut saturn = Saturn::new(&Config::default()).unwrap();
        assert_eq!(saturn.clock_speed(), ClockSpeed::Dot320);
        // CKCHG352 through the SMPC register interface.
        saturn.bus.write8(0x010_001F, crate::smpc::CMD_CKCHG352);
        saturn.run_frame();
        assert_eq!(saturn.clock_speed(), ClockSpeed::Dot352);
    }
}
