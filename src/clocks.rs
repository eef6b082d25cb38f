//! Clock domains and the master-clock ratio tables.
//!
//! Every subordinate clock advances in lockstep with the master clock
//! through an exact numerator/denominator ratio, so the scheduler never
//! accumulates drift no matter how long the system runs.
//!
//! Clock speeds:
//! - Master clock (both SH-2s, VDPs, SCU):
//!   - 320 mode: 26.846591 MHz (NTSC) / 26.660156 MHz (PAL)
//!   - 352 mode: 28.636364 MHz (NTSC) / 28.437500 MHz (PAL)
//! - SCSP: 22.579200 MHz (= 44100 * 512); the sound CPU runs at 1/2 that
//! - CD block MCU: 20.000000 MHz
//! - SMPC MCU: 4.000000 MHz

use serde::{Deserialize, Serialize};

use crate::config::VideoStandard;

/// Horizontal dot clock selection (320 or 352 dots per line).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockSpeed {
    Dot320,
    Dot352,
}

/// Exact ratios of each subordinate clock relative to the master clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRatios {
    /// Master clock rate in Hz (rounded; the ratios below are exact).
    pub master_clock_hz: u64,

    pub scsp_num: u64,
    pub scsp_den: u64,

    pub cd_block_num: u64,
    pub cd_block_den: u64,

    pub smpc_num: u64,
    pub smpc_den: u64,
}

const RATIOS: [ClockRatios; 4] = [
    // NTSC, 320 mode
    ClockRatios {
        master_clock_hz: 26_846_591,
        scsp_num: 39424,
        scsp_den: 46875,
        cd_block_num: 704,
        cd_block_den: 945,
        smpc_num: 704,
        smpc_den: 4725,
    },
    // NTSC, 352 mode
    ClockRatios {
        master_clock_hz: 28_636_364,
        scsp_num: 2464,
        scsp_den: 3125,
        cd_block_num: 44,
        cd_block_den: 63,
        smpc_num: 44,
        smpc_den: 315,
    },
    // PAL, 320 mode
    ClockRatios {
        master_clock_hz: 26_660_156,
        scsp_num: 172_032,
        scsp_den: 203_125,
        cd_block_num: 1024,
        cd_block_den: 1365,
        smpc_num: 1024,
        smpc_den: 6825,
    },
    // PAL, 352 mode
    ClockRatios {
        master_clock_hz: 28_437_500,
        scsp_num: 32256,
        scsp_den: 40625,
        cd_block_num: 64,
        cd_block_den: 91,
        smpc_num: 64,
        smpc_den: 455,
    },
];

/// Look up the precomputed ratio set for a standard/speed combination.
pub fn clock_ratios(standard: VideoStandard, speed: ClockSpeed) -> &'static ClockRatios {
    let index = match (standard, speed) {
        (VideoStandard::Ntsc, ClockSpeed::Dot320) => 0,
        (VideoStandard::Ntsc, ClockSpeed::Dot352) => 1,
        (VideoStandard::Pal, ClockSpeed::Dot320) => 2,
        (VideoStandard::Pal, ClockSpeed::Dot352) => 3,
    };
    &RATIOS[index]
}

/// Callback broadcast to every time-dependent component when the guest
/// switches dot clocks.
pub type ClockSpeedChangeFn = Box<dyn FnMut(&ClockRatios)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntsc_352_scsp_ratio_matches_sample_rate() {
        // 28,636,363.64 Hz * 2464 / 3125 = 22,579,200 Hz = 44100 * 512
        let r = clock_ratios(VideoStandard::Ntsc, ClockSpeed::Dot352);
        assert_eq!(r.scsp_num, 2464);
        assert_eq!(r.scsp_den, 3125);
        // Exact base: 39,375,000 * 8 / 11 master; cross-check the ratio
        // maps master Hz to 22.5792 MHz within rounding.
        let scsp_hz = r.master_clock_hz as f64 * r.scsp_num as f64 / r.scsp_den as f64;
        assert!((scsp_hz - 22_579_200.0).abs() < 1.0);
    }

    #[test]
    fn all_modes_have_nonzero_ratios() {
        for standard in [VideoStandard::Ntsc, VideoStandard::Pal] {
            for speed in [ClockSpeed::Dot320, ClockSpeed::Dot352] {
                let r = clock_ratios(standard, speed);
                assert!(r.scsp_num > 0 && r.scsp_den > 0);
                assert!(r.cd_block_num > 0 && r.cd_block_den > 0);
                assert!(r.smpc_num > 0 && r.smpc_den > 0);
            }
        }
    }
}
