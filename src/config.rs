// Runtime configuration for the emulator core.
// The host may persist this as JSON next to its own settings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Video standard of the emulated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoStandard {
    Ntsc,
    Pal,
}

/// Sample interpolation used by the SCSP voice pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleInterpolation {
    NearestNeighbor,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// NTSC or PAL timing.
    pub video_standard: VideoStandard,
    /// SCSP step granularity: 0 = one sample per firing (fastest),
    /// 5 = one slot per firing (most accurate).
    pub scsp_step_granularity: u32,
    /// Voice sample interpolation mode.
    pub interpolation: SampleInterpolation,
    /// Emulate the 18-bit DAC expansion (shifts output left by 2).
    pub dac_18_bits: bool,
    /// CD drive read speed multiplier (1 or 2).
    pub cd_read_speed: u8,
    /// Run the SCSP on a worker thread, handing samples over a channel.
    pub threaded_scsp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_standard: VideoStandard::Ntsc,
            scsp_step_granularity: 0,
            interpolation: SampleInterpolation::Linear,
            dac_18_bits: false,
            cd_read_speed: 2,
            threaded_scsp: false,
        }
    }
}

impl Config {
    /// Load a configuration file, or return defaults if it does not exist.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the configuration as JSON.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.video_standard, VideoStandard::Ntsc);
        assert!(cfg.scsp_step_granularity <= 5);
        assert!(cfg.cd_read_speed == 1 || cfg.cd_read_speed == 2);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config {
            video_standard: VideoStandard::Pal,
            scsp_step_granularity: 3,
            interpolation: SampleInterpolation::NearestNeighbor,
            dac_18_bits: true,
            cd_read_speed: 1,
            threaded_scsp: false,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scsp_step_granularity, 3);
        assert_eq!(back.video_standard, VideoStandard::Pal);
    }
}
