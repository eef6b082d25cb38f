//! Disc media model: sessions, tracks, indices and sector access.
//!
//! The CD block consumes this track/sector model; parsing of container
//! formats (CUE/CHD/...) is the host's business. Tracks carry their data
//! in memory and synthesize the missing parts of a raw 2352-byte sector
//! when the stored sector size is smaller.

pub mod iso9660;

pub const SECTOR_SIZE: usize = 2352;

/// Frame-address offset of the program area (track 1 starts at 00:02:00).
pub const FAD_OFFSET: u32 = 150;

/// Parsed mode 2 subheader of a sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subheader {
    pub file_num: u8,
    pub chan_num: u8,
    pub submode: u8,
    pub coding_info: u8,
}

impl Subheader {
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Self {
        Self {
            file_num: sector[16],
            chan_num: sector[17],
            submode: sector[18],
            coding_info: sector[19],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Index {
    pub start_fad: u32,
    pub end_fad: u32,
}

pub struct Track {
    /// Track number (1-based).
    pub number: u8,
    /// Control/ADR nibbles; 0x41 for data tracks, 0x01 for audio.
    pub control_adr: u8,
    pub mode2: bool,
    /// Stored sector size: 2048 (cooked) or 2352 (raw).
    pub sector_size: u32,
    pub start_fad: u32,
    pub end_fad: u32,
    pub indices: Vec<Index>,
    data: Vec<u8>,
}

impl Track {
    /// Build a data track (mode 1, control/ADR 0x41) from cooked or raw
    /// sector data.
    pub fn data(number: u8, start_fad: u32, sector_size: u32, data: Vec<u8>) -> Self {
        let sectors = (data.len() as u32).div_ceil(sector_size);
        let end_fad = start_fad + sectors.max(1) - 1;
        Self {
            number,
            control_adr: 0x41,
            mode2: false,
            sector_size,
            start_fad,
            end_fad,
            indices: vec![Index {
                start_fad,
                end_fad,
            }],
            data,
        }
    }

    /// Build an audio track (control/ADR 0x01) from raw 2352-byte sectors.
    pub fn audio(number: u8, start_fad: u32, data: Vec<u8>) -> Self {
        let sectors = (data.len() as u32).div_ceil(SECTOR_SIZE as u32);
        let end_fad = start_fad + sectors.max(1) - 1;
        Self {
            number,
            control_adr: 0x01,
            mode2: false,
            sector_size: SECTOR_SIZE as u32,
            start_fad,
            end_fad,
            indices: vec![Index {
                start_fad,
                end_fad,
            }],
            data,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.control_adr & 0x40 == 0
    }

    pub fn contains(&self, fad: u32) -> bool {
        fad >= self.start_fad && fad <= self.end_fad
    }

    /// Index number containing the frame address, 0xFF if out of range.
    pub fn find_index(&self, fad: u32) -> u8 {
        self.indices
            .iter()
            .position(|idx| fad >= idx.start_fad && fad <= idx.end_fad)
            .map(|pos| pos as u8 + 1)
            .unwrap_or(0xFF)
    }

    /// Read the user-data portion (2048 bytes) of a sector.
    pub fn read_sector_user_data(&self, fad: u32, out: &mut [u8; 2048]) -> bool {
        if !self.contains(fad) {
            return false;
        }
        let user_offset = if self.sector_size >= 2352 {
            if self.mode2 {
                24
            } else {
                16
            }
        } else {
            0
        };
        let offset = ((fad - self.start_fad) * self.sector_size) as usize + user_offset;
        let Some(src) = self.data.get(offset..offset + 2048) else {
            return false;
        };
        out.copy_from_slice(src);
        true
    }

    /// Read a full raw sector, synthesizing sync bytes and header when the
    /// stored sector size omits them.
    pub fn read_sector(&self, fad: u32, out: &mut [u8; SECTOR_SIZE]) -> bool {
        if !self.contains(fad) {
            return false;
        }
        let offset = ((fad - self.start_fad) * self.sector_size) as usize;

        if self.sector_size as usize >= SECTOR_SIZE {
            let Some(src) = self.data.get(offset..offset + SECTOR_SIZE) else {
                return false;
            };
            out.copy_from_slice(src);
            return true;
        }

        // Cooked 2048-byte sectors: synthesize sync + header.
        out.fill(0);
        out[0] = 0x00;
        out[1..11].fill(0xFF);
        out[11] = 0x00;
        let (m, s, f) = fad_to_msf(fad);
        out[12] = to_bcd(m);
        out[13] = to_bcd(s);
        out[14] = to_bcd(f);
        out[15] = if self.mode2 { 0x02 } else { 0x01 };
        let user_offset = if self.mode2 { 24 } else { 16 };
        let Some(src) = self.data.get(offset..offset + 2048) else {
            return false;
        };
        out[user_offset..user_offset + 2048].copy_from_slice(src);
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub first_track: u8,
    pub last_track: u8,
    pub start_fad: u32,
    pub end_fad: u32,
}

#[derive(Default)]
pub struct Disc {
    pub sessions: Vec<Session>,
    pub tracks: Vec<Track>,
}

impl Disc {
    /// Single-session disc from a set of tracks.
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        let start_fad = tracks.first().map(|t| t.start_fad).unwrap_or(FAD_OFFSET);
        let end_fad = tracks.last().map(|t| t.end_fad).unwrap_or(FAD_OFFSET);
        let sessions = if tracks.is_empty() {
            Vec::new()
        } else {
            vec![Session {
                first_track: tracks.first().unwrap().number,
                last_track: tracks.last().unwrap().number,
                start_fad,
                end_fad,
            }]
        };
        Self { sessions, tracks }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn find_track(&self, fad: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.contains(fad))
    }

    /// Leadout frame address (end of the program area + 1).
    pub fn leadout_fad(&self) -> u32 {
        self.tracks.last().map(|t| t.end_fad + 1).unwrap_or(FAD_OFFSET)
    }

    /// Build the 102-entry TOC consumed by the guest: 99 track entries
    /// (control/ADR in the top byte, start FAD below) plus first/last
    /// track info and the leadout.
    pub fn build_toc(&self) -> [u32; 102] {
        let mut toc = [0xFFFF_FFFFu32; 102];
        for track in &self.tracks {
            let slot = (track.number - 1) as usize;
            toc[slot] = ((track.control_adr as u32) << 24) | (track.start_fad & 0xFF_FFFF);
        }
        if let Some(session) = self.sessions.first() {
            let first = &self.tracks[0];
            let last = &self.tracks[self.tracks.len() - 1];
            toc[99] = ((first.control_adr as u32) << 24)
                | ((session.first_track as u32) << 16);
            toc[100] = ((last.control_adr as u32) << 24)
                | ((session.last_track as u32) << 16);
            toc[101] = ((last.control_adr as u32) << 24) | (self.leadout_fad() & 0xFF_FFFF);
        }
        toc
    }

    /// MD5 over all track data, used to authenticate save states.
    pub fn hash(&self) -> [u8; 16] {
        let mut ctx = md5::Context::new();
        for track in &self.tracks {
            ctx.consume(track.number.to_be_bytes());
            ctx.consume(track.start_fad.to_be_bytes());
            ctx.consume(&track.data);
        }
        ctx.compute().0
    }

    /// True when track 1 carries the "SEGA SEGASATURN" system ID.
    pub fn has_saturn_header(&self) -> bool {
        let Some(track) = self.tracks.first() else {
            return false;
        };
        if track.is_audio() {
            return false;
        }
        let mut buf = [0u8; 2048];
        if !track.read_sector_user_data(track.start_fad, &mut buf) {
            return false;
        }
        buf.starts_with(b"SEGA SEGASATURN ")
    }
}

/// Convert a frame address to minutes/seconds/frames.
pub fn fad_to_msf(fad: u32) -> (u8, u8, u8) {
    let m = fad / (60 * 75);
    let s = (fad / 75) % 60;
    let f = fad % 75;
    (m as u8, s as u8, f as u8)
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooked_sectors_synthesize_sync_and_header() {
        let mut data = vec![0u8; 2048 * 2];
        data[0] = 0x42;
        let track = Track::data(1, 150, 2048, data);
        let mut sector = [0u8; SECTOR_SIZE];
        assert!(track.read_sector(150, &mut sector));
        assert_eq!(sector[0], 0x00);
        assert_eq!(sector[1], 0xFF);
        assert_eq!(sector[11], 0x00);
        // FAD 150 = 00:02:00
        assert_eq!(sector[12..16], [0x00, 0x02, 0x00, 0x01]);
        assert_eq!(sector[16], 0x42);
    }

    #[test]
    fn toc_reports_track_layout() {
        let disc = Disc::from_tracks(vec![
            Track::data(1, 150, 2048, vec![0; 2048 * 10]),
            Track::audio(2, 160, vec![0; SECTOR_SIZE * 5]),
        ]);
        let toc = disc.build_toc();
        assert_eq!(toc[0], 0x4100_0000 | 150);
        assert_eq!(toc[1], 0x0100_0000 | 160);
        assert_eq!(toc[99] >> 16 & 0xFF, 1);
        assert_eq!(toc[100] >> 16 & 0xFF, 2);
        assert_eq!(toc[101] & 0xFF_FFFF, 165);
        assert_eq!(toc[2], 0xFFFF_FFFF);
    }

    #[test]
    fn find_track_respects_ranges() {
        let disc = Disc::from_tracks(vec![
            Track::data(1, 150, 2048, vec![0; 2048 * 10]),
            Track::audio(2, 160, vec![0; SECTOR_SIZE * 5]),
        ]);
        assert_eq!(disc.find_track(155).unwrap().number, 1);
        assert_eq!(disc.find_track(162).unwrap().number, 2);
        assert!(disc.find_track(1000).is_none());
    }
}
