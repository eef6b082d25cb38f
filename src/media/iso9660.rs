//! Minimal ISO-9660 volume reader.
//!
//! Reads the primary volume descriptor and directory extents from a data
//! track. Only the parts consumed by the CD block's file commands are
//! implemented: directory records with both-endian extent/size fields,
//! the flags byte, and file identifiers.

use log::debug;

use super::{Disc, FAD_OFFSET};

/// A parsed directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// Extent start as a logical block number (add 150 for the FAD).
    pub extent_pos: u32,
    pub data_size: u32,
    pub flags: u8,
    pub file_unit_size: u8,
    pub interleave_gap_size: u8,
    pub name: String,
}

impl DirectoryRecord {
    pub fn is_directory(&self) -> bool {
        self.flags & 0x02 != 0
    }

    pub fn frame_address(&self) -> u32 {
        self.extent_pos + FAD_OFFSET
    }
}

/// Parse one directory record at `data[offset..]`. Returns the record and
/// its on-disc length, or `None` at a terminator (length 0).
fn parse_record(data: &[u8], offset: usize) -> Option<(DirectoryRecord, usize)> {
    let len = *data.get(offset)? as usize;
    if len == 0 {
        return None;
    }
    let rec = data.get(offset..offset + len)?;
    let extent_pos = u32::from_le_bytes([rec[2], rec[3], rec[4], rec[5]]);
    let data_size = u32::from_le_bytes([rec[10], rec[11], rec[12], rec[13]]);
    let flags = rec[25];
    let file_unit_size = rec[26];
    let interleave_gap_size = rec[27];
    let name_len = rec[32] as usize;
    let raw_name = rec.get(33..33 + name_len)?;
    let name = match raw_name {
        [0x00] => ".".to_string(),
        [0x01] => "..".to_string(),
        _ => {
            // Strip the ";1" version suffix.
            let s = String::from_utf8_lossy(raw_name);
            s.split(';').next().unwrap_or("").to_string()
        }
    };
    Some((
        DirectoryRecord {
            extent_pos,
            data_size,
            flags,
            file_unit_size,
            interleave_gap_size,
            name,
        },
        len,
    ))
}

/// The primary volume descriptor fields we care about.
#[derive(Debug, Clone)]
pub struct Volume {
    pub volume_id: String,
    pub root: DirectoryRecord,
}

/// Read the primary volume descriptor from the first data track.
pub fn read_volume(disc: &Disc) -> Option<Volume> {
    let track = disc.tracks.first()?;
    if track.is_audio() {
        return None;
    }

    // PVD lives at logical sector 16 (FAD 166).
    let mut sector = [0u8; 2048];
    if !track.read_sector_user_data(track.start_fad + 16, &mut sector) {
        return None;
    }
    if sector[0] != 0x01 || &sector[1..6] != b"CD001" {
        debug!("iso9660: no primary volume descriptor");
        return None;
    }

    let volume_id = String::from_utf8_lossy(&sector[40..72]).trim_end().to_string();
    let (root, _) = parse_record(&sector, 156)?;
    Some(Volume { volume_id, root })
}

/// Read every record of a directory extent. The "." and ".." entries are
/// kept at the front, matching the on-disc order.
pub fn read_directory(disc: &Disc, dir: &DirectoryRecord) -> Vec<DirectoryRecord> {
    let mut records = Vec::new();
    let Some(track) = disc.find_track(dir.frame_address()) else {
        return records;
    };

    let sectors = dir.data_size.div_ceil(2048);
    let mut sector = [0u8; 2048];
    for s in 0..sectors {
        if !track.read_sector_user_data(dir.frame_address() + s, &mut sector) {
            break;
        }
        let mut offset = 0usize;
        // Records never straddle sector boundaries; a zero length byte
        // pads to the end of the sector.
        while offset < 2048 {
            match parse_record(&sector, offset) {
                Some((rec, len)) => {
                    records.push(rec);
                    offset += len;
                }
                None => break,
            }
        }
    }
    records
}

#[cfg(test)]
pub(crate) mod testdisc {
    //! Builder for a tiny ISO-9660 image used across the test suite.

    use super::*;
    use crate::media::Track;

    fn push_record(
        sector: &mut Vec<u8>,
        extent: u32,
        size: u32,
        flags: u8,
        name: &[u8],
    ) {
        let name_len = name.len();
        let mut len = 33 + name_len;
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
        rec[32] = name_len as u8;
        rec[33..33 + name_len].copy_from_slice(name);
    }

    /// Build a disc with a Saturn header, a PVD, a root directory holding
    /// one file (DATA.BIN) and one subdirectory (SUB) with another file.
    pub fn build() -> Disc {
        const ROOT_LBN: u32 = 20;
        const SUB_LBN: u32 = 21;
        const FILE_LBN: u32 = 22;
        const SUBFILE_LBN: u32 = 23;

        let mut data = vec![0u8; 2048 * 24];

        // Sector 0: Saturn system header
        data[..16].copy_from_slice(b"SEGA SEGASATURN ");

        // Sector 16: primary volume descriptor
        let pvd = 16 * 2048;
        data[pvd] = 0x01;
        data[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        data[pvd + 40..pvd + 48].copy_from_slice(b"TESTDISC");
        let mut root_rec = Vec::new();
        push_record(&mut root_rec, ROOT_LBN, 2048, 0x02, &[0x00]);
        data[pvd + 156..pvd + 156 + root_rec.len()].copy_from_slice(&root_rec);

        // Sector 20: root directory
        let mut root_dir = Vec::new();
        push_record(&mut root_dir, ROOT_LBN, 2048, 0x02, &[0x00]);
        push_record(&mut root_dir, ROOT_LBN, 2048, 0x02, &[0x01]);
        push_record(&mut root_dir, FILE_LBN, 6, 0x00, b"DATA.BIN;1");
        push_record(&mut root_dir, SUB_LBN, 2048, 0x02, b"SUB");
        let base = ROOT_LBN as usize * 2048;
        data[base..base + root_dir.len()].copy_from_slice(&root_dir);

        // Sector 21: SUB directory
        let mut sub_dir = Vec::new();
        push_record(&mut sub_dir, SUB_LBN, 2048, 0x02, &[0x00]);
        push_record(&mut sub_dir, ROOT_LBN, 2048, 0x02, &[0x01]);
        push_record(&mut sub_dir, SUBFILE_LBN, 4, 0x00, b"INNER.DAT;1");
        let base = SUB_LBN as usize * 2048;
        data[base..base + sub_dir.len()].copy_from_slice(&sub_dir);

        // File contents
        let base = FILE_LBN as usize * 2048;
        data[base..base + 6].copy_from_slice(b"SATURN");
        let base = SUBFILE_LBN as usize * 2048;
        data[base..base + 4].copy_from_slice(b"DEEP");

        Disc::from_tracks(vec![Track::data(1, FAD_OFFSET, 2048, data)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_the_volume_descriptor() {
        let disc = testdisc::build();
        let volume = read_volume(&disc).unwrap();
        assert_eq!(volume.volume_id, "TESTDISC");
        assert!(volume.root.is_directory());
        assert_eq!(volume.root.extent_pos, 20);
    }

    #[test]
    fn lists_directory_contents() {
        let disc = testdisc::build();
        let volume = read_volume(&disc).unwrap();
        let entries = read_directory(&disc, &volume.root);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[2].name, "DATA.BIN");
        assert!(!entries[2].is_directory());
        assert_eq!(entries[2].data_size, 6);
        assert_eq!(entries[3].name, "SUB");
        assert!(entries[3].is_directory());
    }

    #[test]
    fn descends_into_subdirectories() {
        let disc = testdisc::build();
        let volume = read_volume(&disc).unwrap();
        let root = read_directory(&disc, &volume.root);
        let sub = read_directory(&disc, &root[3]);
        assert_eq!(sub[2].name, "INNER.DAT");
        // ".." points back at the root
        assert_eq!(sub[1].extent_pos, volume.root.extent_pos);
    }
}
