//! Filesystem layer used by the CD block's file commands.
//!
//! Wraps the ISO-9660 reader with the file-identifier convention the
//! guest protocol uses: within a directory view, ID 0 is the directory
//! itself, ID 1 its parent, and IDs 2+ the entries in on-disc order.

use log::debug;

use crate::media::iso9660::{self, DirectoryRecord};
use crate::media::Disc;

/// ID addressing the root directory from anywhere.
pub const ROOT_DIRECTORY_ID: u32 = 0xFF_FFFF;

/// Directory views hold at most this many entries (the hardware caches
/// 254 records).
pub const MAX_ENTRIES: usize = 254;

pub struct FileInfo {
    pub frame_address: u32,
    pub size: u32,
    pub unit_size: u8,
    pub interleave_gap: u8,
    pub file_number: u8,
    pub attributes: u8,
}

#[derive(Default)]
pub struct Filesystem {
    /// Entries of the current directory view; empty when no valid volume
    /// is mounted. Index 0 is ".", 1 is "..".
    entries: Vec<DirectoryRecord>,
    current_dir: Option<DirectoryRecord>,
    root: Option<DirectoryRecord>,
}

impl Filesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_dir = None;
        self.root = None;
    }

    /// Mount the volume from the first data track. Returns false when no
    /// ISO-9660 volume is present (e.g. an audio disc).
    pub fn mount(&mut self, disc: &Disc) -> bool {
        self.clear();
        match iso9660::read_volume(disc) {
            Some(volume) => {
                debug!("cdblock fs: mounted volume \"{}\"", volume.volume_id);
                self.root = Some(volume.root.clone());
                self.load_directory(disc, volume.root)
            }
            None => false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.current_dir.is_some()
    }

    /// Identifier of the current directory (its extent position), used
    /// to verify ChangeDirectory round trips.
    pub fn current_directory_id(&self) -> Option<u32> {
        self.current_dir.as_ref().map(|d| d.extent_pos)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn load_directory(&mut self, disc: &Disc, dir: DirectoryRecord) -> bool {
        let mut entries = iso9660::read_directory(disc, &dir);
        if entries.is_empty() {
            return false;
        }
        entries.truncate(MAX_ENTRIES);
        self.entries = entries;
        self.current_dir = Some(dir);
        true
    }

    fn entry(&self, file_id: u32) -> Option<&DirectoryRecord> {
        self.entries.get(file_id as usize)
    }

    /// Change the current directory to `file_id` (or the root).
    pub fn change_directory(&mut self, disc: &Disc, file_id: u32) -> bool {
        if file_id == ROOT_DIRECTORY_ID {
            let Some(root) = self.root.clone() else {
                return false;
            };
            return self.load_directory(disc, root);
        }
        let Some(entry) = self.entry(file_id).cloned() else {
            return false;
        };
        if !entry.is_directory() {
            return false;
        }
        self.load_directory(disc, entry)
    }

    /// Re-read the current directory view starting from `file_id` (the
    /// guest uses this to window large directories).
    pub fn read_directory(&mut self, disc: &Disc, file_id: u32) -> bool {
        if file_id == ROOT_DIRECTORY_ID {
            let Some(dir) = self.current_dir.clone() else {
                return false;
            };
            return self.load_directory(disc, dir);
        }
        self.change_directory(disc, file_id)
    }

    /// File info record for one entry.
    pub fn file_info(&self, file_id: u32) -> Option<FileInfo> {
        let entry = self.entry(file_id)?;
        Some(FileInfo {
            frame_address: entry.frame_address(),
            size: entry.data_size,
            unit_size: entry.file_unit_size,
            interleave_gap: entry.interleave_gap_size,
            file_number: file_id as u8,
            attributes: entry.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::iso9660::testdisc;

    #[test]
    fn mounts_and_lists_the_root() {
        let disc = testdisc::build();
        let mut fs = Filesystem::new();
        assert!(fs.mount(&disc));
        assert_eq!(fs.entry_count(), 4);
        let info = fs.file_info(2).unwrap();
        assert_eq!(info.size, 6); // DATA.BIN
        assert_eq!(info.frame_address, 22 + 150);
    }

    #[test]
    fn change_directory_round_trips_through_parent() {
        let disc = testdisc::build();
        let mut fs = Filesystem::new();
        assert!(fs.mount(&disc));
        let root_id = fs.current_directory_id().unwrap();

        assert!(fs.change_directory(&disc, 3)); // SUB
        assert_ne!(fs.current_directory_id().unwrap(), root_id);
        assert_eq!(fs.entry_count(), 3);

        assert!(fs.change_directory(&disc, 1)); // ".."
        assert_eq!(fs.current_directory_id().unwrap(), root_id);
    }

    #[test]
    fn refuses_files_as_directories() {
        let disc = testdisc::build();
        let mut fs = Filesystem::new();
        assert!(fs.mount(&disc));
        assert!(!fs.change_directory(&disc, 2)); // DATA.BIN is a file
    }

    #[test]
    fn audio_discs_do_not_mount() {
        let disc = crate::media::Disc::from_tracks(vec![crate::media::Track::audio(
            1,
            150,
            vec![0; 2352 * 4],
        )]);
        let mut fs = Filesystem::new();
        assert!(!fs.mount(&disc));
        assert!(!fs.is_mounted());
    }
}
