//! CD block sector filters.
//!
//! Every sector streamed from the drive passes through a filter that
//! tests subheader fields and the frame address range, then routes the
//! sector to a buffer partition (pass) or another filter (fail).

use crate::cdblock::buffer::Buffer;

/// Sentinel for an unrouted output connector.
pub const DISCONNECTED: u8 = 0xFF;

#[derive(Debug, Clone)]
pub struct Filter {
    pub index: u8,

    // Frame address range (mode bit 6)
    pub start_frame_address: u32,
    pub frame_address_count: u32,

    /// Condition enables:
    ///   0  file number equality
    ///   1  channel number equality
    ///   2  (submode & mask) == value
    ///   3  (coding info & mask) == value
    ///   4  invert the combined subheader conditions
    ///   6  frame address in range
    pub mode: u8,

    pub file_num: u8,
    pub chan_num: u8,
    pub submode_mask: u8,
    pub submode_value: u8,
    pub coding_info_mask: u8,
    pub coding_info_value: u8,

    /// Pass: buffer partition index, or DISCONNECTED.
    pub pass_output: u8,
    /// Fail: another filter index, or DISCONNECTED.
    pub fail_output: u8,
}

impl Filter {
    pub fn new(index: u8) -> Self {
        let mut f = Self {
            index,
            start_frame_address: 0,
            frame_address_count: 0,
            mode: 0,
            file_num: 0,
            chan_num: 0,
            submode_mask: 0,
            submode_value: 0,
            coding_info_mask: 0,
            coding_info_value: 0,
            pass_output: index,
            fail_output: DISCONNECTED,
        };
        f.reset();
        f
    }

    pub fn reset(&mut self) {
        self.reset_conditions();
        self.pass_output = self.index;
        self.fail_output = DISCONNECTED;
    }

    pub fn reset_conditions(&mut self) {
        self.start_frame_address = 0;
        self.frame_address_count = 0;
        self.mode = 0;
        self.file_num = 0;
        self.chan_num = 0;
        self.submode_mask = 0;
        self.submode_value = 0;
        self.coding_info_mask = 0;
        self.coding_info_value = 0;
    }

    pub fn test(&self, buffer: &Buffer) -> bool {
        let mut subheader_pass = true;
        if self.mode & 0x01 != 0 {
            subheader_pass &= buffer.subheader.file_num == self.file_num;
        }
        if self.mode & 0x02 != 0 {
            subheader_pass &= buffer.subheader.chan_num == self.chan_num;
        }
        if self.mode & 0x04 != 0 {
            subheader_pass &= buffer.subheader.submode & self.submode_mask == self.submode_value;
        }
        if self.mode & 0x08 != 0 {
            subheader_pass &=
                buffer.subheader.coding_info & self.coding_info_mask == self.coding_info_value;
        }
        if self.mode & 0x10 != 0 {
            // Inverts the subheader conditions, not the range test.
            subheader_pass = !subheader_pass;
        }
        if !subheader_pass {
            return false;
        }

        if self.mode & 0x40 != 0 {
            let fad = buffer.frame_address;
            if fad < self.start_frame_address
                || fad >= self.start_frame_address + self.frame_address_count
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Subheader;

    fn sector(fad: u32, submode: u8) -> Buffer {
        Buffer {
            frame_address: fad,
            subheader: Subheader {
                file_num: 1,
                chan_num: 2,
                submode,
                coding_info: 0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn range_filter_bounds_are_half_open() {
        let mut f = Filter::new(0);
        f.mode = 0x40;
        f.start_frame_address = 150;
        f.frame_address_count = 50;
        assert!(f.test(&sector(150, 0)));
        assert!(f.test(&sector(199, 0)));
        assert!(!f.test(&sector(200, 0)));
        assert!(!f.test(&sector(149, 0)));
    }

    #[test]
    fn submode_mask_compares_masked_equality() {
        let mut f = Filter::new(0);
        f.mode = 0x04;
        f.submode_mask = 0xE0;
        f.submode_value = 0x00;
        assert!(f.test(&sector(0, 0x1F)));
        assert!(!f.test(&sector(0, 0x20)));
    }

    #[test]
    fn invert_bit_flips_subheader_but_not_range() {
        let mut f = Filter::new(0);
        f.mode = 0x40 | 0x10 | 0x01;
        f.file_num = 1;
        f.start_frame_address = 100;
        f.frame_address_count = 10;
        // Subheader passes (file 1) -> inverted to fail.
        assert!(!f.test(&sector(105, 0)));
        // Wrong file -> inverted to pass, but range still binds.
        let mut s = sector(105, 0);
        s.subheader.file_num = 9;
        assert!(f.test(&s));
        s.frame_address = 500;
        assert!(!f.test(&s));
    }

    #[test]
    fn default_routing_passes_to_the_same_index() {
        let f = Filter::new(7);
        assert_eq!(f.pass_output, 7);
        assert_eq!(f.fail_output, DISCONNECTED);
    }
}
