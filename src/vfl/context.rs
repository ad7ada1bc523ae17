//! The per-bank VFL context (`VFLCxt`) and its bit-exact 2 KiB on-media encoding.
//!
//! ```text
//! 0x000 usn_inc          0x016 write_fail_count    0x020 pool_map[820]
//! 0x004 ftl_ctrl[3]      0x018 erase_fail_count    0x688 bad_block_table[282]
//! 0x00A (unknown)        0x01A num_reserved        0x7A2 vfl_cxt_blocks[4]
//! 0x00C usn_dec          0x01C pool_start          0x7AA scheduled remap count
//! 0x010 active_cxt_blk   0x01E total_reserved      0x7AC scheduled remaps[38]
//! 0x012 next_cxt_page                              0x7F8 checksum1
//! 0x014 (unknown)                                  0x7FC checksum2
//! ```

use bytes::{Buf, BufMut};

use super::bbt::DeviceInfoBbt;
use crate::error::{Error, Result};
use crate::nand::{NandGeometry, MAX_BLOCKS_PER_BANK, MAX_RESERVED_BLOCKS, SPECIAL_BLOCKS};

pub const VFL_CXT_SIZE: usize = 0x800;
const CHECKSUMMED_LEN: usize = 0x7F8;
const CHECKSUM_SALT: u32 = 0xAABB_CCDD;
const BAD_BLOCK_TABLE_LEN: usize = MAX_BLOCKS_PER_BANK as usize / 8;
const MAX_SCHEDULED_REMAPS: usize = 0x4C / 2;

/// One slot of the reserved-block pool
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReservedSlot {
    /// Not yet handed out
    Free,
    /// Stands in for the given (bad) physical block
    Substitutes(u16),
    /// The reserved block itself is bad
    Retired,
}

impl From<u16> for ReservedSlot {
    fn from(value: u16) -> Self {
        match value {
            0xFFFF => ReservedSlot::Free,
            0xFFFE => ReservedSlot::Retired,
            x => ReservedSlot::Substitutes(x),
        }
    }
}

impl From<ReservedSlot> for u16 {
    fn from(value: ReservedSlot) -> Self {
        match value {
            ReservedSlot::Free => 0xFFFF,
            ReservedSlot::Retired => 0xFFFE,
            ReservedSlot::Substitutes(x) => x,
        }
    }
}

/// One bank's VFL state
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VflContext {
    /// Global commit counter; the bank with the highest value has the newest `ftl_ctrl_blocks`
    pub usn_inc: u32,
    pub ftl_ctrl_blocks: [u16; 3],
    unknown_0a: u16,

    /// Decreases with every commit; the newest context has the lowest value
    pub usn_dec: u32,

    /// Index into `cxt_blocks` of the ring block being appended to
    pub active_cxt_block: u16,
    pub next_cxt_page: u16,
    unknown_14: u16,
    pub write_fail_count: u16,
    pub erase_fail_count: u16,

    /// Pool slots handed out so far
    pub num_reserved: u16,
    pub reserved_pool_start: u16,
    pub total_reserved: u16,
    pool_map: Vec<ReservedSlot>,

    /// One bit per physical block, set when the block is good
    bad_block_table: Vec<u8>,
    pub cxt_blocks: [u16; 4],
    scheduled_count: u16,
    scheduled: [u16; MAX_SCHEDULED_REMAPS],
    checksum1: u32,
    checksum2: u32,
}

impl VflContext {
    /// A fresh context for a just-formatted bank
    pub fn new(geometry: &NandGeometry, bbt: &DeviceInfoBbt) -> Self {
        let mut bad_block_table = vec![0u8; BAD_BLOCK_TABLE_LEN];
        for block in 0..geometry.blocks_per_bank {
            if !bbt.is_bad(block) {
                bad_block_table[(block / 8) as usize] |= 1 << (block % 8);
            }
        }

        let mut cxt = Self {
            usn_inc: 0,
            ftl_ctrl_blocks: [0, 1, 2],
            unknown_0a: 0,
            usn_dec: u32::MAX,
            active_cxt_block: 0,
            next_cxt_page: 0,
            unknown_14: 0,
            write_fail_count: 0,
            erase_fail_count: 0,
            num_reserved: 0,
            reserved_pool_start: bbt.reserved_pool_start,
            total_reserved: bbt.reserved_pool_size,
            pool_map: vec![ReservedSlot::Free; MAX_RESERVED_BLOCKS as usize],
            bad_block_table,
            cxt_blocks: bbt.cxt_blocks,
            scheduled_count: 0,
            scheduled: [0; MAX_SCHEDULED_REMAPS],
            checksum1: 0,
            checksum2: 0,
        };
        cxt.gen_checksum();
        cxt
    }

    pub fn is_good(&self, block: u32) -> bool {
        let (byte, bit) = ((block / 8) as usize, block % 8);
        self.bad_block_table
            .get(byte)
            .is_some_and(|&x| x & (1 << bit) != 0)
    }

    pub fn set_bad(&mut self, block: u32) {
        let (byte, bit) = ((block / 8) as usize, block % 8);
        if let Some(x) = self.bad_block_table.get_mut(byte) {
            *x &= !(1 << bit);
        }
    }

    /// Translate a candidate physical block, substituting from the reserved pool if it is bad
    pub fn physical_block(&self, candidate: u32) -> u32 {
        if self.is_good(candidate) {
            return candidate;
        }

        self.pool_map[..self.num_reserved as usize]
            .iter()
            .position(|&slot| slot == ReservedSlot::Substitutes(candidate as u16))
            .map_or(candidate, |i| u32::from(self.reserved_pool_start) + i as u32)
    }

    /// Hand out the next good reserved block to stand in for `candidate`
    ///
    /// Returns the substitute, or `None` once the pool is exhausted.
    pub fn allocate_substitute(&mut self, candidate: u32) -> Option<u32> {
        while self.num_reserved < self.total_reserved {
            let slot = self.num_reserved as usize;
            let block = u32::from(self.reserved_pool_start) + slot as u32;
            self.num_reserved += 1;

            if self.is_good(block) {
                self.pool_map[slot] = ReservedSlot::Substitutes(candidate as u16);
                self.set_bad(candidate);
                return Some(block);
            }
            self.pool_map[slot] = ReservedSlot::Retired;
        }
        None
    }

    /// Mark the slot currently standing in for `candidate` as bad itself
    pub fn retire_substitute(&mut self, candidate: u32) {
        let used = self.num_reserved as usize;
        if let Some(slot) = self.pool_map[..used]
            .iter_mut()
            .find(|slot| **slot == ReservedSlot::Substitutes(candidate as u16))
        {
            *slot = ReservedSlot::Retired;
        }
    }

    pub fn pool_map(&self) -> &[ReservedSlot] {
        &self.pool_map[..self.num_reserved as usize]
    }

    /// Physical blocks waiting to be substituted on their next erase
    pub fn scheduled_remaps(&self) -> &[u16] {
        &self.scheduled[..usize::from(self.scheduled_count).min(MAX_SCHEDULED_REMAPS)]
    }

    pub fn schedule_remap(&mut self, block: u32) -> bool {
        let count = usize::from(self.scheduled_count);
        if count >= MAX_SCHEDULED_REMAPS || self.scheduled_remaps().contains(&(block as u16)) {
            return false;
        }
        self.scheduled[count] = block as u16;
        self.scheduled_count += 1;
        true
    }

    pub fn unschedule_remap(&mut self, block: u32) {
        let count = self.scheduled_remaps().len();
        if let Some(i) = self.scheduled_remaps().iter().position(|&b| b == block as u16) {
            self.scheduled.copy_within(i + 1..count, i);
            self.scheduled_count -= 1;
        }
    }

    /// Compute the checksum pair over everything but the checksums themselves
    fn compute_checksum(&self) -> (u32, u32) {
        let bytes = self.encode();
        let (sum, xor) = bytes[..CHECKSUMMED_LEN]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold((0u32, 0u32), |(sum, xor), w| (sum.wrapping_add(w), xor ^ w));

        (sum.wrapping_add(CHECKSUM_SALT), xor ^ CHECKSUM_SALT)
    }

    pub fn gen_checksum(&mut self) {
        (self.checksum1, self.checksum2) = self.compute_checksum();
    }

    /// Accepts when the additive checksum matches or the XOR checksum does not.
    ///
    /// This asymmetry is how contexts have always been verified on media; a context is only
    /// rejected when its XOR checksum is right but its additive checksum is wrong.
    pub fn check_checksum(&self) -> bool {
        let (checksum1, checksum2) = self.compute_checksum();
        checksum1 == self.checksum1 || checksum2 != self.checksum2
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VFL_CXT_SIZE);

        buf.put_u32_le(self.usn_inc);
        for &block in &self.ftl_ctrl_blocks {
            buf.put_u16_le(block);
        }
        buf.put_u16_le(self.unknown_0a);
        buf.put_u32_le(self.usn_dec);
        buf.put_u16_le(self.active_cxt_block);
        buf.put_u16_le(self.next_cxt_page);
        buf.put_u16_le(self.unknown_14);
        buf.put_u16_le(self.write_fail_count);
        buf.put_u16_le(self.erase_fail_count);
        buf.put_u16_le(self.num_reserved);
        buf.put_u16_le(self.reserved_pool_start);
        buf.put_u16_le(self.total_reserved);
        for &slot in &self.pool_map {
            buf.put_u16_le(slot.into());
        }
        buf.put_slice(&self.bad_block_table);
        for &block in &self.cxt_blocks {
            buf.put_u16_le(block);
        }
        buf.put_u16_le(self.scheduled_count);
        for &block in &self.scheduled {
            buf.put_u16_le(block);
        }
        buf.put_u32_le(self.checksum1);
        buf.put_u32_le(self.checksum2);

        debug_assert_eq!(buf.len(), VFL_CXT_SIZE);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VFL_CXT_SIZE {
            return Err(Error::Inconsistent(format!(
                "VFL context needs {VFL_CXT_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let usn_inc = bytes.get_u32_le();
        let mut ftl_ctrl_blocks = [0u16; 3];
        for block in &mut ftl_ctrl_blocks {
            *block = bytes.get_u16_le();
        }
        let unknown_0a = bytes.get_u16_le();
        let usn_dec = bytes.get_u32_le();
        let active_cxt_block = bytes.get_u16_le();
        let next_cxt_page = bytes.get_u16_le();
        let unknown_14 = bytes.get_u16_le();
        let write_fail_count = bytes.get_u16_le();
        let erase_fail_count = bytes.get_u16_le();
        let num_reserved = bytes.get_u16_le();
        let reserved_pool_start = bytes.get_u16_le();
        let total_reserved = bytes.get_u16_le();
        let pool_map = (0..MAX_RESERVED_BLOCKS)
            .map(|_| bytes.get_u16_le().into())
            .collect();
        let mut bad_block_table = vec![0u8; BAD_BLOCK_TABLE_LEN];
        bytes.copy_to_slice(&mut bad_block_table);
        let mut cxt_blocks = [0u16; 4];
        for block in &mut cxt_blocks {
            *block = bytes.get_u16_le();
        }
        let scheduled_count = bytes.get_u16_le();
        let mut scheduled = [0u16; MAX_SCHEDULED_REMAPS];
        for block in &mut scheduled {
            *block = bytes.get_u16_le();
        }
        let checksum1 = bytes.get_u32_le();
        let checksum2 = bytes.get_u32_le();

        Ok(Self {
            usn_inc,
            ftl_ctrl_blocks,
            unknown_0a,
            usn_dec,
            active_cxt_block,
            next_cxt_page,
            unknown_14,
            write_fail_count,
            erase_fail_count,
            num_reserved,
            reserved_pool_start,
            total_reserved,
            pool_map,
            bad_block_table,
            cxt_blocks,
            scheduled_count,
            scheduled,
            checksum1,
            checksum2,
        })
    }

    /// Sanity-check fields that index into the geometry
    pub fn fits(&self, geometry: &NandGeometry) -> bool {
        let blocks = geometry.blocks_per_bank;
        u32::from(self.reserved_pool_start) + u32::from(self.total_reserved) <= blocks
            && self.num_reserved <= self.total_reserved
            && self.active_cxt_block < 4
            && self
                .cxt_blocks
                .iter()
                .all(|&b| (1..SPECIAL_BLOCKS).contains(&u32::from(b)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::TEST_LAYOUT;

    fn context() -> anyhow::Result<VflContext> {
        let geometry = NandGeometry::new(TEST_LAYOUT)?;
        let mut bbt = DeviceInfoBbt::new(64, [1, 2, 3, 4], 60, 4);
        bbt.set_bad(20);
        bbt.set_bad(61);
        Ok(VflContext::new(&geometry, &bbt))
    }

    #[test]
    fn test_layout_offsets() -> anyhow::Result<()> {
        let mut cxt = context()?;
        cxt.usn_dec = 0x1122_3344;
        cxt.ftl_ctrl_blocks = [7, 8, 9];
        cxt.next_cxt_page = 0x18;
        let bytes = cxt.encode();

        assert_eq!(bytes.len(), VFL_CXT_SIZE);
        assert_eq!(bytes[0x4..0xA], [7, 0, 8, 0, 9, 0]);
        assert_eq!(bytes[0xC..0x10], 0x1122_3344u32.to_le_bytes());
        assert_eq!(bytes[0x12..0x14], [0x18, 0]);
        assert_eq!(bytes[0x1C..0x20], [60, 0, 4, 0]);
        assert_eq!(bytes[0x20..0x22], [0xFF, 0xFF]);
        assert_eq!(bytes[0x7A2..0x7AA], [1, 0, 2, 0, 3, 0, 4, 0]);

        // Block 20 is bad: bit 4 of byte 2 of the bad-block table is clear
        assert_eq!(bytes[0x688 + 2] & 0x10, 0);
        assert_eq!(bytes[0x688 + 2] & 0x20, 0x20);

        assert_eq!(VflContext::decode(&bytes)?, cxt);
        Ok(())
    }

    #[test]
    fn test_checksum_asymmetry() -> anyhow::Result<()> {
        let mut cxt = context()?;
        cxt.gen_checksum();
        assert!(cxt.check_checksum());

        // Changing a field breaks both checksums; the XOR mismatch alone gets it accepted
        cxt.write_fail_count += 1;
        assert!(cxt.check_checksum());

        // Only a context whose XOR checksum still matches is rejected: setting the same bit in
        // two words changes the sum but not the XOR
        let mut cxt = context()?;
        cxt.usn_inc = 0;
        cxt.usn_dec = 0;
        cxt.gen_checksum();
        cxt.usn_inc = 1;
        cxt.usn_dec = 1;
        assert!(!cxt.check_checksum());

        cxt.gen_checksum();
        assert!(cxt.check_checksum());
        Ok(())
    }

    #[test]
    fn test_substitution() -> anyhow::Result<()> {
        let mut cxt = context()?;

        // Good blocks map to themselves; an unsubstituted bad one is passed through
        assert_eq!(cxt.physical_block(19), 19);
        assert_eq!(cxt.physical_block(20), 20);

        assert_eq!(cxt.allocate_substitute(20), Some(60));
        assert_eq!(cxt.physical_block(20), 60);

        // Reserved block 61 is bad, so it is retired and 62 is used instead
        assert_eq!(cxt.allocate_substitute(33), Some(62));
        assert_eq!(cxt.physical_block(33), 62);
        assert_eq!(
            cxt.pool_map(),
            [
                ReservedSlot::Substitutes(20),
                ReservedSlot::Retired,
                ReservedSlot::Substitutes(33)
            ]
        );

        assert_eq!(cxt.allocate_substitute(40), Some(63));
        assert_eq!(cxt.allocate_substitute(41), None);
        Ok(())
    }

    #[test]
    fn test_scheduled_remaps() -> anyhow::Result<()> {
        let mut cxt = context()?;
        assert!(cxt.schedule_remap(30));
        assert!(cxt.schedule_remap(31));
        assert!(!cxt.schedule_remap(30));
        cxt.unschedule_remap(30);
        assert_eq!(cxt.scheduled_remaps(), [31]);

        let decoded = VflContext::decode(&cxt.encode())?;
        assert_eq!(decoded.scheduled_remaps(), [31]);
        Ok(())
    }
}
