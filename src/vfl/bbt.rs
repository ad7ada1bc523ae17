//! The `DEVICEINFOBBT` page: per-bank factory bad-block table and the fixed VFL block layout.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;

pub const BBT_MAGIC: &[u8; 16] = b"DEVICEINFOBBT\0\0\0";
const BBT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Physical block (in every bank) that holds the `DEVICEINFOBBT` page
pub const BBT_BLOCK: u32 = 0;

/// Raw on-media record; the magic is checked by deku on read
#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"DEVICEINFOBBT\0\0\0")]
struct BbtRecord {
    cxt_blocks: [u16; 4],
    reserved_pool_start: u16,
    reserved_pool_size: u16,
    bitmap_len: u16,
    #[deku(count = "bitmap_len")]
    factory_bad: Vec<u8>,
    crc: u32,
}

/// Where a bank's VFL structures live, and which of its blocks were bad from the factory
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DeviceInfoBbt {
    pub cxt_blocks: [u16; 4],
    pub reserved_pool_start: u16,
    pub reserved_pool_size: u16,

    /// One bit per physical block, set when the block is bad
    factory_bad: Vec<u8>,
}

impl DeviceInfoBbt {
    pub fn new(
        blocks_per_bank: u32,
        cxt_blocks: [u16; 4],
        reserved_pool_start: u16,
        reserved_pool_size: u16,
    ) -> Self {
        Self {
            cxt_blocks,
            reserved_pool_start,
            reserved_pool_size,
            factory_bad: vec![0; (blocks_per_bank as usize).div_ceil(8)],
        }
    }

    pub fn is_bad(&self, block: u32) -> bool {
        let (byte, bit) = ((block / 8) as usize, block % 8);
        self.factory_bad
            .get(byte)
            .is_some_and(|&x| x & (1 << bit) != 0)
    }

    pub fn set_bad(&mut self, block: u32) {
        let (byte, bit) = ((block / 8) as usize, block % 8);
        if let Some(x) = self.factory_bad.get_mut(byte) {
            *x |= 1 << bit;
        }
    }

    pub fn bad_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.factory_bad.len() as u32 * 8).filter(|&b| self.is_bad(b))
    }

    /// Parse a page, checking the magic and CRC
    pub fn decode(page: &[u8]) -> Option<Self> {
        let (_, record) = BbtRecord::from_bytes((page, 0)).ok()?;
        let record_len = record.to_bytes().ok()?.len();

        if BBT_CRC.checksum(&page[..record_len - 4]) != record.crc {
            return None;
        }

        Some(Self {
            cxt_blocks: record.cxt_blocks,
            reserved_pool_start: record.reserved_pool_start,
            reserved_pool_size: record.reserved_pool_size,
            factory_bad: record.factory_bad,
        })
    }

    /// Write into a page-sized buffer, padding with 0xFF
    pub fn encode(&self, page: &mut [u8]) -> anyhow::Result<()> {
        let mut record = BbtRecord {
            cxt_blocks: self.cxt_blocks,
            reserved_pool_start: self.reserved_pool_start,
            reserved_pool_size: self.reserved_pool_size,
            bitmap_len: u16::try_from(self.factory_bad.len())?,
            factory_bad: self.factory_bad.clone(),
            crc: 0,
        };

        let bytes = record.to_bytes()?;
        record.crc = BBT_CRC.checksum(&bytes[..bytes.len() - 4]);
        let bytes = record.to_bytes()?;

        let out = page
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("page too small for bad-block table"))?;
        out.copy_from_slice(&bytes);
        page[bytes.len()..].fill(0xFF);
        Ok(())
    }
}

#[test]
fn test_bbt() -> anyhow::Result<()> {
    let mut bbt = DeviceInfoBbt::new(64, [1, 2, 3, 4], 60, 4);
    bbt.set_bad(9);
    bbt.set_bad(63);

    let mut page = vec![0u8; 2048];
    bbt.encode(&mut page)?;
    assert_eq!(&page[..16], BBT_MAGIC);

    let decoded = DeviceInfoBbt::decode(&page).ok_or(anyhow::anyhow!("decode failed"))?;
    assert_eq!(decoded, bbt);
    assert_eq!(decoded.bad_blocks().collect::<Vec<_>>(), [9, 63]);
    assert!(!decoded.is_bad(10));

    // A flipped bitmap bit breaks the CRC
    page[16 + 14] ^= 1;
    assert!(DeviceInfoBbt::decode(&page).is_none());

    // Erased pages don't have the magic
    assert!(DeviceInfoBbt::decode(&[0xFF; 2048]).is_none());
    Ok(())
}
