//! Spare-area framing: the per-page metadata record and the ECC codes that protect it.
//!
//! ```text
//! 0        12       16                  16 + 4 * sectors
//! +--------+--------+--------+-----+--------+------------------
//! | record | rec ecc| sect 0 | ... | sect N |  erased
//! +--------+--------+--------+-----+--------+------------------
//! ```
//!
//! The ECC codes are CRC-32s: they detect corruption but do not correct it.

use crc::{Crc, CRC_32_ISCSI};
use deku::prelude::*;

use super::ECC_SECTOR_SIZE;
use crate::error::NandError;
use crate::util::PageUtil;

pub const NAND_ECC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const RECORD_LEN: usize = 12;
const RECORD_ECC_LEN: usize = 4;
const SECTOR_ECC_LEN: usize = 4;

/// Bytes of spare area consumed for a page of the given size
pub fn spare_len_needed(bytes_per_page: usize) -> usize {
    RECORD_LEN + RECORD_ECC_LEN + SECTOR_ECC_LEN * bytes_per_page.div_ceil(ECC_SECTOR_SIZE)
}

/// The raw 12-byte metadata record at the start of the spare area
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct SpareRecord {
    /// Logical page number (data pages) or usnDec (control pages)
    word0: u32,

    /// USN (data pages) or the page's index within its table (control pages)
    word1: u32,
    type2: u8,
    type1: u8,
    ecc_mark: u8,
    reserved: u8,
}

/// What a page holds, as tagged in its spare area
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageType {
    /// User data written to a log or map block
    Data,
    /// User data in the last page of a block
    DataTerminal,
    /// FTL checkpoint header
    FtlContext,
    MapTable,
    LogOffsets,
    EraseCounters,
    Stats,
    ReadCounters,
    /// A write happened after the last checkpoint
    Unclean,
    VflContext,
    DeviceInfo,
    Other(u8),
}

impl From<PageType> for u8 {
    fn from(value: PageType) -> Self {
        match value {
            PageType::Data => 0x40,
            PageType::DataTerminal => 0x41,
            PageType::FtlContext => 0x43,
            PageType::MapTable => 0x44,
            PageType::LogOffsets => 0x45,
            PageType::EraseCounters => 0x46,
            PageType::Stats => 0x47,
            PageType::ReadCounters => 0x49,
            PageType::Unclean => 0x4F,
            PageType::VflContext => 0x80,
            PageType::DeviceInfo => 0x81,
            PageType::Other(x) => x,
        }
    }
}

impl From<u8> for PageType {
    fn from(value: u8) -> Self {
        match value {
            0x40 => PageType::Data,
            0x41 => PageType::DataTerminal,
            0x43 => PageType::FtlContext,
            0x44 => PageType::MapTable,
            0x45 => PageType::LogOffsets,
            0x46 => PageType::EraseCounters,
            0x47 => PageType::Stats,
            0x49 => PageType::ReadCounters,
            0x4F => PageType::Unclean,
            0x80 => PageType::VflContext,
            0x81 => PageType::DeviceInfo,
            x => PageType::Other(x),
        }
    }
}

impl PageType {
    pub fn is_data(self) -> bool {
        matches!(self, PageType::Data | PageType::DataTerminal)
    }
}

/// Decoded spare metadata for one page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SpareData {
    pub page_type: PageType,
    word0: u32,
    word1: u32,

    /// 0xFF for a page written from known-good data
    pub ecc_mark: u8,
}

impl SpareData {
    /// Spare data for a user-data page
    pub fn data(lpn: u32, usn: u32, terminal: bool) -> Self {
        Self {
            page_type: match terminal {
                true => PageType::DataTerminal,
                false => PageType::Data,
            },
            word0: lpn,
            word1: usn,
            ecc_mark: 0xFF,
        }
    }

    /// Spare data for a control page (context, sub-table or marker)
    pub fn control(page_type: PageType, usn_dec: u32, index: u16) -> Self {
        Self {
            page_type,
            word0: usn_dec,
            word1: u32::from(index),
            ecc_mark: 0xFF,
        }
    }

    pub fn lpn(&self) -> u32 {
        self.word0
    }

    pub fn usn(&self) -> u32 {
        self.word1
    }

    pub fn usn_dec(&self) -> u32 {
        self.word0
    }

    pub fn index(&self) -> u16 {
        self.word1 as u16
    }

    fn record(&self) -> SpareRecord {
        SpareRecord {
            word0: self.word0,
            word1: self.word1,
            type2: 0,
            type1: self.page_type.into(),
            ecc_mark: self.ecc_mark,
            reserved: 0xFF,
        }
    }
}

impl From<SpareRecord> for SpareData {
    fn from(value: SpareRecord) -> Self {
        Self {
            page_type: value.type1.into(),
            word0: value.word0,
            word1: value.word1,
            ecc_mark: value.ecc_mark,
        }
    }
}

/// Fill `spare` with the metadata record and the ECC codes for `main`
pub fn encode_spare(
    spare_data: &SpareData,
    main: &[u8],
    spare: &mut [u8],
) -> Result<(), NandError> {
    let needed = spare_len_needed(main.len());
    if main.len() % ECC_SECTOR_SIZE != 0 || spare.len() < needed {
        return Err(NandError::InvalidArgs);
    }

    spare.fill(0xFF);

    let record = spare_data
        .record()
        .to_bytes()
        .map_err(|_| NandError::InvalidArgs)?;
    spare[..RECORD_LEN].copy_from_slice(&record);

    let record_ecc = NAND_ECC.checksum(&record);
    spare[RECORD_LEN..RECORD_LEN + RECORD_ECC_LEN].copy_from_slice(&record_ecc.to_le_bytes());

    let codes = spare[RECORD_LEN + RECORD_ECC_LEN..needed].chunks_exact_mut(SECTOR_ECC_LEN);
    for (sector, code) in main.chunks_exact(ECC_SECTOR_SIZE).zip(codes) {
        code.copy_from_slice(&NAND_ECC.checksum(sector).to_le_bytes());
    }

    Ok(())
}

/// Decode the metadata record from a raw spare area
///
/// With `check_blank`, a spare whose metadata is entirely erased reports `EmptyBlock`. With
/// `check_ecc`, the record and every main-area sector are checked against their codes.
pub fn decode_spare(
    main: &[u8],
    spare: &[u8],
    check_ecc: bool,
    check_blank: bool,
) -> Result<SpareData, NandError> {
    let needed = spare_len_needed(main.len());
    if spare.len() < needed {
        return Err(NandError::InvalidArgs);
    }

    let meta = &spare[..RECORD_LEN + RECORD_ECC_LEN];
    if check_blank && meta.is_erased() {
        return Err(NandError::EmptyBlock);
    }

    let (record_bytes, record_ecc) = meta.split_at(RECORD_LEN);

    if check_ecc {
        if NAND_ECC.checksum(record_bytes).to_le_bytes() != record_ecc {
            return Err(NandError::Ecc);
        }

        let codes = spare[RECORD_LEN + RECORD_ECC_LEN..needed].chunks_exact(SECTOR_ECC_LEN);
        for (sector, code) in main.chunks_exact(ECC_SECTOR_SIZE).zip(codes) {
            if NAND_ECC.checksum(sector).to_le_bytes() != code {
                return Err(NandError::Ecc);
            }
        }
    }

    let (_, record) =
        SpareRecord::from_bytes((record_bytes, 0)).map_err(|_| NandError::InvalidArgs)?;

    Ok(record.into())
}
