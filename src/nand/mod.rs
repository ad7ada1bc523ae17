//! Abstractions and code to access raw, multi-bank NAND flash

use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::{Error, NandError, Result};

pub mod device;
pub mod ecc;
pub mod sim;

pub use device::NandDevice;
pub use ecc::{PageType, SpareData};
pub use sim::{SimClock, SimNand};

/// Main-area bytes covered by one ECC code
pub const ECC_SECTOR_SIZE: usize = 512;

/// Blocks at the start of every bank that are not handed to the VFL's user space: the
/// `DEVICEINFOBBT` block followed by the four-block VFL context ring
pub const SPECIAL_BLOCKS: u32 = 5;

/// Largest bank the VFL bad-block bitmap can describe
pub const MAX_BLOCKS_PER_BANK: u32 = 2256;

/// Largest reserved pool the VFL remap table can describe
pub const MAX_RESERVED_BLOCKS: u32 = 820;

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub banks: u32,
    pub blocks_per_bank: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub bytes_per_spare: usize,
}

/// Parse strings like "BANKSxBLOCKSxPAGESxBYTESxSPARE"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [banks, blocks_per_bank, pages_per_block, bytes_per_page, bytes_per_spare]: [&str;
            5] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#x#"))?;

        Ok(NandLayout {
            banks: banks.parse()?,
            blocks_per_bank: blocks_per_bank.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.parse()?,
            bytes_per_spare: bytes_per_spare.parse()?,
        })
    }
}

/// Validated geometry, plus the quantities derived from it that the VFL and FTL address by
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandGeometry {
    pub banks: u32,
    pub blocks_per_bank: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub bytes_per_spare: usize,

    /// Pages in a superblock: one block from every bank
    pub pages_per_sublk: u32,

    /// Blocks per bank set aside at the end of the bank to substitute for bad ones
    pub reserved_blocks: u32,

    /// Superblocks (virtual blocks) available to the FTL
    pub user_sublks_total: u32,

    pub user_pages_total: u32,
}

impl NandGeometry {
    /// Check a layout and derive the addressing quantities from it
    pub fn new(layout: NandLayout) -> Result<Self> {
        let invalid = |what: &str| Err(Error::InvalidArgs(format!("{what} in {layout:?}")));

        if layout.banks == 0 {
            return invalid("no banks");
        }
        if layout.pages_per_block == 0 || layout.pages_per_block % 8 != 0 {
            return invalid("pages per block must be a nonzero multiple of 8");
        }
        if layout.bytes_per_page < 2048 || layout.bytes_per_page % ECC_SECTOR_SIZE != 0 {
            return invalid("page size must be a multiple of 512, at least 2048");
        }
        if layout.bytes_per_spare < ecc::spare_len_needed(layout.bytes_per_page) {
            return invalid("spare area too small for ECC");
        }
        if layout.blocks_per_bank > MAX_BLOCKS_PER_BANK {
            return invalid("too many blocks per bank");
        }

        let reserved_blocks = layout.blocks_per_bank / 16;
        if reserved_blocks > MAX_RESERVED_BLOCKS {
            return invalid("reserved pool too large");
        }

        let user_sublks_total = layout
            .blocks_per_bank
            .checked_sub(SPECIAL_BLOCKS + reserved_blocks)
            .filter(|&n| n > 0);
        let Some(user_sublks_total) = user_sublks_total else {
            return invalid("no room for user blocks");
        };

        let pages_per_sublk = layout.pages_per_block * layout.banks;

        Ok(Self {
            banks: layout.banks,
            blocks_per_bank: layout.blocks_per_bank,
            pages_per_block: layout.pages_per_block,
            bytes_per_page: layout.bytes_per_page,
            bytes_per_spare: layout.bytes_per_spare,
            pages_per_sublk,
            reserved_blocks,
            user_sublks_total,
            user_pages_total: user_sublks_total * pages_per_sublk,
        })
    }

    /// First physical block of the reserved (substitute) pool in every bank
    pub fn reserved_pool_start(&self) -> u32 {
        self.blocks_per_bank - self.reserved_blocks
    }

    pub fn pages_per_bank(&self) -> u32 {
        self.blocks_per_bank * self.pages_per_block
    }

    pub fn layout(&self) -> NandLayout {
        NandLayout {
            banks: self.banks,
            blocks_per_bank: self.blocks_per_bank,
            pages_per_block: self.pages_per_block,
            bytes_per_page: self.bytes_per_page,
            bytes_per_spare: self.bytes_per_spare,
        }
    }
}

/// The hardware handshakes that every NAND operation waits on
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Phase {
    CommandLatch,
    AddressLatch,
    TransferDone,
    BankReady,
}

/// Raw access to a NAND chip array, one bank at a time
///
/// Page numbers are absolute within a bank (`block * pages_per_block + page`). Implementations
/// do not compute or check ECC; that is [NandDevice]'s job.
pub trait NandChip {
    fn layout(&self) -> NandLayout;

    /// Transfer the main and spare areas of a page
    fn read_page(
        &mut self,
        bank: u32,
        page: u32,
        main: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), NandError>;

    /// Program a page; pages within a block must be programmed in ascending order
    fn program_page(&mut self, bank: u32, page: u32, main: &[u8], spare: &[u8])
        -> Result<(), NandError>;

    fn erase_block(&mut self, bank: u32, block: u32) -> Result<(), NandError>;

    /// Poll whether `bank` has finished the given phase of the current operation
    fn phase_complete(&mut self, bank: u32, phase: Phase) -> bool;

    /// Reset the controller state of a single bank
    fn reset(&mut self, bank: u32) -> Result<(), NandError>;
}

/// Time source for the polling loops, injectable for tests
pub trait Clock {
    /// Monotonic time since some arbitrary epoch
    fn now(&self) -> Duration;

    /// Give up the processor between polls
    fn yield_now(&self);
}

/// Wall-clock [Clock] that yields to the OS scheduler
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    banks: 2,
    blocks_per_bank: 64,
    pages_per_block: 16,
    bytes_per_page: 2048,
    bytes_per_spare: 64,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "2x64x16x2048x64".parse()?;
    assert_eq!(layout, TEST_LAYOUT);
    assert!("2x64x16x2048".parse::<NandLayout>().is_err());
    assert!("2x64x16x2048xZ".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_geometry() -> anyhow::Result<()> {
    let geometry = NandGeometry::new(TEST_LAYOUT)?;
    assert_eq!(geometry.pages_per_sublk, 32);
    assert_eq!(geometry.reserved_blocks, 4);
    assert_eq!(geometry.reserved_pool_start(), 60);
    assert_eq!(geometry.user_sublks_total, 64 - 5 - 4);
    assert_eq!(geometry.user_pages_total, 55 * 32);
    assert_eq!(geometry.layout(), TEST_LAYOUT);
    Ok(())
}

#[test]
fn test_geometry_rejects() {
    let bad = [
        NandLayout {
            pages_per_block: 12,
            ..TEST_LAYOUT
        },
        NandLayout {
            bytes_per_page: 1024,
            ..TEST_LAYOUT
        },
        NandLayout {
            bytes_per_spare: 16,
            ..TEST_LAYOUT
        },
        NandLayout {
            blocks_per_bank: 4096,
            ..TEST_LAYOUT
        },
        NandLayout {
            blocks_per_bank: 5,
            ..TEST_LAYOUT
        },
    ];

    for layout in bad {
        assert!(matches!(
            NandGeometry::new(layout),
            Err(Error::InvalidArgs(_))
        ));
    }
}
