//! The Virtual Flash Layer presents a flat, bad-block-transparent page space striped across
//! every bank, and persists its remap state in a ring of context blocks per bank.
//!
//! A virtual block spans one physical block in every bank (a superblock). Consecutive virtual
//! pages alternate between banks:
//!
//! ```text
//!              bank 0        bank 1
//!            +---------+   +---------+
//!  vpn 0, 1  | page 0  |   | page 0  |
//!  vpn 2, 3  | page 1  |   | page 1  |
//!     ...    |   ...   |   |   ...   |
//!            +---------+   +---------+
//!         block 5 + vb     block 5 + vb   (unless substituted from the reserved pool)
//! ```
//!
//! Each bank reserves its first blocks: block 0 for the `DEVICEINFOBBT` page, and blocks 1-4 for
//! the ring that [VflContext] copies are appended to, 8 identical copies per commit.

use log::{debug, error, info, warn};
use retry::{delay::Fixed, retry};

use crate::error::{Error, NandError, Result};
use crate::nand::{
    Clock, NandChip, NandDevice, NandGeometry, PageType, SpareData, SystemClock, SPECIAL_BLOCKS,
};

pub mod bbt;
pub mod context;

pub use bbt::DeviceInfoBbt;
pub use context::{ReservedSlot, VflContext};

use bbt::BBT_BLOCK;
use context::VFL_CXT_SIZE;

/// Identical copies written per context commit
const CXT_COPIES: u32 = 8;

/// A commit is only trusted if more than this many copies read back intact
const MIN_GOOD_COPIES: usize = 3;

const CXT_RING_LEN: u16 = 4;

/// How often a failing bank erase is attempted
const ERASE_TRIES: usize = 3;

/// The result of reading one virtual page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageRead {
    /// Never written since the last erase
    Empty,
    Written(SpareData),
}

impl PageRead {
    pub fn spare(self) -> Option<SpareData> {
        match self {
            PageRead::Empty => None,
            PageRead::Written(spare) => Some(spare),
        }
    }
}

/// The VFL for one NAND device
#[derive(Debug)]
pub struct Vfl<C: NandChip, K: Clock = SystemClock> {
    device: NandDevice<C, K>,
    geometry: NandGeometry,

    /// One per bank, populated by `format` or `open`
    contexts: Vec<VflContext>,

    /// Highest `usn_inc` committed to any bank
    usn_inc: u32,
}

impl<C: NandChip, K: Clock> Vfl<C, K> {
    pub fn new(device: NandDevice<C, K>) -> Self {
        Self {
            geometry: *device.geometry(),
            device,
            contexts: Vec::new(),
            usn_inc: 0,
        }
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    pub fn context(&self, bank: u32) -> Option<&VflContext> {
        self.contexts.get(bank as usize)
    }

    pub fn device_mut(&mut self) -> &mut NandDevice<C, K> {
        &mut self.device
    }

    pub fn into_device(self) -> NandDevice<C, K> {
        self.device
    }

    fn context_mut(&mut self, bank: u32) -> Result<&mut VflContext> {
        self.contexts
            .get_mut(bank as usize)
            .ok_or_else(|| Error::NotFound(format!("VFL context for bank {bank}")))
    }

    /// Erase the whole device and lay down fresh bad-block tables and contexts
    pub fn format(&mut self) -> Result<()> {
        let geometry = self.geometry;
        info!(
            "formatting {} banks of {} blocks",
            geometry.banks, geometry.blocks_per_bank
        );

        let rpt = howudoin::new()
            .label("Formatting NAND")
            .set_len(u64::from(geometry.banks * geometry.blocks_per_bank));

        let mut contexts = Vec::with_capacity(geometry.banks as usize);
        for bank in 0..geometry.banks {
            let mut bbt = DeviceInfoBbt::new(
                geometry.blocks_per_bank,
                [1, 2, 3, 4],
                geometry.reserved_pool_start() as u16,
                geometry.reserved_blocks as u16,
            );

            for block in 0..geometry.blocks_per_bank {
                let device = &mut self.device;
                let erased = retry(Fixed::from_millis(0).take(ERASE_TRIES - 1), || {
                    device.erase(bank, block)
                });
                if let Err(e) = erased {
                    warn!("bank {bank} block {block} failed to erase ({}), marking bad", e.error);
                    bbt.set_bad(block);
                }
                rpt.inc();
            }

            if let Some(block) = (0..SPECIAL_BLOCKS).find(|&b| bbt.is_bad(b)) {
                return Err(Error::Inconsistent(format!(
                    "bank {bank}: reserved VFL block {block} is bad"
                )));
            }

            let mut page = vec![0xFF; geometry.bytes_per_page];
            bbt.encode(&mut page)
                .map_err(|e| Error::Inconsistent(e.to_string()))?;
            self.device.write(
                bank,
                BBT_BLOCK * geometry.pages_per_block,
                &page,
                &SpareData::control(PageType::DeviceInfo, 0, 0),
            )?;

            let mut cxt = VflContext::new(&geometry, &bbt);
            for block in SPECIAL_BLOCKS..geometry.reserved_pool_start() {
                if !bbt.is_bad(block) {
                    continue;
                }
                match cxt.allocate_substitute(block) {
                    Some(sub) => debug!("bank {bank}: block {block} substituted by {sub}"),
                    None => warn!("bank {bank}: no reserved block left for bad block {block}"),
                }
            }
            contexts.push(cxt);
        }
        rpt.close();

        self.contexts = contexts;
        self.usn_inc = 0;
        for bank in 0..geometry.banks {
            self.commit_cxt(bank)?;
        }

        Ok(())
    }

    /// Check that every bank carries a usable `DEVICEINFOBBT`
    pub fn verify(&mut self) -> Result<()> {
        for bank in 0..self.geometry.banks {
            let bbt = self.read_bbt(bank)?;

            let pool_end = u32::from(bbt.reserved_pool_start) + u32::from(bbt.reserved_pool_size);
            let ring_ok = bbt
                .cxt_blocks
                .iter()
                .all(|&b| b != 0 && u32::from(b) < SPECIAL_BLOCKS);
            if pool_end > self.geometry.blocks_per_bank || !ring_ok {
                return Err(Error::Inconsistent(format!(
                    "bank {bank}: bad-block table does not fit the geometry"
                )));
            }
        }
        Ok(())
    }

    /// Load the newest context of every bank, then agree on the FTL control blocks
    pub fn open(&mut self) -> Result<()> {
        let mut contexts = Vec::with_capacity(self.geometry.banks as usize);
        for bank in 0..self.geometry.banks {
            contexts.push(self.open_bank(bank)?);
        }

        let newest = contexts
            .iter()
            .max_by_key(|cxt| cxt.usn_inc)
            .map(|cxt| (cxt.usn_inc, cxt.ftl_ctrl_blocks))
            .ok_or_else(|| Error::NotFound("no banks".into()))?;

        for cxt in &mut contexts {
            cxt.ftl_ctrl_blocks = newest.1;
        }
        self.usn_inc = newest.0;
        self.contexts = contexts;

        info!("VFL open, FTL control blocks {:?}", newest.1);
        Ok(())
    }

    fn read_bbt(&mut self, bank: u32) -> Result<DeviceInfoBbt> {
        let mut page = vec![0u8; self.geometry.bytes_per_page];
        for block in 0..SPECIAL_BLOCKS {
            let location = block * self.geometry.pages_per_block;
            if let Ok(PageRead::Written(_)) =
                self.read_physical(bank, location, Some(&mut page), true)
            {
                if let Some(bbt) = DeviceInfoBbt::decode(&page) {
                    return Ok(bbt);
                }
            }
        }

        Err(Error::NotFound(format!("DEVICEINFOBBT on bank {bank}")))
    }

    fn open_bank(&mut self, bank: u32) -> Result<VflContext> {
        let ppb = self.geometry.pages_per_block;
        let bbt = self.read_bbt(bank)?;

        // The ring block started most recently has the lowest usn_dec on its first page
        let mut newest: Option<(usize, u32)> = None;
        for (i, &block) in bbt.cxt_blocks.iter().enumerate() {
            match self.read_physical(bank, u32::from(block) * ppb, None, true) {
                Ok(PageRead::Written(spare)) if spare.page_type == PageType::VflContext => {
                    if newest.map_or(true, |(_, usn_dec)| spare.usn_dec() < usn_dec) {
                        newest = Some((i, spare.usn_dec()));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("bank {bank}: VFL context block {block} unreadable: {e}"),
            }
        }
        let (ring_index, _) =
            newest.ok_or_else(|| Error::NotFound(format!("VFL context on bank {bank}")))?;
        let block = u32::from(bbt.cxt_blocks[ring_index]);

        let mut page = vec![0u8; self.geometry.bytes_per_page];
        for group in (0..ppb).step_by(CXT_COPIES as usize).rev() {
            for copy in 0..CXT_COPIES {
                let location = block * ppb + group + copy;
                match self.read_physical(bank, location, Some(&mut page), true) {
                    Ok(PageRead::Written(spare)) if spare.page_type == PageType::VflContext => {}
                    _ => continue,
                }

                let Ok(mut cxt) = VflContext::decode(&page) else {
                    continue;
                };
                if !cxt.check_checksum() || !cxt.fits(&self.geometry) {
                    warn!("bank {bank}: VFL context copy at page {location} rejected");
                    continue;
                }

                cxt.active_cxt_block = ring_index as u16;
                cxt.next_cxt_page = (group + CXT_COPIES) as u16;
                debug!("bank {bank}: VFL context loaded from block {block} page {group}");
                return Ok(cxt);
            }
        }

        Err(Error::NotFound(format!("valid VFL context on bank {bank}")))
    }

    /// Translate a virtual page to (bank, physical page within the bank)
    fn locate(&self, vpn: u32) -> Result<(u32, u32)> {
        let g = &self.geometry;
        if vpn >= g.user_pages_total {
            return Err(Error::InvalidArgs(format!("virtual page {vpn} out of range")));
        }

        let bank = vpn % g.banks;
        let vb = vpn / g.pages_per_sublk;
        let page = (vpn / g.banks) % g.pages_per_block;

        let cxt = self
            .contexts
            .get(bank as usize)
            .ok_or_else(|| Error::NotFound("VFL is not open".into()))?;
        let block = cxt.physical_block(SPECIAL_BLOCKS + vb);

        Ok((bank, block * g.pages_per_block + page))
    }

    /// Read a physical page, retrying once after a bank reset on a transient failure
    fn read_physical(
        &mut self,
        bank: u32,
        page: u32,
        mut buf: Option<&mut [u8]>,
        empty_ok: bool,
    ) -> Result<PageRead> {
        let mut result = self
            .device
            .read(bank, page, buf.as_deref_mut(), true, true)
            .map_err(Error::from);

        if let Err(e) = &result {
            if e.is_transient() {
                warn!("bank {bank} page {page}: {e}, resetting bank and retrying");
                let timeout = self.device.reset_timeout();
                self.device.bank_reset(bank, timeout)?;
                result = self
                    .device
                    .read(bank, page, buf.as_deref_mut(), true, true)
                    .map_err(Error::from);
            }
        }

        match result {
            Ok(spare) => Ok(PageRead::Written(spare)),
            Err(Error::Nand(NandError::EmptyBlock)) if empty_ok => Ok(PageRead::Empty),
            Err(Error::Nand(NandError::EmptyBlock)) => Err(NandError::Io.into()),
            Err(e) => Err(e),
        }
    }

    /// Read one virtual page
    ///
    /// Unless `empty_ok`, an erased page is reported as an I/O error.
    pub fn read(&mut self, vpn: u32, buf: Option<&mut [u8]>, empty_ok: bool) -> Result<PageRead> {
        let (bank, page) = self.locate(vpn)?;
        self.read_physical(bank, page, buf, empty_ok)
    }

    /// Read the spare metadata of a virtual page without checking any ECC codes
    ///
    /// Scans use this to place a page whose data is damaged; the result is only a hint.
    pub fn read_unchecked(&mut self, vpn: u32) -> Result<PageRead> {
        let (bank, page) = self.locate(vpn)?;
        match self.device.read(bank, page, None, false, true) {
            Ok(spare) => Ok(PageRead::Written(spare)),
            Err(NandError::EmptyBlock) => Ok(PageRead::Empty),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a batch of arbitrary virtual pages into consecutive page-sized chunks of `buf`
    ///
    /// Erased pages are allowed; the first failure aborts the batch.
    pub fn read_scattered(&mut self, vpns: &[u32], buf: &mut [u8]) -> Result<Vec<PageRead>> {
        let bpp = self.geometry.bytes_per_page;
        if buf.len() < vpns.len() * bpp {
            return Err(Error::InvalidArgs("buffer too small".into()));
        }

        vpns.iter()
            .zip(buf.chunks_exact_mut(bpp))
            .map(|(&vpn, chunk)| self.read(vpn, Some(chunk), true))
            .collect()
    }

    /// Read `count` virtual pages starting at `start`
    pub fn read_contiguous(
        &mut self,
        start: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<Vec<PageRead>> {
        let vpns: Vec<u32> = (start..start + count).collect();
        self.read_scattered(&vpns, buf)
    }

    /// Program one virtual page, which must currently be erased
    pub fn write(&mut self, vpn: u32, buf: &[u8], spare: &SpareData) -> Result<()> {
        let (bank, page) = self.locate(vpn)?;

        match self.read_physical(bank, page, None, true) {
            Ok(PageRead::Empty) => {}
            Ok(PageRead::Written(_)) | Err(Error::Nand(NandError::Ecc)) => {
                error!("refusing to write virtual page {vpn}: page is not empty");
                return Err(Error::Inconsistent(format!(
                    "write to non-empty virtual page {vpn}"
                )));
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.device.write(bank, page, buf, spare) {
            warn!("write to virtual page {vpn} (bank {bank} page {page}) failed: {e}");
            let cxt = self.context_mut(bank)?;
            cxt.write_fail_count = cxt.write_fail_count.saturating_add(1);
            cxt.gen_checksum();
            self.schedule_block_for_remap(bank, page / self.geometry.pages_per_block);
            return Err(e.into());
        }

        Ok(())
    }

    /// Erase a virtual block: the matching physical block in every bank
    pub fn erase(&mut self, vb: u32) -> Result<()> {
        if vb >= self.geometry.user_sublks_total {
            return Err(Error::InvalidArgs(format!("virtual block {vb} out of range")));
        }

        let candidate = SPECIAL_BLOCKS + vb;
        for bank in 0..self.geometry.banks {
            self.remap_block(bank, candidate)?;

            let block = self.context_mut(bank)?.physical_block(candidate);
            let device = &mut self.device;
            let erased = retry(Fixed::from_millis(0).take(ERASE_TRIES - 1), || {
                device.erase(bank, block)
            });

            if let Err(e) = erased {
                error!("bank {bank} block {block} failed to erase: {}", e.error);
                let cxt = self.context_mut(bank)?;
                cxt.erase_fail_count = cxt.erase_fail_count.saturating_add(1);
                cxt.gen_checksum();
                return Err(e.error.into());
            }
        }

        Ok(())
    }

    /// The FTL's control blocks, as agreed by every bank
    pub fn ftl_ctrl_blocks(&self) -> Result<[u16; 3]> {
        self.contexts
            .first()
            .map(|cxt| cxt.ftl_ctrl_blocks)
            .ok_or_else(|| Error::NotFound("VFL is not open".into()))
    }

    /// Record new FTL control blocks in every bank
    pub fn set_ftl_ctrl_blocks(&mut self, blocks: [u16; 3]) -> Result<()> {
        for bank in 0..self.geometry.banks {
            self.context_mut(bank)?.ftl_ctrl_blocks = blocks;
            self.commit_cxt(bank)?;
        }
        Ok(())
    }

    /// Persist a bank's context, moving on through the ring when a block fills or a store fails
    pub fn commit_cxt(&mut self, bank: u32) -> Result<()> {
        self.usn_inc += 1;
        let usn_inc = self.usn_inc;
        let ppb = self.geometry.pages_per_block;

        let cxt = self.context_mut(bank)?;
        cxt.usn_inc = usn_inc;
        cxt.usn_dec = cxt.usn_dec.saturating_sub(1);
        let mut rotate = u32::from(cxt.next_cxt_page) + CXT_COPIES > ppb;

        for _ in 0..CXT_RING_LEN - 1 {
            if rotate {
                self.rotate_cxt_block(bank)?;
            }

            match self.store_cxt(bank) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("bank {bank}: VFL context store failed: {e}");
                    rotate = true;
                }
            }
        }

        error!("bank {bank}: could not commit VFL context");
        Err(Error::Inconsistent(format!(
            "VFL context commit failed on bank {bank}"
        )))
    }

    /// Move to the next ring block that erases successfully
    fn rotate_cxt_block(&mut self, bank: u32) -> Result<()> {
        for _ in 0..ERASE_TRIES {
            let cxt = self.context_mut(bank)?;
            cxt.active_cxt_block = (cxt.active_cxt_block + 1) % CXT_RING_LEN;
            cxt.next_cxt_page = 0;
            let block = u32::from(cxt.cxt_blocks[usize::from(cxt.active_cxt_block)]);

            match self.device.erase(bank, block) {
                Ok(()) => {
                    debug!("bank {bank}: VFL context moved to block {block}");
                    return Ok(());
                }
                Err(e) => warn!("bank {bank}: VFL context block {block} failed to erase: {e}"),
            }
        }

        Err(NandError::Io.into())
    }

    /// Append `CXT_COPIES` copies of the context at the ring cursor and check them
    fn store_cxt(&mut self, bank: u32) -> Result<()> {
        let ppb = self.geometry.pages_per_block;
        let bpp = self.geometry.bytes_per_page;

        let cxt = self.context_mut(bank)?;
        let block = u32::from(cxt.cxt_blocks[usize::from(cxt.active_cxt_block)]);
        let start = block * ppb + u32::from(cxt.next_cxt_page);
        cxt.next_cxt_page += CXT_COPIES as u16;
        cxt.gen_checksum();

        let usn_dec = cxt.usn_dec;
        let encoded = cxt.encode();
        let mut page = vec![0xFF; bpp];
        page[..VFL_CXT_SIZE].copy_from_slice(&encoded);

        for copy in 0..CXT_COPIES {
            let spare = SpareData::control(PageType::VflContext, usn_dec, copy as u16);
            self.device.write(bank, start + copy, &page, &spare)?;
        }

        let mut readback = vec![0u8; bpp];
        let mut good = 0;
        for copy in 0..CXT_COPIES {
            if let Ok(PageRead::Written(_)) =
                self.read_physical(bank, start + copy, Some(&mut readback), false)
            {
                if readback[..VFL_CXT_SIZE] == encoded[..] {
                    good += 1;
                }
            }
        }

        if good <= MIN_GOOD_COPIES {
            return Err(Error::Inconsistent(format!(
                "only {good} VFL context copies verified"
            )));
        }
        Ok(())
    }

    #[cfg(feature = "bad-block-remap")]
    fn schedule_block_for_remap(&mut self, bank: u32, block: u32) {
        let Some(cxt) = self.contexts.get_mut(bank as usize) else {
            return;
        };
        if cxt.schedule_remap(block) {
            cxt.gen_checksum();
            info!("bank {bank} block {block} scheduled for remapping");
        } else {
            warn!("bank {bank} block {block} could not be scheduled for remapping");
        }
    }

    #[cfg(not(feature = "bad-block-remap"))]
    fn schedule_block_for_remap(&mut self, bank: u32, block: u32) {
        debug!("bank {bank} block {block} failed a write; runtime remapping is disabled");
    }

    /// Substitute `candidate` from the reserved pool if its physical block is scheduled
    #[cfg(feature = "bad-block-remap")]
    fn remap_block(&mut self, bank: u32, candidate: u32) -> Result<()> {
        let cxt = self.context_mut(bank)?;
        let physical = cxt.physical_block(candidate);
        if !cxt.scheduled_remaps().contains(&(physical as u16)) {
            return Ok(());
        }

        cxt.unschedule_remap(physical);
        if physical != candidate {
            cxt.retire_substitute(candidate);
        }
        match cxt.allocate_substitute(candidate) {
            Some(sub) => info!("bank {bank}: block {physical} remapped to {sub}"),
            None => warn!("bank {bank}: reserved pool exhausted, block {physical} stays"),
        }

        self.commit_cxt(bank)
    }

    #[cfg(not(feature = "bad-block-remap"))]
    fn remap_block(&mut self, _bank: u32, _candidate: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::NandTimeouts;
    use crate::nand::{Phase, SimClock, SimNand, TEST_LAYOUT};

    type TestVfl = Vfl<SimNand, SimClock>;

    fn vfl_on(nand: SimNand) -> anyhow::Result<TestVfl> {
        let device = NandDevice::new(nand, SimClock::default(), NandTimeouts::default())?;
        Ok(Vfl::new(device))
    }

    fn formatted() -> anyhow::Result<TestVfl> {
        let mut vfl = vfl_on(SimNand::new(TEST_LAYOUT))?;
        vfl.format()?;
        Ok(vfl)
    }

    fn reopen(vfl: TestVfl) -> anyhow::Result<TestVfl> {
        let mut vfl = vfl_on(vfl.into_device().into_chip())?;
        vfl.verify()?;
        vfl.open()?;
        Ok(vfl)
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; TEST_LAYOUT.bytes_per_page]
    }

    #[test]
    fn test_format_open() -> anyhow::Result<()> {
        let vfl = formatted()?;
        let formatted_cxt = vfl.context(1).cloned();

        let vfl = reopen(vfl)?;
        assert_eq!(vfl.ftl_ctrl_blocks()?, [0, 1, 2]);
        assert_eq!(vfl.context(1).cloned(), formatted_cxt);
        assert_eq!(vfl.context(1).map(|c| c.next_cxt_page), Some(8));
        Ok(())
    }

    #[test]
    fn test_open_unformatted() -> anyhow::Result<()> {
        let mut vfl = vfl_on(SimNand::new(TEST_LAYOUT))?;
        assert!(matches!(vfl.verify(), Err(Error::NotFound(_))));
        assert!(matches!(vfl.open(), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_addressing() -> anyhow::Result<()> {
        let vfl = formatted()?;
        assert_eq!(vfl.locate(0)?, (0, 5 * 16));
        assert_eq!(vfl.locate(1)?, (1, 5 * 16));
        assert_eq!(vfl.locate(2)?, (0, 5 * 16 + 1));
        assert_eq!(vfl.locate(31)?, (1, 5 * 16 + 15));
        assert_eq!(vfl.locate(33)?, (1, 6 * 16));
        assert!(matches!(vfl.locate(55 * 32), Err(Error::InvalidArgs(_))));
        Ok(())
    }

    #[test]
    fn test_read_write() -> anyhow::Result<()> {
        let mut vfl = formatted()?;
        let mut out = page(0);

        assert_eq!(vfl.read(70, Some(&mut out), true)?, PageRead::Empty);
        assert!(matches!(
            vfl.read(70, Some(&mut out), false),
            Err(Error::Nand(NandError::Io))
        ));

        let spare = SpareData::data(12, 5, false);
        vfl.write(70, &page(0x42), &spare)?;
        assert_eq!(vfl.read(70, Some(&mut out), false)?, PageRead::Written(spare));
        assert_eq!(out, page(0x42));

        // A second write to the same page is refused and leaves the data intact
        assert!(matches!(
            vfl.write(70, &page(0x43), &spare),
            Err(Error::Inconsistent(_))
        ));
        vfl.read(70, Some(&mut out), false)?;
        assert_eq!(out, page(0x42));

        vfl.erase(70 / 32)?;
        assert_eq!(vfl.read(70, None, true)?, PageRead::Empty);
        vfl.write(70, &page(0x43), &spare)?;
        Ok(())
    }

    #[test]
    fn test_read_batches() -> anyhow::Result<()> {
        let mut vfl = formatted()?;
        for vpn in [64, 65, 100] {
            vfl.write(vpn, &page(vpn as u8), &SpareData::data(vpn, 1, false))?;
        }

        let mut buf = vec![0u8; 3 * TEST_LAYOUT.bytes_per_page];
        let reads = vfl.read_scattered(&[100, 64, 99], &mut buf)?;
        assert_eq!(reads[0].spare().map(|s| s.lpn()), Some(100));
        assert_eq!(reads[2], PageRead::Empty);
        assert_eq!(buf[..TEST_LAYOUT.bytes_per_page], page(100)[..]);

        let reads = vfl.read_contiguous(64, 3, &mut buf)?;
        assert_eq!(reads.iter().filter(|r| **r == PageRead::Empty).count(), 1);
        assert_eq!(buf[TEST_LAYOUT.bytes_per_page..][..4], [65; 4]);
        Ok(())
    }

    #[test]
    fn test_read_retries_after_reset() -> anyhow::Result<()> {
        let mut vfl = formatted()?;
        vfl.write(3, &page(1), &SpareData::data(3, 1, false))?;

        vfl.device_mut()
            .chip_mut()
            .stall(1, Phase::TransferDone, false);
        assert!(vfl.read(3, None, false).is_ok());

        vfl.device_mut()
            .chip_mut()
            .stall(1, Phase::TransferDone, true);
        assert!(matches!(
            vfl.read(3, None, false),
            Err(Error::Nand(NandError::Timeout(Phase::TransferDone)))
        ));
        Ok(())
    }

    #[test]
    fn test_context_ring_rotation() -> anyhow::Result<()> {
        let mut vfl = formatted()?;

        // Two commits fit per 16-page block, so this wraps the four-block ring
        for _ in 0..10 {
            vfl.commit_cxt(0)?;
        }
        let expected = vfl.context(0).cloned();
        assert_eq!(expected.as_ref().map(|c| c.active_cxt_block), Some(1));

        let vfl = reopen(vfl)?;
        assert_eq!(vfl.context(0).cloned(), expected);
        Ok(())
    }

    #[test]
    fn test_newest_ctrl_blocks_win() -> anyhow::Result<()> {
        let mut vfl = formatted()?;

        // As if power failed after bank 0 was updated but before bank 1
        vfl.context_mut(0)?.ftl_ctrl_blocks = [7, 8, 9];
        vfl.commit_cxt(0)?;

        let mut vfl = reopen(vfl)?;
        assert_eq!(vfl.ftl_ctrl_blocks()?, [7, 8, 9]);
        assert_eq!(vfl.context_mut(1)?.ftl_ctrl_blocks, [7, 8, 9]);

        vfl.set_ftl_ctrl_blocks([3, 4, 5])?;
        let vfl = reopen(vfl)?;
        assert_eq!(vfl.ftl_ctrl_blocks()?, [3, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_factory_bad_block_substituted() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(1, 9);
        let mut vfl = vfl_on(nand)?;
        vfl.format()?;
        let mut vfl = reopen(vfl)?;

        assert_eq!(
            vfl.context(1).map(|c| c.pool_map().to_vec()),
            Some(vec![ReservedSlot::Substitutes(9)])
        );

        // Virtual block 4 is physical block 9; bank 1 lands in reserved block 60
        let vpn = 4 * 32 + 1;
        assert_eq!(vfl.locate(vpn)?, (1, 60 * 16));
        vfl.erase(4)?;
        vfl.write(vpn, &page(0x99), &SpareData::data(0, 1, false))?;
        let mut out = page(0);
        vfl.read(vpn, Some(&mut out), false)?;
        assert_eq!(out, page(0x99));
        Ok(())
    }

    #[test]
    fn test_erase_failure_counted() -> anyhow::Result<()> {
        let mut vfl = formatted()?;
        vfl.device_mut().chip_mut().fail_erase(1, 5 + 10);

        assert!(matches!(vfl.erase(10), Err(Error::Nand(NandError::Io))));
        assert_eq!(vfl.context(1).map(|c| c.erase_fail_count), Some(1));
        assert_eq!(vfl.context(0).map(|c| c.erase_fail_count), Some(0));
        Ok(())
    }

    #[cfg(not(feature = "bad-block-remap"))]
    #[test]
    fn test_write_failure_does_not_remap() -> anyhow::Result<()> {
        let mut vfl = formatted()?;
        vfl.device_mut().chip_mut().fail_program(0, 5 + 2);

        assert!(vfl.write(64, &page(1), &SpareData::data(0, 1, false)).is_err());
        assert_eq!(vfl.context(0).map(|c| c.write_fail_count), Some(1));

        vfl.erase(2)?;
        assert_eq!(vfl.locate(64)?, (0, 7 * 16));
        Ok(())
    }

    #[cfg(feature = "bad-block-remap")]
    #[test]
    fn test_write_failure_remaps_on_erase() -> anyhow::Result<()> {
        let mut vfl = formatted()?;
        vfl.device_mut().chip_mut().fail_program(0, 5 + 2);

        assert!(vfl.write(64, &page(1), &SpareData::data(0, 1, false)).is_err());
        assert_eq!(vfl.context(0).map(|c| c.scheduled_remaps().to_vec()), Some(vec![7]));

        vfl.erase(2)?;
        assert_eq!(vfl.locate(64)?, (0, 60 * 16));
        vfl.write(64, &page(1), &SpareData::data(0, 1, false))?;

        let vfl = reopen(vfl)?;
        assert_eq!(vfl.locate(64)?, (0, 60 * 16));
        Ok(())
    }
}
