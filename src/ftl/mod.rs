//! The Flash Translation Layer maps consumer-visible logical pages onto the VFL's virtual pages.
//!
//! Every logical block (one superblock's worth of logical pages) is mapped to exactly one
//! virtual block, its map block. Small writes do not touch the map block: they are appended to
//! a log block that belongs to the logical block, and the log is merged back once it fills or
//! its slot is needed elsewhere. A write covering a whole aligned block skips the log and
//! replaces the map block outright.
//!
//! Virtual blocks are partitioned like so, at all times:
//!
//! ```text
//!  ctrl blocks (3) | map blocks (one per logical block) | logs + free pool (20)
//! ```
//!
//! The control blocks hold checkpoints of the [FtlContext]. When no clean checkpoint exists, the
//! context is rebuilt by scanning the spare area of every page (see `restore`).

use log::{info, warn};

use crate::config::FtlConfig;
use crate::error::{Error, NandError, Result};
use crate::nand::{Clock, NandChip, NandDevice, NandGeometry, SystemClock};
use crate::vfl::{PageRead, Vfl};

pub mod context;
mod merge;
mod persist;
mod restore;
mod wear;

pub use context::{FtlContext, FtlStats, LogDescriptor};

use context::{CTRL_BLOCKS, FREE_POOL_SLOTS};

/// A mounted FTL, owning the VFL (and through it, the NAND) underneath it
#[derive(Debug)]
pub struct FtlVolume<C: NandChip, K: Clock = SystemClock> {
    vfl: Vfl<C, K>,
    geometry: NandGeometry,
    config: FtlConfig,
    cxt: FtlContext,
    logical_blocks: u32,
}

impl<C: NandChip, K: Clock> FtlVolume<C, K> {
    /// Size the FTL for the VFL's geometry; nothing is read from flash yet
    pub fn init(vfl: Vfl<C, K>, config: FtlConfig) -> Result<Self> {
        let geometry = *vfl.geometry();
        let virtual_blocks = geometry.user_sublks_total;

        let logical_blocks = virtual_blocks
            .checked_sub((CTRL_BLOCKS + FREE_POOL_SLOTS) as u32)
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                Error::InvalidArgs(format!("{virtual_blocks} virtual blocks are too few"))
            })?;
        persist::check_layout(&geometry, logical_blocks)?;

        Ok(Self {
            vfl,
            geometry,
            config,
            cxt: FtlContext::new(logical_blocks, virtual_blocks),
            logical_blocks,
        })
    }

    /// Bring up the whole stack on a formatted device: verify and open the VFL, then load (or
    /// rebuild) the FTL context
    pub fn setup(device: NandDevice<C, K>, config: FtlConfig) -> Result<Self> {
        let mut vfl = Vfl::new(device);
        vfl.verify()?;
        vfl.open()?;

        let mut ftl = Self::init(vfl, config)?;
        ftl.open()?;
        Ok(ftl)
    }

    /// Format the VFL and lay down an empty FTL on top of it
    pub fn format(&mut self) -> Result<()> {
        self.vfl.format()?;

        let ctrl_blocks = self.vfl.ftl_ctrl_blocks()?;
        let mut cxt = FtlContext::new(self.logical_blocks, self.geometry.user_sublks_total);
        cxt.ctrl_blocks = ctrl_blocks;
        cxt.ctrl_rotate = true;

        let mut unused = (0..self.geometry.user_sublks_total as u16)
            .filter(|vb| !ctrl_blocks.contains(vb));
        for entry in cxt.map_table.iter_mut() {
            *entry = unused
                .next()
                .ok_or_else(|| Error::InvalidArgs("control blocks out of range".into()))?;
        }
        cxt.free_pool.extend(unused);
        cxt.check_pool()?;

        self.cxt = cxt;
        self.commit_with_retries()?;

        info!(
            "FTL formatted: {} logical blocks of {} pages",
            self.logical_blocks, self.geometry.pages_per_sublk
        );
        Ok(())
    }

    /// Load the newest checkpoint, or fall back to a full scan
    ///
    /// Returns the number of logical pages and the page size.
    pub fn open(&mut self) -> Result<(u32, usize)> {
        match self.load_checkpoint() {
            Ok(()) => info!("FTL checkpoint loaded, next USN {}", self.cxt.next_usn),
            Err(e) => {
                warn!("no clean FTL checkpoint ({e}), restoring from a full scan");
                self.rebuild()?;
            }
        }

        Ok((self.logical_pages(), self.geometry.bytes_per_page))
    }

    /// Ignore any checkpoint and rebuild the context by scanning every virtual block
    pub fn rebuild(&mut self) -> Result<()> {
        self.restore()?;

        // A crash before the next sync must restore again, not trust an older checkpoint
        self.mark_unclean()
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &FtlConfig {
        &self.config
    }

    pub fn context(&self) -> &FtlContext {
        &self.cxt
    }

    pub fn logical_pages(&self) -> u32 {
        self.logical_blocks * self.geometry.pages_per_sublk
    }

    pub fn vfl(&self) -> &Vfl<C, K> {
        &self.vfl
    }

    pub fn vfl_mut(&mut self) -> &mut Vfl<C, K> {
        &mut self.vfl
    }

    /// Tear down the stack, returning the chip (e.g. to save a simulated image)
    pub fn into_chip(self) -> C {
        self.vfl.into_device().into_chip()
    }

    fn check_request(&self, lpn: u32, count: u32, buf_len: usize) -> Result<()> {
        let end = lpn.checked_add(count);
        if end.map_or(true, |end| end > self.logical_pages()) {
            return Err(Error::InvalidArgs(format!(
                "logical pages {lpn}+{count} out of range"
            )));
        }
        if buf_len < count as usize * self.geometry.bytes_per_page {
            return Err(Error::InvalidArgs("buffer too small".into()));
        }
        Ok(())
    }

    fn log(&self, slot: usize) -> Result<&LogDescriptor> {
        self.cxt
            .logs
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Inconsistent(format!("log slot {slot} is not active")))
    }

    fn log_mut(&mut self, slot: usize) -> Result<&mut LogDescriptor> {
        self.cxt
            .logs
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::Inconsistent(format!("log slot {slot} is not active")))
    }

    /// The virtual page currently holding a logical page
    fn map_page(&self, lpn: u32) -> u32 {
        let ppsb = self.geometry.pages_per_sublk;
        let (lbn, offset) = ((lpn / ppsb) as u16, lpn % ppsb);

        let in_log = self.cxt.find_log(lbn).and_then(|slot| {
            let log = self.cxt.logs[slot].as_ref()?;
            let index = log.page_offsets[offset as usize]?;
            Some(u32::from(log.vbn) * ppsb + u32::from(index))
        });

        in_log.unwrap_or_else(|| u32::from(self.cxt.map_table[lbn as usize]) * ppsb + offset)
    }

    /// Read `count` logical pages starting at `lpn`
    ///
    /// Pages that fail their ECC check are still copied into `buf`; the read then reports
    /// [Error::EccDegraded] once every page has been attempted.
    pub fn read(&mut self, lpn: u32, count: u32, buf: &mut [u8]) -> Result<()> {
        self.check_request(lpn, count, buf.len())?;

        let ppsb = self.geometry.pages_per_sublk;
        let bpp = self.geometry.bytes_per_page;
        let mut degraded = false;

        let mut done = 0;
        while done < count {
            let first = lpn + done;
            let (lbn, offset) = ((first / ppsb) as u16, first % ppsb);
            let n = (ppsb - offset).min(count - done);
            let chunk = &mut buf[done as usize * bpp..(done + n) as usize * bpp];
            let vpns: Vec<u32> = (first..first + n).map(|p| self.map_page(p)).collect();

            let batch = match self.cxt.find_log(lbn) {
                Some(_) => self.vfl.read_scattered(&vpns, chunk),
                None => self.vfl.read_contiguous(vpns[0], n, chunk),
            };

            match batch {
                Ok(reads) => {
                    for (read, page) in reads.iter().zip(chunk.chunks_exact_mut(bpp)) {
                        if *read == PageRead::Empty {
                            page.fill(0xFF);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "batched read of logical pages {first}+{n} failed ({e}), retrying singly"
                    );
                    let pages = vpns.iter().zip(chunk.chunks_exact_mut(bpp));
                    for (i, (&vpn, page)) in pages.enumerate() {
                        match self.vfl.read(vpn, Some(page), true) {
                            Ok(PageRead::Empty) => page.fill(0xFF),
                            Ok(PageRead::Written(_)) => {}
                            Err(Error::Nand(NandError::Ecc)) => {
                                warn!("logical page {} read with ECC errors", first + i as u32);
                                self.cxt.stats.ecc_read_failures += 1;
                                degraded = true;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            for vpn in vpns {
                let counter = &mut self.cxt.read_counters[(vpn / ppsb) as usize];
                *counter = counter.saturating_add(1);
            }
            self.cxt.stats.pages_read += u64::from(n);
            done += n;
        }

        match degraded {
            true => Err(Error::EccDegraded),
            false => Ok(()),
        }
    }

    /// Write `count` logical pages starting at `lpn`
    pub fn write(&mut self, lpn: u32, count: u32, buf: &[u8]) -> Result<()> {
        self.check_request(lpn, count, buf.len())?;
        if count == 0 {
            return Ok(());
        }

        if self.cxt.clean {
            self.mark_unclean()?;
        }

        let ppsb = self.geometry.pages_per_sublk;
        let bpp = self.geometry.bytes_per_page;

        let mut done = 0;
        while done < count {
            let first = lpn + done;
            let (lbn, offset) = ((first / ppsb) as u16, first % ppsb);
            let n = (ppsb - offset).min(count - done);
            let chunk = &buf[done as usize * bpp..(done + n) as usize * bpp];

            if n == ppsb {
                self.write_block(lbn, chunk)?;
            } else {
                for (i, page) in chunk.chunks_exact(bpp).enumerate() {
                    self.write_log_page(lbn, (offset + i as u32) as u16, page)?;
                }
            }
            self.cxt.stats.pages_written += u64::from(n);
            done += n;
        }

        if self.cxt.swap_counter >= self.config.write_wear_level_trigger {
            self.auto_wearlevel()?;
            self.cxt.swap_counter = 0;
        }

        Ok(())
    }

    /// Make everything written so far survive a power loss without a full scan
    pub fn sync(&mut self) -> Result<()> {
        let refresh_due = self.refresh_due();
        if self.cxt.clean && !refresh_due {
            return Ok(());
        }
        if self.cxt.clean {
            self.mark_unclean()?;
        }

        if self.cxt.free_dirty {
            self.check_for_dirty_free_vb()?;
        }
        if self.cxt.swap_counter >= self.config.sync_wear_level_trigger {
            self.auto_wearlevel()?;
            self.cxt.swap_counter = 0;
        }
        if refresh_due {
            self.read_refresh()?;
        }

        self.commit_with_retries()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::config::NandTimeouts;
    use crate::nand::{SimClock, SimNand, TEST_LAYOUT};

    pub(super) type TestFtl = FtlVolume<SimNand, SimClock>;

    /// Logical pages per logical block
    pub(super) const PPSB: u32 = 32;

    pub(super) fn device(nand: SimNand) -> anyhow::Result<NandDevice<SimNand, SimClock>> {
        Ok(NandDevice::new(
            nand,
            SimClock::default(),
            NandTimeouts::default(),
        )?)
    }

    pub(super) fn formatted_with(config: FtlConfig) -> anyhow::Result<TestFtl> {
        let vfl = Vfl::new(device(SimNand::new(TEST_LAYOUT))?);
        let mut ftl = FtlVolume::init(vfl, config)?;
        ftl.format()?;
        Ok(ftl)
    }

    pub(super) fn formatted() -> anyhow::Result<TestFtl> {
        formatted_with(FtlConfig::default())
    }

    pub(super) fn reopen(ftl: TestFtl) -> anyhow::Result<TestFtl> {
        let config = ftl.config().clone();
        Ok(FtlVolume::setup(device(ftl.into_chip())?, config)?)
    }

    /// A page whose first bytes name the logical page it was written to
    pub(super) fn page(lpn: u32, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; TEST_LAYOUT.bytes_per_page];
        page[..4].copy_from_slice(&lpn.to_le_bytes());
        page
    }

    pub(super) fn pages(lpn: u32, count: u32, fill: u8) -> Vec<u8> {
        (lpn..lpn + count).flat_map(|p| page(p, fill)).collect()
    }

    pub(super) fn read_page(ftl: &mut TestFtl, lpn: u32) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];
        ftl.read(lpn, 1, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_format_layout() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        let cxt = ftl.context();

        assert_eq!(ftl.logical_pages(), 32 * PPSB);
        assert_eq!(cxt.ctrl_blocks, [0, 1, 2]);
        assert_eq!(cxt.map_table[0], 3);
        assert_eq!(cxt.map_table[31], 34);
        assert_eq!(cxt.free_pool.iter().copied().collect::<Vec<_>>(), (35..55).collect::<Vec<_>>());
        assert!(cxt.clean);
        cxt.check_pool()?;

        assert_eq!(read_page(&mut ftl, 100)?, vec![0xFF; TEST_LAYOUT.bytes_per_page]);
        Ok(())
    }

    #[test]
    fn test_too_small() -> anyhow::Result<()> {
        let mut layout = TEST_LAYOUT;
        layout.blocks_per_bank = 28;
        let vfl = Vfl::new(device(SimNand::new(layout))?);
        assert!(matches!(
            FtlVolume::init(vfl, FtlConfig::default()),
            Err(Error::InvalidArgs(_))
        ));
        Ok(())
    }

    #[test]
    fn test_full_block_then_log() -> anyhow::Result<()> {
        let mut ftl = formatted()?;

        ftl.write(0, PPSB, &pages(0, PPSB, 0x11))?;
        let cxt = ftl.context();
        assert_ne!(cxt.map_table[0], 3);
        assert!(cxt.free_pool.contains(&3));
        assert_eq!(cxt.find_log(0), None);
        cxt.check_pool()?;

        ftl.write(0, 1, &page(0, 0x22))?;
        let cxt = ftl.context();
        let log = cxt.find_log(0).and_then(|slot| cxt.logs[slot].clone());
        let log = log.ok_or(anyhow::anyhow!("no log for block 0"))?;
        assert_eq!(log.page_offsets[0], Some(0));
        assert_eq!(log.pages_current, 1);
        assert!(log.sequential);
        cxt.check_pool()?;

        assert_eq!(read_page(&mut ftl, 0)?, page(0, 0x22));
        assert_eq!(read_page(&mut ftl, 1)?, page(1, 0x11));
        Ok(())
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let mut ftl = formatted()?;

        // A fresh log write
        ftl.write(70, 1, &page(70, 1))?;
        ftl.sync()?;
        assert_eq!(read_page(&mut ftl, 70)?, page(70, 1));

        // Enough rewrites of one page to fill its log several times over
        for fill in 0..80 {
            ftl.write(40, 1, &page(40, fill))?;
        }
        ftl.sync()?;
        assert_eq!(read_page(&mut ftl, 40)?, page(40, 79));
        assert!(ftl.context().stats.compactions > 0);

        // A straddling write: tail of block 2, all of block 3, head of block 4
        ftl.write(90, 40, &pages(90, 40, 7))?;
        ftl.sync()?;
        let mut out = vec![0u8; 40 * TEST_LAYOUT.bytes_per_page];
        ftl.read(90, 40, &mut out)?;
        assert_eq!(out, pages(90, 40, 7));
        assert_eq!(read_page(&mut ftl, 70)?, page(70, 1));

        ftl.context().check_pool()?;
        Ok(())
    }

    #[test]
    fn test_sequential_log_fills_into_map() -> anyhow::Result<()> {
        let mut ftl = formatted()?;

        for lpn in 64..96 {
            ftl.write(lpn, 1, &page(lpn, 3))?;
        }
        let log_vb = ftl
            .context()
            .find_log(2)
            .and_then(|slot| ftl.context().logs[slot].as_ref().map(|log| log.vbn));

        // The next write finds the log full and sequential: it becomes the map block as-is
        ftl.write(64, 1, &page(64, 4))?;
        assert_eq!(Some(ftl.context().map_table[2]), log_vb);
        assert_eq!(ftl.context().stats.copy_merges, 1);
        assert_eq!(read_page(&mut ftl, 64)?, page(64, 4));
        assert_eq!(read_page(&mut ftl, 95)?, page(95, 3));
        Ok(())
    }

    #[test]
    fn test_victim_merge() -> anyhow::Result<()> {
        let mut ftl = formatted()?;

        for lbn in 0..17 {
            ftl.write(lbn * PPSB + 1, 1, &page(lbn * PPSB + 1, lbn as u8))?;
        }
        assert_eq!(ftl.context().active_logs(), 17);
        assert_eq!(ftl.context().free_pool.len(), 3);

        // An 18th log needs a slot: the oldest (block 0) is merged away
        ftl.write(20 * PPSB, 1, &page(20 * PPSB, 20))?;
        let cxt = ftl.context();
        assert_eq!(cxt.active_logs(), 17);
        assert_eq!(cxt.find_log(0), None);
        assert!(cxt.find_log(20).is_some());
        assert_eq!(cxt.stats.compactions, 0);
        cxt.check_pool()?;

        for lbn in 0..17 {
            assert_eq!(read_page(&mut ftl, lbn * PPSB + 1)?, page(lbn * PPSB + 1, lbn as u8));
        }
        assert_eq!(read_page(&mut ftl, 0)?, vec![0xFF; TEST_LAYOUT.bytes_per_page]);
        Ok(())
    }

    #[test]
    fn test_invalid_args() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];

        assert!(matches!(ftl.read(1024, 1, &mut out), Err(Error::InvalidArgs(_))));
        assert!(matches!(ftl.read(1023, 2, &mut out), Err(Error::InvalidArgs(_))));
        assert!(matches!(ftl.read(u32::MAX, 2, &mut out), Err(Error::InvalidArgs(_))));
        assert!(matches!(ftl.write(0, 2, &out), Err(Error::InvalidArgs(_))));

        // Rejected requests leave the checkpoint clean
        assert!(ftl.context().clean);
        ftl.write(0, 0, &[])?;
        assert!(ftl.context().clean);
        Ok(())
    }

    #[test]
    fn test_ecc_degraded() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        ftl.write(4 * PPSB, PPSB, &pages(4 * PPSB, PPSB, 0x5A))?;
        ftl.sync()?;

        // Virtual page 0 of the map block is bank 0, page 0 of physical block 5 + vb
        let vb = u32::from(ftl.context().map_table[4]);
        ftl.vfl_mut()
            .device_mut()
            .chip_mut()
            .flip_bit(0, (5 + vb) * 16, 100, 3);

        let mut out = vec![0u8; 2 * TEST_LAYOUT.bytes_per_page];
        assert!(matches!(
            ftl.read(4 * PPSB, 2, &mut out),
            Err(Error::EccDegraded)
        ));
        assert_eq!(ftl.context().stats.ecc_read_failures, 1);

        // The damaged data is still handed back, and its neighbor is intact
        assert_eq!(out[100], 0x5A ^ (1 << 3));
        assert_eq!(out[TEST_LAYOUT.bytes_per_page..], page(4 * PPSB + 1, 0x5A)[..]);
        Ok(())
    }

    #[test]
    fn test_checkpoint_reopen() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        ftl.write(0, PPSB, &pages(0, PPSB, 1))?;
        for lpn in [3, 40, 41, 300] {
            ftl.write(lpn, 1, &page(lpn, 2))?;
        }
        ftl.sync()?;
        let before = ftl.context().clone();

        let mut ftl = reopen(ftl)?;
        let cxt = ftl.context();
        assert_eq!(cxt.stats.restores, 0);
        assert!(cxt.clean);
        assert_eq!(cxt.map_table, before.map_table);
        assert_eq!(cxt.logs, before.logs);
        assert_eq!(cxt.erase_counters, before.erase_counters);
        assert_eq!(cxt.free_pool, before.free_pool);
        assert_eq!(cxt.next_usn, before.next_usn);

        assert_eq!(read_page(&mut ftl, 3)?, page(3, 2));
        assert_eq!(read_page(&mut ftl, 4)?, page(4, 1));
        assert_eq!(read_page(&mut ftl, 300)?, page(300, 2));
        Ok(())
    }

    #[test]
    fn test_unclean_reopen_restores() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        ftl.write(0, PPSB, &pages(0, PPSB, 1))?;
        ftl.sync()?;

        // Not synced: the newest control page is the unclean marker
        ftl.write(5, 1, &page(5, 9))?;
        ftl.write(2 * PPSB, PPSB, &pages(2 * PPSB, PPSB, 8))?;

        let mut ftl = reopen(ftl)?;
        assert_eq!(ftl.context().stats.restores, 1);
        assert!(!ftl.context().clean);
        assert_eq!(read_page(&mut ftl, 5)?, page(5, 9));
        assert_eq!(read_page(&mut ftl, 6)?, page(6, 1));
        assert_eq!(read_page(&mut ftl, 2 * PPSB + 31)?, page(2 * PPSB + 31, 8));

        // A crash before the next sync still restores rather than loading the old checkpoint.
        // Statistics come from that checkpoint, so the count does not grow.
        let mut ftl = reopen(ftl)?;
        assert!(!ftl.context().clean);
        assert_eq!(ftl.context().stats.restores, 1);

        ftl.sync()?;
        let mut ftl = reopen(ftl)?;
        assert!(ftl.context().clean);
        assert_eq!(read_page(&mut ftl, 5)?, page(5, 9));
        Ok(())
    }

    #[test]
    fn test_config_triggers_wear_levelling() -> anyhow::Result<()> {
        let config = FtlConfig {
            write_wear_level_trigger: 1,
            ..Default::default()
        };
        let mut ftl = formatted_with(config)?;
        ftl.write(0, PPSB, &pages(0, PPSB, 11))?;
        ftl.write(33, 1, &page(33, 0))?;

        // As if the free pool had been cycled much harder than the map blocks
        for &vb in &ftl.cxt.free_pool {
            ftl.cxt.erase_counters[usize::from(vb)] = 10;
        }

        // Filling the log forces a compaction, which counts towards the trigger
        for fill in 1..40 {
            ftl.write(33, 1, &page(33, fill))?;
        }

        assert_eq!(ftl.context().stats.wear_level_swaps, 1);
        assert_eq!(ftl.context().swap_counter, 0);
        assert_eq!(read_page(&mut ftl, 33)?, page(33, 39));
        assert_eq!(read_page(&mut ftl, 0)?, page(0, 11));
        assert_eq!(read_page(&mut ftl, 31)?, page(31, 11));
        ftl.context().check_pool()?;
        Ok(())
    }

    /// One step of a host workload
    #[derive(Debug, Clone)]
    enum Op {
        Write { lpn: u32, count: u32, fill: u8 },
        Sync,
        Reopen,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            8 => (0u32..1024, 1u32..48, any::<u8>()).prop_map(|(lpn, count, fill)| Op::Write {
                lpn,
                count: count.min(1024 - lpn),
                fill,
            }),
            2 => Just(Op::Sync),
            1 => Just(Op::Reopen),
        ]
    }

    fn run_model(ops: &[Op]) -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        let mut model: HashMap<u32, u8> = HashMap::new();

        for op in ops {
            match *op {
                Op::Write { lpn, count, fill } => {
                    ftl.write(lpn, count, &pages(lpn, count, fill))?;
                    model.extend((lpn..lpn + count).map(|p| (p, fill)));
                }
                Op::Sync => ftl.sync()?,
                Op::Reopen => ftl = reopen(ftl)?,
            }
            ftl.context().check_pool()?;
        }

        for lpn in 0..ftl.logical_pages() {
            let expected = match model.get(&lpn) {
                Some(&fill) => page(lpn, fill),
                None => vec![0xFF; TEST_LAYOUT.bytes_per_page],
            };
            anyhow::ensure!(read_page(&mut ftl, lpn)? == expected, "page {lpn} differs");
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn model_workload(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let result = run_model(&ops);
            prop_assert!(result.is_ok(), "{:?}", result);
        }
    }
}
