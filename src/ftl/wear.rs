//! The free pool, and the block moves that keep erase and read wear even.

use log::{debug, error, info, warn};

use super::context::FREE_POOL_SLOTS;
use super::merge::{CopyError, PageSource};
use super::FtlVolume;
use crate::error::{Error, Result};
use crate::nand::{Clock, NandChip};
use crate::vfl::PageRead;

impl<C: NandChip, K: Clock> FtlVolume<C, K> {
    /// Take the least-worn block out of the free pool, ready to program
    pub(super) fn next_free_vb(&mut self) -> Result<u16> {
        let erase_counters = &self.cxt.erase_counters;
        let position = self
            .cxt
            .free_pool
            .iter()
            .enumerate()
            .min_by_key(|(_, &vb)| erase_counters[usize::from(vb)])
            .map(|(position, _)| position)
            .ok_or_else(|| Error::Inconsistent("free pool is empty".into()))?;

        let vb = self
            .cxt
            .free_pool
            .remove(position)
            .ok_or_else(|| Error::Inconsistent("free pool is empty".into()))?;

        if self.cxt.free_dirty {
            if let Err(e) = self.ensure_erased(vb) {
                self.cxt.free_pool.push_back(vb);
                return Err(e);
            }
        }

        Ok(vb)
    }

    /// Erase `vb` unless every page of it is already erased; returns whether it was erased
    pub(super) fn ensure_erased(&mut self, vb: u16) -> Result<bool> {
        let ppsb = self.geometry.pages_per_sublk;
        let first = u32::from(vb) * ppsb;

        let written = (first..first + ppsb)
            .any(|vpn| !matches!(self.vfl.read(vpn, None, true), Ok(PageRead::Empty)));
        if !written {
            return Ok(false);
        }

        self.vfl.erase(u32::from(vb))?;
        self.count_erase(vb);
        Ok(true)
    }

    fn count_erase(&mut self, vb: u16) {
        let counter = &mut self.cxt.erase_counters[usize::from(vb)];
        *counter = counter.saturating_add(1);
        self.cxt.read_counters[usize::from(vb)] = 0;
    }

    /// Erase a block no longer in use and return it to the free pool
    ///
    /// A failed erase still returns the block; it is erased again before it is handed out.
    pub(super) fn set_free_vb(&mut self, vb: u16) -> Result<()> {
        if self.cxt.free_pool.len() >= FREE_POOL_SLOTS {
            error!("virtual block {vb} released into a full free pool");
            return Err(Error::Inconsistent(format!(
                "free pool overflow releasing virtual block {vb}"
            )));
        }

        if let Err(e) = self.vfl.erase(u32::from(vb)) {
            warn!("virtual block {vb} failed to erase ({e}), marking the free pool dirty");
            self.cxt.free_dirty = true;
        }
        self.count_erase(vb);
        self.cxt.free_pool.push_back(vb);
        Ok(())
    }

    /// Erase every free block that may still hold stale pages
    pub(super) fn check_for_dirty_free_vb(&mut self) -> Result<()> {
        let mut all_clean = true;
        let pool: Vec<u16> = self.cxt.free_pool.iter().copied().collect();

        for vb in pool {
            match self.ensure_erased(vb) {
                Ok(true) => debug!("stale free block {vb} erased"),
                Ok(false) => {}
                Err(e) => {
                    warn!("free block {vb} still dirty: {e}");
                    all_clean = false;
                }
            }
        }

        self.cxt.free_dirty = !all_clean;
        Ok(())
    }

    /// Copy the map block of `lbn` into the erased block `dest`, under a single USN
    pub(super) fn relocate(&mut self, lbn: u16, dest: u16) -> Result<(), CopyError> {
        let ppsb = self.geometry.pages_per_sublk;
        let src = u32::from(self.cxt.map_table[usize::from(lbn)]) * ppsb;

        // Never-written logical blocks have nothing to move
        if self.vfl.read(src, None, true).map_err(CopyError::Read)? == PageRead::Empty {
            return Ok(());
        }

        let pages: Vec<(u16, PageSource)> = (0..ppsb)
            .map(|offset| (offset as u16, PageSource::Virtual(src + offset)))
            .collect();
        let usn = self.cxt.bump_usn();
        self.fill_block(dest, lbn, usn, 0, &pages)
    }

    /// Move the coldest map block into the most-worn free block, if they are far enough apart
    ///
    /// Returns whether a swap happened.
    pub(super) fn auto_wearlevel(&mut self) -> Result<bool> {
        let ec = |vb: u16| self.cxt.erase_counters[usize::from(vb)];

        let Some(hot) = self.cxt.free_pool.iter().copied().max_by_key(|&vb| ec(vb)) else {
            return Ok(false);
        };
        let cold = (0..self.logical_blocks as u16)
            .filter(|&lbn| self.cxt.find_log(lbn).is_none())
            .min_by_key(|&lbn| ec(self.cxt.map_table[usize::from(lbn)]));
        let Some(lbn) = cold else {
            return Ok(false);
        };

        let cold_vb = self.cxt.map_table[usize::from(lbn)];
        if ec(hot).saturating_sub(ec(cold_vb)) < self.config.wear_level_threshold {
            return Ok(false);
        }

        self.cxt.free_pool.retain(|&vb| vb != hot);
        if self.cxt.free_dirty {
            if let Err(e) = self.ensure_erased(hot) {
                self.cxt.free_pool.push_back(hot);
                return Err(e);
            }
        }

        match self.relocate(lbn, hot) {
            Ok(()) => {}
            Err(CopyError::Write(e)) => {
                warn!("wear levelling into virtual block {hot} failed: {e}");
                self.set_free_vb(hot)?;
                return Ok(false);
            }
            Err(CopyError::Read(e)) => {
                self.set_free_vb(hot)?;
                return Err(e);
            }
        }

        self.cxt.map_table[usize::from(lbn)] = hot;
        self.set_free_vb(cold_vb)?;
        self.cxt.stats.wear_level_swaps += 1;

        info!("wear levelling: logical block {lbn} moved from virtual block {cold_vb} to {hot}");
        Ok(true)
    }

    /// Logical blocks (without a log) whose map block has been read often enough to refresh
    fn refresh_candidates(&self) -> Vec<u16> {
        let Some(threshold) = self.config.read_refresh_threshold else {
            return Vec::new();
        };

        (0..self.logical_blocks as u16)
            .filter(|&lbn| self.cxt.find_log(lbn).is_none())
            .filter(|&lbn| {
                let vb = self.cxt.map_table[usize::from(lbn)];
                self.cxt.read_counters[usize::from(vb)] >= threshold
            })
            .collect()
    }

    pub(super) fn refresh_due(&self) -> bool {
        !self.refresh_candidates().is_empty()
    }

    /// Rewrite heavily-read map blocks before read disturb catches up with them
    pub(super) fn read_refresh(&mut self) -> Result<()> {
        for lbn in self.refresh_candidates() {
            let dest = self.next_free_vb()?;
            match self.relocate(lbn, dest) {
                Ok(()) => {}
                Err(CopyError::Write(e)) => {
                    warn!("read refresh of logical block {lbn} failed: {e}");
                    self.set_free_vb(dest)?;
                    continue;
                }
                Err(CopyError::Read(e)) => {
                    self.set_free_vb(dest)?;
                    return Err(e);
                }
            }

            let old = std::mem::replace(&mut self.cxt.map_table[usize::from(lbn)], dest);
            self.set_free_vb(old)?;
            self.cxt.stats.read_refreshes += 1;
            debug!("read refresh: logical block {lbn} moved from virtual block {old} to {dest}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{formatted, formatted_with, page, pages, read_page, PPSB};
    use super::*;
    use crate::config::FtlConfig;
    use crate::nand::SpareData;

    #[test]
    fn test_lowest_wear_first() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        ftl.cxt.erase_counters[35] = 4;
        ftl.cxt.erase_counters[36] = 2;
        ftl.cxt.erase_counters[37] = 2;
        for vb in 38..55 {
            ftl.cxt.erase_counters[vb] = 3;
        }

        assert_eq!(ftl.next_free_vb()?, 36);
        assert_eq!(ftl.next_free_vb()?, 37);
        assert_eq!(ftl.next_free_vb()?, 38);
        assert_eq!(ftl.cxt.free_pool.len(), 17);
        Ok(())
    }

    #[test]
    fn test_free_pool_overflow() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        assert!(matches!(ftl.set_free_vb(3), Err(Error::Inconsistent(_))));
        assert_eq!(ftl.context().free_pool.len(), FREE_POOL_SLOTS);
        Ok(())
    }

    #[test]
    fn test_dirty_free_blocks_erased() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        let vb = *ftl.cxt.free_pool.front().ok_or(anyhow::anyhow!("empty pool"))?;
        let vpn = u32::from(vb) * PPSB + 5;

        ftl.vfl_mut().write(vpn, &page(0, 1), &SpareData::data(0, 1, false))?;
        ftl.cxt.free_dirty = true;
        let before = ftl.cxt.erase_counters[usize::from(vb)];

        ftl.check_for_dirty_free_vb()?;
        assert!(!ftl.cxt.free_dirty);
        assert_eq!(ftl.cxt.erase_counters[usize::from(vb)], before + 1);
        assert_eq!(ftl.vfl_mut().read(vpn, None, true)?, PageRead::Empty);

        // Already-erased blocks are left alone
        assert_eq!(ftl.cxt.erase_counters[usize::from(vb) + 1], before);
        Ok(())
    }

    #[test]
    fn test_wear_levelling_converges() -> anyhow::Result<()> {
        let mut ftl = formatted()?;
        for lbn in [0, 7, 19] {
            ftl.write(lbn * PPSB, PPSB, &pages(lbn * PPSB, PPSB, lbn as u8))?;
        }
        for &vb in &ftl.cxt.free_pool {
            ftl.cxt.erase_counters[usize::from(vb)] = 20;
        }

        let mut swaps = 0;
        while ftl.auto_wearlevel()? {
            swaps += 1;
            anyhow::ensure!(swaps <= 100, "wear levelling does not settle");
        }
        assert_eq!(swaps, ftl.context().stats.wear_level_swaps);
        assert!(swaps > 0);

        let cxt = ftl.context();
        let hottest_free = cxt
            .free_pool
            .iter()
            .map(|&vb| cxt.erase_counters[usize::from(vb)])
            .max()
            .unwrap_or(0);
        let coldest_map = cxt
            .map_table
            .iter()
            .map(|&vb| cxt.erase_counters[usize::from(vb)])
            .min()
            .unwrap_or(0);
        assert!(hottest_free - coldest_map < ftl.config().wear_level_threshold);
        cxt.check_pool()?;

        for lbn in [0, 7, 19] {
            let lpn = lbn * PPSB + 17;
            assert_eq!(read_page(&mut ftl, lpn)?, page(lpn, lbn as u8));
        }
        Ok(())
    }

    #[test]
    fn test_read_refresh() -> anyhow::Result<()> {
        let config = FtlConfig {
            read_refresh_threshold: Some(3),
            ..Default::default()
        };
        let mut ftl = formatted_with(config)?;
        ftl.write(6 * PPSB, PPSB, &pages(6 * PPSB, PPSB, 0x66))?;
        ftl.sync()?;
        let old = ftl.context().map_table[6];

        for _ in 0..3 {
            read_page(&mut ftl, 6 * PPSB + 2)?;
        }
        assert!(ftl.refresh_due());

        // A clean volume still syncs to carry out the refresh
        ftl.sync()?;
        let cxt = ftl.context();
        let new = cxt.map_table[6];
        assert_ne!(new, old);
        assert_eq!(cxt.stats.read_refreshes, 1);
        assert_eq!(cxt.read_counters[usize::from(old)], 0);
        assert!(cxt.free_pool.contains(&old));
        assert!(cxt.clean);
        assert!(!ftl.refresh_due());

        assert_eq!(read_page(&mut ftl, 6 * PPSB + 2)?, page(6 * PPSB + 2, 0x66));
        Ok(())
    }
}
