//! Log blocks: opening them, appending to them, and folding them back into map blocks.
//!
//! A full log is reconciled one of three ways:
//!
//! - mostly stale (fewer than half its pages current): `compact_scattered` copies the current
//!   pages into a fresh log and keeps going
//! - sequential: `copy_merge` tops the log up with the map block's remaining pages, and the log
//!   becomes the map block
//! - otherwise: `simple_merge` assembles a whole new map block from the log and the old map
//!
//! Blocks assembled here are always written completely, with one USN for every copied page, so
//! that a full scan can tell a finished merge from an interrupted one.

use log::{debug, trace, warn};

use super::context::{LogDescriptor, MAX_LOGS};
use super::FtlVolume;
use crate::error::{Error, NandError, Result};
use crate::nand::{Clock, NandChip, SpareData};
use crate::vfl::PageRead;

/// Where one page of a block being assembled comes from
#[derive(Debug, Clone, Copy)]
pub(super) enum PageSource<'a> {
    /// Copy a virtual page; an erased page is copied as erased content
    Virtual(u32),
    Buffer(&'a [u8]),
}

/// Why assembling a block failed
#[derive(Debug)]
pub(super) enum CopyError {
    /// A source page could not be read; another destination will not help
    Read(Error),
    Write(Error),
}

impl From<CopyError> for Error {
    fn from(value: CopyError) -> Self {
        match value {
            CopyError::Read(e) | CopyError::Write(e) => e,
        }
    }
}

impl<C: NandChip, K: Clock> FtlVolume<C, K> {
    /// Program `pages` (logical offset, source) into `vb` from page index `first` onwards
    pub(super) fn fill_block(
        &mut self,
        vb: u16,
        lbn: u16,
        usn: u32,
        first: u32,
        pages: &[(u16, PageSource)],
    ) -> Result<(), CopyError> {
        let ppsb = self.geometry.pages_per_sublk;
        let mut scratch = vec![0xFF; self.geometry.bytes_per_page];

        for (i, &(offset, source)) in pages.iter().enumerate() {
            let index = first + i as u32;
            let data: &[u8] = match source {
                PageSource::Buffer(buf) => buf,
                PageSource::Virtual(vpn) => {
                    match self.vfl.read(vpn, Some(scratch.as_mut_slice()), true) {
                        Ok(PageRead::Empty) => scratch.fill(0xFF),
                        Ok(PageRead::Written(_)) => {}
                        // Carried over as read
                        Err(Error::Nand(NandError::Ecc)) => {
                            warn!("virtual page {vpn} copied with ECC errors");
                            self.cxt.stats.ecc_read_failures += 1;
                        }
                        Err(e) => return Err(CopyError::Read(e)),
                    }
                    &scratch
                }
            };

            let lpn = u32::from(lbn) * ppsb + u32::from(offset);
            let spare = SpareData::data(lpn, usn, index == ppsb - 1);
            self.vfl
                .write(u32::from(vb) * ppsb + index, data, &spare)
                .map_err(CopyError::Write)?;
        }

        Ok(())
    }

    fn release(&mut self, vbs: Vec<u16>) -> Result<()> {
        for vb in vbs {
            self.set_free_vb(vb)?;
        }
        Ok(())
    }

    /// Write a whole logical block into free blocks until one takes it, returning that block
    fn assemble_block(&mut self, lbn: u16, pages: &[(u16, PageSource)]) -> Result<u16> {
        let mut failed = Vec::new();
        let mut last = Error::Nand(NandError::Io);

        for attempt in 1..=self.config.block_retries {
            let vb = match self.next_free_vb() {
                Ok(vb) => vb,
                Err(e) => {
                    self.release(failed)?;
                    return Err(e);
                }
            };

            let usn = self.cxt.bump_usn();
            match self.fill_block(vb, lbn, usn, 0, pages) {
                Ok(()) => {
                    self.release(failed)?;
                    return Ok(vb);
                }
                Err(CopyError::Write(e)) => {
                    warn!(
                        "logical block {lbn}: writing virtual block {vb} failed ({e}), \
                         attempt {attempt}"
                    );
                    failed.push(vb);
                    last = e;
                }
                Err(CopyError::Read(e)) => {
                    failed.push(vb);
                    self.release(failed)?;
                    return Err(e);
                }
            }
        }

        self.release(failed)?;
        Err(last)
    }

    /// The log slot for `lbn`, opening a log (and merging another away for room) if needed
    pub(super) fn prepare_log(&mut self, lbn: u16) -> Result<usize> {
        if let Some(slot) = self.cxt.find_log(lbn) {
            return Ok(slot);
        }

        if self.cxt.active_logs() >= MAX_LOGS {
            self.merge(None)?;
        }

        let slot = self
            .cxt
            .logs
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::Inconsistent("no free log slot".into()))?;
        let vb = self.next_free_vb()?;

        let log = LogDescriptor::new(vb, lbn, self.cxt.next_usn, self.geometry.pages_per_sublk);
        self.cxt.logs[slot] = Some(log);
        trace!("logical block {lbn}: log opened in virtual block {vb}");
        Ok(slot)
    }

    /// Append one page to the log of `lbn`
    ///
    /// A page that fails to program is skipped over (the log can no longer be sequential), and
    /// the write moves on to the next page.
    pub(super) fn write_log_page(&mut self, lbn: u16, offset: u16, data: &[u8]) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let lpn = u32::from(lbn) * ppsb + u32::from(offset);
        let mut failures = 0;

        loop {
            let slot = self.prepare_log(lbn)?;
            if self.log(slot)?.is_full() {
                self.merge(Some(slot))?;
                continue;
            }

            let usn = self.cxt.bump_usn();
            let log = self.log_mut(slot)?;
            let index = log.pages_used;
            log.pages_used += 1;
            let vpn = u32::from(log.vbn) * ppsb + u32::from(index);

            let spare = SpareData::data(lpn, usn, u32::from(index) == ppsb - 1);
            match self.vfl.write(vpn, data, &spare) {
                Ok(()) => {
                    self.log_mut(slot)?.record(offset, index);
                    return Ok(());
                }
                Err(e) => {
                    warn!("logical page {lpn}: log write to virtual page {vpn} failed: {e}");
                    self.log_mut(slot)?.sequential = false;

                    failures += 1;
                    if failures > self.config.block_retries {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Replace a whole logical block, bypassing its log
    pub(super) fn write_block(&mut self, lbn: u16, data: &[u8]) -> Result<()> {
        let pages: Vec<(u16, PageSource)> = data
            .chunks_exact(self.geometry.bytes_per_page)
            .enumerate()
            .map(|(offset, page)| (offset as u16, PageSource::Buffer(page)))
            .collect();

        // A log that never got a page is just an erased block waiting to be used
        let unused_log = self
            .cxt
            .find_log(lbn)
            .filter(|&slot| matches!(&self.cxt.logs[slot], Some(log) if log.pages_used == 0))
            .and_then(|slot| self.cxt.logs[slot].take())
            .map(|log| log.vbn);

        let vb = match unused_log {
            Some(vb) => {
                let usn = self.cxt.bump_usn();
                match self.fill_block(vb, lbn, usn, 0, &pages) {
                    Ok(()) => vb,
                    Err(e) => {
                        warn!("logical block {lbn}: write into unused log failed: {e:?}");
                        self.set_free_vb(vb)?;
                        self.assemble_block(lbn, &pages)?
                    }
                }
            }
            None => self.assemble_block(lbn, &pages)?,
        };

        let old = std::mem::replace(&mut self.cxt.map_table[usize::from(lbn)], vb);
        if let Some(slot) = self.cxt.find_log(lbn) {
            if let Some(log) = self.cxt.logs[slot].take() {
                self.set_free_vb(log.vbn)?;
            }
        }
        self.set_free_vb(old)?;

        trace!("logical block {lbn}: replaced, virtual block {old} -> {vb}");
        Ok(())
    }

    /// The log to give up when every slot is taken: the oldest, preferring the fullest
    fn merge_victim(&self) -> Result<usize> {
        self.cxt
            .logs
            .iter()
            .enumerate()
            .filter_map(|(slot, log)| log.as_ref().map(|log| (slot, log)))
            .min_by_key(|(_, log)| (log.usn, std::cmp::Reverse(log.pages_current)))
            .map(|(slot, _)| slot)
            .ok_or_else(|| Error::Inconsistent("no log to merge".into()))
    }

    /// Reconcile a log with its map block
    ///
    /// With a `target`, that (full) log is merged or compacted. Without one, the victim log is
    /// always released from its slot.
    pub(super) fn merge(&mut self, target: Option<usize>) -> Result<()> {
        let slot = match target {
            Some(slot) => slot,
            None => self.merge_victim()?,
        };
        let log = self.log(slot)?;
        let (pages_current, sequential) = (u32::from(log.pages_current), log.sequential);

        self.cxt.swap_counter += 1;

        if target.is_some() && pages_current < self.geometry.pages_per_sublk / 2 {
            self.compact_scattered(slot)
        } else if sequential {
            self.copy_merge(slot)
        } else {
            self.simple_merge(slot)
        }
    }

    /// Rewrite just the current pages of a log into a fresh block, which becomes the log
    pub(super) fn compact_scattered(&mut self, slot: usize) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let log = self.log(slot)?.clone();
        self.cxt.scratch_log = Some(log.clone());

        let current: Vec<(u16, PageSource)> = log
            .page_offsets
            .iter()
            .enumerate()
            .filter_map(|(offset, index)| {
                let vpn = u32::from(log.vbn) * ppsb + u32::from((*index)?);
                Some((offset as u16, PageSource::Virtual(vpn)))
            })
            .collect();

        let mut failed = Vec::new();
        let mut last = Error::Nand(NandError::Io);
        for attempt in 1..=self.config.block_retries {
            let vb = match self.next_free_vb() {
                Ok(vb) => vb,
                Err(e) => {
                    last = e;
                    break;
                }
            };

            let usn = self.cxt.bump_usn();
            match self.fill_block(vb, log.lbn, usn, 0, &current) {
                Ok(()) => {
                    let mut compacted = LogDescriptor::new(vb, log.lbn, log.usn, ppsb);
                    for (index, &(offset, _)) in current.iter().enumerate() {
                        compacted.record(offset, index as u16);
                    }
                    compacted.pages_used = current.len() as u16;

                    self.cxt.logs[slot] = Some(compacted);
                    self.cxt.scratch_log = None;
                    self.release(failed)?;
                    self.set_free_vb(log.vbn)?;
                    self.cxt.stats.compactions += 1;

                    debug!(
                        "logical block {}: log compacted to {} pages in virtual block {vb}",
                        log.lbn,
                        current.len()
                    );
                    return Ok(());
                }
                Err(e) => {
                    failed.push(vb);
                    self.cxt.logs[slot] = self.cxt.scratch_log.clone();

                    match e {
                        CopyError::Write(e) => {
                            warn!(
                                "logical block {}: compaction attempt {attempt} failed: {e}",
                                log.lbn
                            );
                            last = e;
                        }
                        CopyError::Read(e) => {
                            last = e;
                            break;
                        }
                    }
                }
            }
        }

        self.cxt.scratch_log = None;
        self.release(failed)?;
        Err(last)
    }

    /// Finish a sequential log with the map block's remaining pages; the log becomes the map
    pub(super) fn copy_merge(&mut self, slot: usize) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let log = self.log(slot)?.clone();
        let lbn = usize::from(log.lbn);
        let old = self.cxt.map_table[lbn];

        let first = u32::from(log.pages_used);
        let tail: Vec<(u16, PageSource)> = (first..ppsb)
            .map(|i| (i as u16, PageSource::Virtual(u32::from(old) * ppsb + i)))
            .collect();

        let usn = self.cxt.bump_usn();
        match self.fill_block(log.vbn, log.lbn, usn, first, &tail) {
            Ok(()) => {}
            Err(CopyError::Write(e)) => {
                warn!("logical block {lbn}: copy merge failed ({e}), doing a full merge");
                return self.simple_merge(slot);
            }
            Err(CopyError::Read(e)) => return Err(e),
        }

        self.cxt.map_table[lbn] = log.vbn;
        self.cxt.logs[slot] = None;
        self.set_free_vb(old)?;
        self.cxt.stats.copy_merges += 1;

        debug!(
            "logical block {lbn}: copy merge of {} pages into virtual block {}",
            ppsb - first,
            log.vbn
        );
        Ok(())
    }

    /// Assemble a new map block from the log (where it has a page) and the old map block
    pub(super) fn simple_merge(&mut self, slot: usize) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let log = self.log(slot)?.clone();
        let lbn = usize::from(log.lbn);
        let old = self.cxt.map_table[lbn];

        let pages: Vec<(u16, PageSource)> = log
            .page_offsets
            .iter()
            .enumerate()
            .map(|(offset, index)| {
                let vpn = match index {
                    Some(index) => u32::from(log.vbn) * ppsb + u32::from(*index),
                    None => u32::from(old) * ppsb + offset as u32,
                };
                (offset as u16, PageSource::Virtual(vpn))
            })
            .collect();

        let vb = self.assemble_block(log.lbn, &pages)?;

        self.cxt.map_table[lbn] = vb;
        self.cxt.logs[slot] = None;
        self.set_free_vb(old)?;
        self.set_free_vb(log.vbn)?;
        self.cxt.stats.simple_merges += 1;

        debug!("logical block {lbn}: merged into virtual block {vb}");
        Ok(())
    }
}
