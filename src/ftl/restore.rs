//! Rebuilding the FTL context from the spare areas, when no clean checkpoint exists.
//!
//! Every virtual block outside the control blocks is classified from the data pages in it.
//! For each logical block, the newest complete in-order block is its map block. Its log (if any)
//! holds only pages newer than that map block: the newest such block that was appended to
//! after its copied pages, otherwise the oldest one. Everything else returns to the free pool.

use log::{debug, info, warn};

use super::context::{FtlContext, FtlCxtRecord, FtlStats, LogDescriptor, MAX_LOGS};
use super::FtlVolume;
use crate::error::{Error, NandError, Result};
use crate::nand::{Clock, NandChip, PageType};
use crate::vfl::PageRead;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum BlockKind {
    /// No page written
    Empty,
    /// Every page written, each at the index matching its logical offset
    Sequential,
    /// Pages of one logical block in any other arrangement
    Scattered,
    /// Unusable: foreign pages, mixed logical blocks, or a torn erase
    Garbage,
}

#[derive(Debug, Copy, Clone)]
struct ScannedPage {
    offset: u16,
    index: u16,
    usn: u32,
}

#[derive(Debug, Clone)]
pub(super) struct BlockScan {
    vb: u16,
    kind: BlockKind,
    lbn: Option<u16>,
    pages: Vec<ScannedPage>,
    min_usn: u32,
    max_usn: u32,
}

impl BlockScan {
    fn new(vb: u16) -> Self {
        Self {
            vb,
            kind: BlockKind::Empty,
            lbn: None,
            pages: Vec::new(),
            min_usn: u32::MAX,
            max_usn: 0,
        }
    }

    fn into_garbage(mut self) -> Self {
        self.kind = BlockKind::Garbage;
        self.lbn = None;
        self.pages.clear();
        self
    }

    /// Written under a single USN, in order from the start: an unfinished block copy
    fn is_partial_copy(&self) -> bool {
        self.min_usn == self.max_usn && self.pages.iter().all(|p| p.offset == p.index)
    }

    /// Rebuild the log descriptor; for a logical page written more than once, the highest USN
    /// wins, then the later page
    fn to_log(&self, lbn: u16, pages_per_sublk: u32) -> LogDescriptor {
        let mut log = LogDescriptor::new(self.vb, lbn, self.min_usn, pages_per_sublk);
        let mut newest = vec![0u32; pages_per_sublk as usize];

        for page in &self.pages {
            let best = &mut newest[usize::from(page.offset)];
            if page.usn >= *best {
                *best = page.usn;
                log.record(page.offset, page.index);
            }
        }

        log.pages_used = self.pages.iter().map(|p| p.index + 1).max().unwrap_or(0);
        log
    }
}

impl<C: NandChip, K: Clock> FtlVolume<C, K> {
    /// Classify a block by its data pages
    pub(super) fn determine_block_type(&mut self, vb: u16) -> Result<BlockScan> {
        let ppsb = self.geometry.pages_per_sublk;
        let logical_pages = self.logical_pages();
        let mut scan = BlockScan::new(vb);

        for index in 0..ppsb {
            let vpn = u32::from(vb) * ppsb + index;
            let spare = match self.vfl.read(vpn, None, true) {
                Ok(PageRead::Empty) => continue,
                Ok(PageRead::Written(spare)) => spare,
                Err(Error::Nand(NandError::Ecc)) => {
                    warn!("virtual page {vpn} fails ECC, placing it by its spare alone");
                    match self.vfl.read_unchecked(vpn)? {
                        PageRead::Written(spare) => spare,
                        PageRead::Empty => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            let lpn = spare.lpn();
            if !spare.page_type.is_data() || lpn >= logical_pages {
                return Ok(scan.into_garbage());
            }

            let lbn = (lpn / ppsb) as u16;
            if *scan.lbn.get_or_insert(lbn) != lbn {
                return Ok(scan.into_garbage());
            }

            scan.pages.push(ScannedPage {
                offset: (lpn % ppsb) as u16,
                index: index as u16,
                usn: spare.usn(),
            });
            scan.min_usn = scan.min_usn.min(spare.usn());
            scan.max_usn = scan.max_usn.max(spare.usn());
        }

        // Blocks fill from page 0, and erase from bank 0: a hole there is a torn erase
        let starts_at_zero = scan.pages.first().map(|p| p.index == 0);
        scan.kind = match starts_at_zero {
            None => BlockKind::Empty,
            Some(false) => return Ok(scan.into_garbage()),
            Some(true)
                if scan.pages.len() == ppsb as usize
                    && scan.pages.iter().all(|p| p.offset == p.index) =>
            {
                BlockKind::Sequential
            }
            Some(true) => BlockKind::Scattered,
        };

        Ok(scan)
    }

    /// Erase counters, read counters and statistics from the newest checkpoint still readable
    fn recover_counters(
        &mut self,
        starts: &[(u16, u32)],
    ) -> Option<(Vec<u16>, Vec<u16>, FtlStats)> {
        let ppsb = self.geometry.pages_per_sublk;
        let virtual_blocks = self.geometry.user_sublks_total as usize;
        let mut page = vec![0u8; self.geometry.bytes_per_page];

        for &(vb, _) in starts {
            let Some(last) = self.last_ctrl_page(vb) else {
                continue;
            };

            for vpn in (u32::from(vb) * ppsb..=last).rev() {
                match self.read_ctrl_page(vpn, &mut page) {
                    Ok(spare) if spare.page_type == PageType::FtlContext => {}
                    _ => continue,
                }
                let Ok(record) = FtlCxtRecord::decode(&page) else {
                    continue;
                };

                let counters = self
                    .load_table(
                        &record.erase_counter_pages,
                        PageType::EraseCounters,
                        record.usn_dec,
                        virtual_blocks,
                    )
                    .and_then(|erase_counters| {
                        let (read_counters, stats) = self.open_read_counter_tables(&record)?;
                        Ok((erase_counters, read_counters, stats))
                    });

                match counters {
                    Ok(counters) => {
                        debug!("counters recovered from the checkpoint at virtual page {vpn}");
                        return Some(counters);
                    }
                    Err(e) => warn!("checkpoint at virtual page {vpn} unusable: {e}"),
                }
            }
        }

        None
    }

    /// Rebuild the whole context from flash, without writing anything
    pub(super) fn restore(&mut self) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let virtual_blocks = self.geometry.user_sublks_total;
        let logical_blocks = self.logical_blocks as usize;

        let ctrl_blocks = self.vfl.ftl_ctrl_blocks()?;
        self.cxt.ctrl_blocks = ctrl_blocks;
        let mut cxt = FtlContext::new(self.logical_blocks, virtual_blocks);
        cxt.ctrl_blocks = ctrl_blocks;

        let starts = self.ctrl_block_starts(ctrl_blocks);
        if let Some(&(newest, usn_dec)) = starts.first() {
            cxt.usn_dec = usn_dec;
            cxt.ctrl_page = self.last_ctrl_page(newest);
        }
        cxt.ctrl_rotate = true;

        match self.recover_counters(&starts) {
            Some((erase_counters, read_counters, stats)) => {
                cxt.erase_counters = erase_counters;
                cxt.read_counters = read_counters;
                cxt.stats = stats;
            }
            None => warn!("no readable checkpoint, erase counters start from zero"),
        }

        let rpt = howudoin::new()
            .label("Restoring FTL")
            .set_len(u64::from(virtual_blocks));
        let mut scans = Vec::new();
        for vb in 0..virtual_blocks as u16 {
            rpt.inc();
            if !ctrl_blocks.contains(&vb) {
                scans.push(self.determine_block_type(vb)?);
            }
        }
        rpt.close();

        let mut candidates: Vec<Vec<usize>> = vec![Vec::new(); logical_blocks];
        for (i, scan) in scans.iter().enumerate() {
            if let Some(lbn) = scan.lbn {
                candidates[usize::from(lbn)].push(i);
            }
        }

        let mut maps: Vec<Option<usize>> = vec![None; logical_blocks];
        let mut logs: Vec<(u16, usize)> = Vec::new();
        for (lbn, found) in candidates.iter().enumerate() {
            let map = found
                .iter()
                .copied()
                .filter(|&i| scans[i].kind == BlockKind::Sequential)
                .max_by_key(|&i| scans[i].max_usn);
            let floor = map.map_or(0, |i| scans[i].max_usn);

            let mut newer: Vec<usize> = found
                .iter()
                .copied()
                .filter(|&i| Some(i) != map && scans[i].min_usn > floor)
                .collect();
            newer.sort_by_key(|&i| std::cmp::Reverse(scans[i].max_usn));

            // Appends after the copied pages mean the block became the live log. A block holding
            // only its copy pass may be unfinished, and its source still holds the same pages.
            let log = newer
                .iter()
                .copied()
                .find(|&i| scans[i].min_usn != scans[i].max_usn)
                .or_else(|| newer.last().copied());

            maps[lbn] = map;
            if let Some(i) = log {
                logs.push((lbn as u16, i));
            }
        }

        // Too many logs: unfinished copies hold nothing that is not also somewhere older
        if logs.len() > MAX_LOGS {
            logs.sort_by_key(|&(_, i)| std::cmp::Reverse(scans[i].min_usn));
            let mut excess = logs.len() - MAX_LOGS;
            logs.retain(|&(_, i)| {
                let drop = excess > 0 && scans[i].is_partial_copy();
                excess -= usize::from(drop);
                !drop
            });
            if logs.len() > MAX_LOGS {
                return Err(Error::Inconsistent(format!(
                    "{} logical blocks have logs, at most {MAX_LOGS} can",
                    logs.len()
                )));
            }
        }
        logs.sort_by_key(|&(_, i)| scans[i].min_usn);

        let mut assigned = vec![false; scans.len()];
        for &(_, i) in &logs {
            assigned[i] = true;
        }
        for map in maps.iter().flatten() {
            assigned[*map] = true;
        }

        for (lbn, map) in maps.iter().enumerate() {
            let i = match map {
                Some(i) => *i,
                None => {
                    let spare = (0..scans.len())
                        .find(|&i| !assigned[i] && scans[i].kind == BlockKind::Empty)
                        .ok_or_else(|| {
                            Error::Inconsistent(format!(
                                "no erased block left for logical block {lbn}"
                            ))
                        })?;
                    assigned[spare] = true;
                    spare
                }
            };
            cxt.map_table[lbn] = scans[i].vb;
        }

        for (slot, &(lbn, i)) in logs.iter().enumerate() {
            cxt.logs[slot] = Some(scans[i].to_log(lbn, ppsb));
        }

        for (i, scan) in scans.iter().enumerate() {
            if !assigned[i] {
                cxt.free_pool.push_back(scan.vb);
                cxt.free_dirty |= scan.kind != BlockKind::Empty;
            }
        }
        cxt.check_pool()?;

        let max_usn = scans.iter().map(|scan| scan.max_usn).max().unwrap_or(0);
        cxt.next_usn = max_usn + 1;
        cxt.clean = false;
        cxt.stats.restores += 1;

        info!(
            "FTL restored: {} logs, {} free blocks{}, next USN {}",
            logs.len(),
            cxt.free_pool.len(),
            if cxt.free_dirty { " (some stale)" } else { "" },
            cxt.next_usn
        );
        self.cxt = cxt;
        Ok(())
    }
}
