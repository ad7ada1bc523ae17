//! Checkpoints of the FTL context, kept in a ring of three control blocks.
//!
//! A checkpoint is a run of control pages appended to the current control block: the erase
//! counter, read counter, map and log-offset tables (each split into page-sized chunks), a
//! statistics page, and finally the header page that points at all of them. The first write
//! after a checkpoint appends an `Unclean` marker instead, so the newest control page tells
//! `open` whether the checkpoint can be trusted.
//!
//! When a control block has no room left, the next block of the ring is erased and the
//! checkpoint's `usn_dec` drops by one. The block whose first page has the lowest `usn_dec` is
//! therefore the newest.

use std::collections::VecDeque;

use log::{debug, error, warn};

use super::context::{
    decode_table, encode_table, unflatten_offset, FtlContext, FtlCxtRecord, FtlStats,
    LogDescriptor, LogRecord, CTRL_BLOCKS, ERASE_COUNTER_PAGES, FTL_VERSION, MAP_TABLE_PAGES,
    MAX_LOGS, PAGE_OFFSET_PAGES, READ_COUNTER_PAGES,
};
use super::FtlVolume;
use crate::error::{Error, NandError, Result};
use crate::nand::{Clock, NandChip, NandGeometry, PageType, SpareData};
use crate::vfl::PageRead;

/// Pages needed to hold `entries` 16-bit table entries
fn table_pages(geometry: &NandGeometry, entries: usize) -> usize {
    (entries * 2).div_ceil(geometry.bytes_per_page)
}

/// Check that every table of a checkpoint fits both its header and one control block
pub(super) fn check_layout(geometry: &NandGeometry, logical_blocks: u32) -> Result<()> {
    let ppsb = geometry.pages_per_sublk;
    if ppsb > u32::from(u16::MAX) {
        return Err(Error::InvalidArgs(format!("{ppsb} pages per superblock")));
    }
    if geometry.bytes_per_page < FtlCxtRecord::ENCODED_LEN {
        return Err(Error::InvalidArgs("pages too small for the FTL context".into()));
    }

    let virtual_blocks = geometry.user_sublks_total as usize;
    let tables = [
        ("map table", logical_blocks as usize, MAP_TABLE_PAGES),
        ("erase counters", virtual_blocks, ERASE_COUNTER_PAGES),
        ("read counters", virtual_blocks, READ_COUNTER_PAGES),
        ("log offsets", MAX_LOGS * ppsb as usize, PAGE_OFFSET_PAGES),
    ];

    let mut total = 0;
    for (name, entries, limit) in tables {
        let pages = table_pages(geometry, entries);
        if pages > limit {
            return Err(Error::InvalidArgs(format!(
                "{name} need {pages} pages, at most {limit} fit"
            )));
        }
        total += pages;
    }

    // Plus the statistics page, the header and an unclean marker
    if total + 3 > ppsb as usize {
        return Err(Error::InvalidArgs(format!(
            "a checkpoint needs {} pages, control blocks hold {ppsb}",
            total + 3
        )));
    }

    Ok(())
}

pub(super) fn is_ctrl_page(page_type: PageType) -> bool {
    matches!(
        page_type,
        PageType::FtlContext
            | PageType::MapTable
            | PageType::LogOffsets
            | PageType::EraseCounters
            | PageType::Stats
            | PageType::ReadCounters
            | PageType::Unclean
    )
}

impl<C: NandChip, K: Clock> FtlVolume<C, K> {
    /// Find room for `needed` consecutive control pages, moving to a fresh block if necessary
    fn next_ctrl_page(&mut self, needed: u32) -> Result<u32> {
        let ppsb = self.geometry.pages_per_sublk;

        if !self.cxt.ctrl_rotate {
            if let Some(page) = self.cxt.ctrl_page {
                if page % ppsb + 1 + needed <= ppsb {
                    return Ok(page + 1);
                }
            }
        }

        let current = self.cxt.ctrl_page.and_then(|page| {
            self.cxt
                .ctrl_blocks
                .iter()
                .position(|&vb| u32::from(vb) == page / ppsb)
        });
        let index = current.map_or(0, |i| (i + 1) % CTRL_BLOCKS);
        self.cxt.usn_dec = self.cxt.usn_dec.saturating_sub(1);

        for attempt in 1..=self.config.block_retries {
            let vb = self.cxt.ctrl_blocks[index];
            match self.vfl.erase(u32::from(vb)) {
                Ok(()) => {
                    let counter = &mut self.cxt.erase_counters[usize::from(vb)];
                    *counter = counter.saturating_add(1);
                    self.cxt.ctrl_rotate = false;

                    debug!("FTL control pages moved to virtual block {vb}");
                    return Ok(u32::from(vb) * ppsb);
                }
                Err(e) => {
                    warn!("control block {vb} failed to erase ({e}), attempt {attempt}");
                    let replacement = self.next_free_vb()?;
                    self.cxt.ctrl_blocks[index] = replacement;
                    self.set_free_vb(vb)?;
                    self.vfl.set_ftl_ctrl_blocks(self.cxt.ctrl_blocks)?;
                }
            }
        }

        Err(Error::Nand(NandError::Io))
    }

    fn write_ctrl_page(
        &mut self,
        vpn: u32,
        page_type: PageType,
        index: u16,
        bytes: &[u8],
    ) -> Result<()> {
        let mut page = vec![0xFF; self.geometry.bytes_per_page];
        page[..bytes.len()].copy_from_slice(bytes);

        // Consumed whether or not the program succeeds
        self.cxt.ctrl_page = Some(vpn);

        let spare = SpareData::control(page_type, self.cxt.usn_dec, index);
        self.vfl.write(vpn, &page, &spare)
    }

    /// Append a table in page-sized chunks from `*cursor`, returning where each chunk went
    fn write_ctrl_table(
        &mut self,
        cursor: &mut u32,
        page_type: PageType,
        bytes: &[u8],
    ) -> Result<Vec<Option<u32>>> {
        let mut pointers = Vec::new();
        for (index, chunk) in bytes.chunks(self.geometry.bytes_per_page).enumerate() {
            self.write_ctrl_page(*cursor, page_type, index as u16, chunk)?;
            pointers.push(Some(*cursor));
            *cursor += 1;
        }
        Ok(pointers)
    }

    /// Record on flash that the last checkpoint no longer describes it
    pub(super) fn mark_unclean(&mut self) -> Result<()> {
        let mut last = Error::Nand(NandError::Io);

        for attempt in 1..=self.config.commit_retries {
            let result = self
                .next_ctrl_page(1)
                .and_then(|vpn| self.write_ctrl_page(vpn, PageType::Unclean, 0, &[]));

            match result {
                Ok(()) => {
                    self.cxt.clean = false;
                    return Ok(());
                }
                Err(e) => {
                    warn!("writing the unclean marker failed ({e}), attempt {attempt}");
                    self.cxt.ctrl_rotate = true;
                    last = e;
                }
            }
        }

        error!("could not mark the FTL unclean");
        Err(last)
    }

    fn commit_cxt(&mut self) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let erase_counters = encode_table(&self.cxt.erase_counters);
        let read_counters = encode_table(&self.cxt.read_counters);
        let map_table = encode_table(&self.cxt.map_table);
        let offsets = encode_table(&self.cxt.flatten_offsets(ppsb));

        let needed = [&erase_counters, &read_counters, &map_table, &offsets]
            .iter()
            .map(|table| table_pages(&self.geometry, table.len() / 2) as u32)
            .sum::<u32>()
            + 2;

        self.cxt.stats.checkpoints += 1;
        let mut cursor = self.next_ctrl_page(needed)?;

        let erase_counter_pages =
            self.write_ctrl_table(&mut cursor, PageType::EraseCounters, &erase_counters)?;
        let read_counter_pages =
            self.write_ctrl_table(&mut cursor, PageType::ReadCounters, &read_counters)?;
        let map_table_pages = self.write_ctrl_table(&mut cursor, PageType::MapTable, &map_table)?;
        let page_offset_pages = self.write_ctrl_table(&mut cursor, PageType::LogOffsets, &offsets)?;

        let stats_page = cursor;
        let stats = self.cxt.stats.encode();
        self.write_ctrl_page(stats_page, PageType::Stats, 0, &stats)?;
        let header_page = stats_page + 1;

        let record = FtlCxtRecord {
            usn_dec: self.cxt.usn_dec,
            next_usn: self.cxt.next_usn,
            free_pool: self.cxt.free_pool.iter().copied().collect(),
            swap_counter: self.cxt.swap_counter,
            map_table_pages,
            erase_counter_pages,
            page_offset_pages,
            logs: self
                .cxt
                .logs
                .iter()
                .map(|log| log.as_ref().map(LogRecord::from))
                .collect(),
            ctrl_blocks: self.cxt.ctrl_blocks,
            ctrl_page: Some(header_page),
            clean: true,
            read_counter_pages,
            stats_page: Some(stats_page),
            version: FTL_VERSION,
        };
        self.write_ctrl_page(header_page, PageType::FtlContext, 0, &record.encode()?)?;

        self.cxt.clean = true;
        debug!("FTL checkpoint written ending at virtual page {header_page}");
        Ok(())
    }

    /// Write a checkpoint, starting over in a fresh control block after each failure
    pub(super) fn commit_with_retries(&mut self) -> Result<()> {
        let mut last = Error::Nand(NandError::Io);

        for attempt in 1..=self.config.commit_retries {
            match self.commit_cxt() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("FTL checkpoint failed ({e}), attempt {attempt}");
                    self.cxt.ctrl_rotate = true;
                    last = e;
                }
            }
        }

        error!("could not checkpoint the FTL: {last}");
        Err(last)
    }

    /// Control blocks that hold control pages, newest (lowest `usn_dec`) first
    pub(super) fn ctrl_block_starts(&mut self, ctrl_blocks: [u16; CTRL_BLOCKS]) -> Vec<(u16, u32)> {
        let ppsb = self.geometry.pages_per_sublk;
        let mut starts = Vec::new();

        for vb in ctrl_blocks {
            match self.vfl.read(u32::from(vb) * ppsb, None, true) {
                Ok(PageRead::Written(spare)) if is_ctrl_page(spare.page_type) => {
                    starts.push((vb, spare.usn_dec()));
                }
                Ok(_) => {}
                Err(e) => warn!("control block {vb} unreadable: {e}"),
            }
        }

        starts.sort_by_key(|&(_, usn_dec)| usn_dec);
        starts
    }

    /// The last programmed page of a control block
    pub(super) fn last_ctrl_page(&mut self, vb: u16) -> Option<u32> {
        let ppsb = self.geometry.pages_per_sublk;
        let first = u32::from(vb) * ppsb;

        let mut last = None;
        for vpn in first..first + ppsb {
            match self.vfl.read(vpn, None, true) {
                Ok(PageRead::Empty) => break,
                // An unreadable page still took its place in the sequence
                Ok(PageRead::Written(_)) | Err(_) => last = Some(vpn),
            }
        }
        last
    }

    pub(super) fn read_ctrl_page(&mut self, vpn: u32, buf: &mut [u8]) -> Result<SpareData> {
        let ppsb = self.geometry.pages_per_sublk;
        if !self.cxt.ctrl_blocks.contains(&((vpn / ppsb) as u16)) {
            return Err(Error::Inconsistent(format!(
                "control page {vpn} outside the control blocks"
            )));
        }

        self.vfl
            .read(vpn, Some(buf), false)?
            .spare()
            .ok_or_else(|| Error::NotFound(format!("control page {vpn}")))
    }

    /// Reassemble a table from its chunks, checking each belongs to the same checkpoint
    pub(super) fn load_table(
        &mut self,
        pointers: &[Option<u32>],
        page_type: PageType,
        usn_dec: u32,
        len: usize,
    ) -> Result<Vec<u16>> {
        let bpp = self.geometry.bytes_per_page;
        let pages = table_pages(&self.geometry, len);
        let mut bytes = vec![0u8; pages * bpp];

        for (index, chunk) in bytes.chunks_exact_mut(bpp).enumerate() {
            let vpn = pointers
                .get(index)
                .copied()
                .flatten()
                .ok_or_else(|| Error::Inconsistent(format!("{page_type:?} page {index} missing")))?;

            let spare = self.read_ctrl_page(vpn, chunk)?;
            if spare.page_type != page_type
                || spare.usn_dec() != usn_dec
                || usize::from(spare.index()) != index
            {
                return Err(Error::Inconsistent(format!(
                    "control page {vpn} is not {page_type:?} page {index}"
                )));
            }
        }

        decode_table(&bytes, len)
    }

    /// Load the checkpoint the newest control page points to, if it is clean
    pub(super) fn load_checkpoint(&mut self) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let virtual_blocks = self.geometry.user_sublks_total as usize;
        let logical_blocks = self.logical_blocks as usize;

        let ctrl_blocks = self.vfl.ftl_ctrl_blocks()?;
        self.cxt.ctrl_blocks = ctrl_blocks;

        let starts = self.ctrl_block_starts(ctrl_blocks);
        let &(newest, _) = starts
            .first()
            .ok_or_else(|| Error::NotFound("no FTL control pages".into()))?;
        let last = self
            .last_ctrl_page(newest)
            .ok_or_else(|| Error::NotFound("no FTL control pages".into()))?;

        let mut page = vec![0u8; self.geometry.bytes_per_page];
        let spare = self.read_ctrl_page(last, &mut page)?;
        if spare.page_type != PageType::FtlContext {
            return Err(Error::NotFound(format!(
                "newest control page is {:?}",
                spare.page_type
            )));
        }

        let record = FtlCxtRecord::decode(&page)?;
        if !record.clean {
            return Err(Error::NotFound("checkpoint not marked clean".into()));
        }
        if record.ctrl_blocks != ctrl_blocks {
            return Err(Error::Inconsistent(format!(
                "checkpoint control blocks {:?}, VFL has {ctrl_blocks:?}",
                record.ctrl_blocks
            )));
        }

        let usn_dec = record.usn_dec;
        let map_table = self.load_table(
            &record.map_table_pages,
            PageType::MapTable,
            usn_dec,
            logical_blocks,
        )?;
        let erase_counters = self.load_table(
            &record.erase_counter_pages,
            PageType::EraseCounters,
            usn_dec,
            virtual_blocks,
        )?;
        let offsets = self.load_table(
            &record.page_offset_pages,
            PageType::LogOffsets,
            usn_dec,
            MAX_LOGS * ppsb as usize,
        )?;

        let mut logs = vec![None; MAX_LOGS];
        for (slot, log) in record.logs.iter().enumerate() {
            let Some(log) = log else { continue };
            if slot >= MAX_LOGS {
                return Err(Error::Inconsistent(format!("log record in slot {slot}")));
            }

            let start = slot * ppsb as usize;
            logs[slot] = Some(LogDescriptor {
                usn: log.usn,
                vbn: log.vbn,
                lbn: log.lbn,
                page_offsets: offsets[start..start + ppsb as usize]
                    .iter()
                    .map(|&o| unflatten_offset(o))
                    .collect(),
                pages_used: log.pages_used,
                pages_current: log.pages_current,
                sequential: log.sequential,
            });
        }

        let (read_counters, stats) = self.open_read_counter_tables(&record)?;

        let cxt = FtlContext {
            usn_dec,
            next_usn: record.next_usn,
            free_pool: VecDeque::from(record.free_pool),
            swap_counter: record.swap_counter,
            map_table,
            erase_counters,
            read_counters,
            logs,
            scratch_log: None,
            ctrl_blocks,
            ctrl_page: Some(last),
            ctrl_rotate: false,
            clean: true,
            free_dirty: false,
            stats,
        };
        self.check_bounds(&cxt)?;
        cxt.check_pool()?;

        self.cxt = cxt;
        Ok(())
    }

    /// Read counters and statistics only carry over between matching FTL versions
    pub(super) fn open_read_counter_tables(
        &mut self,
        record: &FtlCxtRecord,
    ) -> Result<(Vec<u16>, FtlStats)> {
        let virtual_blocks = self.geometry.user_sublks_total as usize;

        if record.version != FTL_VERSION {
            warn!(
                "checkpoint from FTL version {:08x}, resetting read counters and statistics",
                record.version.0
            );
            return Ok((vec![0; virtual_blocks], FtlStats::default()));
        }

        let read_counters = self.load_table(
            &record.read_counter_pages,
            PageType::ReadCounters,
            record.usn_dec,
            virtual_blocks,
        )?;

        let vpn = record
            .stats_page
            .ok_or_else(|| Error::Inconsistent("checkpoint has no statistics page".into()))?;
        let mut page = vec![0u8; self.geometry.bytes_per_page];
        let spare = self.read_ctrl_page(vpn, &mut page)?;
        if spare.page_type != PageType::Stats || spare.usn_dec() != record.usn_dec {
            return Err(Error::Inconsistent(format!(
                "control page {vpn} is not the statistics page"
            )));
        }

        Ok((read_counters, FtlStats::decode(&page)?))
    }

    /// Every block number in a loaded context must be in range, and appear only once
    fn check_bounds(&self, cxt: &FtlContext) -> Result<()> {
        let ppsb = self.geometry.pages_per_sublk;
        let virtual_blocks = self.geometry.user_sublks_total as usize;
        let mut owner = vec![false; virtual_blocks];

        let logs = cxt.logs.iter().flatten();
        let blocks = cxt
            .ctrl_blocks
            .iter()
            .chain(&cxt.map_table)
            .chain(&cxt.free_pool)
            .chain(logs.clone().map(|log| &log.vbn));

        for &vb in blocks {
            match owner.get_mut(usize::from(vb)) {
                Some(taken) if !*taken => *taken = true,
                Some(_) => {
                    return Err(Error::Inconsistent(format!("virtual block {vb} used twice")))
                }
                None => {
                    return Err(Error::Inconsistent(format!(
                        "virtual block {vb} out of range"
                    )))
                }
            }
        }

        for log in logs {
            let offsets_ok = log
                .page_offsets
                .iter()
                .flatten()
                .all(|&index| index < log.pages_used);
            if u32::from(log.lbn) >= self.logical_blocks
                || u32::from(log.pages_used) > ppsb
                || !offsets_ok
            {
                return Err(Error::Inconsistent(format!(
                    "log of logical block {} out of range",
                    log.lbn
                )));
            }
        }

        Ok(())
    }
}
