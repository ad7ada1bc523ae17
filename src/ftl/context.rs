//! In-memory FTL state, and the record it is checkpointed as.
//!
//! The working [FtlContext] owns real containers and `Option`s; [FtlCxtRecord] is the plain
//! on-media header (sentinels, page pointers) that the large tables hang off of. Converting
//! between them is explicit and happens only in `persist`.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Free virtual blocks plus active logs always add up to this
pub const FREE_POOL_SLOTS: usize = 20;
pub const CTRL_BLOCKS: usize = 3;

/// Log slots usable for writes
pub const MAX_LOGS: usize = 17;

/// Log records in the on-media header (`MAX_LOGS` plus the scratch slot)
const LOG_RECORDS: usize = MAX_LOGS + 1;

pub const MAP_TABLE_PAGES: usize = 18;
pub const ERASE_COUNTER_PAGES: usize = 36;
pub const PAGE_OFFSET_PAGES: usize = 34;
pub const READ_COUNTER_PAGES: usize = 36;

/// Version tag pair of the current checkpoint layout; the second word is the complement of the
/// first
pub const FTL_VERSION: (u32, u32) = (0x4656_0001, 0xB9A9_FFFE);

const NONE16: u16 = 0xFFFF;
const NONE32: u32 = 0xFFFF_FFFF;

/// A log block: recent writes to one logical block, out of place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDescriptor {
    /// USN when the log was opened; lower is older
    pub usn: u32,
    pub vbn: u16,
    pub lbn: u16,

    /// For each page of the logical block, where it lives in the log (if it does)
    pub page_offsets: Vec<Option<u16>>,

    /// Log pages consumed, including any that failed to program
    pub pages_used: u16,

    /// Distinct logical pages held in the log
    pub pages_current: u16,

    /// Every page so far landed at the index matching its logical offset
    pub sequential: bool,
}

impl LogDescriptor {
    pub fn new(vbn: u16, lbn: u16, usn: u32, pages_per_sublk: u32) -> Self {
        Self {
            usn,
            vbn,
            lbn,
            page_offsets: vec![None; pages_per_sublk as usize],
            pages_used: 0,
            pages_current: 0,
            sequential: true,
        }
    }

    /// Note that logical `offset` was just written to log page `index`
    pub fn record(&mut self, offset: u16, index: u16) {
        let slot = &mut self.page_offsets[usize::from(offset)];
        if slot.is_none() {
            self.pages_current += 1;
        }
        *slot = Some(index);

        if offset != index {
            self.sequential = false;
        }
    }

    pub fn is_full(&self) -> bool {
        usize::from(self.pages_used) >= self.page_offsets.len()
    }
}

/// Counters kept alongside the checkpoint
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FtlStats {
    pub pages_read: u64,
    pub pages_written: u64,
    pub simple_merges: u32,
    pub copy_merges: u32,
    pub compactions: u32,
    pub wear_level_swaps: u32,
    pub read_refreshes: u32,
    pub restores: u32,
    pub ecc_read_failures: u32,
    pub checkpoints: u32,
}

impl FtlStats {
    const ENCODED_LEN: usize = 2 * 8 + 8 * 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.put_u64_le(self.pages_read);
        buf.put_u64_le(self.pages_written);
        buf.put_u32_le(self.simple_merges);
        buf.put_u32_le(self.copy_merges);
        buf.put_u32_le(self.compactions);
        buf.put_u32_le(self.wear_level_swaps);
        buf.put_u32_le(self.read_refreshes);
        buf.put_u32_le(self.restores);
        buf.put_u32_le(self.ecc_read_failures);
        buf.put_u32_le(self.checkpoints);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::Inconsistent("statistics page too short".into()));
        }

        Ok(Self {
            pages_read: bytes.get_u64_le(),
            pages_written: bytes.get_u64_le(),
            simple_merges: bytes.get_u32_le(),
            copy_merges: bytes.get_u32_le(),
            compactions: bytes.get_u32_le(),
            wear_level_swaps: bytes.get_u32_le(),
            read_refreshes: bytes.get_u32_le(),
            restores: bytes.get_u32_le(),
            ecc_read_failures: bytes.get_u32_le(),
            checkpoints: bytes.get_u32_le(),
        })
    }
}

/// The FTL's working state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtlContext {
    /// Generation of the control block being appended to; lower is newer
    pub usn_dec: u32,

    /// USN the next data write will carry
    pub next_usn: u32,

    pub free_pool: VecDeque<u16>,

    /// Merges since wear levelling last ran
    pub swap_counter: u32,

    /// Logical block -> virtual block
    pub map_table: Vec<u16>,

    /// Per virtual block
    pub erase_counters: Vec<u16>,

    /// Per virtual block
    pub read_counters: Vec<u16>,

    pub logs: Vec<Option<LogDescriptor>>,

    /// Snapshot of a log being compacted, restored if the compaction fails
    pub scratch_log: Option<LogDescriptor>,

    pub ctrl_blocks: [u16; CTRL_BLOCKS],

    /// Last control page written
    pub ctrl_page: Option<u32>,

    /// Start a fresh control block on the next control-page write
    pub ctrl_rotate: bool,

    /// Nothing has changed on flash since the last checkpoint
    pub clean: bool,

    /// Some free-pool blocks may still hold stale pages and must be erased before use
    pub free_dirty: bool,

    pub stats: FtlStats,
}

impl FtlContext {
    pub fn new(logical_blocks: u32, virtual_blocks: u32) -> Self {
        Self {
            usn_dec: u32::MAX,
            next_usn: 1,
            free_pool: VecDeque::with_capacity(FREE_POOL_SLOTS),
            swap_counter: 0,
            map_table: vec![0; logical_blocks as usize],
            erase_counters: vec![0; virtual_blocks as usize],
            read_counters: vec![0; virtual_blocks as usize],
            logs: vec![None; MAX_LOGS],
            scratch_log: None,
            ctrl_blocks: [0, 1, 2],
            ctrl_page: None,
            ctrl_rotate: false,
            clean: false,
            free_dirty: false,
            stats: FtlStats::default(),
        }
    }

    pub fn find_log(&self, lbn: u16) -> Option<usize> {
        self.logs
            .iter()
            .position(|log| log.as_ref().is_some_and(|log| log.lbn == lbn))
    }

    pub fn active_logs(&self) -> usize {
        self.logs.iter().filter(|log| log.is_some()).count()
    }

    /// Take the next USN
    pub fn bump_usn(&mut self) -> u32 {
        let usn = self.next_usn;
        self.next_usn += 1;
        usn
    }

    /// The pool accounting identity: free blocks plus active logs is constant
    pub fn check_pool(&self) -> Result<()> {
        let (free, logs) = (self.free_pool.len(), self.active_logs());
        if free + logs != FREE_POOL_SLOTS {
            return Err(Error::Inconsistent(format!(
                "{free} free blocks + {logs} logs != {FREE_POOL_SLOTS}"
            )));
        }
        Ok(())
    }

    /// Log page offsets of every slot, flattened for the sub-table pages
    pub fn flatten_offsets(&self, pages_per_sublk: u32) -> Vec<u16> {
        let mut flat = Vec::with_capacity(MAX_LOGS * pages_per_sublk as usize);
        for log in &self.logs {
            match log {
                Some(log) => flat.extend(log.page_offsets.iter().map(|o| o.unwrap_or(NONE16))),
                None => flat.extend(std::iter::repeat(NONE16).take(pages_per_sublk as usize)),
            }
        }
        flat
    }
}

/// On-media form of a log descriptor (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub usn: u32,
    pub vbn: u16,
    pub lbn: u16,
    pub pages_used: u16,
    pub pages_current: u16,
    pub sequential: bool,
}

impl From<&LogDescriptor> for LogRecord {
    fn from(log: &LogDescriptor) -> Self {
        Self {
            usn: log.usn,
            vbn: log.vbn,
            lbn: log.lbn,
            pages_used: log.pages_used,
            pages_current: log.pages_current,
            sequential: log.sequential,
        }
    }
}

/// The checkpoint header page (`FTLCxt`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtlCxtRecord {
    pub usn_dec: u32,
    pub next_usn: u32,
    pub free_pool: Vec<u16>,
    pub swap_counter: u32,
    pub map_table_pages: Vec<Option<u32>>,
    pub erase_counter_pages: Vec<Option<u32>>,
    pub page_offset_pages: Vec<Option<u32>>,
    pub logs: Vec<Option<LogRecord>>,
    pub ctrl_blocks: [u16; CTRL_BLOCKS],
    pub ctrl_page: Option<u32>,
    pub clean: bool,
    pub read_counter_pages: Vec<Option<u32>>,
    pub stats_page: Option<u32>,
    pub version: (u32, u32),
}

fn put_pointers(buf: &mut Vec<u8>, pointers: &[Option<u32>], len: usize) {
    for i in 0..len {
        buf.put_u32_le(pointers.get(i).copied().flatten().unwrap_or(NONE32));
    }
}

fn get_pointers(bytes: &mut &[u8], len: usize) -> Vec<Option<u32>> {
    (0..len)
        .map(|_| Some(bytes.get_u32_le()).filter(|&p| p != NONE32))
        .collect()
}

impl FtlCxtRecord {
    pub const ENCODED_LEN: usize = 16
        + 2 * FREE_POOL_SLOTS
        + 2
        + 4 * (MAP_TABLE_PAGES + ERASE_COUNTER_PAGES + PAGE_OFFSET_PAGES)
        + 16 * LOG_RECORDS
        + 4
        + 2
        + 2 * CTRL_BLOCKS
        + 4
        + 2
        + 4 * READ_COUNTER_PAGES
        + 4
        + 8;

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.free_pool.len() > FREE_POOL_SLOTS || self.logs.len() > LOG_RECORDS {
            return Err(Error::Inconsistent("FTL context overflows its record".into()));
        }

        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.put_u32_le(self.usn_dec);
        buf.put_u32_le(self.next_usn);
        buf.put_u16_le(self.free_pool.len() as u16);
        buf.put_u16_le(0);
        buf.put_u32_le(self.swap_counter);
        for i in 0..FREE_POOL_SLOTS {
            buf.put_u16_le(self.free_pool.get(i).copied().unwrap_or(NONE16));
        }
        buf.put_u16_le(0);

        put_pointers(&mut buf, &self.map_table_pages, MAP_TABLE_PAGES);
        put_pointers(&mut buf, &self.erase_counter_pages, ERASE_COUNTER_PAGES);
        put_pointers(&mut buf, &self.page_offset_pages, PAGE_OFFSET_PAGES);

        for i in 0..LOG_RECORDS {
            match self.logs.get(i).copied().flatten() {
                Some(log) => {
                    buf.put_u32_le(log.usn);
                    buf.put_u16_le(log.vbn);
                    buf.put_u16_le(log.lbn);
                    buf.put_u16_le(log.pages_used);
                    buf.put_u16_le(log.pages_current);
                    buf.put_u32_le(u32::from(log.sequential));
                }
                None => {
                    buf.put_u32_le(NONE32);
                    buf.put_u16_le(NONE16);
                    buf.put_u16_le(NONE16);
                    buf.put_u16_le(0);
                    buf.put_u16_le(0);
                    buf.put_u32_le(0);
                }
            }
        }

        buf.put_u32_le(0);
        buf.put_u16_le(0);
        for &block in &self.ctrl_blocks {
            buf.put_u16_le(block);
        }
        buf.put_u32_le(self.ctrl_page.unwrap_or(NONE32));
        buf.put_u8(u8::from(self.clean));
        buf.put_u8(0);
        put_pointers(&mut buf, &self.read_counter_pages, READ_COUNTER_PAGES);
        buf.put_u32_le(self.stats_page.unwrap_or(NONE32));
        buf.put_u32_le(self.version.0);
        buf.put_u32_le(self.version.1);

        debug_assert_eq!(buf.len(), Self::ENCODED_LEN);
        Ok(buf)
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::Inconsistent("FTL context page too short".into()));
        }

        let usn_dec = bytes.get_u32_le();
        let next_usn = bytes.get_u32_le();
        let free_count = usize::from(bytes.get_u16_le());
        let _free_head = bytes.get_u16_le();
        let swap_counter = bytes.get_u32_le();
        let ring: Vec<u16> = (0..FREE_POOL_SLOTS).map(|_| bytes.get_u16_le()).collect();
        bytes.advance(2);

        if free_count > FREE_POOL_SLOTS {
            return Err(Error::Inconsistent(format!("free pool count {free_count}")));
        }
        let free_pool = ring[..free_count].to_vec();

        let map_table_pages = get_pointers(&mut bytes, MAP_TABLE_PAGES);
        let erase_counter_pages = get_pointers(&mut bytes, ERASE_COUNTER_PAGES);
        let page_offset_pages = get_pointers(&mut bytes, PAGE_OFFSET_PAGES);

        let logs = (0..LOG_RECORDS)
            .map(|_| {
                let log = LogRecord {
                    usn: bytes.get_u32_le(),
                    vbn: bytes.get_u16_le(),
                    lbn: bytes.get_u16_le(),
                    pages_used: bytes.get_u16_le(),
                    pages_current: bytes.get_u16_le(),
                    sequential: bytes.get_u32_le() != 0,
                };
                Some(log).filter(|log| log.vbn != NONE16)
            })
            .collect();

        bytes.advance(4 + 2);
        let mut ctrl_blocks = [0u16; CTRL_BLOCKS];
        for block in &mut ctrl_blocks {
            *block = bytes.get_u16_le();
        }
        let ctrl_page = Some(bytes.get_u32_le()).filter(|&p| p != NONE32);
        let clean = bytes.get_u8() != 0;
        bytes.advance(1);
        let read_counter_pages = get_pointers(&mut bytes, READ_COUNTER_PAGES);
        let stats_page = Some(bytes.get_u32_le()).filter(|&p| p != NONE32);
        let version = (bytes.get_u32_le(), bytes.get_u32_le());

        Ok(Self {
            usn_dec,
            next_usn,
            free_pool,
            swap_counter,
            map_table_pages,
            erase_counter_pages,
            page_offset_pages,
            logs,
            ctrl_blocks,
            ctrl_page,
            clean,
            read_counter_pages,
            stats_page,
            version,
        })
    }
}

/// Pack 16-bit table entries into little-endian bytes
pub fn encode_table(values: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 2);
    for &value in values {
        buf.put_u16_le(value);
    }
    buf
}

pub fn decode_table(mut bytes: &[u8], len: usize) -> Result<Vec<u16>> {
    if bytes.len() < len * 2 {
        return Err(Error::Inconsistent("table pages too short".into()));
    }
    Ok((0..len).map(|_| bytes.get_u16_le()).collect())
}

pub fn unflatten_offset(value: u16) -> Option<u16> {
    Some(value).filter(|&v| v != NONE16)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_log_descriptor() {
        let mut log = LogDescriptor::new(30, 2, 100, 8);
        log.record(0, 0);
        log.record(1, 1);
        log.pages_used = 2;
        assert!(log.sequential);
        assert_eq!(log.pages_current, 2);

        // Rewriting offset 1 lands at index 2: still two current pages, no longer sequential
        log.record(1, 2);
        log.pages_used = 3;
        assert!(!log.sequential);
        assert_eq!(log.pages_current, 2);
        assert_eq!(log.page_offsets[1], Some(2));
        assert!(!log.is_full());
    }

    #[test]
    fn test_pool_identity() {
        let mut cxt = FtlContext::new(4, 30);
        cxt.free_pool.extend(10..30);
        assert!(cxt.check_pool().is_ok());

        let vb = cxt.free_pool.pop_front().unwrap_or_default();
        assert!(cxt.check_pool().is_err());
        cxt.logs[5] = Some(LogDescriptor::new(vb, 1, 1, 32));
        assert!(cxt.check_pool().is_ok());
        assert_eq!(cxt.find_log(1), Some(5));
        assert_eq!(cxt.find_log(2), None);
    }

    #[test]
    fn test_record_layout() -> anyhow::Result<()> {
        let record = FtlCxtRecord {
            usn_dec: 0xFFFF_FFF0,
            next_usn: 77,
            free_pool: vec![40, 41, 42],
            swap_counter: 3,
            map_table_pages: vec![Some(12)],
            erase_counter_pages: vec![Some(10)],
            page_offset_pages: vec![Some(13)],
            logs: vec![
                None,
                Some(LogRecord {
                    usn: 70,
                    vbn: 44,
                    lbn: 3,
                    pages_used: 5,
                    pages_current: 4,
                    sequential: false,
                }),
            ],
            ctrl_blocks: [0, 1, 2],
            ctrl_page: Some(15),
            clean: true,
            read_counter_pages: vec![Some(11)],
            stats_page: Some(14),
            version: FTL_VERSION,
        };

        let bytes = record.encode()?;
        assert_eq!(bytes.len(), FtlCxtRecord::ENCODED_LEN);
        assert_eq!(bytes[8..10], [3, 0]);
        assert_eq!(bytes[16..18], [40, 0]);
        assert_eq!(bytes[bytes.len() - 8..bytes.len() - 4], 0x4656_0001u32.to_le_bytes());
        assert_eq!(bytes[bytes.len() - 4..], 0xB9A9_FFFEu32.to_le_bytes());

        let decoded = FtlCxtRecord::decode(&bytes)?;
        assert_eq!(decoded.free_pool, record.free_pool);
        assert_eq!(decoded.logs[1], record.logs[1]);
        assert_eq!(decoded.logs.iter().flatten().count(), 1);
        assert_eq!(decoded.map_table_pages[0], Some(12));
        assert_eq!(decoded.map_table_pages[1], None);
        assert_eq!(decoded.ctrl_page, Some(15));
        assert!(decoded.clean);
        assert_eq!(decoded.version, FTL_VERSION);
        Ok(())
    }

    #[test]
    fn test_stats() -> anyhow::Result<()> {
        let stats = FtlStats {
            pages_written: 1 << 40,
            restores: 2,
            ..Default::default()
        };
        assert_eq!(FtlStats::decode(&stats.encode())?, stats);
        assert!(FtlStats::decode(&[0; 8]).is_err());
        Ok(())
    }
}
