//! A simulated in-memory NAND chip array, for testing purposes

use std::cell::Cell;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::ensure;

use super::{Clock, NandChip, NandLayout, Phase};
use crate::error::NandError;
use crate::util::PageUtil;

/// Image content of a factory-bad block, in every byte of every page
const FACTORY_BAD_FILL: u8 = 0xBD;

/// A simulated NAND array with fault injection
#[derive(Debug, Clone)]
pub struct SimNand {
    /// Bank-major: block `b` of bank `n` is `blocks[n * blocks_per_bank + b]`
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    faults: Faults,
    stats: SimStats,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// Main + spare bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// Was this block bad when it left the factory?
    factory_bad: bool,
}

#[derive(Debug, Default, Clone)]
struct Faults {
    /// (bank, phase, survives reset)
    stalls: Vec<(u32, Phase, bool)>,
    failing_program: HashSet<(u32, u32)>,
    failing_erase: HashSet<(u32, u32)>,

    /// Program/erase operations left before the power is cut
    power_budget: Option<u64>,
    powered_off: bool,
}

/// Operation counters
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct SimStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
    pub resets: u64,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let count = (layout.banks * layout.blocks_per_bank) as usize;
        let blocks = vec![SimBlock::new(); count].into_boxed_slice();

        Self {
            blocks,
            layout,
            faults: Default::default(),
            stats: Default::default(),
        }
    }

    fn raw_page_size(&self) -> usize {
        self.layout.bytes_per_page + self.layout.bytes_per_spare
    }

    fn block_index(&self, bank: u32, block: u32) -> Result<usize, NandError> {
        if bank >= self.layout.banks || block >= self.layout.blocks_per_bank {
            return Err(NandError::InvalidArgs);
        }
        Ok((bank * self.layout.blocks_per_bank + block) as usize)
    }

    /// Split an absolute page number into (block index, page within block)
    fn locate(&self, bank: u32, page: u32) -> Result<(usize, usize), NandError> {
        let index = self.block_index(bank, page / self.layout.pages_per_block)?;
        Ok((index, (page % self.layout.pages_per_block) as usize))
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// A block saved as all [FACTORY_BAD_FILL] comes back factory-bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let raw_page = self.raw_page_size();
        let mut buf = vec![0; raw_page * self.layout.pages_per_block as usize];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.factory_bad = buf.iter().all(|&x| x == FACTORY_BAD_FILL);
            if block.factory_bad {
                continue;
            }

            for (page, content) in buf.chunks_exact(raw_page).enumerate() {
                block.write_page(page, raw_page, content)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let raw_page = self.raw_page_size();
        let mut buf = vec![0; raw_page];

        for block in self.blocks.iter() {
            for page in 0..self.layout.pages_per_block as usize {
                match block.factory_bad {
                    true => buf.fill(FACTORY_BAD_FILL),
                    false => block.read_page(page, &mut buf),
                }
                write.write_all(&buf)?;
            }
        }

        Ok(())
    }

    /// Make a block fail every erase and program, as a factory-bad block does
    pub fn mark_factory_bad(&mut self, bank: u32, block: u32) {
        if let Ok(index) = self.block_index(bank, block) {
            self.blocks[index].factory_bad = true;
        }
    }

    /// Make programs into this block fail
    pub fn fail_program(&mut self, bank: u32, block: u32) {
        self.faults.failing_program.insert((bank, block));
    }

    /// Make erases of this block fail
    pub fn fail_erase(&mut self, bank: u32, block: u32) {
        self.faults.failing_erase.insert((bank, block));
    }

    /// Never complete `phase` on `bank`; unless `persistent`, a bank reset clears this
    pub fn stall(&mut self, bank: u32, phase: Phase, persistent: bool) {
        self.faults.stalls.push((bank, phase, persistent));
    }

    /// Cut the power after `ops` more program/erase operations
    pub fn set_power_budget(&mut self, ops: u64) {
        self.faults.power_budget = Some(ops);
    }

    /// Power back on, with no budget
    pub fn restore_power(&mut self) {
        self.faults.power_budget = None;
        self.faults.powered_off = false;
        self.faults.stalls.clear();
    }

    pub fn powered_off(&self) -> bool {
        self.faults.powered_off
    }

    /// Invert one bit of a programmed page's main area
    pub fn flip_bit(&mut self, bank: u32, page: u32, byte: usize, bit: u8) {
        let raw_page = self.raw_page_size();
        if let Ok((index, page)) = self.locate(bank, page) {
            if let Some(x) = self.blocks[index].data.get_mut(page * raw_page + byte) {
                *x ^= 1 << bit;
            }
        }
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Spend one unit of the power budget
    fn draw_power(&mut self) -> Result<(), NandError> {
        if self.faults.powered_off {
            return Err(NandError::Io);
        }
        match &mut self.faults.power_budget {
            Some(0) => {
                self.faults.powered_off = true;
                Err(NandError::Io)
            }
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl SimBlock {
    fn new() -> Self {
        Self {
            data: Default::default(),
            factory_bad: false,
        }
    }

    fn write_page(&mut self, index: usize, raw_page: usize, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == raw_page, "content not page-sized");

        let begin = index * raw_page;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: usize, content: &mut [u8]) {
        let begin = index * content.len();
        let end = begin + content.len();

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }
    }
}

impl NandChip for SimNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn read_page(
        &mut self,
        bank: u32,
        page: u32,
        main: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), NandError> {
        if self.faults.powered_off {
            return Err(NandError::Io);
        }

        let (index, page) = self.locate(bank, page)?;
        let block = &self.blocks[index];
        if block.factory_bad {
            return Err(NandError::Io);
        }
        if main.len() != self.layout.bytes_per_page || spare.len() != self.layout.bytes_per_spare
        {
            return Err(NandError::InvalidArgs);
        }

        let mut raw = vec![0u8; self.raw_page_size()];
        block.read_page(page, &mut raw);
        let (raw_main, raw_spare) = raw.split_at(self.layout.bytes_per_page);
        main.copy_from_slice(raw_main);
        spare.copy_from_slice(raw_spare);

        self.stats.reads += 1;
        Ok(())
    }

    fn program_page(
        &mut self,
        bank: u32,
        page: u32,
        main: &[u8],
        spare: &[u8],
    ) -> Result<(), NandError> {
        let (index, page) = self.locate(bank, page)?;
        self.draw_power()?;

        let block_number = (index as u32) % self.layout.blocks_per_bank;
        if self.blocks[index].factory_bad
            || self.faults.failing_program.contains(&(bank, block_number))
        {
            return Err(NandError::Io);
        }

        let mut raw = Vec::with_capacity(self.raw_page_size());
        raw.extend_from_slice(main);
        raw.extend_from_slice(spare);

        let raw_page = self.raw_page_size();
        self.blocks[index]
            .write_page(page, raw_page, &raw)
            .map_err(|_| NandError::Io)?;

        self.stats.programs += 1;
        Ok(())
    }

    fn erase_block(&mut self, bank: u32, block: u32) -> Result<(), NandError> {
        let index = self.block_index(bank, block)?;
        self.draw_power()?;

        if self.blocks[index].factory_bad || self.faults.failing_erase.contains(&(bank, block)) {
            return Err(NandError::Io);
        }

        self.blocks[index].data.clear();
        self.stats.erases += 1;
        Ok(())
    }

    fn phase_complete(&mut self, bank: u32, phase: Phase) -> bool {
        !self
            .faults
            .stalls
            .iter()
            .any(|&(b, p, _)| (b, p) == (bank, phase))
    }

    fn reset(&mut self, bank: u32) -> Result<(), NandError> {
        if self.faults.powered_off {
            return Err(NandError::Io);
        }

        self.faults
            .stalls
            .retain(|&(b, _, persistent)| b != bank || persistent);
        self.stats.resets += 1;
        Ok(())
    }
}

/// A [Clock] that only moves when polled, by a fixed step per yield
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Cell<Duration>,
}

impl SimClock {
    const STEP: Duration = Duration::from_millis(1);
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn yield_now(&self) {
        self.now.set(self.now.get() + Self::STEP);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::TEST_LAYOUT;

    fn page(fill: u8) -> (Vec<u8>, Vec<u8>) {
        (
            vec![fill; TEST_LAYOUT.bytes_per_page],
            vec![fill; TEST_LAYOUT.bytes_per_spare],
        )
    }

    #[test]
    fn test_sim_read_write() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let (main_in, spare_in) = page(0xA5);
        let (mut main_out, mut spare_out) = page(0);

        nand.program_page(1, 2, &main_in, &spare_in)?;
        assert!(nand.program_page(1, 1, &main_in, &spare_in).is_err());

        nand.read_page(1, 1, &mut main_out, &mut spare_out)?;
        assert!(main_out.is_erased() && spare_out.is_erased());

        nand.read_page(1, 2, &mut main_out, &mut spare_out)?;
        assert_eq!((&main_out, &spare_out), (&main_in, &spare_in));

        // Same page number in the other bank is a different page
        nand.read_page(0, 2, &mut main_out, &mut spare_out)?;
        assert!(main_out.is_erased());

        nand.erase_block(1, 0)?;
        nand.read_page(1, 2, &mut main_out, &mut spare_out)?;
        assert!(main_out.is_erased());
        nand.program_page(1, 1, &main_in, &spare_in)?;
        Ok(())
    }

    #[test]
    fn test_sim_faults() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let (main, spare) = page(0x00);

        nand.mark_factory_bad(0, 3);
        assert_eq!(nand.erase_block(0, 3), Err(NandError::Io));
        assert_eq!(nand.erase_block(1, 3), Ok(()));

        nand.fail_program(1, 4);
        assert_eq!(nand.program_page(1, 4 * 16, &main, &spare), Err(NandError::Io));
        nand.program_page(0, 4 * 16, &main, &spare)?;

        nand.fail_erase(0, 9);
        assert_eq!(nand.erase_block(0, 9), Err(NandError::Io));
        Ok(())
    }

    #[test]
    fn test_sim_power_budget() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let (main, spare) = page(0x00);
        let (mut out, mut out_spare) = page(0);

        nand.set_power_budget(2);
        nand.program_page(0, 0, &main, &spare)?;
        nand.erase_block(0, 5)?;
        assert_eq!(nand.program_page(0, 1, &main, &spare), Err(NandError::Io));
        assert!(nand.powered_off());
        assert_eq!(nand.read_page(0, 0, &mut out, &mut out_spare), Err(NandError::Io));

        nand.restore_power();
        nand.read_page(0, 0, &mut out, &mut out_spare)?;
        assert_eq!(out, main);
        nand.read_page(0, 1, &mut out, &mut out_spare)?;
        assert!(out.is_erased());
        assert_eq!(nand.stats().programs, 1);
        assert_eq!(nand.stats().erases, 1);
        Ok(())
    }

    #[test]
    fn test_sim_load_save() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let (main, spare) = page(0x3C);
        nand.program_page(1, 100, &main, &spare)?;

        nand.mark_factory_bad(0, 3);

        let mut image = Vec::new();
        nand.save(&mut image)?;

        let mut copy = SimNand::new(TEST_LAYOUT);
        copy.load(&mut &image[..])?;

        let (mut out, mut out_spare) = page(0);
        copy.read_page(1, 100, &mut out, &mut out_spare)?;
        assert_eq!((&out, &out_spare), (&main, &spare));
        copy.read_page(1, 99, &mut out, &mut out_spare)?;
        assert!(out.is_erased());

        assert_eq!(copy.read_page(0, 3 * 16, &mut out, &mut out_spare), Err(NandError::Io));
        assert_eq!(copy.erase_block(0, 3), Err(NandError::Io));
        assert_eq!(copy.erase_block(1, 3), Ok(()));

        let mut resaved = Vec::new();
        copy.save(&mut resaved)?;
        assert!(resaved == image);
        Ok(())
    }

    #[test]
    fn test_sim_clock() {
        let clock = SimClock::default();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.yield_now();
        clock.yield_now();
        assert_eq!(clock.now(), Duration::from_millis(2));
    }
}
