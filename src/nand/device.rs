//! ECC-aware page I/O on top of a raw [NandChip], with the busy-poll handshake loops.

use std::time::Duration;

use log::{trace, warn};

use super::ecc::{decode_spare, encode_spare};
use super::{Clock, NandChip, NandGeometry, Phase, SpareData, SystemClock};
use crate::config::NandTimeouts;
use crate::error::{NandError, Result};

/// A NAND chip array, its geometry, and the clock used to time out its handshakes
#[derive(Debug)]
pub struct NandDevice<C: NandChip, K: Clock = SystemClock> {
    chip: C,
    clock: K,
    geometry: NandGeometry,
    timeouts: NandTimeouts,
}

impl<C: NandChip, K: Clock> NandDevice<C, K> {
    /// Detect the geometry of `chip` and validate it
    pub fn new(chip: C, clock: K, timeouts: NandTimeouts) -> Result<Self> {
        let geometry = NandGeometry::new(chip.layout())?;

        Ok(Self {
            chip,
            clock,
            geometry,
            timeouts,
        })
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    pub fn chip(&self) -> &C {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }

    pub fn into_chip(self) -> C {
        self.chip
    }

    /// Read a page and decode its spare metadata
    ///
    /// `main`, when given, receives the page data even if the page turns out to be erased or
    /// fails its ECC check.
    pub fn read(
        &mut self,
        bank: u32,
        page: u32,
        main: Option<&mut [u8]>,
        check_ecc: bool,
        check_blank: bool,
    ) -> Result<SpareData, NandError> {
        self.check_address(bank, page)?;

        let mut scratch;
        let main = match main {
            Some(buf) => buf,
            None => {
                scratch = vec![0u8; self.geometry.bytes_per_page];
                &mut scratch[..]
            }
        };
        if main.len() != self.geometry.bytes_per_page {
            return Err(NandError::InvalidArgs);
        }

        let mut spare = vec![0u8; self.geometry.bytes_per_spare];

        self.wait(bank, Phase::CommandLatch)?;
        self.wait(bank, Phase::AddressLatch)?;
        self.chip.read_page(bank, page, main, &mut spare)?;
        self.wait(bank, Phase::TransferDone)?;
        self.wait(bank, Phase::BankReady)?;

        decode_spare(main, &spare, check_ecc, check_blank)
    }

    /// Generate ECC for `main` and `spare_data` and program the page
    pub fn write(
        &mut self,
        bank: u32,
        page: u32,
        main: &[u8],
        spare_data: &SpareData,
    ) -> Result<(), NandError> {
        self.check_address(bank, page)?;
        if main.len() != self.geometry.bytes_per_page {
            return Err(NandError::InvalidArgs);
        }

        let mut spare = vec![0xFFu8; self.geometry.bytes_per_spare];
        encode_spare(spare_data, main, &mut spare)?;

        self.wait(bank, Phase::CommandLatch)?;
        self.wait(bank, Phase::AddressLatch)?;
        self.wait(bank, Phase::TransferDone)?;
        self.chip.program_page(bank, page, main, &spare)?;
        self.wait(bank, Phase::BankReady)
    }

    pub fn erase(&mut self, bank: u32, block: u32) -> Result<(), NandError> {
        if bank >= self.geometry.banks || block >= self.geometry.blocks_per_bank {
            return Err(NandError::InvalidArgs);
        }

        self.wait(bank, Phase::CommandLatch)?;
        self.wait(bank, Phase::AddressLatch)?;
        self.chip.erase_block(bank, block)?;
        self.wait(bank, Phase::BankReady)
    }

    /// Reset one bank and wait up to `timeout` for it to report ready again
    pub fn bank_reset(&mut self, bank: u32, timeout: Duration) -> Result<(), NandError> {
        if bank >= self.geometry.banks {
            return Err(NandError::InvalidArgs);
        }

        trace!("resetting bank {bank}");
        self.chip.reset(bank)?;
        self.wait_for(bank, Phase::BankReady, timeout)
    }

    /// The reset timeout configured for this device
    pub fn reset_timeout(&self) -> Duration {
        self.timeouts.reset
    }

    fn check_address(&self, bank: u32, page: u32) -> Result<(), NandError> {
        if bank >= self.geometry.banks || page >= self.geometry.pages_per_bank() {
            return Err(NandError::InvalidArgs);
        }
        Ok(())
    }

    fn wait(&mut self, bank: u32, phase: Phase) -> Result<(), NandError> {
        self.wait_for(bank, phase, self.timeouts.for_phase(phase))
    }

    fn wait_for(&mut self, bank: u32, phase: Phase, timeout: Duration) -> Result<(), NandError> {
        let start = self.clock.now();
        while !self.chip.phase_complete(bank, phase) {
            if self.clock.now().saturating_sub(start) >= timeout {
                warn!("bank {bank} timed out in {phase:?} after {timeout:?}");
                return Err(NandError::Timeout(phase));
            }
            self.clock.yield_now();
        }
        Ok(())
    }
}
