//! Tunables for the FTL and the NAND polling loops.

use std::time::Duration;

use crate::nand::Phase;

/// FTL policy knobs
#[derive(Debug, Clone)]
pub struct FtlConfig {
    /// Minimum erase-count gap between a free block and a cold map block before they are swapped
    pub wear_level_threshold: u16,

    /// Swap-counter value at which `write` runs a wear-levelling pass
    pub write_wear_level_trigger: u32,

    /// Swap-counter value at which `sync` runs a wear-levelling pass
    pub sync_wear_level_trigger: u32,

    /// How many distinct free blocks a merge or full-block write tries before giving up
    pub block_retries: usize,

    /// How many times `sync` retries the checkpoint commit, each on a fresh control block
    pub commit_retries: usize,

    /// Relocate a map block once this many pages have been read from it
    pub read_refresh_threshold: Option<u16>,

    pub timeouts: NandTimeouts,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            wear_level_threshold: 5,
            write_wear_level_trigger: 300,
            sync_wear_level_trigger: 20,
            block_retries: 4,
            commit_retries: 4,
            read_refresh_threshold: None,
            timeouts: NandTimeouts::default(),
        }
    }
}

/// Per-phase deadlines for the NAND busy-poll loops
#[derive(Debug, Clone, Copy)]
pub struct NandTimeouts {
    pub command_latch: Duration,
    pub address_latch: Duration,
    pub transfer_done: Duration,
    pub bank_ready: Duration,

    /// Deadline for a bank to come back after `bank_reset`
    pub reset: Duration,
}

impl NandTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::CommandLatch => self.command_latch,
            Phase::AddressLatch => self.address_latch,
            Phase::TransferDone => self.transfer_done,
            Phase::BankReady => self.bank_ready,
        }
    }
}

impl Default for NandTimeouts {
    fn default() -> Self {
        Self {
            command_latch: Duration::from_millis(500),
            address_latch: Duration::from_millis(500),
            transfer_done: Duration::from_millis(500),
            bank_ready: Duration::from_millis(500),
            reset: Duration::from_millis(100),
        }
    }
}
