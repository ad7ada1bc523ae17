//! The block-device face of the stack: one lock around the whole FTL, and errno-style wrappers.

use std::sync::{Mutex, MutexGuard};

use log::{error, warn};

use crate::config::FtlConfig;
use crate::error::{Error, Result};
use crate::ftl::{FtlStats, FtlVolume};
use crate::nand::{Clock, NandChip, NandDevice, SystemClock};

/// A mounted FTL, safe to share between threads; requests are served one at a time
#[derive(Debug)]
pub struct FtlDevice<C: NandChip, K: Clock = SystemClock> {
    volume: Mutex<FtlVolume<C, K>>,
    logical_pages: u32,
    page_size: usize,
}

impl<C: NandChip, K: Clock> FtlDevice<C, K> {
    pub fn new(volume: FtlVolume<C, K>) -> Self {
        Self {
            logical_pages: volume.logical_pages(),
            page_size: volume.geometry().bytes_per_page,
            volume: Mutex::new(volume),
        }
    }

    /// Bring up the VFL and FTL on `device`
    pub fn setup(device: NandDevice<C, K>, config: FtlConfig) -> Result<Self> {
        Ok(Self::new(FtlVolume::setup(device, config)?))
    }

    /// [FtlDevice::setup], failing with a negative errno
    pub fn ftl_setup(device: NandDevice<C, K>, config: FtlConfig) -> Result<Self, i32> {
        Self::setup(device, config).map_err(|e| {
            error!("FTL setup failed: {e}");
            e.errno()
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, FtlVolume<C, K>>> {
        self.volume
            .lock()
            .map_err(|_| Error::Inconsistent("FTL lock poisoned by a panicked request".into()))
    }

    pub fn logical_pages(&self) -> u32 {
        self.logical_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> Result<FtlStats> {
        Ok(self.lock()?.context().stats)
    }

    pub fn read(&self, lpn: u32, count: u32, buf: &mut [u8]) -> Result<()> {
        self.lock()?.read(lpn, count, buf)
    }

    pub fn write(&self, lpn: u32, count: u32, buf: &[u8]) -> Result<()> {
        self.lock()?.write(lpn, count, buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.lock()?.sync()
    }

    /// Read `count` pages; 0 on success, otherwise a negative errno
    pub fn ftl_read(&self, lpn: u32, count: i32, buf: &mut [u8]) -> i32 {
        let result = page_count(count).and_then(|count| self.read(lpn, count, buf));
        errno(result, "read", lpn)
    }

    /// Write `count` pages; 0 on success, otherwise a negative errno
    pub fn ftl_write(&self, lpn: u32, count: i32, buf: &[u8]) -> i32 {
        let result = page_count(count).and_then(|count| self.write(lpn, count, buf));
        errno(result, "write", lpn)
    }

    pub fn ftl_sync(&self) -> bool {
        match self.sync() {
            Ok(()) => true,
            Err(e) => {
                error!("FTL sync failed: {e}");
                false
            }
        }
    }

    /// Unmount, handing back the volume (without syncing it)
    pub fn into_inner(self) -> Result<FtlVolume<C, K>> {
        self.volume
            .into_inner()
            .map_err(|_| Error::Inconsistent("FTL lock poisoned by a panicked request".into()))
    }
}

fn page_count(count: i32) -> Result<u32> {
    u32::try_from(count).map_err(|_| Error::InvalidArgs(format!("page count {count}")))
}

fn errno(result: Result<()>, what: &str, lpn: u32) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            warn!("{what} at logical page {lpn} failed: {e}");
            e.errno()
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::config::NandTimeouts;
    use crate::nand::{SimClock, SimNand, TEST_LAYOUT};
    use crate::vfl::Vfl;

    type TestDevice = FtlDevice<SimNand, SimClock>;

    fn nand_device(nand: SimNand) -> anyhow::Result<NandDevice<SimNand, SimClock>> {
        Ok(NandDevice::new(nand, SimClock::default(), NandTimeouts::default())?)
    }

    fn formatted() -> anyhow::Result<TestDevice> {
        let vfl = Vfl::new(nand_device(SimNand::new(TEST_LAYOUT))?);
        let mut volume = FtlVolume::init(vfl, FtlConfig::default())?;
        volume.format()?;
        Ok(FtlDevice::new(volume))
    }

    #[test]
    fn test_errno_interface() -> anyhow::Result<()> {
        let dev = formatted()?;
        let size = dev.page_size();
        assert_eq!(dev.logical_pages(), 1024);

        let data = vec![0x3C; 2 * size];
        assert_eq!(dev.ftl_write(10, 2, &data), 0);
        assert!(dev.ftl_sync());

        let mut out = vec![0; 2 * size];
        assert_eq!(dev.ftl_read(10, 2, &mut out), 0);
        assert_eq!(out, data);

        assert_eq!(dev.ftl_read(10, -1, &mut out), -22);
        assert_eq!(dev.ftl_write(1023, 2, &data), -22);
        assert_eq!(dev.ftl_read(0, 3, &mut out), -22);
        assert_eq!(dev.stats()?.pages_written, 2);
        Ok(())
    }

    #[test]
    fn test_setup_unformatted() -> anyhow::Result<()> {
        let nand = nand_device(SimNand::new(TEST_LAYOUT))?;
        let result = TestDevice::ftl_setup(nand, FtlConfig::default());
        assert_eq!(result.err(), Some(-19));
        Ok(())
    }

    #[test]
    fn test_shared_between_threads() -> anyhow::Result<()> {
        let dev = formatted()?;
        let size = dev.page_size();

        thread::scope(|s| {
            for t in 0..4u8 {
                let dev = &dev;
                s.spawn(move || {
                    for i in 0..8u32 {
                        let lpn = u32::from(t) * 100 + i;
                        let page = vec![t ^ i as u8; size];
                        assert_eq!(dev.ftl_write(lpn, 1, &page), 0);
                    }
                });
            }
        });
        assert!(dev.ftl_sync());

        let volume = dev.into_inner()?;
        let dev = FtlDevice::setup(nand_device(volume.into_chip())?, FtlConfig::default())?;
        let mut out = vec![0; size];
        for t in 0..4u8 {
            for i in 0..8u32 {
                dev.read(u32::from(t) * 100 + i, 1, &mut out)?;
                assert!(out.iter().all(|&x| x == t ^ i as u8));
            }
        }
        Ok(())
    }
}
