//! A command-line front end to the FTL, operating on a simulated NAND image file.
//!
//! Each invocation loads the image, brings the stack up, runs one command and (with
//! `--write-back`) saves the image again, so a sequence of invocations behaves like a device
//! that is power-cycled between commands.

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use nand_ftl::{
    config::FtlConfig,
    device::FtlDevice,
    ftl::FtlVolume,
    nand::{NandDevice, NandLayout, SimNand, SystemClock},
    util::ReadExt,
    vfl::Vfl,
};

#[derive(Args, Debug)]
struct NandOptions {
    /// Path to the NAND image to use; a missing image starts out erased
    #[clap(long)]
    image: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BANKSxBLOCKSxPAGESxBYTESxSPARE
    #[clap(long, default_value = "2x128x64x2048x64")]
    layout: NandLayout,

    /// Write back the NAND image when done
    #[clap(long, requires = "image")]
    write_back: bool,
}

impl NandOptions {
    fn open(&self) -> Result<SimNand> {
        let mut sim = SimNand::new(self.layout);

        if let Some(path) = self.image.as_ref().filter(|path| path.exists()) {
            let rpt = howudoin::new().label("Loading NAND image");
            sim.load(&mut File::open(path)?)
                .with_context(|| format!("{} does not match the layout", path.display()))?;
            rpt.close();
        }

        Ok(sim)
    }

    fn cleanup(&self, sim: SimNand) -> Result<()> {
        if self.write_back {
            if let Some(path) = &self.image {
                sim.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

#[derive(Args, Debug)]
struct FtlOptions {
    /// Erase-count gap that triggers a wear-levelling swap
    #[clap(long, default_value_t = 5)]
    wear_level_threshold: u16,

    /// Relocate map blocks after this many page reads
    #[clap(long)]
    read_refresh_threshold: Option<u16>,

    /// Free blocks to try before a merge gives up
    #[clap(long, default_value_t = 4)]
    block_retries: usize,
}

impl From<&FtlOptions> for FtlConfig {
    fn from(value: &FtlOptions) -> Self {
        FtlConfig {
            wear_level_threshold: value.wear_level_threshold,
            read_refresh_threshold: value.read_refresh_threshold,
            block_retries: value.block_retries,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Erase the whole NAND and lay down an empty VFL and FTL
    Format,

    /// Print the geometry, the FTL context summary and the statistics
    Info,

    /// Copy logical pages out of the FTL
    Read {
        /// First logical page
        lpn: u32,

        /// Number of pages
        #[clap(long, default_value_t = 1)]
        count: u32,

        /// Where to put the data (stdout if omitted)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Write a file into the FTL, padded with 0xFF to a whole number of pages
    Write {
        /// First logical page
        lpn: u32,

        /// The file to write
        input: PathBuf,

        /// Checkpoint the context afterwards
        #[clap(long)]
        sync: bool,
    },

    /// Checkpoint the FTL context, restoring it first if needed
    Sync,

    /// Ignore any checkpoint: rebuild the context from a full scan, then checkpoint it
    Restore,
}

type SimDevice = NandDevice<SimNand, SystemClock>;

impl Command {
    fn execute(self, nand: SimDevice, config: FtlConfig) -> Result<SimNand> {
        let sim = match self {
            Command::Format => {
                let mut ftl = FtlVolume::init(Vfl::new(nand), config)?;
                ftl.format()?;
                println!(
                    "Formatted: {} logical pages of {} bytes",
                    ftl.logical_pages(),
                    ftl.geometry().bytes_per_page
                );
                ftl.into_chip()
            }

            Command::Info => {
                let ftl = FtlVolume::setup(nand, config)?;
                print_info(&ftl);
                ftl.into_chip()
            }

            Command::Read { lpn, count, output } => {
                let dev = FtlDevice::setup(nand, config)?;
                let mut buf = vec![0; count as usize * dev.page_size()];
                dev.read(lpn, count, &mut buf)?;

                match output {
                    Some(path) => fs::write(path, &buf)?,
                    None => io::stdout().write_all(&buf)?,
                }
                dev.into_inner()?.into_chip()
            }

            Command::Write { lpn, input, sync } => {
                let dev = FtlDevice::setup(nand, config)?;
                let buf = File::open(&input)?.read_pages(dev.page_size())?;
                ensure!(!buf.is_empty(), "{} is empty", input.display());

                let count = buf.len() / dev.page_size();
                dev.write(lpn, count as u32, &buf)?;
                if sync {
                    dev.sync()?;
                }

                println!("Wrote {count} pages at logical page {lpn}");
                dev.into_inner()?.into_chip()
            }

            Command::Sync => {
                let mut ftl = FtlVolume::setup(nand, config)?;
                ftl.sync()?;
                ftl.into_chip()
            }

            Command::Restore => {
                let mut vfl = Vfl::new(nand);
                vfl.verify()?;
                vfl.open()?;

                let mut ftl = FtlVolume::init(vfl, config)?;
                ftl.rebuild()?;
                ftl.sync()?;
                print_info(&ftl);
                ftl.into_chip()
            }
        };

        Ok(sim)
    }
}

fn print_info(ftl: &FtlVolume<SimNand, SystemClock>) {
    let geometry = ftl.geometry();
    println!("Layout:         {:?}", geometry.layout());
    println!("Superblock:     {} pages", geometry.pages_per_sublk);
    println!("Virtual blocks: {}", geometry.user_sublks_total);
    println!("Logical pages:  {}", ftl.logical_pages());

    for bank in 0..geometry.banks {
        if let Some(cxt) = ftl.vfl().context(bank) {
            println!(
                "Bank {bank}: {}/{} reserved blocks used, {} write and {} erase failures",
                cxt.num_reserved, cxt.total_reserved, cxt.write_fail_count, cxt.erase_fail_count
            );
        }
    }

    let cxt = ftl.context();
    let erase_counts = cxt.erase_counters.iter().copied();
    let (min, max) = erase_counts.fold((u16::MAX, 0), |(min, max), ec| (min.min(ec), max.max(ec)));
    println!("Control blocks: {:?}", cxt.ctrl_blocks);
    println!("Active logs:    {}", cxt.active_logs());
    println!("Free pool:      {:?}", cxt.free_pool);
    println!("Erase counts:   {min}..={max}");
    println!("Next USN:       {}", cxt.next_usn);
    println!("{:#?}", cxt.stats);
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND image to use
    #[clap(flatten)]
    nand: NandOptions,

    /// FTL tunables
    #[clap(flatten)]
    ftl: FtlOptions,

    /// More log output (repeat for more); RUST_LOG overrides
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new().with_level(level).env().init()?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let config = FtlConfig::from(&args.ftl);
    let sim = args.nand.open()?;
    let nand = NandDevice::new(sim, SystemClock::default(), config.timeouts)?;

    let sim = args.cmd.execute(nand, config)?;
    args.nand.cleanup(sim)?;
    Ok(())
}
