//! A flash translation stack for raw NAND: the [ftl] maps logical pages onto the [vfl]'s virtual
//! blocks, which stripe across the banks of a [nand] device.

pub mod config;
pub mod device;
pub mod error;
pub mod ftl;
pub mod nand;
pub mod util;
pub mod vfl;

pub use config::FtlConfig;
pub use device::FtlDevice;
pub use error::{Error, NandError};
pub use ftl::FtlVolume;
