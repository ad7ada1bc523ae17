//! Error types shared by the NAND, VFL and FTL layers.

use thiserror::Error;

use crate::nand::Phase;

/// Outcome of a failed physical page/block operation
///
/// `EmptyBlock` is not really a failure: it reports a page whose spare area is still erased, and
/// callers that scan flash depend on it being distinct from `Ecc`.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum NandError {
    #[error("page is erased")]
    EmptyBlock,

    #[error("uncorrectable ECC error")]
    Ecc,

    #[error("timed out waiting for {0:?}")]
    Timeout(Phase),

    #[error("device reported an I/O failure")]
    Io,

    #[error("invalid bank, page or buffer")]
    InvalidArgs,
}

/// Errors surfaced by the VFL and FTL
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Nand(#[from] NandError),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A structural invariant does not hold; continuing would risk silent corruption
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Every page was read, but at least one failed its ECC check
    #[error("data read with ECC errors")]
    EccDegraded,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

const EIO: i32 = 5;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const EBADMSG: i32 = 74;
const EUCLEAN: i32 = 117;

impl Error {
    /// The negative errno reported to block-device consumers
    pub fn errno(&self) -> i32 {
        -match self {
            Error::Nand(NandError::InvalidArgs) | Error::InvalidArgs(_) => EINVAL,
            Error::Nand(NandError::Ecc) | Error::EccDegraded => EBADMSG,
            Error::Nand(_) => EIO,
            Error::Inconsistent(_) => EUCLEAN,
            Error::NotFound(_) => ENODEV,
        }
    }

    /// Should the VFL reset the bank and try this read again?
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Nand(NandError::Ecc | NandError::Io | NandError::Timeout(_))
        )
    }
}

#[test]
fn test_errno() {
    assert_eq!(Error::InvalidArgs("lpn".into()).errno(), -22);
    assert_eq!(Error::Nand(NandError::InvalidArgs).errno(), -22);
    assert_eq!(Error::Nand(NandError::Timeout(Phase::BankReady)).errno(), -5);
    assert_eq!(Error::Nand(NandError::EmptyBlock).errno(), -5);
    assert_eq!(Error::EccDegraded.errno(), -74);
    assert_eq!(Error::Inconsistent("pool".into()).errno(), -117);
}
