#![forbid(unsafe_code)]
//! Identifiers, error type and checksums shared by every layer of the crate.

use std::fmt;

pub mod checksum;

pub use checksum::{redo_crc32, verify_redo_crc32};

/// Sentinel page number marking an empty slot or a null list address.
pub const FIL_NULL: u32 = u32::MAX;

/// Tablespace identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Page number within a tablespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

/// Log sequence number assigned to committed redo groups.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Transaction identifier.
pub type TrxId = u64;
/// Commit serialisation number assigned to update logs entering history.
pub type TrxNo = u64;
/// Per-transaction sequence number of an undo record.
pub type UndoNo = u64;
/// Table identifier recorded for dictionary operations.
pub type TableId = u64;

impl PageNo {
    /// The null page number.
    pub const NULL: PageNo = PageNo(FIL_NULL);

    /// Returns true for [`PageNo::NULL`].
    pub const fn is_null(self) -> bool {
        self.0 == FIL_NULL
    }

    /// Returns the following page number.
    pub const fn next(self) -> PageNo {
        PageNo(self.0.wrapping_add(1))
    }
}

/// Fully qualified page identity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageAddr {
    /// Owning tablespace.
    pub space: SpaceId,
    /// Page within the tablespace.
    pub page_no: PageNo,
}

impl PageAddr {
    /// Builds a page address.
    pub const fn new(space: SpaceId, page_no: PageNo) -> Self {
        Self { space, page_no }
    }
}

/// In-file address of a list node: a page and a byte offset inside it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FilAddr {
    /// Page holding the node, [`PageNo::NULL`] for the null address.
    pub page_no: PageNo,
    /// Byte offset of the node within the page.
    pub boffset: u16,
}

impl FilAddr {
    /// The null address.
    pub const NULL: FilAddr = FilAddr {
        page_no: PageNo::NULL,
        boffset: 0,
    };

    /// Builds an address.
    pub const fn new(page_no: PageNo, boffset: u16) -> Self {
        Self { page_no, boffset }
    }

    /// Returns true when the address points nowhere.
    pub const fn is_null(self) -> bool {
        self.page_no.is_null()
    }
}

/// Errors surfaced by undo segment management.
#[derive(thiserror::Error, Debug)]
pub enum UndoError {
    /// Every slot of the rollback segment is in use.
    #[error("too many concurrent transactions: no free undo slot")]
    TooManyConcurrentTransactions,
    /// The tablespace or the rollback segment size cap is exhausted.
    #[error("out of file space")]
    OutOfFileSpace,
    /// The in-memory handle could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// Durable state failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller supplied an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be parsed or validated.
    #[error("config: {0}")]
    Config(String),
    /// Underlying IO failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UndoError>;

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.page_no)
    }
}

impl From<u32> for PageNo {
    fn from(value: u32) -> Self {
        PageNo(value)
    }
}

impl From<PageNo> for u32 {
    fn from(value: PageNo) -> Self {
        value.0
    }
}
