//! Core identifiers, the crate-wide error type, and the shared on-disk page
//! header used by every pager component.

use std::fmt;

pub mod checksum;

pub use checksum::page_crc32;

/// Identifier of a fixed-size page in the backing store.
///
/// Page 0 and 1 hold the double-buffered environment metadata; data pages
/// start at 2. `PageId(0)` doubles as the null reference for tree roots and
/// chain pointers, which is unambiguous because no tree structure may ever
/// point at a metadata page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl PageId {
    /// The null page reference.
    pub const NULL: PageId = PageId(0);

    /// Returns `true` when this is the null reference.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Monotonically increasing number of a committed write transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl TxId {
    /// Returns the transaction number following this one.
    pub const fn next(self) -> TxId {
        TxId(self.0 + 1)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum VellumError {
    /// An I/O error from the backing store or journal.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state failed validation. Fatal to the environment: no page
    /// that cannot be validated is ever trusted or repaired.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller error: bad configuration, oversized key, unknown tree handle.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The storage capacity limit was reached. Aborts the current write
    /// transaction; the caller may retry after freeing space.
    #[error("capacity exhausted: {0}")]
    Capacity(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VellumError>;

pub mod page {
    //! Shared on-disk page header.
    //!
    //! Every page starts with the same 32-byte header: magic, format version,
    //! page kind, page size, the page's own number, the database salt and a
    //! CRC32 over the whole page image (with the CRC field zeroed). Mixing
    //! the page number and salt into the checksum catches misdirected writes
    //! and images copied between databases.

    use std::convert::{TryFrom, TryInto};

    use super::{PageId, Result, VellumError};

    /// Magic bytes identifying a vellum page.
    pub const PAGE_MAGIC: [u8; 4] = *b"VELM";
    /// On-disk format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 4096;
    /// Largest supported page size (in-page offsets are 16-bit).
    pub const MAX_PAGE_SIZE: u32 = 65536;
    /// Length of the fixed page header in bytes.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for the fixed header fields.
        use std::ops::Range;

        /// Magic bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version, `u16`.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// Page kind byte.
        pub const PAGE_KIND: usize = 6;
        /// Reserved byte, must be zero.
        pub const RESERVED: usize = 7;
        /// Page size, `u32`.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// The page's own number, `u64`.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// Per-database checksum salt, `u64`.
        pub const SALT: Range<usize> = 20..28;
        /// CRC32 over the page image with this field zeroed, `u32`.
        pub const CRC32: Range<usize> = 28..32;
    }

    /// The role of a page, recorded in its header.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Environment metadata record (pages 0 and 1).
        Meta = 1,
        /// A link in the persisted free-list chain.
        FreeList = 2,
        /// B-tree leaf holding entries.
        BTreeLeaf = 3,
        /// B-tree branch holding separators and child pointers.
        BTreeBranch = 4,
        /// A link in an overflow chain holding large-value bytes.
        Overflow = 5,
    }

    impl PageKind {
        /// Returns the header byte for this kind.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = VellumError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::BTreeLeaf),
                4 => Ok(PageKind::BTreeBranch),
                5 => Ok(PageKind::Overflow),
                _ => Err(VellumError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded form of the fixed page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// On-disk format version.
        pub format_version: u16,
        /// Role of the page.
        pub kind: PageKind,
        /// Page size the database was created with.
        pub page_size: u32,
        /// The page's own number.
        pub page_no: PageId,
        /// Per-database checksum salt.
        pub salt: u64,
        /// CRC32 over the page image with this field zeroed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Builds a header for a fresh page image with a zero checksum.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(VellumError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                salt,
                crc32: 0,
            })
        }

        /// Returns the header with its checksum field set.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Encodes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(VellumError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::SALT].copy_from_slice(&self.salt.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Decodes and validates a header from the start of `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(VellumError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            let magic: [u8; 4] = hdr[header::MAGIC].try_into().unwrap();
            if magic != PAGE_MAGIC {
                return Err(VellumError::Corruption("invalid page magic"));
            }
            let format_version = u16::from_be_bytes(hdr[header::FORMAT_VERSION].try_into().unwrap());
            if format_version != PAGE_FORMAT_VERSION {
                return Err(VellumError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(VellumError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_be_bytes(hdr[header::PAGE_SIZE].try_into().unwrap());
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(VellumError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u64::from_be_bytes(hdr[header::PAGE_NO].try_into().unwrap()));
            let salt = u64::from_be_bytes(hdr[header::SALT].try_into().unwrap());
            let crc32 = u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap());
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                salt,
                crc32,
            })
        }
    }

    /// Zeroes the checksum field so a page image can be (re)checksummed.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(VellumError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Checksums a finished page image in place: clears the CRC field,
    /// computes the checksum and writes it back.
    pub fn seal(buf: &mut [u8], page_no: PageId, salt: u64) -> Result<()> {
        clear_crc32(buf)?;
        let crc = super::page_crc32(page_no.0, salt, buf);
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Validates a full page image: header fields, expected page number and
    /// the checksum. Returns the decoded header on success.
    pub fn verify(buf: &[u8], expect_no: PageId, page_size: u32, salt: u64) -> Result<PageHeader> {
        let header = PageHeader::decode(buf)?;
        if header.page_no != expect_no {
            return Err(VellumError::Corruption("page number mismatch"));
        }
        if header.page_size != page_size {
            return Err(VellumError::Corruption("page size mismatch"));
        }
        if header.salt != salt {
            return Err(VellumError::Corruption("page salt mismatch"));
        }
        if buf.len() < page_size as usize {
            return Err(VellumError::Corruption("page image truncated"));
        }
        let mut scratch = buf[..page_size as usize].to_vec();
        clear_crc32(&mut scratch)?;
        let crc = super::page_crc32(expect_no.0, salt, &scratch);
        if crc != header.crc32 {
            return Err(VellumError::Corruption("page checksum mismatch"));
        }
        Ok(header)
    }
}
