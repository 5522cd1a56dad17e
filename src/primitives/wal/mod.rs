//! Write-ahead journal.
//!
//! The journal is an append-only sequence of frames, each a fixed header
//! plus one page-size payload. A transaction's commit record is the run of
//! page frames carrying its dirty-page images, terminated by a commit frame
//! whose payload is the transaction's metadata page image. Every record is
//! therefore self-describing: transaction number, page deltas, final
//! metadata.
//!
//! Replay walks frames in order and applies a transaction only when its
//! commit frame is present and valid; a torn or unflushed tail is
//! indistinguishable from a crash before the journal flush and is treated
//! as a rollback. Applying page images and adopting the final metadata are
//! both absorbing operations, so replaying a record twice is harmless.

use std::collections::HashMap;
use std::convert::TryInto;

use tracing::warn;

use crate::primitives::io::FileIo;
use crate::primitives::pager::{read_meta_page, Meta};
use crate::types::{page_crc32, PageId, Result, TxId, VellumError};

const WAL_MAGIC: &[u8; 8] = b"VELMWAL\0";
const WAL_VERSION_MAJOR: u16 = 1;
const WAL_VERSION_MINOR: u16 = 0;
/// Size of the journal file header in bytes.
pub const WAL_HEADER_SIZE: usize = 32;
/// Size of each frame header in bytes.
pub const WAL_FRAME_HEADER_SIZE: usize = 32;

const FRAME_FLAG_COMMIT: u32 = 0x1;

/// Outcome of a journal replay pass.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    /// Number of page images handed to the apply callback.
    pub frames_applied: u32,
    /// Number of committed transactions replayed.
    pub transactions: u32,
    /// Metadata carried by the last committed record, if any.
    pub meta: Option<Meta>,
}

/// Append-only journal of committed transaction records.
pub struct Wal {
    io: Box<dyn FileIo>,
    page_size: usize,
    next_frame_number: u32,
    append_offset: u64,
    sync_enabled: bool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("page_size", &self.page_size)
            .field("next_frame_number", &self.next_frame_number)
            .field("append_offset", &self.append_offset)
            .field("sync_enabled", &self.sync_enabled)
            .finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens or creates a journal over `io` for the given page size.
    pub fn open(io: Box<dyn FileIo>, page_size: u32, sync_enabled: bool) -> Result<Self> {
        let mut wal = Self {
            io,
            page_size: page_size as usize,
            next_frame_number: 1,
            append_offset: WAL_HEADER_SIZE as u64,
            sync_enabled,
        };
        // A journal shorter than its header cannot hold a committed frame;
        // a torn header write is indistinguishable from a fresh file.
        if wal.io.len()? < WAL_HEADER_SIZE as u64 {
            wal.write_header()?;
        } else {
            wal.validate_header()?;
            let (frames, offset) = wal.scan_valid_frames()?;
            wal.next_frame_number = frames + 1;
            wal.append_offset = offset;
        }
        Ok(wal)
    }

    /// Appends a dirty-page image frame for `txid`.
    pub fn append_page_frame(&mut self, page_id: PageId, txid: TxId, image: &[u8]) -> Result<()> {
        self.append_frame(page_id, txid, 0, image)
    }

    /// Appends the commit frame for `txid`: the metadata page image destined
    /// for `slot`, flagged so replay knows the record is complete.
    pub fn append_commit_frame(&mut self, slot: PageId, txid: TxId, image: &[u8]) -> Result<()> {
        self.append_frame(slot, txid, FRAME_FLAG_COMMIT, image)
    }

    fn append_frame(&mut self, page_id: PageId, txid: TxId, flags: u32, image: &[u8]) -> Result<()> {
        if image.len() != self.page_size {
            return Err(VellumError::Invalid(
                "journal frame size does not match page size",
            ));
        }
        let mut header = [0u8; WAL_FRAME_HEADER_SIZE];
        header[0..8].copy_from_slice(&page_id.0.to_be_bytes());
        header[8..12].copy_from_slice(&self.next_frame_number.to_be_bytes());
        header[12..16].copy_from_slice(&frame_checksum(self.next_frame_number, image).to_be_bytes());
        header[16..24].copy_from_slice(&txid.0.to_be_bytes());
        header[24..28].copy_from_slice(&flags.to_be_bytes());

        self.io.write_at(self.append_offset, &header)?;
        self.io
            .write_at(self.append_offset + WAL_FRAME_HEADER_SIZE as u64, image)?;
        self.append_offset += (WAL_FRAME_HEADER_SIZE + self.page_size) as u64;
        self.next_frame_number = self
            .next_frame_number
            .checked_add(1)
            .ok_or(VellumError::Corruption("journal frame number overflow"))?;
        Ok(())
    }

    /// Forces appended frames durable. This is the commit point: a record
    /// whose commit frame reached stable storage survives any crash.
    pub fn sync(&mut self) -> Result<()> {
        if self.sync_enabled {
            self.io.sync_all()?;
        }
        Ok(())
    }

    /// Truncates the journal back to its header. Only call once every
    /// journaled page image is durably applied to the page store.
    pub fn reset(&mut self) -> Result<()> {
        self.io.truncate(WAL_HEADER_SIZE as u64)?;
        self.next_frame_number = 1;
        self.append_offset = WAL_HEADER_SIZE as u64;
        self.io.sync_all()?;
        Ok(())
    }

    /// Current journal size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.io.len()
    }

    /// Replays committed records in order, handing each page image (the
    /// commit frame's metadata image included) to `apply`. Safe to run any
    /// number of times; an invalid tail ends the scan silently because it is
    /// exactly what a crash before the journal flush leaves behind.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<ReplaySummary>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut summary = ReplaySummary::default();
        let mut pending: HashMap<u64, Vec<(PageId, Vec<u8>)>> = HashMap::new();
        let mut offset = WAL_HEADER_SIZE as u64;
        let mut expected_frame = 1u32;
        let len = self.io.len()?;

        loop {
            let Some(frame) = self.read_frame(offset, len, expected_frame)? else {
                break;
            };
            offset += (WAL_FRAME_HEADER_SIZE + self.page_size) as u64;
            expected_frame += 1;

            if frame.flags & FRAME_FLAG_COMMIT != 0 {
                let meta = match read_meta_page(&frame.payload, frame.page_id) {
                    Ok(meta) => meta,
                    Err(_) => {
                        warn!(txid = frame.txid, "journal commit frame carries invalid metadata; stopping replay");
                        break;
                    }
                };
                for (page_id, image) in pending.remove(&frame.txid).unwrap_or_default() {
                    apply(page_id, &image)?;
                    summary.frames_applied += 1;
                }
                apply(frame.page_id, &frame.payload)?;
                summary.frames_applied += 1;
                summary.transactions += 1;
                summary.meta = Some(meta);
            } else {
                pending
                    .entry(frame.txid)
                    .or_default()
                    .push((frame.page_id, frame.payload));
            }
        }

        Ok(summary)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[..WAL_MAGIC.len()].copy_from_slice(WAL_MAGIC);
        header[8..10].copy_from_slice(&WAL_VERSION_MAJOR.to_be_bytes());
        header[10..12].copy_from_slice(&WAL_VERSION_MINOR.to_be_bytes());
        header[12..16].copy_from_slice(&(self.page_size as u32).to_be_bytes());
        self.io.write_at(0, &header)?;
        self.io.sync_all()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        self.io.read_at(0, &mut header)?;
        if &header[..WAL_MAGIC.len()] != WAL_MAGIC {
            return Err(VellumError::Corruption("invalid journal magic"));
        }
        let major = u16::from_be_bytes(header[8..10].try_into().unwrap());
        let minor = u16::from_be_bytes(header[10..12].try_into().unwrap());
        if major != WAL_VERSION_MAJOR || minor != WAL_VERSION_MINOR {
            return Err(VellumError::Corruption("unsupported journal version"));
        }
        let stored_page_size = u32::from_be_bytes(header[12..16].try_into().unwrap());
        if stored_page_size as usize != self.page_size {
            return Err(VellumError::Corruption(
                "journal page size differs from database",
            ));
        }
        Ok(())
    }

    /// Scans forward over valid frames, returning their count and the file
    /// offset where appending should continue.
    fn scan_valid_frames(&mut self) -> Result<(u32, u64)> {
        let len = self.io.len()?;
        let mut offset = WAL_HEADER_SIZE as u64;
        let mut expected_frame = 1u32;
        loop {
            match self.read_frame(offset, len, expected_frame)? {
                Some(_) => {
                    offset += (WAL_FRAME_HEADER_SIZE + self.page_size) as u64;
                    expected_frame += 1;
                }
                None => return Ok((expected_frame - 1, offset)),
            }
        }
    }

    /// Reads and validates the frame at `offset`. Returns `None` at the end
    /// of the valid prefix: clean EOF, a torn frame, a checksum mismatch or
    /// a sequence break all end the scan.
    fn read_frame(&mut self, offset: u64, len: u64, expected_frame: u32) -> Result<Option<Frame>> {
        let frame_len = (WAL_FRAME_HEADER_SIZE + self.page_size) as u64;
        if offset + frame_len > len {
            return Ok(None);
        }
        let mut header = [0u8; WAL_FRAME_HEADER_SIZE];
        self.io.read_at(offset, &mut header)?;
        let page_id = PageId(u64::from_be_bytes(header[0..8].try_into().unwrap()));
        let frame_number = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let checksum = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let txid = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let flags = u32::from_be_bytes(header[24..28].try_into().unwrap());
        if frame_number != expected_frame {
            return Ok(None);
        }
        let mut payload = vec![0u8; self.page_size];
        self.io
            .read_at(offset + WAL_FRAME_HEADER_SIZE as u64, &mut payload)?;
        if frame_checksum(frame_number, &payload) != checksum {
            return Ok(None);
        }
        Ok(Some(Frame {
            page_id,
            txid,
            flags,
            payload,
        }))
    }
}

struct Frame {
    page_id: PageId,
    txid: u64,
    flags: u32,
    payload: Vec<u8>,
}

fn frame_checksum(frame_number: u32, payload: &[u8]) -> u32 {
    page_crc32(frame_number as u64, 0, payload)
}
