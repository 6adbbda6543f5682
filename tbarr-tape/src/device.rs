//! The `TapeDevice` capability (§4.1): block-aligned I/O, positioning,
//! file marks, and label/TOC persistence over a sequential-access device.

use tbarr_types::{DriveStatus, TapeBackArrError};

use crate::label::TapeLabel;
use crate::toc::Toc;

/// A typed interface over a sequential-access tape device. All blocking
/// operations are bounded by the 30s watchdog (§4.1); implementations
/// must use [`crate::watchdog::with_watchdog`] rather than calling the
/// underlying ioctl/read/write directly.
pub trait TapeDevice: Send {
    /// Authoritative current position and media state. Never cached.
    fn status(&mut self) -> Result<DriveStatus, TapeBackArrError>;

    fn rewind(&mut self) -> Result<(), TapeBackArrError>;

    /// Eject the media. Invalidates any cached label for this device.
    fn eject(&mut self) -> Result<(), TapeBackArrError>;

    /// Load media into the drive. Invalidates any cached label.
    fn load(&mut self) -> Result<(), TapeBackArrError>;

    fn retension(&mut self) -> Result<(), TapeBackArrError>;

    fn write_file_mark(&mut self) -> Result<(), TapeBackArrError>;

    fn seek_to_file(&mut self, file_number: u64) -> Result<(), TapeBackArrError>;

    fn seek_to_block(&mut self, block_number: u64) -> Result<(), TapeBackArrError>;

    fn set_block_size(&mut self, size: u32) -> Result<(), TapeBackArrError>;

    /// Writes one block of at most the configured block size. Returns
    /// `MediaFull` (with file/block number reached) on EOT rather than a
    /// partial-write count, so the Spanning Coordinator can compute the
    /// exact transition point.
    fn write_block(&mut self, data: &[u8]) -> Result<(), TapeBackArrError>;

    /// Reads one block into `buf`, returning the number of bytes read.
    /// Returns `Ok(0)` at a file mark (EOF); the caller distinguishes
    /// "file mark" from "end of data" via `status()`.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize, TapeBackArrError>;

    /// Rewinds, switches to variable block size, reads exactly one
    /// 512-byte block at file #0, restores the configured block size.
    /// `bypass_cache` forces a fresh read even if a cached label exists.
    fn read_label(&mut self, bypass_cache: bool) -> Result<Option<TapeLabel>, TapeBackArrError>;

    /// Rewind, switch to variable block size, write the label block,
    /// restore block size, write a file mark. Invalidates the label cache.
    fn write_label(&mut self, label: &TapeLabel) -> Result<(), TapeBackArrError>;

    /// Writes `toc` as the final data file: zero-padded JSON, terminated
    /// by a file mark.
    fn write_toc(&mut self, toc: &Toc) -> Result<(), TapeBackArrError>;

    /// Seeks past the label and any data files to the TOC and parses it.
    fn read_toc(&mut self) -> Result<Toc, TapeBackArrError>;

    /// Seeks past the label and lists up to `max_entries` tar entry names
    /// from the data stream, for inspection only.
    fn list_contents(&mut self, max_entries: usize) -> Result<Vec<String>, TapeBackArrError>;
}
