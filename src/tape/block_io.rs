//! Adapts [`tbarr_tape::TapeDevice`]'s block-oriented `write_block`/
//! `read_block` to `std::io::Write`/`Read`, so `tbarr_codec`'s archive
//! writer and reader can stream straight onto tape without knowing
//! anything about ioctls or file marks.

use std::io::{self, Read, Write};

use tbarr_types::TapeBackArrError;

use super::drives::DriveSlot;

/// Boxes a [`TapeBackArrError`] into an `io::Error` so it survives a
/// round trip through the `Write`/`Read` traits. Callers that need the
/// original kind back (the Spanning Coordinator watching for
/// `MediaFull`) use [`tape_error_from_io`].
fn io_error(err: TapeBackArrError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Recovers a [`TapeBackArrError`] from an `io::Error` produced by
/// [`io_error`], if that's what it actually wraps.
pub fn tape_error_from_io(err: &io::Error) -> Option<&TapeBackArrError> {
    err.get_ref().and_then(|e| e.downcast_ref::<TapeBackArrError>())
}

/// Writes into whatever device is currently loaded in a [`DriveSlot`],
/// one `write_block` call per `write`. Callers should buffer upstream
/// (the codec layer's 64 KiB blocks already do this) rather than issuing
/// many tiny writes.
///
/// A `MediaFull` from the device is not simply surfaced: if a spanning
/// callback was supplied via [`TapeBlockWriter::with_spanning`], it runs
/// right here, still inside the one exclusive `&mut DriveSlot` borrow,
/// finalizes the old tape, loads a successor, and retries the write. This
/// is what lets a single `ArchiveWriter`/encryption stream ride across a
/// tape boundary without restarting -- restarting it would mean a second
/// AES-GCM stream reusing the set's fixed nonce, which is a nonce-reuse
/// bug, not just an inconvenience.
pub struct TapeBlockWriter<'a> {
    slot: &'a mut DriveSlot,
    on_media_full: Option<Box<dyn FnMut(&mut DriveSlot) -> Result<(), TapeBackArrError> + 'a>>,
}

impl<'a> TapeBlockWriter<'a> {
    pub fn new(slot: &'a mut DriveSlot) -> Self {
        Self { slot, on_media_full: None }
    }

    pub fn with_spanning(
        slot: &'a mut DriveSlot,
        on_media_full: impl FnMut(&mut DriveSlot) -> Result<(), TapeBackArrError> + 'a,
    ) -> Self {
        Self { slot, on_media_full: Some(Box::new(on_media_full)) }
    }

    /// Recovers the underlying slot once the codec chain built on top of
    /// this writer is finished with it, so the pipeline can keep issuing
    /// direct `TapeDevice` calls (file marks, the TOC) on the same drive.
    pub fn into_slot(self) -> &'a mut DriveSlot {
        self.slot
    }
}

impl Write for TapeBlockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.slot.device_mut().write_block(buf) {
            Ok(()) => Ok(buf.len()),
            Err(TapeBackArrError::MediaFull { file_number, block_number }) => {
                let Some(cb) = self.on_media_full.as_mut() else {
                    return Err(io_error(TapeBackArrError::MediaFull { file_number, block_number }));
                };
                cb(self.slot).map_err(io_error)?;
                self.slot.device_mut().write_block(buf).map_err(io_error)?;
                Ok(buf.len())
            }
            Err(e) => Err(io_error(e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads from whatever device is currently loaded in a [`DriveSlot`]. A
/// `read_block` returning `Ok(0)` means a file mark was hit.
///
/// Within one tape, the Backup Pipeline never interrupts a set's archive
/// stream with a file mark -- only at the very end, once the tape is full
/// or the set is done. So a bare `TapeBlockReader` treats that `Ok(0)` as
/// ordinary EOF, which is exactly right for a single-tape restore. A
/// spanning restore supplies `with_spanning`: on `Ok(0)` the callback loads
/// the plan's next tape and reports whether there is more data to read, so
/// the single `ArchiveReader`/decryption stream built on top never has to
/// restart either.
pub struct TapeBlockReader<'a> {
    slot: &'a mut DriveSlot,
    on_file_mark: Option<Box<dyn FnMut(&mut DriveSlot) -> Result<bool, TapeBackArrError> + 'a>>,
}

impl<'a> TapeBlockReader<'a> {
    pub fn new(slot: &'a mut DriveSlot) -> Self {
        Self { slot, on_file_mark: None }
    }

    pub fn with_spanning(
        slot: &'a mut DriveSlot,
        on_file_mark: impl FnMut(&mut DriveSlot) -> Result<bool, TapeBackArrError> + 'a,
    ) -> Self {
        Self { slot, on_file_mark: Some(Box::new(on_file_mark)) }
    }

    pub fn into_slot(self) -> &'a mut DriveSlot {
        self.slot
    }
}

impl Read for TapeBlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.slot.device_mut().read_block(buf).map_err(io_error)?;
            if n > 0 {
                return Ok(n);
            }
            let Some(cb) = self.on_file_mark.as_mut() else {
                return Ok(0);
            };
            if !cb(self.slot).map_err(io_error)? {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tbarr_tape::{TapeDevice, VirtualTapeDevice};

    #[test]
    fn write_without_spanning_surfaces_media_full_as_an_io_error() {
        let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(64)));
        let mut writer = TapeBlockWriter::new(&mut slot);
        let big = vec![0u8; 128];
        let err = writer.write(&big).unwrap_err();
        assert!(tape_error_from_io(&err).is_some());
    }

    #[test]
    fn write_with_spanning_swaps_the_device_and_retries() {
        let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(64)));
        let mut swapped = false;
        {
            let mut writer = TapeBlockWriter::with_spanning(&mut slot, |slot| {
                swapped = true;
                slot.swap(Box::new(VirtualTapeDevice::new(4096)));
                Ok(())
            });
            let payload = vec![7u8; 128];
            writer.write_all(&payload).unwrap();
        }
        assert!(swapped);
        assert_eq!(slot.device_mut().status().unwrap().file_number, 0);
    }

    #[test]
    fn read_without_spanning_treats_a_file_mark_as_plain_eof() {
        let mut device = VirtualTapeDevice::new(4096);
        device.write_block(b"hello").unwrap();
        device.write_file_mark().unwrap();
        device.rewind().unwrap();
        let mut slot = DriveSlot::new(Box::new(device));

        let mut reader = TapeBlockReader::new(&mut slot);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_with_spanning_keeps_reading_across_a_loaded_successor() {
        let mut first = VirtualTapeDevice::new(4096);
        first.write_block(b"first").unwrap();
        first.write_file_mark().unwrap();
        first.rewind().unwrap();
        let mut slot = DriveSlot::new(Box::new(first));

        let mut handed_off = false;
        let mut reader = TapeBlockReader::with_spanning(&mut slot, move |slot| {
            if handed_off {
                return Ok(false);
            }
            handed_off = true;
            let mut second = VirtualTapeDevice::new(4096);
            second.write_block(b"second").unwrap();
            second.write_file_mark().unwrap();
            second.rewind().unwrap();
            slot.swap(Box::new(second));
            Ok(true)
        });

        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"firstsecond");
    }
}
