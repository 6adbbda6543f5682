//! File-backed tape emulation for tests (§4.1 "VirtualTapeDevice"). Models
//! the same "files-on-a-sequential-medium" shape the real drive presents
//! (label at file #0, file marks separating backup-set data, TOC as the
//! final file) without any ioctl or hardware dependency.
//!
//! Note: for test/debug use only.

use std::io;

use tbarr_types::{DriveStatus, TapeBackArrError};

use crate::cache::LabelCache;
use crate::label::TapeLabel;
use crate::toc::Toc;
use crate::device::TapeDevice;

/// One tape file: a sequence of blocks in write order.
type TapeFile = Vec<Vec<u8>>;

/// An in-memory sequential medium. Writes always land at EOM (the position
/// just past the last completed file); reads walk whichever file the
/// current position names. There is no notion of rewriting a file in
/// place -- exactly like a real tape.
pub struct VirtualTapeDevice {
    max_size: usize,
    used: usize,
    block_size: u32,
    files: Vec<TapeFile>,
    write_buffer: TapeFile,
    pos_file: usize,
    pos_block: usize,
    just_hit_filemark: bool,
    loaded: bool,
    write_protected: bool,
    label_cache: LabelCache,
}

impl VirtualTapeDevice {
    /// `max_size` bounds total bytes written before `write_block` starts
    /// returning `MediaFull`, emulating end-of-tape on a real drive.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            used: 0,
            block_size: 65536,
            files: Vec::new(),
            write_buffer: Vec::new(),
            pos_file: 0,
            pos_block: 0,
            just_hit_filemark: false,
            loaded: true,
            write_protected: false,
            label_cache: LabelCache::new(),
        }
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    fn require_loaded(&self) -> Result<(), TapeBackArrError> {
        if self.loaded {
            Ok(())
        } else {
            Err(TapeBackArrError::NoTapeLoaded)
        }
    }

    /// True once positioned past every completed file, i.e. where the next
    /// `write_block` would append a new file.
    fn at_eom(&self) -> bool {
        self.pos_file == self.files.len()
    }
}

impl TapeDevice for VirtualTapeDevice {
    fn status(&mut self) -> Result<DriveStatus, TapeBackArrError> {
        self.require_loaded()?;
        Ok(DriveStatus {
            online: true,
            ready: true,
            write_protected: self.write_protected,
            beginning_of_tape: self.pos_file == 0 && self.pos_block == 0 && self.write_buffer.is_empty(),
            end_of_tape: self.used >= self.max_size,
            end_of_file: self.just_hit_filemark,
            file_number: self.pos_file as u64,
            block_number: self.pos_block as u64,
            density_code: 0,
            block_size: self.block_size,
        })
    }

    fn rewind(&mut self) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        self.pos_file = 0;
        self.pos_block = 0;
        self.just_hit_filemark = false;
        Ok(())
    }

    fn eject(&mut self) -> Result<(), TapeBackArrError> {
        self.loaded = false;
        self.label_cache.invalidate();
        Ok(())
    }

    fn load(&mut self) -> Result<(), TapeBackArrError> {
        self.loaded = true;
        self.label_cache.invalidate();
        Ok(())
    }

    fn retension(&mut self) -> Result<(), TapeBackArrError> {
        self.require_loaded()
    }

    fn write_file_mark(&mut self) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        if !self.at_eom() {
            return Err(TapeBackArrError::InternalError(
                "write_file_mark called while not positioned at EOM".into(),
            ));
        }
        let file = std::mem::take(&mut self.write_buffer);
        self.files.push(file);
        self.pos_file = self.files.len();
        self.pos_block = 0;
        self.just_hit_filemark = false;
        Ok(())
    }

    fn seek_to_file(&mut self, file_number: u64) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        let file_number = file_number as usize;
        if file_number > self.files.len() {
            return Err(TapeBackArrError::InternalError(format!(
                "seek_to_file({}) beyond EOM ({} files written)",
                file_number,
                self.files.len()
            )));
        }
        self.pos_file = file_number;
        self.pos_block = 0;
        self.just_hit_filemark = false;
        Ok(())
    }

    fn seek_to_block(&mut self, block_number: u64) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        self.pos_block = block_number as usize;
        self.just_hit_filemark = false;
        Ok(())
    }

    fn set_block_size(&mut self, size: u32) -> Result<(), TapeBackArrError> {
        self.block_size = size;
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        if self.write_protected {
            return Err(TapeBackArrError::WriteProtected);
        }
        if !self.at_eom() {
            return Err(TapeBackArrError::InternalError(
                "write_block called while not positioned at EOM".into(),
            ));
        }
        if self.used + data.len() > self.max_size {
            return Err(TapeBackArrError::MediaFull {
                file_number: self.files.len() as u64,
                block_number: self.write_buffer.len() as u64,
            });
        }
        self.used += data.len();
        self.write_buffer.push(data.to_vec());
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize, TapeBackArrError> {
        self.require_loaded()?;
        let Some(file) = self.files.get(self.pos_file) else {
            return Ok(0);
        };
        let Some(block) = file.get(self.pos_block) else {
            self.just_hit_filemark = true;
            self.pos_file += 1;
            self.pos_block = 0;
            return Ok(0);
        };
        if block.len() > buf.len() {
            return Err(TapeBackArrError::InternalError(format!(
                "read buffer too small ({} < {})",
                buf.len(),
                block.len()
            )));
        }
        buf[..block.len()].copy_from_slice(block);
        self.pos_block += 1;
        self.just_hit_filemark = false;
        Ok(block.len())
    }

    fn read_label(&mut self, bypass_cache: bool) -> Result<Option<TapeLabel>, TapeBackArrError> {
        self.require_loaded()?;
        if !bypass_cache {
            if let Some(label) = self.label_cache.get() {
                return Ok(Some(label.clone()));
            }
        }
        if self.files.is_empty() {
            return Ok(None);
        }
        let saved_file = self.pos_file;
        let saved_block = self.pos_block;
        self.seek_to_file(0)?;
        let mut buf = vec![0u8; crate::label::LABEL_BLOCK_SIZE];
        let n = self.read_block(&mut buf)?;
        self.pos_file = saved_file;
        self.pos_block = saved_block;
        if n == 0 {
            return Ok(None);
        }
        let label = TapeLabel::from_block(&buf[..n]).map_err(|err| {
            TapeBackArrError::IntegrityError {
                path: "label block 0".into(),
                expected: "well-formed TapeBackArr label".into(),
                actual: err.to_string(),
            }
        })?;
        self.label_cache.set(label.clone());
        Ok(Some(label))
    }

    fn write_label(&mut self, label: &TapeLabel) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        if !self.files.is_empty() || !self.write_buffer.is_empty() {
            return Err(TapeBackArrError::InternalError(
                "write_label requires a blank medium".into(),
            ));
        }
        let block = label.to_block().map_err(|err| TapeBackArrError::InternalError(err.to_string()))?;
        self.write_block(&block)?;
        self.write_file_mark()?;
        self.label_cache.invalidate();
        self.label_cache.set(label.clone());
        Ok(())
    }

    fn write_toc(&mut self, toc: &Toc) -> Result<(), TapeBackArrError> {
        self.require_loaded()?;
        if !self.at_eom() {
            return Err(TapeBackArrError::InternalError(
                "write_toc called while not positioned at EOM".into(),
            ));
        }
        let bytes = toc
            .to_padded_bytes()
            .map_err(|err| TapeBackArrError::InternalError(err.to_string()))?;
        for chunk in bytes.chunks(self.block_size as usize) {
            self.write_block(chunk)?;
        }
        self.write_file_mark()
    }

    fn read_toc(&mut self) -> Result<Toc, TapeBackArrError> {
        self.require_loaded()?;
        if self.files.is_empty() {
            return Err(TapeBackArrError::IntegrityError {
                path: "TOC".into(),
                expected: "a final TOC file".into(),
                actual: "medium has no files".into(),
            });
        }
        let last = self.files.len() - 1;
        self.seek_to_file(last as u64)?;
        let mut all = Vec::new();
        let mut buf = vec![0u8; self.block_size.max(65536) as usize];
        loop {
            let n = self.read_block(&mut buf)?;
            if n == 0 {
                break;
            }
            all.extend_from_slice(&buf[..n]);
        }
        Toc::from_bytes(&all).map_err(|err| TapeBackArrError::IntegrityError {
            path: "TOC".into(),
            expected: "well-formed TapeBackArr TOC".into(),
            actual: err.to_string(),
        })
    }

    fn list_contents(&mut self, max_entries: usize) -> Result<Vec<String>, TapeBackArrError> {
        self.require_loaded()?;
        if self.files.len() < 2 {
            return Ok(Vec::new());
        }
        self.seek_to_file(1)?;
        let mut all = Vec::new();
        let mut buf = vec![0u8; self.block_size.max(65536) as usize];
        loop {
            let n = self.read_block(&mut buf)?;
            if n == 0 {
                break;
            }
            all.extend_from_slice(&buf[..n]);
        }
        let mut archive = tar::Archive::new(io::Cursor::new(all));
        let mut names = Vec::new();
        let entries = archive
            .entries()
            .map_err(|err| TapeBackArrError::InternalError(err.to_string()))?;
        for entry in entries {
            if names.len() >= max_entries {
                break;
            }
            let entry = entry.map_err(|err| TapeBackArrError::InternalError(err.to_string()))?;
            if let Ok(path) = entry.path() {
                names.push(path.to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    fn sample_label() -> TapeLabel {
        TapeLabel::new("TEST-001", Uuid::new_v4(), "DAILY", 1_700_000_000)
    }

    #[test]
    fn label_round_trips_through_write_and_read() {
        let mut dev = VirtualTapeDevice::new(1024 * 1024);
        let label = sample_label();
        dev.write_label(&label).unwrap();
        dev.rewind().unwrap();
        let read = dev.read_label(true).unwrap().unwrap();
        assert_eq!(read, label);
    }

    #[test]
    fn data_file_after_label_reads_back_in_order() {
        let mut dev = VirtualTapeDevice::new(1024 * 1024);
        dev.write_label(&sample_label()).unwrap();
        dev.write_block(b"hello").unwrap();
        dev.write_block(b"world").unwrap();
        dev.write_file_mark().unwrap();

        dev.seek_to_file(1).unwrap();
        let mut buf = [0u8; 32];
        let n1 = dev.read_block(&mut buf).unwrap();
        assert_eq!(&buf[..n1], b"hello");
        let n2 = dev.read_block(&mut buf).unwrap();
        assert_eq!(&buf[..n2], b"world");
        let n3 = dev.read_block(&mut buf).unwrap();
        assert_eq!(n3, 0);
    }

    #[test]
    fn write_block_past_capacity_reports_media_full() {
        let mut dev = VirtualTapeDevice::new(8);
        dev.write_label(&sample_label()).unwrap();
        let err = dev.write_block(b"too-long-for-capacity").unwrap_err();
        assert!(matches!(err, TapeBackArrError::MediaFull { .. }));
    }

    #[test]
    fn toc_round_trips_as_final_file() {
        let mut dev = VirtualTapeDevice::new(1024 * 1024);
        dev.write_label(&sample_label()).unwrap();
        dev.write_block(b"data").unwrap();
        dev.write_file_mark().unwrap();
        let toc = Toc::new(Uuid::new_v4());
        dev.write_toc(&toc).unwrap();

        let read = dev.read_toc().unwrap();
        assert_eq!(read.tape_uuid, toc.tape_uuid);
    }

    #[test]
    fn write_protected_medium_rejects_writes() {
        let mut dev = VirtualTapeDevice::new(1024 * 1024);
        dev.set_write_protected(true);
        let err = dev.write_block(b"x").unwrap_err();
        assert!(matches!(err, TapeBackArrError::WriteProtected));
    }

    #[test]
    fn ejecting_requires_load_before_further_use() {
        let mut dev = VirtualTapeDevice::new(1024 * 1024);
        dev.write_label(&sample_label()).unwrap();
        dev.eject().unwrap();
        let err = dev.status().unwrap_err();
        assert!(matches!(err, TapeBackArrError::NoTapeLoaded));
        dev.load().unwrap();
        assert!(dev.status().is_ok());
    }

    #[test]
    fn label_cache_is_invalidated_by_eject() {
        let mut dev = VirtualTapeDevice::new(1024 * 1024);
        dev.write_label(&sample_label()).unwrap();
        assert!(dev.label_cache.get().is_some());
        dev.eject().unwrap();
        assert!(dev.label_cache.get().is_none());
    }
}
