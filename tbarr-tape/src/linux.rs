//! [`TapeDevice`] over a real Linux `st` driver device node (`/dev/nst0` and
//! friends -- always the non-rewinding variant, since every positioning
//! operation here is explicit). Every blocking call runs under
//! [`crate::watchdog::with_watchdog`]; a timed-out operation abandons its
//! thread and the caller must reopen the device before trying again.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use tbarr_types::{DriveStatus, TapeBackArrError};

use crate::cache::LabelCache;
use crate::device::TapeDevice;
use crate::label::TapeLabel;
use crate::mtio::{cmd, mtget, mtiocget, mtioctop, mtop, GMTStatusFlags};
use crate::toc::Toc;
use crate::watchdog::{with_watchdog, DEFAULT_WATCHDOG};

pub struct LinuxTapeDevice {
    file: File,
    block_size: u32,
    label_cache: LabelCache,
    watchdog: Duration,
}

impl LinuxTapeDevice {
    /// Opens `path` (expected to be a non-rewinding `st` device node) with
    /// `O_NONBLOCK` so opening does not block waiting for media, clearing
    /// the flag once the descriptor is valid.
    pub fn open(path: &str) -> Result<Self, TapeBackArrError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|err| TapeBackArrError::InternalError(format!("open {path}: {err}")))?;

        let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)
            .map_err(|err| TapeBackArrError::InternalError(format!("fcntl F_GETFL: {err}")))?;
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.remove(OFlag::O_NONBLOCK);
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags))
            .map_err(|err| TapeBackArrError::InternalError(format!("fcntl F_SETFL: {err}")))?;

        Ok(Self {
            file,
            block_size: 65536,
            label_cache: LabelCache::new(),
            watchdog: DEFAULT_WATCHDOG,
        })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn run<T, F>(&self, f: F) -> Result<T, TapeBackArrError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TapeBackArrError> + Send + 'static,
    {
        with_watchdog(self.watchdog, f)
    }

    fn mt_op(&self, mt_op: libc::c_short, mt_count: i32) -> Result<(), TapeBackArrError> {
        let fd = self.fd();
        self.run(move || {
            let op = mtop { mt_op, mt_count };
            unsafe { mtioctop(fd, &op) }
                .map_err(|err| TapeBackArrError::InternalError(format!("mtioctop({mt_op}): {err}")))?;
            Ok(())
        })
    }

    fn raw_status(fd: RawFd) -> Result<mtget, TapeBackArrError> {
        let mut status = mtget::default();
        unsafe { mtiocget(fd, &mut status) }
            .map_err(|err| TapeBackArrError::InternalError(format!("mtiocget: {err}")))?;
        Ok(status)
    }
}

impl TapeDevice for LinuxTapeDevice {
    fn status(&mut self) -> Result<DriveStatus, TapeBackArrError> {
        let fd = self.fd();
        let block_size = self.block_size;
        self.run(move || {
            let raw = Self::raw_status(fd)?;
            let gmt = GMTStatusFlags::from_bits_truncate(raw.mt_gstat);
            Ok(DriveStatus {
                online: gmt.contains(GMTStatusFlags::ONLINE) && !gmt.contains(GMTStatusFlags::DRIVE_OPEN),
                ready: !gmt.contains(GMTStatusFlags::DRIVE_OPEN),
                write_protected: gmt.contains(GMTStatusFlags::WR_PROT),
                beginning_of_tape: gmt.contains(GMTStatusFlags::BOT),
                end_of_tape: gmt.contains(GMTStatusFlags::EOT),
                end_of_file: gmt.contains(GMTStatusFlags::EOF),
                file_number: raw.mt_fileno.max(0) as u64,
                block_number: raw.mt_blkno.max(0) as u64,
                density_code: 0,
                block_size,
            })
        })
    }

    fn rewind(&mut self) -> Result<(), TapeBackArrError> {
        self.mt_op(cmd::MTREW, 1)
    }

    fn eject(&mut self) -> Result<(), TapeBackArrError> {
        let result = self.mt_op(cmd::MTOFFL, 1);
        self.label_cache.invalidate();
        result
    }

    fn load(&mut self) -> Result<(), TapeBackArrError> {
        let result = self.mt_op(cmd::MTLOAD, 1);
        self.label_cache.invalidate();
        result
    }

    fn retension(&mut self) -> Result<(), TapeBackArrError> {
        self.mt_op(cmd::MTRETEN, 1)
    }

    fn write_file_mark(&mut self) -> Result<(), TapeBackArrError> {
        self.mt_op(cmd::MTWEOF, 1)
    }

    fn seek_to_file(&mut self, file_number: u64) -> Result<(), TapeBackArrError> {
        self.mt_op(cmd::MTREW, 1)?;
        if file_number > 0 {
            self.mt_op(cmd::MTFSF, file_number as i32)?;
        }
        Ok(())
    }

    fn seek_to_block(&mut self, block_number: u64) -> Result<(), TapeBackArrError> {
        self.mt_op(cmd::MTSEEK, block_number as i32)
    }

    fn set_block_size(&mut self, size: u32) -> Result<(), TapeBackArrError> {
        self.mt_op(cmd::MTSETBLK, size as i32)?;
        self.block_size = size;
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(), TapeBackArrError> {
        let fd = self.fd();
        let buf = data.to_vec();
        self.run(move || match nix::unistd::write(fd, &buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(_) | Err(nix::errno::Errno::ENOSPC) | Err(nix::errno::Errno::EIO) => {
                let raw = Self::raw_status(fd).unwrap_or_default();
                log::warn!(
                    "write_block hit end-of-tape at file {}, block {}",
                    raw.mt_fileno, raw.mt_blkno
                );
                Err(TapeBackArrError::MediaFull {
                    file_number: raw.mt_fileno.max(0) as u64,
                    block_number: raw.mt_blkno.max(0) as u64,
                })
            }
            Err(err) => Err(TapeBackArrError::InternalError(format!("write: {err}"))),
        })
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize, TapeBackArrError> {
        let fd = self.fd();
        let len = buf.len();
        let read = self.run(move || {
            let mut local = vec![0u8; len];
            let n = nix::unistd::read(fd, &mut local)
                .map_err(|err| TapeBackArrError::InternalError(format!("read: {err}")))?;
            local.truncate(n);
            Ok(local)
        })?;
        buf[..read.len()].copy_from_slice(&read);
        Ok(read.len())
    }

    fn read_label(&mut self, bypass_cache: bool) -> Result<Option<TapeLabel>, TapeBackArrError> {
        if !bypass_cache {
            if let Some(label) = self.label_cache.get() {
                return Ok(Some(label.clone()));
            }
        }
        let restore_block_size = self.block_size;
        self.rewind()?;
        self.set_block_size(0)?;
        let mut buf = vec![0u8; crate::label::LABEL_BLOCK_SIZE];
        let n = self.read_block(&mut buf)?;
        self.set_block_size(restore_block_size)?;
        if n == 0 {
            return Ok(None);
        }
        let label = TapeLabel::from_block(&buf[..n]).map_err(|err| TapeBackArrError::IntegrityError {
            path: "label block 0".into(),
            expected: "well-formed TapeBackArr label".into(),
            actual: err.to_string(),
        })?;
        self.label_cache.set(label.clone());
        Ok(Some(label))
    }

    fn write_label(&mut self, label: &TapeLabel) -> Result<(), TapeBackArrError> {
        let restore_block_size = self.block_size;
        let block = label.to_block().map_err(|err| TapeBackArrError::InternalError(err.to_string()))?;
        self.rewind()?;
        self.set_block_size(0)?;
        self.write_block(&block)?;
        self.set_block_size(restore_block_size)?;
        self.write_file_mark()?;
        self.label_cache.invalidate();
        self.label_cache.set(label.clone());
        Ok(())
    }

    fn write_toc(&mut self, toc: &Toc) -> Result<(), TapeBackArrError> {
        let bytes = toc
            .to_padded_bytes()
            .map_err(|err| TapeBackArrError::InternalError(err.to_string()))?;
        let block_size = self.block_size.max(65536) as usize;
        for chunk in bytes.chunks(block_size) {
            self.write_block(chunk)?;
        }
        self.write_file_mark()
    }

    fn read_toc(&mut self) -> Result<Toc, TapeBackArrError> {
        let mut all = Vec::new();
        let block_size = self.block_size.max(65536) as usize;
        let mut buf = vec![0u8; block_size];
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
        self.seek_to_file(1)?;
        let mut all = Vec::new();
        let block_size = self.block_size.max(65536) as usize;
        let mut buf = vec![0u8; block_size];
        loop {
            let n = self.read_block(&mut buf)?;
            if n == 0 {
                break;
            }
            all.extend_from_slice(&buf[..n]);
        }
        let mut archive = tar::Archive::new(std::io::Cursor::new(all));
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
