//! Linux Magnetic Tape Driver ioctl definitions
//!
//! from: /usr/include/x86_64-linux-gnu/sys/mtio.h
//!
//! also see: man 4 st

#[repr(C)]
pub struct mtop {
    pub mt_op: libc::c_short,
    pub mt_count: libc::c_int,
}

#[allow(dead_code)]
pub mod cmd {
    pub const MTRESET: libc::c_short = 0;
    pub const MTFSF: libc::c_short = 1;
    pub const MTBSF: libc::c_short = 2;
    pub const MTWEOF: libc::c_short = 5;
    pub const MTREW: libc::c_short = 6;
    pub const MTOFFL: libc::c_short = 7;
    pub const MTNOP: libc::c_short = 8;
    pub const MTRETEN: libc::c_short = 9;
    pub const MTEOM: libc::c_short = 12;
    pub const MTERASE: libc::c_short = 13;
    pub const MTSETBLK: libc::c_short = 20;
    pub const MTSEEK: libc::c_short = 22;
    pub const MTTELL: libc::c_short = 23;
    pub const MTLOAD: libc::c_short = 30;
    pub const MTUNLOAD: libc::c_short = 31;
}

// from: /usr/include/x86_64-linux-gnu/sys/mtio.h
#[derive(Default, Debug)]
#[repr(C)]
pub struct mtget {
    pub mt_type: libc::c_long,
    pub mt_resid: libc::c_long,
    pub mt_dsreg: libc::c_long,
    pub mt_gstat: libc::c_long,
    pub mt_erreg: libc::c_long,
    pub mt_fileno: i32,
    pub mt_blkno: i32,
}

#[repr(C)]
pub struct mtpos {
    pub mt_blkno: libc::c_long,
}

// #define MTIOCTOP  _IOW('m', 1, struct mtop)
nix::ioctl_write_ptr!(mtioctop, b'm', 1, mtop);
// #define MTIOCGET  _IOR('m', 2, struct mtget)
nix::ioctl_read!(mtiocget, b'm', 2, mtget);
// #define MTIOCPOS  _IOR('m', 3, struct mtpos)
nix::ioctl_read!(mtiocpos, b'm', 3, mtpos);

bitflags::bitflags! {
    /// Generic (device independent) status flags, from `mt_gstat`.
    pub struct GMTStatusFlags: libc::c_long {
        const EOF      = 0x80000000;
        const BOT      = 0x40000000;
        const EOT      = 0x20000000;
        const EOD      = 0x08000000;
        const WR_PROT  = 0x04000000;
        const ONLINE   = 0x01000000;
        const DRIVE_OPEN = 0x00040000;
    }
}
