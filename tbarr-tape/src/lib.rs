//! Tape Device Controller (§4.1): block-aligned positioning I/O over the
//! Linux `st` driver, plus the on-tape label and TOC wire formats and the
//! per-device label cache. [`TapeDevice`] is the capability surface every
//! higher layer programs against; [`LinuxTapeDevice`] and
//! [`VirtualTapeDevice`] are its two implementations.

pub mod cache;
pub mod device;
pub mod label;
pub mod linux;
pub mod mtio;
pub mod toc;
pub mod virtual_tape;
pub mod watchdog;

pub use cache::LabelCache;
pub use device::TapeDevice;
pub use label::TapeLabel;
pub use linux::LinuxTapeDevice;
pub use toc::Toc;
pub use virtual_tape::VirtualTapeDevice;
pub use watchdog::{with_watchdog, DEFAULT_WATCHDOG};
