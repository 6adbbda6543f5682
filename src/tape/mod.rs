//! Tape-facing orchestration that sits above `tbarr-tape`'s device
//! capability: media pool allocation, the drive reservation registry, and
//! the `Read`/`Write` adapters that let `tbarr-codec`'s archive streams
//! ride directly on top of a `TapeDevice`'s block methods.

pub mod block_io;
pub mod drives;
pub mod pool;

pub use block_io::{tape_error_from_io, TapeBlockReader, TapeBlockWriter};
pub use drives::{DriveRegistry, DriveReservation, DriveSlot};
pub use pool::MediaPool;
