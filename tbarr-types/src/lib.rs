//! Shared types for the TapeBackArr core: catalog entities, the closed
//! error-kind set pipelines communicate through, the configuration schema,
//! and a small POSIX-glob matcher shared by the source scanner and the
//! catalog's wildcard path search.

pub mod config;
pub mod entities;
pub mod error;
pub mod fingerprint;
pub mod glob;

pub use entities::*;
pub use error::TapeBackArrError;
pub use fingerprint::Fingerprint;

/// Unix timestamp, seconds since epoch. Kept as a plain alias (rather than
/// a newtype) since every entity in §3 stores timestamps this way and a
/// wrapper would add no safety the `Clock` trait doesn't already provide.
pub type Timestamp = i64;
