//! On-tape Table of Contents (§4.1, §6): the final data file on each tape,
//! a JSON object zero-padded to a 64 KiB boundary. Makes every tape
//! self-describing without the external catalog store.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOC_MAGIC: &str = "TAPEBACKARR_TOC";
pub const TOC_VERSION: u32 = 1;
pub const TOC_PAD_BOUNDARY: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocFileEntry {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocBackupSetEntry {
    pub backup_set_uuid: Uuid,
    pub job_name: String,
    pub encrypted: bool,
    pub compressed: bool,
    pub files: Vec<TocFileEntry>,
}

/// Self-describing per-tape index. Enumerates every backup set written to
/// the tape and, for each, the full file list written on this particular
/// tape (a spanning set's TOC entry may list only the portion captured
/// here -- the catalog store holds the union across all its tapes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toc {
    pub magic: String,
    pub version: u32,
    pub tape_uuid: Uuid,
    pub sets: Vec<TocBackupSetEntry>,
}

impl Toc {
    pub fn new(tape_uuid: Uuid) -> Self {
        Self {
            magic: TOC_MAGIC.to_string(),
            version: TOC_VERSION,
            tape_uuid,
            sets: Vec::new(),
        }
    }

    /// Serializes to JSON, zero-padded to the next 64 KiB boundary.
    pub fn to_padded_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut json = serde_json::to_vec(self)?;
        let padded_len = ((json.len() + TOC_PAD_BOUNDARY - 1) / TOC_PAD_BOUNDARY) * TOC_PAD_BOUNDARY;
        json.resize(padded_len.max(TOC_PAD_BOUNDARY), 0);
        Ok(json)
    }

    /// Parses a TOC from its padded on-tape bytes (trailing zero padding
    /// is simply ignored by the JSON parser, which stops at the closing
    /// brace).
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let toc: Toc = serde_json::from_slice(data)?;
        if toc.magic != TOC_MAGIC {
            bail!("not a TapeBackArr TOC (bad magic)");
        }
        if toc.version != TOC_VERSION {
            bail!("unsupported TOC version {}", toc.version);
        }
        Ok(toc)
    }
}
